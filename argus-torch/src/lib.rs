#![forbid(unsafe_code)]

//! Builtin and tensor intrinsics for the symbolic engine, plus the
//! default-environment bootstrap and the analysis entry point.
//!
//! The bootstrap runs an IR module whose function definitions forward to
//! the `LibCall` table, harvests the resulting environment, and shifts the
//! bootstrap heap into the negative default address space so the user
//! program's heap can layer on top without collision.

pub mod builtins;
pub mod shape;

use argus_interpret::{Context, ContextSet, Flow, Governor, Interp, LibCallMap, ShEnv, ShHeap, ShValue};
use argus_ir::{ConstKind, Expr, FunDef, FunParams, Source, Stmt};
use argus_sym::IdManager;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
#[error("analysis setup failed: {message}")]
#[diagnostic(code(argus::bootstrap))]
pub struct BootstrapError {
    pub message: String,
}

pub fn default_libcalls() -> LibCallMap {
    let mut map = LibCallMap::new();
    builtins::register(&mut map);
    shape::register(&mut map);
    map
}

/// A function definition whose body forwards straight to the intrinsic of
/// the same name.
fn forward(name: &str, params: &[&str], defaults: &[(&str, ConstKind)]) -> Stmt {
    let mut names: Vec<String> = params.iter().map(|p| p.to_string()).collect();
    names.extend(defaults.iter().map(|(p, _)| p.to_string()));
    let args = names
        .iter()
        .map(|p| (p.clone(), Expr::Name(p.clone(), Source::Unknown)))
        .collect();
    Stmt::FunDef(FunDef {
        name: name.to_string(),
        params: FunParams {
            names,
            defaults: defaults
                .iter()
                .map(|(p, kind)| (p.to_string(), Expr::Const(kind.clone(), Source::Unknown)))
                .collect(),
            vararg: None,
            kwvararg: None,
        },
        body: Box::new(Stmt::Return {
            value: Some(Expr::LibCall {
                name: name.to_string(),
                args,
                source: Source::Unknown,
            }),
            source: Source::Unknown,
        }),
        source: Source::Unknown,
    })
}

fn module_attr_assign(module: &str, attr: &str, value: &str) -> Stmt {
    Stmt::Assign {
        target: Expr::Attr {
            base: Box::new(Expr::Name(module.to_string(), Source::Unknown)),
            attr: attr.to_string(),
            source: Source::Unknown,
        },
        value: Expr::Name(value.to_string(), Source::Unknown),
        source: Source::Unknown,
    }
}

/// The builtin module: forwarding definitions for every intrinsic plus a
/// `torch` module object exposing the tensor operations as attributes.
pub fn builtins_module() -> Stmt {
    let mut stmts = vec![
        forward("len", &["x"], &[]),
        forward("isinstance", &["x", "ty"], &[]),
        forward("randInt", &["lo", "hi"], &[]),
        forward("randFloat", &["lo", "hi"], &[]),
        forward("randIntGte", &["lo"], &[]),
        forward("genInt", &[], &[]),
        forward("print", &["x"], &[]),
        forward(
            "range",
            &["start"],
            &[("stop", ConstKind::None), ("step", ConstKind::None)],
        ),
        forward("zeros", &["shape"], &[]),
        forward("ones", &["shape"], &[]),
        forward("rand", &["shape"], &[]),
        forward("randn", &["shape"], &[]),
        forward("tensor", &["shape"], &[]),
        forward("matmul", &["a", "b"], &[]),
        forward("broadcast", &["a", "b"], &[]),
        forward(
            "sum",
            &["a"],
            &[("dim", ConstKind::None), ("keepdim", ConstKind::Bool(false))],
        ),
        forward("cat", &["a", "b"], &[("dim", ConstKind::Int(0))]),
        forward("reshape", &["a", "shape"], &[]),
    ];
    stmts.push(Stmt::Let {
        name: "torch".to_string(),
        init: Some(Expr::Object(Source::Unknown)),
        source: Source::Unknown,
    });
    for op in [
        "zeros", "ones", "rand", "randn", "tensor", "matmul", "broadcast", "sum", "cat",
        "reshape",
    ] {
        stmts.push(module_attr_assign("torch", op, op));
    }
    Stmt::seq(stmts)
}

/// Run the builtin module and harvest its environment, shifted into the
/// negative default address space.
pub fn bootstrap(interp: &Interp, ids: IdManager) -> Result<(ShEnv, ShHeap), BootstrapError> {
    let root = Context::root(ids, "builtins");
    let set = interp.exec(interp.unit(root), &builtins_module());
    let (live, failed, stopped) = set.into_parts();
    if live.len() != 1 {
        return Err(BootstrapError {
            message: format!(
                "builtin module produced {} live / {} failed / {} stopped contexts",
                live.len(),
                failed.len(),
                stopped.len()
            ),
        });
    }
    let ctx = live.into_iter().next().expect("checked length above");
    let offset = ctx.heap.default_offset();
    log::debug!(
        "bootstrapped {} builtin bindings into the default space",
        ctx.env.len()
    );
    Ok((ctx.env.shift_addr(offset), ctx.heap.as_default()))
}

/// Analyze a user program against the default builtin layer, yielding the
/// three disjoint context lists (success / failed / stopped).
pub fn analyze(program: &Stmt, governor: Governor) -> Result<ContextSet<ShValue>, BootstrapError> {
    let ids = IdManager::new();
    let interp = Interp::new(default_libcalls(), governor);
    let (env, heap) = bootstrap(&interp, ids.clone())?;
    let mut root = Context::root(ids, "main")
        .with_env(env.clone())
        .with_heap(heap);
    root.imported = env;
    let result = interp.exec(interp.unit(root), program);
    Ok(result.map(|ctx| {
        let value = match &ctx.ret_val {
            Flow::Value(v) => v.clone(),
            _ => ShValue::None,
        };
        ctx.with_ret(value)
    }))
}
