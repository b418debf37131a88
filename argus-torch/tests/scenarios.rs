//! End-to-end analyses over hand-built IR programs.

use argus_interpret::{Governor, ShValue};
use argus_ir::{BinOpKind, ConstKind, Expr, FunDef, FunParams, Source, Stmt, UnaryOpKind};
use argus_sym::ExpShape;
use argus_torch::analyze;

fn src() -> Source {
    Source::Unknown
}

fn name(n: &str) -> Expr {
    Expr::Name(n.to_string(), src())
}

fn int(v: i64) -> Expr {
    Expr::Const(ConstKind::Int(v), src())
}

fn tuple(items: Vec<Expr>) -> Expr {
    Expr::Tuple(items, src())
}

fn call(callee: Expr, args: Vec<Expr>) -> Expr {
    Expr::Call {
        callee: Box::new(callee),
        args,
        kwargs: Vec::new(),
        source: src(),
    }
}

fn attr(base: Expr, field: &str) -> Expr {
    Expr::Attr {
        base: Box::new(base),
        attr: field.to_string(),
        source: src(),
    }
}

fn libcall(target: &str, args: Vec<(&str, Expr)>) -> Expr {
    Expr::LibCall {
        name: target.to_string(),
        args: args.into_iter().map(|(n, e)| (n.to_string(), e)).collect(),
        source: src(),
    }
}

fn binop(op: BinOpKind, left: Expr, right: Expr) -> Expr {
    Expr::BinOp {
        op,
        left: Box::new(left),
        right: Box::new(right),
        source: src(),
    }
}

fn neg(operand: Expr) -> Expr {
    Expr::UnaryOp {
        op: UnaryOpKind::Neg,
        operand: Box::new(operand),
        source: src(),
    }
}

fn let_(binding: &str, init: Expr) -> Stmt {
    Stmt::Let {
        name: binding.to_string(),
        init: Some(init),
        source: src(),
    }
}

fn assign(target: &str, value: Expr) -> Stmt {
    Stmt::Assign {
        target: name(target),
        value,
        source: src(),
    }
}

fn const_dims(value: &ShValue, heap: &argus_interpret::ShHeap) -> Option<Vec<i64>> {
    let ShValue::Addr(addr) = value else {
        return None;
    };
    let ShValue::Obj(obj) = heap.get_val(*addr)? else {
        return None;
    };
    let shape = obj.shape.as_ref()?;
    let ExpShape::Const { dims, .. } = &**shape else {
        return None;
    };
    dims.iter().map(|d| d.as_const_int()).collect()
}

#[test]
fn bounded_random_assertion_succeeds() {
    // x = randInt(1, 10); assert 1 <= x and x <= 10
    let cond = binop(
        BinOpKind::And,
        binop(BinOpKind::Lte, int(1), name("x")),
        binop(BinOpKind::Lte, name("x"), int(10)),
    );
    let program = Stmt::seq(vec![
        let_("x", call(name("randInt"), vec![int(1), int(10)])),
        Stmt::Expr(libcall("assert", vec![("cond", cond)])),
    ]);
    let result = analyze(&program, Governor::new()).expect("bootstrap");
    assert_eq!(result.live_count(), 1);
    assert!(result.failed().is_empty(), "failed: {:?}", result.failed());
    assert!(result.stopped().is_empty());
}

#[test]
fn matmul_of_compatible_shapes_yields_const_shape() {
    // t = zeros([3,4]); u = torch.zeros([4,5]); v = matmul(t, u); return v
    let program = Stmt::seq(vec![
        let_("t", call(name("zeros"), vec![tuple(vec![int(3), int(4)])])),
        let_(
            "u",
            call(attr(name("torch"), "zeros"), vec![tuple(vec![int(4), int(5)])]),
        ),
        let_("v", call(name("matmul"), vec![name("t"), name("u")])),
        Stmt::Return {
            value: Some(name("v")),
            source: src(),
        },
    ]);
    let result = analyze(&program, Governor::new()).expect("bootstrap");
    assert_eq!(result.live_count(), 1);
    assert!(result.failed().is_empty(), "failed: {:?}", result.failed());
    assert!(result.stopped().is_empty());
    let ctx = &result.live()[0];
    assert_eq!(
        const_dims(&ctx.ret_val, &ctx.heap),
        Some(vec![3, 5]),
        "matmul result shape should simplify to [3, 5]"
    );
}

#[test]
fn matmul_dimension_mismatch_fails_the_path() {
    // t = zeros([3,4]); u = zeros([5,6]); v = matmul(t, u)
    let program = Stmt::seq(vec![
        let_("t", call(name("zeros"), vec![tuple(vec![int(3), int(4)])])),
        let_("u", call(name("zeros"), vec![tuple(vec![int(5), int(6)])])),
        let_("v", call(name("matmul"), vec![name("t"), name("u")])),
    ]);
    let result = analyze(&program, Governor::new()).expect("bootstrap");
    assert_eq!(result.live_count(), 0);
    assert!(!result.failed().is_empty());
    let reason = result.failed()[0]
        .failed
        .as_ref()
        .expect("failure reason")
        .reason
        .clone();
    assert!(
        reason.contains("dimension mismatch"),
        "unexpected reason: {reason}"
    );
}

#[test]
fn symbolic_length_loop_is_not_unrolled() {
    // n = randIntGte(1); for i in range(n): pass
    let program = Stmt::seq(vec![
        let_("n", call(name("randIntGte"), vec![int(1)])),
        Stmt::ForIn {
            ident: "i".to_string(),
            iter: call(name("range"), vec![name("n")]),
            body: Box::new(Stmt::Pass(src())),
            source: src(),
        },
    ]);
    let result = analyze(&program, Governor::new()).expect("bootstrap");
    assert_eq!(result.live_count(), 1, "symbolic loop must keep one path");
    let ctx = &result.live()[0];
    let dump = ctx.ctr_set.dump();
    assert!(
        dump.pool.iter().any(|c| c.repr.contains("loop_idx")),
        "expected a hard bound on the loop index, got {:?}",
        dump.pool.iter().map(|c| &c.repr).collect::<Vec<_>>()
    );
    assert!(!dump.hard.is_empty());
}

#[test]
fn pure_two_way_helper_is_pruned_to_one_path() {
    // def f(x): if 0 < x: return x else: return -(-x)
    // a = genInt(); r = f(a)
    let body = Stmt::If {
        cond: binop(BinOpKind::Lt, int(0), name("x")),
        then_branch: Box::new(Stmt::Return {
            value: Some(name("x")),
            source: src(),
        }),
        else_branch: Box::new(Stmt::Return {
            value: Some(neg(neg(name("x")))),
            source: src(),
        }),
        source: src(),
    };
    let program = Stmt::seq(vec![
        Stmt::FunDef(FunDef {
            name: "f".to_string(),
            params: FunParams {
                names: vec!["x".to_string()],
                defaults: Vec::new(),
                vararg: None,
                kwvararg: None,
            },
            body: Box::new(body),
            source: src(),
        }),
        let_("a", call(name("genInt"), vec![])),
        let_("r", call(name("f"), vec![name("a")])),
    ]);
    let result = analyze(&program, Governor::new()).expect("bootstrap");
    assert_eq!(
        result.live_count(),
        1,
        "pure helper fork must merge back to one path"
    );
    assert!(result.failed().is_empty() && result.stopped().is_empty());
    // no leaked internal branch constraints
    assert_eq!(result.live()[0].ctr_set.pool_len(), 0);
}

#[test]
fn undecidable_branch_forks_exhaustively() {
    // x = genInt(); if 0 < x: y = 1 else: y = 2
    let program = Stmt::seq(vec![
        let_("x", call(name("genInt"), vec![])),
        let_("y", int(0)),
        Stmt::If {
            cond: binop(BinOpKind::Lt, int(0), name("x")),
            then_branch: Box::new(assign("y", int(1))),
            else_branch: Box::new(assign("y", int(2))),
            source: src(),
        },
    ]);
    let result = analyze(&program, Governor::new()).expect("bootstrap");
    assert_eq!(
        result.live_count() + result.failed().len() + result.stopped().len(),
        2,
        "no path may silently vanish"
    );
    assert_eq!(result.live_count(), 2);
    assert!(result.live().iter().all(|ctx| ctx.has_path_ctr()));
}

#[test]
fn builtins_land_in_the_negative_default_space() {
    let program = Stmt::Pass(src());
    let result = analyze(&program, Governor::new()).expect("bootstrap");
    assert_eq!(result.live_count(), 1);
    let ctx = &result.live()[0];
    for builtin in ["zeros", "matmul", "range", "torch"] {
        let addr = ctx
            .env
            .lookup(builtin)
            .unwrap_or_else(|| panic!("missing builtin '{builtin}'"));
        assert!(
            addr.is_default_space(),
            "'{builtin}' should live below address zero, got {addr}"
        );
    }
}

#[test]
fn governor_path_limit_stops_fork_explosion() {
    // three undecidable branches: 8 paths without a limit
    let mut stmts = vec![let_("x", call(name("genInt"), vec![]))];
    for i in 0..3 {
        let target = format!("y{i}");
        stmts.push(let_(&target, int(0)));
        stmts.push(Stmt::If {
            cond: binop(BinOpKind::Lt, int(i), name("x")),
            then_branch: Box::new(assign(&target, int(1))),
            else_branch: Box::new(assign(&target, int(2))),
            source: src(),
        });
    }
    let program = Stmt::seq(stmts);
    let governor = Governor::new();
    governor.limit_paths(4);
    let result = analyze(&program, governor).expect("bootstrap");
    assert_eq!(result.live_count(), 0);
    let all: Vec<_> = result.failed().iter().chain(result.stopped()).collect();
    assert!(!all.is_empty());
    assert!(all.iter().any(|ctx| {
        ctx.failed
            .as_ref()
            .is_some_and(|e| e.reason.contains("path count exceeded"))
    }));
}

#[test]
fn run_report_serializes_to_json() {
    let program = Stmt::seq(vec![
        let_("t", call(name("zeros"), vec![tuple(vec![int(2), int(2)])])),
        let_("u", call(name("zeros"), vec![tuple(vec![int(3), int(2)])])),
        let_("v", call(name("matmul"), vec![name("t"), name("u")])),
    ]);
    let result = analyze(&program, Governor::new()).expect("bootstrap");
    let report = argus_interpret::RunReport::from_set(&result);
    let json = serde_json::to_string_pretty(&report).expect("serialize");
    assert!(json.contains("\"hard\""));
    assert!(json.contains("dimension mismatch"));
}
