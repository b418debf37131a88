//! The tree-shaped interpreter: a recursive-descent switch over IR
//! statements and expressions, threading a `ContextSet` (never a bare
//! context) so that path forking is implicit in every rule.

use std::collections::HashMap;
use std::rc::Rc;

use argus_ir::{BinOpKind, ConstKind, Expr, FunDef, Source, Stmt, UnaryOpKind};
use argus_sym::simplify::{simplify_bool, simplify_num};
use argus_sym::{BoolRef, ExpBool, ExpNum, ExpString, NumBop, NumRef, NumUop, SymExp};
use log::debug;

use crate::context::{Context, ContextSet, Governor};
use crate::heap::Addr;
use crate::libcall::LibCallMap;
use crate::value::{FuncParams, ShError, ShFunc, ShObj, ShValue};

/// Statement results: the `{Run, Break, Continue}` markers live in the same
/// domain as returned values, so sequencing is plain data flow.
#[derive(Clone, Debug, PartialEq)]
pub enum Flow {
    Run,
    Break,
    Continue,
    Value(ShValue),
}

impl Flow {
    pub fn is_run(&self) -> bool {
        matches!(self, Flow::Run)
    }
}

/// Truthiness of a value under the current constraint caches.
enum Truthy {
    Decided(bool),
    Symbolic(BoolRef),
    Broken(ShValue),
}

pub struct Interp {
    libcalls: LibCallMap,
    governor: Governor,
}

impl Interp {
    pub fn new(libcalls: LibCallMap, governor: Governor) -> Self {
        Interp { libcalls, governor }
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    pub fn unit<T>(&self, ctx: Context<T>) -> ContextSet<T> {
        ContextSet::unit(ctx, self.governor.clone())
    }

    fn empty<T>(&self) -> ContextSet<T> {
        ContextSet::empty(self.governor.clone())
    }

    // ================= statements =================

    pub fn exec(&self, set: ContextSet<()>, stmt: &Stmt) -> ContextSet<Flow> {
        match stmt {
            Stmt::Pass(_) => set.map(|ctx| ctx.with_ret(Flow::Run)),
            Stmt::Break(_) => set.map(|ctx| ctx.with_ret(Flow::Break)),
            Stmt::Continue(_) => set.map(|ctx| ctx.with_ret(Flow::Continue)),
            Stmt::Expr(expr) => self.eval(set, expr).map(|ctx| ctx.with_ret(Flow::Run)),
            Stmt::Seq(left, right) => {
                let after_left = self.exec(set, left);
                let (live, failed, stopped) = after_left.into_parts();
                let mut run_ctxs = Vec::new();
                let mut skipping = Vec::new();
                for ctx in live {
                    if ctx.ret_val.is_run() {
                        run_ctxs.push(ctx.with_ret(()));
                    } else {
                        skipping.push(ctx);
                    }
                }
                let run_set =
                    ContextSet::assemble(run_ctxs, failed, stopped, self.governor.clone());
                let after_right = self.exec(run_set, right);
                after_right.join(ContextSet::assemble(
                    skipping,
                    Vec::new(),
                    Vec::new(),
                    self.governor.clone(),
                ))
            }
            Stmt::Return { value, .. } => match value {
                Some(expr) => self.eval(set, expr).map(|ctx| {
                    let v = ctx.ret_val.clone();
                    ctx.with_ret(Flow::Value(v))
                }),
                None => set.map(|ctx| ctx.with_ret(Flow::Value(ShValue::None))),
            },
            Stmt::Let { name, init, .. } => {
                let evaluated = match init {
                    Some(expr) => self.eval(set, expr),
                    None => set.map(|ctx| ctx.with_ret(ShValue::Undef)),
                };
                evaluated.map(|ctx| {
                    let value = ctx.ret_val.clone();
                    let (ctx, addr) = ctx.alloc_new(value);
                    ctx.bind(name.clone(), addr).with_ret(Flow::Run)
                })
            }
            Stmt::Assign {
                target,
                value,
                source,
            } => {
                let evaluated = self.eval(set, value);
                self.assign(evaluated, target, *source)
            }
            Stmt::FunDef(def) => self.exec_fundef(set, def),
            Stmt::If {
                cond,
                then_branch,
                else_branch,
                source,
            } => self.exec_if(set, cond, then_branch, else_branch, *source),
            Stmt::ForIn {
                ident,
                iter,
                body,
                source,
            } => self.exec_for(set, ident, iter, body, *source),
        }
    }

    fn exec_fundef(&self, set: ContextSet<()>, def: &FunDef) -> ContextSet<Flow> {
        // defaults evaluate at definition time
        let defaults_set = def.params.defaults.iter().fold(
            set.map(|ctx| ctx.with_ret(Vec::<(Rc<str>, ShValue)>::new())),
            |acc, (name, expr)| {
                let name: Rc<str> = name.as_str().into();
                acc.flat_map(|ctx| {
                    let done = ctx.ret_val.clone();
                    self.eval(self.unit(ctx.with_ret(())), expr).map(|ctx| {
                        let mut done = done.clone();
                        done.push((name.clone(), ctx.ret_val.clone()));
                        ctx.with_ret(done)
                    })
                })
            },
        );
        let body = Rc::new((*def.body).clone());
        let has_closure = stmt_has_fundef(&def.body);
        let name: Rc<str> = def.name.as_str().into();
        let params = &def.params;
        let names: Vec<Rc<str>> = params.names.iter().map(|n| n.as_str().into()).collect();
        let vararg: Option<Rc<str>> = params.vararg.as_deref().map(Into::into);
        let kwvararg: Option<Rc<str>> = params.kwvararg.as_deref().map(Into::into);
        let source = def.source;
        defaults_set.map(move |ctx| {
            let func = ShFunc {
                name: name.clone(),
                params: FuncParams {
                    names: names.clone(),
                    defaults: ctx.ret_val.clone(),
                    vararg: vararg.clone(),
                    kwvararg: kwvararg.clone(),
                },
                body: body.clone(),
                env: ctx.env.clone(),
                has_closure,
                bound_self: None,
                source,
            };
            let (ctx, addr) = ctx.alloc_new(ShValue::Func(Rc::new(func)));
            ctx.bind(name.clone(), addr).with_ret(Flow::Run)
        })
    }

    fn exec_if(
        &self,
        set: ContextSet<()>,
        cond: &Expr,
        then_branch: &Stmt,
        else_branch: &Stmt,
        source: Source,
    ) -> ContextSet<Flow> {
        // both branches provably side-effect-free: skip evaluation entirely
        if stmt_is_trivial(then_branch) && stmt_is_trivial(else_branch) {
            return set.map(|ctx| ctx.with_ret(Flow::Run));
        }
        let cond_set = self.eval(set, cond);
        cond_set.flat_map(|ctx| {
            let value = ctx.ret_val.clone();
            let ctx = ctx.with_ret(());
            match self.truthy(&ctx, &value, source) {
                Truthy::Decided(true) => self.exec(self.unit(ctx), then_branch),
                Truthy::Decided(false) => self.exec(self.unit(ctx), else_branch),
                Truthy::Symbolic(cond_exp) => {
                    let (then_set, else_set) =
                        self.unit(ctx).fork(|_| cond_exp.clone(), source);
                    let then_run = self.exec(then_set, then_branch);
                    let else_run = self.exec(else_set, else_branch);
                    then_run.join(else_run)
                }
                Truthy::Broken(err) => {
                    let ctx = ctx.warn(
                        format!("branch condition is not a boolean: {err}"),
                        source,
                    );
                    self.unit(ctx.with_ret(Flow::Run))
                }
            }
        })
    }

    fn exec_for(
        &self,
        set: ContextSet<()>,
        ident: &str,
        iter: &Expr,
        body: &Stmt,
        source: Source,
    ) -> ContextSet<Flow> {
        let iter_set = self.eval(set, iter);
        let ident: Rc<str> = ident.into();
        iter_set.flat_map(|ctx| {
            let iterable = ctx.ret_val.clone();
            let ctx = ctx.with_ret(());
            if iterable.is_error() {
                return self.unit(ctx.with_ret(Flow::Run));
            }
            let (ctx, length) = self.resolve_length(ctx, &iterable, source);
            match simplify_num(&length).as_const_int() {
                Some(n) if n >= 0 => {
                    self.unroll_loop(ctx, &ident, &iterable, body, n, source)
                }
                _ => self.symbolic_loop(ctx, &ident, &iterable, body, &length, source),
            }
        })
    }

    /// Concrete unrolling: run the body once per index, peeling Break and
    /// Return paths out of the iteration and re-joining them at the end.
    fn unroll_loop(
        &self,
        ctx: Context<()>,
        ident: &Rc<str>,
        iterable: &ShValue,
        body: &Stmt,
        count: i64,
        source: Source,
    ) -> ContextSet<Flow> {
        let mut exited: ContextSet<Flow> = self.empty();
        let mut current: ContextSet<()> = self.unit(ctx);
        for index in 0..count {
            if current.is_empty_live() {
                break;
            }
            let bound = current.map(|ctx| {
                let (ctx, element) = self.loop_element(ctx, iterable, index, source);
                let (ctx, addr) = ctx.alloc_new(element);
                ctx.bind(ident.clone(), addr).with_ret(())
            });
            let after = self.exec(bound, body);
            let (live, failed, stopped) = after.into_parts();
            let mut continuing = Vec::new();
            let mut leaving = Vec::new();
            for ctx in live {
                match &ctx.ret_val {
                    Flow::Run | Flow::Continue => continuing.push(ctx.with_ret(())),
                    Flow::Break => leaving.push(ctx.with_ret(Flow::Run)),
                    Flow::Value(_) => leaving.push(ctx),
                }
            }
            current =
                ContextSet::assemble(continuing, failed, stopped, self.governor.clone());
            exited = exited.join(ContextSet::assemble(
                leaving,
                Vec::new(),
                Vec::new(),
                self.governor.clone(),
            ));
        }
        exited.join(current.map(|ctx| ctx.with_ret(Flow::Run)))
    }

    /// Symbolic-length loops run the body exactly once against a fresh index
    /// symbol bounded `[0, n-1]`; break/continue degrade to normal exit.
    fn symbolic_loop(
        &self,
        ctx: Context<()>,
        ident: &Rc<str>,
        iterable: &ShValue,
        body: &Stmt,
        length: &NumRef,
        source: Source,
    ) -> ContextSet<Flow> {
        let zero = ExpNum::constant(0.0, source);
        let lower = ctx
            .ctr_set
            .gen_lte(zero.clone(), length.clone(), None, source);
        let ctx = ctx.guarantee(lower);
        let (ctr_set, index) = ctx.ctr_set.gen_sym_int_gte("loop_idx", &zero, source);
        let ctx = ctx.with_ctr_set(ctr_set);
        let last = ExpNum::sub(length.clone(), ExpNum::constant(1.0, source), source);
        let upper = ctx.ctr_set.gen_lte(index.clone(), last, None, source);
        let ctx = ctx.guarantee(upper);

        let (ctx, element) = self.symbolic_element(ctx, iterable, &index, source);
        let (ctx, addr) = ctx.alloc_new(element);
        let bound = ctx.bind(ident.clone(), addr);
        let after = self.exec(self.unit(bound.with_ret(())), body);
        // the real iteration structure is unknown: markers become normal
        // termination, returns still propagate
        after.map(|ctx| match &ctx.ret_val {
            Flow::Value(_) => ctx,
            _ => ctx.with_ret(Flow::Run),
        })
    }

    fn loop_element(
        &self,
        ctx: Context<()>,
        iterable: &ShValue,
        index: i64,
        source: Source,
    ) -> (Context<()>, ShValue) {
        if let Some(obj) = self.load_obj(&ctx, iterable) {
            if let Some(start) = obj.get_attr("$start").and_then(|v| v.as_num()).cloned() {
                // range-like object: element = start + i * step
                let step = obj
                    .get_attr("$step")
                    .and_then(|v| v.as_num())
                    .cloned()
                    .unwrap_or_else(|| ExpNum::constant(1.0, source));
                let offset =
                    ExpNum::mul(ExpNum::constant(index as f64, source), step, source);
                return (ctx, ShValue::Int(ExpNum::add(start, offset, source)));
            }
            if let Some(v) = obj.get_index(index) {
                return (ctx, v.clone());
            }
        }
        let ctx = ctx.warn(
            format!("iteration element {index} is not statically known"),
            source,
        );
        let sym = ctx.ctr_set.gen_sym_int("loop_elem", source);
        (ctx, ShValue::Int(sym))
    }

    fn symbolic_element(
        &self,
        ctx: Context<()>,
        iterable: &ShValue,
        index: &NumRef,
        source: Source,
    ) -> (Context<()>, ShValue) {
        if let Some(obj) = self.load_obj(&ctx, iterable) {
            if let Some(start) = obj.get_attr("$start").and_then(|v| v.as_num()).cloned() {
                let step = obj
                    .get_attr("$step")
                    .and_then(|v| v.as_num())
                    .cloned()
                    .unwrap_or_else(|| ExpNum::constant(1.0, source));
                let offset = ExpNum::mul(index.clone(), step, source);
                return (ctx, ShValue::Int(ExpNum::add(start, offset, source)));
            }
        }
        let ctx = ctx.warn("symbolic iteration over an opaque iterable", source);
        let sym = ctx.ctr_set.gen_sym_int("loop_elem", source);
        (ctx, ShValue::Int(sym))
    }

    /// Loop length: `$length` attribute, else `__len__`, else a fresh
    /// symbolic length with a warning.
    fn resolve_length(
        &self,
        ctx: Context<()>,
        iterable: &ShValue,
        source: Source,
    ) -> (Context<()>, NumRef) {
        if let Some(obj) = self.load_obj(&ctx, iterable) {
            if let Some(len) = obj.get_attr("$length").and_then(|v| v.as_num()) {
                return (ctx, len.clone());
            }
            if let Some(ShValue::Func(len_fn)) = self.find_method(&ctx, &obj, "__len__") {
                let results = self.call_func(ctx.clone(), len_fn, Vec::new(), Vec::new(), source);
                // __len__ must not fork for the length to be usable here
                let (live, _, _) = results.into_parts();
                if live.len() == 1 {
                    let only = live.into_iter().next().expect("one context");
                    if let Some(n) = only.ret_val.as_num().cloned() {
                        return (only.with_ret(()), n);
                    }
                }
            }
            let seq = obj.seq_len();
            if seq > 0 {
                return (ctx, ExpNum::constant(seq as f64, source));
            }
        }
        let ctx = ctx.warn("iterable length is unknown; assuming a symbolic length", source);
        let zero = ExpNum::constant(0.0, source);
        let (ctr_set, len) = ctx.ctr_set.gen_sym_int_gte("loop_cnt", &zero, source);
        (ctx.with_ctr_set(ctr_set), len)
    }

    fn assign(
        &self,
        values: ContextSet<ShValue>,
        target: &Expr,
        source: Source,
    ) -> ContextSet<Flow> {
        match target {
            Expr::Name(name, _) => {
                let name: Rc<str> = name.as_str().into();
                values.map(move |ctx| {
                    let value = ctx.ret_val.clone();
                    match ctx.env.lookup(&name) {
                        Some(addr) => ctx.set_val(addr, value).with_ret(Flow::Run),
                        None => {
                            let (ctx, addr) = ctx.alloc_new(value);
                            ctx.bind(name.clone(), addr).with_ret(Flow::Run)
                        }
                    }
                })
            }
            Expr::Attr { base, attr, .. } => {
                let attr: Rc<str> = attr.as_str().into();
                values.flat_map(|ctx| {
                    let value = ctx.ret_val.clone();
                    let base_set = self.eval(self.unit(ctx.with_ret(())), base);
                    base_set.map(|ctx| {
                        let base_val = ctx.ret_val.clone();
                        match self.load_obj(&ctx, &base_val) {
                            Some(obj) => {
                                let updated = obj.set_attr(attr.clone(), value.clone());
                                let addr = updated.addr;
                                ctx.set_val(addr, ShValue::Obj(updated))
                                    .with_ret(Flow::Run)
                            }
                            None => ctx
                                .fail(
                                    format!(
                                        "cannot set attribute of {}",
                                        base_val.kind_name()
                                    ),
                                    source,
                                )
                                .with_ret(Flow::Run),
                        }
                    })
                })
            }
            Expr::Subscr { base, index, .. } => values.flat_map(|ctx| {
                let value = ctx.ret_val.clone();
                let base_set = self.eval(self.unit(ctx.with_ret(())), base);
                let pair_set = base_set.flat_map(|ctx| {
                    let base_val = ctx.ret_val.clone();
                    self.eval(self.unit(ctx.with_ret(())), index)
                        .map(move |ctx| {
                            let idx = ctx.ret_val.clone();
                            ctx.with_ret((base_val.clone(), idx))
                        })
                });
                pair_set.map(|ctx| {
                    let (base_val, idx) = ctx.ret_val.clone();
                    let Some(obj) = self.load_obj(&ctx, &base_val) else {
                        return ctx
                            .fail(
                                format!("cannot index into {}", base_val.kind_name()),
                                source,
                            )
                            .with_ret(Flow::Run);
                    };
                    match &idx {
                        ShValue::Int(n) => match simplify_num(n).as_const_int() {
                            Some(i) => {
                                let updated = obj.set_index(i, value.clone());
                                let addr = updated.addr;
                                ctx.set_val(addr, ShValue::Obj(updated)).with_ret(Flow::Run)
                            }
                            None => ctx
                                .warn("subscript store with a symbolic index", source)
                                .with_ret(Flow::Run),
                        },
                        ShValue::Str(s) => match s.as_const() {
                            Some(key) => {
                                let updated = obj.set_key_val(key.clone(), value.clone());
                                let addr = updated.addr;
                                ctx.set_val(addr, ShValue::Obj(updated)).with_ret(Flow::Run)
                            }
                            None => ctx
                                .warn("subscript store with a symbolic key", source)
                                .with_ret(Flow::Run),
                        },
                        other => ctx
                            .warn(
                                format!("unsupported subscript key: {}", other.kind_name()),
                                source,
                            )
                            .with_ret(Flow::Run),
                    }
                })
            }),
            Expr::Tuple(targets, _) => values.flat_map(|ctx| {
                let value = ctx.ret_val.clone();
                let mut out = self.unit(ctx.with_ret(Flow::Run));
                for (i, sub) in targets.iter().enumerate() {
                    out = out.flat_map(|ctx| {
                        let element = self
                            .load_obj(&ctx, &value)
                            .and_then(|obj| obj.get_index(i as i64).cloned())
                            .unwrap_or(ShValue::Undef);
                        self.assign(self.unit(ctx.with_ret(element)), sub, source)
                    });
                }
                out
            }),
            other => values.map(|ctx| {
                ctx.warn(
                    format!("unsupported assignment target: {other:?}"),
                    source,
                )
                .with_ret(Flow::Run)
            }),
        }
    }

    // ================= expressions =================

    pub fn eval(&self, set: ContextSet<()>, expr: &Expr) -> ContextSet<ShValue> {
        match expr {
            Expr::Const(kind, source) => {
                let source = *source;
                set.map(move |ctx| {
                    let value = match kind {
                        ConstKind::Int(v) => ShValue::int_const(*v, source),
                        ConstKind::Float(v) => ShValue::float_const(*v, source),
                        ConstKind::Bool(v) => ShValue::bool_const(*v, source),
                        ConstKind::Str(v) => ShValue::str_const(v.as_str(), source),
                        ConstKind::None => ShValue::None,
                    };
                    ctx.with_ret(value)
                })
            }
            Expr::Object(_) => set.map(|ctx| {
                let (ctx, obj) = ctx.alloc_obj();
                let addr = obj.addr;
                ctx.with_ret(ShValue::Addr(addr))
            }),
            Expr::Tuple(items, source) => {
                let source = *source;
                let items_set = self.eval_list(set, items);
                items_set.map(move |ctx| {
                    let values = ctx.ret_val.clone();
                    let (ctx, value) = self.alloc_tuple(ctx.with_ret(()), values, source);
                    ctx.with_ret(value)
                })
            }
            Expr::Name(name, source) => {
                let source = *source;
                let name = name.clone();
                set.map(move |ctx| match ctx.env.lookup(&name) {
                    Some(addr) => match ctx.heap.get_val(addr) {
                        Some(value) => {
                            let value = value.clone();
                            ctx.with_ret(value)
                        }
                        None => {
                            let ctx = ctx.warn(format!("dangling address for '{name}'"), source);
                            ctx.with_ret(ShValue::Undef)
                        }
                    },
                    None => {
                        let ctx = ctx.warn(format!("undefined name '{name}'"), source);
                        ctx.with_ret(ShValue::Error(ShError::warning(
                            format!("undefined name '{name}'"),
                            source,
                        )))
                    }
                })
            }
            Expr::Attr { base, attr, source } => {
                let base_set = self.eval(set, base);
                let source = *source;
                base_set.flat_map(|ctx| {
                    let base_val = ctx.ret_val.clone();
                    self.get_attr_deep(ctx.with_ret(()), &base_val, attr, source)
                })
            }
            Expr::Subscr {
                base,
                index,
                source,
            } => {
                let source = *source;
                let base_set = self.eval(set, base);
                let pair_set = base_set.flat_map(|ctx| {
                    let base_val = ctx.ret_val.clone();
                    self.eval(self.unit(ctx.with_ret(())), index)
                        .map(move |ctx| {
                            let idx = ctx.ret_val.clone();
                            ctx.with_ret((base_val.clone(), idx))
                        })
                });
                pair_set.flat_map(|ctx| {
                    let (base_val, idx) = ctx.ret_val.clone();
                    self.subscript(ctx.with_ret(()), &base_val, &idx, source)
                })
            }
            Expr::UnaryOp {
                op,
                operand,
                source,
            } => {
                let source = *source;
                let op = *op;
                let operand_set = self.eval(set, operand);
                operand_set.map(move |ctx| {
                    let value = ctx.ret_val.clone();
                    self.unary(ctx.with_ret(()), op, value, source)
                })
            }
            Expr::BinOp {
                op,
                left,
                right,
                source,
            } => self.eval_binop(set, *op, left, right, *source),
            Expr::Call {
                callee,
                args,
                kwargs,
                source,
            } => {
                let source = *source;
                let callee_set = self.eval(set, callee);
                callee_set.flat_map(|ctx| {
                    let callee_val = ctx.ret_val.clone();
                    if callee_val.is_error() {
                        return self.unit(ctx);
                    }
                    let args_set = self.eval_list(self.unit(ctx.with_ret(())), args);
                    let full_set = kwargs.iter().fold(
                        args_set.map(|ctx| {
                            let pos = ctx.ret_val.clone();
                            ctx.with_ret((pos, Vec::<(Rc<str>, ShValue)>::new()))
                        }),
                        |acc, (name, expr)| {
                            let name: Rc<str> = name.as_str().into();
                            acc.flat_map(|ctx| {
                                let (pos, kws) = ctx.ret_val.clone();
                                let kws_name = name.clone();
                                self.eval(self.unit(ctx.with_ret(())), expr).map(move |ctx| {
                                    let mut kws = kws.clone();
                                    kws.push((kws_name.clone(), ctx.ret_val.clone()));
                                    ctx.with_ret((pos.clone(), kws))
                                })
                            })
                        },
                    );
                    full_set.flat_map(|ctx| {
                        let (pos, kws) = ctx.ret_val.clone();
                        self.call_value(ctx.with_ret(()), &callee_val, pos, kws, source)
                    })
                })
            }
            Expr::LibCall { name, args, source } => {
                let source = *source;
                let named_set = args.iter().fold(
                    set.map(|ctx| ctx.with_ret(Vec::<(Rc<str>, ShValue)>::new())),
                    |acc, (name, expr)| {
                        let name: Rc<str> = name.as_str().into();
                        acc.flat_map(|ctx| {
                            let done = ctx.ret_val.clone();
                            let name = name.clone();
                            self.eval(self.unit(ctx.with_ret(())), expr).map(move |ctx| {
                                let mut done = done.clone();
                                done.push((name.clone(), ctx.ret_val.clone()));
                                ctx.with_ret(done)
                            })
                        })
                    },
                );
                named_set.flat_map(|ctx| {
                    let args = ctx.ret_val.clone();
                    let ctx = ctx.with_ret(());
                    match self.libcalls.get(name).cloned() {
                        Some(f) => (*f)(self, ctx, args, source),
                        None => {
                            debug!("unknown libcall '{name}'");
                            let (ctx, value) = ctx.warn_tensor(
                                format!("unknown library intrinsic '{name}'"),
                                source,
                            );
                            self.unit(ctx.with_ret(value))
                        }
                    }
                })
            }
        }
    }

    fn eval_list(&self, set: ContextSet<()>, exprs: &[Expr]) -> ContextSet<Vec<ShValue>> {
        exprs.iter().fold(
            set.map(|ctx| ctx.with_ret(Vec::new())),
            |acc, expr| {
                acc.flat_map(|ctx| {
                    let done = ctx.ret_val.clone();
                    self.eval(self.unit(ctx.with_ret(())), expr).map(move |ctx| {
                        let mut done = done.clone();
                        done.push(ctx.ret_val.clone());
                        ctx.with_ret(done)
                    })
                })
            },
        )
    }

    fn eval_binop(
        &self,
        set: ContextSet<()>,
        op: BinOpKind,
        left: &Expr,
        right: &Expr,
        source: Source,
    ) -> ContextSet<ShValue> {
        if matches!(op, BinOpKind::And | BinOpKind::Or) {
            let left_set = self.eval(set, left);
            return left_set.flat_map(|ctx| {
                let lv = ctx.ret_val.clone();
                if lv.is_error() {
                    return self.unit(ctx);
                }
                let ctx = ctx.with_ret(());
                match self.truthy(&ctx, &lv, source) {
                    Truthy::Decided(b) => {
                        let take_right = (op == BinOpKind::And) == b;
                        if take_right {
                            self.eval(self.unit(ctx), right)
                        } else {
                            self.unit(ctx.with_ret(lv))
                        }
                    }
                    Truthy::Symbolic(cond) => {
                        let (true_set, false_set) =
                            self.unit(ctx).fork(|_| cond.clone(), source);
                        let (right_side, keep_side) = if op == BinOpKind::And {
                            (true_set, false_set)
                        } else {
                            (false_set, true_set)
                        };
                        let evaluated = self.eval(right_side, right);
                        let kept = keep_side.map(|ctx| ctx.with_ret(lv.clone()));
                        evaluated.join(kept)
                    }
                    Truthy::Broken(err) => {
                        let ctx = ctx.warn(
                            format!("short-circuit operand is not a boolean: {err}"),
                            source,
                        );
                        self.unit(ctx.with_ret(lv))
                    }
                }
            });
        }
        let left_set = self.eval(set, left);
        let pair_set = left_set.flat_map(|ctx| {
            let lv = ctx.ret_val.clone();
            self.eval(self.unit(ctx.with_ret(())), right).map(move |ctx| {
                let rv = ctx.ret_val.clone();
                ctx.with_ret((lv.clone(), rv))
            })
        });
        pair_set.flat_map(|ctx| {
            let (lv, rv) = ctx.ret_val.clone();
            self.binop(ctx.with_ret(()), op, lv, rv, source)
        })
    }

    // ================= operator semantics =================

    fn binop(
        &self,
        ctx: Context<()>,
        op: BinOpKind,
        left: ShValue,
        right: ShValue,
        source: Source,
    ) -> ContextSet<ShValue> {
        // a single root-cause failure wins over cascading messages
        if left.is_error() {
            return self.unit(ctx.with_ret(left));
        }
        if right.is_error() {
            return self.unit(ctx.with_ret(right));
        }
        match op {
            BinOpKind::Is | BinOpKind::IsNot => {
                let (ctx, value) = self.identity(ctx, &left, &right, op == BinOpKind::IsNot, source);
                return self.unit(ctx.with_ret(value));
            }
            BinOpKind::In | BinOpKind::NotIn => {
                return self.membership(ctx, &left, &right, op == BinOpKind::NotIn, source);
            }
            _ => {}
        }

        let dl = self.deref(&ctx, &left);
        let dr = self.deref(&ctx, &right);

        // object operands dispatch through the dunder protocol
        if matches!(dl, ShValue::Obj(_)) || matches!(dr, ShValue::Obj(_)) {
            return self.dunder_binop(ctx, op, &left, &right, source);
        }

        match op {
            BinOpKind::Add
                if matches!(dl, ShValue::Str(_)) || matches!(dr, ShValue::Str(_)) =>
            {
                self.string_add(ctx, &dl, &dr, source)
            }
            BinOpKind::Mul if matches!(dl, ShValue::Str(_)) => {
                self.string_repeat(ctx, &dl, &dr, source)
            }
            BinOpKind::Add
            | BinOpKind::Sub
            | BinOpKind::Mul
            | BinOpKind::TrueDiv
            | BinOpKind::FloorDiv
            | BinOpKind::Mod => self.num_binop(ctx, op, &dl, &dr, source),
            BinOpKind::Pow => self.pow(ctx, &dl, &dr, source),
            BinOpKind::Lt | BinOpKind::Lte => self.num_compare(ctx, op, &dl, &dr, source),
            BinOpKind::Eq | BinOpKind::Neq => {
                let (ctx, value) = self.equality(ctx, &dl, &dr, op == BinOpKind::Neq, source);
                self.unit(ctx.with_ret(value))
            }
            BinOpKind::And | BinOpKind::Or | BinOpKind::Is | BinOpKind::IsNot
            | BinOpKind::In | BinOpKind::NotIn => unreachable!("handled above"),
        }
    }

    fn num_binop(
        &self,
        ctx: Context<()>,
        op: BinOpKind,
        left: &ShValue,
        right: &ShValue,
        source: Source,
    ) -> ContextSet<ShValue> {
        let (ctx, l, l_float) = match self.numeric_operand(ctx, left, source) {
            Ok(t) => t,
            Err((ctx, value)) => return self.unit(ctx.with_ret(value)),
        };
        let (ctx, r, r_float) = match self.numeric_operand(ctx, right, source) {
            Ok(t) => t,
            Err((ctx, value)) => return self.unit(ctx.with_ret(value)),
        };
        let bop = match op {
            BinOpKind::Add => NumBop::Add,
            BinOpKind::Sub => NumBop::Sub,
            BinOpKind::Mul => NumBop::Mul,
            BinOpKind::TrueDiv => NumBop::TrueDiv,
            BinOpKind::FloorDiv => NumBop::FloorDiv,
            BinOpKind::Mod => NumBop::Mod,
            _ => unreachable!("numeric op"),
        };
        let result = ExpNum::bop(bop, l, r, source);
        let is_float = match op {
            BinOpKind::TrueDiv => true,
            BinOpKind::FloorDiv => false,
            _ => l_float || r_float,
        };
        let value = if is_float {
            ShValue::Float(result)
        } else {
            ShValue::Int(result)
        };
        self.unit(ctx.with_ret(value))
    }

    fn num_compare(
        &self,
        ctx: Context<()>,
        op: BinOpKind,
        left: &ShValue,
        right: &ShValue,
        source: Source,
    ) -> ContextSet<ShValue> {
        let (ctx, l, _) = match self.numeric_operand(ctx, left, source) {
            Ok(t) => t,
            Err((ctx, value)) => return self.unit(ctx.with_ret(value)),
        };
        let (ctx, r, _) = match self.numeric_operand(ctx, right, source) {
            Ok(t) => t,
            Err((ctx, value)) => return self.unit(ctx.with_ret(value)),
        };
        let exp = match op {
            BinOpKind::Lt => ExpBool::less_than(l, r, source),
            BinOpKind::Lte => ExpBool::less_than_or_equal(l, r, source),
            _ => unreachable!("comparison op"),
        };
        self.unit(ctx.with_ret(ShValue::Bool(exp)))
    }

    fn pow(
        &self,
        ctx: Context<()>,
        left: &ShValue,
        right: &ShValue,
        source: Source,
    ) -> ContextSet<ShValue> {
        let (ctx, base, base_float) = match self.numeric_operand(ctx, left, source) {
            Ok(t) => t,
            Err((ctx, value)) => return self.unit(ctx.with_ret(value)),
        };
        let (ctx, exp, _) = match self.numeric_operand(ctx, right, source) {
            Ok(t) => t,
            Err((ctx, value)) => return self.unit(ctx.with_ret(value)),
        };
        match simplify_num(&exp).as_const_int() {
            Some(k) if k >= 0 => {
                let mut acc = ExpNum::constant(1.0, source);
                for _ in 0..k {
                    acc = ExpNum::mul(acc, base.clone(), source);
                }
                let acc = simplify_num(&acc);
                let value = if base_float {
                    ShValue::Float(acc)
                } else {
                    ShValue::Int(acc)
                };
                self.unit(ctx.with_ret(value))
            }
            _ => {
                // symbolic exponentiation is not modeled exactly
                let ctx = ctx.warn("exponent is not a constant non-negative integer", source);
                let sym = ctx.ctr_set.gen_sym_float("pow", source);
                self.unit(ctx.with_ret(ShValue::Float(sym)))
            }
        }
    }

    fn string_add(
        &self,
        ctx: Context<()>,
        left: &ShValue,
        right: &ShValue,
        source: Source,
    ) -> ContextSet<ShValue> {
        match (left, right) {
            (ShValue::Str(l), ShValue::Str(r)) => {
                let value = ShValue::Str(ExpString::concat(l.clone(), r.clone(), source));
                self.unit(ctx.with_ret(value))
            }
            _ => {
                let ctx = ctx.warn(
                    format!(
                        "cannot concatenate {} and {}",
                        left.kind_name(),
                        right.kind_name()
                    ),
                    source,
                );
                let sym = ctx.ctr_set.gen_sym_string("concat", source);
                self.unit(ctx.with_ret(ShValue::Str(sym)))
            }
        }
    }

    fn string_repeat(
        &self,
        ctx: Context<()>,
        left: &ShValue,
        right: &ShValue,
        source: Source,
    ) -> ContextSet<ShValue> {
        if let (ShValue::Str(s), Some(n)) = (
            left,
            right.as_num().map(simplify_num).and_then(|n| n.as_const_int()),
        ) {
            if (0..=64).contains(&n) {
                let mut acc = ExpString::constant("", source);
                for _ in 0..n {
                    acc = ExpString::concat(acc, s.clone(), source);
                }
                return self.unit(ctx.with_ret(ShValue::Str(acc)));
            }
        }
        let ctx = ctx.warn("string repetition count is not a small constant", source);
        let sym = ctx.ctr_set.gen_sym_string("repeat", source);
        self.unit(ctx.with_ret(ShValue::Str(sym)))
    }

    /// `==`/`!=` over non-object operands.
    fn equality(
        &self,
        ctx: Context<()>,
        left: &ShValue,
        right: &ShValue,
        negated: bool,
        source: Source,
    ) -> (Context<()>, ShValue) {
        let exp = match (left, right) {
            (ShValue::Int(l) | ShValue::Float(l), ShValue::Int(r) | ShValue::Float(r)) => {
                ExpBool::equal(SymExp::Num(l.clone()), SymExp::Num(r.clone()), source)
            }
            (ShValue::Str(l), ShValue::Str(r)) => {
                ExpBool::equal(SymExp::Str(l.clone()), SymExp::Str(r.clone()), source)
            }
            (ShValue::Bool(l), ShValue::Bool(r)) => {
                ExpBool::equal(SymExp::Bool(l.clone()), SymExp::Bool(r.clone()), source)
            }
            (ShValue::None, ShValue::None) => ExpBool::constant(true, source),
            _ => ExpBool::constant(false, source),
        };
        let exp = if negated {
            ExpBool::not(exp, source)
        } else {
            exp
        };
        (ctx, ShValue::Bool(simplify_bool(&exp)))
    }

    /// `is` / `is not`: address comparison when both sides are addresses,
    /// otherwise None-vs-non-None reasoning.
    fn identity(
        &self,
        ctx: Context<()>,
        left: &ShValue,
        right: &ShValue,
        negated: bool,
        source: Source,
    ) -> (Context<()>, ShValue) {
        let dl = self.deref(&ctx, left);
        let dr = self.deref(&ctx, right);
        let answer = match (left, right) {
            (ShValue::Addr(a), ShValue::Addr(b)) => Some(a == b),
            _ => match (matches!(dl, ShValue::None), matches!(dr, ShValue::None)) {
                (true, true) => Some(true),
                (true, false) | (false, true) => Some(false),
                (false, false) => None,
            },
        };
        match answer {
            Some(b) => (ctx, ShValue::bool_const(b != negated, source)),
            None => {
                let ctx = ctx.warn("identity of these operands is not tracked", source);
                let sym = ctx.ctr_set.gen_sym_bool("is", source);
                (ctx, ShValue::Bool(sym))
            }
        }
    }

    fn membership(
        &self,
        ctx: Context<()>,
        left: &ShValue,
        right: &ShValue,
        negated: bool,
        source: Source,
    ) -> ContextSet<ShValue> {
        if let Some(obj) = self.load_obj(&ctx, right) {
            if let Some(ShValue::Func(contains)) = self.find_method(&ctx, &obj, "__contains__") {
                let results =
                    self.call_func(ctx, contains, vec![left.clone()], Vec::new(), source);
                return if negated {
                    results.map(|ctx| {
                        let value = ctx.ret_val.clone();
                        let (ctx, flipped) = self.boolean_not(ctx.with_ret(()), value, source);
                        ctx.with_ret(flipped)
                    })
                } else {
                    results
                };
            }
        }
        let ctx = ctx.warn("membership test on an opaque container", source);
        let sym = ctx.ctr_set.gen_sym_bool("contains", source);
        self.unit(ctx.with_ret(ShValue::Bool(sym)))
    }

    fn dunder_binop(
        &self,
        ctx: Context<()>,
        op: BinOpKind,
        left: &ShValue,
        right: &ShValue,
        source: Source,
    ) -> ContextSet<ShValue> {
        let Some((fwd, rev)) = op.dunder() else {
            let ctx = ctx.warn(
                format!("operator '{}' is not defined for objects", op.symbol()),
                source,
            );
            let sym = ctx.ctr_set.gen_sym_bool("cmp", source);
            return self.unit(ctx.with_ret(ShValue::Bool(sym)));
        };
        let forward = self
            .load_obj(&ctx, left)
            .and_then(|obj| self.find_method(&ctx, &obj, fwd));
        if let Some(ShValue::Func(f)) = forward {
            let right = right.clone();
            let op_sym = op.symbol();
            let rev: Rc<str> = rev.into();
            let left_cl = left.clone();
            return self
                .call_func(ctx, f, vec![right.clone()], Vec::new(), source)
                .flat_map(move |ctx| {
                    if matches!(ctx.ret_val, ShValue::NotImpl) {
                        let ctx = ctx.with_ret(());
                        self.try_reflected(ctx, &rev, op_sym, &left_cl, &right, source)
                    } else {
                        self.unit(ctx)
                    }
                });
        }
        self.try_reflected(ctx, rev, op.symbol(), left, right, source)
    }

    /// Fall back to `__rop__` on the right operand; `NotImplemented` from
    /// both sides degrades to an address-equality answer for `==`/`!=` and
    /// a warning value otherwise.
    fn try_reflected(
        &self,
        ctx: Context<()>,
        rev: &str,
        op_sym: &str,
        left: &ShValue,
        right: &ShValue,
        source: Source,
    ) -> ContextSet<ShValue> {
        let reflected = self
            .load_obj(&ctx, right)
            .and_then(|obj| self.find_method(&ctx, &obj, rev));
        if let Some(ShValue::Func(f)) = reflected {
            let left = left.clone();
            let op_sym = op_sym.to_string();
            return self
                .call_func(ctx, f, vec![left], Vec::new(), source)
                .map(move |ctx| {
                    if matches!(ctx.ret_val, ShValue::NotImpl) {
                        let ctx = ctx.warn(
                            format!("operator '{op_sym}' returned NotImplemented twice"),
                            source,
                        );
                        let value = ShValue::Error(ShError::warning(
                            format!("unsupported operand types for '{op_sym}'"),
                            source,
                        ));
                        ctx.with_ret(value)
                    } else {
                        ctx
                    }
                });
        }
        match op_sym {
            "==" | "!=" => {
                let negated = op_sym == "!=";
                let (ctx, value) = self.identity(ctx, left, right, negated, source);
                self.unit(ctx.with_ret(value))
            }
            _ => {
                let ctx = ctx.warn(
                    format!("unsupported operand types for '{op_sym}'"),
                    source,
                );
                let value = ShValue::Error(ShError::warning(
                    format!("unsupported operand types for '{op_sym}'"),
                    source,
                ));
                self.unit(ctx.with_ret(value))
            }
        }
    }

    fn unary(
        &self,
        ctx: Context<()>,
        op: UnaryOpKind,
        value: ShValue,
        source: Source,
    ) -> Context<ShValue> {
        if value.is_error() {
            return ctx.with_ret(value);
        }
        match op {
            UnaryOpKind::Neg => match self.numeric_operand(ctx, &value, source) {
                Ok((ctx, n, is_float)) => {
                    let negated = ExpNum::uop(NumUop::Neg, n, source);
                    let value = if is_float {
                        ShValue::Float(negated)
                    } else {
                        ShValue::Int(negated)
                    };
                    ctx.with_ret(value)
                }
                Err((ctx, value)) => ctx.with_ret(value),
            },
            UnaryOpKind::Not => {
                let (ctx, flipped) = self.boolean_not(ctx, value, source);
                ctx.with_ret(flipped)
            }
        }
    }

    fn boolean_not(
        &self,
        ctx: Context<()>,
        value: ShValue,
        source: Source,
    ) -> (Context<()>, ShValue) {
        match self.truthy(&ctx, &value, source) {
            Truthy::Decided(b) => (ctx, ShValue::bool_const(!b, source)),
            Truthy::Symbolic(cond) => (
                ctx,
                ShValue::Bool(simplify_bool(&ExpBool::not(cond, source))),
            ),
            Truthy::Broken(err) => {
                let ctx = ctx.warn(format!("'not' applied to {err}"), source);
                let sym = ctx.ctr_set.gen_sym_bool("not", source);
                (ctx, ShValue::Bool(sym))
            }
        }
    }

    /// Promote a value to a numeric expression. Booleans are reified through
    /// the disjunctive cast: a fresh int `n` with
    /// `(b and n == 1) or (not b and n == 0)` guaranteed.
    fn numeric_operand(
        &self,
        ctx: Context<()>,
        value: &ShValue,
        source: Source,
    ) -> Result<(Context<()>, NumRef, bool), (Context<()>, ShValue)> {
        match self.deref(&ctx, value) {
            ShValue::Int(n) => Ok((ctx, n, false)),
            ShValue::Float(n) => Ok((ctx, n, true)),
            ShValue::Bool(b) => {
                if let Some(v) = ctx.ctr_set.check_bool(&b) {
                    return Ok((
                        ctx,
                        ExpNum::constant(if v { 1.0 } else { 0.0 }, source),
                        false,
                    ));
                }
                let n = ctx.ctr_set.gen_sym_int("bool_cast", source);
                let one = ExpBool::equal(
                    SymExp::Num(n.clone()),
                    SymExp::Num(ExpNum::constant(1.0, source)),
                    source,
                );
                let zero = ExpBool::equal(
                    SymExp::Num(n.clone()),
                    SymExp::Num(ExpNum::constant(0.0, source)),
                    source,
                );
                let cast = ExpBool::or(
                    ExpBool::and(b.clone(), one, source),
                    ExpBool::and(ExpBool::not(b, source), zero, source),
                    source,
                );
                let ctr = ctx.ctr_set.gen_bool(cast, None, source);
                let ctx = ctx.guarantee(ctr);
                Ok((ctx, n, false))
            }
            other => {
                let err = ShValue::Error(ShError::warning(
                    format!("expected a number, found {}", other.kind_name()),
                    source,
                ));
                let ctx = ctx.warn(
                    format!("expected a number, found {}", other.kind_name()),
                    source,
                );
                Err((ctx, err))
            }
        }
    }

    // ================= attribute / subscript resolution =================

    pub fn deref<T>(&self, ctx: &Context<T>, value: &ShValue) -> ShValue {
        let mut current = value.clone();
        for _ in 0..64 {
            match current {
                ShValue::Addr(addr) => match ctx.heap.get_val(addr) {
                    Some(next) => current = next.clone(),
                    None => return ShValue::Undef,
                },
                other => return other,
            }
        }
        current
    }

    pub fn load_obj<T>(&self, ctx: &Context<T>, value: &ShValue) -> Option<ShObj> {
        match self.deref(ctx, value) {
            ShValue::Obj(obj) => Some(obj),
            _ => None,
        }
    }

    /// Method-resolution-order of an object: its `__class__`'s `__mro__`
    /// list when present, else the class alone.
    fn mro_addrs<T>(&self, ctx: &Context<T>, obj: &ShObj) -> Vec<Addr> {
        let Some(ShValue::Addr(cls_addr)) = obj.get_attr("__class__") else {
            return Vec::new();
        };
        let Some(cls) = self.load_obj(ctx, &ShValue::Addr(*cls_addr)) else {
            return Vec::new();
        };
        if let Some(mro_val) = cls.get_attr("__mro__") {
            if let Some(mro_obj) = self.load_obj(ctx, mro_val) {
                let mut addrs = Vec::new();
                for i in 0..mro_obj.seq_len() {
                    if let Some(ShValue::Addr(a)) = mro_obj.get_index(i) {
                        addrs.push(*a);
                    }
                }
                return addrs;
            }
        }
        vec![*cls_addr]
    }

    /// Attribute search without the `__getattr__` fallback: own attributes,
    /// then the MRO, binding functions found on classes as methods.
    pub fn find_method<T>(&self, ctx: &Context<T>, obj: &ShObj, name: &str) -> Option<ShValue> {
        if let Some(v) = obj.get_attr(name) {
            return Some(v.clone());
        }
        for cls_addr in self.mro_addrs(ctx, obj) {
            if let Some(cls) = self.load_obj(ctx, &ShValue::Addr(cls_addr)) {
                if let Some(v) = cls.get_attr(name) {
                    return Some(match v {
                        ShValue::Func(f) => ShValue::Func(Rc::new(f.bound(obj.addr))),
                        other => other.clone(),
                    });
                }
            }
        }
        None
    }

    /// Full attribute lookup: own attributes first; on miss, walk the MRO
    /// looking for the attribute or a `__getattr__` hook, preferring the
    /// earliest class's own attribute over any hook found later.
    pub fn get_attr_deep(
        &self,
        ctx: Context<()>,
        base: &ShValue,
        attr: &str,
        source: Source,
    ) -> ContextSet<ShValue> {
        if base.is_error() {
            return self.unit(ctx.with_ret(base.clone()));
        }
        let Some(obj) = self.load_obj(&ctx, base) else {
            let ctx = ctx.warn(
                format!("attribute '{attr}' on {}", base.kind_name()),
                source,
            );
            let value = ShValue::Error(ShError::warning(
                format!("no attribute '{attr}' on {}", base.kind_name()),
                source,
            ));
            return self.unit(ctx.with_ret(value));
        };
        if attr == "__dict__" {
            // synthesize a fresh dict object from the current attrs
            let (ctx, dict) = ctx.alloc_obj();
            let mut dict = dict;
            for (k, v) in obj.attrs.iter() {
                dict = dict.set_key_val(k.clone(), v.clone());
            }
            let addr = dict.addr;
            let ctx = ctx.set_val(addr, ShValue::Obj(dict));
            return self.unit(ctx.with_ret(ShValue::Addr(addr)));
        }
        if let Some(v) = obj.get_attr(attr) {
            return self.unit(ctx.with_ret(v.clone()));
        }
        let mut getattr_hook: Option<Rc<ShFunc>> = None;
        for cls_addr in self.mro_addrs(&ctx, &obj) {
            let Some(cls) = self.load_obj(&ctx, &ShValue::Addr(cls_addr)) else {
                continue;
            };
            if let Some(v) = cls.get_attr(attr) {
                let value = match v {
                    ShValue::Func(f) => ShValue::Func(Rc::new(f.bound(obj.addr))),
                    other => other.clone(),
                };
                return self.unit(ctx.with_ret(value));
            }
            if getattr_hook.is_none() {
                if let Some(ShValue::Func(f)) = cls.get_attr("__getattr__") {
                    getattr_hook = Some(Rc::new(f.bound(obj.addr)));
                }
            }
        }
        if let Some(hook) = getattr_hook {
            return self.call_func(
                ctx,
                hook,
                vec![ShValue::str_const(attr, source)],
                Vec::new(),
                source,
            );
        }
        let value = ShValue::Error(ShError::warning(
            format!("object has no attribute '{attr}'"),
            source,
        ));
        self.unit(ctx.with_ret(value))
    }

    fn subscript(
        &self,
        ctx: Context<()>,
        base: &ShValue,
        index: &ShValue,
        source: Source,
    ) -> ContextSet<ShValue> {
        if base.is_error() {
            return self.unit(ctx.with_ret(base.clone()));
        }
        let Some(obj) = self.load_obj(&ctx, base) else {
            let ctx = ctx.fail(
                format!("cannot index into {}", base.kind_name()),
                source,
            );
            return self.unit(ctx.with_ret(ShValue::Undef));
        };
        // tensors index by dropping the leading dimension
        if let Some(shape) = &obj.shape {
            let start = ExpNum::constant(1.0, source);
            let end = match shape.rank() {
                Some(r) => ExpNum::constant(r as f64, source),
                None => {
                    let (ctx, value) = ctx.warn_tensor(
                        "indexing a tensor of unknown rank",
                        source,
                    );
                    return self.unit(ctx.with_ret(value));
                }
            };
            let sliced = argus_sym::simplify::simplify_shape(&argus_sym::ExpShape::slice(
                shape.clone(),
                start,
                end,
                source,
            ));
            let (ctx, out) = ctx.alloc_obj();
            let out = out.with_shape(sliced);
            let addr = out.addr;
            let ctx = ctx.set_val(addr, ShValue::Obj(out));
            return self.unit(ctx.with_ret(ShValue::Addr(addr)));
        }
        match index {
            ShValue::Int(n) => match simplify_num(n).as_const_int() {
                Some(i) => {
                    if let Some(v) = obj.get_index(i) {
                        return self.unit(ctx.with_ret(v.clone()));
                    }
                    if let Some(ShValue::Func(getitem)) =
                        self.find_method(&ctx, &obj, "__getitem__")
                    {
                        return self.call_func(
                            ctx,
                            getitem,
                            vec![index.clone()],
                            Vec::new(),
                            source,
                        );
                    }
                    let value = ShValue::Error(ShError::warning(
                        format!("index {i} is not present"),
                        source,
                    ));
                    self.unit(ctx.with_ret(value))
                }
                None => {
                    let value = ShValue::Error(ShError::warning(
                        "subscript index is not statically resolvable",
                        source,
                    ));
                    self.unit(ctx.warn("symbolic subscript index", source).with_ret(value))
                }
            },
            ShValue::Str(s) => match s.as_const() {
                Some(key) => {
                    if let Some(v) = obj.get_key_val(&key) {
                        return self.unit(ctx.with_ret(v.clone()));
                    }
                    let value = ShValue::Error(ShError::warning(
                        format!("key '{key}' is not present"),
                        source,
                    ));
                    self.unit(ctx.with_ret(value))
                }
                None => {
                    let value = ShValue::Error(ShError::warning(
                        "subscript key is not statically resolvable",
                        source,
                    ));
                    self.unit(ctx.warn("symbolic subscript key", source).with_ret(value))
                }
            },
            other => {
                let value = ShValue::Error(ShError::warning(
                    format!("unsupported subscript: {}", other.kind_name()),
                    source,
                ));
                self.unit(ctx.with_ret(value))
            }
        }
    }

    // ================= calls =================

    pub fn call_value(
        &self,
        ctx: Context<()>,
        callee: &ShValue,
        args: Vec<ShValue>,
        kwargs: Vec<(Rc<str>, ShValue)>,
        source: Source,
    ) -> ContextSet<ShValue> {
        match self.deref(&ctx, callee) {
            ShValue::Func(f) => self.call_func(ctx, f, args, kwargs, source),
            ShValue::Obj(obj) => match self.find_method(&ctx, &obj, "__call__") {
                Some(ShValue::Func(f)) => self.call_func(ctx, f, args, kwargs, source),
                _ => {
                    let ctx = ctx.warn("object is not callable", source);
                    let value = ShValue::Error(ShError::warning(
                        "object is not callable",
                        source,
                    ));
                    self.unit(ctx.with_ret(value))
                }
            },
            ShValue::Error(e) => self.unit(ctx.with_ret(ShValue::Error(e))),
            other => {
                let ctx = ctx.warn(format!("{} is not callable", other.kind_name()), source);
                let value = ShValue::Error(ShError::warning(
                    format!("{} is not callable", other.kind_name()),
                    source,
                ));
                self.unit(ctx.with_ret(value))
            }
        }
    }

    /// Frame construction, body execution, pure-call pruning, marker
    /// coercion, and region-style frame deallocation.
    pub fn call_func(
        &self,
        ctx: Context<()>,
        func: Rc<ShFunc>,
        mut pos_args: Vec<ShValue>,
        kw_args: Vec<(Rc<str>, ShValue)>,
        source: Source,
    ) -> ContextSet<ShValue> {
        let caller_env = ctx.env.clone();
        let old_ctr = ctx.ctr_set.clone();
        let old_heap = ctx.heap.clone();
        let watermark = ctx.ids().sym_watermark();

        if let Some(self_addr) = func.bound_self {
            pos_args.insert(0, ShValue::Addr(self_addr));
        }

        let mut ctx = ctx;
        let mut frame_env = func.env.clone();
        let mut frame_addrs: Vec<Addr> = Vec::new();

        // a slot for the function's own name supports self-recursion
        let (next, faddr) = ctx.alloc_new(ShValue::Func(func.clone()));
        ctx = next;
        frame_env = frame_env.set(func.name.clone(), faddr);
        frame_addrs.push(faddr);

        let params = &func.params;
        let mut bound: HashMap<Rc<str>, ShValue> = params
            .defaults
            .iter()
            .cloned()
            .collect();
        let positional_count = pos_args.len().min(params.names.len());
        for (name, value) in params.names.iter().zip(pos_args.iter()) {
            bound.insert(name.clone(), value.clone());
        }
        let extra_pos: Vec<ShValue> = pos_args.split_off(positional_count);
        if let Some(vararg) = &params.vararg {
            let (next, tuple) = self.alloc_tuple(ctx, extra_pos, source);
            ctx = next;
            bound.insert(vararg.clone(), tuple);
        } else if !extra_pos.is_empty() {
            ctx = ctx.warn(
                format!(
                    "{} extra positional argument(s) to '{}' ignored",
                    extra_pos.len(),
                    func.name
                ),
                source,
            );
        }
        let mut kw_spill: Vec<(Rc<str>, ShValue)> = Vec::new();
        for (name, value) in kw_args {
            if params.names.contains(&name) {
                bound.insert(name, value);
            } else {
                kw_spill.push((name, value));
            }
        }
        if let Some(kwvararg) = &params.kwvararg {
            let (next, dict) = self.alloc_dict(ctx, kw_spill, source);
            ctx = next;
            bound.insert(kwvararg.clone(), dict);
        } else if !kw_spill.is_empty() {
            ctx = ctx.warn(
                format!(
                    "unexpected keyword argument(s) to '{}' ignored",
                    func.name
                ),
                source,
            );
        }

        let mut slot_names: Vec<Rc<str>> = params.names.clone();
        slot_names.extend(params.vararg.iter().cloned());
        slot_names.extend(params.kwvararg.iter().cloned());
        for name in slot_names {
            let value = match bound.remove(&name) {
                Some(v) => v,
                None => {
                    ctx = ctx.warn(
                        format!("missing argument '{name}' to '{}'", func.name),
                        source,
                    );
                    ShValue::Undef
                }
            };
            let (next, addr) = ctx.alloc_new(value);
            ctx = next;
            frame_env = frame_env.set(name, addr);
            frame_addrs.push(addr);
        }

        let frame_ctx = ctx.with_env(frame_env).push_call(func.name.clone(), source);
        let body_result = self.exec(self.unit(frame_ctx.with_ret(())), &func.body);

        // a body that falls off the end returns None
        let values = body_result.map(|ctx| {
            let value = match &ctx.ret_val {
                Flow::Value(v) => v.clone(),
                _ => ShValue::None,
            };
            ctx.with_ret(value)
        });

        let pruned = values.prune_pure_call(&old_ctr, &old_heap, watermark);

        let has_closure = func.has_closure;
        pruned.map(move |ctx| {
            let mut ctx = ctx.with_env(caller_env.clone()).pop_call();
            if !has_closure {
                let mut heap = ctx.heap.clone();
                for addr in &frame_addrs {
                    heap = heap.free(*addr);
                }
                ctx = ctx.with_heap(heap);
            }
            ctx
        })
    }

    // ================= value helpers =================

    pub fn alloc_tuple(
        &self,
        ctx: Context<()>,
        items: Vec<ShValue>,
        source: Source,
    ) -> (Context<()>, ShValue) {
        let (ctx, obj) = ctx.alloc_obj();
        let mut obj = obj;
        let len = items.len() as i64;
        for (i, item) in items.into_iter().enumerate() {
            obj = obj.set_index(i as i64, item);
        }
        obj = obj.set_attr("$length", ShValue::int_const(len, source));
        let addr = obj.addr;
        let ctx = ctx.set_val(addr, ShValue::Obj(obj));
        (ctx, ShValue::Addr(addr))
    }

    pub fn alloc_dict(
        &self,
        ctx: Context<()>,
        pairs: Vec<(Rc<str>, ShValue)>,
        source: Source,
    ) -> (Context<()>, ShValue) {
        let (ctx, obj) = ctx.alloc_obj();
        let mut obj = obj;
        let len = pairs.len() as i64;
        for (key, value) in pairs {
            obj = obj.set_key_val(key, value);
        }
        obj = obj.set_attr("$length", ShValue::int_const(len, source));
        let addr = obj.addr;
        let ctx = ctx.set_val(addr, ShValue::Obj(obj));
        (ctx, ShValue::Addr(addr))
    }

    fn truthy(&self, ctx: &Context<()>, value: &ShValue, source: Source) -> Truthy {
        match self.deref(ctx, value) {
            ShValue::Bool(b) => match ctx.ctr_set.check_bool(&b) {
                Some(v) => Truthy::Decided(v),
                None => Truthy::Symbolic(b),
            },
            ShValue::Int(n) | ShValue::Float(n) => {
                let nonzero = ExpBool::not_equal(
                    SymExp::Num(n),
                    SymExp::Num(ExpNum::constant(0.0, source)),
                    source,
                );
                match ctx.ctr_set.check_bool(&nonzero) {
                    Some(v) => Truthy::Decided(v),
                    None => Truthy::Symbolic(nonzero),
                }
            }
            ShValue::Str(s) => {
                let nonempty = ExpBool::not_equal(
                    SymExp::Str(s),
                    SymExp::Str(ExpString::constant("", source)),
                    source,
                );
                match ctx.ctr_set.check_bool(&nonempty) {
                    Some(v) => Truthy::Decided(v),
                    None => Truthy::Symbolic(nonempty),
                }
            }
            ShValue::None => Truthy::Decided(false),
            ShValue::Obj(obj) => match obj.get_attr("$length").and_then(|v| v.as_num()) {
                Some(len) => {
                    let nonzero = ExpBool::not_equal(
                        SymExp::Num(len.clone()),
                        SymExp::Num(ExpNum::constant(0.0, source)),
                        source,
                    );
                    match ctx.ctr_set.check_bool(&nonzero) {
                        Some(v) => Truthy::Decided(v),
                        None => Truthy::Symbolic(nonzero),
                    }
                }
                None => Truthy::Decided(true),
            },
            ShValue::Func(_) => Truthy::Decided(true),
            ShValue::Error(e) => Truthy::Broken(ShValue::Error(e)),
            ShValue::NotImpl | ShValue::Undef | ShValue::Addr(_) => {
                Truthy::Broken(value.clone())
            }
        }
    }
}

// ----- static statement predicates -----

/// Branches of constants, names and bare object literals only; used to skip
/// conditionals whose branches cannot have effects.
fn stmt_is_trivial(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::Pass(_) => true,
        Stmt::Expr(expr) => expr_is_trivial(expr),
        Stmt::Seq(left, right) => stmt_is_trivial(left) && stmt_is_trivial(right),
        _ => false,
    }
}

fn expr_is_trivial(expr: &Expr) -> bool {
    match expr {
        Expr::Const(_, _) | Expr::Name(_, _) | Expr::Object(_) => true,
        Expr::Tuple(items, _) => items.iter().all(expr_is_trivial),
        _ => false,
    }
}

fn stmt_has_fundef(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::FunDef(_) => true,
        Stmt::Seq(left, right) => stmt_has_fundef(left) || stmt_has_fundef(right),
        Stmt::If {
            then_branch,
            else_branch,
            ..
        } => stmt_has_fundef(then_branch) || stmt_has_fundef(else_branch),
        Stmt::ForIn { body, .. } => stmt_has_fundef(body),
        _ => false,
    }
}
