//! Interpreter behavior over hand-built IR, with an empty intrinsic table.

use argus_interpret::{Context, Flow, Governor, Interp, LibCallMap, ShValue};
use argus_ir::{BinOpKind, ConstKind, Expr, Source, Stmt};
use argus_sym::simplify::simplify_num;
use argus_sym::IdManager;

fn src() -> Source {
    Source::Unknown
}

fn name(n: &str) -> Expr {
    Expr::Name(n.to_string(), src())
}

fn int(v: i64) -> Expr {
    Expr::Const(ConstKind::Int(v), src())
}

fn binop(op: BinOpKind, left: Expr, right: Expr) -> Expr {
    Expr::BinOp {
        op,
        left: Box::new(left),
        right: Box::new(right),
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

fn ret(value: Expr) -> Stmt {
    Stmt::Return {
        value: Some(value),
        source: src(),
    }
}

fn run(program: &Stmt) -> argus_interpret::ContextSet<Flow> {
    let interp = Interp::new(LibCallMap::new(), Governor::new());
    let root = Context::root(IdManager::new(), "test");
    interp.exec(interp.unit(root), program)
}

fn returned_const(set: &argus_interpret::ContextSet<Flow>) -> Option<i64> {
    let ctx = set.live().first()?;
    match &ctx.ret_val {
        Flow::Value(ShValue::Int(n)) => simplify_num(n).as_const_int(),
        _ => None,
    }
}

#[test]
fn let_assign_and_arithmetic() {
    let program = Stmt::seq(vec![
        let_("x", int(5)),
        assign("x", binop(BinOpKind::Add, name("x"), int(1))),
        ret(name("x")),
    ]);
    let result = run(&program);
    assert_eq!(result.live_count(), 1);
    assert_eq!(returned_const(&result), Some(6));
}

#[test]
fn concrete_tuple_loop_unrolls() {
    // s = 0; for i in (1, 2, 3): s = s + i; return s
    let program = Stmt::seq(vec![
        let_("s", int(0)),
        Stmt::ForIn {
            ident: "i".to_string(),
            iter: Expr::Tuple(vec![int(1), int(2), int(3)], src()),
            body: Box::new(assign("s", binop(BinOpKind::Add, name("s"), name("i")))),
            source: src(),
        },
        ret(name("s")),
    ]);
    let result = run(&program);
    assert_eq!(result.live_count(), 1);
    assert_eq!(returned_const(&result), Some(6));
}

#[test]
fn break_leaves_the_loop_early() {
    // s = 0; for i in (1, 2, 3): if i == 2: break; s = s + i; return s
    let body = Stmt::seq(vec![
        Stmt::If {
            cond: binop(BinOpKind::Eq, name("i"), int(2)),
            then_branch: Box::new(Stmt::Break(src())),
            else_branch: Box::new(Stmt::Pass(src())),
            source: src(),
        },
        assign("s", binop(BinOpKind::Add, name("s"), name("i"))),
    ]);
    let program = Stmt::seq(vec![
        let_("s", int(0)),
        Stmt::ForIn {
            ident: "i".to_string(),
            iter: Expr::Tuple(vec![int(1), int(2), int(3)], src()),
            body: Box::new(body),
            source: src(),
        },
        ret(name("s")),
    ]);
    let result = run(&program);
    assert_eq!(result.live_count(), 1);
    assert_eq!(returned_const(&result), Some(1));
}

#[test]
fn short_circuit_and_returns_operand_values() {
    // Python semantics: `0 and 5` is 0, `3 and 5` is 5
    let zero_case = Stmt::seq(vec![ret(binop(BinOpKind::And, int(0), int(5)))]);
    let result = run(&zero_case);
    assert_eq!(returned_const(&result), Some(0));

    let truthy_case = Stmt::seq(vec![ret(binop(BinOpKind::And, int(3), int(5)))]);
    let result = run(&truthy_case);
    assert_eq!(returned_const(&result), Some(5));

    let or_case = Stmt::seq(vec![ret(binop(BinOpKind::Or, int(0), int(7)))]);
    let result = run(&or_case);
    assert_eq!(returned_const(&result), Some(7));
}

#[test]
fn return_skips_the_rest_of_a_sequence() {
    let program = Stmt::seq(vec![ret(int(1)), assign("never", int(2))]);
    let result = run(&program);
    assert_eq!(result.live_count(), 1);
    assert_eq!(returned_const(&result), Some(1));
}

#[test]
fn function_falling_off_the_end_returns_none() {
    // def f(): pass
    // return f()
    let program = Stmt::seq(vec![
        Stmt::FunDef(argus_ir::FunDef {
            name: "f".to_string(),
            params: argus_ir::FunParams::default(),
            body: Box::new(Stmt::Pass(src())),
            source: src(),
        }),
        ret(Expr::Call {
            callee: Box::new(name("f")),
            args: Vec::new(),
            kwargs: Vec::new(),
            source: src(),
        }),
    ]);
    let result = run(&program);
    assert_eq!(result.live_count(), 1);
    assert!(matches!(
        &result.live()[0].ret_val,
        Flow::Value(ShValue::None)
    ));
}

#[test]
fn error_values_propagate_without_cascading() {
    // y = missing + 1: the undefined-name warning value flows through the
    // binary operator unchanged instead of producing a second error
    let program = Stmt::seq(vec![
        let_("y", binop(BinOpKind::Add, name("missing"), int(1))),
        ret(name("y")),
    ]);
    let result = run(&program);
    assert_eq!(result.live_count(), 1);
    let ctx = &result.live()[0];
    match &ctx.ret_val {
        Flow::Value(ShValue::Error(err)) => {
            assert!(err.reason.contains("undefined name"), "got: {}", err.reason);
        }
        other => panic!("expected the original error value, got {other:?}"),
    }
}
