//! Python builtin intrinsics, reached through the `LibCall` bridge.

use argus_interpret::{
    arg_named, Context, ContextSet, Interp, LibCallArgs, LibCallMap, ShError, ShValue,
};
use argus_ir::Source;
use argus_sym::simplify::simplify_num;
use argus_sym::{ExpBool, ExpNum, NumRef, SymExp};

pub fn register(map: &mut LibCallMap) {
    map.register("len", len);
    map.register("isinstance", isinstance);
    map.register("randInt", rand_int);
    map.register("randFloat", rand_float);
    map.register("randIntGte", rand_int_gte);
    map.register("genInt", gen_int);
    map.register("assert", assert_cond);
    map.register("warn", warn_msg);
    map.register("fail", fail_msg);
    map.register("print", print_value);
    map.register("range", range_obj);
    map.register("getAttr", get_attr);
    map.register("setAttr", set_attr);
    map.register("listAppend", list_append);
    map.register("super", super_proxy);
}

fn missing(
    interp: &Interp,
    ctx: Context<()>,
    intrinsic: &str,
    name: &str,
    source: Source,
) -> ContextSet<ShValue> {
    let reason = format!("intrinsic '{intrinsic}' is missing argument '{name}'");
    let ctx = ctx.warn(reason.clone(), source);
    interp.unit(ctx.with_ret(ShValue::Error(ShError::warning(reason, source))))
}

/// A value as a numeric expression, if it is one after dereferencing.
fn value_num(interp: &Interp, ctx: &Context<()>, value: &ShValue) -> Option<NumRef> {
    match interp.deref(ctx, value) {
        ShValue::Int(n) | ShValue::Float(n) => Some(n),
        _ => None,
    }
}

fn len(interp: &Interp, ctx: Context<()>, args: LibCallArgs, source: Source) -> ContextSet<ShValue> {
    let Some(value) = arg_named(&args, "x", 0).cloned() else {
        return missing(interp, ctx, "len", "x", source);
    };
    if let Some(obj) = interp.load_obj(&ctx, &value) {
        if let Some(n) = obj.get_attr("$length").and_then(|v| v.as_num()) {
            return interp.unit(ctx.with_ret(ShValue::Int(n.clone())));
        }
        if let Some(shape) = &obj.shape {
            let dim0 = ExpNum::index(shape.clone(), ExpNum::constant(0.0, source), source);
            return interp.unit(ctx.with_ret(ShValue::Int(dim0)));
        }
        let seq = obj.seq_len();
        if seq > 0 {
            return interp.unit(ctx.with_ret(ShValue::int_const(seq, source)));
        }
    }
    if let ShValue::Str(s) = interp.deref(&ctx, &value) {
        if let Some(text) = s.as_const() {
            return interp.unit(ctx.with_ret(ShValue::int_const(text.chars().count() as i64, source)));
        }
    }
    let ctx = ctx.warn("length of this value is not tracked", source);
    let zero = ExpNum::constant(0.0, source);
    let (ctr_set, n) = ctx.ctr_set.gen_sym_int_gte("len", &zero, source);
    let ctx = ctx.with_ctr_set(ctr_set);
    interp.unit(ctx.with_ret(ShValue::Int(n)))
}

fn isinstance(
    interp: &Interp,
    ctx: Context<()>,
    args: LibCallArgs,
    source: Source,
) -> ContextSet<ShValue> {
    let Some(value) = arg_named(&args, "x", 0).cloned() else {
        return missing(interp, ctx, "isinstance", "x", source);
    };
    let Some(ty) = arg_named(&args, "ty", 1).cloned() else {
        return missing(interp, ctx, "isinstance", "ty", source);
    };
    let target = interp.deref(&ctx, &value);
    if let ShValue::Str(name) = interp.deref(&ctx, &ty) {
        if let Some(name) = name.as_const() {
            let matched = match &**name {
                "int" => matches!(target, ShValue::Int(_) | ShValue::Bool(_)),
                "float" => matches!(target, ShValue::Float(_)),
                "bool" => matches!(target, ShValue::Bool(_)),
                "str" => matches!(target, ShValue::Str(_)),
                "Tensor" => matches!(&target, ShValue::Obj(o) if o.shape.is_some()),
                "tuple" | "list" | "dict" | "object" => matches!(target, ShValue::Obj(_)),
                _ => false,
            };
            return interp.unit(ctx.with_ret(ShValue::bool_const(matched, source)));
        }
    }
    if let ShValue::Addr(cls_addr) = ty {
        if let Some(obj) = interp.load_obj(&ctx, &value) {
            let in_mro = obj
                .get_attr("__class__")
                .is_some_and(|c| matches!(c, ShValue::Addr(a) if *a == cls_addr));
            return interp.unit(ctx.with_ret(ShValue::bool_const(in_mro, source)));
        }
    }
    let ctx = ctx.warn("isinstance target is not statically known", source);
    let sym = ctx.ctr_set.gen_sym_bool("isinstance", source);
    interp.unit(ctx.with_ret(ShValue::Bool(sym)))
}

/// A fresh integer symbol hard-bounded to `[lo, hi]`.
fn rand_int(
    interp: &Interp,
    ctx: Context<()>,
    args: LibCallArgs,
    source: Source,
) -> ContextSet<ShValue> {
    let lo = arg_named(&args, "lo", 0).and_then(|v| value_num(interp, &ctx, v));
    let hi = arg_named(&args, "hi", 1).and_then(|v| value_num(interp, &ctx, v));
    let (Some(lo), Some(hi)) = (lo, hi) else {
        return missing(interp, ctx, "randInt", "lo/hi", source);
    };
    let (ctr_set, sym) = ctx.ctr_set.gen_sym_int_gte("randint", &lo, source);
    let ctx = ctx.with_ctr_set(ctr_set);
    let upper = ctx.ctr_set.gen_lte(sym.clone(), hi, None, source);
    let ctx = ctx.guarantee(upper);
    interp.unit(ctx.with_ret(ShValue::Int(sym)))
}

fn rand_float(
    interp: &Interp,
    ctx: Context<()>,
    args: LibCallArgs,
    source: Source,
) -> ContextSet<ShValue> {
    let lo = arg_named(&args, "lo", 0).and_then(|v| value_num(interp, &ctx, v));
    let hi = arg_named(&args, "hi", 1).and_then(|v| value_num(interp, &ctx, v));
    let (Some(lo), Some(hi)) = (lo, hi) else {
        return missing(interp, ctx, "randFloat", "lo/hi", source);
    };
    let sym = ctx.ctr_set.gen_sym_float("randfloat", source);
    let lower = ctx.ctr_set.gen_lte(lo, sym.clone(), None, source);
    let ctx = ctx.guarantee(lower);
    let upper = ctx.ctr_set.gen_lte(sym.clone(), hi, None, source);
    let ctx = ctx.guarantee(upper);
    interp.unit(ctx.with_ret(ShValue::Float(sym)))
}

/// A fresh integer symbol bounded below only.
fn rand_int_gte(
    interp: &Interp,
    ctx: Context<()>,
    args: LibCallArgs,
    source: Source,
) -> ContextSet<ShValue> {
    let Some(lo) = arg_named(&args, "lo", 0).and_then(|v| value_num(interp, &ctx, v)) else {
        return missing(interp, ctx, "randIntGte", "lo", source);
    };
    let (ctr_set, sym) = ctx.ctr_set.gen_sym_int_gte("randint", &lo, source);
    let ctx = ctx.with_ctr_set(ctr_set);
    interp.unit(ctx.with_ret(ShValue::Int(sym)))
}

/// A completely unconditioned fresh integer symbol.
fn gen_int(
    interp: &Interp,
    ctx: Context<()>,
    _args: LibCallArgs,
    source: Source,
) -> ContextSet<ShValue> {
    let sym = ctx.ctr_set.gen_sym_int("genint", source);
    interp.unit(ctx.with_ret(ShValue::Int(sym)))
}

/// Soft assumption: an immediately refutable condition fails the path.
fn assert_cond(
    interp: &Interp,
    ctx: Context<()>,
    args: LibCallArgs,
    source: Source,
) -> ContextSet<ShValue> {
    let Some(value) = arg_named(&args, "cond", 0).cloned() else {
        return missing(interp, ctx, "assert", "cond", source);
    };
    let cond = match interp.deref(&ctx, &value) {
        ShValue::Bool(b) => b,
        ShValue::Int(n) | ShValue::Float(n) => ExpBool::not_equal(
            SymExp::Num(n),
            SymExp::Num(ExpNum::constant(0.0, source)),
            source,
        ),
        other => {
            let ctx = ctx.warn(
                format!("assertion condition is {}, not a boolean", other.kind_name()),
                source,
            );
            return interp.unit(ctx.with_ret(ShValue::None));
        }
    };
    let ctr = ctx
        .ctr_set
        .gen_bool(cond, Some("assertion failed".into()), source);
    let ctx = ctx.require(ctr);
    interp.unit(ctx.with_ret(ShValue::None))
}

fn warn_msg(
    interp: &Interp,
    ctx: Context<()>,
    args: LibCallArgs,
    source: Source,
) -> ContextSet<ShValue> {
    let text = arg_named(&args, "msg", 0)
        .map(|v| v.to_string())
        .unwrap_or_else(|| "explicit warning".to_string());
    interp.unit(ctx.warn(text, source).with_ret(ShValue::None))
}

fn fail_msg(
    interp: &Interp,
    ctx: Context<()>,
    args: LibCallArgs,
    source: Source,
) -> ContextSet<ShValue> {
    let text = arg_named(&args, "msg", 0)
        .map(|v| v.to_string())
        .unwrap_or_else(|| "explicit failure".to_string());
    interp.unit(ctx.fail(text, source).with_ret(ShValue::None))
}

fn print_value(
    interp: &Interp,
    ctx: Context<()>,
    args: LibCallArgs,
    source: Source,
) -> ContextSet<ShValue> {
    let text = arg_named(&args, "x", 0)
        .map(|v| v.to_string())
        .unwrap_or_default();
    interp.unit(ctx.log(text, source).with_ret(ShValue::None))
}

/// A range object: `$start`, `$step` and `$length` attributes drive both
/// concrete unrolling and symbolic iteration.
fn range_obj(
    interp: &Interp,
    ctx: Context<()>,
    args: LibCallArgs,
    source: Source,
) -> ContextSet<ShValue> {
    let first = arg_named(&args, "start", 0).and_then(|v| value_num(interp, &ctx, v));
    let second = arg_named(&args, "stop", 1).and_then(|v| value_num(interp, &ctx, v));
    let step = arg_named(&args, "step", 2).and_then(|v| value_num(interp, &ctx, v));
    let Some(first) = first else {
        return missing(interp, ctx, "range", "start", source);
    };
    let (start, stop) = match second {
        Some(stop) => (first, stop),
        None => (ExpNum::constant(0.0, source), first),
    };
    let step = step.unwrap_or_else(|| ExpNum::constant(1.0, source));
    let span = ExpNum::sub(stop, start.clone(), source);
    let length = if simplify_num(&step).as_const() == Some(1.0) {
        span
    } else {
        let adjusted = ExpNum::add(
            span,
            ExpNum::sub(step.clone(), ExpNum::constant(1.0, source), source),
            source,
        );
        ExpNum::bop(argus_sym::NumBop::FloorDiv, adjusted, step.clone(), source)
    };
    let length = simplify_num(&length);
    // clamp to zero only when the sign is not already decided
    let length = match ctx
        .ctr_set
        .get_cached_range(&length)
        .map(|r| r.start() >= 0.0)
    {
        Some(true) => length,
        _ => ExpNum::max_of(vec![length, ExpNum::constant(0.0, source)], source),
    };
    let (ctx, obj) = ctx.alloc_obj();
    let obj = obj
        .set_attr("$start", ShValue::Int(start))
        .set_attr("$step", ShValue::Int(step))
        .set_attr("$length", ShValue::Int(length));
    let addr = obj.addr;
    let ctx = ctx.set_val(addr, ShValue::Obj(obj));
    interp.unit(ctx.with_ret(ShValue::Addr(addr)))
}

fn get_attr(
    interp: &Interp,
    ctx: Context<()>,
    args: LibCallArgs,
    source: Source,
) -> ContextSet<ShValue> {
    let Some(base) = arg_named(&args, "obj", 0).cloned() else {
        return missing(interp, ctx, "getAttr", "obj", source);
    };
    let name = arg_named(&args, "name", 1)
        .and_then(|v| match interp.deref(&ctx, v) {
            ShValue::Str(s) => s.as_const().cloned(),
            _ => None,
        });
    let Some(name) = name else {
        return missing(interp, ctx, "getAttr", "name", source);
    };
    interp.get_attr_deep(ctx, &base, &name, source)
}

fn set_attr(
    interp: &Interp,
    ctx: Context<()>,
    args: LibCallArgs,
    source: Source,
) -> ContextSet<ShValue> {
    let Some(base) = arg_named(&args, "obj", 0).cloned() else {
        return missing(interp, ctx, "setAttr", "obj", source);
    };
    let name = arg_named(&args, "name", 1).and_then(|v| match interp.deref(&ctx, v) {
        ShValue::Str(s) => s.as_const().cloned(),
        _ => None,
    });
    let Some(name) = name else {
        return missing(interp, ctx, "setAttr", "name", source);
    };
    let Some(value) = arg_named(&args, "value", 2).cloned() else {
        return missing(interp, ctx, "setAttr", "value", source);
    };
    let Some(obj) = interp.load_obj(&ctx, &base) else {
        let ctx = ctx.fail(
            format!("cannot set attribute of {}", base.kind_name()),
            source,
        );
        return interp.unit(ctx.with_ret(ShValue::None));
    };
    let updated = obj.set_attr(name, value);
    let addr = updated.addr;
    let ctx = ctx.set_val(addr, ShValue::Obj(updated));
    interp.unit(ctx.with_ret(ShValue::None))
}

fn list_append(
    interp: &Interp,
    ctx: Context<()>,
    args: LibCallArgs,
    source: Source,
) -> ContextSet<ShValue> {
    let Some(base) = arg_named(&args, "list", 0).cloned() else {
        return missing(interp, ctx, "listAppend", "list", source);
    };
    let Some(value) = arg_named(&args, "value", 1).cloned() else {
        return missing(interp, ctx, "listAppend", "value", source);
    };
    let Some(obj) = interp.load_obj(&ctx, &base) else {
        let ctx = ctx.fail(
            format!("cannot append to {}", base.kind_name()),
            source,
        );
        return interp.unit(ctx.with_ret(ShValue::None));
    };
    let next_index = obj.seq_len();
    let new_length = match obj.get_attr("$length").and_then(|v| v.as_num()) {
        Some(n) => ExpNum::add(n.clone(), ExpNum::constant(1.0, source), source),
        None => ExpNum::constant((next_index + 1) as f64, source),
    };
    let updated = obj
        .set_index(next_index, value)
        .set_attr("$length", ShValue::Int(simplify_num(&new_length)));
    let addr = updated.addr;
    let ctx = ctx.set_val(addr, ShValue::Obj(updated));
    interp.unit(ctx.with_ret(ShValue::None))
}

/// `super(cls, self)`: a proxy whose class is the entry after `cls` in the
/// receiver's MRO.
fn super_proxy(
    interp: &Interp,
    ctx: Context<()>,
    args: LibCallArgs,
    source: Source,
) -> ContextSet<ShValue> {
    let Some(cls) = arg_named(&args, "cls", 0).cloned() else {
        return missing(interp, ctx, "super", "cls", source);
    };
    let Some(receiver) = arg_named(&args, "self", 1).cloned() else {
        return missing(interp, ctx, "super", "self", source);
    };
    let cls_addr = match cls {
        ShValue::Addr(a) => a,
        _ => {
            let ctx = ctx.warn("super() with an untracked class", source);
            let (ctx, value) = ctx.warn_tensor("super() proxy is opaque", source);
            return interp.unit(ctx.with_ret(value));
        }
    };
    let Some(self_obj) = interp.load_obj(&ctx, &receiver) else {
        let ctx = ctx.warn("super() with an untracked receiver", source);
        let (ctx, value) = ctx.warn_tensor("super() proxy is opaque", source);
        return interp.unit(ctx.with_ret(value));
    };
    // walk the receiver's class MRO to find the successor of `cls`
    let mro = self_obj
        .get_attr("__class__")
        .and_then(|c| interp.load_obj(&ctx, c))
        .and_then(|class_obj| class_obj.get_attr("__mro__").cloned())
        .and_then(|mro_val| interp.load_obj(&ctx, &mro_val));
    if let Some(mro_obj) = mro {
        let mut take_next = false;
        for i in 0..mro_obj.seq_len() {
            match mro_obj.get_index(i) {
                Some(ShValue::Addr(a)) if take_next => {
                    let (ctx, proxy) = ctx.alloc_obj();
                    let proxy = proxy
                        .set_attr("__class__", ShValue::Addr(*a))
                        .set_attr("$super_self", receiver.clone());
                    let addr = proxy.addr;
                    let ctx = ctx.set_val(addr, ShValue::Obj(proxy));
                    return interp.unit(ctx.with_ret(ShValue::Addr(addr)));
                }
                Some(ShValue::Addr(a)) if *a == cls_addr => take_next = true,
                _ => {}
            }
        }
    }
    let ctx = ctx.warn("super(): class is not in the receiver's MRO", source);
    let value = ShValue::Error(ShError::warning("super() could not resolve", source));
    interp.unit(ctx.with_ret(value))
}
