//! Tensor shape semantics: constructors, broadcasting, matmul, reduction,
//! concatenation and reshape, expressed as constraints over shape
//! expressions. Shape checks are *soft* requirements, so a mismatch fails
//! the path with a readable reason instead of aborting the analysis.

use argus_interpret::{
    arg_named, Context, ContextSet, Interp, LibCallArgs, LibCallMap, ShValue,
};
use argus_ir::Source;
use argus_sym::simplify::{simplify_num, simplify_shape};
use argus_sym::{BroadcastSelect, ExpNum, ExpShape, NumRef, ShapeRef, SymExp};

pub fn register(map: &mut LibCallMap) {
    map.register("tensor", tensor_ctor);
    map.register("zeros", tensor_ctor);
    map.register("ones", tensor_ctor);
    map.register("rand", tensor_ctor);
    map.register("randn", tensor_ctor);
    map.register("matmul", matmul);
    map.register("broadcast", broadcast_binop);
    map.register("sum", reduce);
    map.register("cat", concat);
    map.register("reshape", reshape);
}

/// A shape from a tensor argument, a tuple/list of dimensions, or a bare
/// integer.
fn shape_from_value(
    interp: &Interp,
    ctx: &Context<()>,
    value: &ShValue,
    source: Source,
) -> Option<ShapeRef> {
    if let Some(obj) = interp.load_obj(ctx, value) {
        if let Some(shape) = &obj.shape {
            return Some(shape.clone());
        }
        let len = obj.get_attr("$length").and_then(|v| v.as_num())?;
        let n = simplify_num(len).as_const_int()?;
        let mut dims = Vec::with_capacity(n as usize);
        for i in 0..n {
            dims.push(obj.get_index(i)?.as_num()?.clone());
        }
        return Some(ExpShape::constant(dims, source));
    }
    match interp.deref(ctx, value) {
        ShValue::Int(n) => Some(ExpShape::constant(vec![n], source)),
        _ => None,
    }
}

fn alloc_tensor(ctx: Context<()>, shape: ShapeRef) -> (Context<()>, ShValue) {
    let (ctx, obj) = ctx.alloc_obj();
    let obj = obj.with_shape(simplify_shape(&shape));
    let addr = obj.addr;
    let ctx = ctx.set_val(addr, ShValue::Obj(obj));
    (ctx, ShValue::Addr(addr))
}

fn tensor_shape(
    interp: &Interp,
    ctx: &Context<()>,
    value: &ShValue,
) -> Option<ShapeRef> {
    interp
        .load_obj(ctx, value)
        .and_then(|obj| obj.shape.clone())
}

fn tensor_ctor(
    interp: &Interp,
    ctx: Context<()>,
    args: LibCallArgs,
    source: Source,
) -> ContextSet<ShValue> {
    let shape = arg_named(&args, "shape", 0)
        .and_then(|v| shape_from_value(interp, &ctx, v, source));
    match shape {
        Some(shape) => {
            let (ctx, value) = alloc_tensor(ctx, shape);
            interp.unit(ctx.with_ret(value))
        }
        None => {
            let (ctx, value) = ctx.warn_tensor("tensor shape argument is opaque", source);
            interp.unit(ctx.with_ret(value))
        }
    }
}

fn require_dim_eq(
    ctx: Context<()>,
    left: &NumRef,
    right: &NumRef,
    message: &str,
    source: Source,
) -> Context<()> {
    let ctr = ctx.ctr_set.gen_equality(
        SymExp::Num(left.clone()),
        SymExp::Num(right.clone()),
        Some(message.into()),
        source,
    );
    ctx.require(ctr)
}

fn matmul(
    interp: &Interp,
    ctx: Context<()>,
    args: LibCallArgs,
    source: Source,
) -> ContextSet<ShValue> {
    let a = arg_named(&args, "a", 0).cloned();
    let b = arg_named(&args, "b", 1).cloned();
    let sa = a.as_ref().and_then(|v| tensor_shape(interp, &ctx, v));
    let sb = b.as_ref().and_then(|v| tensor_shape(interp, &ctx, v));
    let (Some(sa), Some(sb)) = (sa, sb) else {
        let (ctx, value) = ctx.warn_tensor("matmul operand is not a tensor", source);
        return interp.unit(ctx.with_ret(value));
    };
    let da = ctx.ctr_set.get_cached_shape(&simplify_shape(&sa));
    let db = ctx.ctr_set.get_cached_shape(&simplify_shape(&sb));
    let (Some(da), Some(db)) = (da, db) else {
        let (ctx, value) = ctx.warn_tensor("matmul over tensors of unknown rank", source);
        return interp.unit(ctx.with_ret(value));
    };
    let mismatch = "cannot multiply tensors: inner dimension mismatch";
    let (ctx, out_dims): (Context<()>, Vec<NumRef>) = match (da.len(), db.len()) {
        (0, _) | (_, 0) => {
            let ctx = ctx.warn("matmul with a zero-rank operand", source);
            let ctr = ctx.ctr_set.gen_fail(mismatch, source);
            return interp.unit(ctx.require(ctr).with_ret(ShValue::Undef));
        }
        (1, 1) => {
            let ctx = require_dim_eq(ctx, &da[0], &db[0], mismatch, source);
            (ctx, Vec::new())
        }
        (1, 2) => {
            let ctx = require_dim_eq(ctx, &da[0], &db[0], mismatch, source);
            (ctx, vec![db[1].clone()])
        }
        (2, 1) => {
            let ctx = require_dim_eq(ctx, &da[1], &db[0], mismatch, source);
            (ctx, vec![da[0].clone()])
        }
        (2, 2) => {
            let ctx = require_dim_eq(ctx, &da[1], &db[0], mismatch, source);
            (ctx, vec![da[0].clone(), db[1].clone()])
        }
        (ra, rb) if ra >= 2 && rb >= 2 => {
            // broadcast the batch dimensions, multiply the trailing pair
            let batch_a = &da[..ra - 2];
            let batch_b = &db[..rb - 2];
            let (ctx, mut batch) =
                broadcast_dims(ctx, batch_a, batch_b, &sa, &sb, source);
            let ctx = require_dim_eq(ctx, &da[ra - 1], &db[rb - 2], mismatch, source);
            batch.push(da[ra - 2].clone());
            batch.push(db[rb - 1].clone());
            (ctx, batch)
        }
        _ => {
            let (ctx, value) =
                ctx.warn_tensor("batched matmul with a one-dimensional operand", source);
            return interp.unit(ctx.with_ret(value));
        }
    };
    let (ctx, value) = alloc_tensor(ctx, ExpShape::constant(out_dims, source));
    interp.unit(ctx.with_ret(value))
}

/// Numpy-style dimension-wise broadcast of two dimension lists. Undecided
/// dimensions leave a `Broadcastable` obligation for the external solver and
/// contribute `max(l, r)` to the result.
fn broadcast_dims(
    ctx: Context<()>,
    left: &[NumRef],
    right: &[NumRef],
    shape_l: &ShapeRef,
    shape_r: &ShapeRef,
    source: Source,
) -> (Context<()>, Vec<NumRef>) {
    let rank = left.len().max(right.len());
    let one = ExpNum::constant(1.0, source);
    let mut dims = Vec::with_capacity(rank);
    let mut needs_obligation = false;
    for i in 0..rank {
        let l = if i < rank - left.len() {
            &one
        } else {
            &left[i - (rank - left.len())]
        };
        let r = if i < rank - right.len() {
            &one
        } else {
            &right[i - (rank - right.len())]
        };
        match ctx.ctr_set.select_broadcastable(l, r) {
            BroadcastSelect::Selected(dim) => dims.push(dim),
            BroadcastSelect::Impossible | BroadcastSelect::Undecided => {
                needs_obligation = true;
                dims.push(simplify_num(&ExpNum::max_of(
                    vec![l.clone(), r.clone()],
                    source,
                )));
            }
        }
    }
    let ctx = if needs_obligation {
        let ctr = ctx.ctr_set.gen_broad(
            shape_l.clone(),
            shape_r.clone(),
            Some("shapes are not broadcastable".into()),
            source,
        );
        ctx.require(ctr)
    } else {
        ctx
    };
    (ctx, dims)
}

/// Elementwise combination of two tensors under broadcasting; also accepts a
/// scalar on either side.
fn broadcast_binop(
    interp: &Interp,
    ctx: Context<()>,
    args: LibCallArgs,
    source: Source,
) -> ContextSet<ShValue> {
    let a = arg_named(&args, "a", 0).cloned();
    let b = arg_named(&args, "b", 1).cloned();
    let sa = a.as_ref().and_then(|v| tensor_shape(interp, &ctx, v));
    let sb = b.as_ref().and_then(|v| tensor_shape(interp, &ctx, v));
    match (sa, sb) {
        (Some(sa), Some(sb)) => {
            let da = ctx.ctr_set.get_cached_shape(&simplify_shape(&sa));
            let db = ctx.ctr_set.get_cached_shape(&simplify_shape(&sb));
            if let (Some(da), Some(db)) = (da, db) {
                let (ctx, dims) = broadcast_dims(ctx, &da, &db, &sa, &sb, source);
                let (ctx, value) = alloc_tensor(ctx, ExpShape::constant(dims, source));
                return interp.unit(ctx.with_ret(value));
            }
            // unknown structure: keep the symbolic broadcast node
            let ctr = ctx.ctr_set.gen_broad(
                sa.clone(),
                sb.clone(),
                Some("shapes are not broadcastable".into()),
                source,
            );
            let ctx = ctx.require(ctr);
            let (ctx, value) = alloc_tensor(ctx, ExpShape::broadcast(sa, sb, source));
            interp.unit(ctx.with_ret(value))
        }
        (Some(s), None) | (None, Some(s)) => {
            let (ctx, value) = alloc_tensor(ctx, s);
            interp.unit(ctx.with_ret(value))
        }
        (None, None) => {
            let (ctx, value) = ctx.warn_tensor("elementwise op on non-tensors", source);
            interp.unit(ctx.with_ret(value))
        }
    }
}

/// `sum(t)` collapses to a scalar; `sum(t, dim)` drops the dimension, or
/// pins it to 1 under `keepdim`.
fn reduce(
    interp: &Interp,
    ctx: Context<()>,
    args: LibCallArgs,
    source: Source,
) -> ContextSet<ShValue> {
    let target = arg_named(&args, "a", 0).cloned();
    let Some(shape) = target.as_ref().and_then(|v| tensor_shape(interp, &ctx, v)) else {
        let (ctx, value) = ctx.warn_tensor("reduction over a non-tensor", source);
        return interp.unit(ctx.with_ret(value));
    };
    let dim = arg_named(&args, "dim", 1)
        .and_then(|v| match interp.deref(&ctx, v) {
            ShValue::Int(n) => simplify_num(&n).as_const_int(),
            _ => None,
        });
    let keepdim = arg_named(&args, "keepdim", 2)
        .map(|v| matches!(interp.deref(&ctx, v), ShValue::Bool(b) if b.as_const() == Some(true)))
        .unwrap_or(false);
    let Some(dim) = dim else {
        // full reduction to a scalar tensor
        let (ctx, value) = alloc_tensor(ctx, ExpShape::constant(Vec::new(), source));
        return interp.unit(ctx.with_ret(value));
    };
    if keepdim {
        let pinned = ExpShape::set(
            shape,
            dim as usize,
            ExpNum::constant(1.0, source),
            source,
        );
        let (ctx, value) = alloc_tensor(ctx, pinned);
        return interp.unit(ctx.with_ret(value));
    }
    let Some(dims) = ctx.ctr_set.get_cached_shape(&simplify_shape(&shape)) else {
        let (ctx, value) = ctx.warn_tensor("reduction over a tensor of unknown rank", source);
        return interp.unit(ctx.with_ret(value));
    };
    if dim < 0 || dim as usize >= dims.len() {
        let ctr = ctx
            .ctr_set
            .gen_fail(format!("reduction dimension {dim} is out of range"), source);
        return interp.unit(ctx.require(ctr).with_ret(ShValue::Undef));
    }
    let mut out = dims;
    out.remove(dim as usize);
    let (ctx, value) = alloc_tensor(ctx, ExpShape::constant(out, source));
    interp.unit(ctx.with_ret(value))
}

/// Concatenate two tensors along `dim`; every other dimension must agree.
fn concat(
    interp: &Interp,
    ctx: Context<()>,
    args: LibCallArgs,
    source: Source,
) -> ContextSet<ShValue> {
    let a = arg_named(&args, "a", 0).cloned();
    let b = arg_named(&args, "b", 1).cloned();
    let dim = arg_named(&args, "dim", 2)
        .and_then(|v| match interp.deref(&ctx, v) {
            ShValue::Int(n) => simplify_num(&n).as_const_int(),
            _ => None,
        })
        .unwrap_or(0);
    let sa = a.as_ref().and_then(|v| tensor_shape(interp, &ctx, v));
    let sb = b.as_ref().and_then(|v| tensor_shape(interp, &ctx, v));
    let (Some(sa), Some(sb)) = (sa, sb) else {
        let (ctx, value) = ctx.warn_tensor("concatenation of non-tensors", source);
        return interp.unit(ctx.with_ret(value));
    };
    let da = ctx.ctr_set.get_cached_shape(&simplify_shape(&sa));
    let db = ctx.ctr_set.get_cached_shape(&simplify_shape(&sb));
    let (Some(da), Some(db)) = (da, db) else {
        let (ctx, value) = ctx.warn_tensor("concatenation over unknown ranks", source);
        return interp.unit(ctx.with_ret(value));
    };
    if da.len() != db.len() || dim < 0 || dim as usize >= da.len() {
        let ctr = ctx
            .ctr_set
            .gen_fail("cannot concatenate: rank mismatch", source);
        return interp.unit(ctx.require(ctr).with_ret(ShValue::Undef));
    }
    let mut ctx = ctx;
    for i in 0..da.len() {
        if i != dim as usize {
            ctx = require_dim_eq(
                ctx,
                &da[i],
                &db[i],
                "cannot concatenate: dimension mismatch",
                source,
            );
        }
    }
    let joined = simplify_num(&ExpNum::add(
        da[dim as usize].clone(),
        db[dim as usize].clone(),
        source,
    ));
    let mut out = da;
    out[dim as usize] = joined;
    let (ctx, value) = alloc_tensor(ctx, ExpShape::constant(out, source));
    interp.unit(ctx.with_ret(value))
}

/// Reshape preserves the element count.
fn reshape(
    interp: &Interp,
    ctx: Context<()>,
    args: LibCallArgs,
    source: Source,
) -> ContextSet<ShValue> {
    let target = arg_named(&args, "a", 0).cloned();
    let Some(old_shape) = target.as_ref().and_then(|v| tensor_shape(interp, &ctx, v)) else {
        let (ctx, value) = ctx.warn_tensor("reshape of a non-tensor", source);
        return interp.unit(ctx.with_ret(value));
    };
    let new_shape = arg_named(&args, "shape", 1)
        .and_then(|v| shape_from_value(interp, &ctx, v, source));
    let Some(new_shape) = new_shape else {
        let (ctx, value) = ctx.warn_tensor("reshape target shape is opaque", source);
        return interp.unit(ctx.with_ret(value));
    };
    let ctr = ctx.ctr_set.gen_equality(
        SymExp::Num(ExpNum::numel(old_shape, source)),
        SymExp::Num(ExpNum::numel(new_shape.clone(), source)),
        Some("cannot reshape: element count mismatch".into()),
        source,
    );
    let ctx = ctx.require(ctr);
    let (ctx, value) = alloc_tensor(ctx, new_shape);
    interp.unit(ctx.with_ret(value))
}
