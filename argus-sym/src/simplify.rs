//! Structural simplification: bottom-up constant folding applied before
//! equality checks and range queries.
//!
//! Folding is best-effort and never widens: an expression that cannot be
//! folded is returned as-is (with simplified children). `Broadcast` shapes
//! are intentionally left unfolded; broadcasting is resolved dimension by
//! dimension against the constraint caches instead.

use std::rc::Rc;

use crate::exp::{
    BoolRef, ExpBool, ExpNum, ExpShape, ExpString, NumBop, NumRef, NumUop, ShapeRef, StrRef,
    SymExp,
};

pub fn simplify_num(exp: &NumRef) -> NumRef {
    match &**exp {
        ExpNum::Const { .. } | ExpNum::Sym(_) => exp.clone(),
        ExpNum::Uop { op, operand, source } => {
            let operand = simplify_num(operand);
            if let Some(v) = operand.as_const() {
                let folded = match op {
                    NumUop::Neg => -v,
                    NumUop::Floor => v.floor(),
                    NumUop::Ceil => v.ceil(),
                    NumUop::Abs => v.abs(),
                };
                return ExpNum::constant(folded, *source);
            }
            if *op == NumUop::Neg {
                if let ExpNum::Uop {
                    op: NumUop::Neg,
                    operand: inner,
                    ..
                } = &*operand
                {
                    return inner.clone();
                }
            }
            ExpNum::uop(*op, operand, *source)
        }
        ExpNum::Bop {
            op,
            left,
            right,
            source,
        } => {
            let left = simplify_num(left);
            let right = simplify_num(right);
            if let (Some(a), Some(b)) = (left.as_const(), right.as_const()) {
                let folded = match op {
                    NumBop::Add => Some(a + b),
                    NumBop::Sub => Some(a - b),
                    NumBop::Mul => Some(a * b),
                    NumBop::TrueDiv if b != 0.0 => Some(a / b),
                    NumBop::FloorDiv if b != 0.0 => Some((a / b).floor()),
                    NumBop::Mod if b != 0.0 => Some(a.rem_euclid(b)),
                    _ => None,
                };
                if let Some(v) = folded {
                    return ExpNum::constant(v, *source);
                }
            }
            // identity and cancellation folds
            match op {
                NumBop::Add if right.as_const() == Some(0.0) => return left,
                NumBop::Add if left.as_const() == Some(0.0) => return right,
                NumBop::Sub if right.as_const() == Some(0.0) => return left,
                NumBop::Sub if left == right => {
                    return ExpNum::constant(0.0, *source);
                }
                NumBop::Sub => {
                    // (a + b) - a => b, (a + b) - b => a
                    if let ExpNum::Bop {
                        op: NumBop::Add,
                        left: p,
                        right: q,
                        ..
                    } = &*left
                    {
                        if **p == *right {
                            return q.clone();
                        }
                        if **q == *right {
                            return p.clone();
                        }
                    }
                }
                NumBop::Mul if right.as_const() == Some(1.0) => return left,
                NumBop::Mul if left.as_const() == Some(1.0) => return right,
                NumBop::Mul
                    if left.as_const() == Some(0.0) || right.as_const() == Some(0.0) =>
                {
                    return ExpNum::constant(0.0, *source);
                }
                NumBop::TrueDiv | NumBop::FloorDiv if right.as_const() == Some(1.0) => {
                    return left;
                }
                _ => {}
            }
            ExpNum::bop(*op, left, right, *source)
        }
        ExpNum::Max { operands, source } => fold_minmax(operands, *source, true),
        ExpNum::Min { operands, source } => fold_minmax(operands, *source, false),
        ExpNum::Index {
            shape,
            index,
            source,
        } => {
            let shape = simplify_shape(shape);
            let index = simplify_num(index);
            if let (Some(dims), Some(i)) = (shape.as_const_dims(), index.as_const_int()) {
                if i >= 0 && (i as usize) < dims.len() {
                    return dims[i as usize].clone();
                }
            }
            ExpNum::index(shape, index, *source)
        }
        ExpNum::Numel { shape, source } => {
            let shape = simplify_shape(shape);
            if let Some(dims) = shape.as_const_dims() {
                let consts: Option<Vec<f64>> = dims.iter().map(|d| d.as_const()).collect();
                if let Some(consts) = consts {
                    return ExpNum::constant(consts.iter().product(), *source);
                }
            }
            ExpNum::numel(shape, *source)
        }
    }
}

fn fold_minmax(operands: &[NumRef], source: argus_ir::Source, is_max: bool) -> NumRef {
    let operands: Vec<NumRef> = operands.iter().map(simplify_num).collect();
    if operands.len() == 1 {
        return operands.into_iter().next().expect("nonempty");
    }
    let consts: Option<Vec<f64>> = operands.iter().map(|o| o.as_const()).collect();
    if let Some(consts) = consts {
        let folded = if is_max {
            consts.into_iter().fold(f64::NEG_INFINITY, f64::max)
        } else {
            consts.into_iter().fold(f64::INFINITY, f64::min)
        };
        return ExpNum::constant(folded, source);
    }
    if is_max {
        ExpNum::max_of(operands, source)
    } else {
        ExpNum::min_of(operands, source)
    }
}

pub fn simplify_shape(exp: &ShapeRef) -> ShapeRef {
    match &**exp {
        ExpShape::Const { dims, source } => {
            ExpShape::constant(dims.iter().map(simplify_num).collect(), *source)
        }
        ExpShape::Sym(_) => exp.clone(),
        ExpShape::Set {
            base,
            axis,
            dim,
            source,
        } => {
            let base = simplify_shape(base);
            let dim = simplify_num(dim);
            if let Some(dims) = base.as_const_dims() {
                if *axis < dims.len() {
                    let mut dims = dims.to_vec();
                    dims[*axis] = dim;
                    return ExpShape::constant(dims, *source);
                }
            }
            ExpShape::set(base, *axis, dim, *source)
        }
        ExpShape::Slice {
            base,
            start,
            end,
            source,
        } => {
            let base = simplify_shape(base);
            let start = simplify_num(start);
            let end = simplify_num(end);
            if let (Some(dims), Some(s), Some(e)) =
                (base.as_const_dims(), start.as_const_int(), end.as_const_int())
            {
                if 0 <= s && s <= e && (e as usize) <= dims.len() {
                    return ExpShape::constant(dims[s as usize..e as usize].to_vec(), *source);
                }
            }
            ExpShape::slice(base, start, end, *source)
        }
        ExpShape::Concat {
            left,
            right,
            source,
        } => {
            let left = simplify_shape(left);
            let right = simplify_shape(right);
            if let (Some(l), Some(r)) = (left.as_const_dims(), right.as_const_dims()) {
                let mut dims = l.to_vec();
                dims.extend_from_slice(r);
                return ExpShape::constant(dims, *source);
            }
            ExpShape::concat(left, right, *source)
        }
        ExpShape::Broadcast {
            left,
            right,
            source,
        } => ExpShape::broadcast(simplify_shape(left), simplify_shape(right), *source),
    }
}

pub fn simplify_str(exp: &StrRef) -> StrRef {
    match &**exp {
        ExpString::Const { .. } | ExpString::Sym(_) => exp.clone(),
        ExpString::Concat {
            left,
            right,
            source,
        } => {
            let left = simplify_str(left);
            let right = simplify_str(right);
            if let (Some(a), Some(b)) = (left.as_const(), right.as_const()) {
                return ExpString::constant(format!("{a}{b}"), *source);
            }
            ExpString::concat(left, right, *source)
        }
    }
}

pub fn simplify_bool(exp: &BoolRef) -> BoolRef {
    match &**exp {
        ExpBool::Const { .. } | ExpBool::Sym(_) => exp.clone(),
        ExpBool::Equal {
            left,
            right,
            source,
        } => {
            let left = simplify_exp(left);
            let right = simplify_exp(right);
            if left == right {
                return ExpBool::constant(true, *source);
            }
            if let (SymExp::Num(a), SymExp::Num(b)) = (&left, &right) {
                if let (Some(a), Some(b)) = (a.as_const(), b.as_const()) {
                    return ExpBool::constant(a == b, *source);
                }
            }
            if let (SymExp::Str(a), SymExp::Str(b)) = (&left, &right) {
                if let (Some(a), Some(b)) = (a.as_const(), b.as_const()) {
                    return ExpBool::constant(a == b, *source);
                }
            }
            ExpBool::equal(left, right, *source)
        }
        ExpBool::NotEqual {
            left,
            right,
            source,
        } => {
            let inner = simplify_bool(&ExpBool::equal(left.clone(), right.clone(), *source));
            match inner.as_const() {
                Some(v) => ExpBool::constant(!v, *source),
                None => {
                    if let ExpBool::Equal { left, right, .. } = &*inner {
                        ExpBool::not_equal(left.clone(), right.clone(), *source)
                    } else {
                        ExpBool::not(inner, *source)
                    }
                }
            }
        }
        ExpBool::LessThan {
            left,
            right,
            source,
        } => {
            let left = simplify_num(left);
            let right = simplify_num(right);
            if let (Some(a), Some(b)) = (left.as_const(), right.as_const()) {
                return ExpBool::constant(a < b, *source);
            }
            ExpBool::less_than(left, right, *source)
        }
        ExpBool::LessThanOrEqual {
            left,
            right,
            source,
        } => {
            let left = simplify_num(left);
            let right = simplify_num(right);
            if let (Some(a), Some(b)) = (left.as_const(), right.as_const()) {
                return ExpBool::constant(a <= b, *source);
            }
            if left == right {
                return ExpBool::constant(true, *source);
            }
            ExpBool::less_than_or_equal(left, right, *source)
        }
        ExpBool::Not { operand, source } => {
            let operand = simplify_bool(operand);
            match &*operand {
                ExpBool::Const { value, .. } => ExpBool::constant(!value, *source),
                ExpBool::Not { operand: inner, .. } => inner.clone(),
                _ => ExpBool::not(operand, *source),
            }
        }
        ExpBool::And {
            left,
            right,
            source,
        } => {
            let left = simplify_bool(left);
            let right = simplify_bool(right);
            match (left.as_const(), right.as_const()) {
                (Some(false), _) | (_, Some(false)) => ExpBool::constant(false, *source),
                (Some(true), _) => right,
                (_, Some(true)) => left,
                _ => ExpBool::and(left, right, *source),
            }
        }
        ExpBool::Or {
            left,
            right,
            source,
        } => {
            let left = simplify_bool(left);
            let right = simplify_bool(right);
            match (left.as_const(), right.as_const()) {
                (Some(true), _) | (_, Some(true)) => ExpBool::constant(true, *source),
                (Some(false), _) => right,
                (_, Some(false)) => left,
                _ => ExpBool::or(left, right, *source),
            }
        }
    }
}

pub fn simplify_exp(exp: &SymExp) -> SymExp {
    match exp {
        SymExp::Num(e) => SymExp::Num(simplify_num(e)),
        SymExp::Shape(e) => SymExp::Shape(simplify_shape(e)),
        SymExp::Str(e) => SymExp::Str(simplify_str(e)),
        SymExp::Bool(e) => SymExp::Bool(simplify_bool(e)),
    }
}

/// Does the expression mention any symbol with id at or above `watermark`?
/// The pure-call pruner uses this to restrict comparisons to pre-call terms.
pub fn mentions_sym_above(exp: &SymExp, watermark: u32) -> bool {
    exp_mentions_where(exp, &|id| id >= watermark)
}

/// Does the expression mention any symbol that existed before `watermark`?
pub fn mentions_sym_below(exp: &SymExp, watermark: u32) -> bool {
    exp_mentions_where(exp, &|id| id < watermark)
}

pub fn exp_mentions_where(exp: &SymExp, pred: &dyn Fn(u32) -> bool) -> bool {
    match exp {
        SymExp::Num(e) => num_mentions_where(e, pred),
        SymExp::Shape(e) => shape_mentions_where(e, pred),
        SymExp::Str(e) => str_mentions_where(e, pred),
        SymExp::Bool(e) => bool_mentions_where(e, pred),
    }
}

pub fn num_mentions_where(exp: &Rc<ExpNum>, pred: &dyn Fn(u32) -> bool) -> bool {
    match &**exp {
        ExpNum::Const { .. } => false,
        ExpNum::Sym(sym) => pred(sym.id.0),
        ExpNum::Uop { operand, .. } => num_mentions_where(operand, pred),
        ExpNum::Bop { left, right, .. } => {
            num_mentions_where(left, pred) || num_mentions_where(right, pred)
        }
        ExpNum::Max { operands, .. } | ExpNum::Min { operands, .. } => {
            operands.iter().any(|o| num_mentions_where(o, pred))
        }
        ExpNum::Index { shape, index, .. } => {
            shape_mentions_where(shape, pred) || num_mentions_where(index, pred)
        }
        ExpNum::Numel { shape, .. } => shape_mentions_where(shape, pred),
    }
}

pub fn shape_mentions_where(exp: &Rc<ExpShape>, pred: &dyn Fn(u32) -> bool) -> bool {
    match &**exp {
        ExpShape::Const { dims, .. } => dims.iter().any(|d| num_mentions_where(d, pred)),
        ExpShape::Sym(sym) => pred(sym.id.0),
        ExpShape::Set { base, dim, .. } => {
            shape_mentions_where(base, pred) || num_mentions_where(dim, pred)
        }
        ExpShape::Slice {
            base, start, end, ..
        } => {
            shape_mentions_where(base, pred)
                || num_mentions_where(start, pred)
                || num_mentions_where(end, pred)
        }
        ExpShape::Concat { left, right, .. } | ExpShape::Broadcast { left, right, .. } => {
            shape_mentions_where(left, pred) || shape_mentions_where(right, pred)
        }
    }
}

pub fn str_mentions_where(exp: &Rc<ExpString>, pred: &dyn Fn(u32) -> bool) -> bool {
    match &**exp {
        ExpString::Const { .. } => false,
        ExpString::Sym(sym) => pred(sym.id.0),
        ExpString::Concat { left, right, .. } => {
            str_mentions_where(left, pred) || str_mentions_where(right, pred)
        }
    }
}

pub fn bool_mentions_where(exp: &Rc<ExpBool>, pred: &dyn Fn(u32) -> bool) -> bool {
    match &**exp {
        ExpBool::Const { .. } => false,
        ExpBool::Sym(sym) => pred(sym.id.0),
        ExpBool::Equal { left, right, .. } | ExpBool::NotEqual { left, right, .. } => {
            exp_mentions_where(left, pred) || exp_mentions_where(right, pred)
        }
        ExpBool::LessThan { left, right, .. } | ExpBool::LessThanOrEqual { left, right, .. } => {
            num_mentions_where(left, pred) || num_mentions_where(right, pred)
        }
        ExpBool::Not { operand, .. } => bool_mentions_where(operand, pred),
        ExpBool::And { left, right, .. } | ExpBool::Or { left, right, .. } => {
            bool_mentions_where(left, pred) || bool_mentions_where(right, pred)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_ir::Source;

    fn c(v: f64) -> NumRef {
        ExpNum::constant(v, Source::Unknown)
    }

    #[test]
    fn folds_constant_arithmetic() {
        let e = ExpNum::add(ExpNum::mul(c(3.0), c(4.0), Source::Unknown), c(1.0), Source::Unknown);
        assert_eq!(simplify_num(&e).as_const(), Some(13.0));
    }

    #[test]
    fn folds_identities() {
        let ids = crate::symbol::IdManager::new();
        let x = ExpNum::from_symbol(ids.fresh_symbol(
            crate::symbol::SymKind::Int,
            "x",
            Source::Unknown,
        ));
        let e = ExpNum::add(x.clone(), c(0.0), Source::Unknown);
        assert_eq!(simplify_num(&e), x);
        let z = ExpNum::mul(x, c(0.0), Source::Unknown);
        assert_eq!(simplify_num(&z).as_const(), Some(0.0));
    }

    #[test]
    fn folds_const_shape_numel_and_index() {
        let shape = ExpShape::from_ints(&[3, 4], Source::Unknown);
        let numel = ExpNum::numel(shape.clone(), Source::Unknown);
        assert_eq!(simplify_num(&numel).as_const(), Some(12.0));
        let dim = ExpNum::index(shape, c(1.0), Source::Unknown);
        assert_eq!(simplify_num(&dim).as_const(), Some(4.0));
    }

    #[test]
    fn equal_on_identical_structure_is_true() {
        let ids = crate::symbol::IdManager::new();
        let x = ExpNum::from_symbol(ids.fresh_symbol(
            crate::symbol::SymKind::Int,
            "x",
            Source::Unknown,
        ));
        let eq = ExpBool::equal(
            SymExp::Num(x.clone()),
            SymExp::Num(x),
            Source::Unknown,
        );
        assert_eq!(simplify_bool(&eq).as_const(), Some(true));
    }

    #[test]
    fn concat_of_const_shapes_folds() {
        let l = ExpShape::from_ints(&[2], Source::Unknown);
        let r = ExpShape::from_ints(&[3, 4], Source::Unknown);
        let cat = ExpShape::concat(l, r, Source::Unknown);
        let folded = simplify_shape(&cat);
        assert_eq!(folded.rank(), Some(3));
        assert!(folded.as_const_dims().is_some());
    }
}
