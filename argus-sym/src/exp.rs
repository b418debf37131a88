//! The symbolic expression algebra: numbers, booleans, strings and tensor
//! shapes built by reference to symbols.
//!
//! Nodes are immutable and `Rc`-shared; forked paths hold the same subtrees.
//! Equality is structural and deliberately ignores source positions, so two
//! syntactically identical expressions from different program points compare
//! equal (the immediate-satisfiability checker relies on this).

use std::fmt;
use std::rc::Rc;

use argus_ir::Source;

use crate::symbol::Symbol;

pub type NumRef = Rc<ExpNum>;
pub type BoolRef = Rc<ExpBool>;
pub type StrRef = Rc<ExpString>;
pub type ShapeRef = Rc<ExpShape>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumUop {
    Neg,
    Floor,
    Ceil,
    Abs,
}

impl NumUop {
    fn name(&self) -> &'static str {
        match self {
            NumUop::Neg => "-",
            NumUop::Floor => "floor",
            NumUop::Ceil => "ceil",
            NumUop::Abs => "abs",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumBop {
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Mod,
}

impl NumBop {
    fn symbol(&self) -> &'static str {
        match self {
            NumBop::Add => "+",
            NumBop::Sub => "-",
            NumBop::Mul => "*",
            NumBop::TrueDiv => "/",
            NumBop::FloorDiv => "//",
            NumBop::Mod => "%",
        }
    }
}

#[derive(Clone, Debug)]
pub enum ExpNum {
    Const {
        value: f64,
        source: Source,
    },
    Sym(Symbol),
    Uop {
        op: NumUop,
        operand: NumRef,
        source: Source,
    },
    Bop {
        op: NumBop,
        left: NumRef,
        right: NumRef,
        source: Source,
    },
    Max {
        operands: Vec<NumRef>,
        source: Source,
    },
    Min {
        operands: Vec<NumRef>,
        source: Source,
    },
    /// One dimension of a shape expression.
    Index {
        shape: ShapeRef,
        index: NumRef,
        source: Source,
    },
    /// Total element count of a shape expression.
    Numel {
        shape: ShapeRef,
        source: Source,
    },
}

impl ExpNum {
    pub fn constant(value: f64, source: Source) -> NumRef {
        Rc::new(ExpNum::Const { value, source })
    }

    pub fn from_symbol(sym: Symbol) -> NumRef {
        Rc::new(ExpNum::Sym(sym))
    }

    pub fn uop(op: NumUop, operand: NumRef, source: Source) -> NumRef {
        Rc::new(ExpNum::Uop { op, operand, source })
    }

    pub fn bop(op: NumBop, left: NumRef, right: NumRef, source: Source) -> NumRef {
        Rc::new(ExpNum::Bop {
            op,
            left,
            right,
            source,
        })
    }

    pub fn add(left: NumRef, right: NumRef, source: Source) -> NumRef {
        ExpNum::bop(NumBop::Add, left, right, source)
    }

    pub fn sub(left: NumRef, right: NumRef, source: Source) -> NumRef {
        ExpNum::bop(NumBop::Sub, left, right, source)
    }

    pub fn mul(left: NumRef, right: NumRef, source: Source) -> NumRef {
        ExpNum::bop(NumBop::Mul, left, right, source)
    }

    pub fn max_of(operands: Vec<NumRef>, source: Source) -> NumRef {
        Rc::new(ExpNum::Max { operands, source })
    }

    pub fn min_of(operands: Vec<NumRef>, source: Source) -> NumRef {
        Rc::new(ExpNum::Min { operands, source })
    }

    pub fn index(shape: ShapeRef, index: NumRef, source: Source) -> NumRef {
        Rc::new(ExpNum::Index {
            shape,
            index,
            source,
        })
    }

    pub fn numel(shape: ShapeRef, source: Source) -> NumRef {
        Rc::new(ExpNum::Numel { shape, source })
    }

    pub fn source(&self) -> Source {
        match self {
            ExpNum::Const { source, .. }
            | ExpNum::Uop { source, .. }
            | ExpNum::Bop { source, .. }
            | ExpNum::Max { source, .. }
            | ExpNum::Min { source, .. }
            | ExpNum::Index { source, .. }
            | ExpNum::Numel { source, .. } => *source,
            ExpNum::Sym(sym) => sym.source,
        }
    }

    pub fn as_const(&self) -> Option<f64> {
        match self {
            ExpNum::Const { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// The constant integer value, if this node is an integral constant.
    pub fn as_const_int(&self) -> Option<i64> {
        match self.as_const() {
            Some(v) if v.fract() == 0.0 && v.is_finite() => Some(v as i64),
            _ => None,
        }
    }
}

impl PartialEq for ExpNum {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ExpNum::Const { value: a, .. }, ExpNum::Const { value: b, .. }) => a == b,
            (ExpNum::Sym(a), ExpNum::Sym(b)) => a == b,
            (
                ExpNum::Uop { op: a, operand: x, .. },
                ExpNum::Uop { op: b, operand: y, .. },
            ) => a == b && x == y,
            (
                ExpNum::Bop {
                    op: a,
                    left: al,
                    right: ar,
                    ..
                },
                ExpNum::Bop {
                    op: b,
                    left: bl,
                    right: br,
                    ..
                },
            ) => a == b && al == bl && ar == br,
            (ExpNum::Max { operands: a, .. }, ExpNum::Max { operands: b, .. })
            | (ExpNum::Min { operands: a, .. }, ExpNum::Min { operands: b, .. }) => a == b,
            (
                ExpNum::Index {
                    shape: asp,
                    index: ai,
                    ..
                },
                ExpNum::Index {
                    shape: bsp,
                    index: bi,
                    ..
                },
            ) => asp == bsp && ai == bi,
            (ExpNum::Numel { shape: a, .. }, ExpNum::Numel { shape: b, .. }) => a == b,
            _ => false,
        }
    }
}

#[derive(Clone, Debug)]
pub enum ExpShape {
    Const {
        dims: Vec<NumRef>,
        source: Source,
    },
    Sym(Symbol),
    /// `base` with dimension `axis` replaced by `dim`.
    Set {
        base: ShapeRef,
        axis: usize,
        dim: NumRef,
        source: Source,
    },
    Slice {
        base: ShapeRef,
        start: NumRef,
        end: NumRef,
        source: Source,
    },
    Concat {
        left: ShapeRef,
        right: ShapeRef,
        source: Source,
    },
    Broadcast {
        left: ShapeRef,
        right: ShapeRef,
        source: Source,
    },
}

impl ExpShape {
    pub fn constant(dims: Vec<NumRef>, source: Source) -> ShapeRef {
        Rc::new(ExpShape::Const { dims, source })
    }

    pub fn from_ints(dims: &[i64], source: Source) -> ShapeRef {
        ExpShape::constant(
            dims.iter()
                .map(|d| ExpNum::constant(*d as f64, source))
                .collect(),
            source,
        )
    }

    pub fn from_symbol(sym: Symbol) -> ShapeRef {
        Rc::new(ExpShape::Sym(sym))
    }

    pub fn set(base: ShapeRef, axis: usize, dim: NumRef, source: Source) -> ShapeRef {
        Rc::new(ExpShape::Set {
            base,
            axis,
            dim,
            source,
        })
    }

    pub fn slice(base: ShapeRef, start: NumRef, end: NumRef, source: Source) -> ShapeRef {
        Rc::new(ExpShape::Slice {
            base,
            start,
            end,
            source,
        })
    }

    pub fn concat(left: ShapeRef, right: ShapeRef, source: Source) -> ShapeRef {
        Rc::new(ExpShape::Concat {
            left,
            right,
            source,
        })
    }

    pub fn broadcast(left: ShapeRef, right: ShapeRef, source: Source) -> ShapeRef {
        Rc::new(ExpShape::Broadcast {
            left,
            right,
            source,
        })
    }

    pub fn source(&self) -> Source {
        match self {
            ExpShape::Const { source, .. }
            | ExpShape::Set { source, .. }
            | ExpShape::Slice { source, .. }
            | ExpShape::Concat { source, .. }
            | ExpShape::Broadcast { source, .. } => *source,
            ExpShape::Sym(sym) => sym.source,
        }
    }

    /// Statically-known rank, when the structure decides it.
    pub fn rank(&self) -> Option<usize> {
        match self {
            ExpShape::Const { dims, .. } => Some(dims.len()),
            ExpShape::Sym(_) => None,
            ExpShape::Set { base, .. } => base.rank(),
            ExpShape::Slice { start, end, .. } => {
                let s = start.as_const_int()?;
                let e = end.as_const_int()?;
                if e >= s { Some((e - s) as usize) } else { None }
            }
            ExpShape::Concat { left, right, .. } => Some(left.rank()? + right.rank()?),
            ExpShape::Broadcast { left, right, .. } => Some(left.rank()?.max(right.rank()?)),
        }
    }

    pub fn as_const_dims(&self) -> Option<&[NumRef]> {
        match self {
            ExpShape::Const { dims, .. } => Some(dims),
            _ => None,
        }
    }
}

impl PartialEq for ExpShape {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ExpShape::Const { dims: a, .. }, ExpShape::Const { dims: b, .. }) => a == b,
            (ExpShape::Sym(a), ExpShape::Sym(b)) => a == b,
            (
                ExpShape::Set {
                    base: ab,
                    axis: aa,
                    dim: ad,
                    ..
                },
                ExpShape::Set {
                    base: bb,
                    axis: ba,
                    dim: bd,
                    ..
                },
            ) => aa == ba && ab == bb && ad == bd,
            (
                ExpShape::Slice {
                    base: ab,
                    start: as_,
                    end: ae,
                    ..
                },
                ExpShape::Slice {
                    base: bb,
                    start: bs,
                    end: be,
                    ..
                },
            ) => ab == bb && as_ == bs && ae == be,
            (
                ExpShape::Concat { left: al, right: ar, .. },
                ExpShape::Concat { left: bl, right: br, .. },
            )
            | (
                ExpShape::Broadcast { left: al, right: ar, .. },
                ExpShape::Broadcast { left: bl, right: br, .. },
            ) => al == bl && ar == br,
            _ => false,
        }
    }
}

#[derive(Clone, Debug)]
pub enum ExpString {
    Const {
        value: Rc<str>,
        source: Source,
    },
    Sym(Symbol),
    Concat {
        left: StrRef,
        right: StrRef,
        source: Source,
    },
}

impl ExpString {
    pub fn constant(value: impl Into<Rc<str>>, source: Source) -> StrRef {
        Rc::new(ExpString::Const {
            value: value.into(),
            source,
        })
    }

    pub fn from_symbol(sym: Symbol) -> StrRef {
        Rc::new(ExpString::Sym(sym))
    }

    pub fn concat(left: StrRef, right: StrRef, source: Source) -> StrRef {
        Rc::new(ExpString::Concat {
            left,
            right,
            source,
        })
    }

    pub fn source(&self) -> Source {
        match self {
            ExpString::Const { source, .. } | ExpString::Concat { source, .. } => *source,
            ExpString::Sym(sym) => sym.source,
        }
    }

    pub fn as_const(&self) -> Option<&Rc<str>> {
        match self {
            ExpString::Const { value, .. } => Some(value),
            _ => None,
        }
    }
}

impl PartialEq for ExpString {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ExpString::Const { value: a, .. }, ExpString::Const { value: b, .. }) => a == b,
            (ExpString::Sym(a), ExpString::Sym(b)) => a == b,
            (
                ExpString::Concat { left: al, right: ar, .. },
                ExpString::Concat { left: bl, right: br, .. },
            ) => al == bl && ar == br,
            _ => false,
        }
    }
}

#[derive(Clone, Debug)]
pub enum ExpBool {
    Const {
        value: bool,
        source: Source,
    },
    Sym(Symbol),
    Equal {
        left: SymExp,
        right: SymExp,
        source: Source,
    },
    NotEqual {
        left: SymExp,
        right: SymExp,
        source: Source,
    },
    LessThan {
        left: NumRef,
        right: NumRef,
        source: Source,
    },
    LessThanOrEqual {
        left: NumRef,
        right: NumRef,
        source: Source,
    },
    Not {
        operand: BoolRef,
        source: Source,
    },
    And {
        left: BoolRef,
        right: BoolRef,
        source: Source,
    },
    Or {
        left: BoolRef,
        right: BoolRef,
        source: Source,
    },
}

impl ExpBool {
    pub fn constant(value: bool, source: Source) -> BoolRef {
        Rc::new(ExpBool::Const { value, source })
    }

    pub fn from_symbol(sym: Symbol) -> BoolRef {
        Rc::new(ExpBool::Sym(sym))
    }

    pub fn equal(left: SymExp, right: SymExp, source: Source) -> BoolRef {
        Rc::new(ExpBool::Equal {
            left,
            right,
            source,
        })
    }

    pub fn not_equal(left: SymExp, right: SymExp, source: Source) -> BoolRef {
        Rc::new(ExpBool::NotEqual {
            left,
            right,
            source,
        })
    }

    pub fn less_than(left: NumRef, right: NumRef, source: Source) -> BoolRef {
        Rc::new(ExpBool::LessThan {
            left,
            right,
            source,
        })
    }

    pub fn less_than_or_equal(left: NumRef, right: NumRef, source: Source) -> BoolRef {
        Rc::new(ExpBool::LessThanOrEqual {
            left,
            right,
            source,
        })
    }

    pub fn not(operand: BoolRef, source: Source) -> BoolRef {
        Rc::new(ExpBool::Not { operand, source })
    }

    pub fn and(left: BoolRef, right: BoolRef, source: Source) -> BoolRef {
        Rc::new(ExpBool::And {
            left,
            right,
            source,
        })
    }

    pub fn or(left: BoolRef, right: BoolRef, source: Source) -> BoolRef {
        Rc::new(ExpBool::Or {
            left,
            right,
            source,
        })
    }

    pub fn source(&self) -> Source {
        match self {
            ExpBool::Const { source, .. }
            | ExpBool::Equal { source, .. }
            | ExpBool::NotEqual { source, .. }
            | ExpBool::LessThan { source, .. }
            | ExpBool::LessThanOrEqual { source, .. }
            | ExpBool::Not { source, .. }
            | ExpBool::And { source, .. }
            | ExpBool::Or { source, .. } => *source,
            ExpBool::Sym(sym) => sym.source,
        }
    }

    pub fn as_const(&self) -> Option<bool> {
        match self {
            ExpBool::Const { value, .. } => Some(*value),
            _ => None,
        }
    }
}

impl PartialEq for ExpBool {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ExpBool::Const { value: a, .. }, ExpBool::Const { value: b, .. }) => a == b,
            (ExpBool::Sym(a), ExpBool::Sym(b)) => a == b,
            (
                ExpBool::Equal { left: al, right: ar, .. },
                ExpBool::Equal { left: bl, right: br, .. },
            )
            | (
                ExpBool::NotEqual { left: al, right: ar, .. },
                ExpBool::NotEqual { left: bl, right: br, .. },
            ) => al == bl && ar == br,
            (
                ExpBool::LessThan { left: al, right: ar, .. },
                ExpBool::LessThan { left: bl, right: br, .. },
            )
            | (
                ExpBool::LessThanOrEqual { left: al, right: ar, .. },
                ExpBool::LessThanOrEqual { left: bl, right: br, .. },
            ) => al == bl && ar == br,
            (ExpBool::Not { operand: a, .. }, ExpBool::Not { operand: b, .. }) => a == b,
            (
                ExpBool::And { left: al, right: ar, .. },
                ExpBool::And { left: bl, right: br, .. },
            )
            | (
                ExpBool::Or { left: al, right: ar, .. },
                ExpBool::Or { left: bl, right: br, .. },
            ) => al == bl && ar == br,
            _ => false,
        }
    }
}

/// A value of any symbolic sort.
#[derive(Clone, Debug, PartialEq)]
pub enum SymExp {
    Num(NumRef),
    Shape(ShapeRef),
    Str(StrRef),
    Bool(BoolRef),
}

impl SymExp {
    pub fn sort_name(&self) -> &'static str {
        match self {
            SymExp::Num(_) => "num",
            SymExp::Shape(_) => "shape",
            SymExp::Str(_) => "string",
            SymExp::Bool(_) => "bool",
        }
    }

    pub fn source(&self) -> Source {
        match self {
            SymExp::Num(e) => e.source(),
            SymExp::Shape(e) => e.source(),
            SymExp::Str(e) => e.source(),
            SymExp::Bool(e) => e.source(),
        }
    }
}

// ----- display -----

fn fmt_f64(value: f64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        write!(f, "{}", value as i64)
    } else {
        write!(f, "{value}")
    }
}

impl fmt::Display for ExpNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpNum::Const { value, .. } => fmt_f64(*value, f),
            ExpNum::Sym(sym) => write!(f, "{sym}"),
            ExpNum::Uop { op, operand, .. } => match op {
                NumUop::Neg => write!(f, "-{operand}"),
                _ => write!(f, "{}({operand})", op.name()),
            },
            ExpNum::Bop { op, left, right, .. } => {
                write!(f, "({left} {} {right})", op.symbol())
            }
            ExpNum::Max { operands, .. } => write_call(f, "max", operands),
            ExpNum::Min { operands, .. } => write_call(f, "min", operands),
            ExpNum::Index { shape, index, .. } => write!(f, "{shape}[{index}]"),
            ExpNum::Numel { shape, .. } => write!(f, "numel({shape})"),
        }
    }
}

fn write_call(f: &mut fmt::Formatter<'_>, name: &str, operands: &[NumRef]) -> fmt::Result {
    write!(f, "{name}(")?;
    for (i, op) in operands.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{op}")?;
    }
    write!(f, ")")
}

impl fmt::Display for ExpShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpShape::Const { dims, .. } => {
                write!(f, "[")?;
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{d}")?;
                }
                write!(f, "]")
            }
            ExpShape::Sym(sym) => write!(f, "{sym}"),
            ExpShape::Set { base, axis, dim, .. } => write!(f, "set({base}, {axis}, {dim})"),
            ExpShape::Slice { base, start, end, .. } => write!(f, "{base}[{start}:{end}]"),
            ExpShape::Concat { left, right, .. } => write!(f, "concat({left}, {right})"),
            ExpShape::Broadcast { left, right, .. } => write!(f, "broadcast({left}, {right})"),
        }
    }
}

impl fmt::Display for ExpString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpString::Const { value, .. } => write!(f, "{value:?}"),
            ExpString::Sym(sym) => write!(f, "{sym}"),
            ExpString::Concat { left, right, .. } => write!(f, "({left} ++ {right})"),
        }
    }
}

impl fmt::Display for ExpBool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpBool::Const { value, .. } => write!(f, "{value}"),
            ExpBool::Sym(sym) => write!(f, "{sym}"),
            ExpBool::Equal { left, right, .. } => write!(f, "({left} == {right})"),
            ExpBool::NotEqual { left, right, .. } => write!(f, "({left} != {right})"),
            ExpBool::LessThan { left, right, .. } => write!(f, "({left} < {right})"),
            ExpBool::LessThanOrEqual { left, right, .. } => write!(f, "({left} <= {right})"),
            ExpBool::Not { operand, .. } => write!(f, "!{operand}"),
            ExpBool::And { left, right, .. } => write!(f, "({left} and {right})"),
            ExpBool::Or { left, right, .. } => write!(f, "({left} or {right})"),
        }
    }
}

impl fmt::Display for SymExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymExp::Num(e) => write!(f, "{e}"),
            SymExp::Shape(e) => write!(f, "{e}"),
            SymExp::Str(e) => write!(f, "{e}"),
            SymExp::Bool(e) => write!(f, "{e}"),
        }
    }
}
