#![forbid(unsafe_code)]

//! The imperative IR the symbolic engine executes.
//!
//! An external frontend translates Python/PyTorch source into this tree.
//! The engine never interprets positions; it only threads them through to
//! constraints, logs and diagnostics.

use miette::SourceSpan;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub type Span = SourceSpan;

/// An opaque source position. Two interchangeable representations are
/// supported: a span into the host-loaded source, or a `{file_id, span}`
/// pair for reports that outlive the host buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Host(Span),
    External { file_id: u32, span: Span },
    Unknown,
}

impl Source {
    pub fn host(start: usize, len: usize) -> Self {
        Source::Host(SourceSpan::new(start.into(), len))
    }

    pub fn span(&self) -> Option<Span> {
        match self {
            Source::Host(span) | Source::External { span, .. } => Some(*span),
            Source::Unknown => None,
        }
    }
}

impl Default for Source {
    fn default() -> Self {
        Source::Unknown
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
struct SourceRepr {
    #[serde(skip_serializing_if = "Option::is_none")]
    file_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    len: Option<usize>,
}

impl Serialize for Source {
    fn serialize<S: Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        let repr = match self {
            Source::Host(span) => SourceRepr {
                file_id: None,
                start: Some(span.offset()),
                len: Some(span.len()),
            },
            Source::External { file_id, span } => SourceRepr {
                file_id: Some(*file_id),
                start: Some(span.offset()),
                len: Some(span.len()),
            },
            Source::Unknown => SourceRepr::default(),
        };
        repr.serialize(ser)
    }
}

impl<'de> Deserialize<'de> for Source {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let repr = SourceRepr::deserialize(de)?;
        match (repr.file_id, repr.start, repr.len) {
            (None, None, None) => Ok(Source::Unknown),
            (None, Some(start), Some(len)) => Ok(Source::host(start, len)),
            (Some(file_id), Some(start), Some(len)) => Ok(Source::External {
                file_id,
                span: SourceSpan::new(start.into(), len),
            }),
            _ => Err(D::Error::custom("position needs both start and len")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ConstKind {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    Pow,
    TrueDiv,
    FloorDiv,
    Mod,

    Lt,
    Lte,
    Eq,
    Neq,

    And,
    Or,

    Is,
    IsNot,
    In,
    NotIn,
}

impl BinOpKind {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOpKind::Add => "+",
            BinOpKind::Sub => "-",
            BinOpKind::Mul => "*",
            BinOpKind::Pow => "**",
            BinOpKind::TrueDiv => "/",
            BinOpKind::FloorDiv => "//",
            BinOpKind::Mod => "%",
            BinOpKind::Lt => "<",
            BinOpKind::Lte => "<=",
            BinOpKind::Eq => "==",
            BinOpKind::Neq => "!=",
            BinOpKind::And => "and",
            BinOpKind::Or => "or",
            BinOpKind::Is => "is",
            BinOpKind::IsNot => "is not",
            BinOpKind::In => "in",
            BinOpKind::NotIn => "not in",
        }
    }

    /// Dunder method pair consulted for object operands, `(__op__, __rop__)`.
    pub fn dunder(&self) -> Option<(&'static str, &'static str)> {
        match self {
            BinOpKind::Add => Some(("__add__", "__radd__")),
            BinOpKind::Sub => Some(("__sub__", "__rsub__")),
            BinOpKind::Mul => Some(("__mul__", "__rmul__")),
            BinOpKind::Pow => Some(("__pow__", "__rpow__")),
            BinOpKind::TrueDiv => Some(("__truediv__", "__rtruediv__")),
            BinOpKind::FloorDiv => Some(("__floordiv__", "__rfloordiv__")),
            BinOpKind::Mod => Some(("__mod__", "__rmod__")),
            BinOpKind::Eq => Some(("__eq__", "__eq__")),
            BinOpKind::Neq => Some(("__ne__", "__ne__")),
            BinOpKind::Lt => Some(("__lt__", "__gt__")),
            BinOpKind::Lte => Some(("__le__", "__ge__")),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOpKind {
    Neg,
    Not,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Const(ConstKind, Source),
    /// A fresh empty object literal.
    Object(Source),
    Tuple(Vec<Expr>, Source),
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
        source: Source,
    },
    /// Named library intrinsic, dispatched through the external table.
    LibCall {
        name: String,
        args: Vec<(String, Expr)>,
        source: Source,
    },
    BinOp {
        op: BinOpKind,
        left: Box<Expr>,
        right: Box<Expr>,
        source: Source,
    },
    UnaryOp {
        op: UnaryOpKind,
        operand: Box<Expr>,
        source: Source,
    },
    Name(String, Source),
    Attr {
        base: Box<Expr>,
        attr: String,
        source: Source,
    },
    Subscr {
        base: Box<Expr>,
        index: Box<Expr>,
        source: Source,
    },
}

impl Expr {
    pub fn source(&self) -> Source {
        match self {
            Expr::Const(_, source)
            | Expr::Object(source)
            | Expr::Tuple(_, source)
            | Expr::Name(_, source) => *source,
            Expr::Call { source, .. }
            | Expr::LibCall { source, .. }
            | Expr::BinOp { source, .. }
            | Expr::UnaryOp { source, .. }
            | Expr::Attr { source, .. }
            | Expr::Subscr { source, .. } => *source,
        }
    }

    pub fn name(id: impl Into<String>) -> Expr {
        Expr::Name(id.into(), Source::Unknown)
    }

    pub fn int(value: i64) -> Expr {
        Expr::Const(ConstKind::Int(value), Source::Unknown)
    }
}

/// Parameter list of a function definition. Defaults are evaluated at
/// definition time, matching Python.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FunParams {
    pub names: Vec<String>,
    pub defaults: Vec<(String, Expr)>,
    pub vararg: Option<String>,
    pub kwvararg: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunDef {
    pub name: String,
    pub params: FunParams,
    pub body: Box<Stmt>,
    pub source: Source,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Pass(Source),
    Expr(Expr),
    Seq(Box<Stmt>, Box<Stmt>),
    Assign {
        target: Expr,
        value: Expr,
        source: Source,
    },
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Box<Stmt>,
        source: Source,
    },
    ForIn {
        ident: String,
        iter: Expr,
        body: Box<Stmt>,
        source: Source,
    },
    Return {
        value: Option<Expr>,
        source: Source,
    },
    Continue(Source),
    Break(Source),
    Let {
        name: String,
        init: Option<Expr>,
        source: Source,
    },
    FunDef(FunDef),
}

impl Stmt {
    pub fn source(&self) -> Source {
        match self {
            Stmt::Pass(source) | Stmt::Continue(source) | Stmt::Break(source) => *source,
            Stmt::Expr(expr) => expr.source(),
            Stmt::Seq(left, _) => left.source(),
            Stmt::Assign { source, .. }
            | Stmt::If { source, .. }
            | Stmt::ForIn { source, .. }
            | Stmt::Return { source, .. }
            | Stmt::Let { source, .. } => *source,
            Stmt::FunDef(def) => def.source,
        }
    }

    /// Fold a statement list into nested `Seq` nodes, the shape the
    /// frontend emits for suites.
    pub fn seq(stmts: Vec<Stmt>) -> Stmt {
        let mut iter = stmts.into_iter().rev();
        let Some(last) = iter.next() else {
            return Stmt::Pass(Source::Unknown);
        };
        iter.fold(last, |acc, stmt| Stmt::Seq(Box::new(stmt), Box::new(acc)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_folds_right() {
        let s = Stmt::seq(vec![
            Stmt::Pass(Source::Unknown),
            Stmt::Break(Source::Unknown),
            Stmt::Continue(Source::Unknown),
        ]);
        match s {
            Stmt::Seq(first, rest) => {
                assert_eq!(*first, Stmt::Pass(Source::Unknown));
                match *rest {
                    Stmt::Seq(second, third) => {
                        assert_eq!(*second, Stmt::Break(Source::Unknown));
                        assert_eq!(*third, Stmt::Continue(Source::Unknown));
                    }
                    other => panic!("expected nested seq, got {other:?}"),
                }
            }
            other => panic!("expected seq, got {other:?}"),
        }
    }

    #[test]
    fn source_roundtrips_through_json() {
        let external = Source::External {
            file_id: 3,
            span: SourceSpan::new(10.into(), 4),
        };
        for source in [Source::host(0, 5), external, Source::Unknown] {
            let json = serde_json::to_string(&source).expect("serialize");
            let back: Source = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(source, back);
        }
    }
}
