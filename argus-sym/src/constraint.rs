//! Constraint nodes.
//!
//! Constraints are immutable values with process-unique ids; they are
//! composed into larger trees but never edited after construction.

use std::fmt;
use std::rc::Rc;

use argus_ir::Source;

use crate::exp::{BoolRef, NumRef, ShapeRef, SymExp};
use crate::symbol::{CtrId, Symbol};

pub type CtrRef = Rc<Ctr>;

#[derive(Clone, Debug, PartialEq)]
pub enum CtrKind {
    Equal { left: SymExp, right: SymExp },
    NotEqual { left: SymExp, right: SymExp },
    LessThan { left: NumRef, right: NumRef },
    LessThanOrEqual { left: NumRef, right: NumRef },
    And { left: CtrRef, right: CtrRef },
    Or { left: CtrRef, right: CtrRef },
    Not(CtrRef),
    Broadcastable { left: ShapeRef, right: ShapeRef },
    /// `∀ sym ∈ [lower, upper] . body`
    Forall {
        sym: Symbol,
        lower: NumRef,
        upper: NumRef,
        body: CtrRef,
    },
    /// Unconditionally unsatisfiable; used to mark a failed path.
    Fail,
    ExpBool(BoolRef),
}

#[derive(Clone, Debug)]
pub struct Ctr {
    pub id: CtrId,
    pub kind: CtrKind,
    pub message: Option<Rc<str>>,
    pub source: Source,
}

impl PartialEq for Ctr {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Ctr {
    /// Human-readable rendering for logs and the external-solver dump.
    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Does any expression inside this constraint mention a symbol with an
    /// id satisfying `pred`? The pure-call pruner uses this to decide
    /// whether new constraints touch caller-visible symbols.
    pub fn mentions_sym_where(&self, pred: &dyn Fn(u32) -> bool) -> bool {
        use crate::simplify::{exp_mentions_where, num_mentions_where, shape_mentions_where};
        match &self.kind {
            CtrKind::Equal { left, right } | CtrKind::NotEqual { left, right } => {
                exp_mentions_where(left, pred) || exp_mentions_where(right, pred)
            }
            CtrKind::LessThan { left, right } | CtrKind::LessThanOrEqual { left, right } => {
                num_mentions_where(left, pred) || num_mentions_where(right, pred)
            }
            CtrKind::And { left, right } | CtrKind::Or { left, right } => {
                left.mentions_sym_where(pred) || right.mentions_sym_where(pred)
            }
            CtrKind::Not(inner) => inner.mentions_sym_where(pred),
            CtrKind::Broadcastable { left, right } => {
                shape_mentions_where(left, pred) || shape_mentions_where(right, pred)
            }
            CtrKind::Forall {
                sym,
                lower,
                upper,
                body,
            } => {
                pred(sym.id.0)
                    || num_mentions_where(lower, pred)
                    || num_mentions_where(upper, pred)
                    || body.mentions_sym_where(pred)
            }
            CtrKind::Fail => false,
            CtrKind::ExpBool(b) => crate::simplify::bool_mentions_where(b, pred),
        }
    }
}

impl fmt::Display for Ctr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            CtrKind::Equal { left, right } => write!(f, "{left} == {right}"),
            CtrKind::NotEqual { left, right } => write!(f, "{left} != {right}"),
            CtrKind::LessThan { left, right } => write!(f, "{left} < {right}"),
            CtrKind::LessThanOrEqual { left, right } => write!(f, "{left} <= {right}"),
            CtrKind::And { left, right } => write!(f, "({left} and {right})"),
            CtrKind::Or { left, right } => write!(f, "({left} or {right})"),
            CtrKind::Not(inner) => write!(f, "not ({inner})"),
            CtrKind::Broadcastable { left, right } => {
                write!(f, "broadcastable({left}, {right})")
            }
            CtrKind::Forall {
                sym,
                lower,
                upper,
                body,
            } => write!(f, "forall {sym} in [{lower}, {upper}]. ({body})"),
            CtrKind::Fail => match &self.message {
                Some(msg) => write!(f, "fail: {msg}"),
                None => write!(f, "fail"),
            },
            CtrKind::ExpBool(b) => write!(f, "{b}"),
        }
    }
}
