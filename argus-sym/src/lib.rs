#![forbid(unsafe_code)]

//! Symbolic substrate of the shape checker: interval arithmetic, the
//! expression algebra, and the incremental constraint solver.

pub mod constraint;
pub mod ctrset;
pub mod exp;
pub mod range;
pub mod simplify;
pub mod symbol;

pub use constraint::{Ctr, CtrKind, CtrRef};
pub use ctrset::{BroadcastSelect, ConstraintSet, CtrDump, CtrSetDump};
pub use exp::{
    BoolRef, ExpBool, ExpNum, ExpShape, ExpString, NumBop, NumRef, NumUop, ShapeRef, StrRef,
    SymExp,
};
pub use range::NumRange;
pub use symbol::{CtrId, IdManager, SymId, SymKind, Symbol};
