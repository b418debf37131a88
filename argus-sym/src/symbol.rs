//! Symbols and the per-run id manager.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use argus_ir::Source;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SymId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CtrId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum SymKind {
    Int,
    Float,
    Bool,
    Str,
    Shape,
}

impl SymKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            SymKind::Int => "int",
            SymKind::Float => "flt",
            SymKind::Bool => "bool",
            SymKind::Str => "str",
            SymKind::Shape => "shape",
        }
    }
}

/// An immutable symbol. Ids are process-wide unique per analysis run and
/// shared across every forked path through one `IdManager`; symbols are
/// never mutated or freed.
#[derive(Clone, Debug)]
pub struct Symbol {
    pub id: SymId,
    pub kind: SymKind,
    pub name: Rc<str>,
    pub source: Source,
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind
    }
}

impl Eq for Symbol {}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}${}${}", self.kind.prefix(), self.name, self.id.0)
    }
}

#[derive(Debug, Default)]
struct IdCounters {
    sym: Cell<u32>,
    ctr: Cell<u32>,
    fail: Cell<u32>,
}

/// Monotonic counters for symbol / constraint / fail ids, created once per
/// top-level analysis run and threaded through every forked context. Kept
/// behind `Rc` rather than a process global so the engine stays re-entrant.
#[derive(Clone, Debug, Default)]
pub struct IdManager {
    inner: Rc<IdCounters>,
}

impl IdManager {
    pub fn new() -> Self {
        IdManager::default()
    }

    pub fn fresh_symbol(&self, kind: SymKind, name: impl Into<Rc<str>>, source: Source) -> Symbol {
        let id = self.inner.sym.get();
        self.inner.sym.set(id + 1);
        Symbol {
            id: SymId(id),
            kind,
            name: name.into(),
            source,
        }
    }

    pub fn next_ctr_id(&self) -> CtrId {
        let id = self.inner.ctr.get();
        self.inner.ctr.set(id + 1);
        CtrId(id)
    }

    pub fn next_fail_id(&self) -> u32 {
        let id = self.inner.fail.get();
        self.inner.fail.set(id + 1);
        id
    }

    /// Symbol ids at or above this watermark were created after the call;
    /// the pure-call pruner uses it to tell call-local symbols apart.
    pub fn sym_watermark(&self) -> u32 {
        self.inner.sym.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_shared_across_clones() {
        let ids = IdManager::new();
        let forked = ids.clone();
        let a = ids.fresh_symbol(SymKind::Int, "a", Source::Unknown);
        let b = forked.fresh_symbol(SymKind::Int, "b", Source::Unknown);
        assert_ne!(a.id, b.id);
        assert_eq!(ids.sym_watermark(), 2);
    }

    #[test]
    fn symbols_compare_by_id_and_kind() {
        let ids = IdManager::new();
        let a = ids.fresh_symbol(SymKind::Int, "a", Source::Unknown);
        let mut renamed = a.clone();
        renamed.name = "other".into();
        assert_eq!(a, renamed);
    }
}
