//! Copy-on-write environment and heap.
//!
//! Addresses are plain integers. The negative space is reserved for the
//! builtin/default layer: a finished bootstrap heap is shifted wholesale
//! below zero (`as_default`) so a fresh user heap can allocate upward from
//! zero without collision.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::value::ShValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr(pub i64);

impl Addr {
    pub fn shifted(&self, offset: i64) -> Addr {
        Addr(self.0 + offset)
    }

    pub fn is_default_space(&self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name → address mapping, one snapshot per lexical scope chain.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShEnv {
    map: Rc<HashMap<Rc<str>, Addr>>,
}

impl ShEnv {
    pub fn new() -> Self {
        ShEnv::default()
    }

    pub fn lookup(&self, name: &str) -> Option<Addr> {
        self.map.get(name).copied()
    }

    pub fn set(&self, name: impl Into<Rc<str>>, addr: Addr) -> Self {
        let mut next = self.clone();
        Rc::make_mut(&mut next.map).insert(name.into(), addr);
        next
    }

    pub fn remove(&self, name: &str) -> Self {
        let mut next = self.clone();
        Rc::make_mut(&mut next.map).remove(name);
        next
    }

    pub fn names(&self) -> impl Iterator<Item = &Rc<str>> {
        self.map.keys()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Rc<str>, Addr)> {
        self.map.iter().map(|(k, v)| (k, *v))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn shift_addr(&self, offset: i64) -> ShEnv {
        ShEnv {
            map: Rc::new(
                self.map
                    .iter()
                    .map(|(k, a)| (k.clone(), a.shifted(offset)))
                    .collect(),
            ),
        }
    }
}

/// Address → value store with a monotonic allocation counter.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShHeap {
    map: Rc<HashMap<Addr, ShValue>>,
    addr_max: i64,
}

impl ShHeap {
    pub fn new() -> Self {
        ShHeap::default()
    }

    /// Highest address ever allocated; the pure-call pruner uses it as the
    /// pre-call high-water mark.
    pub fn addr_max(&self) -> i64 {
        self.addr_max
    }

    pub fn malloc(&self) -> (Self, Addr) {
        let addr = Addr(self.addr_max + 1);
        let mut next = self.clone();
        next.addr_max = addr.0;
        (next, addr)
    }

    pub fn alloc_new(&self, value: ShValue) -> (Self, Addr) {
        let (mut next, addr) = self.malloc();
        Rc::make_mut(&mut next.map).insert(addr, value);
        (next, addr)
    }

    pub fn get_val(&self, addr: Addr) -> Option<&ShValue> {
        self.map.get(&addr)
    }

    pub fn set_val(&self, addr: Addr, value: ShValue) -> Self {
        let mut next = self.clone();
        Rc::make_mut(&mut next.map).insert(addr, value);
        next
    }

    pub fn free(&self, addr: Addr) -> Self {
        let mut next = self.clone();
        Rc::make_mut(&mut next.map).remove(&addr);
        next
    }

    pub fn entries(&self) -> impl Iterator<Item = (Addr, &ShValue)> {
        self.map.iter().map(|(a, v)| (*a, v))
    }

    /// Offset applied by `as_default`; an environment harvested alongside
    /// this heap must be shifted by the same amount.
    pub fn default_offset(&self) -> i64 {
        -(self.addr_max + 1)
    }

    /// Shift this heap wholesale into the negative default space: every
    /// address (keys and addresses embedded in values) moves below zero,
    /// and the allocation counter resets so a user heap layered on top
    /// starts fresh at address 1.
    pub fn as_default(&self) -> ShHeap {
        let offset = self.default_offset();
        ShHeap {
            map: Rc::new(
                self.map
                    .iter()
                    .map(|(a, v)| (a.shifted(offset), v.shift_addr(offset)))
                    .collect(),
            ),
            addr_max: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_ir::Source;

    #[test]
    fn malloc_is_monotonic() {
        let heap = ShHeap::new();
        let (heap, a) = heap.malloc();
        let (heap, b) = heap.malloc();
        assert_eq!(a, Addr(1));
        assert_eq!(b, Addr(2));
        assert_eq!(heap.addr_max(), 2);
    }

    #[test]
    fn env_copy_on_write_isolates_forks() {
        let env = ShEnv::new().set("x", Addr(1));
        let forked = env.set("y", Addr(2));
        assert_eq!(env.lookup("y"), None);
        assert_eq!(forked.lookup("x"), Some(Addr(1)));
        assert_eq!(forked.lookup("y"), Some(Addr(2)));
    }

    #[test]
    fn as_default_shifts_everything_negative() {
        let heap = ShHeap::new();
        let (heap, a) = heap.alloc_new(ShValue::int_const(1, Source::Unknown));
        let (heap, b) = heap.alloc_new(ShValue::Addr(a));
        let default = heap.as_default();
        assert_eq!(default.addr_max(), 0);
        // every surviving address is negative, and the embedded pointer
        // moved by the same offset
        let shifted_b = Addr(b.0 - (heap.addr_max() + 1));
        assert!(shifted_b.is_default_space());
        match default.get_val(shifted_b) {
            Some(ShValue::Addr(inner)) => {
                assert!(inner.is_default_space());
                assert!(matches!(
                    default.get_val(*inner),
                    Some(ShValue::Int(_))
                ));
            }
            other => panic!("expected shifted pointer, got {other:?}"),
        }
    }
}
