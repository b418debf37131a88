//! The library-intrinsic bridge.
//!
//! A `LibCall` IR node routes to this named table. The interpreter owns
//! none of the intrinsics' semantics; it evaluates the (named) arguments,
//! looks the intrinsic up by name, and propagates the returned context set
//! transparently.

use std::collections::HashMap;
use std::rc::Rc;

use argus_ir::Source;

use crate::context::{Context, ContextSet};
use crate::interp::Interp;
use crate::value::ShValue;

pub type LibCallArgs = Vec<(Rc<str>, ShValue)>;

pub type LibCallFn =
    Rc<dyn Fn(&Interp, Context<()>, LibCallArgs, Source) -> ContextSet<ShValue>>;

#[derive(Clone, Default)]
pub struct LibCallMap {
    map: HashMap<Rc<str>, LibCallFn>,
}

impl LibCallMap {
    pub fn new() -> Self {
        LibCallMap::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<Rc<str>>,
        f: impl Fn(&Interp, Context<()>, LibCallArgs, Source) -> ContextSet<ShValue> + 'static,
    ) {
        self.map.insert(name.into(), Rc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<&LibCallFn> {
        self.map.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &Rc<str>> {
        self.map.keys()
    }
}

impl std::fmt::Debug for LibCallMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibCallMap")
            .field("names", &self.map.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Fetch a positional-or-named argument from an intrinsic argument list.
pub fn arg_named<'a>(args: &'a LibCallArgs, name: &str, position: usize) -> Option<&'a ShValue> {
    args.iter()
        .find(|(n, _)| &**n == name)
        .map(|(_, v)| v)
        .or_else(|| args.get(position).map(|(_, v)| v))
}
