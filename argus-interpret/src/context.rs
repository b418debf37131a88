//! Execution contexts and context sets.
//!
//! A `Context<T>` is one node of the exploration tree; a `ContextSet<T>` is
//! the forest of live paths plus the failed and stopped paths collected so
//! far. Every state transition flows through `ContextSet::assemble`, the
//! single re-partition chokepoint.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use argus_ir::Source;
use argus_sym::{BoolRef, ConstraintSet, CtrRef, ExpBool, IdManager};
use log::debug;

use crate::heap::{Addr, ShEnv, ShHeap};
use crate::value::{LogLevel, ShError, ShObj, ShValue};

#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: Rc<str>,
    pub source: Source,
}

/// One call-stack entry: function or intrinsic name plus call site.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub name: Rc<str>,
    pub source: Source,
}

/// One point in the exploration tree. All mutators are pure; forks share
/// structure and never alias mutation.
#[derive(Clone, Debug)]
pub struct Context<T> {
    pub env: ShEnv,
    pub heap: ShHeap,
    pub ctr_set: ConstraintSet,
    pub ret_val: T,
    pub call_stack: Rc<Vec<Frame>>,
    pub logs: Rc<Vec<LogEntry>>,
    pub imported: ShEnv,
    pub rel_path: Rc<str>,
    pub failed: Option<ShError>,
    pub fail_id: Option<u32>,
}

impl Context<()> {
    pub fn root(ids: IdManager, rel_path: impl Into<Rc<str>>) -> Self {
        Context {
            env: ShEnv::new(),
            heap: ShHeap::new(),
            ctr_set: ConstraintSet::new(ids),
            ret_val: (),
            call_stack: Rc::new(Vec::new()),
            logs: Rc::new(Vec::new()),
            imported: ShEnv::new(),
            rel_path: rel_path.into(),
            failed: None,
            fail_id: None,
        }
    }
}

impl<T> Context<T> {
    pub fn ids(&self) -> &IdManager {
        self.ctr_set.ids()
    }

    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }

    pub fn has_path_ctr(&self) -> bool {
        self.ctr_set.has_path_ctr()
    }

    pub fn with_ret<U>(self, ret_val: U) -> Context<U> {
        Context {
            env: self.env,
            heap: self.heap,
            ctr_set: self.ctr_set,
            ret_val,
            call_stack: self.call_stack,
            logs: self.logs,
            imported: self.imported,
            rel_path: self.rel_path,
            failed: self.failed,
            fail_id: self.fail_id,
        }
    }

    pub fn with_env(mut self, env: ShEnv) -> Self {
        self.env = env;
        self
    }

    pub fn with_heap(mut self, heap: ShHeap) -> Self {
        self.heap = heap;
        self
    }

    pub fn with_ctr_set(mut self, ctr_set: ConstraintSet) -> Self {
        self.ctr_set = ctr_set;
        self
    }

    // ----- logs and call stack -----

    pub fn push_log(mut self, level: LogLevel, message: impl Into<Rc<str>>, source: Source) -> Self {
        Rc::make_mut(&mut self.logs).push(LogEntry {
            level,
            message: message.into(),
            source,
        });
        self
    }

    pub fn log(self, message: impl Into<Rc<str>>, source: Source) -> Self {
        self.push_log(LogLevel::Log, message, source)
    }

    /// Record a modeling gap; execution continues on this path.
    pub fn warn(self, message: impl Into<Rc<str>>, source: Source) -> Self {
        self.push_log(LogLevel::Warning, message, source)
    }

    pub fn push_call(mut self, name: impl Into<Rc<str>>, source: Source) -> Self {
        Rc::make_mut(&mut self.call_stack).push(Frame {
            name: name.into(),
            source,
        });
        self
    }

    pub fn pop_call(mut self) -> Self {
        Rc::make_mut(&mut self.call_stack).pop();
        self
    }

    // ----- failure -----

    /// Terminate this path. Whether that means Failed or Stopped is decided
    /// at re-partition time from `has_path_ctr`.
    pub fn fail(mut self, reason: impl Into<Rc<str>>, source: Source) -> Self {
        if self.failed.is_some() {
            return self;
        }
        let reason = reason.into();
        self = self.push_log(LogLevel::Error, reason.clone(), source);
        self.failed = Some(ShError::error(reason, source));
        self
    }

    // ----- constraints -----

    pub fn require(self, ctr: CtrRef) -> Self {
        if self.failed.is_some() {
            return self;
        }
        let source = ctr.source;
        let message = ctr.message.clone();
        let next_set = self.ctr_set.require(ctr);
        self.absorb_ctr_set(next_set, message, source)
    }

    pub fn guarantee(self, ctr: CtrRef) -> Self {
        if self.failed.is_some() {
            return self;
        }
        let source = ctr.source;
        let message = ctr.message.clone();
        let next_set = self.ctr_set.guarantee(ctr);
        self.absorb_ctr_set(next_set, message, source)
    }

    pub fn add_if(self, ctr: CtrRef) -> Self {
        if self.failed.is_some() {
            return self;
        }
        let source = ctr.source;
        let message = ctr.message.clone();
        let next_set = self.ctr_set.add_if(ctr);
        self.absorb_ctr_set(next_set, message, source)
    }

    fn absorb_ctr_set(
        mut self,
        next_set: ConstraintSet,
        message: Option<Rc<str>>,
        source: Source,
    ) -> Self {
        let became_invalid = !self.ctr_set.is_invalid() && next_set.is_invalid();
        self.ctr_set = next_set;
        if became_invalid {
            let reason = message.unwrap_or_else(|| "unsatisfiable constraint".into());
            self.fail(reason, source)
        } else {
            self
        }
    }

    // ----- heap / env conveniences -----

    pub fn malloc(mut self) -> (Self, Addr) {
        let (heap, addr) = self.heap.malloc();
        self.heap = heap;
        (self, addr)
    }

    pub fn alloc_new(mut self, value: ShValue) -> (Self, Addr) {
        let (heap, addr) = self.heap.alloc_new(value);
        self.heap = heap;
        (self, addr)
    }

    pub fn set_val(mut self, addr: Addr, value: ShValue) -> Self {
        self.heap = self.heap.set_val(addr, value);
        self
    }

    pub fn bind(mut self, name: impl Into<Rc<str>>, addr: Addr) -> Self {
        self.env = self.env.set(name, addr);
        self
    }

    /// A brand-new object allocated on the heap, value and address in sync.
    pub fn alloc_obj(self) -> (Self, ShObj) {
        let (ctx, addr) = self.malloc();
        let obj = ShObj::new(addr);
        let ctx = ctx.set_val(addr, ShValue::Obj(obj.clone()));
        (ctx, obj)
    }

    /// A maximally-unconstrained stand-in tensor: a fresh object whose shape
    /// is a brand-new shape symbol. Used by `warn`-level recoveries so
    /// execution can continue past a modeling gap.
    pub fn warn_tensor(
        self,
        message: impl Into<Rc<str>>,
        source: Source,
    ) -> (Self, ShValue) {
        let ctx = self.warn(message, source);
        let shape = ctx.ctr_set.gen_sym_shape("warn_shape", source);
        let (ctx, obj) = ctx.alloc_obj();
        let obj = obj.with_shape(shape);
        let addr = obj.addr;
        let value = ShValue::Obj(obj);
        let ctx = ctx.set_val(addr, value.clone());
        (ctx, value)
    }

    /// Coerce a terminated context into the error-valued shape kept in the
    /// failed/stopped lists, assigning its stable fail id lazily.
    fn seal_failed(self) -> Context<ShValue> {
        let err = self
            .failed
            .clone()
            .unwrap_or_else(|| ShError::error("internal: sealed a live context", Source::Unknown));
        let fail_id = match self.fail_id {
            Some(id) => Some(id),
            None => Some(self.ids().next_fail_id()),
        };
        let mut sealed = self.with_ret(ShValue::Error(err));
        sealed.fail_id = fail_id;
        sealed
    }
}

// ----- governor -----

#[derive(Debug, Default)]
struct GovernorState {
    max_paths: Cell<Option<usize>>,
    deadline: Cell<Option<Instant>>,
    timeout_ms: Cell<u64>,
    tripped: RefCell<Option<Rc<str>>>,
}

/// Process-wide path-count / wall-clock governor, consulted cooperatively at
/// every `ContextSet` construction. Once tripped it forcibly fails every
/// live context and keeps failing them; it never interrupts an in-progress
/// statement.
#[derive(Clone, Debug, Default)]
pub struct Governor {
    inner: Rc<GovernorState>,
}

impl Governor {
    pub fn new() -> Self {
        Governor::default()
    }

    pub fn limit_paths(&self, max: usize) {
        self.inner.max_paths.set(Some(max));
    }

    pub fn limit_millis(&self, millis: u64) {
        self.inner.timeout_ms.set(millis);
        self.inner
            .deadline
            .set(Some(Instant::now() + std::time::Duration::from_millis(millis)));
    }

    pub fn tripped(&self) -> Option<Rc<str>> {
        self.inner.tripped.borrow().clone()
    }

    fn check(&self, live_count: usize) -> Option<Rc<str>> {
        if let Some(msg) = self.tripped() {
            return Some(msg);
        }
        if let Some(max) = self.inner.max_paths.get() {
            if live_count > max {
                let msg: Rc<str> = format!("path count exceeded ({max})").into();
                *self.inner.tripped.borrow_mut() = Some(msg.clone());
                return Some(msg);
            }
        }
        if let Some(deadline) = self.inner.deadline.get() {
            if Instant::now() >= deadline {
                let msg: Rc<str> =
                    format!("timeout expired ({}ms)", self.inner.timeout_ms.get()).into();
                *self.inner.tripped.borrow_mut() = Some(msg.clone());
                return Some(msg);
            }
        }
        None
    }
}

// ----- context set -----

/// Three disjoint path lists: live, failed (unconditionally reached) and
/// stopped (reached only under an undecided path condition).
#[derive(Clone, Debug)]
pub struct ContextSet<T> {
    ctx_list: Vec<Context<T>>,
    failed: Vec<Context<ShValue>>,
    stopped: Vec<Context<ShValue>>,
    governor: Governor,
}

impl<T> ContextSet<T> {
    /// The single chokepoint through which every state transition flows:
    /// re-partition raw contexts by their `failed` field and `has_path_ctr`,
    /// then consult the governor.
    pub fn assemble(
        raw: Vec<Context<T>>,
        mut failed: Vec<Context<ShValue>>,
        mut stopped: Vec<Context<ShValue>>,
        governor: Governor,
    ) -> Self {
        let mut live = Vec::with_capacity(raw.len());
        for mut ctx in raw {
            if ctx.failed.is_none() && ctx.ctr_set.is_invalid() {
                ctx = ctx.fail("constraint set became invalid", Source::Unknown);
            }
            if ctx.failed.is_some() {
                let has_path = ctx.has_path_ctr();
                let sealed = ctx.seal_failed();
                if has_path {
                    push_keyed(&mut stopped, sealed);
                } else {
                    push_keyed(&mut failed, sealed);
                }
            } else {
                live.push(ctx);
            }
        }
        if let Some(msg) = governor.check(live.len()) {
            debug!("governor tripped: {msg} ({} live paths dropped)", live.len());
            for ctx in live.drain(..) {
                let has_path = ctx.has_path_ctr();
                let sealed = ctx.fail(msg.clone(), Source::Unknown).seal_failed();
                if has_path {
                    push_keyed(&mut stopped, sealed);
                } else {
                    push_keyed(&mut failed, sealed);
                }
            }
        }
        ContextSet {
            ctx_list: live,
            failed,
            stopped,
            governor,
        }
    }

    pub fn unit(ctx: Context<T>, governor: Governor) -> Self {
        ContextSet::assemble(vec![ctx], Vec::new(), Vec::new(), governor)
    }

    pub fn empty(governor: Governor) -> Self {
        ContextSet::assemble(Vec::new(), Vec::new(), Vec::new(), governor)
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    pub fn live(&self) -> &[Context<T>] {
        &self.ctx_list
    }

    pub fn failed(&self) -> &[Context<ShValue>] {
        &self.failed
    }

    pub fn stopped(&self) -> &[Context<ShValue>] {
        &self.stopped
    }

    pub fn live_count(&self) -> usize {
        self.ctx_list.len()
    }

    pub fn is_empty_live(&self) -> bool {
        self.ctx_list.is_empty()
    }

    pub fn into_parts(
        self,
    ) -> (
        Vec<Context<T>>,
        Vec<Context<ShValue>>,
        Vec<Context<ShValue>>,
    ) {
        (self.ctx_list, self.failed, self.stopped)
    }

    pub fn map<U>(self, f: impl FnMut(Context<T>) -> Context<U>) -> ContextSet<U> {
        let mapped: Vec<Context<U>> = self.ctx_list.into_iter().map(f).collect();
        ContextSet::assemble(mapped, self.failed, self.stopped, self.governor)
    }

    pub fn flat_map<U>(self, mut f: impl FnMut(Context<T>) -> ContextSet<U>) -> ContextSet<U> {
        let mut live = Vec::new();
        let mut failed = self.failed;
        let mut stopped = self.stopped;
        for ctx in self.ctx_list {
            let sub = f(ctx);
            live.extend(sub.ctx_list);
            for c in sub.failed {
                push_keyed(&mut failed, c);
            }
            for c in sub.stopped {
                push_keyed(&mut stopped, c);
            }
        }
        ContextSet::assemble(live, failed, stopped, self.governor)
    }

    pub fn filter(self, mut pred: impl FnMut(&Context<T>) -> bool) -> Self {
        let kept = self.ctx_list.into_iter().filter(|c| pred(c)).collect();
        ContextSet::assemble(kept, self.failed, self.stopped, self.governor)
    }

    /// Recombine two branches: live lists concatenate; failed/stopped merge
    /// keyed by fail id, last writer wins.
    pub fn join(self, other: ContextSet<T>) -> Self {
        let mut live = self.ctx_list;
        live.extend(other.ctx_list);
        let mut failed = self.failed;
        for c in other.failed {
            push_keyed(&mut failed, c);
        }
        let mut stopped = self.stopped;
        for c in other.stopped {
            push_keyed(&mut stopped, c);
        }
        ContextSet::assemble(live, failed, stopped, self.governor)
    }

    /// The path-forking primitive: split every live context on its own
    /// condition. A branch whose augmented constraint set is immediately
    /// false is dropped entirely, not even recorded as failed.
    pub fn fork(
        self,
        cond_of: impl Fn(&Context<T>) -> BoolRef,
        source: Source,
    ) -> (ContextSet<T>, ContextSet<T>)
    where
        T: Clone,
    {
        let mut then_live = Vec::new();
        let mut else_live = Vec::new();
        for ctx in self.ctx_list {
            let cond = cond_of(&ctx);
            let pos = ctx
                .ctr_set
                .gen_bool(cond.clone(), None, source);
            let then_ctx = ctx.clone().add_if(pos);
            if !then_ctx.ctr_set.is_invalid() {
                then_live.push(then_ctx);
            }
            let neg = ctx
                .ctr_set
                .gen_bool(ExpBool::not(cond, source), None, source);
            let else_ctx = ctx.add_if(neg);
            if !else_ctx.ctr_set.is_invalid() {
                else_live.push(else_ctx);
            }
        }
        // failed/stopped ride along both branches; the keyed join dedups
        // them when the branches recombine
        let then_set = ContextSet::assemble(
            then_live,
            self.failed.clone(),
            self.stopped.clone(),
            self.governor.clone(),
        );
        let else_set =
            ContextSet::assemble(else_live, self.failed, self.stopped, self.governor);
        (then_set, else_set)
    }

    /// Lift `require` across all live contexts.
    pub fn require_each(self, f: impl Fn(&Context<T>) -> CtrRef) -> Self {
        self.map(|ctx| {
            let ctr = f(&ctx);
            ctx.require(ctr)
        })
    }

    /// Lift `guarantee` across all live contexts.
    pub fn guarantee_each(self, f: impl Fn(&Context<T>) -> CtrRef) -> Self {
        self.map(|ctx| {
            let ctr = f(&ctx);
            ctx.guarantee(ctr)
        })
    }
}

impl ContextSet<ShValue> {
    /// Fresh fully-symbolic tensors for every live path, with a warning.
    pub fn warn_tensor_each(self, message: &str, source: Source) -> Self {
        self.map(|ctx| {
            let (ctx, value) = ctx.warn_tensor(message, source);
            ctx.with_ret(value)
        })
    }
}

fn push_keyed(list: &mut Vec<Context<ShValue>>, ctx: Context<ShValue>) {
    if let Some(id) = ctx.fail_id {
        if let Some(existing) = list.iter_mut().find(|c| c.fail_id == Some(id)) {
            *existing = ctx;
            return;
        }
    }
    list.push(ctx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_sym::ExpNum;

    fn c(v: f64) -> argus_sym::NumRef {
        ExpNum::constant(v, Source::Unknown)
    }

    fn root() -> Context<()> {
        Context::root(IdManager::new(), "test")
    }

    #[test]
    fn unconditional_failure_lands_in_failed() {
        let ctx = root().fail("boom", Source::Unknown);
        let set = ContextSet::unit(ctx, Governor::new());
        assert_eq!(set.live_count(), 0);
        assert_eq!(set.failed().len(), 1);
        assert!(set.stopped().is_empty());
        assert!(set.failed()[0].fail_id.is_some());
    }

    #[test]
    fn conditional_failure_lands_in_stopped() {
        let ctx = root();
        let x = ctx.ctr_set.gen_sym_int("x", Source::Unknown);
        let path = ctx
            .ctr_set
            .gen_lt(c(0.0), x, None, Source::Unknown);
        let ctx = ctx.add_if(path).fail("boom", Source::Unknown);
        let set = ContextSet::unit(ctx, Governor::new());
        assert!(set.failed().is_empty());
        assert_eq!(set.stopped().len(), 1);
    }

    #[test]
    fn fork_drops_provably_false_branches() {
        let ctx = root();
        let cond = ExpBool::constant(true, Source::Unknown);
        let (then_set, else_set) =
            ContextSet::unit(ctx, Governor::new()).fork(|_| cond.clone(), Source::Unknown);
        assert_eq!(then_set.live_count(), 1);
        assert_eq!(else_set.live_count(), 0);
        assert!(else_set.failed().is_empty() && else_set.stopped().is_empty());
    }

    #[test]
    fn fork_on_undecidable_condition_keeps_both() {
        let ctx = root();
        let x = ctx.ctr_set.gen_sym_int("x", Source::Unknown);
        let cond = ExpBool::less_than(c(0.0), x, Source::Unknown);
        let before = 1;
        let (then_set, else_set) =
            ContextSet::unit(ctx, Governor::new()).fork(|_| cond.clone(), Source::Unknown);
        // no path silently vanishes
        assert_eq!(
            then_set.live_count() + else_set.live_count(),
            before * 2
        );
        assert!(then_set.live()[0].has_path_ctr());
        assert!(else_set.live()[0].has_path_ctr());
    }

    #[test]
    fn join_dedups_failed_by_fail_id() {
        let ctx = root().fail("boom", Source::Unknown);
        let set = ContextSet::unit(ctx, Governor::new());
        let joined = set.clone().join(set);
        assert_eq!(joined.failed().len(), 1);
    }

    #[test]
    fn governor_fails_all_live_paths_on_path_limit() {
        let governor = Governor::new();
        governor.limit_paths(1);
        let a = root();
        let b = root();
        let set = ContextSet::assemble(vec![a, b], Vec::new(), Vec::new(), governor.clone());
        assert_eq!(set.live_count(), 0);
        assert_eq!(set.failed().len(), 2);
        assert!(
            set.failed()[0]
                .failed
                .as_ref()
                .is_some_and(|e| e.reason.contains("path count exceeded"))
        );
        // once tripped, later constructions keep failing
        let again = ContextSet::unit(root(), governor);
        assert_eq!(again.live_count(), 0);
    }
}
