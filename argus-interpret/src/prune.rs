//! Pure-function-call pruning.
//!
//! A call whose body forked exactly once is collapsed back to a single path
//! when the fork is provably invisible to the caller: no soft constraints
//! were added, any new hard/path constraints touch only call-local symbols,
//! both branches return structurally equal values, and the heap below the
//! pre-call high-water mark is untouched. A failed check keeps both paths;
//! the optimization is never allowed to merge incorrectly.

use std::collections::HashMap;
use std::rc::Rc;

use argus_sym::simplify::{
    bool_mentions_where, num_mentions_where, shape_mentions_where, str_mentions_where,
};
use argus_sym::{ConstraintSet, Ctr, CtrId, CtrKind, ExpBool};
use log::debug;

use crate::context::ContextSet;
use crate::heap::{Addr, ShHeap};
use crate::value::ShValue;

impl ContextSet<ShValue> {
    /// Collapse a two-way fork produced by a provably pure call. `old_ctr`
    /// and `old_heap` are the caller's constraint set and heap at the call,
    /// `sym_watermark` the first symbol id minted inside the call.
    pub fn prune_pure_call(
        self,
        old_ctr: &ConstraintSet,
        old_heap: &ShHeap,
        sym_watermark: u32,
    ) -> Self {
        if self.live_count() != 2 {
            return self;
        }
        let base_pool = old_ctr.pool_len();
        let base_soft = old_ctr.soft_len();
        let (mut live, failed, stopped) = self.clone().into_parts();
        let b = live.pop().expect("two live contexts");
        let a = live.pop().expect("two live contexts");

        // (1) neither branch added soft constraints
        if a.ctr_set.soft_len() != base_soft || b.ctr_set.soft_len() != base_soft {
            return self;
        }

        let new_a: Vec<CtrId> = a
            .ctr_set
            .ctrs_since(base_pool)
            .iter()
            .map(|c| c.id)
            .collect();
        let new_b: Vec<CtrId> = b
            .ctr_set
            .ctrs_since(base_pool)
            .iter()
            .map(|c| c.id)
            .collect();

        // (2) one-sided delta: keep both branches, but mark the other
        // branch's additions as already checked
        if new_a.is_empty() != new_b.is_empty() {
            let (zero, other, other_ids) = if new_a.is_empty() {
                (a, b, new_b)
            } else {
                (b, a, new_a)
            };
            let marked = zero.ctr_set.mark_pushed(other_ids);
            let zero = zero.with_ctr_set(marked);
            let governor = self.governor().clone();
            return ContextSet::assemble(vec![zero, other], failed, stopped, governor);
        }

        // (3) two-sided deltas must only constrain call-local symbols. The
        // single complementary pair produced by the fork itself is exempt:
        // its two path conditions partition truth, so dropping both on
        // merge loses nothing the caller could observe.
        let extras_a = a.ctr_set.ctrs_since(base_pool);
        let extras_b = b.ctr_set.ctrs_since(base_pool);
        let fork_pair = !extras_a.is_empty()
            && !extras_b.is_empty()
            && complementary(&extras_a[0], &extras_b[0]);
        let skip = usize::from(fork_pair);
        let touches_caller = extras_a
            .iter()
            .skip(skip)
            .chain(extras_b.iter().skip(skip))
            .any(|c| c.mentions_sym_where(&|id| id < sym_watermark));
        if touches_caller {
            return self;
        }

        // (4) deeply equal return values, tolerating renamed fresh addresses
        let mark = old_heap.addr_max();
        let mut eq_map: HashMap<Addr, Addr> = HashMap::new();
        if !values_equal(
            &a.ret_val,
            &b.ret_val,
            &a.heap,
            &b.heap,
            mark,
            &mut eq_map,
            sym_watermark,
        ) {
            return self;
        }

        // (5) the shared heap region is untouched by both branches
        if !heap_prefix_equal(old_heap, &a.heap, mark)
            || !heap_prefix_equal(old_heap, &b.heap, mark)
        {
            return self;
        }

        debug!(
            "pruned pure call fork (pool {} -> {})",
            a.ctr_set.pool_len(),
            base_pool
        );
        let merged = a.with_ctr_set(old_ctr.clone());
        let governor = self.governor().clone();
        ContextSet::assemble(vec![merged], failed, stopped, governor)
    }
}

/// Are two constraints the complementary halves of one fork, i.e. `p` and
/// `not p` over the same boolean expression?
fn complementary(a: &Ctr, b: &Ctr) -> bool {
    match (&a.kind, &b.kind) {
        (CtrKind::ExpBool(p), CtrKind::ExpBool(q)) => {
            matches!(&**q, ExpBool::Not { operand, .. } if operand == p)
                || matches!(&**p, ExpBool::Not { operand, .. } if operand == q)
        }
        _ => false,
    }
}

fn heap_prefix_equal(original: &ShHeap, branch: &ShHeap, mark: i64) -> bool {
    for (addr, value) in original.entries() {
        if addr.0 > mark {
            continue;
        }
        match branch.get_val(addr) {
            Some(other) if other == value => {}
            _ => return false,
        }
    }
    // a branch must not have materialized new values below the mark either
    branch
        .entries()
        .filter(|(addr, _)| addr.0 <= mark)
        .all(|(addr, _)| original.get_val(addr).is_some())
}

/// Address pair admissibility: below the high-water mark both sides must be
/// the same address; above it, the equivalence map is extended greedily and
/// a conflicting rebinding fails the whole comparison.
fn addrs_match(a: Addr, b: Addr, mark: i64, eq_map: &mut HashMap<Addr, Addr>) -> Option<bool> {
    if a.0 <= mark || b.0 <= mark {
        return Some(a == b);
    }
    match eq_map.get(&a) {
        Some(mapped) => Some(*mapped == b),
        None => {
            eq_map.insert(a, b);
            // freshly bound: caller should recurse into the pointees
            None
        }
    }
}

fn values_equal(
    a: &ShValue,
    b: &ShValue,
    heap_a: &ShHeap,
    heap_b: &ShHeap,
    mark: i64,
    eq_map: &mut HashMap<Addr, Addr>,
    sym_watermark: u32,
) -> bool {
    let fresh = |id: u32| id >= sym_watermark;
    match (a, b) {
        (ShValue::Int(l), ShValue::Int(r)) | (ShValue::Float(l), ShValue::Float(r)) => {
            let l = argus_sym::simplify::simplify_num(l);
            let r = argus_sym::simplify::simplify_num(r);
            // comparisons are restricted to pre-call terms
            if num_mentions_where(&l, &fresh) || num_mentions_where(&r, &fresh) {
                return false;
            }
            l == r
        }
        (ShValue::Bool(l), ShValue::Bool(r)) => {
            let l = argus_sym::simplify::simplify_bool(l);
            let r = argus_sym::simplify::simplify_bool(r);
            if bool_mentions_where(&l, &fresh) || bool_mentions_where(&r, &fresh) {
                return false;
            }
            l == r
        }
        (ShValue::Str(l), ShValue::Str(r)) => {
            let l = argus_sym::simplify::simplify_str(l);
            let r = argus_sym::simplify::simplify_str(r);
            if str_mentions_where(&l, &fresh) || str_mentions_where(&r, &fresh) {
                return false;
            }
            l == r
        }
        (ShValue::Obj(l), ShValue::Obj(r)) => {
            match addrs_match(l.addr, r.addr, mark, eq_map) {
                Some(false) => return false,
                Some(true) | None => {}
            }
            match (&l.shape, &r.shape) {
                (None, None) => {}
                (Some(ls), Some(rs)) => {
                    if shape_mentions_where(ls, &fresh) || shape_mentions_where(rs, &fresh) {
                        return false;
                    }
                    if ls != rs {
                        return false;
                    }
                }
                _ => return false,
            }
            maps_equal(&l.attrs, &r.attrs, heap_a, heap_b, mark, eq_map, sym_watermark)
                && l.indices.len() == r.indices.len()
                && l.indices.iter().all(|(k, lv)| {
                    r.indices.get(k).is_some_and(|rv| {
                        values_equal(lv, rv, heap_a, heap_b, mark, eq_map, sym_watermark)
                    })
                })
                && maps_equal(
                    &l.key_values,
                    &r.key_values,
                    heap_a,
                    heap_b,
                    mark,
                    eq_map,
                    sym_watermark,
                )
        }
        (ShValue::Addr(l), ShValue::Addr(r)) => match addrs_match(*l, *r, mark, eq_map) {
            Some(decided) => decided,
            None => match (heap_a.get_val(*l), heap_b.get_val(*r)) {
                (Some(lv), Some(rv)) => {
                    values_equal(lv, rv, heap_a, heap_b, mark, eq_map, sym_watermark)
                }
                (None, None) => true,
                _ => false,
            },
        },
        (ShValue::Func(l), ShValue::Func(r)) => {
            if !Rc::ptr_eq(&l.body, &r.body) || l.params != r.params {
                return false;
            }
            match (l.bound_self, r.bound_self) {
                (None, None) => {}
                (Some(la), Some(ra)) => {
                    if addrs_match(la, ra, mark, eq_map) == Some(false) {
                        return false;
                    }
                }
                _ => return false,
            }
            l.env == r.env
        }
        (ShValue::None, ShValue::None)
        | (ShValue::NotImpl, ShValue::NotImpl)
        | (ShValue::Undef, ShValue::Undef) => true,
        // error values never merge
        _ => false,
    }
}

fn maps_equal(
    l: &HashMap<Rc<str>, ShValue>,
    r: &HashMap<Rc<str>, ShValue>,
    heap_a: &ShHeap,
    heap_b: &ShHeap,
    mark: i64,
    eq_map: &mut HashMap<Addr, Addr>,
    sym_watermark: u32,
) -> bool {
    l.len() == r.len()
        && l.iter().all(|(k, lv)| {
            r.get(k)
                .is_some_and(|rv| values_equal(lv, rv, heap_a, heap_b, mark, eq_map, sym_watermark))
        })
}
