//! The incremental constraint set: a persistent record of every constraint a
//! path has accumulated, with conservative range/string caches that answer
//! immediate-satisfiability queries without an external solver.
//!
//! Heavy fields are `Rc`-wrapped and cloned copy-on-write, so forking a path
//! shares the common prefix structurally. Sets are never merged; sibling
//! paths only share what they accumulated before the fork.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use argus_ir::Source;
use log::trace;
use serde::Serialize;

use crate::constraint::{Ctr, CtrKind, CtrRef};
use crate::exp::{BoolRef, ExpBool, ExpNum, ExpShape, NumBop, NumRef, NumUop, ShapeRef, SymExp};
use crate::range::NumRange;
use crate::simplify::{simplify_exp, simplify_num, simplify_shape};
use crate::symbol::{CtrId, IdManager, SymId, SymKind, Symbol};

/// Outcome of the numpy-style broadcast dimension selection.
#[derive(Clone, Debug, PartialEq)]
pub enum BroadcastSelect {
    /// The surviving dimension.
    Selected(NumRef),
    /// The two dimensions can never broadcast.
    Impossible,
    Undecided,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Hard,
    Soft,
    Path,
}

#[derive(Clone, Debug)]
pub struct ConstraintSet {
    ids: IdManager,
    /// Append-only log of every constraint ever pushed, by insertion order.
    ctr_pool: Rc<Vec<CtrRef>>,
    hard: Rc<Vec<usize>>,
    soft: Rc<Vec<usize>>,
    path: Rc<Vec<usize>>,
    pushed: Rc<HashSet<CtrId>>,
    range_cache: Rc<HashMap<SymId, NumRange>>,
    string_cache: Rc<HashMap<SymId, Rc<str>>>,
    /// Strings a symbol is proven *not* equal to.
    non_string_cache: Rc<HashMap<SymId, HashSet<Rc<str>>>>,
    /// `Some(false)` once any added constraint is proven trivially false.
    valid: Option<bool>,
}

impl ConstraintSet {
    pub fn new(ids: IdManager) -> Self {
        ConstraintSet {
            ids,
            ctr_pool: Rc::new(Vec::new()),
            hard: Rc::new(Vec::new()),
            soft: Rc::new(Vec::new()),
            path: Rc::new(Vec::new()),
            pushed: Rc::new(HashSet::new()),
            range_cache: Rc::new(HashMap::new()),
            string_cache: Rc::new(HashMap::new()),
            non_string_cache: Rc::new(HashMap::new()),
            valid: None,
        }
    }

    pub fn ids(&self) -> &IdManager {
        &self.ids
    }

    pub fn valid(&self) -> Option<bool> {
        self.valid
    }

    pub fn is_invalid(&self) -> bool {
        self.valid == Some(false)
    }

    pub fn has_path_ctr(&self) -> bool {
        !self.path.is_empty()
    }

    pub fn pool_len(&self) -> usize {
        self.ctr_pool.len()
    }

    pub fn hard_len(&self) -> usize {
        self.hard.len()
    }

    pub fn soft_len(&self) -> usize {
        self.soft.len()
    }

    pub fn path_len(&self) -> usize {
        self.path.len()
    }

    pub fn ctr_at(&self, index: usize) -> Option<&CtrRef> {
        self.ctr_pool.get(index)
    }

    /// Constraints appended after `mark` (pool indices `mark..len`).
    pub fn ctrs_since(&self, mark: usize) -> &[CtrRef] {
        &self.ctr_pool[mark.min(self.ctr_pool.len())..]
    }

    /// Record foreign constraint ids as already pushed, so a later push of
    /// the same constraint is a no-op. Used by the weak pruning path.
    pub fn mark_pushed(&self, ids: impl IntoIterator<Item = CtrId>) -> Self {
        let mut next = self.clone();
        let pushed = Rc::make_mut(&mut next.pushed);
        pushed.extend(ids);
        next
    }

    // ----- symbol generation -----

    pub fn gen_sym_int(&self, name: &str, source: Source) -> NumRef {
        ExpNum::from_symbol(self.ids.fresh_symbol(SymKind::Int, name, source))
    }

    pub fn gen_sym_float(&self, name: &str, source: Source) -> NumRef {
        ExpNum::from_symbol(self.ids.fresh_symbol(SymKind::Float, name, source))
    }

    pub fn gen_sym_bool(&self, name: &str, source: Source) -> BoolRef {
        ExpBool::from_symbol(self.ids.fresh_symbol(SymKind::Bool, name, source))
    }

    pub fn gen_sym_string(&self, name: &str, source: Source) -> crate::exp::StrRef {
        crate::exp::ExpString::from_symbol(self.ids.fresh_symbol(SymKind::Str, name, source))
    }

    pub fn gen_sym_shape(&self, name: &str, source: Source) -> ShapeRef {
        ExpShape::from_symbol(self.ids.fresh_symbol(SymKind::Shape, name, source))
    }

    /// Fresh int symbol immediately hard-constrained `lower <= sym`. When the
    /// bound already has a valid cached range the range cache is spliced
    /// directly, skipping the full guarantee pass.
    pub fn gen_sym_int_gte(
        &self,
        name: &str,
        lower: &NumRef,
        source: Source,
    ) -> (Self, NumRef) {
        let sym = self.ids.fresh_symbol(SymKind::Int, name, source);
        let sym_id = sym.id;
        let exp = ExpNum::from_symbol(sym);
        let ctr = self.gen_lte(lower.clone(), exp.clone(), None, source);
        if let Some(r) = self.get_cached_range(lower) {
            let spliced = NumRange::new(r.start(), f64::INFINITY, r.closed_start(), false)
                .to_int_range();
            if spliced.is_valid() {
                let mut next = self.clone();
                Rc::make_mut(&mut next.range_cache).insert(sym_id, spliced);
                next.push(ctr, Role::Hard);
                return (next, exp);
            }
        }
        (self.guarantee(ctr), exp)
    }

    /// Fresh int symbol immediately hard-constrained equal to `value`.
    pub fn gen_sym_int_eq(&self, name: &str, value: &NumRef, source: Source) -> (Self, NumRef) {
        let sym = self.ids.fresh_symbol(SymKind::Int, name, source);
        let sym_id = sym.id;
        let exp = ExpNum::from_symbol(sym);
        let ctr = self.gen_equality(
            SymExp::Num(exp.clone()),
            SymExp::Num(value.clone()),
            None,
            source,
        );
        if let Some(r) = self.get_cached_range(value) {
            let spliced = r.to_int_range();
            if spliced.is_valid() {
                let mut next = self.clone();
                Rc::make_mut(&mut next.range_cache).insert(sym_id, spliced);
                next.push(ctr, Role::Hard);
                return (next, exp);
            }
        }
        (self.guarantee(ctr), exp)
    }

    // ----- constraint constructors -----

    fn make(&self, kind: CtrKind, message: Option<Rc<str>>, source: Source) -> CtrRef {
        Rc::new(Ctr {
            id: self.ids.next_ctr_id(),
            kind,
            message,
            source,
        })
    }

    pub fn gen_equality(
        &self,
        left: SymExp,
        right: SymExp,
        message: Option<Rc<str>>,
        source: Source,
    ) -> CtrRef {
        self.make(CtrKind::Equal { left, right }, message, source)
    }

    pub fn gen_not_equal(
        &self,
        left: SymExp,
        right: SymExp,
        message: Option<Rc<str>>,
        source: Source,
    ) -> CtrRef {
        self.make(CtrKind::NotEqual { left, right }, message, source)
    }

    pub fn gen_lt(
        &self,
        left: NumRef,
        right: NumRef,
        message: Option<Rc<str>>,
        source: Source,
    ) -> CtrRef {
        self.make(CtrKind::LessThan { left, right }, message, source)
    }

    pub fn gen_lte(
        &self,
        left: NumRef,
        right: NumRef,
        message: Option<Rc<str>>,
        source: Source,
    ) -> CtrRef {
        self.make(CtrKind::LessThanOrEqual { left, right }, message, source)
    }

    pub fn gen_and(&self, left: CtrRef, right: CtrRef, source: Source) -> CtrRef {
        self.make(CtrKind::And { left, right }, None, source)
    }

    pub fn gen_or(&self, left: CtrRef, right: CtrRef, source: Source) -> CtrRef {
        self.make(CtrKind::Or { left, right }, None, source)
    }

    pub fn gen_not(&self, inner: CtrRef, source: Source) -> CtrRef {
        self.make(CtrKind::Not(inner), None, source)
    }

    pub fn gen_broad(
        &self,
        left: ShapeRef,
        right: ShapeRef,
        message: Option<Rc<str>>,
        source: Source,
    ) -> CtrRef {
        self.make(CtrKind::Broadcastable { left, right }, message, source)
    }

    pub fn gen_forall(
        &self,
        sym: Symbol,
        lower: NumRef,
        upper: NumRef,
        body: CtrRef,
        source: Source,
    ) -> CtrRef {
        self.make(
            CtrKind::Forall {
                sym,
                lower,
                upper,
                body,
            },
            None,
            source,
        )
    }

    pub fn gen_fail(&self, message: impl Into<Rc<str>>, source: Source) -> CtrRef {
        self.make(CtrKind::Fail, Some(message.into()), source)
    }

    pub fn gen_bool(&self, exp: BoolRef, message: Option<Rc<str>>, source: Source) -> CtrRef {
        self.make(CtrKind::ExpBool(exp), message, source)
    }

    // ----- append disciplines -----

    /// Append as a soft assumption. An immediately falsifiable constraint
    /// marks the set invalid but is still appended so the failure reads
    /// back from the pool. Soft constraints never refine the caches.
    pub fn require(&self, ctr: CtrRef) -> Self {
        let mut next = self.clone();
        if next.check_immediate_ctr(&ctr) == Some(false) {
            trace!("require refuted immediately: {ctr}");
            next.valid = Some(false);
        }
        next.push(ctr, Role::Soft);
        next
    }

    /// Append as a hard fact, running the incremental solving pass.
    pub fn guarantee(&self, ctr: CtrRef) -> Self {
        self.append_solving(ctr, Role::Hard)
    }

    /// Append as a path condition; same solving discipline as `guarantee`.
    pub fn add_if(&self, ctr: CtrRef) -> Self {
        self.append_solving(ctr, Role::Path)
    }

    fn append_solving(&self, ctr: CtrRef, role: Role) -> Self {
        let mut next = self.clone();
        match next.check_immediate_ctr(&ctr) {
            Some(false) => {
                trace!("constraint refuted immediately: {ctr}");
                next.valid = Some(false);
            }
            _ => {
                if !next.apply_ctr(&ctr) {
                    trace!("cache refinement emptied a range: {ctr}");
                    next.valid = Some(false);
                }
            }
        }
        next.push(ctr, role);
        next
    }

    fn push(&mut self, ctr: CtrRef, role: Role) {
        if self.pushed.contains(&ctr.id) {
            return;
        }
        Rc::make_mut(&mut self.pushed).insert(ctr.id);
        let pool = Rc::make_mut(&mut self.ctr_pool);
        pool.push(ctr);
        let index = pool.len() - 1;
        let list = match role {
            Role::Hard => &mut self.hard,
            Role::Soft => &mut self.soft,
            Role::Path => &mut self.path,
        };
        Rc::make_mut(list).push(index);
    }

    // ----- incremental cache refinement -----

    /// Refine the caches from a hard/path constraint. Returns `false` when
    /// the refinement empties a range (the constraint is unsatisfiable
    /// against the facts already cached).
    fn apply_ctr(&mut self, ctr: &Ctr) -> bool {
        match &ctr.kind {
            CtrKind::Equal { left, right } => self.apply_equal(left, right),
            CtrKind::NotEqual { left, right } => self.apply_not_equal(left, right),
            CtrKind::LessThan { left, right } => self.apply_compare(left, right, true),
            CtrKind::LessThanOrEqual { left, right } => self.apply_compare(left, right, false),
            CtrKind::And { left, right } => self.apply_ctr(left) && self.apply_ctr(right),
            CtrKind::Or { left, right } => {
                // unit propagation only
                match (
                    self.check_immediate_ctr(left),
                    self.check_immediate_ctr(right),
                ) {
                    (Some(false), Some(false)) => false,
                    (Some(false), _) => self.apply_ctr(right),
                    (_, Some(false)) => self.apply_ctr(left),
                    _ => true,
                }
            }
            CtrKind::Not(_) | CtrKind::Broadcastable { .. } | CtrKind::Forall { .. } => true,
            CtrKind::Fail => false,
            CtrKind::ExpBool(b) => self.apply_bool(b),
        }
    }

    fn apply_bool(&mut self, exp: &BoolRef) -> bool {
        match &**exp {
            ExpBool::Const { value, .. } => *value,
            ExpBool::Sym(_) => true,
            ExpBool::Equal { left, right, .. } => self.apply_equal(left, right),
            ExpBool::NotEqual { left, right, .. } => self.apply_not_equal(left, right),
            ExpBool::LessThan { left, right, .. } => self.apply_compare(left, right, true),
            ExpBool::LessThanOrEqual { left, right, .. } => {
                self.apply_compare(left, right, false)
            }
            ExpBool::And { left, right, .. } => self.apply_bool(left) && self.apply_bool(right),
            ExpBool::Or { left, right, .. } => {
                match (self.check_bool(left), self.check_bool(right)) {
                    (Some(false), Some(false)) => false,
                    (Some(false), _) => self.apply_bool(right),
                    (_, Some(false)) => self.apply_bool(left),
                    _ => true,
                }
            }
            ExpBool::Not { .. } => true,
        }
    }

    fn apply_equal(&mut self, left: &SymExp, right: &SymExp) -> bool {
        match (left, right) {
            (SymExp::Num(l), SymExp::Num(r)) => {
                let l = simplify_num(l);
                let r = simplify_num(r);
                let mut ok = true;
                if let ExpNum::Sym(sym) = &*l {
                    if let Some(range) = self.get_cached_range(&r) {
                        ok &= self.refine_sym(sym, &range);
                    }
                }
                if let ExpNum::Sym(sym) = &*r {
                    if let Some(range) = self.get_cached_range(&l) {
                        ok &= self.refine_sym(sym, &range);
                    }
                }
                ok
            }
            (SymExp::Str(l), SymExp::Str(r)) => {
                let l = crate::simplify::simplify_str(l);
                let r = crate::simplify::simplify_str(r);
                let mut ok = true;
                if let (crate::exp::ExpString::Sym(sym), Some(value)) =
                    (&*l, self.resolve_string(&r))
                {
                    ok &= self.learn_string(sym.id, value);
                }
                if let (crate::exp::ExpString::Sym(sym), Some(value)) =
                    (&*r, self.resolve_string(&l))
                {
                    ok &= self.learn_string(sym.id, value);
                }
                ok
            }
            (SymExp::Shape(l), SymExp::Shape(r)) => {
                let l = simplify_shape(l);
                let r = simplify_shape(r);
                if let (Some(ld), Some(rd)) = (self.get_cached_shape(&l), self.get_cached_shape(&r))
                {
                    if ld.len() != rd.len() {
                        return false;
                    }
                    for (a, b) in ld.iter().zip(rd.iter()) {
                        if !self.apply_equal(&SymExp::Num(a.clone()), &SymExp::Num(b.clone())) {
                            return false;
                        }
                    }
                }
                true
            }
            _ => true,
        }
    }

    fn apply_not_equal(&mut self, left: &SymExp, right: &SymExp) -> bool {
        if let (SymExp::Str(l), SymExp::Str(r)) = (left, right) {
            let l = crate::simplify::simplify_str(l);
            let r = crate::simplify::simplify_str(r);
            if let (crate::exp::ExpString::Sym(sym), Some(value)) = (&*l, self.resolve_string(&r)) {
                return self.learn_not_string(sym.id, value);
            }
            if let (crate::exp::ExpString::Sym(sym), Some(value)) = (&*r, self.resolve_string(&l)) {
                return self.learn_not_string(sym.id, value);
            }
        }
        true
    }

    fn apply_compare(&mut self, left: &NumRef, right: &NumRef, strict: bool) -> bool {
        let left = simplify_num(left);
        let right = simplify_num(right);
        let mut ok = true;
        if let ExpNum::Sym(sym) = &*left {
            if let Some(r) = self.get_cached_range(&right) {
                let upper = if strict {
                    NumRange::lt(r.end())
                } else {
                    NumRange::new(f64::NEG_INFINITY, r.end(), false, r.closed_end())
                };
                ok &= self.refine_sym(sym, &upper);
            }
        }
        if let ExpNum::Sym(sym) = &*right {
            if let Some(l) = self.get_cached_range(&left) {
                let lower = if strict {
                    NumRange::gt(l.start())
                } else {
                    NumRange::new(l.start(), f64::INFINITY, l.closed_start(), false)
                };
                ok &= self.refine_sym(sym, &lower);
            }
        }
        ok
    }

    fn refine_sym(&mut self, sym: &Symbol, with: &NumRange) -> bool {
        let current = self.range_cache.get(&sym.id).copied();
        let mut refined = match current {
            Some(cur) => cur.intersect(with),
            None => *with,
        };
        if sym.kind == SymKind::Int {
            refined = refined.to_int_range();
        }
        if !refined.is_valid() {
            return false;
        }
        Rc::make_mut(&mut self.range_cache).insert(sym.id, refined);
        true
    }

    fn learn_string(&mut self, id: SymId, value: Rc<str>) -> bool {
        if let Some(existing) = self.string_cache.get(&id) {
            return **existing == *value;
        }
        if let Some(refuted) = self.non_string_cache.get(&id) {
            if refuted.contains(&value) {
                return false;
            }
        }
        Rc::make_mut(&mut self.string_cache).insert(id, value);
        true
    }

    fn learn_not_string(&mut self, id: SymId, value: Rc<str>) -> bool {
        if let Some(existing) = self.string_cache.get(&id) {
            if **existing == *value {
                return false;
            }
            return true;
        }
        Rc::make_mut(&mut self.non_string_cache)
            .entry(id)
            .or_default()
            .insert(value);
        true
    }

    fn resolve_string(&self, exp: &crate::exp::StrRef) -> Option<Rc<str>> {
        match &**exp {
            crate::exp::ExpString::Const { value, .. } => Some(value.clone()),
            crate::exp::ExpString::Sym(sym) => self.string_cache.get(&sym.id).cloned(),
            crate::exp::ExpString::Concat { left, right, .. } => {
                let l = self.resolve_string(left)?;
                let r = self.resolve_string(right)?;
                Some(format!("{l}{r}").into())
            }
        }
    }

    // ----- immediate satisfiability -----

    /// Three-valued structural check: `Some(true)` = provably satisfied
    /// under the cached facts, `Some(false)` = provably violated, `None` =
    /// undecided. Never reports false certainty.
    pub fn check_immediate_ctr(&self, ctr: &Ctr) -> Option<bool> {
        match &ctr.kind {
            CtrKind::Equal { left, right } => self.check_eq(left, right),
            CtrKind::NotEqual { left, right } => self.check_eq(left, right).map(|b| !b),
            CtrKind::LessThan { left, right } => self.check_lt(left, right),
            CtrKind::LessThanOrEqual { left, right } => self.check_lte(left, right),
            CtrKind::And { left, right } => {
                and3(self.check_immediate_ctr(left), || {
                    self.check_immediate_ctr(right)
                })
            }
            CtrKind::Or { left, right } => {
                or3(self.check_immediate_ctr(left), || {
                    self.check_immediate_ctr(right)
                })
            }
            CtrKind::Not(inner) => self.check_immediate_ctr(inner).map(|b| !b),
            CtrKind::Broadcastable { left, right } => self.check_broadcastable(left, right),
            CtrKind::Forall { .. } => None,
            CtrKind::Fail => Some(false),
            CtrKind::ExpBool(b) => self.check_bool(b),
        }
    }

    pub fn check_bool(&self, exp: &BoolRef) -> Option<bool> {
        match &**exp {
            ExpBool::Const { value, .. } => Some(*value),
            ExpBool::Sym(_) => None,
            ExpBool::Equal { left, right, .. } => self.check_eq(left, right),
            ExpBool::NotEqual { left, right, .. } => self.check_eq(left, right).map(|b| !b),
            ExpBool::LessThan { left, right, .. } => self.check_lt(left, right),
            ExpBool::LessThanOrEqual { left, right, .. } => self.check_lte(left, right),
            ExpBool::Not { operand, .. } => self.check_bool(operand).map(|b| !b),
            ExpBool::And { left, right, .. } => {
                and3(self.check_bool(left), || self.check_bool(right))
            }
            ExpBool::Or { left, right, .. } => {
                or3(self.check_bool(left), || self.check_bool(right))
            }
        }
    }

    /// `left < right`, decided through the range of the simplified
    /// difference so that correlated operands cancel (`x < x + 1`).
    fn check_lt(&self, left: &NumRef, right: &NumRef) -> Option<bool> {
        let diff = simplify_num(&ExpNum::sub(right.clone(), left.clone(), Source::Unknown));
        let dr = self.get_cached_range(&diff)?;
        NumRange::point(0.0).always_lt(&dr)
    }

    fn check_lte(&self, left: &NumRef, right: &NumRef) -> Option<bool> {
        let left = simplify_num(left);
        let right = simplify_num(right);
        if left == right {
            return Some(true);
        }
        let diff = simplify_num(&ExpNum::sub(right, left, Source::Unknown));
        let dr = self.get_cached_range(&diff)?;
        NumRange::point(0.0).always_lte(&dr)
    }

    fn check_eq(&self, left: &SymExp, right: &SymExp) -> Option<bool> {
        let left = simplify_exp(left);
        let right = simplify_exp(right);
        if left == right {
            return Some(true);
        }
        match (&left, &right) {
            (SymExp::Num(l), SymExp::Num(r)) => {
                let diff = simplify_num(&ExpNum::sub(r.clone(), l.clone(), Source::Unknown));
                let dr = self.get_cached_range(&diff)?;
                NumRange::point(0.0).always_eq(&dr)
            }
            (SymExp::Str(l), SymExp::Str(r)) => {
                match (self.resolve_string(l), self.resolve_string(r)) {
                    (Some(a), Some(b)) => Some(a == b),
                    _ => {
                        // a cached refutation decides inequality
                        if let (crate::exp::ExpString::Sym(sym), Some(value)) =
                            (&**l, self.resolve_string(r))
                        {
                            if self
                                .non_string_cache
                                .get(&sym.id)
                                .is_some_and(|set| set.contains(&value))
                            {
                                return Some(false);
                            }
                        }
                        None
                    }
                }
            }
            (SymExp::Bool(l), SymExp::Bool(r)) => {
                let a = self.check_bool(l)?;
                let b = self.check_bool(r)?;
                Some(a == b)
            }
            (SymExp::Shape(l), SymExp::Shape(r)) => {
                let ld = self.get_cached_shape(l)?;
                let rd = self.get_cached_shape(r)?;
                if ld.len() != rd.len() {
                    return Some(false);
                }
                let mut all_true = true;
                for (a, b) in ld.iter().zip(rd.iter()) {
                    match self.check_eq(&SymExp::Num(a.clone()), &SymExp::Num(b.clone())) {
                        Some(true) => {}
                        Some(false) => return Some(false),
                        None => all_true = false,
                    }
                }
                if all_true { Some(true) } else { None }
            }
            // different sorts never compare equal
            _ => Some(false),
        }
    }

    fn check_broadcastable(&self, left: &ShapeRef, right: &ShapeRef) -> Option<bool> {
        let ld = self.get_cached_shape(&simplify_shape(left))?;
        let rd = self.get_cached_shape(&simplify_shape(right))?;
        let rank = ld.len().max(rd.len());
        let one = ExpNum::constant(1.0, Source::Unknown);
        let mut all_selected = true;
        for i in 0..rank {
            let l = if i < rank - ld.len() {
                &one
            } else {
                &ld[i - (rank - ld.len())]
            };
            let r = if i < rank - rd.len() {
                &one
            } else {
                &rd[i - (rank - rd.len())]
            };
            match self.select_broadcastable(l, r) {
                BroadcastSelect::Selected(_) => {}
                BroadcastSelect::Impossible => return Some(false),
                BroadcastSelect::Undecided => all_selected = false,
            }
        }
        if all_selected { Some(true) } else { None }
    }

    /// Which of two dimensions survives broadcasting: a range-constant 1
    /// always yields the other side; constant unequal non-1 pairs and
    /// disjoint ranges are impossible; provably equal dimensions yield
    /// either side; anything else is undecided.
    pub fn select_broadcastable(&self, left: &NumRef, right: &NumRef) -> BroadcastSelect {
        let left = simplify_num(left);
        let right = simplify_num(right);
        let lr = self.get_cached_range(&left);
        let rr = self.get_cached_range(&right);
        if lr.is_some_and(|r| r.as_const() == Some(1.0)) {
            return BroadcastSelect::Selected(right);
        }
        if rr.is_some_and(|r| r.as_const() == Some(1.0)) {
            return BroadcastSelect::Selected(left);
        }
        if let (Some(l), Some(r)) = (lr, rr) {
            if let (Some(a), Some(b)) = (l.as_const(), r.as_const()) {
                if a != b {
                    return BroadcastSelect::Impossible;
                }
            }
            if !l.intersect(&r).is_valid() {
                return BroadcastSelect::Impossible;
            }
        }
        if left == right {
            return BroadcastSelect::Selected(left);
        }
        BroadcastSelect::Undecided
    }

    // ----- conservative range evaluation -----

    /// Bottom-up range of a numeric expression; `None` the moment any
    /// subterm is unknown or composes to an invalid range.
    pub fn get_cached_range(&self, exp: &ExpNum) -> Option<NumRange> {
        let range = match exp {
            ExpNum::Const { value, .. } => NumRange::point(*value),
            ExpNum::Sym(sym) => *self.range_cache.get(&sym.id)?,
            ExpNum::Uop { op, operand, .. } => {
                let r = self.get_cached_range(operand)?;
                match op {
                    NumUop::Neg => r.neg(),
                    NumUop::Floor => r.floor(),
                    NumUop::Ceil => r.ceil(),
                    NumUop::Abs => r.abs(),
                }
            }
            ExpNum::Bop {
                op, left, right, ..
            } => {
                let l = self.get_cached_range(left)?;
                let r = self.get_cached_range(right)?;
                match op {
                    NumBop::Add => l.add(&r),
                    NumBop::Sub => l.sub(&r),
                    NumBop::Mul => l.mul(&r),
                    NumBop::TrueDiv => l.true_div(&r),
                    NumBop::FloorDiv => l.floor_div(&r),
                    NumBop::Mod => l.modulo(&r),
                }
            }
            ExpNum::Max { operands, .. } => {
                let mut acc: Option<NumRange> = None;
                for op in operands {
                    let r = self.get_cached_range(op)?;
                    acc = Some(match acc {
                        Some(a) => a.max_with(&r),
                        None => r,
                    });
                }
                acc?
            }
            ExpNum::Min { operands, .. } => {
                let mut acc: Option<NumRange> = None;
                for op in operands {
                    let r = self.get_cached_range(op)?;
                    acc = Some(match acc {
                        Some(a) => a.min_with(&r),
                        None => r,
                    });
                }
                acc?
            }
            ExpNum::Index { shape, index, .. } => {
                let dims = self.get_cached_shape(shape)?;
                let i = simplify_num(index).as_const_int()?;
                if i < 0 || i as usize >= dims.len() {
                    return None;
                }
                self.get_cached_range(&dims[i as usize])?
            }
            ExpNum::Numel { shape, .. } => {
                let dims = self.get_cached_shape(shape)?;
                let mut acc = NumRange::point(1.0);
                for d in &dims {
                    acc = acc.mul(&self.get_cached_range(d)?);
                }
                acc
            }
        };
        if range.is_valid() { Some(range) } else { None }
    }

    /// Statically-known dimension list of a shape expression. `Slice`,
    /// `Concat` and `Broadcast` deliberately resolve to `None` even over
    /// constant sub-shapes; downstream logic relies on "unknown" meaning
    /// "try another route".
    pub fn get_cached_shape(&self, exp: &ExpShape) -> Option<Vec<NumRef>> {
        match exp {
            ExpShape::Const { dims, .. } => Some(dims.clone()),
            ExpShape::Sym(_) => None,
            ExpShape::Set {
                base, axis, dim, ..
            } => {
                let mut dims = self.get_cached_shape(base)?;
                if *axis >= dims.len() {
                    return None;
                }
                dims[*axis] = dim.clone();
                Some(dims)
            }
            ExpShape::Slice { .. } | ExpShape::Concat { .. } | ExpShape::Broadcast { .. } => None,
        }
    }

    // ----- dump -----

    /// The JSON document handed to the external solver: the ordered pool
    /// (rendered constraints with positions) plus the role index arrays.
    pub fn dump(&self) -> CtrSetDump {
        CtrSetDump {
            pool: self
                .ctr_pool
                .iter()
                .map(|ctr| CtrDump {
                    repr: ctr.render(),
                    source: ctr.source,
                    message: ctr.message.as_ref().map(|m| m.to_string()),
                })
                .collect(),
            hard: self.hard.to_vec(),
            soft: self.soft.to_vec(),
            path: self.path.to_vec(),
            valid: self.valid,
        }
    }
}

fn and3(left: Option<bool>, right: impl FnOnce() -> Option<bool>) -> Option<bool> {
    match left {
        Some(false) => Some(false),
        Some(true) => right(),
        None => match right() {
            Some(false) => Some(false),
            _ => None,
        },
    }
}

fn or3(left: Option<bool>, right: impl FnOnce() -> Option<bool>) -> Option<bool> {
    match left {
        Some(true) => Some(true),
        Some(false) => right(),
        None => match right() {
            Some(true) => Some(true),
            _ => None,
        },
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CtrSetDump {
    pub pool: Vec<CtrDump>,
    pub hard: Vec<usize>,
    pub soft: Vec<usize>,
    pub path: Vec<usize>,
    pub valid: Option<bool>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CtrDump {
    pub repr: String,
    pub source: Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> ConstraintSet {
        ConstraintSet::new(IdManager::new())
    }

    fn c(v: f64) -> NumRef {
        ExpNum::constant(v, Source::Unknown)
    }

    #[test]
    fn equal_consts_check_immediately() {
        let cs = fresh();
        let eq = cs.gen_equality(SymExp::Num(c(5.0)), SymExp::Num(c(5.0)), None, Source::Unknown);
        assert_eq!(cs.check_immediate_ctr(&eq), Some(true));
        let ne = cs.gen_equality(SymExp::Num(c(5.0)), SymExp::Num(c(3.0)), None, Source::Unknown);
        assert_eq!(cs.check_immediate_ctr(&ne), Some(false));
    }

    #[test]
    fn fresh_symbol_equals_itself() {
        let cs = fresh();
        let x = cs.gen_sym_int("x", Source::Unknown);
        let eq = cs.gen_equality(
            SymExp::Num(x.clone()),
            SymExp::Num(x),
            None,
            Source::Unknown,
        );
        assert_eq!(cs.check_immediate_ctr(&eq), Some(true));
    }

    #[test]
    fn lt_on_consts_and_successor() {
        let cs = fresh();
        let lt = cs.gen_lt(c(5.0), c(3.0), None, Source::Unknown);
        assert_eq!(cs.check_immediate_ctr(&lt), Some(false));

        // x < x + 1 holds for a completely fresh symbol: the difference
        // cancels to the constant 1
        let x = cs.gen_sym_int("x", Source::Unknown);
        let succ = ExpNum::add(x.clone(), c(1.0), Source::Unknown);
        let lt = cs.gen_lt(x, succ, None, Source::Unknown);
        assert_eq!(cs.check_immediate_ctr(&lt), Some(true));
    }

    #[test]
    fn guarantee_refines_range_cache() {
        let cs = fresh();
        let x = cs.gen_sym_int("x", Source::Unknown);
        let lower = cs.gen_lte(c(1.0), x.clone(), None, Source::Unknown);
        let upper = cs.gen_lte(x.clone(), c(10.0), None, Source::Unknown);
        let cs = cs.guarantee(lower).guarantee(upper);
        let range = cs.get_cached_range(&x).expect("range cached");
        assert_eq!(range.start(), 1.0);
        assert_eq!(range.end(), 10.0);
        assert!(range.closed_start() && range.closed_end());

        // now 0 < x is immediately true, x <= 0 immediately false
        let gt0 = cs.gen_lt(c(0.0), x.clone(), None, Source::Unknown);
        assert_eq!(cs.check_immediate_ctr(&gt0), Some(true));
        let le0 = cs.gen_lte(x, c(0.0), None, Source::Unknown);
        assert_eq!(cs.check_immediate_ctr(&le0), Some(false));
    }

    #[test]
    fn contradictory_guarantee_invalidates() {
        let cs = fresh();
        let x = cs.gen_sym_int("x", Source::Unknown);
        let a = cs.gen_lte(c(5.0), x.clone(), None, Source::Unknown);
        let b = cs.gen_lt(x, c(2.0), None, Source::Unknown);
        let cs = cs.guarantee(a).guarantee(b);
        assert!(cs.is_invalid());
        // the pool still records both constraints for diagnostics
        assert_eq!(cs.pool_len(), 2);
    }

    #[test]
    fn require_does_not_refine_but_detects_trivial_falsity() {
        let cs = fresh();
        let x = cs.gen_sym_int("x", Source::Unknown);
        let soft = cs.gen_lte(c(1.0), x.clone(), None, Source::Unknown);
        let cs = cs.require(soft);
        assert!(!cs.is_invalid());
        // soft constraints leave the cache untouched
        assert!(cs.get_cached_range(&x).is_none());

        let bad = cs.gen_lt(c(3.0), c(1.0), None, Source::Unknown);
        let cs = cs.require(bad);
        assert!(cs.is_invalid());
        assert_eq!(cs.soft_len(), 2);
    }

    #[test]
    fn gen_sym_int_gte_splices_cache() {
        let cs = fresh();
        let before = cs.pool_len();
        let (cs, n) = cs.gen_sym_int_gte("n", &c(0.0), Source::Unknown);
        assert_eq!(cs.pool_len(), before + 1);
        let range = cs.get_cached_range(&n).expect("spliced");
        assert_eq!(range.start(), 0.0);
        assert!(range.closed_start());
        assert_eq!(range.end(), f64::INFINITY);
    }

    #[test]
    fn broadcast_selection_rules() {
        let cs = fresh();
        match cs.select_broadcastable(&c(1.0), &c(7.0)) {
            BroadcastSelect::Selected(dim) => assert_eq!(dim.as_const(), Some(7.0)),
            other => panic!("expected selection, got {other:?}"),
        }
        assert_eq!(
            cs.select_broadcastable(&c(3.0), &c(5.0)),
            BroadcastSelect::Impossible
        );

        // fresh symbol bounded [0, ∞) against const 1: symbol side survives
        let (cs, n) = cs.gen_sym_int_gte("n", &c(0.0), Source::Unknown);
        match cs.select_broadcastable(&n, &c(1.0)) {
            BroadcastSelect::Selected(dim) => assert_eq!(dim, n),
            other => panic!("expected symbol side, got {other:?}"),
        }
    }

    #[test]
    fn string_equalities_use_caches() {
        let cs = fresh();
        let s = cs.gen_sym_string("s", Source::Unknown);
        let hello = crate::exp::ExpString::constant("hello", Source::Unknown);
        let eq = cs.gen_equality(
            SymExp::Str(s.clone()),
            SymExp::Str(hello.clone()),
            None,
            Source::Unknown,
        );
        let cs = cs.guarantee(eq);
        assert!(!cs.is_invalid());
        let again = cs.gen_equality(
            SymExp::Str(s.clone()),
            SymExp::Str(hello),
            None,
            Source::Unknown,
        );
        assert_eq!(cs.check_immediate_ctr(&again), Some(true));

        let world = crate::exp::ExpString::constant("world", Source::Unknown);
        let other = cs.gen_equality(SymExp::Str(s), SymExp::Str(world), None, Source::Unknown);
        assert_eq!(cs.check_immediate_ctr(&other), Some(false));
    }

    #[test]
    fn dump_preserves_pool_order_and_roles() {
        let cs = fresh();
        let x = cs.gen_sym_int("x", Source::Unknown);
        let hard = cs.gen_lte(c(0.0), x.clone(), None, Source::Unknown);
        let soft = cs.gen_lt(x.clone(), c(100.0), None, Source::Unknown);
        let path = cs.gen_lt(c(50.0), x, None, Source::Unknown);
        let cs = cs.guarantee(hard).require(soft).add_if(path);
        let dump = cs.dump();
        assert_eq!(dump.pool.len(), 3);
        assert_eq!(dump.hard, vec![0]);
        assert_eq!(dump.soft, vec![1]);
        assert_eq!(dump.path, vec![2]);
        let json = serde_json::to_string(&dump).expect("serialize");
        assert!(json.contains("pool"));
    }
}
