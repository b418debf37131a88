//! Conservative interval arithmetic over `f64` bounds.
//!
//! A range answers "is this expression provably below/equal to that value"
//! without a full solver. Every operation is a pure function returning a new
//! range; comparisons return `Option<bool>` where `None` means the ranges do
//! not decide the question.

use std::fmt;

/// `[start, end]` with independent inclusivity flags. `±∞` bounds are
/// always open. `start > end` (or a half-open point) is the invalid/empty
/// range, used as an explicit sentinel rather than an error.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NumRange {
    start: f64,
    end: f64,
    closed_start: bool,
    closed_end: bool,
}

impl NumRange {
    pub fn new(start: f64, end: f64, closed_start: bool, closed_end: bool) -> Self {
        NumRange {
            start,
            end,
            // Infinite bounds are never attained.
            closed_start: closed_start && start.is_finite(),
            closed_end: closed_end && end.is_finite(),
        }
    }

    /// The unrestricted range `(-∞, ∞)`.
    pub fn top() -> Self {
        NumRange::new(f64::NEG_INFINITY, f64::INFINITY, false, false)
    }

    /// The single-point range `[value, value]`.
    pub fn point(value: f64) -> Self {
        NumRange::new(value, value, true, true)
    }

    /// `[lower, ∞)`.
    pub fn gte(lower: f64) -> Self {
        NumRange::new(lower, f64::INFINITY, true, false)
    }

    /// `(lower, ∞)`.
    pub fn gt(lower: f64) -> Self {
        NumRange::new(lower, f64::INFINITY, false, false)
    }

    /// `(-∞, upper]`.
    pub fn lte(upper: f64) -> Self {
        NumRange::new(f64::NEG_INFINITY, upper, false, true)
    }

    /// `(-∞, upper)`.
    pub fn lt(upper: f64) -> Self {
        NumRange::new(f64::NEG_INFINITY, upper, false, false)
    }

    /// An explicitly empty range.
    pub fn invalid() -> Self {
        NumRange {
            start: 1.0,
            end: 0.0,
            closed_start: false,
            closed_end: false,
        }
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn closed_start(&self) -> bool {
        self.closed_start
    }

    pub fn closed_end(&self) -> bool {
        self.closed_end
    }

    pub fn is_valid(&self) -> bool {
        if self.start.is_nan() || self.end.is_nan() {
            return false;
        }
        if self.start < self.end {
            return true;
        }
        self.start == self.end && self.closed_start && self.closed_end
    }

    /// Const iff both bounds are equal and inclusive.
    pub fn is_const(&self) -> bool {
        self.start == self.end && self.closed_start && self.closed_end
    }

    pub fn as_const(&self) -> Option<f64> {
        if self.is_const() { Some(self.start) } else { None }
    }

    pub fn contains(&self, value: f64) -> bool {
        if !self.is_valid() {
            return false;
        }
        let above = value > self.start || (value == self.start && self.closed_start);
        let below = value < self.end || (value == self.end && self.closed_end);
        above && below
    }

    pub fn intersect(&self, other: &NumRange) -> NumRange {
        let (start, closed_start) = if self.start > other.start {
            (self.start, self.closed_start)
        } else if other.start > self.start {
            (other.start, other.closed_start)
        } else {
            (self.start, self.closed_start && other.closed_start)
        };
        let (end, closed_end) = if self.end < other.end {
            (self.end, self.closed_end)
        } else if other.end < self.end {
            (other.end, other.closed_end)
        } else {
            (self.end, self.closed_end && other.closed_end)
        };
        NumRange::new(start, end, closed_start, closed_end)
    }

    // ----- comparisons: Some(answer) iff decided for every pair of values -----

    /// Is `a < b` for every `a ∈ self`, `b ∈ other`? `Some(false)` means
    /// `a >= b` for every pair; `None` means undecided.
    pub fn always_lt(&self, other: &NumRange) -> Option<bool> {
        if !self.is_valid() || !other.is_valid() {
            return None;
        }
        if self.end < other.start
            || (self.end == other.start && !(self.closed_end && other.closed_start))
        {
            return Some(true);
        }
        if self.start >= other.end {
            return Some(false);
        }
        None
    }

    /// Is `a <= b` for every pair? `Some(false)` means `a > b` for every pair.
    pub fn always_lte(&self, other: &NumRange) -> Option<bool> {
        if !self.is_valid() || !other.is_valid() {
            return None;
        }
        if self.end <= other.start {
            return Some(true);
        }
        if self.start > other.end
            || (self.start == other.end && !(self.closed_start && other.closed_end))
        {
            return Some(false);
        }
        None
    }

    /// Is `a == b` for every pair (`Some(true)` only for equal const ranges);
    /// `Some(false)` iff the ranges are disjoint.
    pub fn always_eq(&self, other: &NumRange) -> Option<bool> {
        if !self.is_valid() || !other.is_valid() {
            return None;
        }
        match (self.as_const(), other.as_const()) {
            (Some(a), Some(b)) => return Some(a == b),
            _ => {}
        }
        if !self.intersect(other).is_valid() {
            return Some(false);
        }
        None
    }

    // ----- arithmetic -----

    pub fn neg(&self) -> NumRange {
        NumRange::new(-self.end, -self.start, self.closed_end, self.closed_start)
    }

    pub fn add(&self, other: &NumRange) -> NumRange {
        NumRange::new(
            self.start + other.start,
            self.end + other.end,
            self.closed_start && other.closed_start,
            self.closed_end && other.closed_end,
        )
    }

    pub fn sub(&self, other: &NumRange) -> NumRange {
        self.add(&other.neg())
    }

    pub fn mul(&self, other: &NumRange) -> NumRange {
        // Point-operand fast paths avoid the 4-corner scan.
        if let Some(c) = self.as_const() {
            return other.scale(c);
        }
        if let Some(c) = other.as_const() {
            return self.scale(c);
        }
        let corners = [
            Corner::mul(self.start, self.closed_start, other.start, other.closed_start),
            Corner::mul(self.start, self.closed_start, other.end, other.closed_end),
            Corner::mul(self.end, self.closed_end, other.start, other.closed_start),
            Corner::mul(self.end, self.closed_end, other.end, other.closed_end),
        ];
        Corner::hull(&corners)
    }

    fn scale(&self, c: f64) -> NumRange {
        if c == 0.0 {
            return NumRange::point(0.0);
        }
        if c > 0.0 {
            NumRange::new(self.start * c, self.end * c, self.closed_start, self.closed_end)
        } else {
            NumRange::new(self.end * c, self.start * c, self.closed_end, self.closed_start)
        }
    }

    /// True division. A divisor range containing 0 yields the unrestricted
    /// range: "don't know", not "impossible".
    pub fn true_div(&self, other: &NumRange) -> NumRange {
        if !other.is_valid() || other.contains(0.0) {
            return NumRange::top();
        }
        if let Some(c) = other.as_const() {
            return self.scale(1.0 / c);
        }
        let corners = [
            Corner::div(self.start, self.closed_start, other.start, other.closed_start),
            Corner::div(self.start, self.closed_start, other.end, other.closed_end),
            Corner::div(self.end, self.closed_end, other.start, other.closed_start),
            Corner::div(self.end, self.closed_end, other.end, other.closed_end),
        ];
        Corner::hull(&corners)
    }

    pub fn floor_div(&self, other: &NumRange) -> NumRange {
        self.true_div(other).floor()
    }

    /// Python-style modulo: the sign of the result follows the divisor.
    /// A divisor range containing 0 yields the unrestricted range.
    pub fn modulo(&self, other: &NumRange) -> NumRange {
        if !other.is_valid() || other.contains(0.0) {
            return NumRange::top();
        }
        if other.start > 0.0 || (other.start == 0.0 && !other.closed_start) {
            // positive divisor: result in [0, max_divisor)
            NumRange::new(0.0, other.end, true, false)
        } else {
            // negative divisor: result in (min_divisor, 0]
            NumRange::new(other.start, 0.0, false, true)
        }
    }

    pub fn floor(&self) -> NumRange {
        let start = if self.start.is_finite() {
            self.start.floor()
        } else {
            self.start
        };
        let end = if self.end.is_finite() {
            if !self.closed_end && self.end.fract() == 0.0 {
                self.end - 1.0
            } else {
                self.end.floor()
            }
        } else {
            self.end
        };
        NumRange::new(start, end, true, true)
    }

    pub fn ceil(&self) -> NumRange {
        self.neg().floor().neg()
    }

    pub fn abs(&self) -> NumRange {
        if !self.is_valid() {
            return *self;
        }
        if self.start >= 0.0 {
            return *self;
        }
        if self.end <= 0.0 {
            return self.neg();
        }
        // straddles zero
        let (mag, closed) = if -self.start > self.end {
            (-self.start, self.closed_start)
        } else if self.end > -self.start {
            (self.end, self.closed_end)
        } else {
            (self.end, self.closed_start || self.closed_end)
        };
        NumRange::new(0.0, mag, true, closed)
    }

    /// Elementwise maximum: the range of `max(a, b)`.
    pub fn max_with(&self, other: &NumRange) -> NumRange {
        let (start, closed_start) = pick_larger(
            self.start,
            self.closed_start,
            other.start,
            other.closed_start,
        );
        let (end, closed_end) = pick_larger(self.end, self.closed_end, other.end, other.closed_end);
        NumRange::new(start, end, closed_start, closed_end)
    }

    /// Elementwise minimum: the range of `min(a, b)`.
    pub fn min_with(&self, other: &NumRange) -> NumRange {
        self.neg().max_with(&other.neg()).neg()
    }

    /// Tighten to the smallest integer-valued interval: ceil a fractional
    /// start, floor a fractional end, nudge exclusive integer bounds inward,
    /// and close both ends. May yield the invalid range.
    pub fn to_int_range(&self) -> NumRange {
        if !self.is_valid() {
            return NumRange::invalid();
        }
        let (start, closed_start) = if self.start.is_finite() {
            let s = if self.start.fract() == 0.0 {
                if self.closed_start { self.start } else { self.start + 1.0 }
            } else {
                self.start.ceil()
            };
            (s, true)
        } else {
            (self.start, false)
        };
        let (end, closed_end) = if self.end.is_finite() {
            let e = if self.end.fract() == 0.0 {
                if self.closed_end { self.end } else { self.end - 1.0 }
            } else {
                self.end.floor()
            };
            (e, true)
        } else {
            (self.end, false)
        };
        let tightened = NumRange::new(start, end, closed_start, closed_end);
        if tightened.is_valid() { tightened } else { NumRange::invalid() }
    }
}

fn pick_larger(a: f64, a_closed: bool, b: f64, b_closed: bool) -> (f64, bool) {
    if a > b {
        (a, a_closed)
    } else if b > a {
        (b, b_closed)
    } else {
        (a, a_closed || b_closed)
    }
}

/// One corner of a product/quotient: its value and whether it is attained.
#[derive(Clone, Copy)]
struct Corner {
    value: f64,
    closed: bool,
}

impl Corner {
    fn mul(a: f64, a_closed: bool, b: f64, b_closed: bool) -> Corner {
        // A zero-valued bound forces the corner to 0 even against an
        // infinite bound; the IEEE product would be NaN.
        if a == 0.0 || b == 0.0 {
            return Corner {
                value: 0.0,
                closed: (a != 0.0 || a_closed) && (b != 0.0 || b_closed),
            };
        }
        Corner {
            value: a * b,
            closed: a_closed && b_closed,
        }
    }

    fn div(a: f64, a_closed: bool, b: f64, b_closed: bool) -> Corner {
        if a == 0.0 {
            return Corner {
                value: 0.0,
                closed: a_closed,
            };
        }
        if b == 0.0 {
            // The divisor range excludes 0, so this bound is an open limit
            // toward ±∞ in the direction of the numerator's sign.
            return Corner {
                value: a.signum() * f64::INFINITY,
                closed: false,
            };
        }
        if a.is_infinite() && b.is_infinite() {
            // Indeterminate corner; over-approximate toward the sign product.
            return Corner {
                value: a.signum() * b.signum() * f64::INFINITY,
                closed: false,
            };
        }
        Corner {
            value: a / b,
            closed: a_closed && b_closed,
        }
    }

    /// The tightest range covering every corner, with the extremal corner's
    /// inclusivity. A tie is inclusive when any tying corner is attained.
    fn hull(corners: &[Corner]) -> NumRange {
        let mut lo = corners[0];
        let mut hi = corners[0];
        for c in &corners[1..] {
            if c.value < lo.value {
                lo = *c;
            } else if c.value == lo.value && c.closed {
                lo.closed = true;
            }
            if c.value > hi.value {
                hi = *c;
            } else if c.value == hi.value && c.closed {
                hi.closed = true;
            }
        }
        NumRange::new(lo.value, hi.value, lo.closed, hi.closed)
    }
}

impl fmt::Display for NumRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "∅");
        }
        let open = if self.closed_start { '[' } else { '(' };
        let close = if self.closed_end { ']' } else { ')' };
        write!(f, "{}{}, {}{}", open, self.start, self.end, close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn const_add_sums_bounds() {
        let a = NumRange::point(3.0);
        let b = NumRange::point(4.0);
        let sum = a.add(&b);
        assert_eq!(sum.as_const(), Some(7.0));
        assert!(sum.closed_start() && sum.closed_end());
    }

    #[test]
    fn const_times_open_copies_exclusivity() {
        let a = NumRange::point(2.0);
        let b = NumRange::new(1.0, 5.0, false, false);
        let prod = a.mul(&b);
        assert_eq!(prod.start(), 2.0);
        assert_eq!(prod.end(), 10.0);
        assert!(!prod.closed_start());
        assert!(!prod.closed_end());
    }

    #[test]
    fn mul_zero_bound_against_unbounded() {
        let a = NumRange::new(0.0, 1.0, true, true);
        let b = NumRange::gte(2.0);
        let prod = a.mul(&b);
        assert_eq!(prod.start(), 0.0);
        assert_eq!(prod.end(), f64::INFINITY);
        assert!(prod.is_valid());
    }

    #[test]
    fn div_by_range_containing_zero_is_top() {
        let a = NumRange::point(5.0);
        let b = NumRange::new(-1.0, 1.0, true, true);
        let q = a.true_div(&b);
        assert_eq!(q, NumRange::top());
    }

    #[test]
    fn modulo_positive_divisor() {
        let a = NumRange::top();
        let b = NumRange::new(1.0, 10.0, true, true);
        let m = a.modulo(&b);
        assert!(m.contains(0.0));
        assert!(m.contains(9.5));
        assert!(!m.contains(10.0));
        assert!(!m.contains(-0.5));
    }

    #[test]
    fn double_negation_is_identity() {
        let r = NumRange::new(-2.5, 7.0, false, true);
        assert_eq!(r.neg().neg(), r);
    }

    #[test]
    fn top_contains_every_finite_value() {
        let top = NumRange::top();
        for x in [-1e300, -1.0, 0.0, 0.5, 42.0, 1e300] {
            assert!(top.contains(x));
        }
    }

    #[test]
    fn to_int_range_nudges_exclusive_integer_bounds() {
        let r = NumRange::new(0.0, 5.0, false, false);
        let i = r.to_int_range();
        assert_eq!(i.start(), 1.0);
        assert_eq!(i.end(), 4.0);
        assert!(i.closed_start() && i.closed_end());
    }

    #[test]
    fn to_int_range_can_empty() {
        let r = NumRange::new(0.2, 0.8, true, true);
        assert!(!r.to_int_range().is_valid());
    }

    #[test]
    fn comparisons_three_valued() {
        let a = NumRange::new(0.0, 1.0, true, true);
        let b = NumRange::new(2.0, 3.0, true, true);
        assert_eq!(a.always_lt(&b), Some(true));
        assert_eq!(b.always_lt(&a), Some(false));
        assert_eq!(a.always_lt(&a), None);

        let touching = NumRange::new(1.0, 2.0, true, true);
        assert_eq!(a.always_lt(&touching), None);
        assert_eq!(a.always_lte(&touching), Some(true));
    }

    #[test]
    fn eq_decides_const_and_disjoint() {
        assert_eq!(NumRange::point(5.0).always_eq(&NumRange::point(5.0)), Some(true));
        assert_eq!(NumRange::point(5.0).always_eq(&NumRange::point(3.0)), Some(false));
        let a = NumRange::new(0.0, 1.0, true, true);
        let b = NumRange::new(2.0, 3.0, true, true);
        assert_eq!(a.always_eq(&b), Some(false));
        assert_eq!(a.always_eq(&a), None);
    }

    #[test]
    fn abs_straddling_zero() {
        let r = NumRange::new(-4.0, 3.0, true, false);
        let a = r.abs();
        assert_eq!(a.start(), 0.0);
        assert_eq!(a.end(), 4.0);
        assert!(a.closed_start());
        assert!(a.closed_end());
    }

    proptest! {
        #[test]
        fn prop_const_add(a in -1e6f64..1e6, b in -1e6f64..1e6) {
            let sum = NumRange::point(a).add(&NumRange::point(b));
            prop_assert_eq!(sum.as_const(), Some(a + b));
        }

        #[test]
        fn prop_to_int_range_idempotent(
            start in -1e6f64..1e6,
            len in 0f64..1e6,
            cs in any::<bool>(),
            ce in any::<bool>(),
        ) {
            let r = NumRange::new(start, start + len, cs, ce);
            if r.is_valid() {
                let once = r.to_int_range();
                prop_assert_eq!(once.to_int_range(), once);
            }
        }

        #[test]
        fn prop_mul_contains_products(
            a_lo in -100f64..100.0, a_len in 0f64..100.0,
            b_lo in -100f64..100.0, b_len in 0f64..100.0,
            t in 0f64..=1.0, u in 0f64..=1.0,
        ) {
            let a = NumRange::new(a_lo, a_lo + a_len, true, true);
            let b = NumRange::new(b_lo, b_lo + b_len, true, true);
            let x = a_lo + t * a_len;
            let y = b_lo + u * b_len;
            prop_assert!(a.mul(&b).contains(x * y));
        }

        #[test]
        fn prop_neg_involutive(
            start in -1e6f64..1e6,
            len in 0f64..1e6,
            cs in any::<bool>(),
            ce in any::<bool>(),
        ) {
            let r = NumRange::new(start, start + len, cs, ce);
            prop_assert_eq!(r.neg().neg(), r);
        }
    }
}
