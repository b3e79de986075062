//! # Wrapping TCP sequence arithmetic
//!
//! TCP sequence and ACK numbers live in a 32-bit ring. Ordinary integer
//! comparison breaks the moment a connection runs past `u32::MAX`, so every
//! comparison here goes through `wrapping_sub` and looks at the sign of the
//! result (RFC 793 §3.3).
//!
//! `Seq32`'s `Ord` impl follows this rule, which makes it usable directly as
//! a `BTreeMap` key — but note that wrapping order is only a *local* total
//! order (valid for keys within about `i32::MAX` of each other), not a
//! global one. The maintainer never holds spans that wide.

use std::cmp::Ordering;
use std::fmt;

/// A TCP sequence or ACK number with wrapping comparisons.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Seq32(pub u32);

impl Seq32 {
    pub const ZERO: Seq32 = Seq32(0);

    #[inline]
    pub fn new(v: u32) -> Self {
        Seq32(v)
    }

    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }

    /// `self + delta`, wrapping at 2^32.
    #[inline]
    pub fn add(self, delta: u32) -> Self {
        Seq32(self.0.wrapping_add(delta))
    }

    /// `self - delta`, wrapping at 2^32.
    #[inline]
    pub fn sub(self, delta: u32) -> Self {
        Seq32(self.0.wrapping_sub(delta))
    }

    /// Signed distance `self - other`, positive when `self` is "ahead".
    #[inline]
    pub fn distance(self, other: Seq32) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    #[inline]
    pub fn lt(self, other: Seq32) -> bool {
        self.distance(other) < 0
    }

    #[inline]
    pub fn leq(self, other: Seq32) -> bool {
        self.distance(other) <= 0
    }

    #[inline]
    pub fn gt(self, other: Seq32) -> bool {
        self.distance(other) > 0
    }

    #[inline]
    pub fn geq(self, other: Seq32) -> bool {
        self.distance(other) >= 0
    }

    /// The later (wrapping-greater) of two sequence numbers.
    #[inline]
    pub fn max(self, other: Seq32) -> Self {
        if self.geq(other) {
            self
        } else {
            other
        }
    }

    /// The earlier (wrapping-lesser) of two sequence numbers.
    #[inline]
    pub fn min(self, other: Seq32) -> Self {
        if self.leq(other) {
            self
        } else {
            other
        }
    }
}

impl PartialOrd for Seq32 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Wrapping total order. Only meaningful for keys clustered within one
/// connection's active window — see the module doc comment.
impl Ord for Seq32 {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.distance(*other) {
            0 => Ordering::Equal,
            d if d < 0 => Ordering::Less,
            _ => Ordering::Greater,
        }
    }
}

impl fmt::Debug for Seq32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq32({})", self.0)
    }
}

impl fmt::Display for Seq32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for Seq32 {
    fn from(v: u32) -> Self {
        Seq32(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn wraparound_ordering() {
        let near_max = Seq32::new(u32::MAX - 2);
        let wrapped = Seq32::new(1);
        assert!(near_max.lt(wrapped), "sequence space must wrap past u32::MAX");
        assert!(wrapped.gt(near_max));
    }

    #[test]
    fn equal_is_neither_lt_nor_gt() {
        let a = Seq32::new(500);
        let b = Seq32::new(500);
        assert!(!a.lt(b));
        assert!(!a.gt(b));
        assert!(a.leq(b));
        assert!(a.geq(b));
    }

    #[test]
    fn add_sub_roundtrip() {
        let a = Seq32::new(100);
        assert_eq!(a.add(50).sub(50), a);
        assert_eq!(Seq32::new(u32::MAX).add(1), Seq32::new(0));
    }

    #[test]
    fn min_max_respect_wrapping() {
        let near_max = Seq32::new(u32::MAX - 2);
        let wrapped = Seq32::new(1);
        assert_eq!(near_max.min(wrapped), near_max);
        assert_eq!(near_max.max(wrapped), wrapped);
    }

    proptest! {
        #[test]
        fn distance_antisymmetric(a in any::<u32>(), b in any::<u32>()) {
            let sa = Seq32::new(a);
            let sb = Seq32::new(b);
            if sa.distance(sb) != i32::MIN {
                prop_assert_eq!(sa.distance(sb), -sb.distance(sa));
            }
        }

        #[test]
        fn ord_consistent_with_distance(a in any::<u32>(), delta in 1u32..=0x3FFF_FFFF) {
            let sa = Seq32::new(a);
            let sb = sa.add(delta);
            prop_assert!(sa.lt(sb));
            prop_assert!(sb.gt(sa));
        }
    }
}
