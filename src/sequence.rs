use std::cmp::Ordering;
use std::fmt::{Debug, Display, Formatter};
use std::ops::{Add, AddAssign, Sub};

/// A 32 bit sequence number. All arithmetic and comparison is modulo 2^32: `a < b` iff the
///  signed distance from `a` to `b` is positive, which is meaningful as long as the two numbers
///  are less than 2^31 apart. Raw numeric comparison is never used.
///
/// NB: This means that `Ord` is not transitive over the full number space. It is however
///      consistent for all values inside a sequence window, which is what sorted containers
///      holding sequence numbers rely on.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct SeqNum(u32);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl Debug for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl SeqNum {
    pub const ZERO: SeqNum = SeqNum(0);

    pub fn from_raw(value: u32) -> SeqNum {
        SeqNum(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    /// signed distance from `other` to `self`, i.e. `self - other` interpreted as two's complement
    pub fn delta(&self, other: SeqNum) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    /// number of sequence units from `other` up to `self`, 0 if `self` is not after `other`
    pub fn distance_from(&self, other: SeqNum) -> u32 {
        let delta = self.delta(other);
        if delta > 0 { delta as u32 } else { 0 }
    }
}

impl PartialOrd for SeqNum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SeqNum {
    fn cmp(&self, other: &Self) -> Ordering {
        self.delta(*other).cmp(&0)
    }
}

impl Add<u32> for SeqNum {
    type Output = SeqNum;

    fn add(self, rhs: u32) -> Self::Output {
        SeqNum(self.0.wrapping_add(rhs))
    }
}
impl AddAssign<u32> for SeqNum {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}
impl Sub<u32> for SeqNum {
    type Output = SeqNum;

    fn sub(self, rhs: u32) -> Self::Output {
        SeqNum(self.0.wrapping_sub(rhs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::equal(5, 5, 0)]
    #[case::simple_pos(7, 5, 2)]
    #[case::simple_neg(5, 7, -2)]
    #[case::wrap_pos(2, u32::MAX - 1, 4)]
    #[case::wrap_neg(u32::MAX - 1, 2, -4)]
    #[case::half_minus_one(0x7fff_ffff, 0, i32::MAX)]
    #[case::half(0x8000_0000, 0, i32::MIN)]
    #[case::zero_max(0, u32::MAX, 1)]
    fn test_delta(#[case] a: u32, #[case] b: u32, #[case] expected: i32) {
        assert_eq!(SeqNum::from_raw(a).delta(SeqNum::from_raw(b)), expected);
    }

    #[rstest]
    #[case::equal(5, 5, Ordering::Equal)]
    #[case::less(5, 6, Ordering::Less)]
    #[case::greater(6, 5, Ordering::Greater)]
    #[case::wrap_less(u32::MAX, 0, Ordering::Less)]
    #[case::wrap_greater(0, u32::MAX, Ordering::Greater)]
    #[case::wrap_far(u32::MAX - 10, 100, Ordering::Less)]
    #[case::raw_greater_but_before(0x9000_0000, 0x1000_0000, Ordering::Greater)]
    #[case::raw_less_but_after(0x1000_0000, 0x9000_0001, Ordering::Greater)]
    fn test_cmp(#[case] a: u32, #[case] b: u32, #[case] expected: Ordering) {
        assert_eq!(SeqNum::from_raw(a).cmp(&SeqNum::from_raw(b)), expected);
    }

    #[rstest]
    #[case::before(3, 5, 0)]
    #[case::same(5, 5, 0)]
    #[case::after(9, 5, 4)]
    #[case::wrapped(1, u32::MAX, 2)]
    fn test_distance_from(#[case] a: u32, #[case] b: u32, #[case] expected: u32) {
        assert_eq!(SeqNum::from_raw(a).distance_from(SeqNum::from_raw(b)), expected);
    }

    #[test]
    fn test_add_sub_inverse() {
        let samples = [0u32, 1, 2, 1000, 0x7fff_ffff, 0x8000_0000, u32::MAX - 1, u32::MAX];
        for a in samples {
            for d in samples {
                let a = SeqNum::from_raw(a);
                assert_eq!((a - d) + d, a);
                assert_eq!((a + d) - d, a);
            }
        }
    }

    #[test]
    fn test_add_assign_wraps() {
        let mut s = SeqNum::from_raw(u32::MAX);
        s += 3;
        assert_eq!(s, SeqNum::from_raw(2));
    }

    #[test]
    fn test_max() {
        assert_eq!(SeqNum::from_raw(u32::MAX).max(SeqNum::from_raw(1)), SeqNum::from_raw(1));
        assert_eq!(SeqNum::from_raw(7).max(SeqNum::from_raw(3)), SeqNum::from_raw(7));
    }
}
