//! 순환 시퀀스 번호
//!
//! - 패킷 시퀀스 번호: 31비트, 2^31 에서 순환
//! - 메시지 번호: 29비트, 2^29 에서 순환
//!
//! 순서 비교는 반드시 순환을 고려한 거리로 한다.

use std::cmp::Ordering;
use std::fmt;

/// 패킷 시퀀스 번호 (31비트)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SequenceNumber(u32);

impl SequenceNumber {
    /// 최대값
    pub const MAX: u32 = 0x7FFF_FFFF;

    /// 비교 임계값 (공간의 절반)
    const THRESHOLD: u32 = 0x4000_0000;

    pub fn new(value: u32) -> Self {
        Self(value & Self::MAX)
    }

    /// 임의의 초기 시퀀스 번호
    pub fn random() -> Self {
        Self::new(rand::random::<u32>())
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Self {
        self.add(1)
    }

    pub fn prev(self) -> Self {
        Self(self.0.wrapping_sub(1) & Self::MAX)
    }

    pub fn add(self, n: u32) -> Self {
        Self(self.0.wrapping_add(n) & Self::MAX)
    }

    /// self 에서 other 까지의 앞쪽 거리 (순환)
    pub fn distance_to(self, other: Self) -> u32 {
        other.0.wrapping_sub(self.0) & Self::MAX
    }

    /// other 와의 부호 있는 차이 (self - other)
    pub fn offset_from(self, other: Self) -> i32 {
        let forward = other.distance_to(self);
        if forward < Self::THRESHOLD {
            forward as i32
        } else {
            -(self.distance_to(other) as i32)
        }
    }

    /// 순환을 고려한 순서 비교
    pub fn cmp_wrapping(self, other: Self) -> Ordering {
        self.offset_from(other).cmp(&0)
    }

    pub fn is_after(self, other: Self) -> bool {
        self.cmp_wrapping(other) == Ordering::Greater
    }

    pub fn is_at_or_before(self, other: Self) -> bool {
        self.cmp_wrapping(other) != Ordering::Greater
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 메시지 번호 (29비트)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageNumber(u32);

impl MessageNumber {
    pub const MAX: u32 = 0x1FFF_FFFF;

    pub fn new(value: u32) -> Self {
        Self(value & Self::MAX)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1) & Self::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapping_next() {
        let last = SequenceNumber::new(SequenceNumber::MAX);
        assert_eq!(last.next().value(), 0);
        assert_eq!(SequenceNumber::new(0).prev().value(), SequenceNumber::MAX);
        assert_eq!(MessageNumber::new(MessageNumber::MAX).next().value(), 0);
    }

    #[test]
    fn test_wrapping_compare() {
        let near_end = SequenceNumber::new(SequenceNumber::MAX - 2);
        let wrapped = SequenceNumber::new(3);

        assert!(wrapped.is_after(near_end));
        assert!(near_end.is_at_or_before(wrapped));
        assert_eq!(wrapped.offset_from(near_end), 6);
        assert_eq!(near_end.offset_from(wrapped), -6);
        assert_eq!(near_end.distance_to(wrapped), 6);
        assert_eq!(wrapped.cmp_wrapping(wrapped), Ordering::Equal);
    }

    #[test]
    fn test_plain_compare() {
        let a = SequenceNumber::new(100);
        let b = SequenceNumber::new(200);
        assert!(b.is_after(a));
        assert!(!a.is_after(b));
        assert!(a.is_at_or_before(a));
    }
}
