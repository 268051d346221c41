use std::fmt::{Display, Formatter};

/// A 32 bit sequence number with wrap-around semantics: `0` follows after `u32::MAX`.
///
/// Because of the wrap-around there is no total order on sequence numbers; [SequenceNumber::precedes]
///  provides the modular comparison instead: `a` precedes `b` iff the distance from `a` to `b`,
///  interpreted as a signed 32 bit number, is positive.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SequenceNumber(u32);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(1))
    }

    /// modular comparison: strictly less than `other` in wrap-around terms
    pub fn precedes(&self, other: SequenceNumber) -> bool {
        (other.0.wrapping_sub(self.0) as i32) > 0
    }

    /// the (wrapping) number of steps from `earlier` up to `self`
    pub fn offset_from(&self, earlier: SequenceNumber) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    pub fn minus(&self, n: u32) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_sub(n))
    }

    pub fn plus(&self, n: u32) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(n))
    }
}
