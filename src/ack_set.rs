use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::Buf;

use crate::sequence_number::SequenceNumber;
use crate::wire::DatagramEncoder;

/// A fixed-width sliding window over the sequence numbers observed from one sender: the highest
///  observed number plus a 31 bit bitmap for its predecessors, so up to 32 recent numbers can be
///  represented in nine wire bytes.
///
/// The window deliberately forgets numbers that fall more than 31 below the highest - those are
///  conceded, and a sender must not expect them to be acknowledged anymore. Advancing the window
///  is refused (see [AckSet::try_add]) while it would discard a slot that was never observed
///  although the window had already reached it, so unacknowledged information is not lost
///  silently.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct AckSet {
    highest: SequenceNumber,
    /// the floor below which the set never tracked anything, i.e. the first number it ever saw
    lowest: SequenceNumber,
    /// bit i set means `highest - (i+1)` was observed; only the low 31 bits are used
    predecessors: u32,
    is_empty: bool,
}

const PREDECESSOR_MASK: u32 = 0x7fff_ffff;

impl AckSet {
    pub fn new() -> AckSet {
        AckSet {
            highest: SequenceNumber::ZERO,
            lowest: SequenceNumber::ZERO,
            predecessors: 0,
            is_empty: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.is_empty
    }

    pub fn highest(&self) -> SequenceNumber {
        self.highest
    }

    /// Records an observed sequence number. Returns `false` iff the set refuses to represent the
    ///  number because doing so would silently discard a window slot that was never observed;
    ///  the caller is expected to retry once the gap is filled.
    pub fn try_add(&mut self, sn: SequenceNumber) -> bool {
        if self.is_empty {
            self.highest = sn;
            self.lowest = sn;
            self.predecessors = 0;
            self.is_empty = false;
            return true;
        }

        if sn == self.highest {
            return true;
        }

        if sn.precedes(self.highest) {
            let offset = self.highest.offset_from(sn);
            if offset > 31 {
                // below the window floor: conceded, nothing to record
                return true;
            }
            self.predecessors |= 1 << (offset - 1);
            return true;
        }

        let shift = sn.offset_from(self.highest);
        if shift > 31 {
            return false;
        }

        // refuse the advance if it would discard a slot that was never observed although the
        //  window had already turned far enough to contain it
        for i in 0..shift {
            let never_reachable = self.highest.precedes(self.lowest.plus(31 - i));
            let observed = self.predecessors & (1 << (30 - i)) != 0;
            if !(never_reachable || observed) {
                return false;
            }
        }

        self.predecessors = ((self.predecessors << shift) | (1 << (shift - 1))) & PREDECESSOR_MASK;
        self.highest = sn;
        true
    }

    pub fn contains(&self, sn: SequenceNumber) -> bool {
        if self.is_empty {
            return false;
        }
        if sn == self.highest {
            return true;
        }
        if !sn.precedes(self.highest) {
            return false;
        }
        let offset = self.highest.offset_from(sn);
        offset <= 31 && self.predecessors & (1 << (offset - 1)) != 0
    }

    /// iterates the represented sequence numbers in decreasing order, starting at the highest
    pub fn iter(&self) -> AckSetIter {
        AckSetIter {
            acks: self,
            pos: if self.is_empty { 32 } else { 0 },
        }
    }

    pub fn encode(&self, encoder: &mut DatagramEncoder) {
        encoder.put_u8(if self.is_empty { 1 } else { 0 });
        encoder.put_u32(if self.is_empty { 0 } else { self.highest.to_raw() });
        encoder.put_u32(if self.is_empty { 0 } else { self.predecessors });
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<AckSet> {
        let flags = buf.try_get_u8()?;
        let highest = buf.try_get_u32()?;
        let predecessors = buf.try_get_u32()?;

        if flags & !1 != 0 {
            bail!("invalid ack header flags: {:#x}", flags);
        }
        if predecessors & !PREDECESSOR_MASK != 0 {
            bail!("invalid ack predecessor bitmap: {:#x}", predecessors);
        }

        let is_empty = flags & 1 != 0;
        if is_empty && (highest != 0 || predecessors != 0) {
            bail!("non-zero payload in empty ack header");
        }

        let highest = SequenceNumber::from_raw(highest);
        Ok(AckSet {
            highest,
            lowest: highest,
            predecessors,
            is_empty,
        })
    }

    pub const SERIALIZED_LEN: usize = 1 + 4 + 4;
}

impl Default for AckSet {
    fn default() -> Self {
        AckSet::new()
    }
}

impl Debug for AckSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "AckSet{{")?;
        for (n, sn) in self.iter().enumerate() {
            if n > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", sn)?;
        }
        write!(f, "}}")
    }
}

pub struct AckSetIter<'a> {
    acks: &'a AckSet,
    pos: u32,
}

impl Iterator for AckSetIter<'_> {
    type Item = SequenceNumber;

    fn next(&mut self) -> Option<SequenceNumber> {
        if self.pos >= 32 {
            return None;
        }
        let result = self.acks.highest.minus(self.pos);

        loop {
            self.pos += 1;
            if self.pos >= 32 || self.acks.predecessors & (1 << (self.pos - 1)) != 0 {
                break;
            }
        }

        Some(result)
    }
}
