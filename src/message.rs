use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::FxHashSet;
use uuid::Uuid;

use crate::sequence_number::SequenceNumber;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Reliability {
    Unreliable,
    Reliable,
}

/// The framed header at the start of every message payload. The layout is part of the wire
///  format and must stay stable:
///
/// ```ascii
/// 0: delivery class (u8): 0 = unreliable, 1 = reliable
/// 1: sequence number (u32 BE) in the source's per-class space
/// 5: user id (u64 BE) - receiver-side dedup key, present for unreliable messages only
/// *: payload length (u16 BE)
/// ```
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct MessageHeader {
    pub reliability: Reliability,
    pub sequence_number: SequenceNumber,
    /// meaningful (and serialized) for unreliable messages only
    pub user_id: u64,
    pub payload_len: u16,
}

impl MessageHeader {
    pub fn serialized_len(&self) -> usize {
        match self.reliability {
            Reliability::Unreliable => 1 + 4 + 8 + 2,
            Reliability::Reliable => 1 + 4 + 2,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self.reliability {
            Reliability::Unreliable => buf.put_u8(0),
            Reliability::Reliable => buf.put_u8(1),
        }
        buf.put_u32(self.sequence_number.to_raw());
        if self.reliability == Reliability::Unreliable {
            buf.put_u64(self.user_id);
        }
        buf.put_u16(self.payload_len);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MessageHeader> {
        let reliability = match buf.try_get_u8()? {
            0 => Reliability::Unreliable,
            1 => Reliability::Reliable,
            n => bail!("invalid delivery class: {}", n),
        };
        let sequence_number = SequenceNumber::from_raw(buf.try_get_u32()?);
        let user_id = if reliability == Reliability::Unreliable {
            buf.try_get_u64()?
        }
        else {
            0
        };
        let payload_len = buf.try_get_u16()?;

        Ok(MessageHeader {
            reliability,
            sequence_number,
            user_id,
            payload_len,
        })
    }
}

/// One logical message as held by the sending side: the originating node, the recipients that
///  still need it, and the complete framed wire bytes. A single instance is referenced from
///  every transmit queue that may still send it; the target set shrinks as recipients
///  acknowledge (reliable) or as links transmit once (unreliable).
#[derive(Debug)]
pub struct Message {
    pub source: Uuid,
    pub targets: FxHashSet<Uuid>,
    /// framed header plus application payload, encoded once at broadcast time
    pub bytes: Bytes,
    pub reliability: Reliability,
    pub sequence_number: SequenceNumber,
    pub user_id: u64,
}

impl Message {
    pub fn framed(
        source: Uuid,
        targets: FxHashSet<Uuid>,
        reliability: Reliability,
        sequence_number: SequenceNumber,
        user_id: u64,
        payload: &[u8],
    ) -> Message {
        debug_assert!(payload.len() <= u16::MAX as usize);

        let header = MessageHeader {
            reliability,
            sequence_number,
            user_id,
            payload_len: payload.len() as u16,
        };

        let mut buf = BytesMut::with_capacity(header.serialized_len() + payload.len());
        header.ser(&mut buf);
        buf.put_slice(payload);

        Message {
            source,
            targets,
            bytes: buf.freeze(),
            reliability,
            sequence_number,
            user_id,
        }
    }
}
