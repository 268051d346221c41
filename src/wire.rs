use anyhow::bail;
use bytes::Buf;
use uuid::Uuid;

use crate::ack_set::AckSet;

pub const UUID_SERIALIZED_LEN: usize = 16;

pub fn try_get_uuid(buf: &mut impl Buf) -> anyhow::Result<Uuid> {
    if buf.remaining() < UUID_SERIALIZED_LEN {
        bail!("buffer too short for a uuid: {} bytes remaining", buf.remaining());
    }
    let mut raw = [0u8; UUID_SERIALIZED_LEN];
    buf.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes(raw))
}

/// An encoder over a fixed-capacity datagram buffer.
///
/// A write that would exceed the capacity sets an error flag and leaves the buffer untouched;
///  once the flag is set, all further writes are ignored. [DatagramEncoder::checkpoint] /
///  [DatagramEncoder::restore] allow speculative encoding: record the write position and error
///  flag, attempt to encode, and roll back if the attempt overflowed.
pub struct DatagramEncoder {
    buf: Vec<u8>,
    capacity: usize,
    error: bool,
}

#[derive(Copy, Clone, Debug)]
pub struct EncoderCheckpoint {
    len: usize,
    error: bool,
}

impl DatagramEncoder {
    pub fn new(capacity: usize) -> DatagramEncoder {
        DatagramEncoder {
            buf: Vec::with_capacity(capacity),
            capacity,
            error: false,
        }
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    pub fn set_error(&mut self) {
        self.error = true;
    }

    pub fn checkpoint(&self) -> EncoderCheckpoint {
        EncoderCheckpoint {
            len: self.buf.len(),
            error: self.error,
        }
    }

    pub fn restore(&mut self, checkpoint: EncoderCheckpoint) {
        self.buf.truncate(checkpoint.len);
        self.error = checkpoint.error;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    fn ensure(&mut self, additional: usize) -> bool {
        if self.error {
            return false;
        }
        if self.buf.len() + additional > self.capacity {
            self.error = true;
            return false;
        }
        true
    }

    pub fn put_u8(&mut self, value: u8) {
        if self.ensure(1) {
            self.buf.push(value);
        }
    }

    pub fn put_u16(&mut self, value: u16) {
        if self.ensure(2) {
            self.buf.extend_from_slice(&value.to_be_bytes());
        }
    }

    pub fn put_u32(&mut self, value: u32) {
        if self.ensure(4) {
            self.buf.extend_from_slice(&value.to_be_bytes());
        }
    }

    pub fn put_u64(&mut self, value: u64) {
        if self.ensure(8) {
            self.buf.extend_from_slice(&value.to_be_bytes());
        }
    }

    pub fn put_slice(&mut self, value: &[u8]) {
        if self.ensure(value.len()) {
            self.buf.extend_from_slice(value);
        }
    }

    pub fn put_uuid(&mut self, value: &Uuid) {
        self.put_slice(value.as_bytes());
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// The fixed prefix of every datagram: the sending node's id plus its piggybacked ack window.
#[derive(Debug)]
pub struct DatagramHeader {
    pub sender: Uuid,
    pub acks: AckSet,
}

impl DatagramHeader {
    pub const SERIALIZED_LEN: usize = UUID_SERIALIZED_LEN + AckSet::SERIALIZED_LEN;

    pub fn encode(&self, encoder: &mut DatagramEncoder) {
        encoder.put_uuid(&self.sender);
        self.acks.encode(encoder);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<DatagramHeader> {
        let sender = try_get_uuid(buf)?;
        let acks = AckSet::try_deser(buf)?;
        Ok(DatagramHeader { sender, acks })
    }
}
