use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::error;
use uuid::Uuid;

use crate::ack_set::AckSet;
use crate::outbound::OutboundMessages;
use crate::sequence_number::SequenceNumber;
use crate::transmit_queue::TransmitQueue;
use crate::wire::{DatagramEncoder, DatagramHeader};

/// Abstraction for sending one datagram towards a remote peer, introduced to facilitate mocking
///  the I/O part away for testing (and for running nodes over an in-memory substrate).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_datagram(&self, buf: &[u8]);
}

#[async_trait]
impl SendSocket for UdpSocket {
    async fn send_datagram(&self, buf: &[u8]) {
        if let Err(e) = self.send(buf).await {
            error!("error sending datagram: {}", e);
        }
    }
}

/// One datagram ready to go out on a link.
pub struct OutboundDatagram {
    pub bytes: Vec<u8>,
    pub message_count: u16,
    pub rotation_complete: bool,
}

/// The per-peer transport state: the transmit queue feeding this link, the cumulative ack
///  window for reliable traffic received on it, and pacing information for the keepalive pass.
pub struct Link {
    pub remote: Uuid,
    pub queue: TransmitQueue,
    /// reliable sequence numbers received on this link, piggybacked onto every outbound datagram
    received_acks: AckSet,
    /// set when the ack window changed since it was last sent, forcing an (ack-only) datagram
    acks_dirty: bool,
    last_send: Option<Instant>,
    pub socket: Arc<dyn SendSocket>,
}

impl Link {
    pub fn new(remote: Uuid, socket: Arc<dyn SendSocket>) -> Link {
        Link {
            remote,
            queue: TransmitQueue::new(remote),
            received_acks: AckSet::new(),
            acks_dirty: false,
            last_send: None,
            socket,
        }
    }

    /// Records a reliable sequence number received on this link so it is acknowledged with the
    ///  next outbound datagram. Returns `false` if the ack window refuses to represent it yet.
    pub fn note_received_reliable(&mut self, sn: SequenceNumber) -> bool {
        if self.received_acks.try_add(sn) {
            self.acks_dirty = true;
            true
        }
        else {
            false
        }
    }

    /// Packs the next outbound datagram: this node's id, the current ack window, and as many
    ///  queued messages as fit. Returns `None` if there is nothing worth sending - no queued
    ///  message was packed and the ack window was already sent.
    pub fn build_datagram(
        &mut self,
        self_id: Uuid,
        max_datagram_size: usize,
        outbound: &mut OutboundMessages,
    ) -> Option<OutboundDatagram> {
        let mut encoder = DatagramEncoder::new(max_datagram_size);
        DatagramHeader { sender: self_id, acks: self.received_acks }.encode(&mut encoder);
        debug_assert!(!encoder.has_error());

        let outcome = self.queue.encode_few(&mut encoder, outbound);

        if outcome.count == 0 && !self.acks_dirty {
            return None;
        }

        self.acks_dirty = false;
        self.last_send = Some(Instant::now());

        Some(OutboundDatagram {
            bytes: encoder.into_bytes(),
            message_count: outcome.count,
            rotation_complete: outcome.rotation_complete,
        })
    }

    /// whether the keepalive pass should attend to this link
    pub fn wants_keepalive(&self, interval: std::time::Duration) -> bool {
        if self.queue.is_empty() && !self.acks_dirty {
            return false;
        }
        match self.last_send {
            None => true,
            Some(at) => at.elapsed() >= interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use rustc_hash::FxHashSet;
    use super::*;

    fn peer(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    fn new_link(remote: Uuid) -> Link {
        Link::new(remote, Arc::new(MockSendSocket::new()))
    }

    #[test]
    fn test_idle_link_builds_nothing() {
        let mut link = new_link(peer(2));
        let mut outbound = OutboundMessages::new();

        assert!(link.build_datagram(peer(1), 1472, &mut outbound).is_none());
    }

    #[test]
    fn test_datagram_layout() {
        let mut link = new_link(peer(2));
        let mut outbound = OutboundMessages::new();

        assert!(link.note_received_reliable(SequenceNumber::from_raw(4)));

        let targets: FxHashSet<Uuid> = [peer(2)].into_iter().collect();
        let key = outbound.broadcast_unreliable(peer(1), 9, &[0xab], targets);
        outbound.acquire(key);
        link.queue.insert_message(key);

        let datagram = link.build_datagram(peer(1), 1472, &mut outbound).unwrap();
        assert_eq!(datagram.message_count, 1);
        assert!(datagram.rotation_complete);

        let mut buf: &[u8] = &datagram.bytes;
        let header = DatagramHeader::try_deser(&mut buf).unwrap();
        assert_eq!(header.sender, peer(1));
        assert_eq!(header.acks.iter().collect::<Vec<_>>(), vec![SequenceNumber::from_raw(4)]);

        // one message record follows the header
        let source = crate::wire::try_get_uuid(&mut buf).unwrap();
        assert_eq!(source, peer(1));
        assert_eq!(bytes::Buf::try_get_u8(&mut buf).unwrap(), 1);
        assert_eq!(crate::wire::try_get_uuid(&mut buf).unwrap(), peer(2));
        let msg_header = crate::message::MessageHeader::try_deser(&mut buf).unwrap();
        assert_eq!(msg_header.user_id, 9);
        assert_eq!(buf, &[0xab]);
    }

    #[test]
    fn test_ack_only_datagram_sent_once() {
        let mut link = new_link(peer(2));
        let mut outbound = OutboundMessages::new();

        assert!(link.note_received_reliable(SequenceNumber::from_raw(0)));

        let datagram = link.build_datagram(peer(1), 1472, &mut outbound).unwrap();
        assert_eq!(datagram.message_count, 0);
        assert_eq!(datagram.bytes.len(), DatagramHeader::SERIALIZED_LEN);

        // the window is unchanged, so there is nothing new to say
        assert!(link.build_datagram(peer(1), 1472, &mut outbound).is_none());

        // a duplicate arrival marks the window dirty again so the ack is re-sent
        assert!(link.note_received_reliable(SequenceNumber::from_raw(0)));
        assert!(link.build_datagram(peer(1), 1472, &mut outbound).is_some());
    }

    #[test]
    fn test_wants_keepalive() {
        let mut link = new_link(peer(2));
        let mut outbound = OutboundMessages::new();

        assert!(!link.wants_keepalive(Duration::from_millis(20)));

        link.note_received_reliable(SequenceNumber::from_raw(1));
        assert!(link.wants_keepalive(Duration::from_millis(20)));

        link.build_datagram(peer(1), 1472, &mut outbound);
        assert!(!link.wants_keepalive(Duration::from_millis(20)));
    }
}
