use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::message::{Message, Reliability};
use crate::sequence_number::SequenceNumber;

/// Opaque handle to a live message; transmit queues reference messages by key so that a single
///  message instance can sit in several queues while the registry stays the sole owner.
pub type MessageKey = u64;

struct Slot {
    message: Message,
    /// number of transmit queues still referencing this message
    holds: u32,
}

/// The per-node registry of injected messages that still require transmission somewhere.
///
/// It assigns sequence numbers (separate spaces for the two delivery classes), tracks which
///  recipients have acknowledged each reliable message, and keeps a message alive until no
///  transmit queue references it anymore. Queues discover settled messages lazily: a message
///  whose remaining targets no longer intersect a queue's reachable set is dropped from that
///  queue on its next packing pass, via [OutboundMessages::release].
pub struct OutboundMessages {
    next_key: MessageKey,
    next_reliable_sn: SequenceNumber,
    next_unreliable_sn: SequenceNumber,
    live: FxHashMap<MessageKey, Slot>,
}

impl OutboundMessages {
    pub fn new() -> OutboundMessages {
        OutboundMessages {
            next_key: 0,
            next_reliable_sn: SequenceNumber::ZERO,
            next_unreliable_sn: SequenceNumber::ZERO,
            live: FxHashMap::default(),
        }
    }

    pub fn broadcast_reliable(
        &mut self,
        source: Uuid,
        payload: &[u8],
        targets: FxHashSet<Uuid>,
    ) -> MessageKey {
        let sn = self.next_reliable_sn;
        self.next_reliable_sn = sn.next();

        let message = Message::framed(source, targets, Reliability::Reliable, sn, 0, payload);
        self.insert(message)
    }

    pub fn broadcast_unreliable(
        &mut self,
        source: Uuid,
        user_id: u64,
        payload: &[u8],
        targets: FxHashSet<Uuid>,
    ) -> MessageKey {
        let sn = self.next_unreliable_sn;
        self.next_unreliable_sn = sn.next();

        let message = Message::framed(source, targets, Reliability::Unreliable, sn, user_id, payload);
        self.insert(message)
    }

    /// Re-injects a message received from elsewhere, preserving its original source, class and
    ///  sequence number - the forwarding path of the dispatcher.
    pub fn insert_forwarded(&mut self, message: Message) -> MessageKey {
        self.insert(message)
    }

    fn insert(&mut self, message: Message) -> MessageKey {
        let key = self.next_key;
        self.next_key += 1;

        trace!(
            "registering message {} from {} sn {} with {} target(s)",
            key, message.source, message.sequence_number, message.targets.len(),
        );
        self.live.insert(key, Slot { message, holds: 0 });
        key
    }

    /// a transmit queue takes a reference to the message
    pub fn acquire(&mut self, key: MessageKey) {
        if let Some(slot) = self.live.get_mut(&key) {
            slot.holds += 1;
        }
    }

    /// a transmit queue drops its reference; the message is removed once nothing references it
    pub fn release(&mut self, key: MessageKey) {
        let Some(slot) = self.live.get_mut(&key) else {
            debug!("release for unknown message {}", key);
            return;
        };

        debug_assert!(slot.holds > 0);
        slot.holds -= 1;
        if slot.holds == 0 {
            self.live.remove(&key);
        }
    }

    /// removes a freshly inserted message that no queue picked up
    pub fn drop_if_unreferenced(&mut self, key: MessageKey) {
        if let Some(slot) = self.live.get(&key) {
            if slot.holds == 0 {
                self.live.remove(&key);
            }
        }
    }

    pub fn message(&self, key: MessageKey) -> Option<&Message> {
        self.live.get(&key).map(|s| &s.message)
    }

    pub fn message_mut(&mut self, key: MessageKey) -> Option<&mut Message> {
        self.live.get_mut(&key).map(|s| &mut s.message)
    }

    /// Processes one acknowledged sequence number from `acking_peer`: the peer is removed from
    ///  the target set of every matching reliable message, and so is every remaining target in
    ///  `reachable_via_peer` - the acking peer holds the message now and takes over delivery to
    ///  the targets it forwards for. An ack for an unknown sequence number is ignored.
    pub fn acknowledge(
        &mut self,
        sn: SequenceNumber,
        acking_peer: Uuid,
        reachable_via_peer: &FxHashSet<Uuid>,
    ) {
        for (key, slot) in self.live.iter_mut() {
            if slot.message.reliability != Reliability::Reliable
                || slot.message.sequence_number != sn
            {
                continue;
            }

            let before = slot.message.targets.len();
            slot.message.targets.remove(&acking_peer);
            slot.message.targets.retain(|t| !reachable_via_peer.contains(t));

            if slot.message.targets.len() != before {
                trace!("ack from {} for message {} (sn {})", acking_peer, key, sn);
            }
            if slot.message.targets.is_empty() {
                debug!("message {} (sn {}) fully acknowledged", key, sn);
            }
        }
    }

    /// Concedes reliable messages whose sequence numbers have fallen below the acking peer's
    ///  window floor: the peer can never represent them in its ack window again, and the window
    ///  only slides past numbers the peer has received, so retransmitting them is pointless.
    pub fn concede_unackable(
        &mut self,
        floor: SequenceNumber,
        acking_peer: Uuid,
        reachable_via_peer: &FxHashSet<Uuid>,
    ) {
        for slot in self.live.values_mut() {
            if slot.message.reliability != Reliability::Reliable
                || !slot.message.sequence_number.precedes(floor)
            {
                continue;
            }

            slot.message.targets.remove(&acking_peer);
            slot.message.targets.retain(|t| !reachable_via_peer.contains(t));
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    #[cfg(test)]
    pub fn holds(&self, key: MessageKey) -> Option<u32> {
        self.live.get(&key).map(|s| s.holds)
    }
}

impl Default for OutboundMessages {
    fn default() -> Self {
        OutboundMessages::new()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn peer(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    fn targets(peers: &[u8]) -> FxHashSet<Uuid> {
        peers.iter().map(|n| peer(*n)).collect()
    }

    #[test]
    fn test_sequence_number_assignment_per_class() {
        let mut outbound = OutboundMessages::new();

        let r0 = outbound.broadcast_reliable(peer(1), &[1], targets(&[2]));
        let u0 = outbound.broadcast_unreliable(peer(1), 7, &[2], targets(&[2]));
        let r1 = outbound.broadcast_reliable(peer(1), &[3], targets(&[2]));

        assert_eq!(outbound.message(r0).unwrap().sequence_number, SequenceNumber::from_raw(0));
        assert_eq!(outbound.message(r1).unwrap().sequence_number, SequenceNumber::from_raw(1));
        assert_eq!(outbound.message(u0).unwrap().sequence_number, SequenceNumber::from_raw(0));
    }

    #[test]
    fn test_acquire_release_lifecycle() {
        let mut outbound = OutboundMessages::new();
        let key = outbound.broadcast_reliable(peer(1), &[1], targets(&[2, 3]));

        outbound.acquire(key);
        outbound.acquire(key);
        assert_eq!(outbound.holds(key), Some(2));

        outbound.release(key);
        assert!(outbound.message(key).is_some());

        outbound.release(key);
        assert!(outbound.message(key).is_none());
        assert!(outbound.is_empty());
    }

    #[test]
    fn test_drop_if_unreferenced() {
        let mut outbound = OutboundMessages::new();

        let unheld = outbound.broadcast_reliable(peer(1), &[1], targets(&[2]));
        let held = outbound.broadcast_reliable(peer(1), &[1], targets(&[2]));
        outbound.acquire(held);

        outbound.drop_if_unreferenced(unheld);
        outbound.drop_if_unreferenced(held);

        assert!(outbound.message(unheld).is_none());
        assert!(outbound.message(held).is_some());
    }

    #[test]
    fn test_acknowledge_direct() {
        let mut outbound = OutboundMessages::new();
        let key = outbound.broadcast_reliable(peer(1), &[1], targets(&[2, 3]));

        outbound.acknowledge(SequenceNumber::from_raw(0), peer(2), &targets(&[2]));
        assert_eq!(outbound.message(key).unwrap().targets, targets(&[3]));

        outbound.acknowledge(SequenceNumber::from_raw(0), peer(3), &targets(&[3]));
        assert!(outbound.message(key).unwrap().targets.is_empty());
    }

    #[test]
    fn test_acknowledge_relay_handoff() {
        let mut outbound = OutboundMessages::new();
        // 3 is reachable through 2 only - 2's ack hands the message off
        let key = outbound.broadcast_reliable(peer(1), &[1], targets(&[2, 3]));

        outbound.acknowledge(SequenceNumber::from_raw(0), peer(2), &targets(&[2, 3]));
        assert!(outbound.message(key).unwrap().targets.is_empty());
    }

    #[rstest]
    #[case::unknown_sn(5)]
    #[case::unreliable_space_not_affected(0)]
    fn test_acknowledge_ignores(#[case] sn: u32) {
        let mut outbound = OutboundMessages::new();
        let key = outbound.broadcast_unreliable(peer(1), 9, &[1], targets(&[2]));

        outbound.acknowledge(SequenceNumber::from_raw(sn), peer(2), &targets(&[2]));
        assert_eq!(outbound.message(key).unwrap().targets, targets(&[2]));
    }

    #[test]
    fn test_concede_unackable() {
        let mut outbound = OutboundMessages::new();
        let old = outbound.broadcast_reliable(peer(1), &[1], targets(&[2]));
        for _ in 0..40 {
            outbound.broadcast_reliable(peer(1), &[1], targets(&[2]));
        }

        // the peer's window floor has moved past sn 0
        outbound.concede_unackable(SequenceNumber::from_raw(9), peer(2), &targets(&[2]));

        assert!(outbound.message(old).unwrap().targets.is_empty());
        // key k carries sn k; sn 9 itself and everything above is untouched
        for key in 1u64..=40 {
            let expected = if key < 9 { 0 } else { 1 };
            assert_eq!(outbound.message(key).unwrap().targets.len(), expected);
        }
    }
}
