use std::collections::VecDeque;

use rustc_hash::FxHashSet;
use tracing::trace;
use uuid::Uuid;

use crate::message::{Message, Reliability};
use crate::outbound::{MessageKey, OutboundMessages};
use crate::wire::DatagramEncoder;

/// The result of one packing pass: how many messages went into the datagram, and whether the
///  pass visited the whole queue (as opposed to stopping early because the datagram was full).
#[derive(Debug, Eq, PartialEq)]
pub struct EncodeOutcome {
    pub count: u16,
    pub rotation_complete: bool,
}

/// The per-link queue of messages awaiting transmission, packed fairly into datagrams.
///
/// The queue is a circular list with a persistent cursor: each packing pass starts where the
///  previous one stopped, so every message gets a turn before any is retransmitted again, and a
///  message that did not fit into the current datagram is retried first on the next pass.
///  Reliable messages stay in the queue until their remaining targets no longer intersect this
///  link's reachable set; unreliable messages are transmitted once per link and dropped.
pub struct TransmitQueue {
    /// peers reachable over this link: the direct remote plus any forwarding targets
    targets: FxHashSet<Uuid>,
    entries: VecDeque<MessageKey>,
    /// Cursor of the rotation, the position considered first by the next packing pass.
    /// Invariant: `entries.is_empty()` iff `next == 0`; otherwise `next < entries.len()`.
    next: usize,
}

impl TransmitQueue {
    pub fn new(remote: Uuid) -> TransmitQueue {
        let mut targets = FxHashSet::default();
        targets.insert(remote);

        TransmitQueue {
            targets,
            entries: VecDeque::new(),
            next: 0,
        }
    }

    /// registers a peer as reachable over this link, directly or by one forwarding hop
    pub fn add_target(&mut self, peer: Uuid) {
        self.targets.insert(peer);
    }

    pub fn targets(&self) -> &FxHashSet<Uuid> {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        debug_assert!(!self.entries.is_empty() || self.next == 0);
        self.entries.is_empty()
    }

    /// Inserts a message just before the cursor, making it the last message the current
    ///  rotation will consider.
    pub fn insert_message(&mut self, key: MessageKey) {
        if self.entries.is_empty() {
            self.entries.push_back(key);
            self.next = 0;
        }
        else {
            self.entries.insert(self.next, key);
            self.next += 1;
        }
    }

    /// Packs as many queued messages into the encoder as its remaining capacity allows.
    ///
    /// Each queued message is visited at most once, starting at the cursor. A message whose
    ///  remaining targets do not intersect this link's reachable set is dropped from the queue
    ///  (releasing it through the registry). A message that does not fit in the remaining
    ///  datagram space stops the pass, and the cursor is parked on it so the next pass retries
    ///  it first. A successfully packed unreliable message has this link's targets removed from
    ///  its target set: one transmission per link is all it gets.
    pub fn encode_few(
        &mut self,
        encoder: &mut DatagramEncoder,
        outbound: &mut OutboundMessages,
    ) -> EncodeOutcome {
        let mut count = 0;
        let mut remaining = self.entries.len();

        while remaining > 0 {
            remaining -= 1;

            let current = self.next;
            let key = self.entries[current];
            self.next = (current + 1) % self.entries.len();

            let Some(message) = outbound.message(key) else {
                // the registry no longer knows the message; drop the stale reference
                self.remove_at(current);
                if self.entries.is_empty() {
                    break;
                }
                continue;
            };

            let intersection = self.target_intersection(message);

            if intersection.is_empty() {
                trace!("message {} is settled for this link, dropping it from the queue", key);
                outbound.release(key);
                self.remove_at(current);
                if self.entries.is_empty() {
                    break;
                }
                continue;
            }

            if !Self::try_encode(encoder, &intersection, message) {
                // park the cursor on the message that did not fit: it goes first next time
                self.next = current;
                return EncodeOutcome { count, rotation_complete: false };
            }

            count += 1;

            if message.reliability == Reliability::Unreliable {
                let message = outbound.message_mut(key)
                    .expect("message was just read from the registry");
                for target in &self.targets {
                    message.targets.remove(target);
                }

                if message.targets.is_empty() {
                    outbound.release(key);
                    self.remove_at(current);
                    if self.entries.is_empty() {
                        break;
                    }
                }
            }
        }

        EncodeOutcome { count, rotation_complete: true }
    }

    fn target_intersection(&self, message: &Message) -> Vec<Uuid> {
        let mut result: Vec<Uuid> = message.targets
            .iter()
            .filter(|t| self.targets.contains(*t))
            .cloned()
            .collect();
        result.sort_unstable();
        result
    }

    /// Transactionally encodes one message record: source uuid, target list, framed payload
    ///  bytes. On overflow the encoder is rolled back and `false` is returned.
    fn try_encode(
        encoder: &mut DatagramEncoder,
        intersection: &[Uuid],
        message: &Message,
    ) -> bool {
        let checkpoint = encoder.checkpoint();

        encoder.put_uuid(&message.source);
        if intersection.is_empty() || intersection.len() > u8::MAX as usize {
            encoder.set_error();
        }
        else {
            encoder.put_u8(intersection.len() as u8);
        }
        for target in intersection {
            encoder.put_uuid(target);
        }
        encoder.put_slice(&message.bytes);

        if encoder.has_error() {
            encoder.restore(checkpoint);
            return false;
        }
        true
    }

    fn remove_at(&mut self, index: usize) {
        self.entries.remove(index);

        if self.entries.is_empty() {
            self.next = 0;
            return;
        }
        if index < self.next {
            self.next -= 1;
        }
        if self.next >= self.entries.len() {
            self.next = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::message::MessageHeader;
    use crate::sequence_number::SequenceNumber;
    use crate::wire::try_get_uuid;
    use super::*;

    fn peer(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    fn targets(peers: &[u8]) -> FxHashSet<Uuid> {
        peers.iter().map(|n| peer(*n)).collect()
    }

    /// decodes the message records in an encoder's buffer back into (source, targets, payload)
    fn decode_records(buf: &[u8]) -> Vec<(Uuid, Vec<Uuid>, Vec<u8>)> {
        let mut buf = buf;
        let mut result = Vec::new();
        while !buf.is_empty() {
            let source = try_get_uuid(&mut buf).unwrap();
            let target_count = bytes::Buf::try_get_u8(&mut buf).unwrap();
            let mut tgts = Vec::new();
            for _ in 0..target_count {
                tgts.push(try_get_uuid(&mut buf).unwrap());
            }
            let header = MessageHeader::try_deser(&mut buf).unwrap();
            let mut payload = vec![0u8; header.payload_len as usize];
            bytes::Buf::copy_to_slice(&mut buf, &mut payload);
            result.push((source, tgts, payload));
        }
        result
    }

    fn reliable_record_len(num_targets: usize, payload_len: usize) -> usize {
        16 + 1 + 16 * num_targets + 7 + payload_len
    }

    #[test]
    fn test_insert_preserves_send_order() {
        let mut outbound = OutboundMessages::new();
        let mut queue = TransmitQueue::new(peer(2));

        for payload in [[10u8], [11], [12]] {
            let key = outbound.broadcast_reliable(peer(1), &payload, targets(&[2]));
            outbound.acquire(key);
            queue.insert_message(key);
        }

        let mut encoder = DatagramEncoder::new(1000);
        let outcome = queue.encode_few(&mut encoder, &mut outbound);
        assert_eq!(outcome, EncodeOutcome { count: 3, rotation_complete: true });

        let payloads: Vec<Vec<u8>> = decode_records(encoder.as_slice())
            .into_iter()
            .map(|(_, _, p)| p)
            .collect();
        assert_eq!(payloads, vec![vec![10], vec![11], vec![12]]);
    }

    #[test]
    fn test_cursor_parks_on_unpacked_message_and_rotates_fairly() {
        let mut outbound = OutboundMessages::new();
        let mut queue = TransmitQueue::new(peer(2));

        for payload in [[10u8], [11], [12]] {
            let key = outbound.broadcast_reliable(peer(1), &payload, targets(&[2]));
            outbound.acquire(key);
            queue.insert_message(key);
        }

        // room for exactly two records per datagram
        let capacity = 2 * reliable_record_len(1, 1);

        let mut encoder = DatagramEncoder::new(capacity);
        let outcome = queue.encode_few(&mut encoder, &mut outbound);
        assert_eq!(outcome, EncodeOutcome { count: 2, rotation_complete: false });
        let first: Vec<Vec<u8>> = decode_records(encoder.as_slice()).into_iter().map(|(_, _, p)| p).collect();
        assert_eq!(first, vec![vec![10], vec![11]]);

        // the next pass starts with the message that did not fit, then wraps around
        let mut encoder = DatagramEncoder::new(capacity);
        let outcome = queue.encode_few(&mut encoder, &mut outbound);
        assert_eq!(outcome, EncodeOutcome { count: 2, rotation_complete: false });
        let second: Vec<Vec<u8>> = decode_records(encoder.as_slice()).into_iter().map(|(_, _, p)| p).collect();
        assert_eq!(second, vec![vec![12], vec![10]]);
    }

    #[test]
    fn test_unreliable_is_transmitted_once_per_link() {
        let mut outbound = OutboundMessages::new();
        let mut queue = TransmitQueue::new(peer(2));

        let key = outbound.broadcast_unreliable(peer(1), 77, &[42], targets(&[2, 3]));
        outbound.acquire(key);
        queue.insert_message(key);

        let mut encoder = DatagramEncoder::new(1000);
        let outcome = queue.encode_few(&mut encoder, &mut outbound);
        assert_eq!(outcome.count, 1);

        // this link's duty is done, but target 3 still needs some other link
        assert!(queue.is_empty());
        assert_eq!(outbound.message(key).unwrap().targets, targets(&[3]));
        assert_eq!(outbound.holds(key), Some(0));
    }

    #[test]
    fn test_unreliable_released_when_no_targets_remain() {
        let mut outbound = OutboundMessages::new();
        let mut queue = TransmitQueue::new(peer(2));

        let key = outbound.broadcast_unreliable(peer(1), 77, &[42], targets(&[2]));
        outbound.acquire(key);
        queue.insert_message(key);

        let mut encoder = DatagramEncoder::new(1000);
        queue.encode_few(&mut encoder, &mut outbound);

        assert!(queue.is_empty());
        assert!(outbound.message(key).is_none());
    }

    #[test]
    fn test_settled_message_is_erased() {
        let mut outbound = OutboundMessages::new();
        let mut queue = TransmitQueue::new(peer(2));

        let key = outbound.broadcast_reliable(peer(1), &[1], targets(&[2]));
        outbound.acquire(key);
        queue.insert_message(key);

        // the only target acks before the next packing pass
        outbound.acknowledge(SequenceNumber::from_raw(0), peer(2), &targets(&[2]));

        let mut encoder = DatagramEncoder::new(1000);
        let outcome = queue.encode_few(&mut encoder, &mut outbound);

        assert_eq!(outcome, EncodeOutcome { count: 0, rotation_complete: true });
        assert!(queue.is_empty());
        assert!(encoder.is_empty());
        assert!(outbound.message(key).is_none());
    }

    #[test]
    fn test_reliable_stays_queued_until_acknowledged() {
        let mut outbound = OutboundMessages::new();
        let mut queue = TransmitQueue::new(peer(2));

        let key = outbound.broadcast_reliable(peer(1), &[1], targets(&[2]));
        outbound.acquire(key);
        queue.insert_message(key);

        for _ in 0..3 {
            let mut encoder = DatagramEncoder::new(1000);
            let outcome = queue.encode_few(&mut encoder, &mut outbound);
            assert_eq!(outcome.count, 1);
            assert_eq!(queue.len(), 1);
        }
    }

    #[test]
    fn test_only_intersecting_targets_are_encoded() {
        let mut outbound = OutboundMessages::new();
        let mut queue = TransmitQueue::new(peer(2));
        queue.add_target(peer(3));

        let key = outbound.broadcast_reliable(peer(1), &[1], targets(&[2, 3, 4]));
        outbound.acquire(key);
        queue.insert_message(key);

        let mut encoder = DatagramEncoder::new(1000);
        queue.encode_few(&mut encoder, &mut outbound);

        let records = decode_records(encoder.as_slice());
        assert_eq!(records.len(), 1);
        let mut expected = vec![peer(2), peer(3)];
        expected.sort_unstable();
        assert_eq!(records[0].1, expected);
        // the target set itself is untouched for reliable messages
        assert_eq!(outbound.message(key).unwrap().targets, targets(&[2, 3, 4]));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::one(vec![1])]
    #[case::several(vec![1, 2, 3])]
    fn test_empty_iff_cursor_at_origin(#[case] payloads: Vec<u8>) {
        let mut outbound = OutboundMessages::new();
        let mut queue = TransmitQueue::new(peer(2));

        for p in &payloads {
            let key = outbound.broadcast_unreliable(peer(1), *p as u64, &[*p], targets(&[2]));
            outbound.acquire(key);
            queue.insert_message(key);
        }
        assert_eq!(queue.is_empty(), payloads.is_empty());

        let mut encoder = DatagramEncoder::new(1000);
        queue.encode_few(&mut encoder, &mut outbound);

        // everything unreliable was drained, the invariant holds again
        assert!(queue.is_empty());
        assert_eq!(queue.next, 0);
    }
}
