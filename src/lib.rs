//! A message-oriented overlay transport that delivers application payloads between identified
//!  peers over plain UDP, multiplexing two delivery classes over the same datagram stream:
//!
//! * **unreliable, at-most-once**: one transmission per link, no retransmission; duplicates
//!   caused by other traffic sharing the link are suppressed at the receiver by an opaque
//!   per-message dedup key
//! * **reliable, at-least-once on the wire, exactly-once and in-order at the application**:
//!   messages are retransmitted until every intended recipient has acknowledged them, the
//!   receiver filters duplicates and hands payloads to the application in send order
//!
//! ## Design goals
//!
//! * A broadcast reaches several recipients in one call; each link packs many logical messages
//!   of mixed delivery class into single MTU-bounded datagrams, rotating fairly across messages
//!   so that a large retransmission backlog cannot starve fresh traffic
//! * Messages can be forwarded one hop through an intermediary peer whose link lists the final
//!   recipient as a reachable target; the intermediary re-injects the message with its original
//!   source and sequence number preserved
//! * Acknowledgements ride on every outbound datagram as a compact fixed-width window (highest
//!   received sequence number plus a 31 bit predecessor bitmap), so no separate ack round-trips
//!   are needed while traffic flows; a keepalive pass emits ack-only datagrams when there is
//!   nothing else to say
//! * Explicitly *not* goals: congestion control, flow control beyond the MTU bound, multi-hop
//!   routing, fragmentation of oversized messages, or cryptographic protection
//!
//! ## Wire format
//!
//! One UDP payload, all numbers in network byte order (BE):
//!
//! ```ascii
//! 0:  sender uuid (16 bytes)
//! 16: ack header (9 bytes): flags (u8, bit 0 = empty) + highest sn (u32) + predecessors (u32)
//! 25: zero or more message records, packed until the datagram is full
//! ```
//!
//! Message record:
//!
//! ```ascii
//! 0:  source uuid (16 bytes) - the originating node, not necessarily the datagram sender
//! 16: target count (u8, 1..=255; 0 is invalid)
//! 17: target uuids (16 bytes each)
//! *:  framed payload: delivery class (u8), sequence number (u32), dedup key (u64, unreliable
//!      only), payload length (u16), payload bytes
//! ```

pub mod ack_set;
pub mod config;
pub mod core;
pub mod link;
pub mod message;
pub mod outbound;
pub mod sequence_number;
pub mod transmit_queue;
pub mod wire;
