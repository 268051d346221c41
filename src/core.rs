use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use anyhow::bail;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
#[cfg(test)] use mockall::automock;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::ack_set::AckSet;
use crate::config::TransportConfig;
use crate::link::{Link, SendSocket};
use crate::message::{Message, MessageHeader, Reliability};
use crate::outbound::{MessageKey, OutboundMessages};
use crate::sequence_number::SequenceNumber;
use crate::wire::{self, DatagramHeader, UUID_SERIALIZED_LEN};

/// This trait decouples the transport from the handling of a received application payload.
///  It is passed around as an `Arc<dyn ...>`; a callback implementation is free to broadcast
///  from within [MessageDispatcher::on_message].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, source: Uuid, msg_buf: &[u8]);
}

/// Receive-side bookkeeping per remote source (the message originator, not necessarily the link
///  peer the messages arrive through).
struct SourceReceiveState {
    /// reliable sequence numbers that have arrived, the dedup window
    arrivals: AckSet,
    /// the next reliable sequence number to hand to the application; everything before it has
    ///  been delivered (or processed, for messages this node is not a recipient of)
    delivery_cursor: SequenceNumber,
    /// out-of-order arrivals awaiting their predecessors; `None` marks a message that advances
    ///  the cursor without a local delivery
    pending: FxHashMap<u32, Option<Bytes>>,
    /// recently seen unreliable dedup keys, insertion order kept for eviction
    recent_user_ids: FxHashSet<u64>,
    user_id_order: VecDeque<u64>,
}

impl Default for SourceReceiveState {
    fn default() -> Self {
        SourceReceiveState {
            arrivals: AckSet::new(),
            delivery_cursor: SequenceNumber::ZERO,
            pending: FxHashMap::default(),
            recent_user_ids: FxHashSet::default(),
            user_id_order: VecDeque::new(),
        }
    }
}

struct CoreState {
    links: FxHashMap<Uuid, Link>,
    outbound: OutboundMessages,
    sources: FxHashMap<Uuid, SourceReceiveState>,
}

/// The per-node heart of the transport: it owns all links, routes broadcasts into the transmit
///  queues of matching links, deduplicates received messages, dispatches application payloads
///  in source order, and re-injects messages that still have other recipients (one forwarding
///  hop).
///
/// All state lives behind one lock; application callbacks are invoked after the lock is
///  released so that a callback can broadcast.
pub struct Core {
    self_id: Uuid,
    config: Arc<TransportConfig>,
    dispatcher: Arc<dyn MessageDispatcher>,
    state: Arc<Mutex<CoreState>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Core {
    /// NB: must be called from within a tokio runtime - the keepalive pass that drives
    ///  retransmission and ack-only datagrams is spawned here
    pub fn new(
        self_id: Uuid,
        config: TransportConfig,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> Arc<Core> {
        let config = Arc::new(config);
        let state = Arc::new(Mutex::new(CoreState {
            links: FxHashMap::default(),
            outbound: OutboundMessages::new(),
            sources: FxHashMap::default(),
        }));

        let keepalive = tokio::spawn(keepalive_loop(state.clone(), config.clone(), self_id));

        Arc::new(Core {
            self_id,
            config,
            dispatcher,
            state,
            tasks: StdMutex::new(vec![keepalive]),
        })
    }

    pub fn self_id(&self) -> Uuid {
        self.self_id
    }

    /// Registers a link to `remote` over a connected UDP socket and spawns its receive loop.
    pub async fn add_link(&self, remote: Uuid, socket: UdpSocket) -> anyhow::Result<()> {
        let socket = Arc::new(socket);
        self.register_link(remote, socket.clone()).await?;

        let handle = tokio::spawn(recv_loop(
            socket,
            remote,
            self.state.clone(),
            self.dispatcher.clone(),
            self.config.clone(),
            self.self_id,
        ));
        self.tasks.lock().expect("task list lock poisoned").push(handle);
        Ok(())
    }

    /// Registers a link over an arbitrary datagram sink. No receive loop is spawned; inbound
    ///  datagrams are expected through [Core::handle_datagram].
    pub async fn add_link_with_socket(
        &self,
        remote: Uuid,
        socket: Arc<dyn SendSocket>,
    ) -> anyhow::Result<()> {
        self.register_link(remote, socket).await
    }

    async fn register_link(&self, remote: Uuid, socket: Arc<dyn SendSocket>) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.links.contains_key(&remote) {
            bail!("link to {} is already registered", remote);
        }
        debug!("node {}: adding link to {}", self.self_id, remote);
        state.links.insert(remote, Link::new(remote, socket));
        Ok(())
    }

    /// Registers `target` as reachable over the link to `link_peer` (one forwarding hop).
    pub async fn add_target(&self, link_peer: Uuid, target: Uuid) -> anyhow::Result<()> {
        match self.state.lock().await.links.get_mut(&link_peer) {
            Some(link) => {
                link.queue.add_target(target);
                Ok(())
            }
            None => bail!("no link to {}", link_peer),
        }
    }

    /// Broadcasts a payload with reliable, in-order, exactly-once delivery to every peer
    ///  reachable over any link. The message is retransmitted until all recipients have
    ///  acknowledged it.
    pub async fn broadcast_reliable(&self, payload: &[u8]) -> anyhow::Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let targets = self.broadcast_targets(state);
        if targets.is_empty() {
            debug!("reliable broadcast without any reachable target - dropping");
            return Ok(());
        }
        self.check_fits(payload.len(), targets.len(), Reliability::Reliable)?;

        let key = state.outbound.broadcast_reliable(self.self_id, payload, targets);
        route_message(state, key);
        Ok(())
    }

    /// Broadcasts a payload with best-effort delivery: one transmission per link, no
    ///  retransmission. `user_id` scopes receiver-side duplicate suppression.
    pub async fn broadcast_unreliable(&self, user_id: u64, payload: &[u8]) -> anyhow::Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let targets = self.broadcast_targets(state);
        if targets.is_empty() {
            debug!("unreliable broadcast without any reachable target - dropping");
            return Ok(());
        }
        self.check_fits(payload.len(), targets.len(), Reliability::Unreliable)?;

        let key = state.outbound.broadcast_unreliable(self.self_id, user_id, payload, targets);
        route_message(state, key);
        Ok(())
    }

    /// Drains every link once: packs and sends datagrams until each queue has had one full
    ///  rotation (reliable messages stay queued for retransmission), plus an ack-only datagram
    ///  where acks are pending. Completion of the returned future is the flush notification.
    pub async fn flush(&self) {
        let remotes: Vec<Uuid> = self.state.lock().await.links.keys().cloned().collect();
        for remote in remotes {
            drain_link(&self.state, self.self_id, self.config.max_datagram_size(), remote).await;
        }
    }

    /// Feeds one received datagram into the node, as arriving on the link to `from`. This is
    ///  the entry point used by the per-link receive loops and by in-memory substrates.
    pub async fn handle_datagram(&self, from: Uuid, buf: &[u8]) {
        process_datagram(&self.state, &self.dispatcher, &self.config, self.self_id, from, buf).await;
    }

    /// Aborts the receive loops and the keepalive pass. Concurrent `flush` calls complete
    ///  normally; dropped in-flight futures are the cancellation.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().expect("task list lock poisoned");
        debug!("shutting down node {}: aborting {} task(s)", self.self_id, tasks.len());
        for handle in tasks.drain(..) {
            handle.abort();
        }
    }

    fn broadcast_targets(&self, state: &CoreState) -> FxHashSet<Uuid> {
        let mut targets: FxHashSet<Uuid> = state.links.values()
            .flat_map(|l| l.queue.targets().iter().cloned())
            .collect();
        targets.remove(&self.self_id);
        targets
    }

    /// A message that cannot fit into a datagram even on its own can never be transmitted -
    ///  that is a delivery failure reported to the caller, not a queueable condition.
    fn check_fits(
        &self,
        payload_len: usize,
        target_count: usize,
        reliability: Reliability,
    ) -> anyhow::Result<()> {
        if payload_len > u16::MAX as usize {
            bail!("payload of {} bytes exceeds the framing limit of {}", payload_len, u16::MAX);
        }
        if target_count > u8::MAX as usize {
            bail!("{} targets exceed the wire limit of {}", target_count, u8::MAX);
        }

        let header = MessageHeader {
            reliability,
            sequence_number: SequenceNumber::ZERO,
            user_id: 0,
            payload_len: payload_len as u16,
        };
        let record_len = UUID_SERIALIZED_LEN
            + 1
            + UUID_SERIALIZED_LEN * target_count
            + header.serialized_len()
            + payload_len;
        let needed = DatagramHeader::SERIALIZED_LEN + record_len;

        if needed > self.config.max_datagram_size() {
            bail!(
                "message of {} payload bytes needs a {} byte datagram, exceeding the MTU bound of {}",
                payload_len, needed, self.config.max_datagram_size(),
            );
        }
        Ok(())
    }
}

/// inserts a registered message into the transmit queue of every link that can reach one of
///  its targets
fn route_message(state: &mut CoreState, key: MessageKey) {
    let Some(message) = state.outbound.message(key) else { return };
    let targets = message.targets.clone();

    let matching: Vec<Uuid> = state.links.iter()
        .filter(|(_, link)| link.queue.targets().iter().any(|t| targets.contains(t)))
        .map(|(remote, _)| *remote)
        .collect();

    if matching.is_empty() {
        trace!("no link reaches any target of message {} - dropping it", key);
        state.outbound.drop_if_unreferenced(key);
        return;
    }

    for remote in matching {
        state.outbound.acquire(key);
        state.links.get_mut(&remote)
            .expect("link disappeared while routing")
            .queue
            .insert_message(key);
    }
}

struct DecodedRecord {
    source: Uuid,
    targets: Vec<Uuid>,
    header: MessageHeader,
    payload: Bytes,
}

fn try_decode_record(buf: &mut &[u8]) -> anyhow::Result<DecodedRecord> {
    let source = wire::try_get_uuid(buf)?;

    let target_count = buf.try_get_u8()?;
    if target_count == 0 {
        bail!("message record with zero targets");
    }
    let mut targets = Vec::with_capacity(target_count as usize);
    for _ in 0..target_count {
        targets.push(wire::try_get_uuid(buf)?);
    }

    let header = MessageHeader::try_deser(buf)?;
    if buf.remaining() < header.payload_len as usize {
        bail!(
            "truncated message payload: {} bytes remaining, {} announced",
            buf.remaining(), header.payload_len,
        );
    }
    let payload = Bytes::copy_from_slice(&buf[..header.payload_len as usize]);
    buf.advance(header.payload_len as usize);

    Ok(DecodedRecord { source, targets, header, payload })
}

async fn process_datagram(
    state: &Mutex<CoreState>,
    dispatcher: &Arc<dyn MessageDispatcher>,
    config: &TransportConfig,
    self_id: Uuid,
    from: Uuid,
    buf: &[u8],
) {
    let deliveries = {
        let mut guard = state.lock().await;
        let state = &mut *guard;

        let mut parse: &[u8] = buf;
        let header = match DatagramHeader::try_deser(&mut parse) {
            Ok(header) => header,
            Err(e) => {
                warn!("received datagram with unparsable header on link to {} - dropping: {}", from, e);
                return;
            }
        };
        if header.sender != from {
            warn!("received datagram claiming sender {} on the link to {} - dropping", header.sender, from);
            return;
        }
        let Some(link_reach) = state.links.get(&from).map(|l| l.queue.targets().clone()) else {
            warn!("received datagram for unknown link {} - dropping", from);
            return;
        };

        if !header.acks.is_empty() {
            for sn in header.acks.iter() {
                state.outbound.acknowledge(sn, from, &link_reach);
            }
            // anything below the peer's ack window floor can never be acknowledged anymore
            state.outbound.concede_unackable(header.acks.highest().minus(31), from, &link_reach);
        }

        let mut deliveries: Vec<(Uuid, Bytes)> = Vec::new();
        while !parse.is_empty() {
            let record = match try_decode_record(&mut parse) {
                Ok(record) => record,
                Err(e) => {
                    warn!("dropping rest of datagram from {}: {}", from, e);
                    break;
                }
            };
            process_record(state, config, self_id, from, record, &mut deliveries);
        }
        deliveries
    };

    // the lock is released: a callback may broadcast
    for (source, payload) in deliveries {
        dispatcher.on_message(source, &payload).await;
    }
}

#[derive(Eq, PartialEq, Debug)]
enum ReliableArrival {
    Fresh,
    AlreadyKnown,
    TooFarAhead,
}

/// Classifies a reliable arrival against the source's dedup window and marks fresh ones.
///  Arrivals more than 31 ahead of the delivery cursor are refused so that the out-of-order
///  stash stays bounded and the ack window never slides past an undelivered number; the sender
///  keeps retransmitting those until the gap closes.
fn classify_reliable(source_state: &mut SourceReceiveState, sn: SequenceNumber) -> ReliableArrival {
    if sn.precedes(source_state.delivery_cursor) {
        return ReliableArrival::AlreadyKnown;
    }
    if sn.offset_from(source_state.delivery_cursor) > 31 {
        return ReliableArrival::TooFarAhead;
    }
    if source_state.arrivals.contains(sn) {
        return ReliableArrival::AlreadyKnown;
    }
    if source_state.arrivals.try_add(sn) {
        ReliableArrival::Fresh
    }
    else {
        ReliableArrival::TooFarAhead
    }
}

fn process_record(
    state: &mut CoreState,
    config: &TransportConfig,
    self_id: Uuid,
    from: Uuid,
    record: DecodedRecord,
    deliveries: &mut Vec<(Uuid, Bytes)>,
) {
    match record.header.reliability {
        Reliability::Reliable => {
            let sn = record.header.sequence_number;
            let source_state = state.sources.entry(record.source).or_default();

            match classify_reliable(source_state, sn) {
                ReliableArrival::TooFarAhead => {
                    trace!("reliable message {} from {} is too far ahead - not acknowledging yet", sn, record.source);
                }
                ReliableArrival::AlreadyKnown => {
                    trace!("duplicate reliable message {} from {}", sn, record.source);
                    // our previous ack may have been lost, so acknowledge again
                    if let Some(link) = state.links.get_mut(&from) {
                        link.note_received_reliable(sn);
                    }
                }
                ReliableArrival::Fresh => {
                    let for_self = record.targets.contains(&self_id);

                    if sn == source_state.delivery_cursor {
                        if for_self {
                            deliveries.push((record.source, record.payload.clone()));
                        }
                        source_state.delivery_cursor = source_state.delivery_cursor.next();

                        // the gap is closed, release consecutive stashed messages
                        while let Some(stashed) = source_state.pending
                            .remove(&source_state.delivery_cursor.to_raw())
                        {
                            if let Some(payload) = stashed {
                                deliveries.push((record.source, payload));
                            }
                            source_state.delivery_cursor = source_state.delivery_cursor.next();
                        }
                    }
                    else {
                        trace!("stashing out-of-order reliable message {} from {}", sn, record.source);
                        source_state.pending.insert(
                            sn.to_raw(),
                            if for_self { Some(record.payload.clone()) } else { None },
                        );
                    }

                    if let Some(link) = state.links.get_mut(&from) {
                        link.note_received_reliable(sn);
                    }
                    forward_remainder(state, self_id, &record);
                }
            }
        }
        Reliability::Unreliable => {
            let source_state = state.sources.entry(record.source).or_default();
            if !note_user_id(source_state, record.header.user_id, config.unreliable_dedup_window) {
                trace!("duplicate unreliable message from {}", record.source);
                return;
            }

            if record.targets.contains(&self_id) {
                deliveries.push((record.source, record.payload.clone()));
            }
            forward_remainder(state, self_id, &record);
        }
    }
}

/// tracks an unreliable dedup key; returns false for a duplicate
fn note_user_id(source_state: &mut SourceReceiveState, user_id: u64, window: usize) -> bool {
    if source_state.recent_user_ids.contains(&user_id) {
        return false;
    }

    source_state.recent_user_ids.insert(user_id);
    source_state.user_id_order.push_back(user_id);
    if source_state.user_id_order.len() > window {
        if let Some(evicted) = source_state.user_id_order.pop_front() {
            source_state.recent_user_ids.remove(&evicted);
        }
    }
    true
}

/// Re-injects a received message whose target set names recipients beyond this node, preserving
///  the original source, class and sequence number. Links whose reachable set intersects the
///  remaining targets pick it up.
fn forward_remainder(state: &mut CoreState, self_id: Uuid, record: &DecodedRecord) {
    let remaining: FxHashSet<Uuid> = record.targets.iter()
        .filter(|t| **t != self_id)
        .cloned()
        .collect();
    if remaining.is_empty() {
        return;
    }

    trace!(
        "forwarding message {} from {} towards {} remaining target(s)",
        record.header.sequence_number, record.source, remaining.len(),
    );

    let message = Message::framed(
        record.source,
        remaining,
        record.header.reliability,
        record.header.sequence_number,
        record.header.user_id,
        &record.payload,
    );
    let key = state.outbound.insert_forwarded(message);
    route_message(state, key);
}

/// Packs and sends datagrams on one link until a pass completes a full queue rotation (or there
///  is nothing left to say).
async fn drain_link(
    state: &Mutex<CoreState>,
    self_id: Uuid,
    max_datagram_size: usize,
    remote: Uuid,
) {
    loop {
        let (datagram, socket) = {
            let mut guard = state.lock().await;
            let CoreState { links, outbound, .. } = &mut *guard;
            let Some(link) = links.get_mut(&remote) else { return };

            match link.build_datagram(self_id, max_datagram_size, outbound) {
                None => return,
                Some(datagram) => (datagram, link.socket.clone()),
            }
        };

        trace!("sending datagram with {} message(s) on link to {}", datagram.message_count, remote);
        socket.send_datagram(&datagram.bytes).await;

        if datagram.message_count == 0 || datagram.rotation_complete {
            return;
        }
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    remote: Uuid,
    state: Arc<Mutex<CoreState>>,
    dispatcher: Arc<dyn MessageDispatcher>,
    config: Arc<TransportConfig>,
    self_id: Uuid,
) {
    let max_datagram_size = config.max_datagram_size();
    let mut buf = vec![0u8; max_datagram_size + 1];

    loop {
        match socket.recv(&mut buf).await {
            Ok(len) => {
                if len > max_datagram_size {
                    warn!("received datagram exceeding the MTU bound on link to {} - skipping", remote);
                    continue;
                }
                process_datagram(&state, &dispatcher, &config, self_id, remote, &buf[..len]).await;
            }
            Err(e) => {
                error!("socket error on link to {}: {}", remote, e);
            }
        }
    }
}

/// Periodic per-node pass: every link with unacknowledged reliable traffic or pending acks gets
///  one packing pass. This is what drives retransmission and ack-only keepalive datagrams.
async fn keepalive_loop(state: Arc<Mutex<CoreState>>, config: Arc<TransportConfig>, self_id: Uuid) {
    loop {
        sleep(config.keepalive_interval).await;

        let due: Vec<Uuid> = state.lock().await.links.iter()
            .filter(|(_, link)| link.wants_keepalive(config.keepalive_interval))
            .map(|(remote, _)| *remote)
            .collect();

        for remote in due {
            drain_link(&state, self_id, config.max_datagram_size(), remote).await;
        }
    }
}
