//! Session state machine
//!
//! Tracks per-client in-flight message transactions, packet-identifier
//! allocation, and the three bounded output queues (one per QoS) plus a
//! control-packet queue. `Session` itself is plain, synchronously-mutated
//! state; `SessionHandle` wraps it for concurrent access and adds the
//! blocking-dequeue and ownership-displacement machinery the network layer
//! needs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::error::QueueOverflow;
use crate::message::{Message, TopicFilter};
use crate::principal::{Principal, PrincipalId};
use crate::protocol::{PacketId, QoS, ServerPacket};
use crate::quota::Quota;

/// Broker-scoped session identifier, distinct from the client-supplied
/// `clientIdentifier` — a client may reconnect under the same identifier
/// and resume a session that keeps the same `SessionId` across the
/// reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Monotonically-increasing id generator, used by the broker when it
    /// creates a new session.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// In-flight outbound register for one QoS 1/2 leg: a map from packet
/// identifier to the message awaiting acknowledgement, plus a parallel
/// queue preserving insertion order for retransmission-on-resume (a plain
/// `HashMap` doesn't preserve it).
#[derive(Debug, Default)]
struct InFlight {
    messages: HashMap<PacketId, Message>,
    order: VecDeque<PacketId>,
}

impl InFlight {
    fn insert(&mut self, pid: PacketId, message: Message) {
        self.messages.insert(pid, message);
        self.order.push_back(pid);
    }

    fn remove(&mut self, pid: PacketId) -> Option<Message> {
        self.order.retain(|&p| p != pid);
        self.messages.remove(&pid)
    }

    fn len(&self) -> usize {
        self.messages.len()
    }

    /// Iterate in insertion order, oldest first.
    fn in_order(&self) -> impl Iterator<Item = (PacketId, &Message)> {
        self.order
            .iter()
            .map(move |pid| (*pid, self.messages.get(pid).expect("order/messages desync")))
    }
}

/// Packet identifiers released from `unreleased` (PUBREC received) and
/// awaiting PUBCOMP. Tracked with the same order-preserving shape as
/// `InFlight`, minus the message payload (QoS 2 release carries none).
#[derive(Debug, Default)]
struct ReleasedSet {
    ids: HashSet<PacketId>,
    order: VecDeque<PacketId>,
}

impl ReleasedSet {
    fn insert(&mut self, pid: PacketId) {
        self.ids.insert(pid);
        self.order.push_back(pid);
    }

    fn remove(&mut self, pid: PacketId) -> bool {
        self.order.retain(|&p| p != pid);
        self.ids.remove(&pid)
    }

    fn in_order(&self) -> impl Iterator<Item = PacketId> + '_ {
        self.order.iter().copied()
    }
}

/// Per-client session state: subscriptions, outbound queues, and the
/// packet-identifier in-flight registers for QoS 1/2 reliability.
pub struct Session {
    pub id: SessionId,
    pub client_identifier: Arc<str>,
    pub principal_id: PrincipalId,
    pub principal: Arc<Principal>,
    pub quota: Quota,
    /// `false` for a clean session: discarded entirely on disconnect.
    pub persistent: bool,

    subscriptions: HashMap<TopicFilter, QoS>,

    queue_qos0: VecDeque<ServerPacket>,
    queue_qos1: VecDeque<ServerPacket>,
    queue_qos2: VecDeque<ServerPacket>,
    control_queue: VecDeque<ServerPacket>,

    unacknowledged: InFlight,
    unreleased: InFlight,
    released: ReleasedSet,

    /// QoS 2 PUBLISH received but not yet released by the client, keyed by
    /// packet id and holding the message so it can be fanned out downstream
    /// once `processPublishRelease` arrives (the fan-out is deferred to the
    /// release, not the initial receive — spec.md §4.2).
    inbound_qos2: HashMap<PacketId, Message>,

    /// Free packet-identifier pool, initially `[0 .. maxPacketIdentifiers)`.
    /// A `VecDeque` so ids are handed out and returned in a stable,
    /// debuggable round-robin order rather than arbitrary hash order.
    free_ids: VecDeque<PacketId>,

    /// Set when the session goes idle (disconnected but persistent); used
    /// to decide whether a reconnect resumes it or starts fresh once
    /// `quota.max_idle_session_ttl` has elapsed.
    disconnected_at: Option<std::time::Instant>,
}

impl Session {
    pub fn new(
        id: SessionId,
        client_identifier: Arc<str>,
        principal_id: PrincipalId,
        principal: Arc<Principal>,
        persistent: bool,
    ) -> Self {
        let quota = principal.quota;
        let free_ids = (0..quota.max_packet_identifiers).collect();
        Self {
            id,
            client_identifier,
            principal_id,
            principal,
            quota,
            persistent,
            subscriptions: HashMap::new(),
            queue_qos0: VecDeque::new(),
            queue_qos1: VecDeque::new(),
            queue_qos2: VecDeque::new(),
            control_queue: VecDeque::new(),
            unacknowledged: InFlight::default(),
            unreleased: InFlight::default(),
            released: ReleasedSet::default(),
            inbound_qos2: HashMap::new(),
            free_ids,
            disconnected_at: None,
        }
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = (&TopicFilter, QoS)> {
        self.subscriptions.iter().map(|(f, q)| (f, *q))
    }

    pub fn mark_disconnected(&mut self) {
        self.disconnected_at = Some(std::time::Instant::now());
    }

    pub fn mark_reconnected(&mut self) {
        self.disconnected_at = None;
    }

    /// `true` once a persistent, disconnected session has sat idle longer
    /// than its principal's `max_idle_session_ttl`.
    pub fn is_idle_expired(&self) -> bool {
        self.disconnected_at
            .is_some_and(|at| at.elapsed() >= self.quota.max_idle_session_ttl)
    }

    pub fn add_subscription(&mut self, filter: TopicFilter, qos: QoS) {
        self.subscriptions.insert(filter, qos);
    }

    pub fn remove_subscription(&mut self, filter: &TopicFilter) -> bool {
        self.subscriptions.remove(filter).is_some()
    }

    /// Enqueue `message` for outbound delivery at the filter's granted QoS,
    /// downgraded to `min(message.qos, filter_qos)` per the subscription
    /// contract. Returns `Err(QueueOverflow)` for a QoS 1/2 hard overflow —
    /// the caller (`SessionHandle`) is responsible for cancelling the
    /// session's owner in response. QoS 0 never errors: it barrel-shifts.
    pub fn enqueue_message(&mut self, message: Message, filter_qos: QoS) -> Result<(), QueueOverflow> {
        let effective_qos = message.qos.min(filter_qos);
        match effective_qos {
            QoS::AtMostOnce => {
                self.queue_qos0.push_back(ServerPacket::Publish {
                    packet_id: None,
                    duplicate: false,
                    message,
                });
                while self.queue_qos0.len() > self.quota.max_queue_size_qos0 {
                    self.queue_qos0.pop_front();
                }
                Ok(())
            }
            QoS::AtLeastOnce => {
                if self.queue_qos1.len() >= self.quota.max_queue_size_qos1 {
                    return Err(QueueOverflow);
                }
                let pid = self.free_ids.pop_front().ok_or(QueueOverflow)?;
                self.unacknowledged.insert(pid, message.clone());
                self.queue_qos1.push_back(ServerPacket::Publish {
                    packet_id: Some(pid),
                    duplicate: false,
                    message,
                });
                Ok(())
            }
            QoS::ExactlyOnce => {
                if self.queue_qos2.len() >= self.quota.max_queue_size_qos2 {
                    return Err(QueueOverflow);
                }
                let pid = self.free_ids.pop_front().ok_or(QueueOverflow)?;
                self.unreleased.insert(pid, message.clone());
                self.queue_qos2.push_back(ServerPacket::Publish {
                    packet_id: Some(pid),
                    duplicate: false,
                    message,
                });
                Ok(())
            }
        }
    }

    /// Client acknowledged a QoS 1 publish: retire the packet identifier.
    /// An unknown pid is a protocol violation absorbed silently.
    pub fn handle_puback(&mut self, pid: PacketId) {
        if self.unacknowledged.remove(pid).is_some() {
            self.free_ids.push_back(pid);
        }
    }

    /// Client received a QoS 2 publish: move the pid to `released` and
    /// queue the PUBREL. An unknown pid is silently ignored.
    pub fn handle_pubrec(&mut self, pid: PacketId) {
        if self.unreleased.remove(pid).is_some() {
            self.released.insert(pid);
            self.control_queue.push_back(ServerPacket::PublishRelease(pid));
        }
    }

    /// Client completed a QoS 2 publish: retire the packet identifier.
    pub fn handle_pubcomp(&mut self, pid: PacketId) {
        if self.released.remove(pid) {
            self.free_ids.push_back(pid);
        }
    }

    /// Inbound QoS 1 PUBLISH: queue the PUBACK control response. The
    /// message itself is fanned out downstream by the broker, not here.
    pub fn acknowledge_inbound_publish(&mut self, pid: PacketId) {
        self.control_queue.push_back(ServerPacket::PublishAcknowledged(pid));
    }

    /// Inbound QoS 2 PUBLISH: stash `message` against `pid` (first arrival
    /// wins, so a retransmitted duplicate cannot clobber it) and queue the
    /// PUBREC control response. Returns `true` the first time `pid` is
    /// seen; `false` on a retransmitted duplicate. The message is not
    /// fanned out downstream here — that happens on `complete_inbound_release`.
    pub fn begin_inbound_publish(&mut self, pid: PacketId, message: Message) -> bool {
        let is_new = !self.inbound_qos2.contains_key(&pid);
        self.inbound_qos2.entry(pid).or_insert(message);
        self.control_queue.push_back(ServerPacket::PublishReceived(pid));
        is_new
    }

    /// Inbound QoS 2 PUBREL: clear the inbound register and queue PUBCOMP.
    /// Returns the stashed message so the caller can fan it out downstream,
    /// or `None` for an unknown/already-released pid (a protocol violation
    /// absorbed silently, per spec.md §7 — PUBCOMP is still queued since
    /// that reply costs the client nothing and may simply be a retransmit
    /// racing a PUBCOMP it already missed).
    pub fn complete_inbound_release(&mut self, pid: PacketId) -> Option<Message> {
        let message = self.inbound_qos2.remove(&pid);
        self.control_queue.push_back(ServerPacket::PublishComplete(pid));
        message
    }

    pub fn enqueue_subscribe_acknowledged(&mut self, packet_id: PacketId, granted: Vec<Option<QoS>>) {
        self.control_queue
            .push_back(ServerPacket::SubscribeAcknowledged { packet_id, granted });
    }

    pub fn enqueue_unsubscribe_acknowledged(&mut self, packet_id: PacketId) {
        self.control_queue
            .push_back(ServerPacket::UnsubscribeAcknowledged(packet_id));
    }

    pub fn enqueue_ping_response(&mut self) {
        self.control_queue.push_back(ServerPacket::PingResponse);
    }

    /// Re-emit every in-flight outbound register as a duplicate, at the
    /// head of its queue, on resumption of a persistent session. Ordering
    /// within each class is preserved (oldest first).
    pub fn resume_retransmissions(&mut self) {
        for (pid, message) in self
            .unacknowledged
            .in_order()
            .map(|(pid, msg)| (pid, msg.clone()))
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
        {
            self.queue_qos1.push_front(ServerPacket::Publish {
                packet_id: Some(pid),
                duplicate: true,
                message,
            });
        }
        for (pid, message) in self
            .unreleased
            .in_order()
            .map(|(pid, msg)| (pid, msg.clone()))
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
        {
            self.queue_qos2.push_front(ServerPacket::Publish {
                packet_id: Some(pid),
                duplicate: true,
                message,
            });
        }
        for pid in self.released.in_order().collect::<Vec<_>>().into_iter().rev() {
            self.control_queue.push_front(ServerPacket::PublishRelease(pid));
        }
    }

    /// Atomically take every queued output packet, control packets first,
    /// then publishes in QoS 0, QoS 1, QoS 2 order.
    pub fn drain_output(&mut self) -> Vec<ServerPacket> {
        let mut out = Vec::with_capacity(
            self.control_queue.len() + self.queue_qos0.len() + self.queue_qos1.len() + self.queue_qos2.len(),
        );
        out.extend(self.control_queue.drain(..));
        out.extend(self.queue_qos0.drain(..));
        out.extend(self.queue_qos1.drain(..));
        out.extend(self.queue_qos2.drain(..));
        out
    }

    pub fn has_pending_output(&self) -> bool {
        !self.control_queue.is_empty()
            || !self.queue_qos0.is_empty()
            || !self.queue_qos1.is_empty()
            || !self.queue_qos2.is_empty()
    }
}

/// Shared, concurrency-safe handle to a `Session`. Owns the blocking
/// `dequeue` condition-variable pattern and the owner-displacement slot
/// used when a client reconnects with an identifier already in use.
pub struct SessionHandle {
    session: RwLock<Session>,
    /// Signalled whenever new output becomes available.
    notify: Notify,
    /// Holds the current owning task's cancellation handle. Swapped
    /// wholesale (rather than using a single shared `Notify` or a
    /// `watch<bool>`) so that displacing an owner can never be confused
    /// with a stale cancellation from a since-ended ownership period: each
    /// period gets its own `Notify`, and `release_owner` only clears the
    /// slot if it still holds the caller's own instance.
    owner_slot: Mutex<Option<Arc<Notify>>>,
}

impl SessionHandle {
    pub fn new(session: Session) -> Arc<Self> {
        Arc::new(Self {
            session: RwLock::new(session),
            notify: Notify::new(),
            owner_slot: Mutex::new(None),
        })
    }

    pub fn id(&self) -> SessionId {
        self.session.read().id
    }

    pub fn client_identifier(&self) -> Arc<str> {
        self.session.read().client_identifier.clone()
    }

    pub fn is_persistent(&self) -> bool {
        self.session.read().persistent
    }

    pub fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        f(&mut self.session.write())
    }

    pub fn enqueue_message(&self, message: Message, filter_qos: QoS) -> Result<(), QueueOverflow> {
        let result = self.session.write().enqueue_message(message, filter_qos);
        if result.is_ok() {
            self.notify.notify_one();
        }
        result
    }

    pub fn handle_puback(&self, pid: PacketId) {
        self.session.write().handle_puback(pid);
    }

    pub fn handle_pubrec(&self, pid: PacketId) {
        self.session.write().handle_pubrec(pid);
        self.notify.notify_one();
    }

    pub fn handle_pubcomp(&self, pid: PacketId) {
        self.session.write().handle_pubcomp(pid);
    }

    pub fn acknowledge_inbound_publish(&self, pid: PacketId) {
        self.session.write().acknowledge_inbound_publish(pid);
        self.notify.notify_one();
    }

    pub fn begin_inbound_publish(&self, pid: PacketId, message: Message) -> bool {
        let is_new = self.session.write().begin_inbound_publish(pid, message);
        self.notify.notify_one();
        is_new
    }

    pub fn complete_inbound_release(&self, pid: PacketId) -> Option<Message> {
        let message = self.session.write().complete_inbound_release(pid);
        self.notify.notify_one();
        message
    }

    pub fn enqueue_subscribe_acknowledged(&self, packet_id: PacketId, granted: Vec<Option<QoS>>) {
        self.session
            .write()
            .enqueue_subscribe_acknowledged(packet_id, granted);
        self.notify.notify_one();
    }

    pub fn enqueue_unsubscribe_acknowledged(&self, packet_id: PacketId) {
        self.session.write().enqueue_unsubscribe_acknowledged(packet_id);
        self.notify.notify_one();
    }

    pub fn enqueue_ping_response(&self) {
        self.session.write().enqueue_ping_response();
        self.notify.notify_one();
    }

    pub fn resume_retransmissions(&self) {
        self.session.write().resume_retransmissions();
        self.notify.notify_one();
    }

    /// Block until at least one output packet is available, then return
    /// and clear the entire queued output. Uses the standard
    /// create-the-future-before-checking pattern so a notification that
    /// arrives between the check and the await is never missed.
    pub async fn dequeue(&self) -> Vec<ServerPacket> {
        loop {
            let notified = self.notify.notified();
            {
                let mut session = self.session.write();
                let out = session.drain_output();
                if !out.is_empty() {
                    return out;
                }
            }
            notified.await;
        }
    }

    /// Claim ownership of this session, displacing (cancelling) any
    /// current owner. Returns the `Notify` the caller should `notified()`
    /// on to learn of its own cancellation.
    pub fn acquire_owner(&self) -> Arc<Notify> {
        let fresh = Arc::new(Notify::new());
        let mut slot = self.owner_slot.lock();
        if let Some(previous) = slot.take() {
            previous.notify_waiters();
        }
        *slot = Some(fresh.clone());
        fresh
    }

    /// Release ownership acquired via `acquire_owner`, but only if `mine`
    /// is still the current owner — a late release from a prior ownership
    /// period must not clear a newer owner's slot.
    pub fn release_owner(&self, mine: &Arc<Notify>) {
        let mut slot = self.owner_slot.lock();
        if matches!(slot.as_ref(), Some(current) if Arc::ptr_eq(current, mine)) {
            *slot = None;
        }
    }

    /// Unconditionally cancel and clear the current owner — used on QoS
    /// 1/2 hard overflow.
    pub fn force_cancel(&self) {
        let mut slot = self.owner_slot.lock();
        if let Some(notify) = slot.take() {
            notify.notify_waiters();
        }
    }
}
