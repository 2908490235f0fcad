//! Broker coordinator
//!
//! Authenticates new connections, owns the session registry, routes
//! downstream publishes to matching sessions via the subscription index and
//! the topic trie, and enforces per-principal quotas and permissions. The
//! broker performs no network I/O itself — connections are represented only
//! by the [`SessionHandle`] the network layer drains via `dequeue` and
//! drives via the `Session`/`Broker` verbs.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::RejectReason;
use crate::message::{Message, TopicFilter};
use crate::principal::{Authenticator, ConnectionRequest};
use crate::protocol::{PacketId, QoS};
use crate::session::{Session, SessionHandle, SessionId};
use crate::topic::TopicTrie;

/// Broker-wide state: session registry, subscription index, retained store.
/// Kept behind an `Arc` inside [`Broker`] so the broker handle itself is
/// cheap to clone and share across the tasks that drive individual
/// connections.
struct BrokerCore {
    authenticator: Arc<dyn Authenticator>,
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    by_client_id: DashMap<Arc<str>, SessionId>,
    subscriptions: RwLock<TopicTrie<HashMap<SessionId, QoS>>>,
    retained: RwLock<TopicTrie<Message>>,
}

impl BrokerCore {
    fn register(&self, client_id: Arc<str>, handle: Arc<SessionHandle>) {
        let id = handle.id();
        self.sessions.insert(id, handle);
        self.by_client_id.insert(client_id, id);
    }

    /// Tear down a session entirely: drop it from both registries and strip
    /// its subscriptions out of the subscription trie. Used for clean-session
    /// disconnects and for displacing a stale session on a `cleanSession=true`
    /// reconnect.
    fn remove_session(&self, session_id: SessionId) {
        let Some((_, handle)) = self.sessions.remove(&session_id) else {
            return;
        };
        self.by_client_id.remove(&handle.client_identifier());

        let filters: Vec<TopicFilter> = handle.with_session(|s| {
            s.subscriptions().map(|(filter, _)| filter.clone()).collect()
        });
        if filters.is_empty() {
            return;
        }
        let mut subscriptions = self.subscriptions.write();
        for filter in filters {
            Self::unindex(&mut subscriptions, &filter, session_id);
        }
    }

    fn unindex(
        subscriptions: &mut TopicTrie<HashMap<SessionId, QoS>>,
        filter: &TopicFilter,
        session_id: SessionId,
    ) {
        let now_empty = match subscriptions.get_mut(filter.as_str()) {
            Some(subscribers) => {
                subscribers.remove(&session_id);
                subscribers.is_empty()
            }
            None => false,
        };
        if now_empty {
            subscriptions.remove(filter.as_str());
        }
    }
}

/// The MQTT broker: authenticates connections, creates or resumes sessions,
/// and fans downstream publishes out to every matching subscriber.
///
/// Cheap to clone — internally an `Arc<BrokerCore>` — so the network layer
/// can hand every connection task its own `Broker` handle.
#[derive(Clone)]
pub struct Broker(Arc<BrokerCore>);

impl Broker {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self(Arc::new(BrokerCore {
            authenticator,
            sessions: DashMap::new(),
            by_client_id: DashMap::new(),
            subscriptions: RwLock::new(TopicTrie::new()),
            retained: RwLock::new(TopicTrie::new()),
        }))
    }

    /// Scoped session acquisition: authenticate the request, create or
    /// resume the client's session, displace any prior owner, and return a
    /// [`SessionLease`] whose `Drop` releases and (for a clean session) tears
    /// the session down again. The caller drives the session for as long as
    /// it holds the lease, then drops it — ownership is scoped by Rust's own
    /// lifetime rules rather than by a pair of success/failure callbacks.
    pub async fn with_session(
        &self,
        request: ConnectionRequest,
    ) -> Result<(SessionLease, bool), RejectReason> {
        let principal_id = match self.0.authenticator.authenticate(&request).await {
            Err(e) => {
                warn!(error = %e, "authenticator failed, rejecting connection");
                return Err(RejectReason::ServerUnavailable);
            }
            Ok(None) => return Err(RejectReason::NotAuthorized),
            Ok(Some(id)) => id,
        };
        let principal = match self.0.authenticator.get_principal(&principal_id).await {
            Some(principal) => principal,
            None => return Err(RejectReason::NotAuthorized),
        };

        let client_id: Arc<str> = Arc::from(request.client_identifier.as_str());
        let existing = self.0.by_client_id.get(&client_id).map(|entry| *entry.value());

        let (handle, session_present) = if request.clean_session {
            if let Some(old_id) = existing {
                debug!(client_id = %client_id, "clean session requested, discarding prior session");
                self.0.remove_session(old_id);
            }
            let session = Session::new(SessionId::next(), client_id.clone(), principal_id, principal, false);
            let handle = SessionHandle::new(session);
            self.0.register(client_id, handle.clone());
            (handle, false)
        } else if let Some(old_id) = existing {
            let handle = self
                .0
                .sessions
                .get(&old_id)
                .map(|entry| entry.value().clone())
                .expect("by_client_id and sessions registries are out of sync");
            (handle, true)
        } else {
            let session = Session::new(SessionId::next(), client_id.clone(), principal_id, principal, true);
            let handle = SessionHandle::new(session);
            self.0.register(client_id, handle.clone());
            (handle, false)
        };

        let cancellation_token = handle.acquire_owner();
        if session_present {
            handle.with_session(|s| s.mark_reconnected());
            handle.resume_retransmissions();
        }

        let session_id = handle.id();
        Ok((
            SessionLease {
                core: self.0.clone(),
                handle,
                session_id,
                cancellation_token,
                clean_session: request.clean_session,
            },
            session_present,
        ))
    }

    /// Fan a single downstream message out to every session whose
    /// subscription filter matches `message.topic`, downgrading the QoS to
    /// `min(message.qos, filter_qos)` per subscriber. If `message.retain`,
    /// the retained store is updated (or the entry deleted, for the
    /// empty-payload sentinel) unconditionally — callers that need a
    /// permission check on the retain attempt should use
    /// [`Broker::publish_upstream`] instead.
    pub fn publish_downstream(&self, message: Message) {
        self.publish_downstream_inner(message, true);
    }

    fn publish_downstream_inner(&self, message: Message, store_retain: bool) {
        if message.retain && store_retain {
            let mut retained = self.0.retained.write();
            if message.is_retained_delete() {
                retained.remove(message.topic.as_str());
            } else {
                retained.insert(message.topic.as_str(), message.clone());
            }
        }

        let mut targets: Vec<(SessionId, QoS)> = Vec::new();
        self.0.subscriptions.read().matches(message.topic.as_str(), |subscribers| {
            targets.extend(subscribers.iter().map(|(id, qos)| (*id, *qos)));
        });

        for (session_id, filter_qos) in targets {
            let Some(handle) = self.0.sessions.get(&session_id).map(|entry| entry.value().clone()) else {
                continue;
            };
            if handle.enqueue_message(message.clone(), filter_qos).is_err() {
                warn!(?session_id, "outbound queue or packet-identifier pool exhausted, cancelling session");
                handle.force_cancel();
            }
        }
    }

    /// A client publish: apply the publisher's `publishPermissions` (silent
    /// drop of the whole message if denied), and — for a retained publish —
    /// `retainPermissions` (silent drop of just the retained-store write,
    /// the live fan-out still proceeds), then fan out exactly as
    /// [`Broker::publish_downstream`] would.
    pub fn publish_upstream(&self, session: &SessionHandle, message: Message) {
        let principal = session.with_session(|s| s.principal.clone());
        if !principal.publish_permissions.permits(message.topic.as_str()) {
            return;
        }
        let store_retain = !message.retain || principal.retain_permissions.permits(message.topic.as_str());
        self.publish_downstream_inner(message, store_retain);
    }

    /// Inbound PUBLISH from `handle`'s own client (spec.md §4.2
    /// "Inbound state machines"). QoS 0 fans the message out immediately
    /// with no acknowledgement. QoS 1 queues `PublishAcknowledged`
    /// immediately and fans out immediately — MQTT 3.1.1's one-phase
    /// inbound ladder. QoS 2 instead stashes the message against
    /// `packet_id` and queues only `PublishReceived`; the permission check
    /// and downstream fan-out are deferred to [`Broker::process_publish_release`],
    /// the two-phase ladder. A retransmitted duplicate PUBLISH with the
    /// same `packet_id` is idempotent: the stashed message isn't replaced
    /// and nothing is fanned out twice.
    ///
    /// `packet_id` must be `Some` for QoS 1/2 (the caller — the wire codec —
    /// is responsible for that invariant; MQTT 3.1.1 never encodes a QoS 1/2
    /// PUBLISH without one).
    pub fn process_publish(&self, handle: &Arc<SessionHandle>, packet_id: Option<PacketId>, message: Message) {
        match message.qos {
            QoS::AtMostOnce => self.publish_upstream(handle, message),
            QoS::AtLeastOnce => {
                let pid = packet_id.expect("QoS 1 publish must carry a packet identifier");
                handle.acknowledge_inbound_publish(pid);
                self.publish_upstream(handle, message);
            }
            QoS::ExactlyOnce => {
                let pid = packet_id.expect("QoS 2 publish must carry a packet identifier");
                handle.begin_inbound_publish(pid, message);
            }
        }
    }

    /// Inbound PUBREL completing a QoS 2 publish (spec.md §4.2
    /// `processPublishRelease`): releases the message stashed by
    /// [`Broker::process_publish`], queues `PublishComplete`, and fans the
    /// message out downstream through the same permission-checked path as
    /// any other client publish. An unknown or already-released `packet_id`
    /// is a protocol violation absorbed silently — no second fan-out.
    pub fn process_publish_release(&self, handle: &Arc<SessionHandle>, packet_id: PacketId) {
        if let Some(message) = handle.complete_inbound_release(packet_id) {
            self.publish_upstream(handle, message);
        }
    }

    /// Subscribe `handle`'s session to every `(filter, qos)` pair, checking
    /// `subscribePermissions` per filter. Registers permitted filters in both
    /// the session's own subscription set and the broker's subscription
    /// index, replays any matching retained messages, and emits a single
    /// `SubscribeAcknowledged` naming a grant (or denial) per filter in
    /// request order.
    pub fn subscribe(&self, handle: &Arc<SessionHandle>, packet_id: PacketId, filters: Vec<(TopicFilter, QoS)>) {
        let session_id = handle.id();
        let principal = handle.with_session(|s| s.principal.clone());

        let mut granted = Vec::with_capacity(filters.len());
        let mut replay: Vec<(Message, QoS)> = Vec::new();

        for (filter, qos) in filters {
            if !principal.subscribe_permissions.permits(filter.as_str()) {
                granted.push(None);
                continue;
            }
            granted.push(Some(qos));
            handle.with_session(|s| s.add_subscription(filter.clone(), qos));

            {
                let mut subscriptions = self.0.subscriptions.write();
                match subscriptions.get_mut(filter.as_str()) {
                    Some(subscribers) => {
                        subscribers.insert(session_id, qos);
                    }
                    None => {
                        subscriptions.insert(filter.as_str(), HashMap::from([(session_id, qos)]));
                    }
                }
            }

            self.0.retained.read().filter_matches(filter.as_str(), |message| {
                replay.push((message.clone(), qos));
            });
        }

        handle.enqueue_subscribe_acknowledged(packet_id, granted);
        for (message, qos) in replay {
            if handle.enqueue_message(message, qos).is_err() {
                handle.force_cancel();
            }
        }
    }

    /// Unsubscribe `handle`'s session from every named filter, removing it
    /// from both the session's own subscription set and the broker's
    /// subscription index, and emits `UnsubscribeAcknowledged`.
    pub fn unsubscribe(&self, handle: &Arc<SessionHandle>, packet_id: PacketId, filters: Vec<TopicFilter>) {
        let session_id = handle.id();
        if !filters.is_empty() {
            let mut subscriptions = self.0.subscriptions.write();
            for filter in &filters {
                handle.with_session(|s| {
                    s.remove_subscription(filter);
                });
                BrokerCore::unindex(&mut subscriptions, filter, session_id);
            }
        }
        handle.enqueue_unsubscribe_acknowledged(packet_id);
    }

    /// Remove every persistent session whose principal's
    /// `max_idle_session_ttl` has elapsed since disconnect. The core performs
    /// no timekeeping of its own: this is intended to be called by the
    /// network layer on its own periodic timer.
    pub fn reap_expired_sessions(&self) {
        let expired: Vec<SessionId> = self
            .0
            .sessions
            .iter()
            .filter(|entry| entry.value().with_session(|s| s.is_idle_expired()))
            .map(|entry| *entry.key())
            .collect();
        for session_id in expired {
            self.0.remove_session(session_id);
        }
    }

    pub fn session_count(&self) -> usize {
        self.0.sessions.len()
    }

    pub fn retained_count(&self) -> usize {
        let mut count = 0;
        self.0.retained.read().for_each(|_| count += 1);
        count
    }
}

/// RAII handle returned by [`Broker::with_session`]. Dropping it releases
/// ownership of the underlying session and — for a `cleanSession=true`
/// connection — deregisters the session and its subscriptions entirely.
/// A persistent session instead survives with its in-flight registers and
/// output queues intact, ready to be resumed by a later `with_session` call
/// for the same client identifier.
pub struct SessionLease {
    core: Arc<BrokerCore>,
    handle: Arc<SessionHandle>,
    session_id: SessionId,
    cancellation_token: Arc<Notify>,
    clean_session: bool,
}

impl SessionLease {
    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The token that fires when this lease's ownership is displaced by a
    /// reconnect under the same client identifier, or when the session is
    /// force-cancelled for a QoS 1/2 hard overflow. The network layer should
    /// `select!` on this alongside its read/write loop and tear the
    /// connection down when it fires.
    pub fn cancellation_token(&self) -> Arc<Notify> {
        self.cancellation_token.clone()
    }

    /// Convenience wrapper around `cancellation_token().notified()`.
    pub async fn cancelled(&self) {
        self.cancellation_token.notified().await;
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.handle.release_owner(&self.cancellation_token);
        if self.clean_session {
            self.core.remove_session(self.session_id);
        } else {
            self.handle.with_session(|s| s.mark_disconnected());
        }
    }
}

#[cfg(test)]
mod tests;
