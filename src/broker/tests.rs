use super::*;
use crate::message::TopicName;
use crate::principal::{AuthError, Principal, PrincipalId};
use crate::protocol::ServerPacket;
use crate::quota::Quota;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

enum Mode {
    Fail,
    Deny,
    Allow,
}

struct TestAuthenticator {
    mode: Mode,
    quota: Quota,
}

#[async_trait]
impl Authenticator for TestAuthenticator {
    async fn authenticate(
        &self,
        _request: &ConnectionRequest,
    ) -> Result<Option<PrincipalId>, AuthError> {
        match self.mode {
            Mode::Fail => Err(AuthError("identity service unreachable".into())),
            Mode::Deny => Ok(None),
            Mode::Allow => Ok(Some(PrincipalId::new("p1"))),
        }
    }

    async fn get_principal(&self, _id: &PrincipalId) -> Option<Arc<Principal>> {
        Some(Arc::new(Principal::new(None, self.quota)))
    }
}

fn broker(mode: Mode, quota: Quota) -> Broker {
    Broker::new(Arc::new(TestAuthenticator { mode, quota }))
}

fn message(topic: &str, qos: QoS, retain: bool, payload: &'static [u8]) -> Message {
    Message::new(TopicName::parse(topic).unwrap(), qos, retain, Bytes::from_static(payload))
}

#[tokio::test]
async fn auth_failure_surfaces_server_unavailable() {
    let broker = broker(Mode::Fail, Quota::default());
    let err = broker
        .with_session(ConnectionRequest::new("client-1", true))
        .await
        .unwrap_err();
    assert_eq!(err, RejectReason::ServerUnavailable);
}

#[tokio::test]
async fn auth_denial_surfaces_not_authorized() {
    let broker = broker(Mode::Deny, Quota::default());
    let err = broker
        .with_session(ConnectionRequest::new("client-1", true))
        .await
        .unwrap_err();
    assert_eq!(err, RejectReason::NotAuthorized);
}

#[tokio::test]
async fn two_subscribers_one_publish() {
    let broker = broker(Mode::Allow, Quota::default());

    let (lease1, present1) = broker
        .with_session(ConnectionRequest::new("client-1", true))
        .await
        .unwrap();
    let (lease2, present2) = broker
        .with_session(ConnectionRequest::new("client-2", true))
        .await
        .unwrap();
    assert!(!present1 && !present2);

    broker.subscribe(lease1.handle(), 42, vec![(TopicFilter::parse("a/b").unwrap(), QoS::AtMostOnce)]);
    broker.subscribe(lease2.handle(), 47, vec![(TopicFilter::parse("a/b").unwrap(), QoS::AtMostOnce)]);

    broker.publish_downstream(message("a/b", QoS::AtMostOnce, false, b""));

    for (lease, pid) in [(&lease1, 42u16), (&lease2, 47u16)] {
        let out = lease.handle().dequeue().await;
        assert_eq!(out.len(), 2);
        assert!(matches!(
            &out[0],
            ServerPacket::SubscribeAcknowledged { packet_id, granted }
                if *packet_id == pid && granted == &vec![Some(QoS::AtMostOnce)]
        ));
        assert!(matches!(
            &out[1],
            ServerPacket::Publish { packet_id: None, duplicate: false, .. }
        ));
    }
}

#[tokio::test]
async fn retained_latest_wins() {
    let broker = broker(Mode::Allow, Quota::default());
    broker.publish_downstream(message("topic", QoS::AtMostOnce, true, b"test"));
    broker.publish_downstream(message("topic", QoS::AtMostOnce, true, b"toast"));

    let (lease, _) = broker
        .with_session(ConnectionRequest::new("client-1", true))
        .await
        .unwrap();
    broker.subscribe(lease.handle(), 1, vec![(TopicFilter::parse("topic").unwrap(), QoS::AtMostOnce)]);

    let out = lease.handle().dequeue().await;
    assert_eq!(out.len(), 2);
    match &out[1] {
        ServerPacket::Publish { message, .. } => assert_eq!(message.payload, Bytes::from_static(b"toast")),
        other => panic!("expected a publish, got {other:?}"),
    }
}

#[tokio::test]
async fn retained_delete_leaves_only_the_subscribe_ack() {
    let broker = broker(Mode::Allow, Quota::default());
    broker.publish_downstream(message("topic", QoS::AtMostOnce, true, b"test"));
    broker.publish_downstream(message("topic", QoS::AtMostOnce, true, b""));

    let (lease, _) = broker
        .with_session(ConnectionRequest::new("client-1", true))
        .await
        .unwrap();
    broker.subscribe(lease.handle(), 1, vec![(TopicFilter::parse("topic").unwrap(), QoS::AtMostOnce)]);

    let out = lease.handle().dequeue().await;
    assert_eq!(out.len(), 1);
    assert!(matches!(out[0], ServerPacket::SubscribeAcknowledged { .. }));
}

#[tokio::test]
async fn qos0_barrel_shift_drops_oldest() {
    let quota = Quota { max_queue_size_qos0: 10, ..Quota::default() };
    let broker = broker(Mode::Allow, quota);
    let (lease, _) = broker
        .with_session(ConnectionRequest::new("client-1", true))
        .await
        .unwrap();
    broker.subscribe(lease.handle(), 1, vec![(TopicFilter::parse("topic").unwrap(), QoS::AtMostOnce)]);
    lease.handle().dequeue().await;

    for _ in 0..10 {
        broker.publish_downstream(message("topic", QoS::AtMostOnce, false, b"m"));
    }
    assert_eq!(lease.handle().dequeue().await.len(), 10);

    for _ in 0..11 {
        broker.publish_downstream(message("topic", QoS::AtMostOnce, false, b"m"));
    }
    assert_eq!(lease.handle().dequeue().await.len(), 10);
}

#[tokio::test]
async fn qos1_hard_overflow_cancels_the_session() {
    let quota = Quota { max_queue_size_qos1: 10, ..Quota::default() };
    let broker = broker(Mode::Allow, quota);
    let (lease, _) = broker
        .with_session(ConnectionRequest::new("client-1", false))
        .await
        .unwrap();
    broker.subscribe(lease.handle(), 1, vec![(TopicFilter::parse("topic").unwrap(), QoS::AtLeastOnce)]);
    lease.handle().dequeue().await;

    let cancel_watcher = {
        let token = lease.cancellation_token();
        tokio::spawn(async move { token.notified().await })
    };
    tokio::task::yield_now().await;

    for _ in 0..11 {
        broker.publish_downstream(message("topic", QoS::AtLeastOnce, false, b"m"));
    }

    tokio::time::timeout(Duration::from_millis(200), cancel_watcher)
        .await
        .expect("cancellation token should fire on hard overflow")
        .unwrap();
}

#[tokio::test]
async fn qos2_reconnect_replay_ladder() {
    let broker = broker(Mode::Allow, Quota::default());
    let (lease1, present1) = broker
        .with_session(ConnectionRequest::new("client-1", false))
        .await
        .unwrap();
    assert!(!present1);
    let session_id = lease1.session_id();

    lease1
        .handle()
        .enqueue_message(message("a", QoS::ExactlyOnce, false, b"m"), QoS::ExactlyOnce)
        .unwrap();
    let out = lease1.handle().dequeue().await;
    assert_eq!(out.len(), 1);
    let pid = match out[0] {
        ServerPacket::Publish { packet_id: Some(pid), duplicate: false, .. } => pid,
        _ => panic!("expected a fresh publish"),
    };
    assert_eq!(pid, 0);

    drop(lease1);

    let (lease2, present2) = broker
        .with_session(ConnectionRequest::new("client-1", false))
        .await
        .unwrap();
    assert!(present2);
    assert_eq!(lease2.session_id(), session_id);

    let out = lease2.handle().dequeue().await;
    assert_eq!(out.len(), 1);
    assert!(matches!(
        out[0],
        ServerPacket::Publish { packet_id: Some(0), duplicate: true, .. }
    ));

    lease2.handle().handle_pubrec(pid);
    let out = lease2.handle().dequeue().await;
    assert_eq!(out.len(), 1);
    assert!(matches!(out[0], ServerPacket::PublishRelease(0)));

    drop(lease2);

    let (lease3, present3) = broker
        .with_session(ConnectionRequest::new("client-1", false))
        .await
        .unwrap();
    assert!(present3);

    let out = lease3.handle().dequeue().await;
    assert_eq!(out.len(), 1);
    assert!(matches!(out[0], ServerPacket::PublishRelease(0)));

    lease3.handle().handle_pubcomp(pid);
    assert!(!lease3.handle().with_session(|s| s.has_pending_output()));
}

#[tokio::test]
async fn clean_session_is_discarded_on_drop() {
    let broker = broker(Mode::Allow, Quota::default());
    let (lease, _) = broker
        .with_session(ConnectionRequest::new("client-1", true))
        .await
        .unwrap();
    assert_eq!(broker.session_count(), 1);
    drop(lease);
    assert_eq!(broker.session_count(), 0);
}

#[tokio::test]
async fn publish_permission_denial_drops_the_message_silently() {
    let broker = broker(Mode::Allow, Quota::default());
    let (publisher, _) = broker
        .with_session(ConnectionRequest::new("publisher", true))
        .await
        .unwrap();
    publisher.handle().with_session(|s| {
        s.principal = Arc::new({
            let mut p = Principal::new(None, Quota::default());
            p.publish_permissions = crate::principal::TopicFilterSet::deny_all();
            p
        });
    });

    let (subscriber, _) = broker
        .with_session(ConnectionRequest::new("subscriber", true))
        .await
        .unwrap();
    broker.subscribe(subscriber.handle(), 1, vec![(TopicFilter::parse("topic").unwrap(), QoS::AtMostOnce)]);
    subscriber.handle().dequeue().await;

    broker.publish_upstream(publisher.handle(), message("topic", QoS::AtMostOnce, false, b"denied"));

    assert!(!subscriber.handle().with_session(|s| s.has_pending_output()));
}

#[tokio::test]
async fn inbound_qos1_publish_acknowledges_and_fans_out_immediately() {
    let broker = broker(Mode::Allow, Quota::default());
    let (publisher, _) = broker
        .with_session(ConnectionRequest::new("publisher", true))
        .await
        .unwrap();
    let (subscriber, _) = broker
        .with_session(ConnectionRequest::new("subscriber", true))
        .await
        .unwrap();
    broker.subscribe(subscriber.handle(), 1, vec![(TopicFilter::parse("topic").unwrap(), QoS::AtLeastOnce)]);
    subscriber.handle().dequeue().await;

    broker.process_publish(publisher.handle(), Some(9), message("topic", QoS::AtLeastOnce, false, b"hi"));

    let out = publisher.handle().dequeue().await;
    assert_eq!(out, vec![ServerPacket::PublishAcknowledged(9)]);

    let out = subscriber.handle().dequeue().await;
    assert_eq!(out.len(), 1);
    assert!(matches!(out[0], ServerPacket::Publish { packet_id: Some(_), duplicate: false, .. }));
}

#[tokio::test]
async fn inbound_qos2_publish_defers_fan_out_until_release() {
    let broker = broker(Mode::Allow, Quota::default());
    let (publisher, _) = broker
        .with_session(ConnectionRequest::new("publisher", true))
        .await
        .unwrap();
    let (subscriber, _) = broker
        .with_session(ConnectionRequest::new("subscriber", true))
        .await
        .unwrap();
    broker.subscribe(subscriber.handle(), 1, vec![(TopicFilter::parse("topic").unwrap(), QoS::ExactlyOnce)]);
    subscriber.handle().dequeue().await;

    broker.process_publish(publisher.handle(), Some(3), message("topic", QoS::ExactlyOnce, false, b"hi"));
    let out = publisher.handle().dequeue().await;
    assert_eq!(out, vec![ServerPacket::PublishReceived(3)]);
    assert!(
        !subscriber.handle().with_session(|s| s.has_pending_output()),
        "fan-out must wait for the release, not the initial receive"
    );

    // A retransmitted duplicate PUBLISH re-acks but must not be fanned out.
    broker.process_publish(publisher.handle(), Some(3), message("topic", QoS::ExactlyOnce, false, b"hi"));
    let out = publisher.handle().dequeue().await;
    assert_eq!(out, vec![ServerPacket::PublishReceived(3)]);
    assert!(!subscriber.handle().with_session(|s| s.has_pending_output()));

    broker.process_publish_release(publisher.handle(), 3);
    let out = publisher.handle().dequeue().await;
    assert_eq!(out, vec![ServerPacket::PublishComplete(3)]);

    let out = subscriber.handle().dequeue().await;
    assert_eq!(out.len(), 1);
    assert!(matches!(out[0], ServerPacket::Publish { .. }));

    // A duplicate PUBREL (already released) must not fan out a second time.
    broker.process_publish_release(publisher.handle(), 3);
    let out = publisher.handle().dequeue().await;
    assert_eq!(out, vec![ServerPacket::PublishComplete(3)]);
    assert!(!subscriber.handle().with_session(|s| s.has_pending_output()));
}
