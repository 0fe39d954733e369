//! Delivery guarantees of each tier, exercised through the `Broker` trait.

use std::sync::Arc;
use std::time::Duration;

use refsync_broker::{Broker, MemoryBroker, Tier};
use refsync_core::config::BrokerConfig;

async fn next_body(sub: &mut refsync_broker::Subscription) -> Option<Vec<u8>> {
    tokio::time::timeout(Duration::from_millis(200), sub.next())
        .await
        .ok()
        .flatten()
        .map(|d| d.body.as_ref().clone())
}

#[tokio::test]
async fn durable_offline_group_catches_up_in_order() {
    let broker = MemoryBroker::durable(&BrokerConfig::default());
    broker.register_group("contacts");

    for n in 0..5u8 {
        broker.append_bytes("M1", vec![n]).await.expect("append");
    }

    let mut sub = broker.subscribe("contacts", "k1").await.expect("subscribe");
    let mut seen = Vec::new();
    while let Some(body) = next_body(&mut sub).await {
        seen.push(body[0]);
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn best_effort_publish_without_subscribers_is_lost() {
    let broker = MemoryBroker::best_effort();
    assert_eq!(broker.tier(), Tier::BestEffort);

    broker
        .append_bytes("M1", b"while offline".to_vec())
        .await
        .expect("append succeeds even with nobody listening");

    let mut late = broker.subscribe("calendar", "c1").await.expect("subscribe");
    assert!(
        next_body(&mut late).await.is_none(),
        "a subscriber that was offline at publish time must not receive it"
    );

    broker.append_bytes("M1", b"online".to_vec()).await.unwrap();
    assert_eq!(next_body(&mut late).await.as_deref(), Some(&b"online"[..]));
}

#[tokio::test]
async fn unacked_message_is_claimable_after_member_crash() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::durable(&BrokerConfig::default()));
    let id = broker.append_bytes("M1", b"x".to_vec()).await.unwrap();

    {
        let mut crashed = broker.subscribe("calendar", "c1").await.unwrap();
        let delivery = crashed.next().await.expect("delivery");
        assert_eq!(delivery.message_id, id);
        // dropped without ack
    }

    let pending = broker.pending("calendar", Duration::ZERO).await.unwrap();
    assert_eq!(pending, vec![id.clone()]);

    let claimed = broker
        .claim("calendar", "c2", Duration::ZERO, &pending)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].delivery_count, 2);

    broker.ack("calendar", &id).await.unwrap();
    assert!(broker
        .pending("calendar", Duration::ZERO)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(broker.lag("calendar").await.unwrap().pending, 0);
}

#[tokio::test]
async fn acked_message_is_not_redelivered_to_group() {
    let broker = MemoryBroker::durable(&BrokerConfig::default());
    let mut sub = broker.subscribe("calendar", "c1").await.unwrap();
    broker.append_bytes("M1", b"once".to_vec()).await.unwrap();

    let delivery = sub.next().await.expect("delivery");
    broker.ack("calendar", &delivery.message_id).await.unwrap();

    let mut again = broker.subscribe("calendar", "c1").await.unwrap();
    assert!(next_body(&mut again).await.is_none());
    assert!(broker
        .claim("calendar", "c1", Duration::ZERO, &[delivery.message_id])
        .await
        .unwrap()
        .is_empty());
}
