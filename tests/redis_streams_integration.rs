//! Redis Streams driver tests against a live server.
//!
//! Ignored by default; run with `REDIS_URL=redis://... cargo test -- --ignored`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use redis::AsyncCommands;
use uuid::Uuid;

use ara_persistent_queue::broker::{
    BrokerDriver, BrokerSession, Delivery, DeliveryHandler, RedisStreamsDriver, SubscribeOptions,
};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn raw_connection() -> redis::aio::MultiplexedConnection {
    redis::Client::open(redis_url())
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .unwrap()
}

fn recording_handler(seen: &Arc<Mutex<Vec<Delivery>>>) -> DeliveryHandler {
    let seen = seen.clone();
    Arc::new(move |delivery: Delivery| {
        seen.lock().unwrap().push(delivery);
        async {}.boxed()
    })
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn test_transient_subject_removed_on_unsubscribe() {
    let driver = RedisStreamsDriver::new(&redis_url()).unwrap();
    let session = driver.connect().await.unwrap();
    let subject = format!("_INBOX.{}", Uuid::new_v4());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let id = session
        .subscribe(&subject, SubscribeOptions::ephemeral(), recording_handler(&seen))
        .await
        .unwrap();
    session
        .publish(&subject, Bytes::from_static(b"reply"))
        .await
        .unwrap();
    assert!(eventually(|| seen.lock().unwrap().len() == 1).await);

    session.unsubscribe(id).await.unwrap();

    let mut conn = raw_connection().await;
    let exists: bool = conn.exists(&subject).await.unwrap();
    assert!(!exists);

    session.disconnect().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn test_unacked_entry_redelivered_after_idle() {
    let driver = RedisStreamsDriver::new(&redis_url())
        .unwrap()
        .with_block_ms(100)
        .with_redelivery_idle(Duration::from_millis(300));
    let session = driver.connect().await.unwrap();
    let subject = format!("pq-test.jobs.{}", Uuid::new_v4());

    let seen = Arc::new(Mutex::new(Vec::new()));
    session
        .subscribe(
            &subject,
            SubscribeOptions::group("workers", true),
            recording_handler(&seen),
        )
        .await
        .unwrap();
    session
        .publish(&subject, Bytes::from_static(b"job"))
        .await
        .unwrap();

    // First delivery is left unacknowledged, as a failed callback would
    assert!(eventually(|| !seen.lock().unwrap().is_empty()).await);
    assert!(eventually(|| seen.lock().unwrap().len() >= 2).await);

    let (first, second) = {
        let seen = seen.lock().unwrap();
        (seen[0].clone(), seen[1].clone())
    };
    assert_eq!(first.token, second.token);
    assert_eq!(second.data, Bytes::from_static(b"job"));

    session.ack(&second).await.unwrap();
    let mut conn = raw_connection().await;
    let pending: redis::streams::StreamPendingReply =
        conn.xpending(&subject, "workers").await.unwrap();
    assert_eq!(pending.count(), 0);

    session.disconnect().await.unwrap();
    let _: () = conn.del(&subject).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn test_entries_from_lost_session_claimed_by_new_one() {
    let driver = RedisStreamsDriver::new(&redis_url())
        .unwrap()
        .with_block_ms(100)
        .with_redelivery_idle(Duration::from_millis(300));
    let subject = format!("pq-test.orders.{}", Uuid::new_v4());

    let lost = driver.connect().await.unwrap();
    let first_seen = Arc::new(Mutex::new(Vec::new()));
    lost.subscribe(
        &subject,
        SubscribeOptions::group("workers", true),
        recording_handler(&first_seen),
    )
    .await
    .unwrap();
    lost.publish(&subject, Bytes::from_static(b"order"))
        .await
        .unwrap();
    assert!(eventually(|| first_seen.lock().unwrap().len() == 1).await);
    lost.disconnect().await.unwrap();

    let replacement = driver.connect().await.unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    replacement
        .subscribe(
            &subject,
            SubscribeOptions::group("workers", true),
            recording_handler(&seen),
        )
        .await
        .unwrap();

    assert!(eventually(|| !seen.lock().unwrap().is_empty()).await);
    let redelivered = seen.lock().unwrap()[0].clone();
    assert_eq!(redelivered.token, first_seen.lock().unwrap()[0].token);

    replacement.ack(&redelivered).await.unwrap();
    replacement.disconnect().await.unwrap();
    let mut conn = raw_connection().await;
    let _: () = conn.del(&subject).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn test_publish_caps_stream_length() {
    let driver = RedisStreamsDriver::new(&redis_url())
        .unwrap()
        .with_max_len(10);
    let session = driver.connect().await.unwrap();
    let subject = format!("pq-test.trim.{}", Uuid::new_v4());

    for _ in 0..1_000 {
        session
            .publish(&subject, Bytes::from_static(b"x"))
            .await
            .unwrap();
    }

    let mut conn = raw_connection().await;
    let len: usize = conn.xlen(&subject).await.unwrap();
    // Approximate trimming drops whole radix tree nodes
    assert!(len < 1_000);

    session.disconnect().await.unwrap();
    let _: () = conn.del(&subject).await.unwrap();
}
