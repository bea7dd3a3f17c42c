//! Redis Streams broker driver.
//!
//! Subjects map to stream keys. Publishing is `XADD` with approximate
//! `MAXLEN` trimming, grouped subscriptions read with `XREADGROUP` and
//! acknowledge with `XACK`. Ungrouped subscriptions get a private `NOACK`
//! group so every subscriber sees every entry; transient subjects (reply
//! inboxes) are deleted when their subscription goes away. Each subscription
//! reads on its own connection because blocking reads would stall the shared
//! multiplexed connection.
//!
//! Redis never redelivers on its own. Grouped manual-ack readers therefore
//! run an `XAUTOCLAIM` pass every `redelivery_idle`, taking over entries left
//! unacknowledged that long (rejected, failed, or owned by a dead session).
//! A `PING` task per session flips it to `Disconnected` when Redis goes away
//! while the session is idle.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamInfoConsumersReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, Cmd, ErrorKind, RedisError, Value};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    BackoffConfig, BrokerDriver, BrokerError, BrokerSession, Delivery, DeliveryHandler,
    ExponentialBackoff, SessionState, SubscribeOptions, SubscriptionId,
};

/// Stream entry field carrying the envelope bytes
const DATA_FIELD: &str = "data";

/// Entries fetched per `XREADGROUP` / `XAUTOCLAIM` call
const READ_BATCH: usize = 32;

/// Default `BLOCK` timeout for stream reads in milliseconds
const DEFAULT_BLOCK_MS: usize = 1_000;

/// Default approximate stream length cap
const DEFAULT_MAX_LEN: usize = 10_000;

const DEFAULT_REDELIVERY_IDLE: Duration = Duration::from_secs(30);

const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

/// `XAUTOCLAIM` cursor at the start of the pending list; returned again
/// once the scan wrapped around
const CLAIM_START: &str = "0-0";

/// Upper bound on pages walked by one claim pass
const MAX_CLAIM_PAGES: usize = 16;

/// Consumers idle for this many redelivery periods with nothing pending are
/// removed from their group
const STALE_CONSUMER_PERIODS: u32 = 10;

fn is_connection_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

/// Driver opening Redis Streams sessions
pub struct RedisStreamsDriver {
    client: Client,
    address: String,
    block_ms: usize,
    max_len: usize,
    redelivery_idle: Duration,
    ping_interval: Duration,
}

impl RedisStreamsDriver {
    pub fn new(url: &str) -> Result<Self, BrokerError> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            address: url.to_string(),
            block_ms: DEFAULT_BLOCK_MS,
            max_len: DEFAULT_MAX_LEN,
            redelivery_idle: DEFAULT_REDELIVERY_IDLE,
            ping_interval: DEFAULT_PING_INTERVAL,
        })
    }

    /// Override the blocking read timeout
    pub fn with_block_ms(mut self, block_ms: usize) -> Self {
        self.block_ms = block_ms.max(1);
        self
    }

    /// Approximate number of entries kept per stream
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len.max(1);
        self
    }

    /// Idle time after which unacknowledged entries are claimed and delivered again
    pub fn with_redelivery_idle(mut self, idle: Duration) -> Self {
        self.redelivery_idle = idle.max(Duration::from_millis(1));
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval.max(Duration::from_millis(1));
        self
    }
}

#[async_trait]
impl BrokerDriver for RedisStreamsDriver {
    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        let (state, _) = watch::channel(SessionState::Connected);

        let inner = Arc::new(SessionInner {
            client: self.client.clone(),
            conn,
            consumer_name: format!("pq-{}", Uuid::new_v4()),
            block_ms: self.block_ms,
            max_len: self.max_len,
            redelivery_idle: self.redelivery_idle,
            connected: AtomicBool::new(true),
            state,
            subscriptions: DashMap::new(),
            shutdown: CancellationToken::new(),
        });

        spawn_liveness(&inner, self.ping_interval);

        tracing::debug!(
            address = %self.address,
            consumer = %inner.consumer_name,
            "Redis streams session opened"
        );

        Ok(Arc::new(RedisStreamsSession { inner }))
    }
}

struct StreamSubscription {
    stream: String,
    group: String,
    private_group: bool,
    transient: bool,
    cancel: CancellationToken,
}

struct SessionInner {
    client: Client,
    conn: MultiplexedConnection,
    consumer_name: String,
    block_ms: usize,
    max_len: usize,
    redelivery_idle: Duration,
    connected: AtomicBool,
    state: watch::Sender<SessionState>,
    subscriptions: DashMap<SubscriptionId, StreamSubscription>,
    shutdown: CancellationToken,
}

impl SessionInner {
    fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            tracing::warn!(consumer = %self.consumer_name, "Redis streams session lost");
            self.state.send_replace(SessionState::Disconnected);
            self.shutdown.cancel();
        }
    }

    /// Convert a Redis error, flagging the session when the transport broke
    fn fail(&self, e: RedisError) -> BrokerError {
        if is_connection_error(&e) {
            self.mark_disconnected();
        }
        BrokerError::Redis(e)
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Ping the session's connection until Redis stops answering
fn spawn_liveness(inner: &Arc<SessionInner>, interval: Duration) {
    let session: Weak<SessionInner> = Arc::downgrade(inner);
    let cancel = inner.shutdown.clone();
    let conn = inner.conn.clone();

    tokio::spawn(async move {
        let ping = move || {
            let mut conn = conn.clone();
            async move {
                let _: String = redis::cmd("PING").query_async(&mut conn).await?;
                Ok::<(), RedisError>(())
            }
        };
        if !keep_alive(interval, cancel, ping).await {
            if let Some(inner) = session.upgrade() {
                inner.mark_disconnected();
            }
        }
    });
}

/// Run `ping` every `interval`.
///
/// Returns false once a ping fails at the transport level or takes longer
/// than `interval`, true when cancelled.
async fn keep_alive<P, Fut>(interval: Duration, cancel: CancellationToken, mut ping: P) -> bool
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Result<(), RedisError>>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return true,
            _ = ticker.tick() => {}
        }

        match tokio::time::timeout(interval, ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if is_connection_error(&e) => {
                tracing::warn!(error = %e, "Redis liveness ping failed");
                return false;
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Redis liveness ping returned an error");
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = interval.as_millis() as u64,
                    "Redis liveness ping timed out"
                );
                return false;
            }
        }
    }
}

/// `XADD key MAXLEN ~ max_len * data payload`
fn xadd_cmd(stream: &str, max_len: usize, payload: &[u8]) -> Cmd {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(stream)
        .arg("MAXLEN")
        .arg("~")
        .arg(max_len)
        .arg("*")
        .arg(DATA_FIELD)
        .arg(payload);
    cmd
}

/// `XAUTOCLAIM key group consumer min_idle start COUNT n`
fn xautoclaim_cmd(
    stream: &str,
    group: &str,
    consumer: &str,
    min_idle: Duration,
    start: &str,
) -> Cmd {
    let mut cmd = redis::cmd("XAUTOCLAIM");
    cmd.arg(stream)
        .arg(group)
        .arg(consumer)
        .arg(min_idle.as_millis() as u64)
        .arg(start)
        .arg("COUNT")
        .arg(READ_BATCH);
    cmd
}

/// Entry taken over by `XAUTOCLAIM`
#[derive(Debug, Clone, PartialEq)]
struct ClaimedEntry {
    id: String,
    /// `None` when the entry carries no data field
    data: Option<Bytes>,
}

/// One `XAUTOCLAIM` reply
#[derive(Debug, Clone, PartialEq)]
struct ClaimPage {
    next: String,
    entries: Vec<ClaimedEntry>,
}

fn unexpected_reply(detail: &'static str) -> RedisError {
    RedisError::from((ErrorKind::TypeError, "Unexpected XAUTOCLAIM reply", detail.to_string()))
}

fn is_data_field(name: &Value) -> bool {
    redis::from_redis_value::<String>(name).is_ok_and(|name| name == DATA_FIELD)
}

/// Parse `[next, [[id, [field, value, ..]] | nil, ..], (deleted ids)]`
fn parse_claim_page(value: &Value) -> Result<ClaimPage, RedisError> {
    let Value::Array(parts) = value else {
        return Err(unexpected_reply("reply is not an array"));
    };
    let [cursor, entries, ..] = parts.as_slice() else {
        return Err(unexpected_reply("reply has fewer than two elements"));
    };
    let next: String = redis::from_redis_value(cursor)?;
    let Value::Array(raw_entries) = entries else {
        return Err(unexpected_reply("entries are not an array"));
    };

    let mut claimed = Vec::with_capacity(raw_entries.len());
    for raw in raw_entries {
        // Entries deleted while pending come back as nil on older servers
        let Value::Array(pair) = raw else { continue };
        let [id, fields] = pair.as_slice() else {
            return Err(unexpected_reply("entry is not an id/fields pair"));
        };
        let id: String = redis::from_redis_value(id)?;
        let data = match fields {
            Value::Array(fields) => fields.chunks(2).find_map(|field| match field {
                [name, value] if is_data_field(name) => {
                    redis::from_redis_value::<Vec<u8>>(value).ok().map(Bytes::from)
                }
                _ => None,
            }),
            _ => None,
        };
        claimed.push(ClaimedEntry { id, data });
    }

    Ok(ClaimPage {
        next,
        entries: claimed,
    })
}

/// Walk the pending list from the start, handing every claimed entry to
/// `deliver`. Returns the number of entries claimed.
async fn drain_claims<F, FFut, D, DFut>(mut fetch: F, mut deliver: D) -> Result<usize, RedisError>
where
    F: FnMut(String) -> FFut,
    FFut: Future<Output = Result<ClaimPage, RedisError>>,
    D: FnMut(ClaimedEntry) -> DFut,
    DFut: Future<Output = ()>,
{
    let mut cursor = CLAIM_START.to_string();
    let mut claimed = 0;

    for _ in 0..MAX_CLAIM_PAGES {
        let page = fetch(cursor).await?;
        claimed += page.entries.len();
        for entry in page.entries {
            deliver(entry).await;
        }
        if page.next == CLAIM_START {
            break;
        }
        cursor = page.next;
    }

    Ok(claimed)
}

/// Whether a group member can be dropped: not ours, owns nothing, idle long enough
fn is_stale_consumer(
    name: &str,
    pending: usize,
    idle_ms: usize,
    own: &str,
    stale_after: Duration,
) -> bool {
    name != own && pending == 0 && idle_ms as u128 >= stale_after.as_millis()
}

/// One Redis Streams session
pub struct RedisStreamsSession {
    inner: Arc<SessionInner>,
}

impl RedisStreamsSession {
    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.inner.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BrokerError::Disconnected)
        }
    }
}

/// Read loop of a single subscription
struct StreamReader {
    inner: Arc<SessionInner>,
    reader: MultiplexedConnection,
    stream: String,
    group: String,
    delivered_group: Option<String>,
    manual_ack: bool,
    handler: DeliveryHandler,
    cancel: CancellationToken,
}

impl StreamReader {
    /// Only entries read through a named group with manual acks stay pending
    fn redelivers(&self) -> bool {
        self.manual_ack && self.delivered_group.is_some()
    }

    fn delivery(&self, token: String, data: Bytes) -> Delivery {
        Delivery {
            subject: self.stream.clone(),
            group: self.delivered_group.clone(),
            token,
            data,
        }
    }

    async fn run(mut self) {
        let mut options = StreamReadOptions::default()
            .group(&self.group, &self.inner.consumer_name)
            .count(READ_BATCH)
            .block(self.inner.block_ms);
        if !self.manual_ack {
            options = options.noack();
        }

        let mut backoff = ExponentialBackoff::with_config(BackoffConfig::default());
        let mut next_claim = Instant::now();

        loop {
            if self.redelivers() && Instant::now() >= next_claim {
                match self.redeliver().await {
                    Ok(()) => {}
                    Err(e) if is_connection_error(&e) => {
                        self.inner.mark_disconnected();
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, stream = %self.stream, "Redelivery pass failed");
                    }
                }
                next_claim = Instant::now() + self.inner.redelivery_idle;
            }

            let keys = [self.stream.as_str()];
            let read: Result<Option<StreamReadReply>, RedisError> = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = self.reader.xread_options(&keys, &[">"], &options) => read,
            };

            match read {
                Ok(reply) => {
                    backoff.reset();
                    let Some(reply) = reply else { continue };
                    for key in reply.keys {
                        for entry in key.ids {
                            let Some(data) = entry.get::<Vec<u8>>(DATA_FIELD) else {
                                tracing::warn!(
                                    stream = %self.stream,
                                    entry_id = %entry.id,
                                    "Stream entry without data field"
                                );
                                continue;
                            };
                            (self.handler)(self.delivery(entry.id, Bytes::from(data))).await;
                        }
                    }
                }
                Err(e) if is_connection_error(&e) => {
                    self.inner.mark_disconnected();
                    break;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        stream = %self.stream,
                        retry_in_ms = delay.as_millis() as u64,
                        "Stream read failed"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::debug!(stream = %self.stream, group = %self.group, "Stream read loop stopped");
    }

    /// Claim entries pending longer than `redelivery_idle` and hand them to
    /// the handler again, then drop group members that are gone for good
    async fn redeliver(&self) -> Result<(), RedisError> {
        let min_idle = self.inner.redelivery_idle;
        let conn = self.reader.clone();

        let fetch = |cursor: String| {
            let cmd = xautoclaim_cmd(
                &self.stream,
                &self.group,
                &self.inner.consumer_name,
                min_idle,
                &cursor,
            );
            let mut conn = conn.clone();
            async move {
                let reply: Value = cmd.query_async(&mut conn).await?;
                parse_claim_page(&reply)
            }
        };

        let deliver = |entry: ClaimedEntry| {
            let mut conn = conn.clone();
            async move {
                match entry.data {
                    Some(data) => {
                        tracing::debug!(
                            stream = %self.stream,
                            entry_id = %entry.id,
                            "Redelivering unacknowledged entry"
                        );
                        (self.handler)(self.delivery(entry.id, data)).await;
                    }
                    None => {
                        // Nothing to deliver; acknowledge so it is not claimed forever
                        tracing::warn!(
                            stream = %self.stream,
                            entry_id = %entry.id,
                            "Dropping pending entry without data field"
                        );
                        let acked: Result<i64, RedisError> =
                            conn.xack(&self.stream, &self.group, &[entry.id.as_str()]).await;
                        if let Err(e) = acked {
                            tracing::debug!(error = %e, "Failed to acknowledge empty entry");
                        }
                    }
                }
            }
        };

        let claimed = drain_claims(fetch, deliver).await?;
        if claimed > 0 {
            tracing::info!(
                stream = %self.stream,
                group = %self.group,
                claimed,
                "Claimed unacknowledged entries"
            );
        }

        self.prune_consumers().await
    }

    async fn prune_consumers(&self) -> Result<(), RedisError> {
        let stale_after = self.inner.redelivery_idle * STALE_CONSUMER_PERIODS;
        let mut conn = self.reader.clone();

        let info: StreamInfoConsumersReply = conn.xinfo_consumers(&self.stream, &self.group).await?;
        for consumer in info.consumers {
            if !is_stale_consumer(
                &consumer.name,
                consumer.pending,
                consumer.idle,
                &self.inner.consumer_name,
                stale_after,
            ) {
                continue;
            }
            let _: i64 = conn
                .xgroup_delconsumer(&self.stream, &self.group, &consumer.name)
                .await?;
            tracing::debug!(
                stream = %self.stream,
                group = %self.group,
                consumer = %consumer.name,
                "Removed stale stream consumer"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerSession for RedisStreamsSession {
    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    fn state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
        handler: DeliveryHandler,
    ) -> Result<SubscriptionId, BrokerError> {
        self.ensure_connected()?;

        let id = SubscriptionId::new();
        // Named groups start from the beginning of the stream so nothing
        // published before the first subscriber is lost; private groups only
        // see new entries.
        let (group, start, private_group) = match &options.group {
            Some(group) => (group.clone(), "0", false),
            None => (format!("ephemeral-{id}"), "$", true),
        };

        let mut conn = self.inner.conn.clone();
        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(subject, &group, start)
            .await
        {
            Ok(()) => {}
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(self.inner.fail(e)),
        }

        let reader = self
            .inner
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| self.inner.fail(e))?;

        let cancel = self.inner.shutdown.child_token();
        let stream_reader = StreamReader {
            inner: self.inner.clone(),
            reader,
            stream: subject.to_string(),
            group: group.clone(),
            delivered_group: options.group.clone(),
            manual_ack: options.manual_ack,
            handler,
            cancel: cancel.clone(),
        };
        tokio::spawn(stream_reader.run());

        self.inner.subscriptions.insert(
            id,
            StreamSubscription {
                stream: subject.to_string(),
                group,
                private_group,
                transient: options.transient,
                cancel,
            },
        );

        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BrokerError> {
        let Some((_, subscription)) = self.inner.subscriptions.remove(&id) else {
            return Err(BrokerError::SubscriptionNotFound(id));
        };
        subscription.cancel.cancel();

        if !self.is_connected() {
            return Ok(());
        }

        let mut conn = self.inner.conn.clone();
        if subscription.transient {
            // The key, its entries and its groups go together
            if let Err(e) = conn.del::<_, ()>(&subscription.stream).await {
                tracing::debug!(
                    error = %e,
                    stream = %subscription.stream,
                    "Failed to delete transient stream"
                );
            }
        } else if subscription.private_group {
            if let Err(e) = conn
                .xgroup_destroy::<_, _, ()>(&subscription.stream, &subscription.group)
                .await
            {
                tracing::debug!(
                    error = %e,
                    stream = %subscription.stream,
                    "Failed to destroy private stream group"
                );
            }
        }

        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.ensure_connected()?;

        let mut conn = self.inner.conn.clone();
        let _: String = xadd_cmd(subject, self.inner.max_len, payload.as_ref())
            .query_async(&mut conn)
            .await
            .map_err(|e| self.inner.fail(e))?;
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.ensure_connected()?;

        let Some(group) = &delivery.group else {
            return Ok(());
        };
        let mut conn = self.inner.conn.clone();
        conn.xack::<_, _, _, i64>(&delivery.subject, group, &[delivery.token.as_str()])
            .await
            .map_err(|e| self.inner.fail(e))?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.inner.shutdown.cancel();
        self.inner.subscriptions.clear();
        if self.inner.connected.swap(false, Ordering::AcqRel) {
            self.inner.state.send_replace(SessionState::Disconnected);
        }
        tracing::debug!(consumer = %self.inner.consumer_name, "Redis streams session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    fn entry(id: &str, fields: &[(&str, &str)]) -> Value {
        let fields = fields
            .iter()
            .flat_map(|(name, value)| [bulk(name), bulk(value)])
            .collect();
        Value::Array(vec![bulk(id), Value::Array(fields)])
    }

    fn io_error() -> RedisError {
        RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset",
        ))
    }

    fn claimed(id: &str) -> ClaimedEntry {
        ClaimedEntry {
            id: id.to_string(),
            data: Some(Bytes::from(format!("payload-{id}"))),
        }
    }

    #[test]
    fn test_driver_creation() {
        let driver = RedisStreamsDriver::new("redis://localhost:6379").unwrap();
        assert_eq!(driver.address(), "redis://localhost:6379");
        assert_eq!(driver.block_ms, DEFAULT_BLOCK_MS);
        assert_eq!(driver.max_len, DEFAULT_MAX_LEN);
        assert_eq!(driver.redelivery_idle, DEFAULT_REDELIVERY_IDLE);
        assert_eq!(driver.ping_interval, DEFAULT_PING_INTERVAL);
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(RedisStreamsDriver::new("not a url").is_err());
    }

    #[test]
    fn test_settings_have_floor() {
        let driver = RedisStreamsDriver::new("redis://localhost:6379")
            .unwrap()
            .with_block_ms(0)
            .with_max_len(0)
            .with_redelivery_idle(Duration::ZERO)
            .with_ping_interval(Duration::ZERO);
        assert_eq!(driver.block_ms, 1);
        assert_eq!(driver.max_len, 1);
        assert_eq!(driver.redelivery_idle, Duration::from_millis(1));
        assert_eq!(driver.ping_interval, Duration::from_millis(1));
    }

    #[test]
    fn test_publish_trims_stream() {
        let cmd = xadd_cmd("orders", 10_000, b"{}");
        assert_eq!(
            cmd.get_packed_command(),
            b"*8\r\n$4\r\nXADD\r\n$6\r\norders\r\n$6\r\nMAXLEN\r\n$1\r\n~\r\n$5\r\n10000\r\n$1\r\n*\r\n$4\r\ndata\r\n$2\r\n{}\r\n"
                .to_vec()
        );
    }

    #[test]
    fn test_claim_command() {
        let cmd = xautoclaim_cmd("jobs", "g", "pq-1", Duration::from_millis(1500), CLAIM_START);
        assert_eq!(
            cmd.get_packed_command(),
            b"*8\r\n$10\r\nXAUTOCLAIM\r\n$4\r\njobs\r\n$1\r\ng\r\n$4\r\npq-1\r\n$4\r\n1500\r\n$3\r\n0-0\r\n$5\r\nCOUNT\r\n$2\r\n32\r\n"
                .to_vec()
        );
    }

    #[test]
    fn test_parse_claim_page() {
        let reply = Value::Array(vec![
            bulk("1700000000000-3"),
            Value::Array(vec![
                entry("1700000000000-1", &[("data", "{\"a\":1}")]),
                Value::Nil,
                entry("1700000000000-2", &[("other", "x")]),
            ]),
            // Redis 7 also lists ids deleted while pending
            Value::Array(vec![bulk("1700000000000-0")]),
        ]);

        let page = parse_claim_page(&reply).unwrap();
        assert_eq!(page.next, "1700000000000-3");
        assert_eq!(
            page.entries,
            vec![
                ClaimedEntry {
                    id: "1700000000000-1".to_string(),
                    data: Some(Bytes::from_static(b"{\"a\":1}")),
                },
                ClaimedEntry {
                    id: "1700000000000-2".to_string(),
                    data: None,
                },
            ]
        );
    }

    #[test]
    fn test_parse_claim_page_rejects_garbage() {
        assert!(parse_claim_page(&Value::Nil).is_err());
        assert!(parse_claim_page(&Value::Array(vec![bulk("0-0")])).is_err());
        assert!(parse_claim_page(&Value::Array(vec![bulk("0-0"), Value::Int(1)])).is_err());

        let empty =
            parse_claim_page(&Value::Array(vec![bulk("0-0"), Value::Array(vec![])])).unwrap();
        assert_eq!(empty.next, CLAIM_START);
        assert!(empty.entries.is_empty());
    }

    #[tokio::test]
    async fn test_drain_claims_walks_every_page() {
        let cursors = Mutex::new(Vec::new());
        let delivered = Mutex::new(Vec::new());
        let mut pages = vec![
            ClaimPage {
                next: "5-0".to_string(),
                entries: vec![claimed("1-0"), claimed("2-0")],
            },
            ClaimPage {
                next: CLAIM_START.to_string(),
                entries: vec![claimed("6-0")],
            },
        ]
        .into_iter();

        let claimed_count = drain_claims(
            |cursor| {
                cursors.lock().unwrap().push(cursor);
                let page = pages.next();
                async move { page.ok_or_else(io_error) }
            },
            |entry| {
                delivered.lock().unwrap().push(entry.id);
                async {}
            },
        )
        .await
        .unwrap();

        assert_eq!(claimed_count, 3);
        assert_eq!(*cursors.lock().unwrap(), vec!["0-0", "5-0"]);
        assert_eq!(*delivered.lock().unwrap(), vec!["1-0", "2-0", "6-0"]);
    }

    #[tokio::test]
    async fn test_drain_claims_is_bounded() {
        let fetches = AtomicUsize::new(0);
        let claimed_count = drain_claims(
            |_cursor| {
                fetches.fetch_add(1, Ordering::SeqCst);
                async {
                    Ok(ClaimPage {
                        next: "9-0".to_string(),
                        entries: vec![claimed("9-0")],
                    })
                }
            },
            |_entry| async {},
        )
        .await
        .unwrap();

        assert_eq!(fetches.load(Ordering::SeqCst), MAX_CLAIM_PAGES);
        assert_eq!(claimed_count, MAX_CLAIM_PAGES);
    }

    #[tokio::test]
    async fn test_drain_claims_stops_on_error() {
        let delivered = AtomicUsize::new(0);
        let result = drain_claims(
            |_cursor| async { Err::<ClaimPage, _>(io_error()) },
            |_entry| {
                delivered.fetch_add(1, Ordering::SeqCst);
                async {}
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stale_consumer_detection() {
        let stale_after = Duration::from_secs(300);
        assert!(is_stale_consumer("pq-old", 0, 300_000, "pq-me", stale_after));
        // Pending entries are claimed first, the member stays until empty
        assert!(!is_stale_consumer("pq-old", 2, 900_000, "pq-me", stale_after));
        assert!(!is_stale_consumer("pq-old", 0, 1_000, "pq-me", stale_after));
        assert!(!is_stale_consumer("pq-me", 0, 900_000, "pq-me", stale_after));
    }

    #[tokio::test]
    async fn test_keep_alive_reports_lost_transport() {
        let pings = AtomicUsize::new(0);
        let alive = keep_alive(Duration::from_millis(10), CancellationToken::new(), || {
            let n = pings.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Ok(())
                } else {
                    Err(io_error())
                }
            }
        })
        .await;

        assert!(!alive);
        assert_eq!(pings.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_keep_alive_ignores_command_errors() {
        let pings = AtomicUsize::new(0);
        let alive = keep_alive(Duration::from_millis(10), CancellationToken::new(), || {
            let n = pings.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(RedisError::from((ErrorKind::ResponseError, "busy")))
                } else {
                    Err(io_error())
                }
            }
        })
        .await;

        assert!(!alive);
        assert_eq!(pings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_keep_alive_treats_slow_ping_as_lost() {
        let alive = keep_alive(Duration::from_millis(20), CancellationToken::new(), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(!alive);
    }

    #[tokio::test]
    async fn test_keep_alive_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let pings = Arc::new(AtomicUsize::new(0));
        let task = {
            let cancel = cancel.clone();
            let pings = pings.clone();
            tokio::spawn(async move {
                keep_alive(Duration::from_millis(10), cancel, move || {
                    pings.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();

        let alive = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(alive);
        assert!(pings.load(Ordering::SeqCst) >= 2);
    }
}
