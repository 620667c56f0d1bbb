use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::Instant;

/// Atomic compare-and-delete, used to release a lock only if we still hold it.
/// Must run as a single script: a GET followed by a DEL from the client would
/// race with an expiry and re-acquire in between.
const DEL_IF_EQ_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Error, Debug)]
pub enum CustomRedisError {
    #[error("Not found in redis")]
    NotFound,
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Timeout error")]
    Timeout,
    #[error("Redis error: {0}")]
    Redis(redis::RedisError),
}

impl From<redis::RedisError> for CustomRedisError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CustomRedisError::Timeout
        } else {
            CustomRedisError::Redis(err)
        }
    }
}

/// A single entry read from a stream: the store-assigned id plus the
/// field/value pairs the producer appended, in the order they were appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

/// The subset of Redis the pipeline needs: conditional keys for locks and
/// dedup markers, plus consumer-group stream operations.
#[async_trait]
pub trait Client {
    /// SET key value NX PX ttl, as one command. Returns true if the key was
    /// absent and has now been set.
    async fn set_nx_ex(
        &self,
        k: String,
        v: String,
        ttl: Duration,
    ) -> Result<bool, CustomRedisError>;

    async fn get(&self, k: String) -> Result<Option<String>, CustomRedisError>;

    async fn set_ex(&self, k: String, v: String, ttl: Duration) -> Result<(), CustomRedisError>;

    /// Delete `k` only if it currently holds `v`, atomically. Returns true if
    /// the key was deleted.
    async fn del_if_eq(&self, k: String, v: String) -> Result<bool, CustomRedisError>;

    /// XGROUP CREATE with MKSTREAM, starting at `$`. Creating a group that
    /// already exists is a no-op; only BUSYGROUP is swallowed.
    async fn ensure_group(&self, stream: String, group: String) -> Result<(), CustomRedisError>;

    /// XADD with an auto-generated id. Returns the id assigned by the store.
    async fn xadd(
        &self,
        stream: String,
        fields: Vec<(String, String)>,
    ) -> Result<String, CustomRedisError>;

    /// XREADGROUP on `>`: up to `count` entries not yet delivered to any
    /// consumer in the group, in stream order. Delivered entries move to the
    /// group's pending list for `consumer` until acknowledged.
    async fn read_group(
        &self,
        stream: String,
        group: String,
        consumer: String,
        count: usize,
    ) -> Result<Vec<StreamEntry>, CustomRedisError>;

    /// XACK. Returns the number of entries actually acknowledged (0 if the
    /// entry was not pending).
    async fn ack(
        &self,
        stream: String,
        group: String,
        id: String,
    ) -> Result<u64, CustomRedisError>;
}

pub struct RedisClient {
    connection: MultiplexedConnection,
}

impl RedisClient {
    pub async fn new(addr: String) -> Result<RedisClient, CustomRedisError> {
        let client = redis::Client::open(addr)?;
        let connection = client.get_multiplexed_tokio_connection().await?;

        Ok(RedisClient { connection })
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn set_nx_ex(
        &self,
        k: String,
        v: String,
        ttl: Duration,
    ) -> Result<bool, CustomRedisError> {
        let mut conn = self.connection.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(&k)
            .arg(&v)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    async fn get(&self, k: String) -> Result<Option<String>, CustomRedisError> {
        let mut conn = self.connection.clone();

        let value: Option<String> = conn.get(k).await?;

        Ok(value)
    }

    async fn set_ex(&self, k: String, v: String, ttl: Duration) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();

        let _: () = conn.set_ex(k, v, ttl.as_secs() as usize).await?;

        Ok(())
    }

    async fn del_if_eq(&self, k: String, v: String) -> Result<bool, CustomRedisError> {
        let mut conn = self.connection.clone();

        let deleted: i64 = redis::Script::new(DEL_IF_EQ_SCRIPT)
            .key(&k)
            .arg(&v)
            .invoke_async(&mut conn)
            .await?;

        Ok(deleted == 1)
    }

    async fn ensure_group(&self, stream: String, group: String) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();

        let created: Result<String, redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, "$").await;

        match created {
            Ok(_) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn xadd(
        &self,
        stream: String,
        fields: Vec<(String, String)>,
    ) -> Result<String, CustomRedisError> {
        let mut conn = self.connection.clone();

        let id: String = conn.xadd(stream, "*", &fields[..]).await?;

        Ok(id)
    }

    async fn read_group(
        &self,
        stream: String,
        group: String,
        consumer: String,
        count: usize,
    ) -> Result<Vec<StreamEntry>, CustomRedisError> {
        let mut conn = self.connection.clone();

        let opts = StreamReadOptions::default()
            .group(&group, &consumer)
            .count(count);
        let reply: StreamReadReply = conn
            .xread_options(&[stream.as_str()], &[">"], &opts)
            .await?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let mut fields = Vec::with_capacity(id.map.len());
                for (name, value) in id.map {
                    let value: String = redis::from_redis_value(&value)
                        .map_err(|err| CustomRedisError::ParseError(err.to_string()))?;
                    fields.push((name, value));
                }
                entries.push(StreamEntry { id: id.id, fields });
            }
        }

        Ok(entries)
    }

    async fn ack(
        &self,
        stream: String,
        group: String,
        id: String,
    ) -> Result<u64, CustomRedisError> {
        let mut conn = self.connection.clone();

        let acked: u64 = conn.xack(stream, group, &[id]).await?;

        Ok(acked)
    }
}

struct MockValue {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct MockStream {
    next_id: u64,
    entries: Vec<StreamEntry>,
    groups: HashMap<String, MockGroup>,
}

#[derive(Default)]
struct MockGroup {
    /// Index of the next undelivered entry, advanced by read_group.
    cursor: usize,
    /// (entry id, consumer name) for delivered-but-unacknowledged entries.
    pending: Vec<(String, String)>,
}

#[derive(Default)]
struct MockState {
    keys: HashMap<String, MockValue>,
    streams: HashMap<String, MockStream>,
}

/// A stateful in-memory stand-in for `RedisClient`, shared across the
/// workspace's tests. Key expiries follow the tokio clock, so tests can
/// exercise TTL behavior with a paused runtime.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    state: Arc<Mutex<MockState>>,
}

impl MockRedisClient {
    pub fn new() -> MockRedisClient {
        MockRedisClient::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn evict_expired(state: &mut MockState) {
        let now = Instant::now();
        state
            .keys
            .retain(|_, v| v.expires_at.map_or(true, |at| at > now));
    }

    /// Test-only view of a group's pending-entries list, as (entry id,
    /// consumer name) pairs. Lets tests assert at-least-once behavior for
    /// entries a consumer read but never acknowledged.
    pub fn pending(&self, stream: &str, group: &str) -> Vec<(String, String)> {
        let state = self.lock_state();
        state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn set_nx_ex(
        &self,
        k: String,
        v: String,
        ttl: Duration,
    ) -> Result<bool, CustomRedisError> {
        let mut state = self.lock_state();
        Self::evict_expired(&mut state);

        if state.keys.contains_key(&k) {
            return Ok(false);
        }
        state.keys.insert(
            k,
            MockValue {
                value: v,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, k: String) -> Result<Option<String>, CustomRedisError> {
        let mut state = self.lock_state();
        Self::evict_expired(&mut state);

        Ok(state.keys.get(&k).map(|v| v.value.clone()))
    }

    async fn set_ex(&self, k: String, v: String, ttl: Duration) -> Result<(), CustomRedisError> {
        let mut state = self.lock_state();
        state.keys.insert(
            k,
            MockValue {
                value: v,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del_if_eq(&self, k: String, v: String) -> Result<bool, CustomRedisError> {
        let mut state = self.lock_state();
        Self::evict_expired(&mut state);

        match state.keys.get(&k) {
            Some(current) if current.value == v => {
                state.keys.remove(&k);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ensure_group(&self, stream: String, group: String) -> Result<(), CustomRedisError> {
        let mut state = self.lock_state();
        let stream_state = state.streams.entry(stream).or_default();
        // `$`: a new group only sees entries appended after its creation.
        let cursor = stream_state.entries.len();
        stream_state
            .groups
            .entry(group)
            .or_insert_with(|| MockGroup {
                cursor,
                pending: Vec::new(),
            });
        Ok(())
    }

    async fn xadd(
        &self,
        stream: String,
        fields: Vec<(String, String)>,
    ) -> Result<String, CustomRedisError> {
        let mut state = self.lock_state();
        let stream_state = state.streams.entry(stream).or_default();
        stream_state.next_id += 1;
        let id = format!("{}-0", stream_state.next_id);
        stream_state.entries.push(StreamEntry {
            id: id.clone(),
            fields,
        });
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: String,
        group: String,
        consumer: String,
        count: usize,
    ) -> Result<Vec<StreamEntry>, CustomRedisError> {
        let mut state = self.lock_state();
        let stream_state = state
            .streams
            .get_mut(&stream)
            .ok_or(CustomRedisError::NotFound)?;
        let MockStream {
            ref entries,
            ref mut groups,
            ..
        } = *stream_state;
        let group_state = groups.get_mut(&group).ok_or(CustomRedisError::NotFound)?;

        let end = std::cmp::min(group_state.cursor + count, entries.len());
        let batch: Vec<StreamEntry> = entries[group_state.cursor..end].to_vec();
        group_state.cursor = end;
        for entry in &batch {
            group_state.pending.push((entry.id.clone(), consumer.clone()));
        }

        Ok(batch)
    }

    async fn ack(
        &self,
        stream: String,
        group: String,
        id: String,
    ) -> Result<u64, CustomRedisError> {
        let mut state = self.lock_state();
        let group_state = state
            .streams
            .get_mut(&stream)
            .and_then(|s| s.groups.get_mut(&group))
            .ok_or(CustomRedisError::NotFound)?;

        let before = group_state.pending.len();
        group_state.pending.retain(|(pending_id, _)| pending_id != &id);

        Ok((before - group_state.pending.len()) as u64)
    }
}
