//! Redis-backed live state shared by every server process.
//!
//! Each duel is a hash `{prefix}{duel_id}` with `version` and `state` fields.
//! Writes run as Lua scripts so the version check, the write, the TTL refresh
//! and the update notification happen atomically on the server. `WATCH`/`MULTI`
//! is not usable here because the connection manager multiplexes commands.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{CacheError, CasOutcome, DuelStateCache, DuelUpdate, UPDATE_FEED_CAPACITY};
use crate::engine::duel::{DuelId, LiveDuelState, StateVersion};
use crate::tokio_tools::spawn_named_task;

const LOG_TARGET: &str = "cache::redis";

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

const INSERT_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], 'version', ARGV[1], 'state', ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
redis.call('PUBLISH', KEYS[2], ARGV[4])
return 1
";

// -1: missing, -2: committed, otherwise the current version
const CAS_SCRIPT: &str = r"
local current = redis.call('HGET', KEYS[1], 'version')
if not current then
  return -1
end
if tonumber(current) ~= tonumber(ARGV[1]) then
  return tonumber(current)
end
redis.call('HSET', KEYS[1], 'version', ARGV[2], 'state', ARGV[3])
redis.call('PEXPIRE', KEYS[1], ARGV[4])
redis.call('PUBLISH', KEYS[2], ARGV[5])
return -2
";

const CAS_MISSING: i64 = -1;
const CAS_COMMITTED: i64 = -2;

/// Client plus a lazily opened connection manager, reopened after IO errors.
pub(crate) struct RedisConnector {
    client: redis::Client,
    connection: Mutex<Option<redis::aio::ConnectionManager>>,
}

impl RedisConnector {
    pub(crate) fn open(url: &str) -> Result<Self, CacheError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            connection: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<redis::aio::ConnectionManager, CacheError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_connection_manager().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_connection(&self) {
        *self.connection.lock().await = None;
    }

    pub(crate) async fn run<T, F, Fut>(&self, op: F) -> Result<T, CacheError>
    where
        F: FnOnce(redis::aio::ConnectionManager) -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let conn = self.connection().await?;
        let result = op(conn).await;
        if let Err(CacheError::Redis(err)) = &result {
            if err.is_io_error() || err.is_connection_dropped() {
                warn!(target = LOG_TARGET, error = %err, "redis connection lost");
                self.reset_connection().await;
            }
        }
        result
    }

    /// Forwards JSON messages from `channel` into `feed` until `cancel` fires,
    /// resubscribing after failures.
    pub(crate) fn spawn_listener<T>(
        self: &Arc<Self>,
        name: &str,
        channel: String,
        feed: broadcast::Sender<T>,
        cancel: CancellationToken,
    ) -> JoinHandle<()>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let connector = Arc::clone(self);
        spawn_named_task(name, async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = connector.pump(&channel, &feed) => {
                        if let Err(err) = result {
                            warn!(target = LOG_TARGET, channel = %channel, error = %err, "subscription failed");
                        }
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => {}
                }
            }
            debug!(target = LOG_TARGET, channel = %channel, "listener stopped");
        })
    }

    async fn pump<T: DeserializeOwned>(
        &self,
        channel: &str,
        feed: &broadcast::Sender<T>,
    ) -> Result<(), CacheError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        debug!(target = LOG_TARGET, channel, "subscribed");
        let mut messages = pubsub.on_message();
        while let Some(msg) = messages.next().await {
            let payload: String = msg.get_payload()?;
            match serde_json::from_str::<T>(&payload) {
                Ok(message) => {
                    let _ = feed.send(message);
                }
                Err(err) => {
                    warn!(target = LOG_TARGET, channel, error = %err, "discarding malformed message");
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

pub struct RedisDuelCache {
    connector: Arc<RedisConnector>,
    prefix: String,
    channel: String,
    ttl: Duration,
    updates: broadcast::Sender<DuelUpdate>,
    insert_script: redis::Script,
    cas_script: redis::Script,
}

impl RedisDuelCache {
    pub fn new(url: &str, prefix: impl Into<String>, ttl: Duration) -> Result<Self, CacheError> {
        let prefix = prefix.into();
        let (updates, _) = broadcast::channel(UPDATE_FEED_CAPACITY);
        Ok(Self {
            connector: Arc::new(RedisConnector::open(url)?),
            channel: format!("{prefix}updates"),
            prefix,
            ttl,
            updates,
            insert_script: redis::Script::new(INSERT_SCRIPT),
            cas_script: redis::Script::new(CAS_SCRIPT),
        })
    }

    fn key(&self, duel_id: DuelId) -> String {
        format!("{}{}", self.prefix, duel_id)
    }

    /// Forwards the pub/sub channel into the local update feed until `cancel` fires.
    pub fn spawn_update_listener(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.connector.spawn_listener(
            "duel-cache-updates",
            self.channel.clone(),
            self.updates.clone(),
            cancel,
        )
    }
}

#[async_trait]
impl DuelStateCache for RedisDuelCache {
    async fn load(&self, duel_id: DuelId) -> Result<Option<LiveDuelState>, CacheError> {
        let key = self.key(duel_id);
        self.connector.run(|mut conn| async move {
            let raw: Option<String> = conn.hget(key, "state").await?;
            raw.map(|raw| serde_json::from_str(&raw).map_err(CacheError::from))
                .transpose()
        })
        .await
    }

    async fn insert_new(&self, state: &LiveDuelState) -> Result<bool, CacheError> {
        let key = self.key(state.duel_id);
        let body = serde_json::to_string(state)?;
        let update = serde_json::to_string(&DuelUpdate::committed(state))?;
        let ttl = ttl_millis(self.ttl);
        let mut invocation = self.insert_script.prepare_invoke();
        invocation
            .key(key)
            .key(&self.channel)
            .arg(state.state_version)
            .arg(body)
            .arg(ttl)
            .arg(update);
        self.connector.run(|mut conn| async move {
            let inserted: i64 = invocation.invoke_async(&mut conn).await?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        expected: StateVersion,
        next: &LiveDuelState,
    ) -> Result<CasOutcome, CacheError> {
        let key = self.key(next.duel_id);
        let body = serde_json::to_string(next)?;
        let update = serde_json::to_string(&DuelUpdate::committed(next))?;
        let ttl = ttl_millis(self.ttl);
        let mut invocation = self.cas_script.prepare_invoke();
        invocation
            .key(key)
            .key(&self.channel)
            .arg(expected)
            .arg(next.state_version)
            .arg(body)
            .arg(ttl)
            .arg(update);
        self.connector.run(|mut conn| async move {
            let reply: i64 = invocation.invoke_async(&mut conn).await?;
            match reply {
                CAS_COMMITTED => Ok(CasOutcome::Committed),
                CAS_MISSING => Ok(CasOutcome::Missing),
                current if current >= 0 => Ok(CasOutcome::VersionMismatch {
                    current: current as StateVersion,
                }),
                other => Err(CacheError::UnexpectedReply(format!("cas returned {other}"))),
            }
        })
        .await
    }

    async fn expire_after(&self, duel_id: DuelId, ttl: Duration) -> Result<(), CacheError> {
        let key = self.key(duel_id);
        let millis = ttl_millis(ttl);
        self.connector.run(|mut conn| async move {
            let current: i64 = conn.pttl(&key).await?;
            if current < 0 || current > millis {
                let _: bool = conn.pexpire(&key, millis).await?;
            }
            Ok(())
        })
        .await
    }

    async fn remove(&self, duel_id: DuelId) -> Result<(), CacheError> {
        let key = self.key(duel_id);
        self.connector.run(|mut conn| async move {
            let _: i64 = conn.del(key).await?;
            Ok(())
        })
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<DuelUpdate> {
        self.updates.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::live_state;
    use chrono::Utc;

    fn redis_cache() -> Option<Arc<RedisDuelCache>> {
        let url = std::env::var("REDIS_URL").ok()?;
        let prefix = format!("duel-test:{}:", uuid::Uuid::new_v4());
        match RedisDuelCache::new(&url, prefix, Duration::from_secs(30)) {
            Ok(cache) => Some(Arc::new(cache)),
            Err(err) => {
                eprintln!("skipping redis cache test: {err}");
                None
            }
        }
    }

    #[tokio::test]
    async fn redis_cas_round_trip() {
        let Some(cache) = redis_cache() else {
            eprintln!("skipping redis cache test: REDIS_URL not set");
            return;
        };
        let cancel = CancellationToken::new();
        cache.spawn_update_listener(cancel.clone());
        let mut rx = cache.subscribe();
        // let the listener subscribe before the first publish
        tokio::time::sleep(Duration::from_millis(200)).await;

        let state = live_state(1, 2, Utc::now());
        assert!(cache.insert_new(&state).await.unwrap());
        assert!(!cache.insert_new(&state).await.unwrap());

        let mut next = state.clone();
        next.state_version = 2;
        assert_eq!(
            cache.compare_and_swap(1, &next).await.unwrap(),
            CasOutcome::Committed
        );
        assert_eq!(
            cache.compare_and_swap(1, &next).await.unwrap(),
            CasOutcome::VersionMismatch { current: 2 }
        );
        assert_eq!(cache.load(state.duel_id).await.unwrap(), Some(next));

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.duel_id, state.duel_id);

        cache.remove(state.duel_id).await.unwrap();
        assert_eq!(cache.load(state.duel_id).await.unwrap(), None);
        cancel.cancel();
    }
}
