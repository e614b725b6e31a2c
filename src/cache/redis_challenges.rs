//! Redis-backed challenge requests.
//!
//! A request is a JSON string at `{prefix}challenge:{id}`. The target's guard
//! key `{prefix}challenge-target:{player}` expires with the request, so "target
//! already challenged" needs no cleanup. Per-player sets and an expiry sorted
//! set index the requests for listing and sweeping. Inserts and takes run as
//! Lua scripts; a take is decided by which caller's `DEL` removed the body.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::challenges::{ChallengeStore, CHALLENGE_EVENT_CAPACITY};
use super::redis::{ttl_millis, RedisConnector};
use super::CacheError;
use crate::engine::duel::PlayerId;
use crate::game::challenge::{ChallengeEvent, ChallengeId, ChallengeRequest};

const LOG_TARGET: &str = "cache::redis_challenges";

/// How long a request body outlives its expiry so a sweeper can announce it.
const RETENTION_SLACK: Duration = Duration::from_secs(600);

const INSERT_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[2]) == 1 then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[4])
redis.call('SET', KEYS[2], ARGV[2], 'PX', ARGV[3])
redis.call('SADD', KEYS[3], ARGV[2])
redis.call('PEXPIRE', KEYS[3], ARGV[4])
redis.call('SADD', KEYS[4], ARGV[2])
redis.call('PEXPIRE', KEYS[4], ARGV[4])
redis.call('ZADD', KEYS[5], ARGV[5], ARGV[2])
return 1
";

const TAKE_SCRIPT: &str = r"
if redis.call('DEL', KEYS[1]) == 0 then
  return 0
end
if redis.call('GET', KEYS[2]) == ARGV[1] then
  redis.call('DEL', KEYS[2])
end
redis.call('SREM', KEYS[3], ARGV[1])
redis.call('SREM', KEYS[4], ARGV[1])
redis.call('ZREM', KEYS[5], ARGV[1])
return 1
";

pub struct RedisChallengeStore {
    connector: Arc<RedisConnector>,
    prefix: String,
    channel: String,
    events: broadcast::Sender<ChallengeEvent>,
    insert_script: redis::Script,
    take_script: redis::Script,
}

impl RedisChallengeStore {
    pub fn new(url: &str, prefix: impl Into<String>) -> Result<Self, CacheError> {
        let prefix = prefix.into();
        let (events, _) = broadcast::channel(CHALLENGE_EVENT_CAPACITY);
        Ok(Self {
            connector: Arc::new(RedisConnector::open(url)?),
            channel: format!("{prefix}challenges"),
            prefix,
            events,
            insert_script: redis::Script::new(INSERT_SCRIPT),
            take_script: redis::Script::new(TAKE_SCRIPT),
        })
    }

    fn request_key(&self, request_id: ChallengeId) -> String {
        format!("{}challenge:{}", self.prefix, request_id)
    }

    fn target_key(&self, player_id: PlayerId) -> String {
        format!("{}challenge-target:{}", self.prefix, player_id)
    }

    fn player_key(&self, player_id: PlayerId) -> String {
        format!("{}challenges-of:{}", self.prefix, player_id)
    }

    fn expiry_key(&self) -> String {
        format!("{}challenge-expiry", self.prefix)
    }

    /// Keys an insert or take touches, in script order.
    fn keys_for(&self, request: &ChallengeRequest) -> [String; 5] {
        [
            self.request_key(request.id),
            self.target_key(request.target),
            self.player_key(request.challenger),
            self.player_key(request.target),
            self.expiry_key(),
        ]
    }

    /// Forwards challenge events from other processes (and this one) into the
    /// local feed until `cancel` fires.
    pub fn spawn_event_listener(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.connector.spawn_listener(
            "challenge-events",
            self.channel.clone(),
            self.events.clone(),
            cancel,
        )
    }

    async fn load_many(
        &self,
        ids: Vec<String>,
    ) -> Result<(Vec<ChallengeRequest>, Vec<String>), CacheError> {
        if ids.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("{}challenge:{}", self.prefix, id))
            .collect();
        let bodies: Vec<Option<String>> = self
            .connector
            .run(|mut conn| async move {
                let bodies: Vec<Option<String>> =
                    redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;
                Ok(bodies)
            })
            .await?;

        let mut found = Vec::new();
        let mut missing = Vec::new();
        for (id, body) in ids.into_iter().zip(bodies) {
            match body {
                Some(body) => found.push(serde_json::from_str(&body)?),
                None => missing.push(id),
            }
        }
        Ok((found, missing))
    }
}

fn millis_until(from: DateTime<Utc>, until: DateTime<Utc>) -> i64 {
    let span = (until - from).to_std().unwrap_or_default();
    ttl_millis(span)
}

#[async_trait]
impl ChallengeStore for RedisChallengeStore {
    async fn insert(&self, request: &ChallengeRequest) -> Result<bool, CacheError> {
        let body = serde_json::to_string(request)?;
        let guard = millis_until(request.created_at, request.expires_at);
        let retention = guard.saturating_add(ttl_millis(RETENTION_SLACK));
        let mut invocation = self.insert_script.prepare_invoke();
        for key in self.keys_for(request) {
            invocation.key(key);
        }
        invocation
            .arg(body)
            .arg(request.id.to_string())
            .arg(guard)
            .arg(retention)
            .arg(request.expires_at.timestamp_millis());
        self.connector
            .run(|mut conn| async move {
                let inserted: i64 = invocation.invoke_async(&mut conn).await?;
                Ok(inserted == 1)
            })
            .await
    }

    async fn get(&self, request_id: ChallengeId) -> Result<Option<ChallengeRequest>, CacheError> {
        let key = self.request_key(request_id);
        self.connector
            .run(|mut conn| async move {
                let raw: Option<String> = conn.get(key).await?;
                raw.map(|raw| serde_json::from_str(&raw).map_err(CacheError::from))
                    .transpose()
            })
            .await
    }

    async fn take(&self, request: &ChallengeRequest) -> Result<bool, CacheError> {
        let mut invocation = self.take_script.prepare_invoke();
        for key in self.keys_for(request) {
            invocation.key(key);
        }
        invocation.arg(request.id.to_string());
        self.connector
            .run(|mut conn| async move {
                let taken: i64 = invocation.invoke_async(&mut conn).await?;
                Ok(taken == 1)
            })
            .await
    }

    async fn pending_for(&self, player_id: PlayerId) -> Result<Vec<ChallengeRequest>, CacheError> {
        let key = self.player_key(player_id);
        let members_key = key.clone();
        let ids: Vec<String> = self
            .connector
            .run(|mut conn| async move { Ok(conn.smembers(members_key).await?) })
            .await?;

        let (mut requests, missing) = self.load_many(ids).await?;
        if !missing.is_empty() {
            debug!(
                target = LOG_TARGET,
                player_id,
                dropped = missing.len(),
                "dropping lapsed challenge ids"
            );
            self.connector
                .run(|mut conn| async move {
                    let _: i64 = conn.srem(key, missing).await?;
                    Ok(())
                })
                .await?;
        }
        requests.sort_by_key(|request| request.created_at);
        Ok(requests)
    }

    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<ChallengeRequest>, CacheError> {
        let key = self.expiry_key();
        let range_key = key.clone();
        let cutoff = now.timestamp_millis();
        let ids: Vec<String> = self
            .connector
            .run(|mut conn| async move {
                Ok(conn.zrangebyscore(range_key, "-inf", cutoff).await?)
            })
            .await?;

        let (requests, missing) = self.load_many(ids).await?;
        if !missing.is_empty() {
            self.connector
                .run(|mut conn| async move {
                    let _: i64 = conn.zrem(key, missing).await?;
                    Ok(())
                })
                .await?;
        }
        Ok(requests)
    }

    async fn publish(&self, event: &ChallengeEvent) -> Result<(), CacheError> {
        let payload = serde_json::to_string(event)?;
        let channel = self.channel.clone();
        self.connector
            .run(|mut conn| async move {
                let _: i64 = conn.publish(channel, payload).await?;
                Ok(())
            })
            .await
    }

    fn subscribe(&self) -> broadcast::Receiver<ChallengeEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn redis_store() -> Option<RedisChallengeStore> {
        let url = std::env::var("REDIS_URL").ok()?;
        let prefix = format!("duel-test:{}:", Uuid::new_v4());
        match RedisChallengeStore::new(&url, prefix) {
            Ok(store) => Some(store),
            Err(err) => {
                eprintln!("skipping redis challenge test: {err}");
                None
            }
        }
    }

    #[tokio::test]
    async fn redis_requests_are_taken_once() {
        let Some(store) = redis_store() else {
            eprintln!("skipping redis challenge test: REDIS_URL not set");
            return;
        };
        let cancel = CancellationToken::new();
        store.spawn_event_listener(cancel.clone());
        let mut events = store.subscribe();
        // let the listener subscribe before the first publish
        tokio::time::sleep(Duration::from_millis(200)).await;

        let now = Utc::now();
        let request = ChallengeRequest {
            id: Uuid::new_v4(),
            challenger: 1,
            target: 2,
            wager: 50,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(30),
        };
        assert!(store.insert(&request).await.unwrap());
        let mut rival = request.clone();
        rival.id = Uuid::new_v4();
        rival.challenger = 3;
        assert!(!store.insert(&rival).await.unwrap());
        assert_eq!(store.pending_for(1).await.unwrap(), vec![request.clone()]);
        assert_eq!(store.get(request.id).await.unwrap(), Some(request.clone()));

        let later = now + chrono::Duration::seconds(31);
        assert_eq!(store.expired(later).await.unwrap(), vec![request.clone()]);

        store
            .publish(&ChallengeEvent::Proposed(request.clone()))
            .await
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, ChallengeEvent::Proposed(request.clone()));

        assert!(store.take(&request).await.unwrap());
        assert!(!store.take(&request).await.unwrap());
        assert!(store.pending_for(2).await.unwrap().is_empty());
        assert!(store.insert(&rival).await.unwrap());
        assert!(store.take(&rival).await.unwrap());
        cancel.cancel();
    }
}
