//! Shared, versioned store for the live state of in-progress duels.
//!
//! Every write is a compare-and-swap on `state_version`. Committed writes are
//! announced, in version order per duel, on an update feed so each server
//! process can fan out to its own connected participants.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::engine::duel::{DuelId, LiveDuelState, StateVersion};

pub mod challenges;
pub mod in_memory;
pub mod redis;
pub mod redis_challenges;

pub use challenges::{ChallengeStore, InMemoryChallengeStore};
pub use in_memory::InMemoryDuelCache;
pub use redis_challenges::RedisChallengeStore;
pub use self::redis::RedisDuelCache;

pub const UPDATE_FEED_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("state encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("unexpected cache reply: {0}")]
    UnexpectedReply(String),
}

/// A committed write, published after the swap succeeded. Carries the
/// committed state so subscribers see every version, not just the latest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DuelUpdate {
    pub duel_id: DuelId,
    pub version: StateVersion,
    pub state: Arc<LiveDuelState>,
}

impl DuelUpdate {
    pub fn committed(state: &LiveDuelState) -> Self {
        Self {
            duel_id: state.duel_id,
            version: state.state_version,
            state: Arc::new(state.clone()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    Committed,
    /// Someone else committed first; re-read and retry.
    VersionMismatch { current: StateVersion },
    /// Entry expired or was never created.
    Missing,
}

#[async_trait]
pub trait DuelStateCache: Send + Sync {
    async fn load(&self, duel_id: DuelId) -> Result<Option<LiveDuelState>, CacheError>;

    /// Creates the entry; returns `false` without writing when it already exists.
    async fn insert_new(&self, state: &LiveDuelState) -> Result<bool, CacheError>;

    /// Writes `next` only if the stored version still equals `expected`.
    async fn compare_and_swap(
        &self,
        expected: StateVersion,
        next: &LiveDuelState,
    ) -> Result<CasOutcome, CacheError>;

    /// Shortens the remaining lifetime of an entry that needs no further writes.
    async fn expire_after(&self, duel_id: DuelId, ttl: Duration) -> Result<(), CacheError>;

    async fn remove(&self, duel_id: DuelId) -> Result<(), CacheError>;

    fn subscribe(&self) -> broadcast::Receiver<DuelUpdate>;
}
