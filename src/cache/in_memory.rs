use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as Slot;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

use super::{CacheError, CasOutcome, DuelStateCache, DuelUpdate, UPDATE_FEED_CAPACITY};
use crate::engine::duel::{DuelId, LiveDuelState, StateVersion};

const LOG_TARGET: &str = "cache::in_memory";

struct Entry {
    state: LiveDuelState,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Process-local cache for single-node deployments and tests.
pub struct InMemoryDuelCache {
    entries: DashMap<DuelId, Entry>,
    ttl: Duration,
    updates: broadcast::Sender<DuelUpdate>,
}

impl InMemoryDuelCache {
    pub fn new(ttl: Duration) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_FEED_CAPACITY);
        Self {
            entries: DashMap::new(),
            ttl,
            updates,
        }
    }

    /// Drops expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before - self.entries.len()
    }

    fn publish(&self, state: &LiveDuelState) {
        // no receivers is fine
        let _ = self.updates.send(DuelUpdate::committed(state));
    }
}

#[async_trait]
impl DuelStateCache for InMemoryDuelCache {
    async fn load(&self, duel_id: DuelId) -> Result<Option<LiveDuelState>, CacheError> {
        let now = Instant::now();
        let expired = match self.entries.get(&duel_id) {
            Some(entry) if entry.is_live(now) => return Ok(Some(entry.state.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(&duel_id, |_, entry| !entry.is_live(now));
            trace!(target = LOG_TARGET, duel_id = %duel_id, "entry expired");
        }
        Ok(None)
    }

    async fn insert_new(&self, state: &LiveDuelState) -> Result<bool, CacheError> {
        let now = Instant::now();
        let fresh = Entry {
            state: state.clone(),
            expires_at: now + self.ttl,
        };
        // published under the entry lock so the feed stays in version order
        let inserted = match self.entries.entry(state.duel_id) {
            Slot::Occupied(mut slot) if !slot.get().is_live(now) => {
                slot.insert(fresh);
                self.publish(state);
                true
            }
            Slot::Occupied(_) => false,
            Slot::Vacant(slot) => {
                slot.insert(fresh);
                self.publish(state);
                true
            }
        };
        Ok(inserted)
    }

    async fn compare_and_swap(
        &self,
        expected: StateVersion,
        next: &LiveDuelState,
    ) -> Result<CasOutcome, CacheError> {
        let now = Instant::now();
        let outcome = match self.entries.get_mut(&next.duel_id) {
            None => CasOutcome::Missing,
            Some(entry) if !entry.is_live(now) => CasOutcome::Missing,
            Some(mut entry) => {
                if entry.state.state_version != expected {
                    CasOutcome::VersionMismatch {
                        current: entry.state.state_version,
                    }
                } else {
                    entry.state = next.clone();
                    entry.expires_at = now + self.ttl;
                    self.publish(next);
                    CasOutcome::Committed
                }
            }
        };
        Ok(outcome)
    }

    async fn expire_after(&self, duel_id: DuelId, ttl: Duration) -> Result<(), CacheError> {
        if let Some(mut entry) = self.entries.get_mut(&duel_id) {
            let candidate = Instant::now() + ttl;
            if candidate < entry.expires_at {
                entry.expires_at = candidate;
            }
        }
        Ok(())
    }

    async fn remove(&self, duel_id: DuelId) -> Result<(), CacheError> {
        self.entries.remove(&duel_id);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DuelUpdate> {
        self.updates.subscribe()
    }
}
