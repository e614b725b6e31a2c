//! Open challenge requests, stored beside live duel state so a challenge
//! proposed on one process can be answered on any other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry as Slot;
use dashmap::DashMap;
use tokio::sync::broadcast;

use super::CacheError;
use crate::engine::duel::PlayerId;
use crate::game::challenge::{ChallengeEvent, ChallengeId, ChallengeRequest};

pub const CHALLENGE_EVENT_CAPACITY: usize = 256;

#[async_trait]
pub trait ChallengeStore: Send + Sync {
    /// Stores `request` unless its target already has an unexpired request.
    async fn insert(&self, request: &ChallengeRequest) -> Result<bool, CacheError>;

    async fn get(&self, request_id: ChallengeId) -> Result<Option<ChallengeRequest>, CacheError>;

    /// Removes `request`. Only the one caller that removed it sees `true`.
    async fn take(&self, request: &ChallengeRequest) -> Result<bool, CacheError>;

    /// Requests the player sent or received, oldest first.
    async fn pending_for(&self, player_id: PlayerId) -> Result<Vec<ChallengeRequest>, CacheError>;

    /// Requests expired at `now`. Callers `take` each one before announcing it.
    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<ChallengeRequest>, CacheError>;

    /// Announces `event` to every process's subscribers.
    async fn publish(&self, event: &ChallengeEvent) -> Result<(), CacheError>;

    fn subscribe(&self) -> broadcast::Receiver<ChallengeEvent>;
}

/// Process-local store for single-node deployments and tests.
pub struct InMemoryChallengeStore {
    requests: DashMap<ChallengeId, ChallengeRequest>,
    targets: DashMap<PlayerId, ChallengeId>,
    events: broadcast::Sender<ChallengeEvent>,
}

impl InMemoryChallengeStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CHALLENGE_EVENT_CAPACITY);
        Self {
            requests: DashMap::new(),
            targets: DashMap::new(),
            events,
        }
    }
}

impl Default for InMemoryChallengeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChallengeStore for InMemoryChallengeStore {
    async fn insert(&self, request: &ChallengeRequest) -> Result<bool, CacheError> {
        let now = request.created_at;
        // the target slot stays locked until the request is stored
        match self.targets.entry(request.target) {
            Slot::Occupied(mut slot) => {
                let held = self
                    .requests
                    .get(slot.get())
                    .is_some_and(|existing| !existing.is_expired(now));
                if held {
                    return Ok(false);
                }
                self.requests.insert(request.id, request.clone());
                slot.insert(request.id);
            }
            Slot::Vacant(slot) => {
                self.requests.insert(request.id, request.clone());
                slot.insert(request.id);
            }
        }
        Ok(true)
    }

    async fn get(&self, request_id: ChallengeId) -> Result<Option<ChallengeRequest>, CacheError> {
        Ok(self.requests.get(&request_id).map(|entry| entry.clone()))
    }

    async fn take(&self, request: &ChallengeRequest) -> Result<bool, CacheError> {
        if self.requests.remove(&request.id).is_none() {
            return Ok(false);
        }
        self.targets
            .remove_if(&request.target, |_, held| *held == request.id);
        Ok(true)
    }

    async fn pending_for(&self, player_id: PlayerId) -> Result<Vec<ChallengeRequest>, CacheError> {
        let mut requests: Vec<_> = self
            .requests
            .iter()
            .filter(|entry| entry.involves(player_id))
            .map(|entry| entry.clone())
            .collect();
        requests.sort_by_key(|request| request.created_at);
        Ok(requests)
    }

    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<ChallengeRequest>, CacheError> {
        Ok(self
            .requests
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.clone())
            .collect())
    }

    async fn publish(&self, event: &ChallengeEvent) -> Result<(), CacheError> {
        // no receivers is fine
        let _ = self.events.send(event.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChallengeEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn request(challenger: PlayerId, target: PlayerId, now: DateTime<Utc>) -> ChallengeRequest {
        ChallengeRequest {
            id: Uuid::new_v4(),
            challenger,
            target,
            wager: 50,
            created_at: now,
            expires_at: now + Duration::seconds(30),
        }
    }

    #[tokio::test]
    async fn one_open_request_per_target() {
        let store = InMemoryChallengeStore::new();
        let now = Utc::now();
        let first = request(1, 2, now);
        assert!(store.insert(&first).await.unwrap());
        assert!(!store.insert(&request(3, 2, now)).await.unwrap());
        // being a target does not stop a player from challenging
        assert!(store.insert(&request(2, 3, now)).await.unwrap());

        let later = now + Duration::seconds(31);
        assert!(store.insert(&request(3, 2, later)).await.unwrap());
        assert_eq!(store.pending_for(2).await.unwrap().len(), 3);
        assert_eq!(store.expired(later).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn take_succeeds_once_and_frees_the_target() {
        let store = InMemoryChallengeStore::new();
        let now = Utc::now();
        let first = request(1, 2, now);
        store.insert(&first).await.unwrap();

        assert!(store.take(&first).await.unwrap());
        assert!(!store.take(&first).await.unwrap());
        assert_eq!(store.get(first.id).await.unwrap(), None);
        assert!(store.insert(&request(3, 2, now)).await.unwrap());
    }
}
