//! Short-lived challenge requests. Requests live in a [`ChallengeStore`]
//! shared by every process; accepting one is what creates durable state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{CacheError, ChallengeStore};
use crate::config::DuelRules;
use crate::engine::duel::{deadline_after, Coins, DuelId, LiveDuelState, PlayerId};
use crate::game::coordinator::DuelCoordinator;
use crate::game::error::{ledger_code, DuelError};
use crate::ledger::{DuelLedger, LedgerError};
use crate::tokio_tools::spawn_periodic_task;

const LOG_TARGET: &str = "game::challenge";

pub type ChallengeId = Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeRequest {
    pub id: ChallengeId,
    pub challenger: PlayerId,
    pub target: PlayerId,
    pub wager: Coins,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ChallengeRequest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn involves(&self, player_id: PlayerId) -> bool {
        self.challenger == player_id || self.target == player_id
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChallengeEvent {
    Proposed(ChallengeRequest),
    Accepted {
        request: ChallengeRequest,
        duel_id: DuelId,
    },
    Declined(ChallengeRequest),
    Expired(ChallengeRequest),
}

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("a player cannot challenge themselves")]
    SelfChallenge,
    #[error("wager must be at least {min}")]
    WagerTooSmall { min: Coins },
    #[error("wager exceeds the limit of {limit}")]
    WagerAboveLimit { limit: Coins },
    #[error("level difference {gap} exceeds {max}")]
    LevelGap { gap: u32, max: u32 },
    #[error("{available} available, {required} required")]
    InsufficientBalance { available: Coins, required: Coins },
    #[error("player {0} already has a pending duel")]
    Busy(PlayerId),
    #[error("challenge {0} not found")]
    NotFound(ChallengeId),
    #[error("challenge {0} expired")]
    Expired(ChallengeId),
    #[error("only the challenged player may answer")]
    NotTarget,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Duel(#[from] DuelError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl ChallengeError {
    pub fn code(&self) -> &'static str {
        match self {
            ChallengeError::SelfChallenge => "self_challenge",
            ChallengeError::WagerTooSmall { .. } | ChallengeError::WagerAboveLimit { .. } => {
                "wager_out_of_bounds"
            }
            ChallengeError::LevelGap { .. } => "level_gap",
            ChallengeError::InsufficientBalance { .. } => "insufficient_balance",
            ChallengeError::Busy(_) => "player_busy",
            ChallengeError::NotFound(_) => "challenge_not_found",
            ChallengeError::Expired(_) => "challenge_expired",
            ChallengeError::NotTarget => "not_target",
            ChallengeError::Ledger(err) => ledger_code(err),
            ChallengeError::Duel(err) => err.code(),
            ChallengeError::Cache(_) => "unavailable",
        }
    }
}

/// Largest wager `balance` may put up under `rules`.
pub fn wager_limit(balance: Coins, rules: &DuelRules) -> Coins {
    let limit = u128::from(balance) * u128::from(rules.max_wager_bps) / 10_000;
    Coins::try_from(limit).unwrap_or(Coins::MAX)
}

pub struct ChallengeNegotiator {
    store: Arc<dyn ChallengeStore>,
    coordinator: Arc<DuelCoordinator>,
    ttl: Duration,
}

impl ChallengeNegotiator {
    pub fn new(coordinator: Arc<DuelCoordinator>, store: Arc<dyn ChallengeStore>) -> Self {
        let ttl = coordinator.config().challenge_ttl;
        Self {
            store,
            coordinator,
            ttl,
        }
    }

    /// Challenge events from every process sharing the store.
    pub fn subscribe(&self) -> broadcast::Receiver<ChallengeEvent> {
        self.store.subscribe()
    }

    fn ledger(&self) -> &DuelLedger {
        self.coordinator.ledger()
    }

    async fn publish(&self, event: ChallengeEvent) {
        if let Err(err) = self.store.publish(&event).await {
            warn!(target = LOG_TARGET, error = %err, "challenge event not published");
        }
    }

    pub async fn get(
        &self,
        request_id: ChallengeId,
    ) -> Result<Option<ChallengeRequest>, ChallengeError> {
        Ok(self.store.get(request_id).await?)
    }

    /// Open requests the player sent or received, oldest first.
    pub async fn pending_for(
        &self,
        player_id: PlayerId,
    ) -> Result<Vec<ChallengeRequest>, ChallengeError> {
        Ok(self.store.pending_for(player_id).await?)
    }

    pub async fn propose(
        &self,
        challenger: PlayerId,
        target: PlayerId,
        wager: Coins,
    ) -> Result<ChallengeRequest, ChallengeError> {
        let rules = self.coordinator.rules();
        if challenger == target {
            return Err(ChallengeError::SelfChallenge);
        }
        if wager < rules.min_wager {
            return Err(ChallengeError::WagerTooSmall {
                min: rules.min_wager,
            });
        }

        let challenger_account = self.ledger().account(challenger).await?;
        let target_account = self.ledger().account(target).await?;
        if challenger_account.balance < wager {
            return Err(ChallengeError::InsufficientBalance {
                available: challenger_account.balance,
                required: wager,
            });
        }
        let limit = wager_limit(challenger_account.balance, rules);
        if wager > limit {
            return Err(ChallengeError::WagerAboveLimit { limit });
        }
        let gap = challenger_account.level.abs_diff(target_account.level);
        if gap > rules.max_level_gap {
            return Err(ChallengeError::LevelGap {
                gap,
                max: rules.max_level_gap,
            });
        }

        let now = Utc::now();
        for player in [challenger, target] {
            if self.ledger().open_duel_for(player).await?.is_some() {
                return Err(ChallengeError::Busy(player));
            }
        }
        let request = ChallengeRequest {
            id: Uuid::new_v4(),
            challenger,
            target,
            wager,
            created_at: now,
            expires_at: deadline_after(now, self.ttl),
        };
        if !self.store.insert(&request).await? {
            return Err(ChallengeError::Busy(target));
        }
        info!(
            target = LOG_TARGET,
            request_id = %request.id,
            challenger,
            challenged = target,
            wager,
            "challenge proposed"
        );
        self.publish(ChallengeEvent::Proposed(request.clone())).await;
        Ok(request)
    }

    /// Locks both wagers, creates the duel record and its live state. Any
    /// failure after the locks refunds them before returning.
    pub async fn accept(
        &self,
        request_id: ChallengeId,
        player_id: PlayerId,
    ) -> Result<LiveDuelState, ChallengeError> {
        let request = self
            .take_if(request_id, |request| request.target == player_id)
            .await?;
        let now = Utc::now();
        if request.is_expired(now) {
            self.publish(ChallengeEvent::Expired(request)).await;
            return Err(ChallengeError::Expired(request_id));
        }

        let duel_id = Uuid::new_v4();
        let record = self
            .ledger()
            .create_duel(duel_id, request.challenger, request.target, request.wager, now)
            .await?;

        let state = match self.coordinator.start_duel(&record, now).await {
            Ok(state) => state,
            Err(err) => {
                warn!(
                    target = LOG_TARGET,
                    duel_id = %duel_id,
                    error = %err,
                    "duel failed to start; refunding wagers"
                );
                if let Err(refund_err) = self.coordinator.refund(duel_id).await {
                    warn!(
                        target = LOG_TARGET,
                        duel_id = %duel_id,
                        error = %refund_err,
                        "refund failed; reconciliation will retry"
                    );
                }
                return Err(err.into());
            }
        };

        info!(
            target = LOG_TARGET,
            request_id = %request_id,
            duel_id = %duel_id,
            "challenge accepted"
        );
        self.publish(ChallengeEvent::Accepted { request, duel_id }).await;
        Ok(state)
    }

    /// Either side may withdraw; nothing financial has happened yet.
    pub async fn decline(
        &self,
        request_id: ChallengeId,
        player_id: PlayerId,
    ) -> Result<ChallengeRequest, ChallengeError> {
        let request = self
            .take_if(request_id, |request| request.involves(player_id))
            .await?;
        info!(
            target = LOG_TARGET,
            request_id = %request_id,
            player_id,
            "challenge declined"
        );
        self.publish(ChallengeEvent::Declined(request.clone())).await;
        Ok(request)
    }

    /// Removes expired requests. When several processes sweep, each request
    /// is announced by whichever one takes it.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, ChallengeError> {
        let mut removed = 0;
        for request in self.store.expired(now).await? {
            if self.store.take(&request).await? {
                removed += 1;
                self.publish(ChallengeEvent::Expired(request)).await;
            }
        }
        if removed > 0 {
            info!(target = LOG_TARGET, removed, "expired challenges swept");
        }
        Ok(removed)
    }

    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let every = self.coordinator.config().challenge_sweep_interval;
        let negotiator = Arc::clone(self);
        spawn_periodic_task("challenge-sweeper", every, cancel, move || {
            let negotiator = Arc::clone(&negotiator);
            async move {
                if let Err(err) = negotiator.sweep_expired(Utc::now()).await {
                    warn!(target = LOG_TARGET, error = %err, "challenge sweep failed");
                }
            }
        })
    }

    /// Takes the request if `allowed` accepts it. Losing a race to another
    /// taker reads as not found.
    async fn take_if(
        &self,
        request_id: ChallengeId,
        allowed: impl FnOnce(&ChallengeRequest) -> bool,
    ) -> Result<ChallengeRequest, ChallengeError> {
        let request = self
            .store
            .get(request_id)
            .await?
            .ok_or(ChallengeError::NotFound(request_id))?;
        if !allowed(&request) {
            return Err(ChallengeError::NotTarget);
        }
        if !self.store.take(&request).await? {
            return Err(ChallengeError::NotFound(request_id));
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DuelStateCache, InMemoryChallengeStore, InMemoryDuelCache};
    use crate::config::EngineConfig;
    use crate::engine::duel::Phase;
    use crate::ledger::DuelStatus;

    async fn negotiator_with(config: EngineConfig) -> Arc<ChallengeNegotiator> {
        let cache = Arc::new(InMemoryDuelCache::new(config.live_state_ttl()));
        let ledger = DuelLedger::in_memory();
        ledger.open_account(1, 1_000, 10).await.unwrap();
        ledger.open_account(2, 1_000, 12).await.unwrap();
        ledger.open_account(3, 1_000, 40).await.unwrap();
        ledger.open_account(4, 100, 10).await.unwrap();
        let coordinator = Arc::new(DuelCoordinator::new(cache, ledger, config));
        Arc::new(ChallengeNegotiator::new(
            coordinator,
            Arc::new(InMemoryChallengeStore::new()),
        ))
    }

    async fn negotiator() -> Arc<ChallengeNegotiator> {
        negotiator_with(EngineConfig::default()).await
    }

    #[test]
    fn wager_limit_uses_basis_points() {
        let rules = DuelRules::default();
        assert_eq!(wager_limit(1_000, &rules), 500);
        assert_eq!(wager_limit(u64::MAX, &rules), u64::MAX / 2);
    }

    #[tokio::test]
    async fn policy_checks() {
        let negotiator = negotiator().await;
        assert!(matches!(
            negotiator.propose(1, 1, 10).await,
            Err(ChallengeError::SelfChallenge)
        ));
        assert!(matches!(
            negotiator.propose(1, 2, 0).await,
            Err(ChallengeError::WagerTooSmall { .. })
        ));
        assert!(matches!(
            negotiator.propose(1, 2, 600).await,
            Err(ChallengeError::WagerAboveLimit { limit: 500 })
        ));
        assert!(matches!(
            negotiator.propose(4, 2, 150).await,
            Err(ChallengeError::InsufficientBalance {
                available: 100,
                required: 150
            })
        ));
        assert!(matches!(
            negotiator.propose(1, 3, 10).await,
            Err(ChallengeError::LevelGap { gap: 30, max: 10 })
        ));
        let err = negotiator.propose(1, 99, 10).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn target_with_pending_request_is_busy() {
        let negotiator = negotiator().await;
        negotiator.propose(1, 2, 100).await.unwrap();
        let err = negotiator.propose(4, 2, 10).await.unwrap_err();
        assert!(matches!(err, ChallengeError::Busy(2)));
        assert_eq!(negotiator.pending_for(2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn accept_locks_and_starts() {
        let negotiator = negotiator().await;
        let mut events = negotiator.subscribe();
        let request = negotiator.propose(1, 2, 200).await.unwrap();

        assert!(matches!(
            negotiator.accept(request.id, 1).await,
            Err(ChallengeError::NotTarget)
        ));
        let state = negotiator.accept(request.id, 2).await.unwrap();
        assert_eq!(state.phase, Phase::AwaitingReady);
        assert_eq!(state.player_ids(), [1, 2]);

        let ledger = negotiator.coordinator.ledger();
        assert_eq!(ledger.account(1).await.unwrap().balance, 800);
        assert_eq!(ledger.account(2).await.unwrap().balance, 800);
        assert_eq!(
            ledger.duel(state.duel_id).await.unwrap().status,
            DuelStatus::Active
        );
        assert!(negotiator.get(request.id).await.unwrap().is_none());

        assert!(matches!(events.recv().await.unwrap(), ChallengeEvent::Proposed(_)));
        assert!(matches!(
            events.recv().await.unwrap(),
            ChallengeEvent::Accepted { duel_id, .. } if duel_id == state.duel_id
        ));

        // A second accept finds nothing; a new challenge is blocked by the open duel.
        assert!(matches!(
            negotiator.accept(request.id, 2).await,
            Err(ChallengeError::NotFound(_))
        ));
        assert!(matches!(
            negotiator.propose(2, 1, 10).await,
            Err(ChallengeError::Busy(_))
        ));
    }

    #[tokio::test]
    async fn decline_and_expiry_have_no_financial_effect() {
        let config = EngineConfig {
            challenge_ttl: Duration::from_millis(10),
            ..EngineConfig::default()
        };
        let negotiator = negotiator_with(config).await;

        let request = negotiator.propose(1, 2, 100).await.unwrap();
        assert!(matches!(
            negotiator.decline(request.id, 3).await,
            Err(ChallengeError::NotTarget)
        ));
        negotiator.decline(request.id, 2).await.unwrap();
        assert!(negotiator.get(request.id).await.unwrap().is_none());

        let request = negotiator.propose(1, 2, 100).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            negotiator.accept(request.id, 2).await,
            Err(ChallengeError::Expired(_))
        ));

        negotiator.propose(1, 2, 100).await.unwrap();
        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(negotiator.sweep_expired(later).await.unwrap(), 1);
        assert!(negotiator.pending_for(1).await.unwrap().is_empty());

        let ledger = negotiator.coordinator.ledger();
        assert_eq!(ledger.account(1).await.unwrap().balance, 1_000);
        assert_eq!(ledger.account(2).await.unwrap().balance, 1_000);
    }

    #[tokio::test]
    async fn refund_drops_live_state_and_returns_wagers() {
        let negotiator = negotiator().await;
        let request = negotiator.propose(1, 2, 100).await.unwrap();
        let state = negotiator.accept(request.id, 2).await.unwrap();
        let cache = negotiator.coordinator.cache();
        assert!(cache.load(state.duel_id).await.unwrap().is_some());

        negotiator.coordinator.refund(state.duel_id).await.unwrap();
        assert!(cache.load(state.duel_id).await.unwrap().is_none());
        let ledger = negotiator.coordinator.ledger();
        assert_eq!(ledger.account(1).await.unwrap().balance, 1_000);
        assert_eq!(
            ledger.duel(state.duel_id).await.unwrap().status,
            DuelStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn processes_sharing_stores_answer_each_others_challenges() {
        let config = EngineConfig::default();
        let cache = Arc::new(InMemoryDuelCache::new(config.live_state_ttl()));
        let ledger = DuelLedger::in_memory();
        ledger.open_account(1, 1_000, 1).await.unwrap();
        ledger.open_account(2, 1_000, 1).await.unwrap();
        ledger.open_account(3, 1_000, 1).await.unwrap();
        let store: Arc<dyn ChallengeStore> = Arc::new(InMemoryChallengeStore::new());
        let node = |ledger: DuelLedger| {
            let coordinator = Arc::new(DuelCoordinator::new(
                Arc::clone(&cache) as Arc<dyn DuelStateCache>,
                ledger,
                config.clone(),
            ));
            ChallengeNegotiator::new(coordinator, Arc::clone(&store))
        };
        let west = node(ledger.clone());
        let east = node(ledger.clone());
        let mut east_events = east.subscribe();

        let request = west.propose(1, 2, 200).await.unwrap();
        assert_eq!(east.pending_for(2).await.unwrap(), vec![request.clone()]);
        assert!(matches!(
            east_events.recv().await.unwrap(),
            ChallengeEvent::Proposed(seen) if seen.id == request.id
        ));
        // the target guard is shared too
        assert!(matches!(
            east.propose(3, 2, 10).await,
            Err(ChallengeError::Busy(2))
        ));

        let state = east.accept(request.id, 2).await.unwrap();
        assert_eq!(state.player_ids(), [1, 2]);
        assert!(matches!(
            west.accept(request.id, 2).await,
            Err(ChallengeError::NotFound(_))
        ));
        assert_eq!(ledger.account(1).await.unwrap().balance, 800);
        assert_eq!(ledger.account(2).await.unwrap().balance, 800);
    }
}
