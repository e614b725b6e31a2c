use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, info, warn};

use crate::cache::{CasOutcome, DuelStateCache};
use crate::config::{DuelRules, EngineConfig};
use crate::engine::duel::{
    rules, DuelEvent, DuelId, DuelInput, LiveDuelState, PlayerAction, PlayerId, RuleContext,
    Settlement, StateError, Transition,
};
use crate::game::error::DuelError;
use crate::ledger::{DuelLedger, DuelRecord, DuelStatus, LedgerError};

const LOG_TARGET: &str = "game::coordinator";

/// Transient phases chain at most draw → hold/discard or resolve → draw/finished.
const MAX_FOLLOW_UPS: usize = 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProposeOutcome {
    Committed {
        state: LiveDuelState,
        events: Vec<DuelEvent>,
    },
    /// The input did not change anything; `state` is what it was evaluated against.
    Noop {
        state: LiveDuelState,
        reason: &'static str,
    },
}

impl ProposeOutcome {
    pub fn state(&self) -> &LiveDuelState {
        match self {
            ProposeOutcome::Committed { state, .. } | ProposeOutcome::Noop { state, .. } => state,
        }
    }

    pub fn into_state(self) -> LiveDuelState {
        match self {
            ProposeOutcome::Committed { state, .. } | ProposeOutcome::Noop { state, .. } => state,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, ProposeOutcome::Committed { .. })
    }
}

/// Single write path for live duel state. Player actions, timers, the
/// disconnect monitor and the reconciliation sweep all go through
/// [`DuelCoordinator::propose`], which commits with a compare-and-swap.
pub struct DuelCoordinator {
    cache: Arc<dyn DuelStateCache>,
    ledger: DuelLedger,
    config: EngineConfig,
    rng: Mutex<StdRng>,
}

impl DuelCoordinator {
    pub fn new(cache: Arc<dyn DuelStateCache>, ledger: DuelLedger, config: EngineConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            cache,
            ledger,
            config,
            rng: Mutex::new(rng),
        }
    }

    pub fn cache(&self) -> &Arc<dyn DuelStateCache> {
        &self.cache
    }

    pub fn ledger(&self) -> &DuelLedger {
        &self.ledger
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn rules(&self) -> &DuelRules {
        &self.config.rules
    }

    pub async fn load(&self, duel_id: DuelId) -> Result<LiveDuelState, DuelError> {
        self.cache
            .load(duel_id)
            .await?
            .ok_or(DuelError::StateLost(duel_id))
    }

    /// Activates a freshly locked duel and creates its live state. A repeated
    /// call returns the state that already exists.
    pub async fn start_duel(
        &self,
        record: &DuelRecord,
        now: DateTime<Utc>,
    ) -> Result<LiveDuelState, DuelError> {
        self.ledger.activate(record.id).await?;
        let state = LiveDuelState::new(
            record.id,
            record.wager,
            record.participant_a,
            record.participant_b,
            &self.config.rules,
            now,
        );
        if self.cache.insert_new(&state).await? {
            info!(
                target = LOG_TARGET,
                duel_id = %record.id,
                participant_a = record.participant_a,
                participant_b = record.participant_b,
                wager = record.wager,
                "duel started"
            );
            return Ok(state);
        }
        self.load(record.id).await
    }

    pub async fn submit_action(
        &self,
        duel_id: DuelId,
        player_id: PlayerId,
        action: PlayerAction,
    ) -> Result<ProposeOutcome, DuelError> {
        self.propose(duel_id, DuelInput::Player { player_id, action })
            .await
    }

    /// Commits `input`, then moves transient phases along and settles a
    /// finished duel. Follow-up failures are left to the timers and the sweep.
    pub async fn propose(
        &self,
        duel_id: DuelId,
        input: DuelInput,
    ) -> Result<ProposeOutcome, DuelError> {
        let outcome = self.propose_transition(duel_id, &input).await?;
        if outcome.is_committed() {
            self.follow_up(outcome.state().clone()).await;
        }
        Ok(outcome)
    }

    /// Read, apply and compare-and-swap until one write commits, the rules
    /// reject the input, or `cas_max_attempts` is exhausted.
    pub async fn propose_transition(
        &self,
        duel_id: DuelId,
        input: &DuelInput,
    ) -> Result<ProposeOutcome, DuelError> {
        let attempts = self.config.cas_max_attempts;
        for attempt in 1..=attempts {
            let current = self.load(duel_id).await?;
            let mut next = current.clone();
            let transition = {
                let mut rng = self.rng.lock();
                let mut ctx = RuleContext {
                    rules: &self.config.rules,
                    now: Utc::now(),
                    rng: &mut *rng,
                };
                rules::apply(&mut next, input, &mut ctx)?
            };

            let events = match transition {
                Transition::Noop { reason } => {
                    debug!(
                        target = LOG_TARGET,
                        duel_id = %duel_id,
                        input = input.kind(),
                        reason,
                        "transition skipped"
                    );
                    return Ok(ProposeOutcome::Noop {
                        state: current,
                        reason,
                    });
                }
                Transition::Applied { events } => events,
            };

            next.state_version = current.state_version + 1;
            match self
                .cache
                .compare_and_swap(current.state_version, &next)
                .await?
            {
                CasOutcome::Committed => {
                    debug!(
                        target = LOG_TARGET,
                        duel_id = %duel_id,
                        input = input.kind(),
                        version = next.state_version,
                        phase = next.phase.as_str(),
                        "transition committed"
                    );
                    return Ok(ProposeOutcome::Committed {
                        state: next,
                        events,
                    });
                }
                CasOutcome::VersionMismatch { current: stored } => {
                    debug!(
                        target = LOG_TARGET,
                        duel_id = %duel_id,
                        input = input.kind(),
                        expected = current.state_version,
                        stored,
                        attempt,
                        "lost compare-and-swap; retrying"
                    );
                }
                CasOutcome::Missing => return Err(DuelError::StateLost(duel_id)),
            }
        }

        warn!(
            target = LOG_TARGET,
            duel_id = %duel_id,
            input = input.kind(),
            attempts,
            "giving up on contended duel"
        );
        Err(DuelError::Contention { duel_id, attempts })
    }

    async fn follow_up(&self, mut state: LiveDuelState) {
        let duel_id = state.duel_id;
        for _ in 0..MAX_FOLLOW_UPS {
            if state.phase.is_transient() {
                match self.propose_transition(duel_id, &DuelInput::Advance).await {
                    Ok(outcome) => state = outcome.into_state(),
                    Err(err) => {
                        warn!(
                            target = LOG_TARGET,
                            duel_id = %duel_id,
                            error = %err,
                            "failed to advance transient phase"
                        );
                        return;
                    }
                }
                continue;
            }
            if state.is_finished() && state.settlement.is_none() {
                if let Err(err) = self.settle(&state).await {
                    warn!(
                        target = LOG_TARGET,
                        duel_id = %duel_id,
                        error = %err,
                        "settlement deferred to reconciliation"
                    );
                }
            }
            return;
        }
    }

    /// Pays out a finished duel through the escrow, then records the
    /// settlement in the live state. Safe to call any number of times.
    pub async fn settle(&self, state: &LiveDuelState) -> Result<Settlement, DuelError> {
        let duel_id = state.duel_id;
        let outcome = state
            .outcome
            .ok_or(StateError::InvalidTransition("settlement before finish"))?;
        let escrow = self.ledger.escrow();
        let now = Utc::now();

        let receipt = match escrow.settle(duel_id, outcome.winner, now).await {
            Err(LedgerError::InvalidState {
                status: DuelStatus::Pending,
                ..
            }) => {
                self.ledger.activate(duel_id).await?;
                escrow.settle(duel_id, outcome.winner, now).await?
            }
            other => other?,
        };
        let settlement = Settlement {
            winner: receipt.winner,
            payout: receipt.payout,
        };

        match self
            .propose_transition(duel_id, &DuelInput::MarkSettled { settlement })
            .await
        {
            Ok(_) => {}
            Err(DuelError::StateLost(_)) => return Ok(settlement),
            Err(err) => return Err(err),
        }
        self.cache
            .expire_after(duel_id, self.config.cache_ttl_slack)
            .await?;
        Ok(settlement)
    }

    /// Fires every timer input that is due; used when a process adopts a
    /// duel whose own timers may have died with another process.
    pub async fn drive_overdue(
        &self,
        duel_id: DuelId,
        now: DateTime<Utc>,
    ) -> Result<usize, DuelError> {
        let state = self.load(duel_id).await?;
        let mut committed = 0;
        for input in state.overdue_inputs(now) {
            if self.propose(duel_id, input).await?.is_committed() {
                committed += 1;
            }
        }
        Ok(committed)
    }

    /// Returns both wagers for a duel whose live state cannot be trusted.
    pub async fn refund(&self, duel_id: DuelId) -> Result<(), DuelError> {
        let receipt = self.ledger.escrow().refund(duel_id, Utc::now()).await?;
        if !receipt.already_final {
            if let Err(err) = self.cache.remove(duel_id).await {
                warn!(
                    target = LOG_TARGET,
                    duel_id = %duel_id,
                    error = %err,
                    "failed to drop live state of refunded duel"
                );
            }
        }
        Ok(())
    }
}
