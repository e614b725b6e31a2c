use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::duel::{until, DuelId, DuelInput, PlayerId};
use crate::game::coordinator::{DuelCoordinator, ProposeOutcome};
use crate::game::error::DuelError;
use crate::tokio_tools::spawn_named_task;

const LOG_TARGET: &str = "game::monitor";

struct GraceTimer {
    id: u64,
    cancel: CancellationToken,
}

/// Reconnect grace timers for participants whose socket dropped on this
/// process. The deadline itself lives in the live state, so the sweep on any
/// process can still enforce it if this one dies.
pub struct DisconnectMonitor {
    coordinator: Arc<DuelCoordinator>,
    timers: DashMap<(DuelId, PlayerId), GraceTimer>,
    next_timer: AtomicU64,
    cancel: CancellationToken,
}

impl DisconnectMonitor {
    pub fn new(coordinator: Arc<DuelCoordinator>, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            timers: DashMap::new(),
            next_timer: AtomicU64::new(0),
            cancel,
        })
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Marks the participant disconnected and arms the grace timer.
    pub async fn participant_disconnected(
        self: &Arc<Self>,
        duel_id: DuelId,
        player_id: PlayerId,
    ) -> Result<(), DuelError> {
        let outcome = self
            .coordinator
            .propose(duel_id, DuelInput::Disconnected { player_id })
            .await?;
        let Some(deadline) = outcome
            .state()
            .participant(player_id)
            .and_then(|participant| participant.disconnect_deadline)
        else {
            return Ok(());
        };
        info!(
            target = LOG_TARGET,
            duel_id = %duel_id,
            player_id,
            %deadline,
            "participant disconnected"
        );
        self.arm(duel_id, player_id, deadline);
        Ok(())
    }

    /// Cancels the grace timer and hands back the unchanged duel.
    pub async fn participant_reconnected(
        &self,
        duel_id: DuelId,
        player_id: PlayerId,
    ) -> Result<ProposeOutcome, DuelError> {
        if let Some((_, timer)) = self.timers.remove(&(duel_id, player_id)) {
            timer.cancel.cancel();
        }
        let outcome = self
            .coordinator
            .propose(duel_id, DuelInput::Reconnected { player_id })
            .await?;
        if outcome.is_committed() {
            info!(
                target = LOG_TARGET,
                duel_id = %duel_id,
                player_id,
                "participant reconnected"
            );
        }
        Ok(outcome)
    }

    fn arm(self: &Arc<Self>, duel_id: DuelId, player_id: PlayerId, deadline: DateTime<Utc>) {
        let key = (duel_id, player_id);
        let id = self.next_timer.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.child_token();
        if let Some(previous) = self.timers.insert(
            key,
            GraceTimer {
                id,
                cancel: cancel.clone(),
            },
        ) {
            previous.cancel.cancel();
        }

        let monitor = Arc::clone(self);
        spawn_named_task(format!("grace-{duel_id}-{player_id}"), async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(until(deadline, Utc::now())) => {
                    monitor.expire(duel_id, player_id, deadline).await;
                }
            }
            monitor.timers.remove_if(&key, |_, timer| timer.id == id);
        });
    }

    async fn expire(&self, duel_id: DuelId, player_id: PlayerId, deadline: DateTime<Utc>) {
        let input = DuelInput::GraceExpired {
            player_id,
            observed_deadline: deadline,
        };
        match self.coordinator.propose(duel_id, input).await {
            Ok(outcome) if outcome.is_committed() => info!(
                target = LOG_TARGET,
                duel_id = %duel_id,
                player_id,
                "grace period elapsed; participant forfeits"
            ),
            Ok(_) => {}
            Err(err) => warn!(
                target = LOG_TARGET,
                duel_id = %duel_id,
                player_id,
                error = %err,
                "grace expiry failed; reconciliation will retry"
            ),
        }
    }
}
