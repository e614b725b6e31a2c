//! Per-duel turn deadline timers.
//!
//! Every process watches the cache update feed and keeps one timer task per
//! duel it has seen. A timer only ever proposes an input conditioned on the
//! version it observed, so the same deadline firing in several processes
//! commits once and no-ops everywhere else.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{DuelStateCache, DuelUpdate};
use crate::engine::duel::{until, DuelId, DuelInput, LiveDuelState, StateVersion};
use crate::game::coordinator::DuelCoordinator;
use crate::tokio_tools::spawn_named_task;

const LOG_TARGET: &str = "game::supervisor";

const RETRY_DELAY: Duration = Duration::from_millis(500);

/// The input a turn timer fires once `turn_deadline` passes.
pub fn turn_timeout_input(state: &LiveDuelState) -> Option<DuelInput> {
    if state.is_finished() || state.turn_deadline.is_none() {
        return None;
    }
    Some(if state.phase.is_transient() {
        DuelInput::Advance
    } else {
        DuelInput::DeadlineElapsed {
            observed_version: state.state_version,
        }
    })
}

pub struct TurnSupervisor {
    coordinator: Arc<DuelCoordinator>,
    watched: Arc<DashMap<DuelId, watch::Sender<StateVersion>>>,
    cancel: CancellationToken,
}

impl TurnSupervisor {
    pub fn new(coordinator: Arc<DuelCoordinator>, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            watched: Arc::new(DashMap::new()),
            cancel,
        })
    }

    pub fn watched_duels(&self) -> usize {
        self.watched.len()
    }

    /// Follows the update feed until cancelled.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let mut updates = self.coordinator.cache().subscribe();
        spawn_named_task("turn-supervisor", async move {
            loop {
                tokio::select! {
                    _ = supervisor.cancel.cancelled() => break,
                    received = updates.recv() => match received {
                        Ok(update) => supervisor.observe(update),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(target = LOG_TARGET, skipped, "update feed lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    /// Wakes the duel's timer, starting one on first sight.
    pub fn observe(self: &Arc<Self>, update: DuelUpdate) {
        if let Some(sender) = self.watched.get(&update.duel_id) {
            sender.send_replace(update.version);
            return;
        }
        let (sender, receiver) = watch::channel(update.version);
        self.watched.insert(update.duel_id, sender);

        let supervisor = Arc::clone(self);
        spawn_named_task(format!("turn-timer-{}", update.duel_id), async move {
            supervisor.supervise(update.duel_id, receiver).await;
            supervisor.watched.remove(&update.duel_id);
        });
    }

    async fn supervise(&self, duel_id: DuelId, mut versions: watch::Receiver<StateVersion>) {
        loop {
            let state = match self.coordinator.cache().load(duel_id).await {
                Ok(Some(state)) => state,
                Ok(None) => return,
                Err(err) => {
                    warn!(target = LOG_TARGET, duel_id = %duel_id, error = %err, "load failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(RETRY_DELAY) => continue,
                    }
                }
            };
            if state.is_finished() {
                return;
            }

            let Some((deadline, input)) = state.turn_deadline.zip(turn_timeout_input(&state))
            else {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    changed = versions.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                changed = versions.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(until(deadline, Utc::now())) => {
                    debug!(
                        target = LOG_TARGET,
                        duel_id = %duel_id,
                        version = state.state_version,
                        input = input.kind(),
                        "turn deadline reached"
                    );
                    if let Err(err) = self.coordinator.propose(duel_id, input).await {
                        warn!(
                            target = LOG_TARGET,
                            duel_id = %duel_id,
                            error = %err,
                            "timeout input failed"
                        );
                        tokio::select! {
                            _ = self.cancel.cancelled() => return,
                            _ = tokio::time::sleep(RETRY_DELAY) => {}
                        }
                    }
                }
            }
        }
    }
}
