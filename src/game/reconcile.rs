//! Periodic sweep that keeps durable records and live state consistent.
//!
//! * `active` record without live state: refunded once past the start grace.
//! * live state finished but record still open: settled.
//! * live state with overdue deadlines: timers fired on behalf of dead processes.
//! * stale `pending` record: activated if its live state exists, refunded otherwise.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::DuelStateCache;
use crate::engine::duel::{deadline_after, DuelId};
use crate::game::coordinator::DuelCoordinator;
use crate::game::error::DuelError;
use crate::ledger::{DuelRecord, DuelStatus};
use crate::tokio_tools::spawn_periodic_task;

const LOG_TARGET: &str = "game::reconcile";

pub const DEFAULT_SWEEP_BATCH: u64 = 500;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub refunded_lost: usize,
    pub settled: usize,
    pub timers_fired: usize,
    pub pending_activated: usize,
    pub pending_refunded: usize,
    pub failed: usize,
}

impl ReconcileReport {
    pub fn is_quiet(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Reconciler {
    coordinator: Arc<DuelCoordinator>,
    batch: u64,
}

impl Reconciler {
    pub fn new(coordinator: Arc<DuelCoordinator>) -> Self {
        Self {
            coordinator,
            batch: DEFAULT_SWEEP_BATCH,
        }
    }

    pub fn with_batch(mut self, batch: u64) -> Self {
        self.batch = batch.max(1);
        self
    }

    fn is_stale(&self, record: &DuelRecord, now: DateTime<Utc>) -> bool {
        deadline_after(record.created_at, self.coordinator.config().stale_pending_after) <= now
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<ReconcileReport, DuelError> {
        let mut report = ReconcileReport::default();
        let ledger = self.coordinator.ledger();

        for record in ledger.duels_with_status(DuelStatus::Active, self.batch).await? {
            if let Err(err) = self.reconcile_active(&record, now, &mut report).await {
                report.failed += 1;
                warn!(target = LOG_TARGET, duel_id = %record.id, error = %err, "active duel not reconciled");
            }
        }

        for record in ledger.duels_with_status(DuelStatus::Pending, self.batch).await? {
            if !self.is_stale(&record, now) {
                continue;
            }
            if let Err(err) = self.reconcile_pending(record.id, &mut report).await {
                report.failed += 1;
                warn!(target = LOG_TARGET, duel_id = %record.id, error = %err, "pending duel not reconciled");
            }
        }

        if !report.is_quiet() {
            info!(
                target = LOG_TARGET,
                refunded_lost = report.refunded_lost,
                settled = report.settled,
                timers_fired = report.timers_fired,
                pending_activated = report.pending_activated,
                pending_refunded = report.pending_refunded,
                failed = report.failed,
                "reconciliation sweep"
            );
        }
        Ok(report)
    }

    async fn reconcile_active(
        &self,
        record: &DuelRecord,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<(), DuelError> {
        let Some(state) = self.coordinator.cache().load(record.id).await? else {
            if self.is_stale(record, now) {
                warn!(target = LOG_TARGET, duel_id = %record.id, "live state lost; refunding");
                self.coordinator.refund(record.id).await?;
                report.refunded_lost += 1;
            }
            return Ok(());
        };

        if state.is_finished() {
            self.coordinator.settle(&state).await?;
            report.settled += 1;
            return Ok(());
        }

        for input in state.overdue_inputs(now) {
            if self.coordinator.propose(record.id, input).await?.is_committed() {
                report.timers_fired += 1;
            }
        }
        Ok(())
    }

    async fn reconcile_pending(
        &self,
        duel_id: DuelId,
        report: &mut ReconcileReport,
    ) -> Result<(), DuelError> {
        match self.coordinator.cache().load(duel_id).await? {
            Some(state) => {
                self.coordinator.ledger().activate(duel_id).await?;
                report.pending_activated += 1;
                if state.is_finished() {
                    self.coordinator.settle(&state).await?;
                    report.settled += 1;
                }
            }
            None => {
                self.coordinator.refund(duel_id).await?;
                report.pending_refunded += 1;
            }
        }
        Ok(())
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let every = self.coordinator.config().reconciliation_interval;
        spawn_periodic_task("reconciler", every, cancel, move || {
            let reconciler = Arc::clone(&self);
            async move {
                if let Err(err) = reconciler.sweep(Utc::now()).await {
                    warn!(target = LOG_TARGET, error = %err, "reconciliation sweep failed");
                }
            }
        })
    }
}
