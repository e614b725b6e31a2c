use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::{signal, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{ChallengeStore, InMemoryChallengeStore};
use crate::game::challenge::ChallengeNegotiator;
use crate::game::monitor::DisconnectMonitor;
use crate::game::reconcile::Reconciler;
use crate::game::supervisor::TurnSupervisor;

use super::manager::DuelCoordinator;

const LOG_TARGET: &str = "game::runtime";

/// Owns the background tasks of one server process: turn timers, the
/// challenge sweeper and the reconciliation sweep.
pub struct DuelRuntime {
    coordinator: Arc<DuelCoordinator>,
    negotiator: Arc<ChallengeNegotiator>,
    monitor: Arc<DisconnectMonitor>,
    supervisor: Arc<TurnSupervisor>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl DuelRuntime {
    /// Starts a runtime whose challenge requests stay in this process.
    pub fn spawn(coordinator: Arc<DuelCoordinator>) -> Self {
        Self::spawn_with_challenges(coordinator, Arc::new(InMemoryChallengeStore::new()))
    }

    pub fn spawn_with_challenges(
        coordinator: Arc<DuelCoordinator>,
        challenges: Arc<dyn ChallengeStore>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let negotiator = Arc::new(ChallengeNegotiator::new(
            Arc::clone(&coordinator),
            challenges,
        ));
        let monitor = DisconnectMonitor::new(Arc::clone(&coordinator), cancel.child_token());
        let supervisor = TurnSupervisor::new(Arc::clone(&coordinator), cancel.child_token());
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&coordinator)));

        let handles = vec![
            supervisor.spawn(),
            negotiator.spawn_sweeper(cancel.child_token()),
            reconciler.spawn(cancel.child_token()),
        ];
        info!(target = LOG_TARGET, tasks = handles.len(), "duel runtime started");

        Self {
            coordinator,
            negotiator,
            monitor,
            supervisor,
            cancel,
            handles,
        }
    }

    pub fn coordinator(&self) -> Arc<DuelCoordinator> {
        Arc::clone(&self.coordinator)
    }

    pub fn negotiator(&self) -> Arc<ChallengeNegotiator> {
        Arc::clone(&self.negotiator)
    }

    pub fn monitor(&self) -> Arc<DisconnectMonitor> {
        Arc::clone(&self.monitor)
    }

    pub fn supervisor(&self) -> Arc<TurnSupervisor> {
        Arc::clone(&self.supervisor)
    }

    /// Token cancelled on shutdown, for tasks spawned outside the runtime.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Joins `handle` on shutdown.
    pub fn track(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    /// Waits for a Ctrl+C signal and then gracefully shuts the runtime down.
    pub async fn shutdown_on_ctrl_c(self) -> Result<()> {
        let ctrl_c_result = signal::ctrl_c().await;
        match &ctrl_c_result {
            Ok(()) => info!(
                target = LOG_TARGET,
                "Ctrl+C received; initiating runtime shutdown"
            ),
            Err(err) => warn!(
                target = LOG_TARGET,
                error = ?err,
                "failed to listen for Ctrl+C; shutting down runtime anyway"
            ),
        }
        self.shutdown().await?;
        ctrl_c_result.map_err(|err| anyhow!("failed to listen for ctrl+c: {err}"))
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.cancel.cancel();
        let handles = std::mem::take(&mut self.handles);
        let mut failed = 0;
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(target = LOG_TARGET, error = %err, "background task ended abnormally");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(anyhow!("{failed} background tasks failed to join"));
        }
        info!(target = LOG_TARGET, "duel runtime stopped");
        Ok(())
    }
}

impl Drop for DuelRuntime {
    fn drop(&mut self) {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}
