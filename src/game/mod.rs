//! Duel orchestration: challenge flow, the single transition gate, timers
//! and the reconciliation sweep.

pub mod card_ranking;
pub mod challenge;
pub mod coordinator;
pub mod error;
pub mod monitor;
pub mod reconcile;
pub mod supervisor;

pub use challenge::{ChallengeError, ChallengeEvent, ChallengeId, ChallengeNegotiator, ChallengeRequest};
pub use coordinator::{DuelCoordinator, DuelRuntime, ProposeOutcome};
pub use error::DuelError;
pub use monitor::DisconnectMonitor;
pub use reconcile::{ReconcileReport, Reconciler};
pub use supervisor::TurnSupervisor;
