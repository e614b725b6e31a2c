use thiserror::Error;

use crate::cache::CacheError;
use crate::engine::duel::{ActionError, DuelId, RuleError, StateError};
use crate::ledger::LedgerError;

/// Failure of an orchestrated duel operation.
#[derive(Debug, Error)]
pub enum DuelError {
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error(transparent)]
    State(#[from] StateError),
    /// The live state expired or was evicted; reconciliation refunds the duel.
    #[error("live state of duel {0} is gone")]
    StateLost(DuelId),
    #[error("duel {duel_id} still contended after {attempts} attempts")]
    Contention { duel_id: DuelId, attempts: u32 },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl From<RuleError> for DuelError {
    fn from(err: RuleError) -> Self {
        match err {
            RuleError::Action(err) => DuelError::Action(err),
            RuleError::State(err) => DuelError::State(err),
        }
    }
}

impl DuelError {
    /// Stable machine code reported in `duel.error` and HTTP bodies.
    pub fn code(&self) -> &'static str {
        match self {
            DuelError::Action(err) => err.code(),
            DuelError::State(_) => "internal",
            DuelError::StateLost(_) => "duel_not_found",
            DuelError::Contention { .. } => "contention",
            DuelError::Ledger(err) => ledger_code(err),
            DuelError::Cache(_) => "unavailable",
        }
    }

    /// Worth retrying later with unchanged input.
    pub fn is_transient(&self) -> bool {
        match self {
            DuelError::Contention { .. } | DuelError::Cache(_) => true,
            DuelError::Ledger(err) => matches!(err, LedgerError::Conflict(_) | LedgerError::Database(_)),
            _ => false,
        }
    }
}

pub fn ledger_code(err: &LedgerError) -> &'static str {
    match err {
        LedgerError::Database(_) => "unavailable",
        LedgerError::InsufficientBalance { .. } => "insufficient_balance",
        LedgerError::NotFound(_) => "not_found",
        LedgerError::Conflict(_) => "contention",
        LedgerError::InvalidState { .. } => "invalid_state",
        LedgerError::Validation(_) => "validation",
    }
}
