use sea_orm::DbErr;

use crate::engine::duel::{Coins, DuelId, PlayerId};
use crate::ledger::types::DuelStatus;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),
    #[error("player {player_id} has {available} available, {required} required")]
    InsufficientBalance {
        player_id: PlayerId,
        available: Coins,
        required: Coins,
    },
    #[error("{0} not found")]
    NotFound(&'static str),
    /// A concurrent writer changed the row first; safe to retry.
    #[error("concurrent update on {0}")]
    Conflict(&'static str),
    #[error("duel {duel_id} is {}", .status.as_str())]
    InvalidState { duel_id: DuelId, status: DuelStatus },
    #[error("validation error: {0}")]
    Validation(String),
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict(_))
    }
}
