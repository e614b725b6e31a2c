use thiserror::Error;

use super::types::{Ability, Phase};
use crate::game::card_ranking::HandError;

/// A player action that the current state does not accept. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("sender is not a participant of this duel")]
    NotParticipant,
    #[error("action not accepted during {}", .0.as_str())]
    WrongPhase(Phase),
    #[error("it is not your turn")]
    NotYourTurn,
    #[error("already acted this round")]
    AlreadyActed,
    #[error("already signalled ready")]
    AlreadyReady,
    #[error("card index {0} is out of range")]
    InvalidCardIndex(usize),
    #[error("card index {0} listed twice")]
    DuplicateCardIndex(usize),
    #[error("ability {0:?} already used this duel")]
    AbilityUsed(Ability),
    #[error("duel is already finished")]
    DuelFinished,
}

impl ActionError {
    pub fn code(&self) -> &'static str {
        match self {
            ActionError::NotParticipant => "not_participant",
            ActionError::WrongPhase(_) => "wrong_phase",
            ActionError::NotYourTurn => "not_your_turn",
            ActionError::AlreadyActed => "already_acted",
            ActionError::AlreadyReady => "already_ready",
            ActionError::InvalidCardIndex(_) | ActionError::DuplicateCardIndex(_) => {
                "malformed_action"
            }
            ActionError::AbilityUsed(_) => "ability_used",
            ActionError::DuelFinished => "duel_finished",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),
    #[error("invariant violated: {0}")]
    InvariantViolation(&'static str),
    #[error("deck exhausted")]
    DeckExhausted,
    #[error("hand evaluation failed: {0}")]
    Hand(#[from] HandError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error(transparent)]
    State(#[from] StateError),
}

pub trait InvariantCheck {
    fn validate_invariants(&self) -> Result<(), StateError>;
}
