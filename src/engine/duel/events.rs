use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::actions::PlayerAction;
use super::types::{Ability, DuelOutcome, PlayerId, RoundSummary, Settlement, StateVersion};

/// Everything that may write a duel's live state funnels through one of these.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "input", rename_all = "snake_case")]
pub enum DuelInput {
    Player {
        player_id: PlayerId,
        action: PlayerAction,
    },
    /// Move a transient phase (`draw`, `resolve_round`) forward.
    Advance,
    /// Fired by a timer that observed `observed_version`; ignored once the state moved on.
    DeadlineElapsed { observed_version: StateVersion },
    Disconnected { player_id: PlayerId },
    Reconnected { player_id: PlayerId },
    GraceExpired {
        player_id: PlayerId,
        observed_deadline: DateTime<Utc>,
    },
    MarkSettled { settlement: Settlement },
}

impl DuelInput {
    pub fn kind(&self) -> &'static str {
        match self {
            DuelInput::Player { .. } => "player",
            DuelInput::Advance => "advance",
            DuelInput::DeadlineElapsed { .. } => "deadline_elapsed",
            DuelInput::Disconnected { .. } => "disconnected",
            DuelInput::Reconnected { .. } => "reconnected",
            DuelInput::GraceExpired { .. } => "grace_expired",
            DuelInput::MarkSettled { .. } => "mark_settled",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DuelEvent {
    PlayerReady { player_id: PlayerId },
    Dealt { round: u32 },
    CardsReplaced { player_id: PlayerId, replaced: usize },
    DefaultActionApplied { player_id: PlayerId },
    AbilityUsed { player_id: PlayerId, ability: Ability },
    TurnPassed { to: PlayerId },
    RoundResolved(RoundSummary),
    Finished(DuelOutcome),
    ParticipantDisconnected {
        player_id: PlayerId,
        deadline: DateTime<Utc>,
    },
    ParticipantReconnected { player_id: PlayerId },
    Settled(Settlement),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    Applied { events: Vec<DuelEvent> },
    /// Nothing to do; the state must not be written.
    Noop { reason: &'static str },
}

impl Transition {
    pub fn applied(events: Vec<DuelEvent>) -> Self {
        Transition::Applied { events }
    }
}
