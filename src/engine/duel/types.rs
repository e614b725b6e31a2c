use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::card_ranking::HandCategory;

pub type PlayerId = u64;
pub type DuelId = Uuid;
pub type StateVersion = u64;
pub type Coins = u64;

/// Absolute wall-clock deadline `after` from `now`, shared by every process.
pub fn deadline_after(now: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(after).unwrap_or_else(|_| chrono::Duration::days(365));
    now + delta
}

/// Time left until `deadline`, zero when already passed.
pub fn until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    AwaitingReady,
    Draw,
    HoldDiscard,
    ResolveRound,
    Finished,
}

impl Phase {
    /// Phases that advance without player input as soon as they are committed.
    pub fn is_transient(self) -> bool {
        matches!(self, Phase::Draw | Phase::ResolveRound)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::AwaitingReady => "awaiting_ready",
            Phase::Draw => "draw",
            Phase::HoldDiscard => "hold_discard",
            Phase::ResolveRound => "resolve_round",
            Phase::Finished => "finished",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ability {
    /// Replace the whole hand from the deck.
    Mulligan,
    /// Double this round's damage multiplier.
    Focus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    DamageThreshold,
    RoundLimit,
    Forfeit,
    DisconnectTimeout,
    ReadyTimeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuelOutcome {
    /// `None` is a draw; both wagers are refunded.
    pub winner: Option<PlayerId>,
    pub reason: FinishReason,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundResult {
    pub player_id: PlayerId,
    pub category: HandCategory,
    pub damage: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round: u32,
    pub results: Vec<RoundResult>,
}

/// What the escrow paid out once the duel finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub winner: Option<PlayerId>,
    /// Pot paid to the winner, or each participant's refund on a draw.
    pub payout: Coins,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::serde::assert_round_trip_eq;

    #[test]
    fn phases_serialize_as_protocol_names() {
        for phase in [
            Phase::AwaitingReady,
            Phase::Draw,
            Phase::HoldDiscard,
            Phase::ResolveRound,
            Phase::Finished,
        ] {
            let json = serde_json::to_string(&phase).unwrap();
            assert_eq!(json, format!("\"{}\"", phase.as_str()));
        }
    }

    #[test]
    fn outcome_round_trips() {
        assert_round_trip_eq(&DuelOutcome {
            winner: Some(4),
            reason: FinishReason::DisconnectTimeout,
        });
        assert_round_trip_eq(&Settlement {
            winner: None,
            payout: 200,
        });
    }
}
