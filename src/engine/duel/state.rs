use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{InvariantCheck, StateError};
use super::events::DuelInput;
use super::types::*;
use crate::config::DuelRules;
use crate::game::card_ranking::{Card, HAND_SIZE};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantState {
    pub player_id: PlayerId,
    pub hand: Vec<Card>,
    /// Indices kept at this round's hold/discard; empty until the participant acts.
    pub held_card_indices: Vec<usize>,
    pub cumulative_damage_dealt: u32,
    pub connection: ConnectionStatus,
    pub disconnect_deadline: Option<DateTime<Utc>>,
    pub last_action_at: Option<DateTime<Utc>>,
    pub ready: bool,
    pub acted_this_round: bool,
    pub abilities_used: Vec<Ability>,
    pub focus_round: Option<u32>,
}

impl ParticipantState {
    pub fn new(player_id: PlayerId) -> Self {
        Self {
            player_id,
            hand: Vec::with_capacity(HAND_SIZE),
            held_card_indices: Vec::new(),
            cumulative_damage_dealt: 0,
            connection: ConnectionStatus::Connected,
            disconnect_deadline: None,
            last_action_at: None,
            ready: false,
            acted_this_round: false,
            abilities_used: Vec::new(),
            focus_round: None,
        }
    }

    pub fn has_used(&self, ability: Ability) -> bool {
        self.abilities_used.contains(&ability)
    }
}

/// Cache-resident working state of one in-progress duel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveDuelState {
    pub duel_id: DuelId,
    pub wager: Coins,
    pub participants: [ParticipantState; 2],
    pub current_turn: Option<PlayerId>,
    pub round: u32,
    pub max_rounds: u32,
    pub deck: Vec<Card>,
    pub phase: Phase,
    pub turn_deadline: Option<DateTime<Utc>>,
    pub state_version: StateVersion,
    pub last_round: Option<RoundSummary>,
    pub outcome: Option<DuelOutcome>,
    pub settlement: Option<Settlement>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LiveDuelState {
    pub fn new(
        duel_id: DuelId,
        wager: Coins,
        participant_a: PlayerId,
        participant_b: PlayerId,
        rules: &DuelRules,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            duel_id,
            wager,
            participants: [
                ParticipantState::new(participant_a),
                ParticipantState::new(participant_b),
            ],
            current_turn: None,
            round: 1,
            max_rounds: rules.max_rounds,
            deck: Vec::new(),
            phase: Phase::AwaitingReady,
            turn_deadline: Some(deadline_after(now, rules.ready_window)),
            state_version: 1,
            last_round: None,
            outcome: None,
            settlement: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn index_of(&self, player_id: PlayerId) -> Option<usize> {
        self.participants
            .iter()
            .position(|p| p.player_id == player_id)
    }

    pub fn participant(&self, player_id: PlayerId) -> Option<&ParticipantState> {
        self.participants.iter().find(|p| p.player_id == player_id)
    }

    pub fn participant_mut(&mut self, player_id: PlayerId) -> Option<&mut ParticipantState> {
        self.participants
            .iter_mut()
            .find(|p| p.player_id == player_id)
    }

    pub fn opponent_of(&self, player_id: PlayerId) -> Option<PlayerId> {
        let idx = self.index_of(player_id)?;
        Some(self.participants[1 - idx].player_id)
    }

    pub fn player_ids(&self) -> [PlayerId; 2] {
        [
            self.participants[0].player_id,
            self.participants[1].player_id,
        ]
    }

    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    /// Participant who opens hold/discard in the current round.
    pub fn round_starter(&self) -> PlayerId {
        let idx = ((self.round.max(1) - 1) % 2) as usize;
        self.participants[idx].player_id
    }

    /// Timer inputs that are due at `now`, conditioned on the current version.
    pub fn overdue_inputs(&self, now: DateTime<Utc>) -> Vec<DuelInput> {
        if self.is_finished() {
            return Vec::new();
        }
        let mut inputs = Vec::new();
        if let Some(deadline) = self.turn_deadline {
            if deadline <= now {
                inputs.push(if self.phase.is_transient() {
                    DuelInput::Advance
                } else {
                    DuelInput::DeadlineElapsed {
                        observed_version: self.state_version,
                    }
                });
            }
        }
        for participant in &self.participants {
            if let Some(deadline) = participant.disconnect_deadline {
                if deadline <= now {
                    inputs.push(DuelInput::GraceExpired {
                        player_id: participant.player_id,
                        observed_deadline: deadline,
                    });
                }
            }
        }
        inputs
    }
}

impl InvariantCheck for LiveDuelState {
    fn validate_invariants(&self) -> Result<(), StateError> {
        if self.participants[0].player_id == self.participants[1].player_id {
            return Err(StateError::InvariantViolation("participants must differ"));
        }
        if self.round == 0 || self.round > self.max_rounds {
            return Err(StateError::InvariantViolation("round out of range"));
        }

        let mut seen = HashSet::new();
        for participant in &self.participants {
            if participant.hand.len() > HAND_SIZE {
                return Err(StateError::InvariantViolation("hand larger than five cards"));
            }
            for card in &participant.hand {
                if !seen.insert(*card) {
                    return Err(StateError::InvariantViolation("card dealt twice"));
                }
            }
        }
        for card in &self.deck {
            if !seen.insert(*card) {
                return Err(StateError::InvariantViolation("dealt card still in deck"));
            }
        }

        match (self.phase, self.outcome) {
            (Phase::Finished, None) => {
                return Err(StateError::InvariantViolation("finished duel without outcome"))
            }
            (Phase::Finished, Some(outcome)) => {
                if let Some(winner) = outcome.winner {
                    if self.index_of(winner).is_none() {
                        return Err(StateError::InvariantViolation(
                            "winner is not a participant",
                        ));
                    }
                }
            }
            (_, Some(_)) => {
                return Err(StateError::InvariantViolation("outcome before finish"))
            }
            _ => {}
        }

        if self.phase == Phase::HoldDiscard {
            let Some(turn) = self.current_turn else {
                return Err(StateError::InvariantViolation("hold/discard without a turn"));
            };
            if self.index_of(turn).is_none() {
                return Err(StateError::InvariantViolation("turn owner is not a participant"));
            }
        }
        if self.settlement.is_some() && self.phase != Phase::Finished {
            return Err(StateError::InvariantViolation("settled before finish"));
        }
        Ok(())
    }
}
