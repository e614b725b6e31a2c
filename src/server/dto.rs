use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::duel::{
    Ability, Coins, ConnectionStatus, DuelId, DuelOutcome, LiveDuelState, ParticipantState, Phase,
    PlayerId, RoundSummary, Settlement, StateVersion,
};
use crate::game::card_ranking::Card;
use crate::game::challenge::{ChallengeId, ChallengeRequest};
use crate::ledger::{DuelRecord, DuelStatus, HistoryPage, PlayerAccount};

/// One participant as seen by `viewer`. Hands are only shown to their owner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantView {
    pub player_id: PlayerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hand: Option<Vec<Card>>,
    pub hand_size: usize,
    pub held_card_indices: Vec<usize>,
    pub cumulative_damage_dealt: u32,
    pub connection: ConnectionStatus,
    pub ready: bool,
    pub acted_this_round: bool,
    pub abilities_used: Vec<Ability>,
}

impl ParticipantView {
    fn from_state(participant: &ParticipantState, reveal_hand: bool) -> Self {
        Self {
            player_id: participant.player_id,
            hand: reveal_hand.then(|| participant.hand.clone()),
            hand_size: participant.hand.len(),
            held_card_indices: participant.held_card_indices.clone(),
            cumulative_damage_dealt: participant.cumulative_damage_dealt,
            connection: participant.connection,
            ready: participant.ready,
            acted_this_round: participant.acted_this_round,
            abilities_used: participant.abilities_used.clone(),
        }
    }
}

/// Payload of `duel.state`: the live state with the opponent's hand redacted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuelView {
    pub duel_id: DuelId,
    pub version: StateVersion,
    pub phase: Phase,
    pub round: u32,
    pub max_rounds: u32,
    pub wager: Coins,
    pub current_turn: Option<PlayerId>,
    pub deadline: Option<DateTime<Utc>>,
    pub you: ParticipantView,
    pub opponent: ParticipantView,
    pub last_round: Option<RoundSummary>,
    pub outcome: Option<DuelOutcome>,
    pub settlement: Option<Settlement>,
}

impl DuelView {
    /// `None` when `viewer` is not a participant.
    pub fn for_player(state: &LiveDuelState, viewer: PlayerId) -> Option<Self> {
        let idx = state.index_of(viewer)?;
        let you = &state.participants[idx];
        let opponent = &state.participants[1 - idx];
        Some(Self {
            duel_id: state.duel_id,
            version: state.state_version,
            phase: state.phase,
            round: state.round,
            max_rounds: state.max_rounds,
            wager: state.wager,
            current_turn: state.current_turn,
            deadline: state.turn_deadline,
            you: ParticipantView::from_state(you, true),
            opponent: ParticipantView::from_state(opponent, false),
            last_round: state.last_round.clone(),
            outcome: state.outcome,
            settlement: state.settlement,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ProposeChallengeRequest {
    pub challenger: PlayerId,
    pub target: PlayerId,
    pub wager: Coins,
}

#[derive(Debug, Deserialize)]
pub struct ChallengeAnswerRequest {
    pub player_id: PlayerId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub request_id: ChallengeId,
    pub challenger: PlayerId,
    pub target: PlayerId,
    pub wager: Coins,
    pub expires_at: DateTime<Utc>,
}

impl From<ChallengeRequest> for ChallengeResponse {
    fn from(request: ChallengeRequest) -> Self {
        Self {
            request_id: request.id,
            challenger: request.challenger,
            target: request.target,
            wager: request.wager,
            expires_at: request.expires_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DuelStartedResponse {
    pub duel_id: DuelId,
    pub state: DuelView,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub page: Option<u64>,
    pub per_page: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct StateQuery {
    pub player_id: PlayerId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DuelSummary {
    pub duel_id: DuelId,
    pub opponent: PlayerId,
    pub wager: Coins,
    pub status: DuelStatus,
    pub winner: Option<PlayerId>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DuelSummary {
    fn from_record(record: DuelRecord, player_id: PlayerId) -> Self {
        let opponent = if record.participant_a == player_id {
            record.participant_b
        } else {
            record.participant_a
        };
        Self {
            duel_id: record.id,
            opponent,
            wager: record.wager,
            status: record.status,
            winner: record.winner,
            created_at: record.created_at,
            resolved_at: record.resolved_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub duels: Vec<DuelSummary>,
    pub page: u64,
    pub per_page: u64,
    pub total: u64,
}

impl HistoryResponse {
    pub fn from_page(page: HistoryPage, player_id: PlayerId) -> Self {
        Self {
            duels: page
                .duels
                .into_iter()
                .map(|record| DuelSummary::from_record(record, player_id))
                .collect(),
            page: page.page,
            per_page: page.per_page,
            total: page.total,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountResponse {
    pub player_id: PlayerId,
    pub balance: Coins,
    pub level: u32,
}

impl From<PlayerAccount> for AccountResponse {
    fn from(account: PlayerAccount) -> Self {
        Self {
            player_id: account.player_id,
            balance: account.balance,
            level: account.level,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::live_state;

    #[test]
    fn opponent_hand_is_redacted() {
        let mut state = live_state(1, 2, Utc::now());
        let cards = crate::game::card_ranking::standard_deck();
        state.participants[0].hand = cards[..5].to_vec();
        state.participants[1].hand = cards[5..10].to_vec();

        let view = DuelView::for_player(&state, 2).unwrap();
        assert_eq!(view.you.player_id, 2);
        assert_eq!(view.you.hand.as_deref(), Some(&cards[5..10]));
        assert_eq!(view.opponent.player_id, 1);
        assert_eq!(view.opponent.hand, None);
        assert_eq!(view.opponent.hand_size, 5);

        let json = serde_json::to_value(&view).unwrap();
        assert!(json["opponent"].get("hand").is_none());
        assert_eq!(json["phase"], "awaiting_ready");

        assert!(DuelView::for_player(&state, 3).is_none());
    }

    #[test]
    fn history_names_the_opponent() {
        let record = DuelRecord::new_pending(uuid::Uuid::new_v4(), 4, 7, 50, Utc::now());
        let summary = DuelSummary::from_record(record.clone(), 7);
        assert_eq!(summary.opponent, 4);
        let summary = DuelSummary::from_record(record, 4);
        assert_eq!(summary.opponent, 7);
    }
}
