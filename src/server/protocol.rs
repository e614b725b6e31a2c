//! JSON messages exchanged over the duel WebSocket.

use serde::{Deserialize, Serialize};

use crate::engine::duel::{Ability, Coins, DuelId, PlayerAction, PlayerId};
use crate::game::challenge::{ChallengeId, ChallengeRequest};

use super::dto::DuelView;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardAction {
    Hold,
    Discard,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ClientMessage {
    #[serde(rename = "challenge.propose")]
    ProposeChallenge { target: PlayerId, wager: Coins },
    #[serde(rename = "challenge.accept")]
    AcceptChallenge { request_id: ChallengeId },
    #[serde(rename = "challenge.decline")]
    DeclineChallenge { request_id: ChallengeId },
    #[serde(rename = "duel.ready")]
    Ready { duel_id: DuelId },
    #[serde(rename = "duel.action")]
    Action {
        duel_id: DuelId,
        #[serde(rename = "type")]
        kind: CardAction,
        card_indices: Vec<usize>,
    },
    #[serde(rename = "duel.ability")]
    Ability { duel_id: DuelId, ability: Ability },
    #[serde(rename = "duel.forfeit")]
    Forfeit { duel_id: DuelId },
    /// Ask for the current `duel.state`, e.g. after a reconnect.
    #[serde(rename = "duel.sync")]
    Sync { duel_id: DuelId },
}

impl ClientMessage {
    /// The duel action this message carries, if it targets a running duel.
    pub fn duel_action(&self) -> Option<(DuelId, PlayerAction)> {
        match self {
            ClientMessage::Ready { duel_id } => Some((*duel_id, PlayerAction::Ready)),
            ClientMessage::Action {
                duel_id,
                kind,
                card_indices,
            } => {
                let card_indices = card_indices.clone();
                let action = match kind {
                    CardAction::Hold => PlayerAction::Hold { card_indices },
                    CardAction::Discard => PlayerAction::Discard { card_indices },
                };
                Some((*duel_id, action))
            }
            ClientMessage::Ability { duel_id, ability } => Some((
                *duel_id,
                PlayerAction::Ability { ability: *ability },
            )),
            ClientMessage::Forfeit { duel_id } => Some((*duel_id, PlayerAction::Forfeit)),
            _ => None,
        }
    }

    pub fn duel_id(&self) -> Option<DuelId> {
        match self {
            ClientMessage::Sync { duel_id } => Some(*duel_id),
            other => other.duel_action().map(|(duel_id, _)| duel_id),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeClosedReason {
    Accepted,
    Declined,
    Expired,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerMessage {
    #[serde(rename = "challenge.received")]
    ChallengeReceived { request: ChallengeRequest },
    #[serde(rename = "challenge.closed")]
    ChallengeClosed {
        request_id: ChallengeId,
        reason: ChallengeClosedReason,
    },
    #[serde(rename = "duel.started")]
    Started {
        duel_id: DuelId,
        opponent: PlayerId,
        wager: Coins,
    },
    #[serde(rename = "duel.state")]
    State(DuelView),
    #[serde(rename = "duel.resolved")]
    Resolved {
        duel_id: DuelId,
        winner: Option<PlayerId>,
        payout: Coins,
    },
    #[serde(rename = "duel.error")]
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        duel_id: Option<DuelId>,
    },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>, duel_id: Option<DuelId>) -> Self {
        ServerMessage::Error {
            code: code.into(),
            message: message.into(),
            duel_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn client_messages_use_dotted_event_names() {
        let duel_id = Uuid::new_v4();
        let raw = json!({
            "event": "duel.action",
            "duel_id": duel_id,
            "type": "discard",
            "card_indices": [1, 4]
        });
        let message: ClientMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(
            message.duel_action(),
            Some((
                duel_id,
                PlayerAction::Discard {
                    card_indices: vec![1, 4]
                }
            ))
        );

        let raw = json!({"event": "duel.ability", "duel_id": duel_id, "ability": "focus"});
        let message: ClientMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(message.duel_id(), Some(duel_id));

        let raw = json!({"event": "challenge.propose", "target": 9, "wager": 25});
        let message: ClientMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(
            message,
            ClientMessage::ProposeChallenge {
                target: 9,
                wager: 25
            }
        );
        assert_eq!(message.duel_id(), None);
    }

    #[test]
    fn unknown_events_are_rejected() {
        let raw = json!({"event": "duel.cheat", "duel_id": Uuid::new_v4()});
        assert!(serde_json::from_value::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn server_messages_serialize_flat() {
        let duel_id = Uuid::new_v4();
        let json = serde_json::to_value(ServerMessage::Resolved {
            duel_id,
            winner: Some(3),
            payout: 400,
        })
        .unwrap();
        assert_eq!(json["event"], "duel.resolved");
        assert_eq!(json["payout"], 400);

        let json = serde_json::to_value(ServerMessage::error("not_your_turn", "wait", None)).unwrap();
        assert_eq!(json["event"], "duel.error");
        assert!(json.get("duel_id").is_none());
    }
}
