use serde::{Deserialize, Serialize};

use super::types::Ability;

/// Player intent as it arrives from the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerAction {
    Ready,
    /// Keep the listed cards; everything else is replaced.
    Hold { card_indices: Vec<usize> },
    /// Replace the listed cards; everything else is kept.
    Discard { card_indices: Vec<usize> },
    Ability { ability: Ability },
    Forfeit,
}

impl PlayerAction {
    pub fn hold_all() -> Self {
        PlayerAction::Hold {
            card_indices: (0..crate::game::card_ranking::HAND_SIZE).collect(),
        }
    }
}
