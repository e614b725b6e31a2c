use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::duel::{Coins, DuelId, PlayerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuelStatus {
    /// Wagers locked, live state not yet confirmed.
    Pending,
    Active,
    Resolved,
    Cancelled,
}

impl DuelStatus {
    /// Resolved and cancelled records never change again.
    pub fn is_final(self) -> bool {
        matches!(self, DuelStatus::Resolved | DuelStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DuelStatus::Pending => "pending",
            DuelStatus::Active => "active",
            DuelStatus::Resolved => "resolved",
            DuelStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuelRecord {
    pub id: DuelId,
    pub participant_a: PlayerId,
    pub participant_b: PlayerId,
    pub wager: Coins,
    pub status: DuelStatus,
    pub winner: Option<PlayerId>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl DuelRecord {
    pub fn new_pending(
        id: DuelId,
        participant_a: PlayerId,
        participant_b: PlayerId,
        wager: Coins,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            participant_a,
            participant_b,
            wager,
            status: DuelStatus::Pending,
            winner: None,
            created_at: now,
            resolved_at: None,
            version: 0,
        }
    }

    pub fn involves(&self, player_id: PlayerId) -> bool {
        self.participant_a == player_id || self.participant_b == player_id
    }

    pub fn participants(&self) -> [PlayerId; 2] {
        [self.participant_a, self.participant_b]
    }
}

/// Balance record owned by the wider game economy; the escrow only moves coins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerAccount {
    pub player_id: PlayerId,
    pub balance: Coins,
    pub level: u32,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WagerLock {
    pub duel_id: DuelId,
    pub player_id: PlayerId,
    pub amount: Coins,
    pub locked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub duels: Vec<DuelRecord>,
    pub page: u64,
    pub per_page: u64,
    pub total: u64,
}
