use async_trait::async_trait;

use crate::engine::duel::{DuelId, PlayerId};
use crate::ledger::error::LedgerError;
use crate::ledger::types::{DuelRecord, DuelStatus, PlayerAccount, WagerLock};

pub mod in_memory;
pub mod sea_orm;

pub use in_memory::InMemoryLedgerStorage;
pub use sea_orm::SeaOrmLedgerStorage;

#[async_trait]
pub trait LedgerStorage: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn LedgerStorageTxn>, LedgerError>;
}

/// One all-or-nothing unit of work.
///
/// `save_*` writes are conditioned on the `version` carried by the argument and
/// bump it by one; a mismatch surfaces as [`LedgerError::Conflict`], either
/// immediately or at `commit`.
#[async_trait]
pub trait LedgerStorageTxn: Send {
    async fn load_account(
        &mut self,
        player_id: PlayerId,
    ) -> Result<Option<PlayerAccount>, LedgerError>;

    async fn insert_account(&mut self, account: &PlayerAccount) -> Result<(), LedgerError>;

    async fn save_account(&mut self, account: &PlayerAccount) -> Result<(), LedgerError>;

    async fn load_duel(&mut self, duel_id: DuelId) -> Result<Option<DuelRecord>, LedgerError>;

    async fn insert_duel(&mut self, record: &DuelRecord) -> Result<(), LedgerError>;

    async fn save_duel(&mut self, record: &DuelRecord) -> Result<(), LedgerError>;

    /// Pending or active duel involving `player_id`, if any.
    async fn find_open_duel(&mut self, player_id: PlayerId)
        -> Result<Option<DuelRecord>, LedgerError>;

    async fn duels_with_status(
        &mut self,
        status: DuelStatus,
        limit: u64,
    ) -> Result<Vec<DuelRecord>, LedgerError>;

    /// Newest first.
    async fn duels_for_player(
        &mut self,
        player_id: PlayerId,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<DuelRecord>, LedgerError>;

    async fn count_duels_for_player(&mut self, player_id: PlayerId) -> Result<u64, LedgerError>;

    async fn insert_lock(&mut self, lock: &WagerLock) -> Result<(), LedgerError>;

    async fn load_locks(&mut self, duel_id: DuelId) -> Result<Vec<WagerLock>, LedgerError>;

    async fn delete_locks(&mut self, duel_id: DuelId) -> Result<u64, LedgerError>;

    async fn commit(self: Box<Self>) -> Result<(), LedgerError>;
    async fn rollback(self: Box<Self>);
}
