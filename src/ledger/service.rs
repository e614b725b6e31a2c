use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use tracing::info;

use crate::engine::duel::{Coins, DuelId, PlayerId};
use crate::ledger::error::LedgerError;
use crate::ledger::escrow::{finish_txn, lock_wager, retry_on_conflict, WagerEscrow, LEDGER_RETRY_ATTEMPTS};
use crate::ledger::storage::{InMemoryLedgerStorage, LedgerStorage, SeaOrmLedgerStorage};
use crate::ledger::types::{DuelRecord, DuelStatus, HistoryPage, PlayerAccount};

const LOG_TARGET: &str = "ledger::service";

pub const MAX_HISTORY_PAGE: u64 = 100;

/// Duel records and balances, with the escrow operating on the same storage.
#[derive(Clone)]
pub struct DuelLedger {
    storage: Arc<dyn LedgerStorage>,
    escrow: WagerEscrow,
}

impl DuelLedger {
    pub fn new(storage: Arc<dyn LedgerStorage>) -> Self {
        let escrow = WagerEscrow::new(Arc::clone(&storage));
        Self { storage, escrow }
    }

    pub fn from_sea_orm(connection: DatabaseConnection) -> Self {
        Self::new(Arc::new(SeaOrmLedgerStorage::new(connection)) as Arc<dyn LedgerStorage>)
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryLedgerStorage::new()) as Arc<dyn LedgerStorage>)
    }

    pub fn escrow(&self) -> &WagerEscrow {
        &self.escrow
    }

    /// Seeds a balance record; the wider economy owns these in production.
    pub async fn open_account(
        &self,
        player_id: PlayerId,
        balance: Coins,
        level: u32,
    ) -> Result<PlayerAccount, LedgerError> {
        let account = PlayerAccount {
            player_id,
            balance,
            level,
            version: 0,
        };
        let mut txn = self.storage.begin().await?;
        let result = txn.insert_account(&account).await;
        finish_txn(txn, result).await?;
        Ok(account)
    }

    pub async fn account(&self, player_id: PlayerId) -> Result<PlayerAccount, LedgerError> {
        let mut txn = self.storage.begin().await?;
        let result = txn.load_account(player_id).await;
        txn.rollback().await;
        result?.ok_or(LedgerError::NotFound("player account"))
    }

    pub async fn duel(&self, duel_id: DuelId) -> Result<DuelRecord, LedgerError> {
        let mut txn = self.storage.begin().await?;
        let result = txn.load_duel(duel_id).await;
        txn.rollback().await;
        result?.ok_or(LedgerError::NotFound("duel record"))
    }

    pub async fn open_duel_for(
        &self,
        player_id: PlayerId,
    ) -> Result<Option<DuelRecord>, LedgerError> {
        let mut txn = self.storage.begin().await?;
        let result = txn.find_open_duel(player_id).await;
        txn.rollback().await;
        result
    }

    /// Creates a `pending` record and locks `wager` from both participants in
    /// one transaction: both locks exist afterwards, or neither does.
    pub async fn create_duel(
        &self,
        duel_id: DuelId,
        participant_a: PlayerId,
        participant_b: PlayerId,
        wager: Coins,
        now: DateTime<Utc>,
    ) -> Result<DuelRecord, LedgerError> {
        if participant_a == participant_b {
            return Err(LedgerError::validation("a player cannot duel themselves"));
        }
        if wager == 0 {
            return Err(LedgerError::validation("wager must be positive"));
        }
        let record = retry_on_conflict(LEDGER_RETRY_ATTEMPTS, "create_duel", || async move {
            let mut txn = self.storage.begin().await?;
            let record = DuelRecord::new_pending(duel_id, participant_a, participant_b, wager, now);
            let result = async {
                for player in [participant_a, participant_b] {
                    if let Some(open) = txn.find_open_duel(player).await? {
                        return Err(LedgerError::InvalidState {
                            duel_id: open.id,
                            status: open.status,
                        });
                    }
                }
                txn.insert_duel(&record).await?;
                lock_wager(txn.as_mut(), duel_id, participant_a, wager, now).await?;
                lock_wager(txn.as_mut(), duel_id, participant_b, wager, now).await?;
                Ok(record)
            }
            .await;
            finish_txn(txn, result).await
        })
        .await?;
        info!(
            target = LOG_TARGET,
            duel_id = %duel_id,
            participant_a,
            participant_b,
            wager,
            "wagers locked"
        );
        Ok(record)
    }

    /// `pending` → `active` once the live state exists. Already active is fine.
    pub async fn activate(&self, duel_id: DuelId) -> Result<DuelRecord, LedgerError> {
        retry_on_conflict(LEDGER_RETRY_ATTEMPTS, "activate", || async move {
            let mut txn = self.storage.begin().await?;
            let result = async {
                let mut record = txn
                    .load_duel(duel_id)
                    .await?
                    .ok_or(LedgerError::NotFound("duel record"))?;
                match record.status {
                    DuelStatus::Active => Ok(record),
                    DuelStatus::Pending => {
                        record.status = DuelStatus::Active;
                        txn.save_duel(&record).await?;
                        record.version += 1;
                        Ok(record)
                    }
                    status => Err(LedgerError::InvalidState { duel_id, status }),
                }
            }
            .await;
            finish_txn(txn, result).await
        })
        .await
    }

    /// Oldest first; used by the reconciliation sweep.
    pub async fn duels_with_status(
        &self,
        status: DuelStatus,
        limit: u64,
    ) -> Result<Vec<DuelRecord>, LedgerError> {
        let mut txn = self.storage.begin().await?;
        let result = txn.duels_with_status(status, limit).await;
        txn.rollback().await;
        result
    }

    /// Newest first; `page` starts at 1.
    pub async fn history(
        &self,
        player_id: PlayerId,
        page: u64,
        per_page: u64,
    ) -> Result<HistoryPage, LedgerError> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, MAX_HISTORY_PAGE);
        let mut txn = self.storage.begin().await?;
        let result = async {
            let total = txn.count_duels_for_player(player_id).await?;
            // pages past the addressable range are empty
            let duels = match (page - 1).checked_mul(per_page) {
                Some(offset) if offset < total => {
                    txn.duels_for_player(player_id, offset, per_page).await?
                }
                _ => Vec::new(),
            };
            Ok(HistoryPage {
                duels,
                page,
                per_page,
                total,
            })
        }
        .await;
        txn.rollback().await;
        result
    }
}
