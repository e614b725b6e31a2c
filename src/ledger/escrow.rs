use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::engine::duel::{Coins, DuelId, PlayerId};
use crate::ledger::error::LedgerError;
use crate::ledger::storage::{LedgerStorage, LedgerStorageTxn};
use crate::ledger::types::{DuelRecord, DuelStatus, WagerLock};

const LOG_TARGET: &str = "ledger::escrow";

pub const LEDGER_RETRY_ATTEMPTS: u32 = 5;

/// Result of a settle or refund. `already_final` marks a repeated call that changed nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowReceipt {
    pub duel_id: DuelId,
    pub status: DuelStatus,
    pub winner: Option<PlayerId>,
    /// Pot paid to the winner, or each participant's refund.
    pub payout: Coins,
    pub already_final: bool,
}

impl EscrowReceipt {
    fn from_final(record: &DuelRecord) -> Self {
        let payout = match (record.status, record.winner) {
            (DuelStatus::Resolved, Some(_)) => record.wager.saturating_mul(2),
            _ => record.wager,
        };
        Self {
            duel_id: record.id,
            status: record.status,
            winner: record.winner,
            payout,
            already_final: true,
        }
    }
}

/// Commits on success, rolls back on failure.
pub(crate) async fn finish_txn<T>(
    txn: Box<dyn LedgerStorageTxn>,
    result: Result<T, LedgerError>,
) -> Result<T, LedgerError> {
    match result {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(err) => {
            txn.rollback().await;
            Err(err)
        }
    }
}

/// Runs `op` again while it fails with a version conflict.
pub(crate) async fn retry_on_conflict<T, F, Fut>(
    attempts: u32,
    what: &'static str,
    mut op: F,
) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if err.is_conflict() && attempt < attempts => {
                warn!(target = LOG_TARGET, attempt, operation = what, "retrying after conflict");
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Moves `amount` from the player's balance into a lock for `duel_id`.
pub async fn lock_wager(
    txn: &mut dyn LedgerStorageTxn,
    duel_id: DuelId,
    player_id: PlayerId,
    amount: Coins,
    now: DateTime<Utc>,
) -> Result<WagerLock, LedgerError> {
    let mut account = txn
        .load_account(player_id)
        .await?
        .ok_or(LedgerError::NotFound("player account"))?;
    if account.balance < amount {
        return Err(LedgerError::InsufficientBalance {
            player_id,
            available: account.balance,
            required: amount,
        });
    }
    account.balance -= amount;
    txn.save_account(&account).await?;

    let lock = WagerLock {
        duel_id,
        player_id,
        amount,
        locked_at: now,
    };
    txn.insert_lock(&lock).await?;
    Ok(lock)
}

async fn credit(
    txn: &mut dyn LedgerStorageTxn,
    player_id: PlayerId,
    amount: Coins,
) -> Result<(), LedgerError> {
    let mut account = txn
        .load_account(player_id)
        .await?
        .ok_or(LedgerError::NotFound("player account"))?;
    account.balance = account
        .balance
        .checked_add(amount)
        .ok_or_else(|| LedgerError::validation("balance overflow"))?;
    txn.save_account(&account).await
}

#[derive(Clone)]
pub struct WagerEscrow {
    storage: Arc<dyn LedgerStorage>,
    attempts: u32,
}

impl WagerEscrow {
    pub fn new(storage: Arc<dyn LedgerStorage>) -> Self {
        Self {
            storage,
            attempts: LEDGER_RETRY_ATTEMPTS,
        }
    }

    /// Pays the whole pot to `winner`, or returns each lock to its owner on a draw.
    /// Marks the record `resolved`; repeated calls are no-ops.
    pub async fn settle(
        &self,
        duel_id: DuelId,
        winner: Option<PlayerId>,
        now: DateTime<Utc>,
    ) -> Result<EscrowReceipt, LedgerError> {
        let receipt = retry_on_conflict(self.attempts, "settle", || {
            self.settle_once(duel_id, winner, now)
        })
        .await?;
        if !receipt.already_final {
            info!(
                target = LOG_TARGET,
                duel_id = %duel_id,
                winner = ?receipt.winner,
                payout = receipt.payout,
                "duel settled"
            );
        }
        Ok(receipt)
    }

    /// Returns every lock to its owner and marks the record `cancelled`.
    /// Resolved or cancelled duels are left untouched.
    pub async fn refund(
        &self,
        duel_id: DuelId,
        now: DateTime<Utc>,
    ) -> Result<EscrowReceipt, LedgerError> {
        let receipt = retry_on_conflict(self.attempts, "refund", || {
            self.refund_once(duel_id, now)
        })
        .await?;
        if !receipt.already_final {
            info!(target = LOG_TARGET, duel_id = %duel_id, refund = receipt.payout, "duel refunded");
        }
        Ok(receipt)
    }

    async fn settle_once(
        &self,
        duel_id: DuelId,
        winner: Option<PlayerId>,
        now: DateTime<Utc>,
    ) -> Result<EscrowReceipt, LedgerError> {
        let mut txn = self.storage.begin().await?;
        let result = settle_in(txn.as_mut(), duel_id, winner, now).await;
        finish_txn(txn, result).await
    }

    async fn refund_once(
        &self,
        duel_id: DuelId,
        now: DateTime<Utc>,
    ) -> Result<EscrowReceipt, LedgerError> {
        let mut txn = self.storage.begin().await?;
        let result = refund_in(txn.as_mut(), duel_id, now).await;
        finish_txn(txn, result).await
    }
}

async fn settle_in(
    txn: &mut dyn LedgerStorageTxn,
    duel_id: DuelId,
    winner: Option<PlayerId>,
    now: DateTime<Utc>,
) -> Result<EscrowReceipt, LedgerError> {
    let mut record = txn
        .load_duel(duel_id)
        .await?
        .ok_or(LedgerError::NotFound("duel record"))?;
    if record.status.is_final() {
        return Ok(EscrowReceipt::from_final(&record));
    }
    if record.status != DuelStatus::Active {
        return Err(LedgerError::InvalidState {
            duel_id,
            status: record.status,
        });
    }
    if let Some(winner) = winner {
        if !record.involves(winner) {
            return Err(LedgerError::validation("winner is not a participant"));
        }
    }

    let locks = txn.load_locks(duel_id).await?;
    let pot: Coins = locks.iter().map(|lock| lock.amount).sum();
    let payout = match winner {
        Some(winner) => {
            credit(txn, winner, pot).await?;
            pot
        }
        None => {
            for lock in &locks {
                credit(txn, lock.player_id, lock.amount).await?;
            }
            record.wager
        }
    };
    txn.delete_locks(duel_id).await?;

    record.status = DuelStatus::Resolved;
    record.winner = winner;
    record.resolved_at = Some(now);
    txn.save_duel(&record).await?;

    Ok(EscrowReceipt {
        duel_id,
        status: DuelStatus::Resolved,
        winner,
        payout,
        already_final: false,
    })
}

async fn refund_in(
    txn: &mut dyn LedgerStorageTxn,
    duel_id: DuelId,
    now: DateTime<Utc>,
) -> Result<EscrowReceipt, LedgerError> {
    let mut record = txn
        .load_duel(duel_id)
        .await?
        .ok_or(LedgerError::NotFound("duel record"))?;
    if record.status.is_final() {
        return Ok(EscrowReceipt::from_final(&record));
    }

    for lock in txn.load_locks(duel_id).await? {
        credit(txn, lock.player_id, lock.amount).await?;
    }
    txn.delete_locks(duel_id).await?;

    record.status = DuelStatus::Cancelled;
    record.winner = None;
    record.resolved_at = Some(now);
    txn.save_duel(&record).await?;

    Ok(EscrowReceipt {
        duel_id,
        status: DuelStatus::Cancelled,
        winner: None,
        payout: record.wager,
        already_final: false,
    })
}
