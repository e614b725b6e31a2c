use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveEnum, ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DatabaseTransaction,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};

use crate::db::entity::sea_orm_active_enums::DuelStatus as DbDuelStatus;
use crate::db::entity::{duels, player_accounts, wager_locks};
use crate::engine::duel::{Coins, DuelId, PlayerId};
use crate::ledger::error::LedgerError;
use crate::ledger::types::{DuelRecord, DuelStatus, PlayerAccount, WagerLock};

use super::{LedgerStorage, LedgerStorageTxn};

pub struct SeaOrmLedgerStorage {
    connection: DatabaseConnection,
}

impl SeaOrmLedgerStorage {
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }
}

pub struct SeaOrmLedgerTxn {
    txn: DatabaseTransaction,
}

#[async_trait]
impl LedgerStorage for SeaOrmLedgerStorage {
    async fn begin(&self) -> Result<Box<dyn LedgerStorageTxn>, LedgerError> {
        let txn = self.connection.begin().await?;
        Ok(Box::new(SeaOrmLedgerTxn { txn }))
    }
}

#[async_trait]
impl LedgerStorageTxn for SeaOrmLedgerTxn {
    async fn load_account(
        &mut self,
        player_id: PlayerId,
    ) -> Result<Option<PlayerAccount>, LedgerError> {
        let record = player_accounts::Entity::find_by_id(player_to_db(player_id)?)
            .one(&self.txn)
            .await?;
        record.map(account_from_model).transpose()
    }

    async fn insert_account(&mut self, account: &PlayerAccount) -> Result<(), LedgerError> {
        let model = player_accounts::ActiveModel {
            player_id: Set(player_to_db(account.player_id)?),
            balance: Set(coins_to_db(account.balance)?),
            level: Set(i32::try_from(account.level)
                .map_err(|_| LedgerError::validation("level exceeds database range"))?),
            version: Set(account.version),
        };
        model.insert(&self.txn).await?;
        Ok(())
    }

    async fn save_account(&mut self, account: &PlayerAccount) -> Result<(), LedgerError> {
        let result = player_accounts::Entity::update_many()
            .col_expr(
                player_accounts::Column::Balance,
                Expr::value(coins_to_db(account.balance)?),
            )
            .col_expr(
                player_accounts::Column::Version,
                Expr::value(account.version + 1),
            )
            .filter(player_accounts::Column::PlayerId.eq(player_to_db(account.player_id)?))
            .filter(player_accounts::Column::Version.eq(account.version))
            .exec(&self.txn)
            .await?;
        if result.rows_affected == 0 {
            return Err(LedgerError::Conflict("player account"));
        }
        Ok(())
    }

    async fn load_duel(&mut self, duel_id: DuelId) -> Result<Option<DuelRecord>, LedgerError> {
        let record = duels::Entity::find_by_id(duel_id).one(&self.txn).await?;
        record.map(duel_from_model).transpose()
    }

    async fn insert_duel(&mut self, record: &DuelRecord) -> Result<(), LedgerError> {
        let model = duels::ActiveModel {
            id: Set(record.id),
            participant_a: Set(player_to_db(record.participant_a)?),
            participant_b: Set(player_to_db(record.participant_b)?),
            wager: Set(coins_to_db(record.wager)?),
            status: Set(status_to_db(record.status)),
            winner: Set(record.winner.map(player_to_db).transpose()?),
            created_at: Set(record.created_at.into()),
            resolved_at: Set(record.resolved_at.map(Into::into)),
            version: Set(record.version),
        };
        model.insert(&self.txn).await?;
        Ok(())
    }

    async fn save_duel(&mut self, record: &DuelRecord) -> Result<(), LedgerError> {
        let resolved_at: Option<sea_orm::prelude::DateTimeWithTimeZone> =
            record.resolved_at.map(Into::into);
        let result = duels::Entity::update_many()
            .col_expr(duels::Column::Status, status_to_db(record.status).as_enum())
            .col_expr(
                duels::Column::Winner,
                Expr::value(record.winner.map(player_to_db).transpose()?),
            )
            .col_expr(duels::Column::ResolvedAt, Expr::value(resolved_at))
            .col_expr(duels::Column::Version, Expr::value(record.version + 1))
            .filter(duels::Column::Id.eq(record.id))
            .filter(duels::Column::Version.eq(record.version))
            .exec(&self.txn)
            .await?;
        if result.rows_affected == 0 {
            return Err(LedgerError::Conflict("duel record"));
        }
        Ok(())
    }

    async fn find_open_duel(
        &mut self,
        player_id: PlayerId,
    ) -> Result<Option<DuelRecord>, LedgerError> {
        let db_id = player_to_db(player_id)?;
        let record = duels::Entity::find()
            .filter(
                Condition::any()
                    .add(duels::Column::ParticipantA.eq(db_id))
                    .add(duels::Column::ParticipantB.eq(db_id)),
            )
            .filter(duels::Column::Status.is_in([DbDuelStatus::Pending, DbDuelStatus::Active]))
            .one(&self.txn)
            .await?;
        record.map(duel_from_model).transpose()
    }

    async fn duels_with_status(
        &mut self,
        status: DuelStatus,
        limit: u64,
    ) -> Result<Vec<DuelRecord>, LedgerError> {
        let rows = duels::Entity::find()
            .filter(duels::Column::Status.eq(status_to_db(status)))
            .order_by_asc(duels::Column::CreatedAt)
            .limit(limit)
            .all(&self.txn)
            .await?;
        rows.into_iter().map(duel_from_model).collect()
    }

    async fn duels_for_player(
        &mut self,
        player_id: PlayerId,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<DuelRecord>, LedgerError> {
        let db_id = player_to_db(player_id)?;
        let rows = duels::Entity::find()
            .filter(
                Condition::any()
                    .add(duels::Column::ParticipantA.eq(db_id))
                    .add(duels::Column::ParticipantB.eq(db_id)),
            )
            .order_by_desc(duels::Column::CreatedAt)
            .order_by_asc(duels::Column::Id)
            .offset(offset)
            .limit(limit)
            .all(&self.txn)
            .await?;
        rows.into_iter().map(duel_from_model).collect()
    }

    async fn count_duels_for_player(&mut self, player_id: PlayerId) -> Result<u64, LedgerError> {
        let db_id = player_to_db(player_id)?;
        let count = duels::Entity::find()
            .filter(
                Condition::any()
                    .add(duels::Column::ParticipantA.eq(db_id))
                    .add(duels::Column::ParticipantB.eq(db_id)),
            )
            .count(&self.txn)
            .await?;
        Ok(count)
    }

    async fn insert_lock(&mut self, lock: &WagerLock) -> Result<(), LedgerError> {
        let model = wager_locks::ActiveModel {
            duel_id: Set(lock.duel_id),
            player_id: Set(player_to_db(lock.player_id)?),
            amount: Set(coins_to_db(lock.amount)?),
            locked_at: Set(lock.locked_at.into()),
        };
        model.insert(&self.txn).await?;
        Ok(())
    }

    async fn load_locks(&mut self, duel_id: DuelId) -> Result<Vec<WagerLock>, LedgerError> {
        let rows = wager_locks::Entity::find()
            .filter(wager_locks::Column::DuelId.eq(duel_id))
            .order_by_asc(wager_locks::Column::PlayerId)
            .all(&self.txn)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(WagerLock {
                    duel_id: row.duel_id,
                    player_id: player_from_db(row.player_id)?,
                    amount: coins_from_db(row.amount)?,
                    locked_at: to_utc(row.locked_at),
                })
            })
            .collect()
    }

    async fn delete_locks(&mut self, duel_id: DuelId) -> Result<u64, LedgerError> {
        let result = wager_locks::Entity::delete_many()
            .filter(wager_locks::Column::DuelId.eq(duel_id))
            .exec(&self.txn)
            .await?;
        Ok(result.rows_affected)
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        self.txn.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) {
        let _ = self.txn.rollback().await;
    }
}

fn player_to_db(id: PlayerId) -> Result<i64, LedgerError> {
    i64::try_from(id).map_err(|_| LedgerError::validation("player id overflow"))
}

fn player_from_db(id: i64) -> Result<PlayerId, LedgerError> {
    PlayerId::try_from(id).map_err(|_| LedgerError::validation("negative player id"))
}

fn coins_to_db(value: Coins) -> Result<i64, LedgerError> {
    value
        .try_into()
        .map_err(|_| LedgerError::validation("coin amount exceeds database range"))
}

fn coins_from_db(value: i64) -> Result<Coins, LedgerError> {
    value
        .try_into()
        .map_err(|_| LedgerError::validation("negative coin amount"))
}

fn to_utc(value: sea_orm::prelude::DateTimeWithTimeZone) -> DateTime<Utc> {
    value.with_timezone(&Utc)
}

fn status_to_db(status: DuelStatus) -> DbDuelStatus {
    match status {
        DuelStatus::Pending => DbDuelStatus::Pending,
        DuelStatus::Active => DbDuelStatus::Active,
        DuelStatus::Resolved => DbDuelStatus::Resolved,
        DuelStatus::Cancelled => DbDuelStatus::Cancelled,
    }
}

fn status_from_db(status: DbDuelStatus) -> DuelStatus {
    match status {
        DbDuelStatus::Pending => DuelStatus::Pending,
        DbDuelStatus::Active => DuelStatus::Active,
        DbDuelStatus::Resolved => DuelStatus::Resolved,
        DbDuelStatus::Cancelled => DuelStatus::Cancelled,
    }
}

fn account_from_model(model: player_accounts::Model) -> Result<PlayerAccount, LedgerError> {
    Ok(PlayerAccount {
        player_id: player_from_db(model.player_id)?,
        balance: coins_from_db(model.balance)?,
        level: u32::try_from(model.level).map_err(|_| LedgerError::validation("negative level"))?,
        version: model.version,
    })
}

fn duel_from_model(model: duels::Model) -> Result<DuelRecord, LedgerError> {
    Ok(DuelRecord {
        id: model.id,
        participant_a: player_from_db(model.participant_a)?,
        participant_b: player_from_db(model.participant_b)?,
        wager: coins_from_db(model.wager)?,
        status: status_from_db(model.status),
        winner: model.winner.map(player_from_db).transpose()?,
        created_at: to_utc(model.created_at),
        resolved_at: model.resolved_at.map(to_utc),
        version: model.version,
    })
}
