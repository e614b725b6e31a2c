use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::engine::duel::{DuelId, PlayerId};
use crate::ledger::error::LedgerError;
use crate::ledger::types::{DuelRecord, DuelStatus, PlayerAccount, WagerLock};

use super::{LedgerStorage, LedgerStorageTxn};

#[derive(Default)]
struct Inner {
    accounts: HashMap<PlayerId, PlayerAccount>,
    duels: HashMap<DuelId, DuelRecord>,
    locks: BTreeMap<(DuelId, PlayerId), WagerLock>,
}

enum Staged<T> {
    Insert(T),
    Update { expected: i64, row: T },
}

impl<T> Staged<T> {
    fn row(&self) -> &T {
        match self {
            Staged::Insert(row) | Staged::Update { row, .. } => row,
        }
    }
}

/// Process-local ledger; writes are staged per transaction and validated
/// against the committed versions before they are applied.
pub struct InMemoryLedgerStorage {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryLedgerStorage {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }
}

impl Default for InMemoryLedgerStorage {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InMemoryLedgerTxn {
    inner: Arc<RwLock<Inner>>,
    accounts: HashMap<PlayerId, Staged<PlayerAccount>>,
    duels: HashMap<DuelId, Staged<DuelRecord>>,
    new_locks: Vec<WagerLock>,
    deleted_locks: HashSet<DuelId>,
}

#[async_trait]
impl LedgerStorage for InMemoryLedgerStorage {
    async fn begin(&self) -> Result<Box<dyn LedgerStorageTxn>, LedgerError> {
        Ok(Box::new(InMemoryLedgerTxn {
            inner: Arc::clone(&self.inner),
            accounts: HashMap::new(),
            duels: HashMap::new(),
            new_locks: Vec::new(),
            deleted_locks: HashSet::new(),
        }))
    }
}

impl InMemoryLedgerTxn {
    fn visible_account(&self, player_id: PlayerId) -> Option<PlayerAccount> {
        match self.accounts.get(&player_id) {
            Some(staged) => Some(staged.row().clone()),
            None => self.inner.read().accounts.get(&player_id).cloned(),
        }
    }

    fn visible_duel(&self, duel_id: DuelId) -> Option<DuelRecord> {
        match self.duels.get(&duel_id) {
            Some(staged) => Some(staged.row().clone()),
            None => self.inner.read().duels.get(&duel_id).cloned(),
        }
    }

    fn visible_duels(&self) -> Vec<DuelRecord> {
        let inner = self.inner.read();
        let mut rows: Vec<DuelRecord> = inner
            .duels
            .values()
            .filter(|row| !self.duels.contains_key(&row.id))
            .cloned()
            .collect();
        rows.extend(self.duels.values().map(|staged| staged.row().clone()));
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        rows
    }

    fn visible_locks(&self, duel_id: DuelId) -> Vec<WagerLock> {
        let mut locks = Vec::new();
        if !self.deleted_locks.contains(&duel_id) {
            let inner = self.inner.read();
            locks.extend(
                inner
                    .locks
                    .values()
                    .filter(|lock| lock.duel_id == duel_id)
                    .cloned(),
            );
        }
        locks.extend(
            self.new_locks
                .iter()
                .filter(|lock| lock.duel_id == duel_id)
                .cloned(),
        );
        locks
    }
}

fn stage_update<K, T>(
    staged: &mut HashMap<K, Staged<T>>,
    key: K,
    committed_version: Option<i64>,
    read_version: i64,
    mut row: T,
    set_version: impl Fn(&mut T, i64),
    what: &'static str,
) -> Result<(), LedgerError>
where
    K: std::hash::Hash + Eq,
{
    let next_version = read_version + 1;
    set_version(&mut row, next_version);
    match staged.remove(&key) {
        Some(Staged::Insert(_)) => {
            staged.insert(key, Staged::Insert(row));
        }
        Some(Staged::Update { expected, .. }) => {
            staged.insert(key, Staged::Update { expected, row });
        }
        None => {
            if committed_version != Some(read_version) {
                return Err(LedgerError::Conflict(what));
            }
            staged.insert(
                key,
                Staged::Update {
                    expected: read_version,
                    row,
                },
            );
        }
    }
    Ok(())
}

#[async_trait]
impl LedgerStorageTxn for InMemoryLedgerTxn {
    async fn load_account(
        &mut self,
        player_id: PlayerId,
    ) -> Result<Option<PlayerAccount>, LedgerError> {
        Ok(self.visible_account(player_id))
    }

    async fn insert_account(&mut self, account: &PlayerAccount) -> Result<(), LedgerError> {
        if self.visible_account(account.player_id).is_some() {
            return Err(LedgerError::Conflict("player account"));
        }
        self.accounts
            .insert(account.player_id, Staged::Insert(account.clone()));
        Ok(())
    }

    async fn save_account(&mut self, account: &PlayerAccount) -> Result<(), LedgerError> {
        let Some(visible) = self.visible_account(account.player_id) else {
            return Err(LedgerError::NotFound("player account"));
        };
        if visible.version != account.version {
            return Err(LedgerError::Conflict("player account"));
        }
        let committed = self
            .inner
            .read()
            .accounts
            .get(&account.player_id)
            .map(|row| row.version);
        stage_update(
            &mut self.accounts,
            account.player_id,
            committed,
            account.version,
            account.clone(),
            |row, version| row.version = version,
            "player account",
        )
    }

    async fn load_duel(&mut self, duel_id: DuelId) -> Result<Option<DuelRecord>, LedgerError> {
        Ok(self.visible_duel(duel_id))
    }

    async fn insert_duel(&mut self, record: &DuelRecord) -> Result<(), LedgerError> {
        if self.visible_duel(record.id).is_some() {
            return Err(LedgerError::Conflict("duel record"));
        }
        self.duels.insert(record.id, Staged::Insert(record.clone()));
        Ok(())
    }

    async fn save_duel(&mut self, record: &DuelRecord) -> Result<(), LedgerError> {
        let Some(visible) = self.visible_duel(record.id) else {
            return Err(LedgerError::NotFound("duel record"));
        };
        if visible.version != record.version {
            return Err(LedgerError::Conflict("duel record"));
        }
        let committed = self
            .inner
            .read()
            .duels
            .get(&record.id)
            .map(|row| row.version);
        stage_update(
            &mut self.duels,
            record.id,
            committed,
            record.version,
            record.clone(),
            |row, version| row.version = version,
            "duel record",
        )
    }

    async fn find_open_duel(
        &mut self,
        player_id: PlayerId,
    ) -> Result<Option<DuelRecord>, LedgerError> {
        Ok(self
            .visible_duels()
            .into_iter()
            .find(|row| row.involves(player_id) && !row.status.is_final()))
    }

    async fn duels_with_status(
        &mut self,
        status: DuelStatus,
        limit: u64,
    ) -> Result<Vec<DuelRecord>, LedgerError> {
        let mut rows: Vec<DuelRecord> = self
            .visible_duels()
            .into_iter()
            .filter(|row| row.status == status)
            .collect();
        // sweeps look at the oldest first
        rows.reverse();
        rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(rows)
    }

    async fn duels_for_player(
        &mut self,
        player_id: PlayerId,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<DuelRecord>, LedgerError> {
        Ok(self
            .visible_duels()
            .into_iter()
            .filter(|row| row.involves(player_id))
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .collect())
    }

    async fn count_duels_for_player(&mut self, player_id: PlayerId) -> Result<u64, LedgerError> {
        Ok(self
            .visible_duels()
            .iter()
            .filter(|row| row.involves(player_id))
            .count() as u64)
    }

    async fn insert_lock(&mut self, lock: &WagerLock) -> Result<(), LedgerError> {
        if self
            .visible_locks(lock.duel_id)
            .iter()
            .any(|existing| existing.player_id == lock.player_id)
        {
            return Err(LedgerError::Conflict("wager lock"));
        }
        self.new_locks.push(lock.clone());
        Ok(())
    }

    async fn load_locks(&mut self, duel_id: DuelId) -> Result<Vec<WagerLock>, LedgerError> {
        Ok(self.visible_locks(duel_id))
    }

    async fn delete_locks(&mut self, duel_id: DuelId) -> Result<u64, LedgerError> {
        let removed = self.visible_locks(duel_id).len() as u64;
        self.new_locks.retain(|lock| lock.duel_id != duel_id);
        self.deleted_locks.insert(duel_id);
        Ok(removed)
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        let this = *self;
        let mut inner = this.inner.write();

        for (player_id, staged) in &this.accounts {
            let current = inner.accounts.get(player_id).map(|row| row.version);
            match staged {
                Staged::Insert(_) if current.is_some() => {
                    return Err(LedgerError::Conflict("player account"))
                }
                Staged::Update { expected, .. } if current != Some(*expected) => {
                    return Err(LedgerError::Conflict("player account"))
                }
                _ => {}
            }
        }
        for (duel_id, staged) in &this.duels {
            let current = inner.duels.get(duel_id).map(|row| row.version);
            match staged {
                Staged::Insert(_) if current.is_some() => {
                    return Err(LedgerError::Conflict("duel record"))
                }
                Staged::Update { expected, .. } if current != Some(*expected) => {
                    return Err(LedgerError::Conflict("duel record"))
                }
                _ => {}
            }
        }
        for lock in &this.new_locks {
            let key = (lock.duel_id, lock.player_id);
            if inner.locks.contains_key(&key) && !this.deleted_locks.contains(&lock.duel_id) {
                return Err(LedgerError::Conflict("wager lock"));
            }
        }

        for (player_id, staged) in this.accounts {
            let row = match staged {
                Staged::Insert(row) | Staged::Update { row, .. } => row,
            };
            inner.accounts.insert(player_id, row);
        }
        for (duel_id, staged) in this.duels {
            let row = match staged {
                Staged::Insert(row) | Staged::Update { row, .. } => row,
            };
            inner.duels.insert(duel_id, row);
        }
        for duel_id in &this.deleted_locks {
            inner.locks.retain(|(id, _), _| id != duel_id);
        }
        for lock in this.new_locks {
            inner.locks.insert((lock.duel_id, lock.player_id), lock);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) {}
}
