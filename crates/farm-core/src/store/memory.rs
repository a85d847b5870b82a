//! In-memory store.
//!
//! [`Book`] holds the raw state and enforces the ledger rules; [`MemoryStore`]
//! puts one lock around it so every commit is atomic. Persistent adapters reuse
//! `Book` as their working set.

use super::{AccountStore, CommitOutcome, LedgerStore, PositionStore, ReferralStore};
use crate::{
    Account, AccountId, EntryId, FarmError, LedgerEntry, NewEntry, Position, PositionId, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// Plain farm state: accounts, positions and the ledger.
#[derive(Clone, Debug, Default)]
pub struct Book {
    accounts: BTreeMap<AccountId, Account>,
    positions: BTreeMap<PositionId, Position>,
    entries: Vec<LedgerEntry>,
    dedup: HashMap<String, usize>,
    next_entry_id: u64,
}

/// Result of checking an entry against the book without applying it.
#[derive(Clone, Debug, PartialEq)]
pub enum Prepared {
    Fresh(LedgerEntry),
    Duplicate(LedgerEntry),
}

impl Book {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account. Its referrer must already exist, which keeps the
    /// referral graph acyclic by construction.
    pub fn insert_account(&mut self, mut account: Account) -> Result<()> {
        if self.accounts.contains_key(&account.id) {
            return Err(FarmError::InvalidInput(format!(
                "account {} already exists",
                account.id
            )));
        }
        if let Some(referrer) = account.referrer {
            if referrer == account.id || !self.accounts.contains_key(&referrer) {
                return Err(FarmError::InvalidInput(format!(
                    "referrer {} of account {} is unknown",
                    referrer, account.id
                )));
            }
        }
        // Balances only ever come from ledger entries.
        account.balances.clear();
        self.accounts.insert(account.id, account);
        Ok(())
    }

    pub fn insert_position(&mut self, position: Position) -> Result<()> {
        if !self.accounts.contains_key(&position.owner) {
            return Err(FarmError::AccountNotFound(position.owner));
        }
        if self.positions.contains_key(&position.id) {
            return Err(FarmError::InvalidInput(format!(
                "position {} already exists",
                position.id
            )));
        }
        self.positions.insert(position.id, position);
        Ok(())
    }

    pub fn account(&self, id: AccountId) -> Option<&Account> {
        self.accounts.get(&id)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    pub fn position(&self, id: PositionId) -> Option<&Position> {
        self.positions.get(&id)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn referrer_of(&self, id: AccountId) -> Option<AccountId> {
        self.accounts.get(&id).and_then(|a| a.referrer)
    }

    pub fn find_by_dedup_key(&self, key: &str) -> Option<&LedgerEntry> {
        self.dedup.get(key).map(|&idx| &self.entries[idx])
    }

    pub fn entries_for(&self, account: AccountId) -> Vec<LedgerEntry> {
        self.entries
            .iter()
            .filter(|e| e.account == account)
            .cloned()
            .collect()
    }

    /// Check `entry` against the ledger rules and assign its id, without
    /// changing anything.
    pub fn prepare_entry(&self, entry: NewEntry) -> Result<Prepared> {
        if let Some(key) = entry.dedup_key.as_deref() {
            if let Some(existing) = self.find_by_dedup_key(key) {
                return Ok(Prepared::Duplicate(existing.clone()));
            }
        }

        if entry.amount.is_zero() {
            return Err(FarmError::InvalidAmount(entry.amount));
        }

        let account = self
            .accounts
            .get(&entry.account)
            .ok_or(FarmError::AccountNotFound(entry.account))?;

        let available = account.balance(&entry.currency);
        let next = available
            .checked_add(entry.amount)
            .ok_or(FarmError::InvalidAmount(entry.amount))?;
        if next < Decimal::ZERO {
            return Err(FarmError::InsufficientBalance {
                account: entry.account,
                currency: entry.currency,
                available,
                requested: -entry.amount,
            });
        }

        Ok(Prepared::Fresh(entry.into_entry(EntryId(self.next_entry_id + 1))))
    }

    /// Apply an entry produced by [`Book::prepare_entry`] or replayed from a
    /// journal. Ids must be strictly increasing.
    pub fn apply_entry(&mut self, entry: LedgerEntry) -> Result<()> {
        if entry.id.0 <= self.next_entry_id {
            return Err(FarmError::InvalidInput(format!(
                "entry id {} is not after {}",
                entry.id, self.next_entry_id
            )));
        }
        if let Some(key) = entry.dedup_key.as_deref() {
            if self.dedup.contains_key(key) {
                return Err(FarmError::InvalidInput(format!(
                    "dedup key {key} already applied"
                )));
            }
        }

        let account = self
            .accounts
            .get_mut(&entry.account)
            .ok_or(FarmError::AccountNotFound(entry.account))?;
        let available = account.balance(&entry.currency);
        let next = available
            .checked_add(entry.amount)
            .ok_or(FarmError::InvalidAmount(entry.amount))?;
        if next < Decimal::ZERO {
            return Err(FarmError::InsufficientBalance {
                account: entry.account,
                currency: entry.currency,
                available,
                requested: -entry.amount,
            });
        }
        account.balances.insert(entry.currency.clone(), next);

        self.next_entry_id = entry.id.0;
        if let Some(key) = entry.dedup_key.clone() {
            self.dedup.insert(key, self.entries.len());
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn commit_entry(&mut self, entry: NewEntry) -> Result<CommitOutcome> {
        match self.prepare_entry(entry)? {
            Prepared::Duplicate(existing) => Ok(CommitOutcome::Duplicate(existing)),
            Prepared::Fresh(entry) => {
                self.apply_entry(entry.clone())?;
                Ok(CommitOutcome::Written(entry))
            }
        }
    }

    pub fn active_positions(&self, after: Option<PositionId>, limit: usize) -> Vec<Position> {
        let start = after.map_or(PositionId(0), |id| PositionId(id.0.saturating_add(1)));
        if after.map_or(false, |id| id.0 == u64::MAX) {
            return Vec::new();
        }
        self.positions
            .range(start..)
            .map(|(_, p)| p)
            .filter(|p| p.active)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn advance_last_update(
        &mut self,
        id: PositionId,
        expected: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<bool> {
        let position = self
            .positions
            .get_mut(&id)
            .ok_or_else(|| FarmError::InvalidInput(format!("position {id} not found")))?;
        if position.last_update != expected || to < expected {
            return Ok(false);
        }
        position.last_update = to;
        Ok(true)
    }

    pub fn deactivate_position(&mut self, id: PositionId) -> Result<()> {
        let position = self
            .positions
            .get_mut(&id)
            .ok_or_else(|| FarmError::InvalidInput(format!("position {id} not found")))?;
        position.active = false;
        Ok(())
    }

    /// Per-currency sums of the ledger for `account`.
    pub fn ledger_totals(&self, account: AccountId) -> BTreeMap<crate::Currency, Decimal> {
        let mut totals = BTreeMap::new();
        for entry in self.entries.iter().filter(|e| e.account == account) {
            *totals.entry(entry.currency.clone()).or_insert(Decimal::ZERO) += entry.amount;
        }
        totals
    }
}

/// Thread-safe in-memory store for tests, demos and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    book: RwLock<Book>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_book(book: Book) -> Self {
        Self {
            book: RwLock::new(book),
        }
    }

    pub fn insert_account(&self, account: Account) -> Result<()> {
        self.write(|book| book.insert_account(account))
    }

    pub fn insert_position(&self, position: Position) -> Result<()> {
        self.write(|book| book.insert_position(position))
    }

    /// Clone of the current state.
    pub fn snapshot(&self) -> Result<Book> {
        self.read(|book| Ok(book.clone()))
    }

    pub fn read<T>(&self, f: impl FnOnce(&Book) -> Result<T>) -> Result<T> {
        let book = self
            .book
            .read()
            .map_err(|_| FarmError::Storage("memory store lock poisoned".into()))?;
        f(&book)
    }

    pub fn write<T>(&self, f: impl FnOnce(&mut Book) -> Result<T>) -> Result<T> {
        let mut book = self
            .book
            .write()
            .map_err(|_| FarmError::Storage("memory store lock poisoned".into()))?;
        f(&mut book)
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        self.read(|book| Ok(book.account(id).cloned()))
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn list_active_positions(
        &self,
        after: Option<PositionId>,
        limit: usize,
    ) -> Result<Vec<Position>> {
        self.read(|book| Ok(book.active_positions(after, limit)))
    }

    async fn advance_last_update(
        &self,
        id: PositionId,
        expected: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<bool> {
        self.write(|book| book.advance_last_update(id, expected, to))
    }

    async fn deactivate_position(&self, id: PositionId) -> Result<()> {
        self.write(|book| book.deactivate_position(id))
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn commit_entry(&self, entry: NewEntry) -> Result<CommitOutcome> {
        self.write(|book| book.commit_entry(entry))
    }

    async fn find_by_dedup_key(&self, key: &str) -> Result<Option<LedgerEntry>> {
        self.read(|book| Ok(book.find_by_dedup_key(key).cloned()))
    }

    async fn entries_for(&self, account: AccountId) -> Result<Vec<LedgerEntry>> {
        self.read(|book| Ok(book.entries_for(account)))
    }
}

#[async_trait]
impl ReferralStore for MemoryStore {
    async fn get_referrer(&self, account: AccountId) -> Result<Option<AccountId>> {
        self.read(|book| Ok(book.referrer_of(account)))
    }
}
