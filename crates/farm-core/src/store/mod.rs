//! Storage seams consumed by the engine.
//!
//! The engine never touches persistence directly. Implementations own their
//! transactional discipline; the one hard requirement is that
//! [`LedgerStore::commit_entry`] changes the balance and appends the entry as a
//! single all-or-nothing unit.

use crate::{Account, AccountId, LedgerEntry, NewEntry, Position, PositionId, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod memory;

pub use memory::{Book, MemoryStore};

/// Account lookups.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self, id: AccountId) -> Result<Option<Account>>;
}

/// Farming and boost positions.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// One page of active positions ordered by id, strictly after `after`.
    ///
    /// Restartable: feeding back the last id of a page yields the next page.
    async fn list_active_positions(
        &self,
        after: Option<PositionId>,
        limit: usize,
    ) -> Result<Vec<Position>>;

    /// Move `last_update` from `expected` to `to`.
    ///
    /// Returns `false` without writing when the stored value is no longer
    /// `expected` or when `to` would move it backwards.
    async fn advance_last_update(
        &self,
        id: PositionId,
        expected: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<bool>;

    async fn deactivate_position(&self, id: PositionId) -> Result<()>;
}

/// Outcome of an atomic ledger commit.
#[derive(Clone, Debug, PartialEq)]
pub enum CommitOutcome {
    /// Entry appended and balance changed.
    Written(LedgerEntry),
    /// An entry with the same dedup key already exists; nothing changed.
    Duplicate(LedgerEntry),
}

impl CommitOutcome {
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            CommitOutcome::Written(entry) | CommitOutcome::Duplicate(entry) => entry,
        }
    }

    pub fn into_entry(self) -> LedgerEntry {
        match self {
            CommitOutcome::Written(entry) | CommitOutcome::Duplicate(entry) => entry,
        }
    }
}

/// Append-only ledger tied to account balances.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Atomically apply `entry.amount` to the account balance and append the
    /// entry.
    ///
    /// Implementations must:
    /// - re-check `dedup_key` inside the same unit and report a match as
    ///   `Duplicate` without writing
    /// - refuse any change that would leave the balance negative
    /// - leave no trace on failure
    async fn commit_entry(&self, entry: NewEntry) -> Result<CommitOutcome>;

    async fn find_by_dedup_key(&self, key: &str) -> Result<Option<LedgerEntry>>;

    /// Every entry for `account`, in insertion order.
    async fn entries_for(&self, account: AccountId) -> Result<Vec<LedgerEntry>>;
}

/// Upward referral edges.
#[async_trait]
pub trait ReferralStore: Send + Sync {
    async fn get_referrer(&self, account: AccountId) -> Result<Option<AccountId>>;
}
