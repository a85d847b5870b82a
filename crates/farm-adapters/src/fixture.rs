//! JSON seed files for demos and local runs.
//!
//! ```json
//! {
//!   "accounts": [
//!     { "id": 1, "referrer": null, "referral_code": "alice", "created_at": "2024-01-01T00:00:00Z" }
//!   ],
//!   "positions": [
//!     { "id": 1, "owner": 1, "kind": "farming", "currency": "USDT", "deposit": "100",
//!       "daily_rate": "0.01", "last_update": "2024-01-01T00:00:00Z", "active": true }
//!   ]
//! }
//! ```
//!
//! Accounts may be listed in any order; they are inserted referrers-first.

use crate::journal::JournalStore;
use farm_core::store::{Book, MemoryStore};
use farm_core::{Account, AccountId, FarmError, Position, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FarmSeed {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub positions: Vec<Position>,
}

impl FarmSeed {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            FarmError::InvalidInput(format!("failed to read seed {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            FarmError::InvalidInput(format!("failed to parse seed {}: {e}", path.display()))
        })
    }

    /// Accounts ordered so every referrer precedes its referees.
    ///
    /// Fails when some account's referrer is neither in the seed nor in
    /// `known`, or when the referral edges form a cycle.
    fn ordered_accounts(&self, known: impl Fn(AccountId) -> bool) -> Result<Vec<Account>> {
        let mut pending: Vec<Account> = self.accounts.clone();
        let mut ordered: Vec<Account> = Vec::with_capacity(pending.len());

        while !pending.is_empty() {
            let before = pending.len();
            let mut rest = Vec::with_capacity(before);
            for account in pending {
                let ready = match account.referrer {
                    None => true,
                    Some(referrer) => ordered.iter().any(|a| a.id == referrer) || known(referrer),
                };
                if ready {
                    ordered.push(account);
                } else {
                    rest.push(account);
                }
            }
            if rest.len() == before {
                let ids: Vec<String> = rest.iter().map(|a| a.id.to_string()).collect();
                return Err(FarmError::InvalidInput(format!(
                    "seed accounts with unknown or cyclic referrers: {}",
                    ids.join(", ")
                )));
            }
            pending = rest;
        }
        Ok(ordered)
    }

    pub fn into_book(self) -> Result<Book> {
        let mut book = Book::new();
        for account in self.ordered_accounts(|_| false)? {
            book.insert_account(account)?;
        }
        for position in self.positions {
            book.insert_position(position)?;
        }
        Ok(book)
    }

    pub fn into_memory_store(self) -> Result<MemoryStore> {
        let accounts = self.accounts.len();
        let positions = self.positions.len();
        let store = MemoryStore::from_book(self.into_book()?);
        info!(accounts, positions, "Seed loaded into memory store");
        Ok(store)
    }

    /// Add seed records missing from `journal`. Records whose id already
    /// exists are left untouched, so seeding twice is harmless.
    pub fn apply_to_journal(&self, journal: &JournalStore) -> Result<(usize, usize)> {
        let current = journal.snapshot()?;
        let mut added_accounts = 0;
        for account in self.ordered_accounts(|id| current.account(id).is_some())? {
            if current.account(account.id).is_none() {
                journal.insert_account(account)?;
                added_accounts += 1;
            }
        }

        let mut added_positions = 0;
        for position in &self.positions {
            if current.position(position.id).is_none() {
                journal.insert_position(position.clone())?;
                added_positions += 1;
            }
        }
        info!(
            path = %journal.path().display(),
            accounts = added_accounts,
            positions = added_positions,
            "Seed applied to journal"
        );
        Ok((added_accounts, added_positions))
    }
}
