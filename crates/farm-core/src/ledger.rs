//! Ledger / balance updater.
//!
//! The single choke point for balance changes. Every change goes through
//! [`LedgerStore::commit_entry`], which moves the balance and appends the entry
//! together, so `balance == Σ ledger` holds after every successful call.

use crate::clock::Clock;
use crate::store::{AccountStore, CommitOutcome, LedgerStore};
use crate::{
    AccountId, Currency, EntryType, FarmError, LedgerEntry, NewEntry, Result, LEDGER_SCALE,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A balance change requested by the engine or an outside caller.
#[derive(Clone, Debug, PartialEq)]
pub struct CreditRequest {
    pub account: AccountId,
    /// Always positive; `debit` negates it.
    pub amount: Decimal,
    pub currency: Currency,
    pub entry_type: EntryType,
    pub source_account: Option<AccountId>,
    pub dedup_key: Option<String>,
    pub referral_level: Option<u8>,
    /// Timestamp recorded on the entry; the clock's `now` when unset.
    pub occurred_at: Option<DateTime<Utc>>,
}

impl CreditRequest {
    pub fn new(
        account: AccountId,
        amount: Decimal,
        currency: Currency,
        entry_type: EntryType,
    ) -> Self {
        Self {
            account,
            amount,
            currency,
            entry_type,
            source_account: None,
            dedup_key: None,
            referral_level: None,
            occurred_at: None,
        }
    }

    pub fn with_source(mut self, source: AccountId) -> Self {
        self.source_account = Some(source);
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.referral_level = Some(level);
        self
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(occurred_at);
        self
    }
}

pub use crate::store::CommitOutcome as CreditOutcome;

/// Mismatch between a cached balance and its ledger sum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BalanceDrift {
    pub account: AccountId,
    pub currency: Currency,
    pub cached: Decimal,
    pub ledger_sum: Decimal,
}

pub struct LedgerUpdater {
    ledger: Arc<dyn LedgerStore>,
    accounts: Arc<dyn AccountStore>,
    clock: Arc<dyn Clock>,
}

impl LedgerUpdater {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        accounts: Arc<dyn AccountStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            accounts,
            clock,
        }
    }

    /// Credit `request.amount` to the account.
    ///
    /// A request whose dedup key was already recorded is a no-op success and
    /// returns the original entry as [`CreditOutcome::Duplicate`].
    pub async fn credit(&self, request: CreditRequest) -> Result<CreditOutcome> {
        Self::check_request(&request)?;
        if !request.entry_type.is_credit() {
            return Err(FarmError::InvalidInput(format!(
                "{} is not a credit entry type",
                request.entry_type
            )));
        }
        self.commit(request, false).await
    }

    /// Debit `request.amount` (withdrawals, purchases). Refuses to overdraw.
    pub async fn debit(&self, request: CreditRequest) -> Result<CreditOutcome> {
        Self::check_request(&request)?;
        if request.entry_type.is_credit() {
            return Err(FarmError::InvalidInput(format!(
                "{} is not a debit entry type",
                request.entry_type
            )));
        }

        if let Some(existing) = self.existing(&request).await? {
            return Ok(CreditOutcome::Duplicate(existing));
        }

        let account = self
            .accounts
            .get_account(request.account)
            .await?
            .ok_or(FarmError::AccountNotFound(request.account))?;
        let available = account.balance(&request.currency);
        if available < request.amount {
            return Err(FarmError::InsufficientBalance {
                account: request.account,
                currency: request.currency,
                available,
                requested: request.amount,
            });
        }

        self.commit(request, true).await
    }

    fn check_request(request: &CreditRequest) -> Result<()> {
        if request.amount <= Decimal::ZERO || request.amount.scale() > LEDGER_SCALE {
            return Err(FarmError::InvalidAmount(request.amount));
        }
        if request.currency.as_str().is_empty() {
            return Err(FarmError::InvalidInput("currency must not be empty".into()));
        }
        Ok(())
    }

    async fn existing(&self, request: &CreditRequest) -> Result<Option<LedgerEntry>> {
        match request.dedup_key.as_deref() {
            Some(key) => self.ledger.find_by_dedup_key(key).await,
            None => Ok(None),
        }
    }

    async fn commit(&self, request: CreditRequest, negate: bool) -> Result<CreditOutcome> {
        if let Some(existing) = self.existing(&request).await? {
            debug!(
                account = %request.account,
                key = ?request.dedup_key,
                entry = %existing.id,
                "Dedup key already recorded, skipping"
            );
            return Ok(CreditOutcome::Duplicate(existing));
        }

        let entry_type = request.entry_type;
        let account = request.account;
        let amount = if negate {
            -request.amount
        } else {
            request.amount
        };

        let outcome = self
            .ledger
            .commit_entry(NewEntry {
                account,
                entry_type,
                amount,
                currency: request.currency,
                created_at: request.occurred_at.unwrap_or_else(|| self.clock.now()),
                source_account: request.source_account,
                dedup_key: request.dedup_key,
                referral_level: request.referral_level,
            })
            .await
            .map_err(|e| {
                warn!(%account, %entry_type, %amount, error = %e, "Ledger commit failed");
                e
            })?;

        match &outcome {
            CommitOutcome::Written(entry) => {
                debug!(
                    %account,
                    %entry_type,
                    amount = %entry.amount,
                    currency = %entry.currency,
                    entry = %entry.id,
                    "Ledger entry written"
                );
            }
            CommitOutcome::Duplicate(entry) => {
                info!(%account, entry = %entry.id, "Concurrent duplicate resolved by store");
            }
        }
        Ok(outcome)
    }

    /// Recompute the ledger sums for `account` and report every currency whose
    /// cached balance disagrees. Read-only.
    pub async fn audit_account(&self, account: AccountId) -> Result<Vec<BalanceDrift>> {
        let cached = self
            .accounts
            .get_account(account)
            .await?
            .ok_or(FarmError::AccountNotFound(account))?;
        let entries = self.ledger.entries_for(account).await?;

        let mut sums: BTreeMap<Currency, Decimal> = BTreeMap::new();
        for entry in &entries {
            *sums.entry(entry.currency.clone()).or_insert(Decimal::ZERO) += entry.amount;
        }

        let mut drift = Vec::new();
        let currencies: std::collections::BTreeSet<&Currency> =
            sums.keys().chain(cached.balances.keys()).collect();
        for currency in currencies {
            let ledger_sum = sums.get(currency).copied().unwrap_or(Decimal::ZERO);
            let balance = cached.balance(currency);
            if balance != ledger_sum {
                warn!(%account, %currency, %balance, %ledger_sum, "Balance drift detected");
                drift.push(BalanceDrift {
                    account,
                    currency: currency.clone(),
                    cached: balance,
                    ledger_sum,
                });
            }
        }
        Ok(drift)
    }
}
