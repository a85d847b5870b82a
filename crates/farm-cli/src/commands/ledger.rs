//! `farmd ledger` command implementations

use anyhow::{bail, Result};
use clap::ValueEnum;
use farm_core::ledger::BalanceDrift;
use farm_core::{
    AccountId, CreditOutcome, CreditRequest, Currency, EntryType, FarmConfig, SystemClock,
};
use rust_decimal::Decimal;
use std::sync::Arc;

use super::{Engine, StoreArgs};

/// Entry kinds an operator may post by hand.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum PostKind {
    Deposit,
    Bonus,
    Withdrawal,
    Purchase,
}

impl From<PostKind> for EntryType {
    fn from(kind: PostKind) -> Self {
        match kind {
            PostKind::Deposit => EntryType::Deposit,
            PostKind::Bonus => EntryType::Bonus,
            PostKind::Withdrawal => EntryType::Withdrawal,
            PostKind::Purchase => EntryType::Purchase,
        }
    }
}

pub fn post(
    config: FarmConfig,
    store: StoreArgs,
    account: u64,
    kind: PostKind,
    amount: Decimal,
    currency: String,
    dedup_key: Option<String>,
) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let engine = Engine::open(&config, &store, Arc::new(SystemClock))?;
        let entry_type = EntryType::from(kind);
        let mut request =
            CreditRequest::new(AccountId(account), amount, Currency::new(currency), entry_type);
        if let Some(key) = dedup_key {
            request = request.with_dedup_key(key);
        }

        let outcome = if entry_type.is_credit() {
            engine.updater.credit(request).await?
        } else {
            engine.updater.debit(request).await?
        };

        match &outcome {
            CreditOutcome::Written(entry) => println!("Posted entry {}", entry.id),
            CreditOutcome::Duplicate(entry) => {
                println!("Already posted as entry {}, nothing changed", entry.id)
            }
        }
        println!("{}", serde_json::to_string_pretty(outcome.entry())?);
        Ok(())
    })
}

pub fn audit(config: FarmConfig, store: StoreArgs, account: Option<u64>) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let engine = Engine::open(&config, &store, Arc::new(SystemClock))?;
        let accounts: Vec<AccountId> = match account {
            Some(id) => vec![AccountId(id)],
            None => engine.account_ids.clone(),
        };

        let mut drift: Vec<BalanceDrift> = Vec::new();
        for id in &accounts {
            drift.extend(engine.updater.audit_account(*id).await?);
        }

        println!("{}", serde_json::to_string_pretty(&drift)?);
        if !drift.is_empty() {
            bail!("{} balance(s) disagree with the ledger", drift.len());
        }
        eprintln!("{} account(s) consistent", accounts.len());
        Ok(())
    })
}
