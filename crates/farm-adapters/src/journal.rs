//! Append-only JSONL journal store.
//!
//! Every state change is one JSON line, written and synced before it is applied
//! to the in-memory [`Book`]. Opening a journal replays it from the top, so the
//! file is the source of truth and the book is a cache that always satisfies
//! `balance == Σ ledger`.
//!
//! A torn final line (a crash mid-append) is discarded on open and the file is
//! truncated back to the last complete record. Any other unreadable line is a
//! hard error.
//!
//! A failed append is cut back to the length the file had before it, so the
//! next record starts on a clean line. If that rollback fails too, the store
//! refuses further writes until it is reopened.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use farm_core::store::memory::Prepared;
use farm_core::store::{
    AccountStore, Book, CommitOutcome, LedgerStore, PositionStore, ReferralStore,
};
use farm_core::{
    Account, AccountId, FarmError, LedgerEntry, NewEntry, Position, PositionId, Result,
};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const JOURNAL_VERSION: u32 = 1;

/// One line of the journal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalRecord {
    Account {
        v: u32,
        account: Account,
    },
    Position {
        v: u32,
        position: Position,
    },
    Entry {
        v: u32,
        entry: LedgerEntry,
    },
    Advance {
        v: u32,
        position: PositionId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    Deactivate {
        v: u32,
        position: PositionId,
    },
}

impl JournalRecord {
    fn version(&self) -> u32 {
        match self {
            JournalRecord::Account { v, .. }
            | JournalRecord::Position { v, .. }
            | JournalRecord::Entry { v, .. }
            | JournalRecord::Advance { v, .. }
            | JournalRecord::Deactivate { v, .. } => *v,
        }
    }

    fn apply(self, book: &mut Book) -> Result<()> {
        match self {
            JournalRecord::Account { account, .. } => book.insert_account(account),
            JournalRecord::Position { position, .. } => book.insert_position(position),
            JournalRecord::Entry { entry, .. } => book.apply_entry(entry),
            JournalRecord::Advance { position, from, to, .. } => {
                if book.advance_last_update(position, from, to)? {
                    Ok(())
                } else {
                    Err(FarmError::Storage(format!(
                        "journal advance of position {position} does not follow its last_update"
                    )))
                }
            }
            JournalRecord::Deactivate { position, .. } => book.deactivate_position(position),
        }
    }
}

/// Append target of a journal.
trait Sink: Send {
    fn len(&self) -> io::Result<u64>;
    fn write_line(&mut self, line: &[u8]) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl Sink for File {
    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.write_all(line)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.sync_all()
    }
}

struct Inner {
    book: Book,
    sink: Box<dyn Sink>,
    /// Why the file can no longer be trusted for appends.
    failed: Option<String>,
}

impl Inner {
    /// Write one record durably. On error the file is restored to its prior
    /// length; the caller must not apply the record.
    fn append(&mut self, record: &JournalRecord) -> Result<()> {
        if let Some(reason) = &self.failed {
            return Err(FarmError::Storage(format!(
                "journal is read-only after an unrecovered write failure: {reason}"
            )));
        }

        let mut line = serde_json::to_vec(record)
            .map_err(|e| FarmError::Storage(format!("failed to serialize journal record: {e}")))?;
        line.push(b'\n');

        let before = self
            .sink
            .len()
            .map_err(|e| FarmError::Storage(format!("failed to stat journal: {e}")))?;
        let written = self
            .sink
            .write_line(&line)
            .map_err(|e| format!("failed to write journal record: {e}"))
            .and_then(|()| {
                self.sink
                    .sync()
                    .map_err(|e| format!("failed to sync journal: {e}"))
            });

        match written {
            Ok(()) => Ok(()),
            Err(cause) => {
                if let Err(e) = self.sink.truncate(before) {
                    error!(len = before, error = %e, "Journal rollback failed, refusing further writes");
                    self.failed = Some(format!("{cause}; rollback failed: {e}"));
                } else {
                    warn!(len = before, error = %cause, "Journal append rolled back");
                }
                Err(FarmError::Storage(cause))
            }
        }
    }
}

/// File-backed store implementing every engine store trait.
pub struct JournalStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl JournalStore {
    /// Open (or create) the journal at `path` and replay it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let book = if path.exists() {
            replay(&path)?
        } else {
            Book::new()
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| storage("failed to open journal", &path, e))?;

        info!(
            path = %path.display(),
            accounts = book.accounts().count(),
            positions = book.positions().count(),
            entries = book.entries().len(),
            "Journal opened"
        );
        Ok(Self::with_sink(path, book, Box::new(file)))
    }

    fn with_sink(path: PathBuf, book: Book, sink: Box<dyn Sink>) -> Self {
        Self {
            path,
            inner: Mutex::new(Inner {
                book,
                sink,
                failed: None,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Result<Book> {
        self.with(|inner| Ok(inner.book.clone()))
    }

    pub fn insert_account(&self, account: Account) -> Result<()> {
        self.with(|inner| {
            let mut next = inner.book.clone();
            next.insert_account(account.clone())?;
            inner.append(&JournalRecord::Account { v: JOURNAL_VERSION, account })?;
            inner.book = next;
            Ok(())
        })
    }

    pub fn insert_position(&self, position: Position) -> Result<()> {
        self.with(|inner| {
            let mut next = inner.book.clone();
            next.insert_position(position.clone())?;
            inner.append(&JournalRecord::Position { v: JOURNAL_VERSION, position })?;
            inner.book = next;
            Ok(())
        })
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| FarmError::Storage("journal lock poisoned".into()))?;
        f(&mut inner)
    }
}

fn storage(what: &str, path: &Path, e: impl std::fmt::Display) -> FarmError {
    FarmError::Storage(format!("{what} {}: {e}", path.display()))
}

fn replay(path: &Path) -> Result<Book> {
    let raw = std::fs::read_to_string(path).map_err(|e| storage("failed to read journal", path, e))?;
    let mut book = Book::new();
    let mut good_len = 0usize;

    let mut lines = raw.split_inclusive('\n').enumerate().peekable();
    while let Some((idx, line)) = lines.next() {
        let complete = line.ends_with('\n');
        let body = line.trim_end();
        if body.is_empty() {
            good_len += line.len();
            continue;
        }

        let record: JournalRecord = match serde_json::from_str(body) {
            Ok(record) => record,
            Err(e) if !complete && lines.peek().is_none() => {
                warn!(path = %path.display(), line = idx + 1, error = %e, "Discarding torn journal tail");
                break;
            }
            Err(e) => {
                return Err(FarmError::Storage(format!(
                    "corrupt journal {} line {}: {e}",
                    path.display(),
                    idx + 1
                )))
            }
        };
        if record.version() != JOURNAL_VERSION {
            return Err(FarmError::Storage(format!(
                "journal {} line {} has version {}, expected {}",
                path.display(),
                idx + 1,
                record.version(),
                JOURNAL_VERSION
            )));
        }

        record.apply(&mut book).map_err(|e| {
            FarmError::Storage(format!(
                "journal {} line {} does not replay: {e}",
                path.display(),
                idx + 1
            ))
        })?;
        good_len += line.len();
        if !complete {
            // Parsed but unterminated: terminate it so later appends stay on their own line.
            let mut file = OpenOptions::new()
                .append(true)
                .open(path)
                .map_err(|e| storage("failed to open journal", path, e))?;
            file.write_all(b"\n")
                .map_err(|e| storage("failed to repair journal", path, e))?;
            good_len += 1;
        }
    }

    if good_len < raw.len() {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| storage("failed to open journal", path, e))?;
        file.set_len(good_len as u64)
            .map_err(|e| storage("failed to truncate journal", path, e))?;
    }
    debug!(path = %path.display(), entries = book.entries().len(), "Journal replayed");
    Ok(book)
}

#[async_trait]
impl AccountStore for JournalStore {
    async fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        self.with(|inner| Ok(inner.book.account(id).cloned()))
    }
}

#[async_trait]
impl PositionStore for JournalStore {
    async fn list_active_positions(
        &self,
        after: Option<PositionId>,
        limit: usize,
    ) -> Result<Vec<Position>> {
        self.with(|inner| Ok(inner.book.active_positions(after, limit)))
    }

    async fn advance_last_update(
        &self,
        id: PositionId,
        expected: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<bool> {
        self.with(|inner| {
            let position = inner
                .book
                .position(id)
                .ok_or_else(|| FarmError::InvalidInput(format!("position {id} not found")))?;
            if position.last_update != expected || to < expected {
                return Ok(false);
            }
            inner.append(&JournalRecord::Advance {
                v: JOURNAL_VERSION,
                position: id,
                from: expected,
                to,
            })?;
            inner.book.advance_last_update(id, expected, to)
        })
    }

    async fn deactivate_position(&self, id: PositionId) -> Result<()> {
        self.with(|inner| {
            if inner.book.position(id).is_none() {
                return Err(FarmError::InvalidInput(format!("position {id} not found")));
            }
            inner.append(&JournalRecord::Deactivate {
                v: JOURNAL_VERSION,
                position: id,
            })?;
            inner.book.deactivate_position(id)
        })
    }
}

#[async_trait]
impl LedgerStore for JournalStore {
    async fn commit_entry(&self, entry: NewEntry) -> Result<CommitOutcome> {
        self.with(|inner| match inner.book.prepare_entry(entry)? {
            Prepared::Duplicate(existing) => Ok(CommitOutcome::Duplicate(existing)),
            Prepared::Fresh(entry) => {
                inner.append(&JournalRecord::Entry {
                    v: JOURNAL_VERSION,
                    entry: entry.clone(),
                })?;
                inner.book.apply_entry(entry.clone())?;
                Ok(CommitOutcome::Written(entry))
            }
        })
    }

    async fn find_by_dedup_key(&self, key: &str) -> Result<Option<LedgerEntry>> {
        self.with(|inner| Ok(inner.book.find_by_dedup_key(key).cloned()))
    }

    async fn entries_for(&self, account: AccountId) -> Result<Vec<LedgerEntry>> {
        self.with(|inner| Ok(inner.book.entries_for(account)))
    }
}

#[async_trait]
impl ReferralStore for JournalStore {
    async fn get_referrer(&self, account: AccountId) -> Result<Option<AccountId>> {
        self.with(|inner| Ok(inner.book.referrer_of(account)))
    }
}
