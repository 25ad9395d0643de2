//! SQLite persistence layer.
//!
//! RULE: Only store/ talks to the database.
//! The shop and the settlement engine call store methods; they never execute SQL directly.
//!
//! Every mutation of a wallet is one read-modify-write inside a SQLite
//! transaction. If any statement fails the transaction rolls back, so a
//! failed operation leaves no trace on disk and callers see the old state.

use crate::{
    error::{ShopError, ShopResult},
    types::{Amount, Credential, CustomerId, Days},
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{types::Type, Connection};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

mod exception;
mod journal;
mod metrics;
mod wallet;

pub struct LedgerStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl LedgerStore {
    pub fn open(path: &str) -> ShopResult<Self> {
        if path == ":memory:" {
            return Self::in_memory();
        }
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> ShopResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> ShopResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_wallet.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_ledger_journal.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_metrics.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_settlement_exception.sql"))?;
        Ok(())
    }
}

// ── Shared handle ──────────────────────────────────────────────

/// The single process-wide critical section around the ledger.
///
/// RULE: every ledger-affecting operation, whether from an inbound request
/// or from a settlement tick, runs while holding this lock.
#[derive(Clone)]
pub struct Ledger {
    inner: Arc<Mutex<LedgerStore>>,
}

impl Ledger {
    pub fn new(store: LedgerStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn lock(&self) -> ShopResult<MutexGuard<'_, LedgerStore>> {
        self.inner.lock().map_err(|_| ShopError::LockPoisoned)
    }
}

// ── Row types ──────────────────────────────────────────────────

/// A purchase parked until the wallet can cover it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPurchase {
    pub credential: Credential,
    pub days: Days,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRecord {
    pub customer_id: CustomerId,
    pub balance: Amount,
    pub trial_used: bool,
    pub banned: bool,
    pub created_count: u32,
    pub pending: Option<PendingPurchase>,
}

impl WalletRecord {
    pub fn empty(customer_id: CustomerId) -> Self {
        Self {
            customer_id,
            balance: 0,
            trial_used: false,
            banned: false,
            created_count: 0,
            pending: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryDirection {
    Credit,
    Debit,
}

impl EntryDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
        }
    }
}

/// Why a balance changed. Stored in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryReason {
    Topup,
    Purchase,
    Renew,
    PendingPurchase,
    DirectPurchase,
    AdminAdjustment,
}

impl EntryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Topup => "topup",
            Self::Purchase => "purchase",
            Self::Renew => "renew",
            Self::PendingPurchase => "pending_purchase",
            Self::DirectPurchase => "direct_purchase",
            Self::AdminAdjustment => "admin_adjustment",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub entry_id: i64,
    pub customer_id: CustomerId,
    pub direction: String,
    pub amount: Amount,
    pub balance_after: Amount,
    pub reason: String,
    pub reference: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// A confirmed payment or debit that could not be turned into an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementExceptionRow {
    pub exception_id: String,
    pub customer_id: CustomerId,
    pub order_id: Option<String>,
    pub credential: String,
    pub days: Days,
    pub amount: Amount,
    pub reason: String,
    pub detected_at: DateTime<Utc>,
    pub status: String, // open | resolved
    pub resolution_note: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

// ── Column helpers ─────────────────────────────────────────────

pub(crate) fn sql_amount(amount: Amount) -> ShopResult<i64> {
    i64::try_from(amount).map_err(|_| ShopError::Validation(format!("amount {amount} is too large")))
}

pub(crate) fn sql_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
