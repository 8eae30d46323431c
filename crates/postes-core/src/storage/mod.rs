//! Local Record Store.
//!
//! The store exclusively owns the `postes` table. Every mutation is a single
//! keyed statement, so the UI insert path and the background sync path can
//! share one store without read-modify-write races.

mod sqlite;

pub use sqlite::LocalDb;

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::models::{NewRecord, Record};

/// Underlying failure of the SQLite backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Pool(#[from] r2d2::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("storage task failed: {0}")]
    Task(String),
    #[error("corrupt row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be opened or its schema created. Fatal at startup.
    #[error("cannot start: local storage unavailable: {0}")]
    Init(#[source] BackendError),
    /// A write failed; the caller still holds the data and may retry.
    #[error("failed to save locally: {0}")]
    Write(#[source] BackendError),
    #[error("failed to read local records: {0}")]
    Read(#[source] BackendError),
}

/// Row totals per sync status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub pending: u64,
    pub synced: u64,
    pub failed: u64,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Ensure the table exists. Safe to call on every start.
    async fn initialize(&self) -> Result<(), StoreError>;

    /// Append a PENDING row and return its id.
    async fn insert_pending(&self, record: &NewRecord) -> Result<i64, StoreError>;

    /// All PENDING rows, ascending id.
    async fn list_pending(&self) -> Result<Vec<Record>, StoreError>;

    async fn get(&self, id: i64) -> Result<Option<Record>, StoreError>;

    /// PENDING -> SYNCED. No-op for absent or non-pending ids.
    async fn mark_synced(&self, id: i64) -> Result<(), StoreError>;

    /// Delete a row. No-op if absent.
    async fn remove(&self, id: i64) -> Result<(), StoreError>;

    /// Count a rejection against a PENDING row and keep the reason.
    /// Returns the new attempt count, or `None` if the row is not pending.
    async fn record_failure(&self, id: i64, reason: &str) -> Result<Option<u32>, StoreError>;

    /// PENDING -> FAILED (dead letter). No-op otherwise.
    async fn mark_failed(&self, id: i64) -> Result<(), StoreError>;

    /// All FAILED rows, ascending id.
    async fn list_failed(&self) -> Result<Vec<Record>, StoreError>;

    /// FAILED -> PENDING with the attempt counter reset.
    /// Returns whether a row was moved.
    async fn requeue(&self, id: i64) -> Result<bool, StoreError>;

    async fn counts(&self) -> Result<StoreCounts, StoreError>;

    /// Take or extend the device-wide sync lease for `holder`, valid for
    /// `ttl`. Returns false while another holder's lease is unexpired.
    /// Shared by every process that opens the same database.
    async fn acquire_sync_lease(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Give the lease up before it expires. No-op unless `holder` has it.
    async fn release_sync_lease(&self, holder: &str) -> Result<(), StoreError>;
}
