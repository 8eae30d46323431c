//! Sync Orchestrator.
//!
//! Decides whether a freshly captured record goes straight to the server or
//! into the local queue, and replays the queue whenever a pass is triggered.
//!
//! A pass walks the pending records in ascending id order, one submission at
//! a time. Each record's remote outcome is paired with its own local write,
//! so a pass interrupted at any point leaves every record either removed or
//! still pending. At most one pass runs at a time per device: an in-process
//! flag covers triggers within one orchestrator, and a lease in the store
//! covers other processes on the same database. Triggers that arrive while a
//! pass is in flight are dropped, never queued.

mod backoff;

pub use backoff::Backoff;

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SyncSettings;
use crate::connectivity::Connectivity;
use crate::models::{NewRecord, Record};
use crate::photo;
use crate::remote::{RemoteClient, SubmitOutcome};
use crate::session::{AuthError, TokenSource};
use crate::storage::{RecordStore, StoreError};

/// What started a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    AppStart,
    ConnectivityRegained,
    Periodic,
    /// Explicit user request; ignores backoff and the connectivity signal.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyRunning,
    BackingOff { retry_in: Duration },
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivered {
    pub local_id: i64,
    pub remote_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub local_id: i64,
    pub reason: String,
}

/// Per-record results of one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub trigger: SyncTrigger,
    pub attempted: usize,
    pub delivered: Vec<Delivered>,
    pub transient: Vec<i64>,
    pub rejected: Vec<Rejection>,
    pub dead_lettered: Vec<i64>,
}

impl SyncReport {
    fn new(trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            attempted: 0,
            delivered: Vec::new(),
            transient: Vec::new(),
            rejected: Vec::new(),
            dead_lettered: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassOutcome {
    Completed(SyncReport),
    Skipped(SkipReason),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The pass stopped at the first record whose submission stayed
    /// unauthorized after one refresh. `report` covers the records handled
    /// before that point.
    #[error("sync aborted: {reason}")]
    Unauthorized { reason: String, report: SyncReport },
}

/// Why a new record was queued instead of delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueReason {
    Offline,
    NotLoggedIn,
    SubmitFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "routed")]
pub enum Routed {
    Delivered { remote_id: Option<i64> },
    Queued { local_id: i64, reason: QueueReason },
}

/// Clears the in-flight flag when the pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassGuard(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncOrchestrator {
    store: Arc<dyn RecordStore>,
    remote: Arc<dyn RemoteClient>,
    tokens: Arc<dyn TokenSource>,
    connectivity: Arc<dyn Connectivity>,
    settings: SyncSettings,
    in_flight: AtomicBool,
    /// Identifies this orchestrator in the store's sync lease.
    lease_holder: String,
    backoff: Mutex<Backoff>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        remote: Arc<dyn RemoteClient>,
        tokens: Arc<dyn TokenSource>,
        connectivity: Arc<dyn Connectivity>,
        settings: SyncSettings,
    ) -> Self {
        let backoff = Backoff::new(
            Duration::from_secs(settings.backoff_base_secs),
            Duration::from_secs(settings.backoff_max_secs),
        );
        Self {
            store,
            remote,
            tokens,
            connectivity,
            settings,
            in_flight: AtomicBool::new(false),
            lease_holder: Uuid::new_v4().to_string(),
            backoff: Mutex::new(backoff),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Long enough for one record's submit, refresh and retry.
    fn lease_ttl(&self) -> Duration {
        self.settings.submit_timeout() * 3 + Duration::from_secs(60)
    }

    fn with_backoff<T>(&self, f: impl FnOnce(&mut Backoff) -> T) -> T {
        // A poisoned lock only means a panic elsewhere; the data is still usable.
        let mut guard = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Route a newly captured record: deliver it directly when reachable,
    /// otherwise (or on any failure) persist it as pending.
    pub async fn submit_new(&self, record: NewRecord) -> Result<Routed, StoreError> {
        let reason = if !self.connectivity.is_reachable().await {
            QueueReason::Offline
        } else if let Some(mut token) = self.tokens.access_token().await {
            let unsaved = Record::unsaved(record.clone());
            let mut refreshed = false;
            match self.submit_with_refresh(&unsaved, &mut token, &mut refreshed).await {
                Ok(SubmitOutcome::Created { remote_id }) => {
                    info!(?remote_id, "record delivered directly");
                    return Ok(Routed::Delivered { remote_id });
                }
                Ok(other) => QueueReason::SubmitFailed(other.to_string()),
                Err(e) => QueueReason::SubmitFailed(format!("token refresh failed: {e}")),
            }
        } else {
            QueueReason::NotLoggedIn
        };

        let local_id = self.store.insert_pending(&record).await?;
        info!(local_id, ?reason, "record queued for sync");
        Ok(Routed::Queued { local_id, reason })
    }

    /// Replay pending records against the server.
    pub async fn run_pass(&self, trigger: SyncTrigger) -> Result<PassOutcome, SyncError> {
        let Some(_guard) = PassGuard::acquire(&self.in_flight) else {
            debug!(?trigger, "sync pass already running, trigger dropped");
            return Ok(PassOutcome::Skipped(SkipReason::AlreadyRunning));
        };

        if trigger != SyncTrigger::Manual {
            if let Some(retry_in) = self.with_backoff(|b| b.remaining(Instant::now())) {
                debug!(?trigger, ?retry_in, "sync pass deferred by backoff");
                return Ok(PassOutcome::Skipped(SkipReason::BackingOff { retry_in }));
            }
            if !self.connectivity.is_reachable().await {
                debug!(?trigger, "offline, sync pass skipped");
                return Ok(PassOutcome::Skipped(SkipReason::Offline));
            }
        }

        if !self.store.acquire_sync_lease(&self.lease_holder, self.lease_ttl()).await? {
            debug!(?trigger, "another process holds the sync lease, trigger dropped");
            return Ok(PassOutcome::Skipped(SkipReason::AlreadyRunning));
        }
        let result = self.replay(trigger).await;
        if let Err(e) = self.store.release_sync_lease(&self.lease_holder).await {
            warn!(error = %e, "could not release sync lease; it will expire");
        }
        result
    }

    async fn replay(&self, trigger: SyncTrigger) -> Result<PassOutcome, SyncError> {
        // Always re-read; the UI may have queued records since the last pass.
        let pending = self.store.list_pending().await?;
        let mut report = SyncReport::new(trigger);
        if pending.is_empty() {
            self.with_backoff(Backoff::reset);
            return Ok(PassOutcome::Completed(report));
        }
        info!(?trigger, pending = pending.len(), "sync pass started");

        let Some(mut token) = self.tokens.access_token().await else {
            return Err(abort(report, "not logged in".to_string()));
        };
        let mut refreshed = false;

        for record in pending {
            if !self.store.acquire_sync_lease(&self.lease_holder, self.lease_ttl()).await? {
                warn!(local_id = record.id, "sync lease lost, stopping pass");
                break;
            }
            report.attempted += 1;

            let outcome = match self.submit_with_refresh(&record, &mut token, &mut refreshed).await {
                Ok(outcome) => outcome,
                Err(e) => return Err(abort(report, format!("token refresh failed: {e}"))),
            };

            match outcome {
                SubmitOutcome::Created { remote_id } => {
                    self.settle_delivered(record.id).await?;
                    info!(local_id = record.id, ?remote_id, "record synced");
                    report.delivered.push(Delivered {
                        local_id: record.id,
                        remote_id,
                    });
                }
                SubmitOutcome::Unauthorized => {
                    return Err(abort(report, "token rejected after refresh".to_string()));
                }
                SubmitOutcome::Rejected(reason) => {
                    self.handle_rejection(&record, &reason, &mut report).await;
                }
                SubmitOutcome::TransientFailure(reason) => {
                    warn!(local_id = record.id, %reason, "transient failure, record stays pending");
                    report.transient.push(record.id);
                }
            }
        }

        if report.transient.is_empty() {
            self.with_backoff(Backoff::reset);
        } else {
            let delay = self.with_backoff(|b| b.record_failure(Instant::now()));
            warn!(failed = report.transient.len(), ?delay, "backing off before next pass");
        }

        info!(
            ?trigger,
            attempted = report.attempted,
            delivered = report.delivered.len(),
            transient = report.transient.len(),
            rejected = report.rejected.len(),
            "sync pass finished"
        );
        Ok(PassOutcome::Completed(report))
    }

    /// Submit, and on Unauthorized refresh the token and retry once, unless
    /// `refreshed` says the refresh was already spent.
    async fn submit_with_refresh(
        &self,
        record: &Record,
        token: &mut String,
        refreshed: &mut bool,
    ) -> Result<SubmitOutcome, AuthError> {
        match self.submit_once(record, token).await {
            SubmitOutcome::Unauthorized if !*refreshed => {
                *refreshed = true;
                *token = self.tokens.refresh().await?;
                Ok(self.submit_once(record, token).await)
            }
            other => Ok(other),
        }
    }

    /// One bounded submission, photo included.
    async fn submit_once(&self, record: &Record, token: &str) -> SubmitOutcome {
        let photo = match &record.photo_ref {
            Some(path) => match photo::load(path).await {
                Ok(upload) => Some(upload),
                Err(e) => return SubmitOutcome::Rejected(format!("photo unavailable: {e}")),
            },
            None => None,
        };

        let timeout = self.settings.submit_timeout();
        match tokio::time::timeout(timeout, self.remote.submit(record, photo, token)).await {
            Ok(outcome) => outcome,
            Err(_) => SubmitOutcome::TransientFailure(format!("timed out after {}s", timeout.as_secs())),
        }
    }

    async fn settle_delivered(&self, id: i64) -> Result<(), StoreError> {
        let result = if self.settings.retain_synced {
            self.store.mark_synced(id).await
        } else {
            self.store.remove(id).await
        };
        if let Err(e) = &result {
            error!(local_id = id, error = %e, "record delivered but local state not updated; it may be sent again");
        }
        result
    }

    async fn handle_rejection(&self, record: &Record, reason: &str, report: &mut SyncReport) {
        warn!(local_id = record.id, %reason, "record rejected by server");
        report.rejected.push(Rejection {
            local_id: record.id,
            reason: reason.to_string(),
        });

        let attempts = match self.store.record_failure(record.id, reason).await {
            Ok(attempts) => attempts,
            Err(e) => {
                warn!(local_id = record.id, error = %e, "could not record rejection");
                return;
            }
        };

        let (Some(limit), Some(attempts)) = (self.settings.dead_letter_after, attempts) else {
            return;
        };
        if attempts >= limit {
            match self.store.mark_failed(record.id).await {
                Ok(()) => {
                    warn!(local_id = record.id, attempts, "record moved to dead letter");
                    report.dead_lettered.push(record.id);
                }
                Err(e) => warn!(local_id = record.id, error = %e, "could not dead-letter record"),
            }
        }
    }
}

fn abort(report: SyncReport, reason: String) -> SyncError {
    error!(attempted = report.attempted, %reason, "sync pass aborted");
    SyncError::Unauthorized { reason, report }
}
