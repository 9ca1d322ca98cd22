//! src/services/lifecycle_worker.rs
//!
//! LifecycleWorker - one batch pass over stored objects, in two scans:
//!
//! - **trial expiry**: live objects of trial accounts older than the trial
//!   retention are removed outright.
//! - **purge**: soft-deleted objects whose deletion is older than the purge
//!   threshold are removed.
//!
//! For every object the payload is deleted first and the metadata row second.
//! When the payload delete fails the row is left alone until a later pass, so
//! a failure can orphan bytes but never leave a row pointing at nothing.
//! Work already done is not rolled back when a later object fails.

use crate::{
    models::object::StoredObject,
    services::{blob_store::BlobStore, metadata_store::MetadataStore},
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Age thresholds for the two scans.
#[derive(Debug, Clone, Copy)]
pub struct LifecyclePolicy {
    pub trial_retention: Duration,
    pub purge_after: Duration,
}

impl LifecyclePolicy {
    pub fn from_days(trial_retention_days: i64, purge_after_days: i64) -> Self {
        Self {
            trial_retention: Duration::days(trial_retention_days),
            purge_after: Duration::days(purge_after_days),
        }
    }
}

/// Counters for one scan.
#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct ScanReport {
    pub candidates: usize,
    pub candidate_bytes: i64,
    pub deleted: usize,
    pub failed: usize,
    /// Stopped early on cancellation.
    pub cancelled: bool,
    #[serde(skip)]
    errors: Vec<String>,
}

impl ScanReport {
    fn fail(&mut self, message: String) {
        self.failed += 1;
        self.errors.push(message);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub dry_run: bool,
    pub trial_expiry: ScanReport,
    pub purge: ScanReport,
}

impl PassReport {
    pub fn cancelled(&self) -> bool {
        self.trial_expiry.cancelled || self.purge.cancelled
    }

    /// Combined error when anything in the pass failed.
    pub fn error(&self) -> Option<LifecycleError> {
        let messages: Vec<String> = self
            .trial_expiry
            .errors
            .iter()
            .chain(&self.purge.errors)
            .cloned()
            .collect();
        let first = messages.first()?.clone();
        Some(LifecycleError {
            count: messages.len(),
            first,
            messages,
        })
    }
}

#[derive(Debug, Error)]
#[error("{count} failure(s) during lifecycle pass; first: {first}")]
pub struct LifecycleError {
    pub count: usize,
    pub first: String,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scan {
    TrialExpiry,
    Purge,
}

impl Scan {
    fn name(self) -> &'static str {
        match self {
            Scan::TrialExpiry => "trial_expiry",
            Scan::Purge => "purge",
        }
    }
}

pub struct LifecycleWorker {
    metadata: MetadataStore,
    blobs: Arc<dyn BlobStore>,
    policy: LifecyclePolicy,
}

impl LifecycleWorker {
    pub fn new(metadata: MetadataStore, blobs: Arc<dyn BlobStore>, policy: LifecyclePolicy) -> Self {
        Self {
            metadata,
            blobs,
            policy,
        }
    }

    pub async fn run(&self, dry_run: bool, cancel: &CancellationToken) -> PassReport {
        self.run_at(Utc::now(), dry_run, cancel).await
    }

    pub async fn run_at(
        &self,
        now: DateTime<Utc>,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> PassReport {
        info!(dry_run, "starting lifecycle pass");

        let trial_expiry = self
            .scan(Scan::TrialExpiry, now - self.policy.trial_retention, dry_run, cancel)
            .await;
        let purge = if trial_expiry.cancelled {
            ScanReport {
                cancelled: true,
                ..Default::default()
            }
        } else {
            self.scan(Scan::Purge, now - self.policy.purge_after, dry_run, cancel)
                .await
        };

        let report = PassReport {
            dry_run,
            trial_expiry,
            purge,
        };
        info!(
            dry_run,
            expired = report.trial_expiry.deleted,
            purged = report.purge.deleted,
            failed = report.trial_expiry.failed + report.purge.failed,
            cancelled = report.cancelled(),
            "lifecycle pass finished"
        );
        report
    }

    async fn scan(
        &self,
        scan: Scan,
        cutoff: DateTime<Utc>,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> ScanReport {
        let mut report = ScanReport::default();
        let candidates = match scan {
            Scan::TrialExpiry => self.metadata.expired_trial_objects(cutoff).await,
            Scan::Purge => self.metadata.purgeable_objects(cutoff).await,
        };
        let candidates = match candidates {
            Ok(rows) => rows,
            Err(err) => {
                error!(scan = scan.name(), error = %err, "failed to list candidates");
                report.fail(format!("{}: listing candidates: {err}", scan.name()));
                return report;
            }
        };

        report.candidates = candidates.len();
        report.candidate_bytes = candidates.iter().map(|o| o.size_bytes).sum();
        info!(
            scan = scan.name(),
            candidates = report.candidates,
            bytes = report.candidate_bytes,
            %cutoff,
            "lifecycle candidates"
        );
        if dry_run {
            return report;
        }

        for object in &candidates {
            if cancel.is_cancelled() {
                warn!(scan = scan.name(), deleted = report.deleted, "lifecycle scan cancelled");
                report.cancelled = true;
                break;
            }
            match self.remove(object).await {
                Ok(()) => report.deleted += 1,
                Err(message) => {
                    warn!(scan = scan.name(), id = %object.id, error = %message, "skipping object");
                    report.fail(format!("{}: {}: {message}", scan.name(), object.id));
                }
            }
        }
        report
    }

    /// Payload first, row second.
    async fn remove(&self, object: &StoredObject) -> Result<(), String> {
        self.blobs
            .delete(&object.storage_key)
            .await
            .map_err(|err| format!("deleting payload `{}`: {err}", object.storage_key))?;
        self.metadata
            .hard_delete_object(&object.id)
            .await
            .map_err(|err| format!("deleting metadata: {err}"))?;
        info!(id = %object.id, key = %object.storage_key, bytes = object.size_bytes, "removed object");
        Ok(())
    }
}
