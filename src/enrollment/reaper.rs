//! Expiry reaper for unapproved enrollment forms.
//!
//! Periodically removes pending forms whose retention window has passed.
//! Each candidate is deleted in its own transaction after re-reading its
//! state, so a guardian approved mid-sweep survives and concurrent sweeps
//! only ever delete an aggregate once.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::domain::{Guardian, GuardianId, GuardianIdentity};
use super::error::EnrollmentError;
use super::notify::{Notification, NotificationDispatcher, Notifier, TemplateKey};
use super::store::{retry_backoff, EntityStore, StoreError, StoreTransaction};

const DELETE_ATTEMPTS: u32 = 3;

/// Default number of days a pending form is kept.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Identifying details of a swept form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReapedSubmission {
    pub guardian_id: GuardianId,
    pub identity: GuardianIdentity,
    pub national_id: String,
    pub submitted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl From<&Guardian> for ReapedSubmission {
    fn from(guardian: &Guardian) -> Self {
        Self {
            guardian_id: guardian.id,
            identity: guardian.identity.clone(),
            national_id: guardian.national_id.clone(),
            submitted_at: guardian.submitted_at,
            expires_at: guardian.expires_at,
            email: guardian.email.clone(),
        }
    }
}

/// Partial-success summary of one sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub cutoff: DateTime<Utc>,
    pub dry_run: bool,
    pub candidates: Vec<ReapedSubmission>,
    pub removed: Vec<ReapedSubmission>,
    /// Candidates that were decided or already gone when their deletion ran.
    pub skipped: usize,
    pub errors: usize,
}

impl SweepReport {
    pub fn deleted(&self) -> usize {
        self.removed.len()
    }

    pub fn removed_identities(&self) -> Vec<GuardianIdentity> {
        self.removed
            .iter()
            .map(|entry| entry.identity.clone())
            .collect()
    }
}

enum DeleteOutcome {
    Removed(Guardian),
    Skipped,
}

/// Batch job that purges expired pending aggregates.
pub struct ExpiryReaper<S, N> {
    store: Arc<S>,
    notifications: Arc<NotificationDispatcher<N>>,
}

impl<S, N> ExpiryReaper<S, N>
where
    S: EntityStore + 'static,
    N: Notifier + 'static,
{
    pub fn new(store: Arc<S>, notifications: Arc<NotificationDispatcher<N>>) -> Self {
        Self {
            store,
            notifications,
        }
    }

    /// Deletes (or, with `dry_run`, only lists) pending forms submitted before `now - retention`
    /// or past their explicit deadline.
    pub async fn sweep(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
        dry_run: bool,
    ) -> Result<SweepReport, EnrollmentError> {
        if retention < Duration::zero() {
            return Err(EnrollmentError::validation("retention must not be negative"));
        }
        let cutoff = now.checked_sub_signed(retention).ok_or_else(|| {
            EnrollmentError::validation(format!(
                "retention of {} days is out of range",
                retention.num_days()
            ))
        })?;
        let expired = self.store.find_expired_pending(cutoff, now).await?;
        let candidates: Vec<ReapedSubmission> = expired.iter().map(ReapedSubmission::from).collect();

        let mut report = SweepReport {
            cutoff,
            dry_run,
            candidates,
            removed: Vec::new(),
            skipped: 0,
            errors: 0,
        };

        if dry_run {
            info!(
                candidates = report.candidates.len(),
                %cutoff,
                "dry run: expired enrollment forms"
            );
            return Ok(report);
        }

        for guardian in &expired {
            match self.delete_if_expired(guardian.id, cutoff, now).await {
                Ok(DeleteOutcome::Removed(removed)) => {
                    info!(
                        guardian_id = %removed.id,
                        identity = %removed.identity,
                        submitted_at = %removed.submitted_at,
                        "removed expired enrollment form"
                    );
                    let submitted = removed.submitted_at.date_naive();
                    self.notifications
                        .dispatch_to(removed.email.as_deref(), |email| {
                            Notification::new(email, TemplateKey::FormExpired)
                                .with("submitted_on", submitted)
                        })
                        .await;
                    report.removed.push(ReapedSubmission::from(&removed));
                }
                Ok(DeleteOutcome::Skipped) => {
                    debug!(guardian_id = %guardian.id, "form no longer expired; skipping");
                    report.skipped += 1;
                }
                Err(err) => {
                    warn!(
                        guardian_id = %guardian.id,
                        error = %err,
                        "failed to remove expired enrollment form"
                    );
                    report.errors += 1;
                }
            }
        }

        if report.errors > 0 {
            warn!(
                deleted = report.deleted(),
                errors = report.errors,
                skipped = report.skipped,
                "enrollment sweep completed with errors"
            );
        } else {
            info!(
                deleted = report.deleted(),
                skipped = report.skipped,
                "enrollment sweep completed"
            );
        }

        Ok(report)
    }

    async fn delete_if_expired(
        &self,
        guardian_id: GuardianId,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DeleteOutcome, StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut tx = self.store.begin().await?;
            let Some(current) = tx.get_aggregate(guardian_id) else {
                return Ok(DeleteOutcome::Skipped);
            };
            if !current.guardian.is_expired(cutoff, now) {
                return Ok(DeleteOutcome::Skipped);
            }
            let removed = tx.delete_aggregate(guardian_id)?;
            match self.store.commit(tx).await {
                Ok(()) => return Ok(DeleteOutcome::Removed(removed.guardian)),
                Err(StoreError::Serialization) if attempt < DELETE_ATTEMPTS => {
                    tokio::time::sleep(retry_backoff(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Runs [`ExpiryReaper::sweep`] every `interval` until the task is aborted.
    pub fn spawn_periodic(
        self: Arc<Self>,
        clock: Arc<dyn Clock>,
        interval: StdDuration,
        retention: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = self.sweep(clock.now(), retention, false).await {
                    warn!(error = %err, "scheduled enrollment sweep failed");
                }
            }
        })
    }
}
