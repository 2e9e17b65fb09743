use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::{debug, info};

use super::approval::{ApprovalStateMachine, ApprovalTransition};
use super::clock::{Clock, SystemClock};
use super::domain::{
    Aggregate, ApprovalState, GuardianId, Student, SubmissionFilter, SubmissionForm,
};
use super::error::EnrollmentError;
use super::identity::{Principal, Role};
use super::notify::{Notification, NotificationDispatcher, Notifier, TemplateKey};
use super::payload::SubmissionPayload;
use super::reaper::{ExpiryReaper, SweepReport};
use super::reconcile::{Reconciliation, ReconciliationEngine};
use super::store::{retry_backoff, EntityStore, StoreError, StoreTotals, StoreTransaction};
use crate::config::EnrollmentConfig;

/// Attempts before a transaction that keeps losing optimistic races is reported.
const MAX_TRANSACTION_ATTEMPTS: u32 = 5;

/// Outcome of an admin decision.
#[derive(Debug, Clone)]
pub struct Decision {
    pub aggregate: Aggregate,
    pub transition: ApprovalTransition,
}

/// Landing view: totals for admins, form status for guardians.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum DashboardView {
    Admin {
        totals: StoreTotals,
    },
    Guardian {
        submitted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        approval: Option<ApprovalState>,
        #[serde(skip_serializing_if = "Option::is_none")]
        national_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        phone: Option<String>,
        students: Vec<Student>,
    },
}

/// Service composing the store, reconciliation engine, approval rules and reaper.
pub struct EnrollmentService<S, N> {
    store: Arc<S>,
    notifications: Arc<NotificationDispatcher<N>>,
    engine: ReconciliationEngine,
    reaper: Arc<ExpiryReaper<S, N>>,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl<S, N> EnrollmentService<S, N>
where
    S: EntityStore + 'static,
    N: Notifier + 'static,
{
    pub fn new(store: Arc<S>, notifier: Arc<N>, config: &EnrollmentConfig) -> Self {
        Self::with_clock(store, notifier, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<S>,
        notifier: Arc<N>,
        config: &EnrollmentConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let notifications = Arc::new(
            NotificationDispatcher::new(notifier, config.notify_attempts)
                .with_timeout(config.notify_timeout),
        );
        Self::with_dispatcher(store, notifications, config, clock)
    }

    pub fn with_dispatcher(
        store: Arc<S>,
        notifications: Arc<NotificationDispatcher<N>>,
        config: &EnrollmentConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let reaper = Arc::new(ExpiryReaper::new(store.clone(), notifications.clone()));
        Self {
            store,
            notifications,
            engine: ReconciliationEngine::new(config.resubmission, config.form_ttl),
            reaper,
            retention: config.retention,
            clock,
        }
    }

    pub fn reaper(&self) -> Arc<ExpiryReaper<S, N>> {
        self.reaper.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Reconciles the caller's form against the stored aggregate in one transaction.
    pub async fn submit_form(
        &self,
        principal: &Principal,
        form: SubmissionForm,
    ) -> Result<Reconciliation, EnrollmentError> {
        principal.require_guardian()?;

        let now = self.clock.now();
        let outcome = self
            .in_transaction(|tx| self.engine.apply(tx, principal, &form, now))
            .await?;

        let guardian = &outcome.aggregate.guardian;
        info!(
            guardian_id = %guardian.id,
            identity = %guardian.identity,
            created = outcome.created,
            reset_to_pending = outcome.reset_to_pending,
            students_created = outcome.summary.students_created,
            students_updated = outcome.summary.students_updated,
            students_deleted = outcome.summary.students_deleted,
            tutors_created = outcome.summary.tutors_created,
            tutors_updated = outcome.summary.tutors_updated,
            tutors_deleted = outcome.summary.tutors_deleted,
            "enrollment form committed"
        );

        let students = outcome.aggregate.students.len();
        let approval = guardian.approval.label();
        self.notifications
            .dispatch_to(guardian.email.as_deref(), |email| {
                Notification::new(email, TemplateKey::FormReceived)
                    .with("students", students)
                    .with("status", approval)
            })
            .await;

        Ok(outcome)
    }

    /// Decodes the wire payload, then behaves like [`EnrollmentService::submit_form`].
    pub async fn submit_payload(
        &self,
        principal: &Principal,
        payload: SubmissionPayload,
    ) -> Result<Reconciliation, EnrollmentError> {
        let form = SubmissionForm::try_from(payload)?;
        self.submit_form(principal, form).await
    }

    pub async fn get_my_submission(&self, principal: &Principal) -> Result<Aggregate, EnrollmentError> {
        self.store
            .get_submission(&principal.identity)
            .await?
            .ok_or_else(|| {
                EnrollmentError::NotFound(format!(
                    "no enrollment form for {}",
                    principal.identity
                ))
            })
    }

    pub async fn decide_approval(
        &self,
        principal: &Principal,
        guardian_id: GuardianId,
        approved: bool,
    ) -> Result<Decision, EnrollmentError> {
        principal.require_admin()?;

        let now = self.clock.now();
        let (aggregate, transition) = self
            .in_transaction(|tx| {
                let (_, transition) = ApprovalStateMachine::decide(tx, guardian_id, approved, now)?;
                let aggregate = tx
                    .get_aggregate(guardian_id)
                    .ok_or_else(|| EnrollmentError::NotFound(format!("guardian {guardian_id}")))?;
                Ok((aggregate, transition))
            })
            .await?;

        info!(
            %guardian_id,
            admin = %principal.identity,
            from = transition.from.label(),
            to = transition.to.label(),
            "approval decided"
        );

        let template = if approved {
            TemplateKey::FormApproved
        } else {
            TemplateKey::FormRejected
        };
        let students = aggregate.students.len();
        self.notifications
            .dispatch_to(aggregate.guardian.email.as_deref(), |email| {
                Notification::new(email, template).with("students", students)
            })
            .await;

        Ok(Decision {
            aggregate,
            transition,
        })
    }

    pub async fn delete_submission(
        &self,
        principal: &Principal,
        guardian_id: GuardianId,
    ) -> Result<Aggregate, EnrollmentError> {
        principal.require_admin()?;

        let removed = self
            .in_transaction(|tx| {
                tx.delete_aggregate(guardian_id).map_err(|err| match err {
                    StoreError::NotFound => {
                        EnrollmentError::NotFound(format!("guardian {guardian_id}"))
                    }
                    other => other.into(),
                })
            })
            .await?;

        info!(
            %guardian_id,
            admin = %principal.identity,
            students = removed.students.len(),
            tutors = removed.tutors.len(),
            "enrollment form deleted"
        );
        Ok(removed)
    }

    pub async fn list_submissions(
        &self,
        principal: &Principal,
        filter: SubmissionFilter,
    ) -> Result<Vec<Aggregate>, EnrollmentError> {
        principal.require_admin()?;
        Ok(self.store.list_aggregates(filter).await?)
    }

    /// Purges pending forms older than `retention` as of the service clock.
    /// A negative or out-of-range `retention` is a validation error.
    pub async fn sweep_expired(
        &self,
        retention: Duration,
        dry_run: bool,
    ) -> Result<SweepReport, EnrollmentError> {
        self.reaper
            .sweep(self.clock.now(), retention, dry_run)
            .await
    }

    pub async fn dashboard(&self, principal: &Principal) -> Result<DashboardView, EnrollmentError> {
        match principal.role {
            Role::Admin => Ok(DashboardView::Admin {
                totals: self.store.totals().await?,
            }),
            Role::Guardian => Ok(match self.store.get_submission(&principal.identity).await? {
                Some(aggregate) => DashboardView::Guardian {
                    submitted: true,
                    approval: Some(aggregate.guardian.approval),
                    national_id: Some(aggregate.guardian.national_id),
                    phone: aggregate.guardian.phone,
                    students: aggregate.students,
                },
                None => DashboardView::Guardian {
                    submitted: false,
                    approval: None,
                    national_id: None,
                    phone: None,
                    students: Vec::new(),
                },
            }),
        }
    }

    /// Runs `work` in a fresh transaction, re-running it when the commit loses a race.
    async fn in_transaction<T, F>(&self, mut work: F) -> Result<T, EnrollmentError>
    where
        F: FnMut(&mut S::Transaction) -> Result<T, EnrollmentError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut tx = self.store.begin().await?;
            let value = work(&mut tx)?;
            match self.store.commit(tx).await {
                Ok(()) => return Ok(value),
                Err(StoreError::Serialization) if attempt < MAX_TRANSACTION_ATTEMPTS => {
                    let pause = retry_backoff(attempt);
                    debug!(attempt, ?pause, "transaction lost a race; retrying");
                    tokio::time::sleep(pause).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
