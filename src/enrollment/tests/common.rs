use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use axum::response::Response;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::Value;

use crate::config::EnrollmentConfig;
use crate::enrollment::store::memory::MemoryTransaction;
use crate::enrollment::{
    enrollment_router, EnrollmentService, EntityStore, FixedClock, InMemoryEntityStore,
    Notification, NotificationDispatcher, NotificationError, Notifier, Principal,
    StaticIdentityProvider, StoreError, StudentEntry, StudentFields, StudentRef, SubmissionForm,
    TemplateKey, TutorEntry, TutorFields,
};

pub(super) const ANA_TOKEN: &str = "token-ana";
pub(super) const LUIS_TOKEN: &str = "token-luis";
pub(super) const ADMIN_TOKEN: &str = "token-admin";

pub(super) fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 2, 3, 9, 0, 0)
        .single()
        .expect("valid timestamp")
}

pub(super) fn ana() -> Principal {
    Principal::guardian("ana-identity", Some("ana@example.com"))
}

pub(super) fn luis() -> Principal {
    Principal::guardian("luis-identity", None)
}

pub(super) fn admin() -> Principal {
    Principal::admin("office")
}

pub(super) fn student(name: &str) -> StudentFields {
    StudentFields {
        name: name.to_string(),
        surname: "Paredes".to_string(),
        birth_date: NaiveDate::from_ymd_opt(2016, 5, 14).expect("valid date"),
        grade: "3".to_string(),
        age: Some(8),
        school: Some("Escuela Central".to_string()),
        entry_time: None,
        exit_time: None,
    }
}

pub(super) fn tutor(name: &str) -> TutorFields {
    TutorFields {
        name: name.to_string(),
        surname: "Paredes".to_string(),
        address: Some("Av. Amazonas 100".to_string()),
        phone: Some("0987654321".to_string()),
        relationship: Some("uncle".to_string()),
    }
}

/// One student (Ana) with one tutor (Luis) pointing at position 0.
pub(super) fn ana_form() -> SubmissionForm {
    SubmissionForm {
        national_id: "0912345678".to_string(),
        phone: Some("0991234567".to_string()),
        students: vec![StudentEntry::New(student("Ana"))],
        tutors: vec![TutorEntry::New {
            student: StudentRef::Position(0),
            fields: tutor("Luis"),
        }],
    }
}

pub(super) fn config() -> EnrollmentConfig {
    EnrollmentConfig {
        notify_attempts: 2,
        notify_timeout: StdDuration::from_millis(50),
        ..EnrollmentConfig::default()
    }
}

pub(super) struct Harness<S, N> {
    pub(super) service: Arc<EnrollmentService<S, N>>,
    pub(super) store: Arc<S>,
    pub(super) notifier: Arc<N>,
    pub(super) clock: Arc<FixedClock>,
}

pub(super) fn harness_with<S, N>(store: S, notifier: N, config: EnrollmentConfig) -> Harness<S, N>
where
    S: EntityStore + 'static,
    N: Notifier + 'static,
{
    let store = Arc::new(store);
    let notifier = Arc::new(notifier);
    let clock = Arc::new(FixedClock::new(start()));
    let dispatcher = Arc::new(
        NotificationDispatcher::new(notifier.clone(), config.notify_attempts)
            .with_backoff(StdDuration::from_millis(1))
            .with_timeout(config.notify_timeout),
    );
    let service = Arc::new(EnrollmentService::with_dispatcher(
        store.clone(),
        dispatcher,
        &config,
        clock.clone(),
    ));
    Harness {
        service,
        store,
        notifier,
        clock,
    }
}

pub(super) fn harness() -> Harness<InMemoryEntityStore, RecordingNotifier> {
    harness_with(
        InMemoryEntityStore::default(),
        RecordingNotifier::default(),
        config(),
    )
}

pub(super) fn identities() -> Arc<StaticIdentityProvider> {
    Arc::new(StaticIdentityProvider::new([
        (ANA_TOKEN.to_string(), ana()),
        (LUIS_TOKEN.to_string(), luis()),
        (ADMIN_TOKEN.to_string(), admin()),
    ]))
}

pub(super) fn router_for<S, N>(harness: &Harness<S, N>) -> axum::Router
where
    S: EntityStore + 'static,
    N: Notifier + 'static,
{
    enrollment_router(harness.service.clone(), identities())
}

#[derive(Default)]
pub(super) struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub(super) fn sent(&self) -> Vec<Notification> {
        self.sent.lock().expect("notifier mutex poisoned").clone()
    }

    pub(super) fn templates(&self) -> Vec<TemplateKey> {
        self.sent().into_iter().map(|message| message.template).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        email: &str,
        template: TemplateKey,
        variables: &BTreeMap<String, String>,
    ) -> Result<(), NotificationError> {
        self.sent
            .lock()
            .expect("notifier mutex poisoned")
            .push(Notification {
                email: email.to_string(),
                template,
                variables: variables.clone(),
            });
        Ok(())
    }
}

/// Notifier whose transport is always down.
#[derive(Default)]
pub(super) struct FailingNotifier {
    pub(super) attempts: AtomicU32,
}

#[async_trait]
impl Notifier for FailingNotifier {
    async fn send(
        &self,
        _email: &str,
        _template: TemplateKey,
        _variables: &BTreeMap<String, String>,
    ) -> Result<(), NotificationError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(NotificationError::Transport("smtp offline".to_string()))
    }
}

/// Notifier whose transport accepts the call and never answers.
#[derive(Default)]
pub(super) struct StalledNotifier {
    pub(super) attempts: AtomicU32,
}

#[async_trait]
impl Notifier for StalledNotifier {
    async fn send(
        &self,
        _email: &str,
        _template: TemplateKey,
        _variables: &BTreeMap<String, String>,
    ) -> Result<(), NotificationError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Wraps the memory store and fails the next `conflicts` commits as if another writer won.
pub(super) struct ContendedStore {
    pub(super) inner: InMemoryEntityStore,
    pub(super) conflicts: AtomicU32,
}

impl ContendedStore {
    pub(super) fn new(conflicts: u32) -> Self {
        Self {
            inner: InMemoryEntityStore::default(),
            conflicts: AtomicU32::new(conflicts),
        }
    }
}

#[async_trait]
impl EntityStore for ContendedStore {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, StoreError> {
        self.inner.begin().await
    }

    async fn commit(&self, transaction: MemoryTransaction) -> Result<(), StoreError> {
        let remaining = self.conflicts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.conflicts.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Serialization);
        }
        self.inner.commit(transaction).await
    }
}

/// Store whose backend is unreachable.
pub(super) struct UnavailableStore;

#[async_trait]
impl EntityStore for UnavailableStore {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, StoreError> {
        Err(StoreError::Unavailable("database offline".to_string()))
    }

    async fn commit(&self, _transaction: MemoryTransaction) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("database offline".to_string()))
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
