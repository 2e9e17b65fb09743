//! In-memory [`EntityStore`] with optional JSON snapshot durability.
//!
//! Transactions work on a private copy of the tables. A transaction holds the
//! store's writer gate from `begin` until it is committed or dropped, so units
//! of work touching different guardians queue behind each other instead of
//! failing. Readers only take the table lock for the length of a clone. Every
//! wait is bounded by the configured timeout.
//!
//! A persisted store takes an exclusive lock on `<snapshot>.lock` for its whole
//! lifetime; a second process opening the same snapshot is refused.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, RwLockReadGuard};
use tracing::debug;

use super::{
    EntityStore, GuardianUpsert, NestedPlan, PlannedStudentRef, StoreError, StoreTotals,
    StoreTransaction,
};
use crate::enrollment::domain::{
    Aggregate, ApprovalState, Guardian, GuardianId, GuardianIdentity, Student, StudentId,
    SubmissionFilter, Tutor, TutorId,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    guardians: BTreeMap<GuardianId, Guardian>,
    students: BTreeMap<StudentId, Student>,
    tutors: BTreeMap<TutorId, Tutor>,
    next_guardian: u64,
    next_student: u64,
    next_tutor: u64,
}

/// On-disk form of [`Tables`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    guardians: Vec<Guardian>,
    students: Vec<Student>,
    tutors: Vec<Tutor>,
    next_guardian: u64,
    next_student: u64,
    next_tutor: u64,
}

impl From<&Tables> for Snapshot {
    fn from(tables: &Tables) -> Self {
        Self {
            guardians: tables.guardians.values().cloned().collect(),
            students: tables.students.values().cloned().collect(),
            tutors: tables.tutors.values().cloned().collect(),
            next_guardian: tables.next_guardian,
            next_student: tables.next_student,
            next_tutor: tables.next_tutor,
        }
    }
}

impl From<Snapshot> for Tables {
    fn from(snapshot: Snapshot) -> Self {
        let mut tables = Tables {
            next_guardian: snapshot.next_guardian,
            next_student: snapshot.next_student,
            next_tutor: snapshot.next_tutor,
            ..Tables::default()
        };
        for guardian in snapshot.guardians {
            tables.next_guardian = tables.next_guardian.max(guardian.id.0);
            tables.guardians.insert(guardian.id, guardian);
        }
        for student in snapshot.students {
            tables.next_student = tables.next_student.max(student.id.0);
            tables.students.insert(student.id, student);
        }
        for tutor in snapshot.tutors {
            tables.next_tutor = tables.next_tutor.max(tutor.id.0);
            tables.tutors.insert(tutor.id, tutor);
        }
        tables
    }
}

impl Tables {
    fn guardian_by_identity(&self, identity: &GuardianIdentity) -> Option<&Guardian> {
        self.guardians
            .values()
            .find(|guardian| &guardian.identity == identity)
    }

    fn aggregate(&self, guardian_id: GuardianId) -> Option<Aggregate> {
        let guardian = self.guardians.get(&guardian_id)?.clone();
        let students: Vec<Student> = self
            .students
            .values()
            .filter(|student| student.guardian_id == guardian_id)
            .cloned()
            .collect();
        let owned: BTreeSet<StudentId> = students.iter().map(|student| student.id).collect();
        let tutors = self
            .tutors
            .values()
            .filter(|tutor| owned.contains(&tutor.student_id))
            .cloned()
            .collect();
        Some(Aggregate {
            guardian,
            students,
            tutors,
        })
    }

    fn remove_student(&mut self, student_id: StudentId) {
        self.students.remove(&student_id);
        self.tutors.retain(|_, tutor| tutor.student_id != student_id);
    }

    /// Every student has its guardian and every tutor its student.
    fn check_integrity(&self) -> Result<(), StoreError> {
        if let Some(student) = self
            .students
            .values()
            .find(|student| !self.guardians.contains_key(&student.guardian_id))
        {
            return Err(StoreError::Integrity(format!(
                "student {} references missing guardian {}",
                student.id, student.guardian_id
            )));
        }
        if let Some(tutor) = self
            .tutors
            .values()
            .find(|tutor| !self.students.contains_key(&tutor.student_id))
        {
            return Err(StoreError::Integrity(format!(
                "tutor {} references missing student {}",
                tutor.id, tutor.student_id
            )));
        }
        Ok(())
    }

    fn find_expired_pending(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Vec<Guardian> {
        self.guardians
            .values()
            .filter(|guardian| guardian.is_expired(cutoff, now))
            .cloned()
            .collect()
    }

    fn list_aggregates(&self, filter: SubmissionFilter) -> Vec<Aggregate> {
        self.guardians
            .values()
            .filter(|guardian| filter.matches(guardian))
            .filter_map(|guardian| self.aggregate(guardian.id))
            .collect()
    }

    fn totals(&self) -> StoreTotals {
        let mut totals = StoreTotals {
            guardians: self.guardians.len(),
            students: self.students.len(),
            tutors: self.tutors.len(),
            ..StoreTotals::default()
        };
        for guardian in self.guardians.values() {
            match guardian.approval {
                ApprovalState::Pending => totals.pending += 1,
                ApprovalState::Approved => totals.approved += 1,
                ApprovalState::Rejected => totals.rejected += 1,
            }
        }
        totals
    }
}

/// Exclusive advisory lock on the snapshot, held while the store is open.
#[derive(Debug)]
struct SnapshotLock {
    file: File,
}

impl SnapshotLock {
    fn acquire(snapshot: &Path) -> Result<Self, StoreError> {
        let path = snapshot.with_extension("lock");
        let unavailable = |err: std::io::Error| {
            StoreError::Unavailable(format!("cannot open lock file {}: {err}", path.display()))
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(unavailable)?;

        if file.try_lock_exclusive().is_err() {
            let mut holder = String::new();
            let _ = file.read_to_string(&mut holder);
            let holder = match holder.trim() {
                "" => "another process".to_string(),
                pid => format!("process {pid}"),
            };
            return Err(StoreError::Locked {
                path: snapshot.display().to_string(),
                holder,
            });
        }

        file.set_len(0).map_err(unavailable)?;
        file.seek(SeekFrom::Start(0)).map_err(unavailable)?;
        writeln!(file, "{}", std::process::id()).map_err(unavailable)?;
        file.sync_all().map_err(unavailable)?;
        Ok(Self { file })
    }
}

impl Drop for SnapshotLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Thread-safe in-memory store; suitable for tests, demos and single-process deployments.
#[derive(Debug)]
pub struct InMemoryEntityStore {
    state: RwLock<Tables>,
    writer: Arc<Mutex<()>>,
    timeout: Duration,
    snapshot_path: Option<PathBuf>,
    _lock: Option<SnapshotLock>,
}

impl Default for InMemoryEntityStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl InMemoryEntityStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: RwLock::new(Tables::default()),
            writer: Arc::new(Mutex::new(())),
            timeout,
            snapshot_path: None,
            _lock: None,
        }
    }

    /// Opens a store persisted at `path`, loading the snapshot if the file exists.
    ///
    /// Fails with [`StoreError::Locked`] while another open store holds the snapshot.
    pub async fn open(path: impl Into<PathBuf>, timeout: Duration) -> Result<Self, StoreError> {
        let path = path.into();
        let lock = SnapshotLock::acquire(&path)?;
        let tables = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes).map_err(|err| {
                    StoreError::Unavailable(format!("corrupt snapshot {}: {err}", path.display()))
                })?;
                let tables = Tables::from(snapshot);
                tables.check_integrity()?;
                tables
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(err) => {
                return Err(StoreError::Unavailable(format!(
                    "cannot read snapshot {}: {err}",
                    path.display()
                )))
            }
        };

        Ok(Self {
            state: RwLock::new(tables),
            writer: Arc::new(Mutex::new(())),
            timeout,
            snapshot_path: Some(path),
            _lock: Some(lock),
        })
    }

    async fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        tokio::time::timeout(self.timeout, self.state.read())
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))
    }

    /// Writes the tables to a synced temp file, then renames it over the snapshot.
    async fn persist(path: &Path, tables: &Tables) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&Snapshot::from(tables))
            .map_err(|err| StoreError::Unavailable(format!("cannot encode snapshot: {err}")))?;
        let staging = path.with_extension("tmp");
        let write_failed =
            |err: std::io::Error| StoreError::Unavailable(format!("cannot write snapshot: {err}"));

        let mut file = tokio::fs::File::create(&staging)
            .await
            .map_err(write_failed)?;
        file.write_all(&bytes).await.map_err(write_failed)?;
        file.sync_all().await.map_err(write_failed)?;
        drop(file);

        tokio::fs::rename(&staging, path)
            .await
            .map_err(|err| StoreError::Unavailable(format!("cannot replace snapshot: {err}")))
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, StoreError> {
        let writer = tokio::time::timeout(self.timeout, self.writer.clone().lock_owned())
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?;
        let tables = self.read().await?.clone();
        Ok(MemoryTransaction {
            tables,
            dirty: false,
            writer,
        })
    }

    async fn commit(&self, transaction: MemoryTransaction) -> Result<(), StoreError> {
        let MemoryTransaction {
            tables,
            dirty,
            writer,
        } = transaction;
        if !dirty {
            return Ok(());
        }

        tables.check_integrity()?;
        if let Some(path) = &self.snapshot_path {
            tokio::time::timeout(self.timeout, Self::persist(path, &tables))
                .await
                .map_err(|_| StoreError::Timeout(self.timeout))??;
        }

        let mut committed = tokio::time::timeout(self.timeout, self.state.write())
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?;
        *committed = tables;
        drop(committed);
        drop(writer);
        debug!("enrollment transaction committed");
        Ok(())
    }

    async fn get_submission(
        &self,
        identity: &GuardianIdentity,
    ) -> Result<Option<Aggregate>, StoreError> {
        let tables = self.read().await?;
        Ok(tables
            .guardian_by_identity(identity)
            .and_then(|guardian| tables.aggregate(guardian.id)))
    }

    async fn get_aggregate(&self, guardian_id: GuardianId) -> Result<Option<Aggregate>, StoreError> {
        Ok(self.read().await?.aggregate(guardian_id))
    }

    async fn find_expired_pending(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Guardian>, StoreError> {
        Ok(self.read().await?.find_expired_pending(cutoff, now))
    }

    async fn list_aggregates(&self, filter: SubmissionFilter) -> Result<Vec<Aggregate>, StoreError> {
        Ok(self.read().await?.list_aggregates(filter))
    }

    async fn totals(&self) -> Result<StoreTotals, StoreError> {
        Ok(self.read().await?.totals())
    }
}

/// Private copy of the tables plus the writer gate it holds until commit or drop.
#[derive(Debug)]
pub struct MemoryTransaction {
    tables: Tables,
    dirty: bool,
    writer: OwnedMutexGuard<()>,
}

impl StoreTransaction for MemoryTransaction {
    fn get_submission(&self, identity: &GuardianIdentity) -> Option<Aggregate> {
        self.tables
            .guardian_by_identity(identity)
            .and_then(|guardian| self.tables.aggregate(guardian.id))
    }

    fn get_aggregate(&self, guardian_id: GuardianId) -> Option<Aggregate> {
        self.tables.aggregate(guardian_id)
    }

    fn upsert_guardian(&mut self, upsert: GuardianUpsert) -> Result<Guardian, StoreError> {
        let existing = self
            .tables
            .guardian_by_identity(&upsert.identity)
            .map(|guardian| guardian.id);

        let taken = self.tables.guardians.values().any(|guardian| {
            guardian.national_id == upsert.national_id && Some(guardian.id) != existing
        });
        if taken {
            return Err(StoreError::DuplicateNationalId {
                national_id: upsert.national_id,
            });
        }

        self.dirty = true;
        let guardian = match existing.and_then(|id| self.tables.guardians.get_mut(&id)) {
            Some(guardian) => {
                guardian.national_id = upsert.national_id;
                guardian.phone = upsert.phone;
                if upsert.email.is_some() {
                    guardian.email = upsert.email;
                }
                if upsert.reset_to_pending {
                    guardian.approval = ApprovalState::Pending;
                    guardian.submitted_at = upsert.now;
                    guardian.expires_at = upsert.expires_at;
                    guardian.decided_at = None;
                }
                guardian.clone()
            }
            None => {
                self.tables.next_guardian += 1;
                let guardian = Guardian {
                    id: GuardianId(self.tables.next_guardian),
                    identity: upsert.identity,
                    national_id: upsert.national_id,
                    phone: upsert.phone,
                    email: upsert.email,
                    approval: ApprovalState::Pending,
                    submitted_at: upsert.now,
                    expires_at: upsert.expires_at,
                    decided_at: None,
                };
                self.tables.guardians.insert(guardian.id, guardian.clone());
                guardian
            }
        };
        Ok(guardian)
    }

    fn replace_students_and_tutors(
        &mut self,
        guardian_id: GuardianId,
        plan: &NestedPlan,
    ) -> Result<(), StoreError> {
        if !self.tables.guardians.contains_key(&guardian_id) {
            return Err(StoreError::NotFound);
        }

        // Work on a copy so a rejected plan leaves the transaction untouched.
        let mut tables = self.tables.clone();
        let owns_student = |tables: &Tables, id: StudentId| {
            tables
                .students
                .get(&id)
                .is_some_and(|student| student.guardian_id == guardian_id)
        };
        let owns_tutor = |tables: &Tables, id: TutorId| {
            tables
                .tutors
                .get(&id)
                .is_some_and(|tutor| owns_student(tables, tutor.student_id))
        };

        for id in &plan.tutor_deletes {
            if !owns_tutor(&tables, *id) {
                return Err(StoreError::Integrity(format!(
                    "tutor {id} is not part of guardian {guardian_id}"
                )));
            }
            tables.tutors.remove(id);
        }
        for (id, fields) in &plan.student_updates {
            match tables.students.get_mut(id) {
                Some(student) if student.guardian_id == guardian_id => {
                    student.fields = fields.clone();
                }
                _ => {
                    return Err(StoreError::Integrity(format!(
                        "student {id} is not owned by guardian {guardian_id}"
                    )))
                }
            }
        }

        let mut created: HashMap<usize, StudentId> = HashMap::new();
        for (index, fields) in plan.student_creates.iter().enumerate() {
            tables.next_student += 1;
            let id = StudentId(tables.next_student);
            tables.students.insert(
                id,
                Student {
                    id,
                    guardian_id,
                    fields: fields.clone(),
                },
            );
            created.insert(index, id);
        }

        let resolve = |tables: &Tables, reference: PlannedStudentRef| match reference {
            PlannedStudentRef::Stored(id) if owns_student(tables, id) => Ok(id),
            PlannedStudentRef::Created(index) => created.get(&index).copied().ok_or_else(|| {
                StoreError::Integrity(format!("no planned student at position {index}"))
            }),
            PlannedStudentRef::Stored(id) => Err(StoreError::Integrity(format!(
                "student {id} is not owned by guardian {guardian_id}"
            ))),
        };

        for update in &plan.tutor_updates {
            let student_id = resolve(&tables, update.student)?;
            if !owns_tutor(&tables, update.id) {
                return Err(StoreError::Integrity(format!(
                    "tutor {} is not part of guardian {guardian_id}",
                    update.id
                )));
            }
            if let Some(tutor) = tables.tutors.get_mut(&update.id) {
                tutor.student_id = student_id;
                tutor.fields = update.fields.clone();
            }
        }

        for create in &plan.tutor_creates {
            let student_id = resolve(&tables, create.student)?;
            tables.next_tutor += 1;
            let id = TutorId(tables.next_tutor);
            tables.tutors.insert(
                id,
                Tutor {
                    id,
                    student_id,
                    fields: create.fields.clone(),
                },
            );
        }

        // Last, so tutors moved off a removed student are re-pointed before the cascade.
        for id in &plan.student_deletes {
            if !owns_student(&tables, *id) {
                return Err(StoreError::Integrity(format!(
                    "student {id} is not owned by guardian {guardian_id}"
                )));
            }
            tables.remove_student(*id);
        }

        self.tables = tables;
        self.dirty = true;
        Ok(())
    }

    fn set_approval(
        &mut self,
        guardian_id: GuardianId,
        state: ApprovalState,
        at: DateTime<Utc>,
    ) -> Result<Guardian, StoreError> {
        let guardian = self
            .tables
            .guardians
            .get_mut(&guardian_id)
            .ok_or(StoreError::NotFound)?;
        guardian.approval = state;
        guardian.decided_at = state.is_decided().then_some(at);
        self.dirty = true;
        Ok(guardian.clone())
    }

    fn delete_aggregate(&mut self, guardian_id: GuardianId) -> Result<Aggregate, StoreError> {
        let aggregate = self
            .tables
            .aggregate(guardian_id)
            .ok_or(StoreError::NotFound)?;
        for student in &aggregate.students {
            self.tables.remove_student(student.id);
        }
        self.tables.guardians.remove(&guardian_id);
        self.dirty = true;
        Ok(aggregate)
    }

    fn find_expired_pending(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Vec<Guardian> {
        self.tables.find_expired_pending(cutoff, now)
    }

    fn list_aggregates(&self, filter: SubmissionFilter) -> Vec<Aggregate> {
        self.tables.list_aggregates(filter)
    }

    fn totals(&self) -> StoreTotals {
        self.tables.totals()
    }
}
