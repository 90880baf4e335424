//! Background rebuild scheduling with job coalescing.
//!
//! A [`Scheduler`] owns a pool of worker threads and a [`JobTable`] of
//! in-flight job descriptors. Every submitted job names the artifacts it will
//! recompute per unit (an [`AffectedSet`]). At submission time, under the
//! table lock:
//!
//! - a queued job whose affected set covers the new one absorbs it (the new
//!   job never runs and reports [`JobStatus::Coalesced`]);
//! - every queued or running job the new one covers is cancelled.
//!
//! Running jobs never absorb new work since they may already have passed the
//! artifacts in question. Cancellation is cooperative: tasks check their
//! [`CancelToken`] between units.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::types::{ArtifactPath, UnitId};

// ============================================================================
// Affected Sets
// ============================================================================

/// Artifacts to recompute, grouped by unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffectedSet {
    units: BTreeMap<UnitId, BTreeSet<ArtifactPath>>,
}

impl AffectedSet {
    pub fn new() -> Self {
        AffectedSet::default()
    }

    /// All `artifacts` of a single unit.
    pub fn for_unit<I, A>(unit: UnitId, artifacts: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<ArtifactPath>,
    {
        let mut set = AffectedSet::new();
        for artifact in artifacts {
            set.insert(unit.clone(), artifact.into());
        }
        set
    }

    pub fn insert(&mut self, unit: UnitId, artifact: ArtifactPath) {
        self.units.entry(unit).or_default().insert(artifact);
    }

    pub fn merge(&mut self, other: AffectedSet) {
        for (unit, artifacts) in other.units {
            self.units.entry(unit).or_default().extend(artifacts);
        }
    }

    /// Every (unit, artifact) pair of `other` is also in `self`.
    pub fn covers(&self, other: &AffectedSet) -> bool {
        other.units.iter().all(|(unit, artifacts)| {
            self.units
                .get(unit)
                .is_some_and(|mine| artifacts.is_subset(mine))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UnitId, &BTreeSet<ArtifactPath>)> {
        self.units.iter()
    }

    pub fn units(&self) -> impl Iterator<Item = &UnitId> {
        self.units.keys()
    }

    /// Number of (unit, artifact) pairs.
    pub fn len(&self) -> usize {
        self.units.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Cancellation and Status
// ============================================================================

/// Cooperative cancellation flag shared between a job and the scheduler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Lifecycle of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    /// Cancelled by a covering job or by shutdown.
    Cancelled,
    /// Absorbed at submission by a queued job covering it; never ran.
    Coalesced,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Coalesced
        )
    }

    /// Did no (or only partial) work because other work made it redundant.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobStatus::Cancelled | JobStatus::Coalesced)
    }
}

pub type JobId = u64;

#[derive(Debug)]
struct JobState {
    status: Mutex<JobStatus>,
    finished: Condvar,
    cancel: CancelToken,
}

impl JobState {
    fn new(status: JobStatus) -> Arc<Self> {
        Arc::new(JobState {
            status: Mutex::new(status),
            finished: Condvar::new(),
            cancel: CancelToken::new(),
        })
    }

    fn status(&self) -> JobStatus {
        *self.status.lock()
    }

    fn set(&self, status: JobStatus) {
        *self.status.lock() = status;
        if status.is_finished() {
            self.finished.notify_all();
        }
    }
}

/// Caller's view of a submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    state: Arc<JobState>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    /// Request cancellation. A queued job will not run; a running one stops
    /// at its next unit boundary.
    pub fn cancel(&self) {
        self.state.cancel.cancel();
    }

    /// Block until the job has finished in any way.
    pub fn wait(&self) -> JobStatus {
        let mut status = self.state.status.lock();
        while !status.is_finished() {
            self.state.finished.wait(&mut status);
        }
        *status
    }
}

// ============================================================================
// Job Table
// ============================================================================

#[derive(Debug)]
struct JobEntry {
    id: JobId,
    affected: Arc<AffectedSet>,
    state: Arc<JobState>,
}

/// Outcome of admitting a job into the table.
#[derive(Debug)]
pub enum Admission {
    /// Absorbed by the queued job with this id.
    Coalesced(JobId),
    /// Admitted; the listed jobs were cancelled because it covers them.
    Admitted { cancelled: Vec<JobId> },
}

/// Scheduler-owned table of in-flight job descriptors.
#[derive(Debug, Default)]
pub struct JobTable {
    entries: Vec<JobEntry>,
}

impl JobTable {
    fn admit(&mut self, id: JobId, affected: &Arc<AffectedSet>, state: &Arc<JobState>) -> Admission {
        // Only queued jobs absorb: a running one may be past these artifacts.
        if let Some(existing) = self.entries.iter().find(|e| {
            e.state.status() == JobStatus::Queued
                && !e.state.cancel.is_cancelled()
                && e.affected.covers(affected)
        }) {
            return Admission::Coalesced(existing.id);
        }

        let mut cancelled = Vec::new();
        for entry in &self.entries {
            if affected.covers(&entry.affected) && !entry.state.cancel.is_cancelled() {
                entry.state.cancel.cancel();
                cancelled.push(entry.id);
            }
        }
        self.entries.push(JobEntry {
            id,
            affected: Arc::clone(affected),
            state: Arc::clone(state),
        });
        Admission::Admitted { cancelled }
    }

    /// Move a queued job to running. Returns `false` if it was cancelled first.
    fn start(&mut self, id: JobId) -> bool {
        match self.entries.iter().find(|e| e.id == id) {
            Some(entry) if !entry.state.cancel.is_cancelled() => {
                entry.state.set(JobStatus::Running);
                true
            }
            _ => false,
        }
    }

    fn finish(&mut self, id: JobId) {
        self.entries.retain(|e| e.id != id);
    }

    /// Cancel jobs whose only unit is `unit`.
    fn cancel_unit(&self, unit: &UnitId) -> Vec<JobId> {
        let mut cancelled = Vec::new();
        for entry in &self.entries {
            let only_unit = entry.affected.units().all(|u| u == unit);
            if only_unit && !entry.affected.is_empty() && !entry.state.cancel.is_cancelled() {
                entry.state.cancel.cancel();
                cancelled.push(entry.id);
            }
        }
        cancelled
    }

    fn cancel_all(&self) {
        for entry in &self.entries {
            entry.state.cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Tasks and Workers
// ============================================================================

/// Work performed for each unit of a job.
pub trait RebuildTask: Send + Sync + 'static {
    /// Short name used for worker threads and logs.
    fn name(&self) -> &str;

    /// Recompute `artifacts` of `unit`.
    fn rebuild_unit(&self, unit: &UnitId, artifacts: &BTreeSet<ArtifactPath>, cancel: &CancelToken);
}

struct QueuedJob {
    id: JobId,
    affected: Arc<AffectedSet>,
    state: Arc<JobState>,
}

struct Shared {
    task: Arc<dyn RebuildTask>,
    table: Mutex<JobTable>,
    pending: Mutex<usize>,
    idle: Condvar,
}

impl Shared {
    fn job_done(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    fn run(&self, job: QueuedJob) {
        let started = self.table.lock().start(job.id);
        if !started {
            debug!(job = job.id, task = self.task.name(), "job cancelled before start");
            self.table.lock().finish(job.id);
            job.state.set(JobStatus::Cancelled);
            self.job_done();
            return;
        }

        let mut processed = 0usize;
        for (unit, artifacts) in job.affected.iter() {
            if job.state.cancel.is_cancelled() {
                break;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                self.task.rebuild_unit(unit, artifacts, &job.state.cancel)
            }));
            if outcome.is_err() {
                error!(job = job.id, unit = %unit, task = self.task.name(), "rebuild panicked");
            }
            processed += 1;
        }

        let status = if job.state.cancel.is_cancelled() {
            JobStatus::Cancelled
        } else {
            JobStatus::Completed
        };
        debug!(job = job.id, task = self.task.name(), units = processed, ?status, "job finished");
        self.table.lock().finish(job.id);
        job.state.set(status);
        self.job_done();
    }
}

/// Worker pool running [`RebuildTask`] jobs with coalescing.
pub struct Scheduler {
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<QueuedJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl Scheduler {
    /// Start `workers` threads (at least one) for `task`.
    pub fn new(task: Arc<dyn RebuildTask>, workers: usize) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<QueuedJob>();
        let receiver = Arc::new(Mutex::new(receiver));
        let shared = Arc::new(Shared {
            task,
            table: Mutex::new(JobTable::default()),
            pending: Mutex::new(0),
            idle: Condvar::new(),
        });

        let mut handles = Vec::new();
        for worker_id in 0..workers.max(1) {
            handles.push(spawn_worker(worker_id, Arc::clone(&shared), Arc::clone(&receiver))?);
        }
        info!(task = shared.task.name(), workers = handles.len(), "rebuild scheduler started");

        Ok(Scheduler {
            shared,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            next_id: AtomicU64::new(1),
        })
    }

    /// Submit a job, coalescing it against in-flight work.
    pub fn submit(&self, affected: AffectedSet) -> JobHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let affected = Arc::new(affected);
        let state = JobState::new(JobStatus::Queued);
        let handle = JobHandle {
            id,
            state: Arc::clone(&state),
        };

        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            state.set(JobStatus::Cancelled);
            return handle;
        };

        // The table lock is held across send so workers see the entry first.
        let mut table = self.shared.table.lock();
        match table.admit(id, &affected, &state) {
            Admission::Coalesced(by) => {
                debug!(job = id, absorbed_by = by, task = self.shared.task.name(), "job coalesced");
                state.set(JobStatus::Coalesced);
            }
            Admission::Admitted { cancelled } => {
                if !cancelled.is_empty() {
                    debug!(job = id, ?cancelled, task = self.shared.task.name(), "cancelled covered jobs");
                }
                *self.shared.pending.lock() += 1;
                let queued = QueuedJob {
                    id,
                    affected,
                    state: Arc::clone(&state),
                };
                if sender.send(queued).is_err() {
                    table.finish(id);
                    state.set(JobStatus::Cancelled);
                    drop(table);
                    self.shared.job_done();
                }
            }
        }
        handle
    }

    /// Block until every admitted job has finished.
    pub fn wait_idle(&self) {
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            self.shared.idle.wait(&mut pending);
        }
    }

    /// Cancel in-flight jobs that only concern `unit`. Jobs spanning other
    /// units keep running; their writes for `unit` are refused by the
    /// registry once the unit is retired.
    pub fn cancel_unit(&self, unit: &UnitId) -> usize {
        let cancelled = self.shared.table.lock().cancel_unit(unit);
        if !cancelled.is_empty() {
            debug!(unit = %unit, ?cancelled, task = self.shared.task.name(), "cancelled jobs for removed unit");
        }
        cancelled.len()
    }

    /// Number of jobs queued or running.
    pub fn in_flight(&self) -> usize {
        self.shared.table.lock().len()
    }

    /// Cancel all in-flight work and join the workers. Idempotent.
    pub fn shutdown(&self) {
        let sender = self.sender.lock().take();
        if sender.is_none() {
            return;
        }
        self.shared.table.lock().cancel_all();
        drop(sender);

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                error!(task = self.shared.task.name(), "rebuild worker panicked");
            }
        }
        info!(task = self.shared.task.name(), "rebuild scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(
    worker_id: usize,
    shared: Arc<Shared>,
    receiver: Arc<Mutex<Receiver<QueuedJob>>>,
) -> io::Result<JoinHandle<()>> {
    let name = format!("weavemark-{}-{}", shared.task.name(), worker_id);
    thread::Builder::new().name(name).spawn(move || loop {
        let next = receiver.lock().recv();
        match next {
            Ok(job) => shared.run(job),
            Err(_) => break,
        }
    })
}

// ============================================================================
// Tests
// ============================================================================
