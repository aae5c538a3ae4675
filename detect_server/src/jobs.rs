//! Registry of detection jobs.
//!
//! Every upload and every webcam session is a job with its own id and output directory. "The
//! latest result" of a user is the job that finished last, looked up here and never by inspecting
//! directories on disk. Only the most recent completed jobs of each owner and kind are kept.
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Image,
    Video,
    Webcam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: Uuid,
    /// Owner, `None` for feeds opened without logging in.
    pub user_id: Option<i64>,
    pub kind: JobKind,
    pub status: JobStatus,
    /// File the annotated output is written to.
    pub output: PathBuf,
    /// Submission order, increasing across all jobs.
    pub seq: u64,
    /// Completion order, set once the job is finished or failed.
    pub done_seq: Option<u64>,
}

/// Completed jobs kept per owner and kind.
pub const KEPT_JOBS: usize = 32;

pub struct JobRegistry {
    jobs: Mutex<HashMap<Uuid, Job>>,
    live: Mutex<HashMap<Uuid, CancellationToken>>,
    seq: AtomicU64,
    keep: usize,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::with_retention(KEPT_JOBS)
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry keeping `keep` completed jobs per owner and kind. Running jobs are always kept.
    pub fn with_retention(keep: usize) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            live: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            keep: keep.max(1),
        }
    }

    /// Register a new running job.
    pub fn create(&self, id: Uuid, user_id: Option<i64>, kind: JobKind, output: PathBuf) -> Job {
        let job = Job {
            id,
            user_id,
            kind,
            status: JobStatus::Running,
            output,
            seq: self.next_seq(),
            done_seq: None,
        };
        self.lock_jobs().insert(id, job.clone());
        log::debug!("Created {:?} job {}", kind, id);
        job
    }

    pub fn set_status(&self, id: Uuid, status: JobStatus) {
        let mut jobs = self.lock_jobs();
        let (kind, user_id) = match jobs.get_mut(&id) {
            Some(job) => {
                job.status = status;
                if status == JobStatus::Running {
                    return;
                }
                job.done_seq = Some(self.next_seq());
                (job.kind, job.user_id)
            }
            None => return,
        };
        self.evict_old(&mut jobs, kind, user_id);
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.lock_jobs().get(&id).cloned()
    }

    /// Job of a kind that finished last, optionally limited to one user.
    pub fn latest_finished(&self, kind: JobKind, user_id: Option<i64>) -> Option<Job> {
        self.lock_jobs()
            .values()
            .filter(|job| job.kind == kind && job.status == JobStatus::Finished)
            .filter(|job| user_id.map_or(true, |user_id| job.user_id == Some(user_id)))
            .max_by_key(|job| job.done_seq)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register the cancellation token of a live feed.
    pub fn register_live(&self, id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock_live().insert(id, token.clone());
        token
    }

    /// Stop a live feed. Returns `false` if no such feed is running.
    pub fn stop_live(&self, id: Uuid) -> bool {
        match self.lock_live().remove(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn unregister_live(&self, id: Uuid) {
        self.lock_live().remove(&id);
    }

    pub fn live_count(&self) -> usize {
        self.lock_live().len()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop the oldest completed jobs of an owner and kind beyond the retention limit.
    ///
    /// Output files stay on disk.
    fn evict_old(&self, jobs: &mut HashMap<Uuid, Job>, kind: JobKind, user_id: Option<i64>) {
        let mut done: Vec<(u64, Uuid)> = jobs
            .values()
            .filter(|job| job.kind == kind && job.user_id == user_id)
            .filter_map(|job| job.done_seq.map(|done_seq| (done_seq, job.id)))
            .collect();
        if done.len() <= self.keep {
            return;
        }

        done.sort_unstable();
        let evicted = done.len() - self.keep;
        for (_, id) in done.into_iter().take(evicted) {
            jobs.remove(&id);
        }
        log::debug!("Evicted {} old {:?} jobs", evicted, kind);
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_live(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }
}
