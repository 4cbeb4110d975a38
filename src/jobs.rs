//! Background job manager
//!
//! Long-running host operations (toolpath generation, mesh export) must not
//! pin a connection for their whole duration. `submit` returns a job id
//! immediately and runs the closure on its own worker thread; the client
//! polls for status. Jobs survive the submitting connection.
//!
//! Cancellation is cooperative: `cancel` only raises a flag, and the
//! closure is responsible for checking it at safe checkpoints and bailing
//! out with `BridgeError::Cancelled`. Host-bound work cannot be forcibly
//! preempted; this is a fundamental constraint, not an implementation gap.
//!
//! Completed jobs are retained in a bounded ring: once more than the
//! configured number of jobs exist, the oldest is evicted whether or not
//! its result was ever polled, so long-lived sessions do not leak memory.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};

/// Job lifecycle states. Transitions are monotonic:
/// pending → running → {done, error, cancelled}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error | JobStatus::Cancelled)
    }
}

/// Handle passed to the running closure for cancellation checkpoints.
#[derive(Clone)]
pub struct JobHandle {
    cancel_requested: Arc<AtomicBool>,
}

impl JobHandle {
    /// True once `cancel` was called for this job. Check at safe
    /// checkpoints and return `Err(BridgeError::Cancelled)` to stop early.
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Convenience checkpoint: errors out with `Cancelled` when requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel_requested() {
            Err(BridgeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Mutable per-job state; only the worker thread transitions `status`.
struct JobState {
    status: JobStatus,
    result: Option<Value>,
    error: Option<String>,
}

struct Job {
    id: String,
    label: String,
    created_at_ms: u64,
    state: Mutex<JobState>,
    cancel_requested: Arc<AtomicBool>,
}

/// Point-in-time view of a job, as returned by `poll` and `list`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobSnapshot {
    pub job_id: String,
    pub label: String,
    pub status: JobStatus,
    pub created_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Thread-safe registry of background jobs with bounded retention.
pub struct JobManager {
    jobs: Mutex<VecDeque<Arc<Job>>>,
    retention: usize,
    next_id: AtomicU64,
}

impl JobManager {
    pub fn new(retention: usize) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::with_capacity(retention.min(64))),
            retention: retention.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register and start a job; returns its id immediately.
    ///
    /// The closure runs on a dedicated worker thread. It may call back
    /// into the GUI executor for GUI-touching sub-steps; it must check
    /// `JobHandle::cancel_requested` at its own checkpoints.
    pub fn submit<F>(&self, label: &str, work: F) -> String
    where
        F: FnOnce(&JobHandle) -> Result<Value> + Send + 'static,
    {
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        let job_id = format!("job-{}", seq);
        let cancel = Arc::new(AtomicBool::new(false));

        let job = Arc::new(Job {
            id: job_id.clone(),
            label: label.to_string(),
            created_at_ms: now_ms(),
            state: Mutex::new(JobState {
                status: JobStatus::Pending,
                result: None,
                error: None,
            }),
            cancel_requested: Arc::clone(&cancel),
        });

        {
            let mut jobs = self.jobs.lock().unwrap();
            jobs.push_back(Arc::clone(&job));
            while jobs.len() > self.retention {
                if let Some(evicted) = jobs.pop_front() {
                    debug!(job = %evicted.id, "Evicting job from retention ring");
                }
            }
        }

        info!(job = %job_id, label, "Job submitted");
        let worker_job = Arc::clone(&job);
        thread::Builder::new()
            .name(format!("hostlink-{}", job_id))
            .spawn(move || run_job(worker_job, work))
            .expect("failed to spawn job worker thread");

        job_id
    }

    /// Non-blocking status lookup. Unknown and evicted ids are
    /// indistinguishable: both are `NotFound`.
    pub fn poll(&self, job_id: &str) -> Result<JobSnapshot> {
        let jobs = self.jobs.lock().unwrap();
        jobs.iter()
            .find(|job| job.id == job_id)
            .map(|job| snapshot(job))
            .ok_or_else(|| BridgeError::NotFound(format!("job {}", job_id)))
    }

    /// Request cooperative cancellation. Succeeds (and is idempotent) for
    /// any retained job; the transition to `cancelled` happens when the
    /// worker observes the flag, not here.
    pub fn cancel(&self, job_id: &str) -> Result<JobSnapshot> {
        let jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter()
            .find(|job| job.id == job_id)
            .ok_or_else(|| BridgeError::NotFound(format!("job {}", job_id)))?;
        job.cancel_requested.store(true, Ordering::SeqCst);
        info!(job = %job_id, "Cancellation requested");
        Ok(snapshot(job))
    }

    /// Snapshots of retained jobs, most recent first, optionally filtered
    /// by status.
    pub fn list(&self, filter: Option<JobStatus>) -> Vec<JobSnapshot> {
        let jobs = self.jobs.lock().unwrap();
        jobs.iter()
            .rev()
            .map(|job| snapshot(job))
            .filter(|snap| filter.map_or(true, |f| snap.status == f))
            .collect()
    }

    /// Number of currently retained jobs, for stats.
    pub fn retained(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

fn run_job<F>(job: Arc<Job>, work: F)
where
    F: FnOnce(&JobHandle) -> Result<Value> + Send + 'static,
{
    {
        let mut state = job.state.lock().unwrap();
        state.status = JobStatus::Running;
    }

    let handle = JobHandle {
        cancel_requested: Arc::clone(&job.cancel_requested),
    };
    let outcome = catch_unwind(AssertUnwindSafe(|| work(&handle)));

    let mut state = job.state.lock().unwrap();
    match outcome {
        Ok(Ok(value)) => {
            state.status = JobStatus::Done;
            state.result = Some(value);
            info!(job = %job.id, "Job done");
        }
        Ok(Err(BridgeError::Cancelled)) => {
            state.status = JobStatus::Cancelled;
            info!(job = %job.id, "Job cancelled");
        }
        Ok(Err(e)) => {
            state.status = JobStatus::Error;
            warn!(job = %job.id, code = e.code(), "Job failed: {}", e);
            state.error = Some(e.to_string());
        }
        Err(payload) => {
            state.status = JobStatus::Error;
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            warn!(job = %job.id, "Job panicked: {}", msg);
            state.error = Some(format!("job panicked: {}", msg));
        }
    }
}

fn snapshot(job: &Job) -> JobSnapshot {
    let state = job.state.lock().unwrap();
    JobSnapshot {
        job_id: job.id.clone(),
        label: job.label.clone(),
        status: state.status,
        created_at_ms: job.created_at_ms,
        result: state.result.clone(),
        error: state.error.clone(),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Poll until `job_id` reaches a terminal status or `deadline` passes.
/// Test helper semantics; exposed for embedders that need a join.
pub fn wait_terminal(manager: &JobManager, job_id: &str, deadline: Duration) -> Result<JobSnapshot> {
    let start = std::time::Instant::now();
    loop {
        let snap = manager.poll(job_id)?;
        if snap.status.is_terminal() {
            return Ok(snap);
        }
        if start.elapsed() > deadline {
            return Ok(snap);
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[cfg(test)]
mod jobs_tests {
    use super::*;
    use serde_json::json;

    fn make_manager(retention: usize) -> Arc<JobManager> {
        Arc::new(JobManager::new(retention))
    }

    #[test]
    fn test_submit_returns_id_immediately() {
        let manager = make_manager(8);
        let id = manager.submit("sleepy", |_| {
            thread::sleep(Duration::from_millis(100));
            Ok(json!("late"))
        });
        // Poll works right away, before the job finishes.
        let snap = manager.poll(&id).unwrap();
        assert!(matches!(snap.status, JobStatus::Pending | JobStatus::Running));
        assert_eq!(snap.label, "sleepy");
        assert!(snap.result.is_none());
    }

    #[test]
    fn test_job_completes_with_result() {
        let manager = make_manager(8);
        let id = manager.submit("quick", |_| Ok(json!({"count": 3})));
        let snap = wait_terminal(&manager, &id, Duration::from_secs(2)).unwrap();
        assert_eq!(snap.status, JobStatus::Done);
        assert_eq!(snap.result, Some(json!({"count": 3})));
        assert!(snap.error.is_none());
    }

    #[test]
    fn test_job_error_is_captured() {
        let manager = make_manager(8);
        let id = manager.submit("doomed", |_| {
            Err(BridgeError::Handler("no active document".into()))
        });
        let snap = wait_terminal(&manager, &id, Duration::from_secs(2)).unwrap();
        assert_eq!(snap.status, JobStatus::Error);
        assert_eq!(snap.error.as_deref(), Some("no active document"));
    }

    #[test]
    fn test_job_panic_becomes_error() {
        let manager = make_manager(8);
        let id = manager.submit("bomb", |_| panic!("kaboom"));
        let snap = wait_terminal(&manager, &id, Duration::from_secs(2)).unwrap();
        assert_eq!(snap.status, JobStatus::Error);
        assert!(snap.error.unwrap().contains("kaboom"));
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        let manager = make_manager(8);
        let id = manager.submit("steady", |_| {
            thread::sleep(Duration::from_millis(30));
            Ok(json!(()))
        });

        let mut last_rank = 0u8;
        let rank = |s: JobStatus| match s {
            JobStatus::Pending => 1,
            JobStatus::Running => 2,
            JobStatus::Done | JobStatus::Error | JobStatus::Cancelled => 3,
        };
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let snap = manager.poll(&id).unwrap();
            let r = rank(snap.status);
            assert!(r >= last_rank, "status went backward: {:?}", snap.status);
            last_rank = r;
            if snap.status.is_terminal() || std::time::Instant::now() > deadline {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(last_rank, 3);
    }

    #[test]
    fn test_cooperative_cancel() {
        let manager = make_manager(8);
        let id = manager.submit("patient", |handle| {
            for _ in 0..200 {
                handle.checkpoint()?;
                thread::sleep(Duration::from_millis(5));
            }
            Ok(json!("ran to completion"))
        });

        // Let it start, then cancel.
        thread::sleep(Duration::from_millis(20));
        let snap = manager.cancel(&id).unwrap();
        assert!(!snap.status.is_terminal() || snap.status == JobStatus::Cancelled);

        let snap = wait_terminal(&manager, &id, Duration::from_secs(3)).unwrap();
        assert_eq!(snap.status, JobStatus::Cancelled);
        assert!(snap.result.is_none());
    }

    #[test]
    fn test_cancel_unknown_job() {
        let manager = make_manager(8);
        assert!(matches!(
            manager.cancel("job-999"),
            Err(BridgeError::NotFound(_))
        ));
    }

    #[test]
    fn test_retention_ring_evicts_oldest() {
        let manager = make_manager(3);
        let first = manager.submit("j0", |_| Ok(json!(0)));
        let mut rest = Vec::new();
        for i in 1..=3 {
            rest.push(manager.submit("jn", move |_| Ok(json!(i))));
        }

        // Capacity 3, four submissions: the first is evicted even though it
        // was never polled.
        assert!(matches!(
            manager.poll(&first),
            Err(BridgeError::NotFound(_))
        ));
        for id in &rest {
            assert!(manager.poll(id).is_ok());
        }
        assert_eq!(manager.retained(), 3);
    }

    #[test]
    fn test_list_is_most_recent_first_and_filters() {
        let manager = make_manager(8);
        let a = manager.submit("a", |_| Ok(json!("a")));
        wait_terminal(&manager, &a, Duration::from_secs(2)).unwrap();
        let b = manager.submit("b", |_| Err(BridgeError::Handler("x".into())));
        wait_terminal(&manager, &b, Duration::from_secs(2)).unwrap();

        let all = manager.list(None);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].job_id, b);
        assert_eq!(all[1].job_id, a);

        let done = manager.list(Some(JobStatus::Done));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].job_id, a);
    }
}
