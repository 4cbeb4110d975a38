//! GUI-affinity task executor
//!
//! The host toolkit has exactly one thread that may legally touch GUI and
//! document state; calling in from any other thread deadlocks against the
//! toolkit's internal locking. This module serializes such work onto one
//! designated consumer:
//!
//! - `GuiExecutor` is the submitter handle held by connection threads and
//!   background jobs. `submit_and_wait` enqueues a closure and blocks on a
//!   per-task reply slot until the result arrives or the wait times out.
//! - `GuiDrain` owns the receiving end. Whichever thread owns it is the
//!   designated GUI thread: it calls `tick()` from the host's event loop,
//!   or `run()` when the bridge runs headless. Receiver ownership makes a
//!   second consumer a compile error, not a race.
//!
//! Tasks execute strictly in enqueue order, one at a time, never preempted.
//! A wait timeout releases the caller but does NOT cancel the task: work
//! already committed to the single thread cannot be safely preempted, so
//! the task runs (or stays queued) to completion and its eventual reply is
//! discarded. Liveness for the client is bounded; the work itself is not.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error, warn};

use crate::error::{BridgeError, Result};

/// A unit of work bound to the GUI thread.
///
/// Owned exclusively by the executor from enqueue to completion; the
/// outcome travels back through `reply`, never through shared state.
struct GuiTask<R> {
    id: u64,
    enqueued_at: Instant,
    run: Box<dyn FnOnce() -> Result<R> + Send>,
    reply: Sender<Result<R>>,
}

/// Submitter handle. Clone freely; all clones feed one queue.
pub struct GuiExecutor<R> {
    queue: Sender<GuiTask<R>>,
    depth: usize,
    default_wait: Duration,
    next_id: Arc<AtomicU64>,
}

impl<R> Clone for GuiExecutor<R> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            depth: self.depth,
            default_wait: self.default_wait,
            next_id: Arc::clone(&self.next_id),
        }
    }
}

/// Consuming half. Owned by the designated GUI thread.
pub struct GuiDrain<R> {
    queue: Receiver<GuiTask<R>>,
}

/// Create a connected executor/drain pair.
///
/// `queue_depth` caps pending tasks; submissions beyond it fail fast with
/// `Backpressure` instead of growing without bound. `default_wait` applies
/// when `submit_and_wait` is called without an explicit timeout.
pub fn gui_channel<R>(queue_depth: usize, default_wait: Duration) -> (GuiExecutor<R>, GuiDrain<R>) {
    let (tx, rx) = bounded(queue_depth);
    (
        GuiExecutor {
            queue: tx,
            depth: queue_depth,
            default_wait,
            next_id: Arc::new(AtomicU64::new(1)),
        },
        GuiDrain { queue: rx },
    )
}

impl<R: Send + 'static> GuiExecutor<R> {
    /// Enqueue `task` for the GUI thread and block until its result
    /// arrives or `wait` (default: the configured wait) elapses.
    ///
    /// Timeout returns `GuiTimeout` to this caller only; the task is not
    /// cancelled and later tasks are unaffected. A full queue returns
    /// `Backpressure` without enqueueing.
    pub fn submit_and_wait<F>(&self, task: F, wait: Option<Duration>) -> Result<R>
    where
        F: FnOnce() -> Result<R> + Send + 'static,
    {
        let wait = wait.unwrap_or(self.default_wait);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = bounded(1);

        let gui_task = GuiTask {
            id,
            enqueued_at: Instant::now(),
            run: Box::new(task),
            reply: reply_tx,
        };

        match self.queue.try_send(gui_task) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(task = id, depth = self.depth, "GUI queue full");
                return Err(BridgeError::Backpressure(self.depth));
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(BridgeError::Handler("GUI executor is shut down".into()));
            }
        }

        match reply_rx.recv_timeout(wait) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    task = id,
                    wait_ms = wait.as_millis() as u64,
                    "GUI wait timed out"
                );
                Err(BridgeError::GuiTimeout(wait))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(BridgeError::Handler("GUI executor is shut down".into()))
            }
        }
    }

    /// Pending-task snapshot, for stats.
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }
}

impl<R> GuiDrain<R> {
    /// Drain everything currently queued, executing each task to
    /// completion in enqueue order. Call this from the host event loop's
    /// recurring tick. Returns the number of tasks executed.
    pub fn tick(&self) -> usize {
        let mut executed = 0;
        while let Ok(task) = self.queue.try_recv() {
            self.execute(task);
            executed += 1;
        }
        executed
    }

    /// Blocking drain loop for headless operation: waits up to `tick` for
    /// work, executes it, and re-checks `stop` between waits. Returns when
    /// `stop` is set or every submitter handle is gone.
    pub fn run(self, tick: Duration, stop: &AtomicBool) {
        debug!("GUI drain loop started");
        while !stop.load(Ordering::SeqCst) {
            match self.queue.recv_timeout(tick) {
                Ok(task) => self.execute(task),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("GUI drain loop stopped");
    }

    /// Run one task and hand the outcome to whoever is still waiting.
    ///
    /// A task panic becomes an error reply; it must not stop the drain
    /// loop. A send failure means the submitter timed out and left; the
    /// result is discarded, which is the documented trade-off.
    fn execute(&self, task: GuiTask<R>) {
        let queued_ms = task.enqueued_at.elapsed().as_millis() as u64;
        let outcome = match catch_unwind(AssertUnwindSafe(task.run)) {
            Ok(result) => result,
            Err(payload) => {
                let msg = panic_message(&payload);
                error!(task = task.id, "GUI task panicked: {}", msg);
                Err(BridgeError::Handler(format!("task panicked: {}", msg)))
            }
        };

        if task.reply.send(outcome).is_err() {
            debug!(
                task = task.id,
                queued_ms, "Discarding result: waiter already timed out"
            );
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
