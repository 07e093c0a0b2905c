//! Cross-thread task marshaling onto the owner thread.
//!
//! Rendering and host UI work must happen on one thread. Computer threads,
//! timer tasks and remote sessions reach that thread through a
//! `TaskDispatcher`:
//!
//! ```text
//!   computer thread ──submit()──┐
//!   watchdog task ──submit_async()──┤──► DispatchQueue ──► owner pump()
//!   owner thread ──submit()── runs inline (no queueing)
//! ```
//!
//! Synchronous submitters block on a one-slot channel until the owner thread
//! has run their task. Failures (errors and panics) never unwind the owner
//! thread: they are handed back to the synchronous caller, or logged for
//! asynchronous submissions.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send>;

/// Errors returned to synchronous submitters.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("dispatched task failed: {0:#}")]
    Failed(anyhow::Error),
    #[error("dispatched task panicked: {0}")]
    Panicked(String),
    #[error("dispatcher shut down before the task ran")]
    Dropped,
}

/// Result of a single pump pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpStatus {
    /// No task was waiting.
    Idle,
    /// This many tasks ran.
    Ran(usize),
    /// `shutdown` was called.
    Closed,
}

#[derive(Default)]
struct DispatchQueue {
    jobs: VecDeque<Job>,
    closed: bool,
}

/// Marshals closures onto a single designated owner thread.
pub struct TaskDispatcher {
    owner: ThreadId,
    queue: Mutex<DispatchQueue>,
    ready: Condvar,
}

impl std::fmt::Debug for TaskDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDispatcher")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl TaskDispatcher {
    /// Create a dispatcher owned by the calling thread.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            owner: thread::current().id(),
            queue: Mutex::new(DispatchQueue::default()),
            ready: Condvar::new(),
        })
    }

    /// Spawn a dedicated owner thread that pumps until `shutdown`.
    ///
    /// Used by headless hosts and tests that have no UI loop of their own.
    pub fn spawn_owner(name: &str) -> std::io::Result<(Arc<Self>, thread::JoinHandle<()>)> {
        let (tx, rx) = sync_channel(1);
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            let dispatcher = TaskDispatcher::new();
            if tx.send(Arc::clone(&dispatcher)).is_err() {
                return;
            }
            dispatcher.run();
        })?;
        let dispatcher = rx
            .recv()
            .map_err(|_| std::io::Error::other("owner thread exited during startup"))?;
        Ok((dispatcher, handle))
    }

    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Run `task` on the owner thread and wait for its result.
    ///
    /// Called from the owner thread itself, the task runs inline before this
    /// returns.
    pub fn submit<T, F>(&self, task: F) -> Result<T, TaskError>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        if self.is_owner_thread() {
            return run_guarded(task);
        }

        let (tx, rx) = sync_channel(1);
        self.push(Box::new(move || {
            let _ = tx.send(run_guarded(task));
        }))?;
        rx.recv().map_err(|_| TaskError::Dropped)?
    }

    /// Run `task` on the owner thread without waiting for it.
    ///
    /// Errors and panics are logged and discarded.
    pub fn submit_async<F>(&self, task: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        if self.is_owner_thread() {
            log_async_failure(run_guarded(task));
            return;
        }

        let pushed = self.push(Box::new(move || log_async_failure(run_guarded(task))));
        if pushed.is_err() {
            debug!("async task submitted after dispatcher shutdown; dropped");
        }
    }

    fn push(&self, job: Job) -> Result<(), TaskError> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.closed {
            return Err(TaskError::Dropped);
        }
        queue.jobs.push_back(job);
        drop(queue);
        self.ready.notify_all();
        Ok(())
    }

    /// Drain every queued task on the calling (owner) thread.
    ///
    /// Tasks queued while draining are also run before this reports.
    pub fn pump(&self) -> PumpStatus {
        debug_assert!(self.is_owner_thread(), "pump called off the owner thread");
        let mut ran = 0;
        loop {
            let job = {
                let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                match queue.jobs.pop_front() {
                    Some(job) => job,
                    None if queue.closed && ran == 0 => return PumpStatus::Closed,
                    None => break,
                }
            };
            job();
            ran += 1;
        }
        if ran == 0 { PumpStatus::Idle } else { PumpStatus::Ran(ran) }
    }

    /// Wait up to `timeout` for work, then pump once.
    pub fn pump_timeout(&self, timeout: Duration) -> PumpStatus {
        {
            let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.jobs.is_empty() && !queue.closed {
                let _ = self
                    .ready
                    .wait_timeout(queue, timeout)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }
        self.pump()
    }

    /// Pump until `shutdown` is called.
    pub fn run(&self) {
        while self.pump_timeout(Duration::from_millis(100)) != PumpStatus::Closed {}
        debug!("task dispatcher loop finished");
    }

    /// Stop accepting work. Pending synchronous submitters get `Dropped`.
    pub fn shutdown(&self) {
        let dropped = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.closed = true;
            std::mem::take(&mut queue.jobs)
        };
        if !dropped.is_empty() {
            warn!(pending = dropped.len(), "dropping queued tasks at shutdown");
        }
        drop(dropped);
        self.ready.notify_all();
    }
}

fn run_guarded<T, F>(task: F) -> Result<T, TaskError>
where
    F: FnOnce() -> anyhow::Result<T>,
{
    match catch_unwind(AssertUnwindSafe(task)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TaskError::Failed(e)),
        Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_async_failure(result: Result<(), TaskError>) {
    if let Err(e) = result {
        warn!(error = %e, "asynchronous task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn owner_thread_submit_runs_inline() {
        let dispatcher = TaskDispatcher::new();
        let value = dispatcher.submit(|| Ok(41 + 1)).unwrap();
        assert_eq!(value, 42);
        assert_eq!(dispatcher.pump(), PumpStatus::Idle);
    }

    #[test]
    fn async_task_runs_before_pump_reports_idle() {
        let dispatcher = TaskDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let remote = Arc::clone(&dispatcher);
        let counter = Arc::clone(&hits);
        thread::spawn(move || {
            remote.submit_async(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        })
        .join()
        .unwrap();

        assert_eq!(dispatcher.pump(), PumpStatus::Ran(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.pump(), PumpStatus::Idle);
    }

    #[test]
    fn sync_submit_from_worker_returns_value() {
        let (dispatcher, owner) = TaskDispatcher::spawn_owner("test-owner").unwrap();
        let remote = Arc::clone(&dispatcher);
        let answer = thread::spawn(move || remote.submit(|| Ok(String::from("done"))))
            .join()
            .unwrap()
            .unwrap();
        assert_eq!(answer, "done");
        dispatcher.shutdown();
        owner.join().unwrap();
    }

    #[test]
    fn failures_are_returned_to_submitter() {
        let (dispatcher, owner) = TaskDispatcher::spawn_owner("test-owner").unwrap();
        let remote = Arc::clone(&dispatcher);
        let result = thread::spawn(move || remote.submit::<(), _>(|| anyhow::bail!("boom")))
            .join()
            .unwrap();
        assert!(matches!(result, Err(TaskError::Failed(_))));

        let remote = Arc::clone(&dispatcher);
        let result = thread::spawn(move || remote.submit::<(), _>(|| panic!("kaboom")))
            .join()
            .unwrap();
        match result {
            Err(TaskError::Panicked(msg)) => assert!(msg.contains("kaboom")),
            other => panic!("unexpected result: {other:?}"),
        }

        // The owner thread survived both.
        let remote = Arc::clone(&dispatcher);
        let ok = thread::spawn(move || remote.submit(|| Ok(7))).join().unwrap();
        assert_eq!(ok.unwrap(), 7);

        dispatcher.shutdown();
        owner.join().unwrap();
    }

    #[test]
    fn submit_after_shutdown_is_dropped() {
        let dispatcher = TaskDispatcher::new();
        dispatcher.shutdown();
        let remote = Arc::clone(&dispatcher);
        let result = thread::spawn(move || remote.submit(|| Ok(1))).join().unwrap();
        assert!(matches!(result, Err(TaskError::Dropped)));
        assert_eq!(dispatcher.pump(), PumpStatus::Closed);
    }
}
