//! Bounded executor for low-priority background work: admission authorization and forced
//! disconnects. Jobs may block on I/O, so they run on the blocking pool of a private tokio
//! runtime whose size caps concurrency. Jobs beyond the cap wait in the runtime's queue; once
//! the backlog itself is full, submissions are rejected.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Runtime;

use super::TransportError;

/// Queued plus running jobs allowed per worker before submissions are rejected.
const BACKLOG_PER_WORKER: usize = 64;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub(crate) struct TaskEngine {
    runtime: Mutex<Option<Runtime>>,
    in_flight: Arc<AtomicUsize>,
    backlog: usize,
}

/// Decrements the in-flight counter even if the job panicked.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl TaskEngine {
    pub(crate) fn new(workers: usize) -> std::io::Result<Self> {
        let workers = workers.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers)
            .thread_name("lludp-task")
            .build()?;
        Ok(TaskEngine {
            runtime: Mutex::new(Some(runtime)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            backlog: workers * BACKLOG_PER_WORKER,
        })
    }

    /// Runs `job` on the background pool.
    pub(crate) fn submit<F>(&self, name: &'static str, job: F) -> Result<(), TransportError>
    where
        F: FnOnce() + Send + 'static,
    {
        let runtime = self.runtime.lock();
        let Some(runtime) = runtime.as_ref() else {
            return Err(TransportError::Stopped);
        };
        let reserved = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.backlog).then_some(n + 1)
            });
        if reserved.is_err() {
            tracing::warn!(task = name, backlog = self.backlog, "Background task rejected");
            return Err(TransportError::TaskQueueFull);
        }

        let guard = InFlightGuard(self.in_flight.clone());
        runtime.spawn_blocking(move || {
            let _guard = guard;
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                tracing::error!(task = name, "Background task panicked");
            }
        });
        Ok(())
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Waits a bounded time for running jobs, then drops the runtime.
    pub(crate) fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
        }
    }
}

impl Drop for TaskEngine {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;

    #[test]
    fn runs_submitted_jobs() -> testresult::TestResult {
        let engine = TaskEngine::new(2)?;
        let (tx, rx) = channel::unbounded();
        for i in 0..10 {
            let tx = tx.clone();
            engine.submit("test", move || {
                let _ = tx.send(i);
            })?;
        }
        let mut results: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)))
            .collect::<Result<_, _>>()?;
        results.sort_unstable();
        assert_eq!(results, (0..10).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn rejects_beyond_backlog() -> testresult::TestResult {
        let engine = TaskEngine::new(1)?;
        let (release_tx, release_rx) = channel::bounded::<()>(0);
        for _ in 0..BACKLOG_PER_WORKER {
            let release_rx = release_rx.clone();
            engine.submit("blocked", move || {
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
            })?;
        }
        assert!(matches!(
            engine.submit("overflow", || {}),
            Err(TransportError::TaskQueueFull)
        ));
        drop(release_tx);
        Ok(())
    }

    #[test]
    fn panicking_job_releases_slot() -> testresult::TestResult {
        let engine = TaskEngine::new(1)?;
        engine.submit("panics", || panic!("boom"))?;
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while engine.in_flight() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(engine.in_flight(), 0);
        Ok(())
    }

    #[test]
    fn submit_after_shutdown_fails() -> testresult::TestResult {
        let engine = TaskEngine::new(1)?;
        engine.shutdown();
        assert!(matches!(engine.submit("late", || {}), Err(TransportError::Stopped)));
        Ok(())
    }
}
