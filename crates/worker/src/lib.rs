//! crates/worker/src/lib.rs
//!
//! The worker capability shared by every pipeline thread.
//!
//! A [`WorkerHandle`] wraps one OS thread plus the three flags the
//! supervisor cares about: `running`, `failed` and `killed`. Cancellation
//! is cooperative — `kill` flips a flag the loop polls between I/O calls —
//! with an optional unblock hook for workers parked in a blocking syscall
//! (a receiver shuts its socket down so `recv` observes EOF). Dropping the
//! handle kills and joins.
//!
//! All flag accesses use relaxed ordering: the flags carry no data, they
//! only nudge loops that already synchronize through the buffer queues.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

/// Flags shared between a worker loop and its supervisor.
#[derive(Debug)]
pub struct WorkerState {
    running: AtomicBool,
    failed: AtomicBool,
    killed: AtomicBool,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            failed: AtomicBool::new(false),
            killed: AtomicBool::new(false),
        }
    }

    /// True once `kill` has been requested; loops poll this at each head.
    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }

    /// Marks the worker as failed. The loop still exits on its own.
    pub fn fail(&self) {
        self.failed.store(true, Ordering::Relaxed);
    }
}

/// Handle to one spawned pipeline worker.
///
/// Provides `{kill, is_running, has_failed}` and joins on drop.
pub struct WorkerHandle {
    name: String,
    state: Arc<WorkerState>,
    unblock: Option<Box<dyn Fn() + Send + Sync>>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("failed", &self.has_failed())
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    /// Spawns a named worker thread running `body`.
    ///
    /// `body` receives the shared [`WorkerState`] and is expected to poll
    /// [`WorkerState::is_killed`] between I/O calls. The `running` flag
    /// clears when `body` returns, however it returns.
    pub fn spawn<F>(name: &str, body: F) -> io::Result<Self>
    where
        F: FnOnce(&WorkerState) + Send + 'static,
    {
        let state = Arc::new(WorkerState::new());
        let thread_state = Arc::clone(&state);
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                body(&thread_state);
                thread_state.running.store(false, Ordering::Relaxed);
            })?;

        Ok(Self {
            name: name.to_owned(),
            state,
            unblock: None,
            thread: Some(thread),
        })
    }

    /// Attaches a hook run by `kill` before the flag is set, to knock the
    /// worker out of a blocking syscall.
    #[must_use]
    pub fn with_unblock<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.unblock = Some(Box::new(hook));
        self
    }

    /// Worker thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests cooperative termination.
    pub fn kill(&self) {
        if let Some(hook) = &self.unblock {
            hook();
        }
        self.state.killed.store(true, Ordering::Relaxed);
    }

    /// True while the worker loop has not returned.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Relaxed)
    }

    /// True once the worker marked itself failed.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.state.failed.load(Ordering::Relaxed)
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.kill();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
