//! Deferred execution used by the telemetry machinery.
//!
//! Two collaborators are needed:
//!
//! - [`Alarm`] runs a task at or after an absolute instant (timeouts, idle
//!   cleanup).
//! - [`Worker`] runs a task off the calling thread (cache-hit delivery).
//!
//! Neither hands back a cancellation handle. Tasks scheduled by this crate
//! hold `Weak` references to their targets and do nothing once the target
//! is gone.
//!
//! [`TokioAlarm`] and [`TokioWorker`] implement both on a tokio runtime.
//! Instants are `tokio::time::Instant`, so a paused test runtime drives them
//! with virtual time.

use tokio::runtime::Handle;
use tokio::time::Instant;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// One-shot timer.
pub trait Alarm: Send + Sync {
    /// Run `task` at or after `at`.
    fn schedule_at(&self, at: Instant, task: Task);
}

/// Background task queue.
pub trait Worker: Send + Sync {
    /// Run `task` asynchronously, never on the submitting thread's stack.
    fn submit(&self, task: Task);
}

/// [`Alarm`] backed by a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioAlarm {
    handle: Handle,
}

impl TokioAlarm {
    /// Schedule on the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Schedule on the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Alarm for TokioAlarm {
    fn schedule_at(&self, at: Instant, task: Task) {
        self.handle.spawn(async move {
            tokio::time::sleep_until(at).await;
            task();
        });
    }
}

/// [`Worker`] backed by a tokio runtime.
///
/// Tasks run as ordinary runtime tasks and must not block.
#[derive(Debug, Clone)]
pub struct TokioWorker {
    handle: Handle,
}

impl TokioWorker {
    /// Run tasks on the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Run tasks on the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Worker for TokioWorker {
    fn submit(&self, task: Task) {
        self.handle.spawn(async move {
            task();
        });
    }
}
