#![forbid(unsafe_code)]

//! Scheduler configuration.

use web_time::Duration;

/// Default ceiling on concurrently running worker threads.
pub const DEFAULT_WORKER_LIMIT: usize = 16;

/// Configuration for a [`Scheduler`](crate::scheduler::Scheduler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum number of worker threads the pool grows to.
    ///
    /// Work submitted while every worker is busy and the limit is reached
    /// waits in an unbounded FIFO queue.
    /// Default: 16. A limit of 0 is normalized to the default.
    pub worker_limit: usize,

    /// Prefix for worker thread names; workers are named `{prefix}-{n}`.
    /// Default: `"beamline-worker"`.
    pub thread_name: String,

    /// Stack size for worker threads, or the platform default when `None`.
    /// Default: `None`.
    pub stack_size: Option<usize>,

    /// How long an idle worker waits for work before exiting.
    /// Default: 10s.
    pub keep_alive: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_limit: DEFAULT_WORKER_LIMIT,
            thread_name: "beamline-worker".into(),
            stack_size: None,
            keep_alive: Duration::from_secs(10),
        }
    }
}

impl SchedulerConfig {
    /// Set the worker ceiling.
    #[must_use]
    pub fn with_worker_limit(mut self, limit: usize) -> Self {
        self.worker_limit = limit;
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Set an explicit worker stack size in bytes.
    #[must_use]
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Set the idle keep-alive for workers.
    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Effective worker ceiling after normalization.
    #[must_use]
    pub fn effective_worker_limit(&self) -> usize {
        if self.worker_limit == 0 {
            DEFAULT_WORKER_LIMIT
        } else {
            self.worker_limit
        }
    }
}
