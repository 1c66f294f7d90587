#![forbid(unsafe_code)]

//! Bounded, elastic worker pool.
//!
//! A [`Scheduler`] runs [`Task`]s on a pool of named worker threads that
//! grows on demand up to [`SchedulerConfig::worker_limit`]. Work that arrives
//! while every worker is busy and the ceiling is reached waits in an
//! unbounded FIFO queue; backpressure is implicit in queue growth.
//!
//! # Design
//!
//! - `submit` enqueues and wakes one idle worker. A new worker is spawned
//!   only when the queue holds more tasks than there are idle workers.
//! - `run` executes on the calling thread with the same isolation and
//!   cancellation rules as pooled work.
//! - Every task carries a [`Cx`]. If that context or the scheduler's own
//!   context is cancelled when the task is picked up, the task's body is
//!   invoked with [`Dispatch::Cancelled`] so it can clean up instead of
//!   doing work.
//!
//! # Failure Modes
//!
//! - **Task panics**: the panic is caught, converted into
//!   [`Error::TaskPanicked`], logged at `ERROR`, handed to the owner's panic
//!   hook, and cancels the scheduler. Isolation is per scheduler, never
//!   process-wide. The task's completion still runs.
//! - **Cancellation**: the pool stops growing, live workers drain the queue
//!   (every queued task takes its cancel path) and exit, and the shutdown
//!   hook runs exactly once after the last worker is gone.
//! - **Thread spawn failure**: logged at `WARN`; if no worker is alive to
//!   drain the queue, queued work runs inline on the submitting thread.

use std::any::Any;
use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::{debug, error, trace, warn};
use web_time::Instant;

use crate::config::SchedulerConfig;
use crate::cx::{CancelHook, Cx, CxController};
use crate::error::Error;

thread_local! {
    static IN_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is a scheduler worker.
///
/// Blocking waits on propagation results consult this to refuse waiting
/// on a worker, which could starve the pool that must make progress.
#[must_use]
pub fn on_worker_thread() -> bool {
    IN_WORKER.with(Cell::get)
}

// ─── Tasks ───────────────────────────────────────────────────────────────────

/// Which path a task takes when it is finally executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Run the body normally.
    Live,
    /// The task's context (or its scheduler) was cancelled; clean up only.
    Cancelled,
}

impl Dispatch {
    #[inline]
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Live)
    }
}

/// Continuation invoked once a unit of work has finished.
pub type Completion = Box<dyn FnOnce() + Send>;

type Body = Box<dyn FnOnce(Dispatch) + Send>;

/// A unit of work plus its cancellation context and completion.
pub struct Task {
    cx: Cx,
    body: Body,
    done: Option<Completion>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("cx", &self.cx)
            .field("has_done", &self.done.is_some())
            .finish()
    }
}

impl Task {
    /// Wrap `body`; it receives [`Dispatch::Live`] unless `cx` is cancelled
    /// by the time the task executes.
    pub fn new(cx: Cx, body: impl FnOnce(Dispatch) + Send + 'static) -> Self {
        Self {
            cx,
            body: Box::new(body),
            done: None,
        }
    }

    /// Attach a completion that runs after the body, on either path, even if
    /// the body panics.
    #[must_use]
    pub fn on_done(mut self, done: Completion) -> Self {
        self.done = Some(done);
        self
    }

    #[must_use]
    pub fn cx(&self) -> &Cx {
        &self.cx
    }
}

/// Something that can execute [`Task`]s.
pub trait Executor: Send + Sync {
    /// Execute on the calling thread.
    fn run(&self, task: Task);
    /// Hand off for asynchronous execution.
    fn submit(&self, task: Task);
}

/// Executor that runs everything on the calling thread.
///
/// No isolation: a panicking body still fires the task's completion, then the
/// panic resumes unwinding into the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inline;

impl Executor for Inline {
    fn run(&self, task: Task) {
        let Task { cx, body, done } = task;
        let dispatch = if cx.is_cancelled() {
            Dispatch::Cancelled
        } else {
            Dispatch::Live
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(move || body(dispatch)));
        if let Some(done) = done {
            done();
        }
        if let Err(payload) = outcome {
            panic::resume_unwind(payload);
        }
    }

    fn submit(&self, task: Task) {
        self.run(task);
    }
}

// ─── Hooks ───────────────────────────────────────────────────────────────────

type PanicHook = Arc<dyn Fn(&Error) + Send + Sync>;
type ShutdownHook = Box<dyn FnOnce() + Send>;

/// Owner callbacks for failure reporting and teardown.
#[derive(Default)]
pub struct SchedulerHooks {
    on_panic: Option<PanicHook>,
    on_shutdown: Option<ShutdownHook>,
}

impl fmt::Debug for SchedulerHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHooks")
            .field("on_panic", &self.on_panic.is_some())
            .field("on_shutdown", &self.on_shutdown.is_some())
            .finish()
    }
}

impl SchedulerHooks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with [`Error::TaskPanicked`] for every caught task panic.
    #[must_use]
    pub fn on_panic(mut self, hook: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_panic = Some(Arc::new(hook));
        self
    }

    /// Called exactly once after the scheduler has shut down and drained.
    #[must_use]
    pub fn on_shutdown(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_shutdown = Some(Box::new(hook));
        self
    }
}

// ─── Pool state ──────────────────────────────────────────────────────────────

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerStats {
    /// Live worker threads.
    pub workers: usize,
    /// Workers parked waiting for work.
    pub idle: usize,
    /// Tasks waiting in the queue.
    pub queued: usize,
    /// Whether shutdown has begun.
    pub shutting_down: bool,
}

#[derive(Default)]
struct Pool {
    queue: VecDeque<Task>,
    workers: usize,
    idle: usize,
    shutting_down: bool,
}

struct Shared {
    cx: Cx,
    ctrl: CxController,
    config: SchedulerConfig,
    limit: usize,
    pool: Mutex<Pool>,
    ready: Condvar,
    on_panic: Option<PanicHook>,
    on_shutdown: Mutex<Option<ShutdownHook>>,
    cancel_hook: Mutex<Option<CancelHook>>,
    spawned: AtomicUsize,
}

impl Shared {
    fn pool(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> SchedulerStats {
        let pool = self.pool();
        SchedulerStats {
            workers: pool.workers,
            idle: pool.idle,
            queued: pool.queue.len(),
            shutting_down: pool.shutting_down,
        }
    }

    fn submit(self: &Arc<Self>, task: Task) {
        let mut pool = self.pool();
        if pool.shutting_down {
            drop(pool);
            self.execute(task);
            return;
        }
        pool.queue.push_back(task);
        let grow = pool.queue.len() > pool.idle && pool.workers < self.limit;
        if grow {
            pool.workers += 1;
        }
        drop(pool);

        if grow {
            if let Err(err) = self.spawn_worker() {
                warn!(error = %err, "failed to spawn scheduler worker");
                let orphaned = {
                    let mut pool = self.pool();
                    pool.workers -= 1;
                    if pool.workers == 0 {
                        std::mem::take(&mut pool.queue)
                    } else {
                        VecDeque::new()
                    }
                };
                for task in orphaned {
                    self.execute(task);
                }
                return;
            }
        }
        self.ready.notify_one();
    }

    fn spawn_worker(self: &Arc<Self>) -> std::io::Result<()> {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let mut builder = thread::Builder::new().name(format!("{}-{n}", self.config.thread_name));
        if let Some(size) = self.config.stack_size {
            builder = builder.stack_size(size);
        }
        let shared = Arc::clone(self);
        builder.spawn(move || shared.worker_loop(n))?;
        Ok(())
    }

    fn worker_loop(self: Arc<Self>, n: usize) {
        IN_WORKER.with(|flag| flag.set(true));
        debug!(worker = n, "scheduler worker started");
        while let Some(task) = self.next_task() {
            self.execute(task);
        }
        let last = {
            let mut pool = self.pool();
            pool.workers -= 1;
            pool.shutting_down && pool.workers == 0
        };
        debug!(worker = n, "scheduler worker exited");
        if last {
            self.finish_shutdown();
        }
    }

    fn next_task(&self) -> Option<Task> {
        let mut pool = self.pool();
        loop {
            if let Some(task) = pool.queue.pop_front() {
                return Some(task);
            }
            if pool.shutting_down {
                return None;
            }
            pool.idle += 1;
            let (guard, timeout) = self
                .ready
                .wait_timeout(pool, self.config.keep_alive)
                .unwrap_or_else(PoisonError::into_inner);
            pool = guard;
            pool.idle -= 1;
            if timeout.timed_out() && pool.queue.is_empty() {
                return None;
            }
        }
    }

    fn execute(&self, task: Task) {
        let Task { cx, body, done } = task;
        let dispatch = if cx.is_cancelled() || self.cx.is_cancelled() {
            Dispatch::Cancelled
        } else {
            Dispatch::Live
        };
        let started = Instant::now();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || body(dispatch))) {
            self.report_panic(payload.as_ref());
        }
        if let Some(done) = done {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(done)) {
                self.report_panic(payload.as_ref());
            }
        }
        trace!(
            cx_id = cx.id(),
            live = dispatch.is_live(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "task finished"
        );
    }

    fn report_panic(&self, payload: &(dyn Any + Send)) {
        let message = panic_message(payload);
        error!(cx_id = self.cx.id(), panic = %message, "scheduler task panicked");
        let err = Error::TaskPanicked { message };
        if let Some(hook) = &self.on_panic {
            hook(&err);
        }
        self.ctrl.cancel();
    }

    fn begin_shutdown(&self) {
        let idle_pool = {
            let mut pool = self.pool();
            if pool.shutting_down {
                return;
            }
            pool.shutting_down = true;
            pool.workers == 0
        };
        debug!(cx_id = self.cx.id(), "scheduler shutting down");
        self.ready.notify_all();
        if idle_pool {
            self.finish_shutdown();
        }
    }

    fn finish_shutdown(&self) {
        let hook = self
            .on_shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            debug!(cx_id = self.cx.id(), "scheduler drained");
            hook();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ─── Scheduler ───────────────────────────────────────────────────────────────

struct Handle {
    shared: Arc<Shared>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.shared.ctrl.cancel();
    }
}

/// Handle to a worker pool.
///
/// Cheaply cloneable. Dropping the last handle cancels the scheduler.
#[derive(Clone)]
pub struct Scheduler {
    handle: Arc<Handle>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("cx", &self.handle.shared.cx)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Scheduler {
    /// Start a scheduler whose context is a child of `root`.
    ///
    /// Cancelling `root` shuts the scheduler down. No threads are spawned
    /// until work is submitted.
    pub fn start(root: &Cx, config: SchedulerConfig, hooks: SchedulerHooks) -> Self {
        let (cx, ctrl) = root.child();
        let limit = config.effective_worker_limit();
        let shared = Arc::new(Shared {
            cx,
            ctrl,
            config,
            limit,
            pool: Mutex::new(Pool::default()),
            ready: Condvar::new(),
            on_panic: hooks.on_panic,
            on_shutdown: Mutex::new(hooks.on_shutdown),
            cancel_hook: Mutex::new(None),
            spawned: AtomicUsize::new(0),
        });
        let weak = Arc::downgrade(&shared);
        let hook = shared.cx.on_cancel(move || {
            if let Some(shared) = weak.upgrade() {
                shared.begin_shutdown();
            }
        });
        *shared
            .cancel_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
        Self {
            handle: Arc::new(Handle { shared }),
        }
    }

    /// Start with default configuration and no hooks.
    pub fn with_defaults(root: &Cx) -> Self {
        Self::start(root, SchedulerConfig::default(), SchedulerHooks::default())
    }

    /// The scheduler's own context; cancelled on shutdown or task panic.
    #[must_use]
    pub fn cx(&self) -> &Cx {
        &self.handle.shared.cx
    }

    /// Cancel the scheduler and begin shutdown. Idempotent.
    pub fn cancel(&self) {
        self.handle.shared.ctrl.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.handle.shared.cx.is_cancelled()
    }

    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.handle.shared.stats()
    }

    /// Convenience for `submit(Task::new(cx, body))`.
    pub fn spawn(&self, cx: &Cx, body: impl FnOnce(Dispatch) + Send + 'static) {
        self.submit(Task::new(cx.clone(), body));
    }
}

impl Executor for Scheduler {
    fn run(&self, task: Task) {
        self.handle.shared.execute(task);
    }

    fn submit(&self, task: Task) {
        self.handle.shared.submit(task);
    }
}
