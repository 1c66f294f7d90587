#![forbid(unsafe_code)]

//! Completion frames: composable barriers over concurrently scheduled work.
//!
//! A frame counts the units of work scheduled on it and fires a continuation
//! exactly once, when it is **active**, **released**, and has **no pending
//! units**. Frames are the only ordering mechanism between independent
//! workers; nothing here blocks a thread while waiting for another frame.
//!
//! # Compositions
//!
//! - [`Frame::new`]: a plain, active barrier with a completion callback.
//! - [`Chain`]: per-entity FIFO. Each frame from [`Chain::frame`] starts
//!   inactive and activates the moment its predecessor completes, so bodies
//!   scheduled on successive frames finish in order even when they run on
//!   different workers.
//! - [`join`]: barrier-AND over several inputs. The joined frame activates
//!   once every input has reached it, and every input stays pending until the
//!   joined frame completes, so ordering flows through joins.
//! - [`Valve`]: buffers everything until [`Valve::activate`], then becomes a
//!   permanent pass-through. It never completes.
//!
//! # Invariants
//!
//! 1. The completion continuation fires exactly once, only after release and
//!    after every unit registered before completion has finished.
//! 2. Units scheduled before activation are buffered and dispatched, in
//!    scheduling order, on activation.
//! 3. A chain frame has at most one successor.
//! 4. Continuations and dispatch never run while a frame lock is held.
//!
//! # Failure Modes
//!
//! Contract violations panic: releasing a frame twice, scheduling onto a
//! completed frame, activating a frame or valve twice.
//!
//! # Example
//!
//! ```
//! use beamline_core::cx::Cx;
//! use beamline_core::frame::{Chain, Schedule};
//! use beamline_core::scheduler::Inline;
//! use std::sync::{Arc, Mutex};
//!
//! let chain = Chain::new();
//! let log = Arc::new(Mutex::new(Vec::new()));
//! let first = chain.frame();
//! let second = chain.frame();
//!
//! let l = Arc::clone(&log);
//! second.run(&Inline, &Cx::detached(), move |_| l.lock().unwrap().push(2));
//! let l = Arc::clone(&log);
//! first.run(&Inline, &Cx::detached(), move |_| l.lock().unwrap().push(1));
//!
//! drop(first);
//! assert_eq!(*log.lock().unwrap(), vec![1, 2]);
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwapOption;

use crate::cx::Cx;
use crate::scheduler::{Dispatch, Executor, Task};

pub use crate::scheduler::Completion;

// ─── Units ───────────────────────────────────────────────────────────────────

/// A piece of work a frame can hold. `done` must be called exactly once when
/// the work has finished, on any thread.
pub trait Unit: Send {
    fn execute(self: Box<Self>, done: Completion);
}

impl<F> Unit for F
where
    F: FnOnce(Completion) + Send,
{
    fn execute(self: Box<Self>, done: Completion) {
        (*self)(done);
    }
}

/// Anything that work can be scheduled on.
pub trait Schedule {
    /// Register `unit`; it is dispatched now if the target is active, or
    /// buffered until activation otherwise.
    fn schedule(&self, unit: Box<dyn Unit>);

    /// Schedule `body` to execute via `exec.run` (inline on whichever thread
    /// dispatches it).
    fn run<E, F>(&self, exec: &E, cx: &Cx, body: F)
    where
        Self: Sized,
        E: Executor + Clone + 'static,
        F: FnOnce(Dispatch) + Send + 'static,
    {
        let exec = exec.clone();
        let task = Task::new(cx.clone(), body);
        self.schedule(Box::new(move |done: Completion| {
            exec.run(task.on_done(done));
        }));
    }

    /// Schedule `body` to execute via `exec.submit`.
    fn submit<E, F>(&self, exec: &E, cx: &Cx, body: F)
    where
        Self: Sized,
        E: Executor + Clone + 'static,
        F: FnOnce(Dispatch) + Send + 'static,
    {
        let exec = exec.clone();
        let task = Task::new(cx.clone(), body);
        self.schedule(Box::new(move |done: Completion| {
            exec.submit(task.on_done(done));
        }));
    }
}

// ─── Core barrier ────────────────────────────────────────────────────────────

/// What a frame does when it fires.
enum Role {
    Callback(Option<Completion>),
    Link {
        next: Option<Arc<FrameCore>>,
        completed: bool,
    },
    Join {
        arrived: Vec<Completion>,
        expected: usize,
    },
    Valve,
}

/// Deferred effect of a state transition, run after the lock is dropped.
enum Fired {
    Nothing,
    Call(Completion),
    Activate(Arc<FrameCore>),
    Resume(Vec<Completion>),
}

impl Fired {
    fn run(self) {
        match self {
            Self::Nothing => {}
            Self::Call(f) => f(),
            Self::Activate(next) => next.activate(),
            Self::Resume(inputs) => {
                for done in inputs {
                    done();
                }
            }
        }
    }
}

struct FrameState {
    active: bool,
    released: bool,
    pending: usize,
    fired: bool,
    buffer: Vec<Box<dyn Unit>>,
    role: Role,
}

impl FrameState {
    fn try_fire(&mut self) -> Fired {
        if self.fired || !self.active || !self.released || self.pending > 0 {
            return Fired::Nothing;
        }
        self.fired = true;
        match &mut self.role {
            Role::Callback(cb) => cb.take().map_or(Fired::Nothing, Fired::Call),
            Role::Link { next, completed } => {
                *completed = true;
                next.take().map_or(Fired::Nothing, Fired::Activate)
            }
            Role::Join { arrived, .. } => Fired::Resume(std::mem::take(arrived)),
            Role::Valve => Fired::Nothing,
        }
    }
}

struct FrameCore {
    state: Mutex<FrameState>,
}

impl FrameCore {
    fn new(role: Role, active: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FrameState {
                active,
                released: false,
                pending: 0,
                fired: false,
                buffer: Vec::new(),
                role,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FrameState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(self: &Arc<Self>, unit: Box<dyn Unit>) {
        let mut state = self.lock();
        assert!(!state.fired, "frame: work scheduled on a completed frame");
        state.pending += 1;
        if !state.active {
            state.buffer.push(unit);
            return;
        }
        drop(state);
        self.dispatch(unit);
    }

    fn dispatch(self: &Arc<Self>, unit: Box<dyn Unit>) {
        let core = Arc::clone(self);
        unit.execute(Box::new(move || core.unit_done()));
    }

    fn unit_done(&self) {
        let fired = {
            let mut state = self.lock();
            state.pending = state
                .pending
                .checked_sub(1)
                .unwrap_or_else(|| panic!("frame: unit completed twice"));
            state.try_fire()
        };
        fired.run();
    }

    fn release(&self) {
        let fired = {
            let mut state = self.lock();
            assert!(!state.released, "frame: released twice");
            state.released = true;
            state.try_fire()
        };
        fired.run();
    }

    /// Activate this frame and, iteratively, any chain successors that
    /// complete as a direct consequence.
    fn activate(self: &Arc<Self>) {
        let mut current = Some(Arc::clone(self));
        while let Some(core) = current.take() {
            let (units, fired) = {
                let mut state = core.lock();
                assert!(!state.active, "frame: activated twice");
                state.active = true;
                let units = std::mem::take(&mut state.buffer);
                (units, state.try_fire())
            };
            for unit in units {
                core.dispatch(unit);
            }
            match fired {
                Fired::Activate(next) => current = Some(next),
                other => other.run(),
            }
        }
    }

    fn set_next(&self, next: Arc<FrameCore>) {
        let ready = {
            let mut state = self.lock();
            let Role::Link {
                next: slot,
                completed,
            } = &mut state.role
            else {
                panic!("frame: successor attached to a non-chain frame");
            };
            assert!(slot.is_none(), "frame: chain frame already has a successor");
            if *completed {
                Some(next)
            } else {
                *slot = Some(next);
                None
            }
        };
        if let Some(next) = ready {
            next.activate();
        }
    }

    fn arrive(self: &Arc<Self>, done: Completion) {
        let ready = {
            let mut state = self.lock();
            let Role::Join { arrived, expected } = &mut state.role else {
                panic!("frame: arrival at a non-join frame");
            };
            arrived.push(done);
            arrived.len() == *expected
        };
        if ready {
            self.activate();
        }
    }

    fn is_complete(&self) -> bool {
        self.lock().fired
    }

    fn is_active(&self) -> bool {
        self.lock().active
    }

    fn pending(&self) -> usize {
        self.lock().pending
    }
}

// ─── Frame / FrameRef ────────────────────────────────────────────────────────

/// Owning handle to a frame.
///
/// Dropping the handle (or calling [`Frame::release`]) declares that the
/// owner will schedule nothing more; the frame then completes as soon as it
/// is active and its pending work has finished.
#[must_use = "dropping a Frame releases it immediately"]
pub struct Frame {
    core: Arc<FrameCore>,
}

impl Frame {
    /// A standalone active frame that calls `on_complete` once done.
    pub fn new(on_complete: impl FnOnce() + Send + 'static) -> Self {
        Self {
            core: FrameCore::new(Role::Callback(Some(Box::new(on_complete))), true),
        }
    }

    /// Release the frame. Equivalent to dropping it.
    pub fn release(self) {
        drop(self);
    }

    /// A cloneable scheduling handle that does not own the release.
    pub fn handle(&self) -> FrameRef {
        FrameRef {
            core: Arc::clone(&self.core),
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.core.is_complete()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    /// Units registered and not yet finished.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.core.pending()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.core.release();
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.lock();
        f.debug_struct("Frame")
            .field("active", &state.active)
            .field("pending", &state.pending)
            .field("fired", &state.fired)
            .finish()
    }
}

impl Schedule for Frame {
    fn schedule(&self, unit: Box<dyn Unit>) {
        self.core.schedule(unit);
    }
}

/// Non-owning scheduling handle to a frame.
///
/// Work may be scheduled through a `FrameRef` for as long as the frame has
/// not completed; the owning [`Frame`] decides when to release.
#[derive(Clone)]
pub struct FrameRef {
    core: Arc<FrameCore>,
}

impl FrameRef {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.core.is_complete()
    }
}

impl fmt::Debug for FrameRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRef")
            .field("pending", &self.core.pending())
            .field("complete", &self.core.is_complete())
            .finish()
    }
}

impl Schedule for FrameRef {
    fn schedule(&self, unit: Box<dyn Unit>) {
        self.core.schedule(unit);
    }
}

// ─── Chain ───────────────────────────────────────────────────────────────────

/// Strict FIFO sequencing of frames for one entity.
///
/// The tail is swapped atomically, so `frame()` is safe from any thread;
/// frames complete in the order they were created.
pub struct Chain {
    tail: ArcSwapOption<FrameCore>,
}

impl Chain {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tail: ArcSwapOption::empty(),
        }
    }

    /// Append a frame. It activates once every previously created frame of
    /// this chain has completed (immediately if there are none).
    pub fn frame(&self) -> Frame {
        let core = FrameCore::new(
            Role::Link {
                next: None,
                completed: false,
            },
            false,
        );
        match self.tail.swap(Some(Arc::clone(&core))) {
            None => core.activate(),
            Some(prev) => prev.set_next(Arc::clone(&core)),
        }
        Frame { core }
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tail = self.tail.load_full();
        f.debug_struct("Chain")
            .field("tail_complete", &tail.map(|t| t.is_complete()))
            .finish()
    }
}

// ─── Join ────────────────────────────────────────────────────────────────────

/// Join several lineages into one frame.
///
/// The returned frame activates once every input has reached it; each input
/// is held pending until the joined frame completes. With no inputs the
/// frame is active immediately.
pub fn join(inputs: &[&dyn Schedule]) -> Frame {
    let core = FrameCore::new(
        Role::Join {
            arrived: Vec::with_capacity(inputs.len()),
            expected: inputs.len(),
        },
        inputs.is_empty(),
    );
    for input in inputs {
        let joined = Arc::clone(&core);
        input.schedule(Box::new(move |done: Completion| joined.arrive(done)));
    }
    Frame { core }
}

// ─── Valve ───────────────────────────────────────────────────────────────────

/// A gate opened by an external signal rather than by completion counting.
///
/// Everything scheduled before [`activate`](Valve::activate) is buffered and
/// flushed once on activation; afterwards work passes straight through.
pub struct Valve {
    core: Arc<FrameCore>,
}

impl Valve {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: FrameCore::new(Role::Valve, false),
        }
    }

    /// Open the valve and flush buffered work.
    ///
    /// # Panics
    ///
    /// Panics if the valve is already open.
    pub fn activate(&self) {
        self.core.activate();
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.core.is_active()
    }
}

impl Default for Valve {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Valve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Valve")
            .field("open", &self.is_open())
            .field("pending", &self.core.pending())
            .finish()
    }
}

impl Schedule for Valve {
    fn schedule(&self, unit: Box<dyn Unit>) {
        self.core.schedule(unit);
    }
}
