#![forbid(unsafe_code)]

//! Subscribers at the leaves of the screen tree.
//!
//! A watcher moves through `awaiting-init → active → done`:
//!
//! - `init` is delivered exactly once, on the attaching thread, with the
//!   version the screen had committed at attach time;
//! - `update` follows zero or more times with strictly increasing
//!   sequence numbers;
//! - returning [`Flow::Done`] from either, cancelling the
//!   [`WatcherHandle`], or cancelling the watcher's context ends it.
//!
//! Each watcher owns a frame chain. Attachment takes the first frame of
//! that chain before the watcher becomes visible to any pass and releases it
//! only after `init` has returned, so an update racing in from a worker
//! always queues behind `init`.
//!
//! Callbacks run without any lock held. Termination is a single atomic
//! transition: whichever of "done" and "cancel" reaches it first wins, and
//! the loser's detach is a no-op.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use beamline_core::cx::{CancelHook, Cx};
use beamline_core::frame::{Chain, Frame};
use tracing::{debug, trace};

use super::cinema::Cinema;
use super::screen::Screen;
use super::source::{AnySource, Seq, SourceInner};
use crate::error::{ReactiveError, Result};

/// Whether a watcher wants further updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Detach after this call.
    Done,
}

/// Receiver of a source's value stream.
pub trait Watcher<T>: Send + 'static {
    /// The value as committed in the watcher's scope at attach time.
    fn init(&mut self, cx: &Cx, value: &T, seq: Seq) -> Flow;

    /// A newer version.
    fn update(&mut self, cx: &Cx, value: &T, seq: Seq) -> Flow;

    /// Called once if the watcher is terminated externally (handle or
    /// context cancellation). Not called after [`Flow::Done`].
    fn cancel(&mut self) {}
}

// ─── Closure adapters ────────────────────────────────────────────────────────

type CancelFn = Box<dyn FnOnce() + Send>;

/// Watcher that feeds `init` and every `update` to one closure.
pub struct FnWatcher<F> {
    on_value: F,
    on_cancel: Option<CancelFn>,
}

impl<F> FnWatcher<F> {
    pub fn new(on_value: F) -> Self {
        Self {
            on_value,
            on_cancel: None,
        }
    }

    #[must_use]
    pub fn on_cancel(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(f));
        self
    }
}

impl<F> fmt::Debug for FnWatcher<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnWatcher")
            .field("has_cancel", &self.on_cancel.is_some())
            .finish()
    }
}

impl<T, F> Watcher<T> for FnWatcher<F>
where
    F: FnMut(&Cx, &T, Seq) -> Flow + Send + 'static,
{
    fn init(&mut self, cx: &Cx, value: &T, seq: Seq) -> Flow {
        (self.on_value)(cx, value, seq)
    }

    fn update(&mut self, cx: &Cx, value: &T, seq: Seq) -> Flow {
        (self.on_value)(cx, value, seq)
    }

    fn cancel(&mut self) {
        if let Some(f) = self.on_cancel.take() {
            f();
        }
    }
}

/// Watcher that ignores `init`; the initial value is returned to the caller
/// instead.
pub(crate) struct UpdatesOnly<F> {
    on_update: F,
}

impl<F> UpdatesOnly<F> {
    pub(crate) fn new(on_update: F) -> Self {
        Self { on_update }
    }
}

impl<T, F> Watcher<T> for UpdatesOnly<F>
where
    F: FnMut(&Cx, &T, Seq) -> Flow + Send + 'static,
{
    fn init(&mut self, _cx: &Cx, _value: &T, _seq: Seq) -> Flow {
        Flow::Continue
    }

    fn update(&mut self, cx: &Cx, value: &T, seq: Seq) -> Flow {
        (self.on_update)(cx, value, seq)
    }
}

// ─── Identity ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(u64);

static NEXT_WATCHER_ID: AtomicU64 = AtomicU64::new(1);

impl WatcherId {
    fn next() -> Self {
        Self(NEXT_WATCHER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

// ─── Node ────────────────────────────────────────────────────────────────────

const AWAITING_INIT: u8 = 0;
const ACTIVE: u8 = 1;
const DONE: u8 = 2;

/// What screens see of a watcher.
pub(crate) trait AnyWatcher: Send + Sync {
    fn id(&self) -> WatcherId;
    fn cx(&self) -> &Cx;
    /// Next frame of the watcher's delivery chain.
    fn lane(&self) -> Frame;
    fn deliver(&self, seq: Seq);
    fn cancel(&self);
    fn is_done(&self) -> bool;
}

struct Slot<T> {
    watcher: Option<Box<dyn Watcher<T>>>,
    /// Cancel arrived while a callback had the watcher checked out.
    cancel_pending: bool,
}

struct WatcherNode<T> {
    id: WatcherId,
    source: Arc<SourceInner<T>>,
    cx: Cx,
    slot: Mutex<Slot<T>>,
    state: AtomicU8,
    last_seq: AtomicU64,
    lane: Chain,
    screen: OnceLock<Weak<Screen>>,
    hook: Mutex<Option<CancelHook>>,
}

impl<T: Send + Sync + 'static> WatcherNode<T> {
    fn slot(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `DONE`; true for the caller that made the transition.
    fn terminate(&self) -> bool {
        if self.state.swap(DONE, Ordering::AcqRel) == DONE {
            return false;
        }
        drop(
            self.hook
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        true
    }

    fn detach(&self) {
        if let Some(screen) = self.screen.get().and_then(Weak::upgrade) {
            screen.remove_watcher(self.id);
        }
    }

    fn run_init(&self, value: &T, seq: Seq) {
        let Some(mut watcher) = self.slot().watcher.take() else {
            return;
        };
        let flow = watcher.init(&self.cx, value, seq);
        self.last_seq.store(seq, Ordering::Release);
        let _ = self
            .state
            .compare_exchange(AWAITING_INIT, ACTIVE, Ordering::AcqRel, Ordering::Acquire);
        self.check_in(watcher, flow);
    }

    /// Return a checked-out watcher after a callback.
    fn check_in(&self, mut watcher: Box<dyn Watcher<T>>, flow: Flow) {
        let mut slot = self.slot();
        if slot.cancel_pending {
            drop(slot);
            watcher.cancel();
            return;
        }
        match flow {
            Flow::Continue => slot.watcher = Some(watcher),
            Flow::Done => {
                let won = self.terminate();
                drop(slot);
                drop(watcher);
                if won {
                    debug!(watcher = self.id.0, "watcher finished");
                    self.detach();
                }
            }
        }
    }
}

impl<T: Send + Sync + 'static> AnyWatcher for WatcherNode<T> {
    fn id(&self) -> WatcherId {
        self.id
    }

    fn cx(&self) -> &Cx {
        &self.cx
    }

    fn lane(&self) -> Frame {
        self.lane.frame()
    }

    fn deliver(&self, seq: Seq) {
        if self.is_done() || seq <= self.last_seq.load(Ordering::Acquire) {
            return;
        }
        let Some(mut watcher) = self.slot().watcher.take() else {
            return;
        };
        let value = self.source.value_at(seq);
        trace!(watcher = self.id.0, seq, "update delivered");
        let flow = watcher.update(&self.cx, &value, seq);
        self.last_seq.store(seq, Ordering::Release);
        self.check_in(watcher, flow);
    }

    fn cancel(&self) {
        if !self.terminate() {
            return;
        }
        let watcher = {
            let mut slot = self.slot();
            let watcher = slot.watcher.take();
            if watcher.is_none() {
                slot.cancel_pending = true;
            }
            watcher
        };
        if let Some(mut watcher) = watcher {
            watcher.cancel();
        }
        debug!(watcher = self.id.0, "watcher cancelled");
        self.detach();
    }

    fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }
}

/// Attach `watcher` to `source` inside `cinema` and deliver its `init`.
///
/// Returns the init value alongside the handle.
pub(crate) fn attach<T: Send + Sync + 'static>(
    source: &Arc<SourceInner<T>>,
    cinema: &Cinema,
    cx: &Cx,
    watcher: Box<dyn Watcher<T>>,
) -> Result<(Arc<T>, WatcherHandle)> {
    if cx.is_cancelled() {
        return Err(ReactiveError::Cancelled);
    }

    let node = Arc::new(WatcherNode {
        id: WatcherId::next(),
        source: Arc::clone(source),
        cx: cx.clone(),
        slot: Mutex::new(Slot {
            watcher: Some(watcher),
            cancel_pending: false,
        }),
        state: AtomicU8::new(AWAITING_INIT),
        last_seq: AtomicU64::new(0),
        lane: Chain::new(),
        screen: OnceLock::new(),
        hook: Mutex::new(None),
    });

    let erased: Arc<dyn AnySource> = Arc::clone(source) as Arc<dyn AnySource>;
    let mut bound = None;
    let screen = cinema.attach_watcher(
        &erased,
        Arc::clone(&node) as Arc<dyn AnyWatcher>,
        &mut |seq| bound = Some((seq, source.value_at(seq), node.lane.frame())),
    )?;
    let Some((seq, value, init_gate)) = bound else {
        return Err(ReactiveError::Unmounted);
    };
    let _ = node.screen.set(Arc::downgrade(&screen));
    trace!(watcher = node.id.0, source_id = %erased.id(), seq, "watcher attached");

    let weak = Arc::downgrade(&node);
    let hook = cx.on_cancel(move || {
        if let Some(node) = weak.upgrade() {
            node.cancel();
        }
    });
    if !node.is_done() {
        *node.hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    node.run_init(&value, seq);
    drop(init_gate);

    Ok((
        value,
        WatcherHandle {
            node: node as Arc<dyn AnyWatcher>,
        },
    ))
}

// ─── Handle ──────────────────────────────────────────────────────────────────

/// External control over an attached watcher.
///
/// Dropping the handle leaves the watcher attached; it lives until it
/// finishes, is cancelled, or its context or cinema goes away.
#[derive(Clone)]
pub struct WatcherHandle {
    node: Arc<dyn AnyWatcher>,
}

impl fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatcherHandle")
            .field("id", &self.node.id())
            .field("done", &self.node.is_done())
            .finish()
    }
}

impl WatcherHandle {
    #[must_use]
    pub fn id(&self) -> WatcherId {
        self.node.id()
    }

    /// Terminate the watcher: run its cancel hook and detach it. Idempotent.
    pub fn cancel(&self) {
        self.node.cancel();
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.node.is_done()
    }
}
