#![forbid(unsafe_code)]

//! Versioned reactive cells.
//!
//! A [`Source<T>`] holds a value stamped with a monotonically increasing
//! sequence number. Every real change allocates the next sequence and fans
//! the new version out through the screens subscribed to the source, down to
//! leaf [`Watcher`](super::Watcher)s. [`Beam<T>`] is the read-only view.
//!
//! # Design
//!
//! A write runs under the source lock: compute the candidate, suppress it if
//! the equality predicate says it matches the current value, otherwise
//! allocate `seq + 1` and store it. With no subscribers the previous version
//! is evicted on the spot. Otherwise the subscriber set is snapshotted, the
//! lock is dropped, and a *pass* carries the new sequence through the tree.
//!
//! Each pass is a small local frame chain:
//!
//! 1. **sync**: every screen broadcast joins it, so it completes only after
//!    the whole tree has seen (or abandoned) this version;
//! 2. **check**: settles the writer's [`Propagation`];
//! 3. **final**: retention bookkeeping for this version.
//!
//! # Invariants
//!
//! 1. Sequences strictly increase per real change and are never reused.
//! 2. With an equality predicate, an equal result allocates nothing and
//!    notifies nobody. Without one, every write is a change.
//! 3. A pass is *stale* once the source has moved past its sequence (unless
//!    skipping is disabled); stale passes stop delivering.
//! 4. Every live screen's committed sequence stays retained: values are
//!    evicted only below the floor raised by fully delivered passes, and
//!    never while pinned by an in-flight pass. A pass that some screen
//!    skipped (cancelled scheduler, unmounted cinema) is not fully
//!    delivered.
//!
//! # Failure Modes
//!
//! - **Cancelled writer**: logged at `WARN`; the write still happens and the
//!   propagation settles with `Cancelled`.
//! - **Missing version**: fetching a sequence that retention has evicted is
//!   an internal consistency fault and panics.
//! - **Re-entrant writes**: equality predicates and mutation closures run
//!   under the source lock and must not touch the same source.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ahash::AHashMap;
use beamline_core::cx::Cx;
use beamline_core::frame::{Chain, FrameRef, Schedule};
use beamline_core::scheduler::Inline;
use tracing::{trace, warn};

use super::cinema::Cinema;
use super::propagation::{Propagation, Settler};
use super::screen::{Screen, ScreenId};
use super::watcher::{self, Flow, FnWatcher, UpdatesOnly, Watcher, WatcherHandle};
use crate::error::Result;

/// Version number of a source value. The initial value is version 1.
pub type Seq = u64;

/// Identity of a source, used to key screens inside a cinema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

impl SourceId {
    fn next() -> Self {
        Self(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

type Equality<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;

// ─── Type-erased source ──────────────────────────────────────────────────────

/// Operations screens need from a source without knowing its value type.
pub(crate) trait AnySource: Send + Sync {
    fn id(&self) -> SourceId;
    fn current_seq(&self) -> Seq;
    fn skips(&self) -> bool;
    /// Create a root screen with `make(seq)` under the source lock and
    /// subscribe it; `seq` is the version current at that instant.
    fn attach(&self, make: &mut dyn FnMut(Seq) -> Arc<Screen>) -> Arc<Screen>;
    fn detach(&self, screen: ScreenId);
}

/// One version travelling through the screen tree.
pub(crate) struct Pass {
    pub(crate) seq: Seq,
    pub(crate) root: FrameRef,
    source: Arc<dyn AnySource>,
    stopped: AtomicBool,
    /// Some screen skipped this version for a reason other than staleness.
    abandoned: AtomicBool,
}

impl Pass {
    /// Whether the source has moved past this version; sticky once true.
    pub(crate) fn is_stale(&self) -> bool {
        if !self.source.skips() {
            return false;
        }
        if self.stopped.load(Ordering::Acquire) {
            return true;
        }
        if self.source.current_seq() == self.seq {
            return false;
        }
        self.stopped.store(true, Ordering::Release);
        trace!(source_id = %self.source.id(), seq = self.seq, "pass abandoned as stale");
        true
    }

    /// Record that some screen never committed this version, so it must not
    /// raise the retention floor. Unlike staleness this does not stop the
    /// pass elsewhere in the tree.
    pub(crate) fn abandon(&self) {
        if !self.abandoned.swap(true, Ordering::AcqRel) {
            trace!(source_id = %self.source.id(), seq = self.seq, "pass abandoned");
        }
    }

    fn delivered(&self) -> bool {
        !self.stopped.load(Ordering::Acquire) && !self.abandoned.load(Ordering::Acquire)
    }
}

// ─── Shared state ────────────────────────────────────────────────────────────

struct SourceState {
    seq: Seq,
    /// Lowest version every live screen is known to have committed past.
    floor: Seq,
    /// In-flight passes per version.
    pins: AHashMap<Seq, usize>,
    subs: AHashMap<ScreenId, Arc<Screen>>,
}

pub(crate) struct SourceInner<T> {
    id: SourceId,
    eq: Option<Equality<T>>,
    no_skip: AtomicBool,
    state: Mutex<(SourceState, AHashMap<Seq, Arc<T>>)>,
}

impl<T: Send + Sync + 'static> SourceInner<T> {
    fn new(init: T, eq: Option<Equality<T>>) -> Arc<Self> {
        let mut values = AHashMap::new();
        values.insert(1, Arc::new(init));
        Arc::new(Self {
            id: SourceId::next(),
            eq,
            no_skip: AtomicBool::new(false),
            state: Mutex::new((
                SourceState {
                    seq: 1,
                    floor: 1,
                    pins: AHashMap::new(),
                    subs: AHashMap::new(),
                },
                values,
            )),
        })
    }

    fn lock(&self) -> MutexGuard<'_, (SourceState, AHashMap<Seq, Arc<T>>)> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Value stored for `seq`.
    ///
    /// # Panics
    ///
    /// Panics if the version has been evicted, which retention bookkeeping
    /// makes unreachable for every sequence a live screen can hand out.
    pub(crate) fn value_at(&self, seq: Seq) -> Arc<T> {
        let guard = self.lock();
        match guard.1.get(&seq) {
            Some(value) => Arc::clone(value),
            None => panic!(
                "{}: no value retained for seq {seq} (current {}, floor {})",
                self.id, guard.0.seq, guard.0.floor
            ),
        }
    }

    fn latest(&self) -> Arc<T> {
        let guard = self.lock();
        let seq = guard.0.seq;
        match guard.1.get(&seq) {
            Some(value) => Arc::clone(value),
            None => panic!("{}: current seq {seq} has no value", self.id),
        }
    }

    fn apply(
        self: &Arc<Self>,
        cx: &Cx,
        op: &'static str,
        compute: impl FnOnce(&T) -> T,
    ) -> Propagation {
        if cx.is_cancelled() {
            warn!(source_id = %self.id, op, "write on a cancelled context");
        }

        let mut guard = self.lock();
        let (state, values) = &mut *guard;
        let current = match values.get(&state.seq) {
            Some(value) => Arc::clone(value),
            None => panic!("{}: current seq {} has no value", self.id, state.seq),
        };
        let next = compute(&current);
        if self.eq.as_ref().is_some_and(|eq| eq(&*current, &next)) {
            return Propagation::settled(cx, state.seq);
        }

        state.seq += 1;
        let seq = state.seq;
        values.insert(seq, Arc::new(next));
        trace!(source_id = %self.id, seq, subs = state.subs.len(), op, "source advanced");

        if state.subs.is_empty() {
            state.floor = seq;
            prune(state, values);
            return Propagation::settled(cx, seq);
        }

        let subs: Vec<Arc<Screen>> = state.subs.values().cloned().collect();
        *state.pins.entry(seq).or_insert(0) += 1;
        drop(guard);

        let (propagation, settler) = Propagation::pending(cx, seq);
        self.fan_out(seq, subs, settler);
        propagation
    }

    fn fan_out(self: &Arc<Self>, seq: Seq, subs: Vec<Arc<Screen>>, settler: Settler) {
        let lane = Chain::new();
        let sync = lane.frame();
        let check = lane.frame();
        let finish = lane.frame();

        let pass = Arc::new(Pass {
            seq,
            root: sync.handle(),
            source: Arc::clone(self) as Arc<dyn AnySource>,
            stopped: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
        });
        for screen in &subs {
            screen.sync(&pass);
        }
        drop(sync);

        let bookkeeping = Cx::detached();
        check.run(&Inline, &bookkeeping, move |_| settler.settle(Ok(())));
        drop(check);

        let source = Arc::clone(self);
        finish.run(&Inline, &bookkeeping, move |_| {
            source.finish_pass(pass.seq, pass.delivered());
        });
        drop(finish);
    }

    fn finish_pass(&self, seq: Seq, delivered: bool) {
        let mut guard = self.lock();
        let (state, values) = &mut *guard;
        if let Some(count) = state.pins.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                state.pins.remove(&seq);
            }
        }
        if delivered && seq > state.floor {
            state.floor = seq;
        }
        prune(state, values);
        trace!(source_id = %self.id, seq, delivered, retained = values.len(), "pass finished");
    }
}

fn prune<T>(state: &SourceState, values: &mut AHashMap<Seq, Arc<T>>) {
    let (current, floor) = (state.seq, state.floor);
    values.retain(|seq, _| *seq == current || *seq >= floor || state.pins.contains_key(seq));
}

impl<T: Send + Sync + 'static> AnySource for SourceInner<T> {
    fn id(&self) -> SourceId {
        self.id
    }

    fn current_seq(&self) -> Seq {
        self.lock().0.seq
    }

    fn skips(&self) -> bool {
        !self.no_skip.load(Ordering::Acquire)
    }

    fn attach(&self, make: &mut dyn FnMut(Seq) -> Arc<Screen>) -> Arc<Screen> {
        let mut guard = self.lock();
        let screen = make(guard.0.seq);
        guard.0.subs.insert(screen.id(), Arc::clone(&screen));
        screen
    }

    fn detach(&self, screen: ScreenId) {
        let mut guard = self.lock();
        let (state, values) = &mut *guard;
        if state.subs.remove(&screen).is_some() && state.subs.is_empty() {
            state.floor = state.seq;
            prune(state, values);
        }
    }
}

// ─── Beam ────────────────────────────────────────────────────────────────────

/// Read-only view over a source's value stream.
pub struct Beam<T> {
    pub(crate) inner: Arc<SourceInner<T>>,
}

impl<T> Clone for Beam<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Beam<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Beam")
            .field("id", &self.inner.id)
            .field("seq", &self.inner.current_seq())
            .finish()
    }
}

impl<T: Send + Sync + 'static> Beam<T> {
    #[must_use]
    pub fn id(&self) -> SourceId {
        self.inner.id
    }

    /// Current sequence number.
    #[must_use]
    pub fn seq(&self) -> Seq {
        self.inner.current_seq()
    }

    /// The newest value, regardless of what the screen tree has committed.
    #[must_use]
    pub fn latest(&self) -> Arc<T> {
        self.inner.latest()
    }

    /// Value as committed in `cinema`'s scope.
    ///
    /// This is the version the nearest screen for this source has committed,
    /// which may trail [`latest`](Self::latest) while a pass is in flight.
    pub fn read(&self, cinema: &Cinema) -> Result<Arc<T>> {
        let source: Arc<dyn AnySource> = Arc::clone(&self.inner) as Arc<dyn AnySource>;
        let mut value = None;
        cinema.peek(&source, &mut |seq| {
            value = Some(self.inner.value_at(seq));
        })?;
        Ok(value.unwrap_or_else(|| self.inner.latest()))
    }

    /// Attach a watcher in `cinema`; it receives `init` with the value as
    /// committed in that scope, then every later version delivered there.
    ///
    /// Cancelling `cx` cancels the watcher.
    pub fn add_watcher(
        &self,
        cinema: &Cinema,
        cx: &Cx,
        watcher: impl Watcher<T>,
    ) -> Result<WatcherHandle> {
        watcher::attach(&self.inner, cinema, cx, Box::new(watcher)).map(|(_, handle)| handle)
    }

    /// Call `on_value` with the current scoped value and every later one
    /// until it returns [`Flow::Done`] or `cx` is cancelled.
    pub fn subscribe(
        &self,
        cinema: &Cinema,
        cx: &Cx,
        on_value: impl FnMut(&Cx, &T, Seq) -> Flow + Send + 'static,
    ) -> Result<WatcherHandle> {
        self.add_watcher(cinema, cx, FnWatcher::new(on_value))
    }

    /// Like [`subscribe`](Self::subscribe), also running `on_cancel` if the
    /// subscription is cancelled externally.
    pub fn subscribe_with_cancel(
        &self,
        cinema: &Cinema,
        cx: &Cx,
        on_value: impl FnMut(&Cx, &T, Seq) -> Flow + Send + 'static,
        on_cancel: impl FnOnce() + Send + 'static,
    ) -> Result<WatcherHandle> {
        self.add_watcher(cinema, cx, FnWatcher::new(on_value).on_cancel(on_cancel))
    }

    /// Return the current scoped value and call `on_update` for every later
    /// one.
    pub fn read_and_subscribe(
        &self,
        cinema: &Cinema,
        cx: &Cx,
        on_update: impl FnMut(&Cx, &T, Seq) -> Flow + Send + 'static,
    ) -> Result<(Arc<T>, WatcherHandle)> {
        watcher::attach(&self.inner, cinema, cx, Box::new(UpdatesOnly::new(on_update)))
    }
}

// ─── Source ──────────────────────────────────────────────────────────────────

/// Writable versioned cell. Dereferences to its read-only [`Beam`].
pub struct Source<T> {
    beam: Beam<T>,
}

impl<T> Clone for Source<T> {
    fn clone(&self) -> Self {
        Self {
            beam: self.beam.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Source<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.beam.inner.id)
            .field("seq", &self.beam.seq())
            .field("skips", &self.beam.inner.skips())
            .finish()
    }
}

impl<T> Deref for Source<T> {
    type Target = Beam<T>;

    fn deref(&self) -> &Beam<T> {
        &self.beam
    }
}

impl<T: Send + Sync + 'static> Source<T> {
    /// A source with no equality predicate: every write notifies.
    pub fn new(init: T) -> Self {
        Self::from_inner(SourceInner::new(init, None))
    }

    /// A source that suppresses writes `eq` considers equal to the current
    /// value.
    pub fn with_equality(init: T, eq: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        Self::from_inner(SourceInner::new(init, Some(Box::new(eq))))
    }

    fn from_inner(inner: Arc<SourceInner<T>>) -> Self {
        Self {
            beam: Beam { inner },
        }
    }

    /// Replace the value.
    pub fn update(&self, cx: &Cx, value: T) -> Propagation {
        self.beam.inner.apply(cx, "update", move |_| value)
    }

    /// Derive the next value from the current one.
    ///
    /// `f` runs under the source lock; it must not access this source.
    pub fn mutate(&self, cx: &Cx, f: impl FnOnce(&T) -> T) -> Propagation {
        self.beam.inner.apply(cx, "mutate", f)
    }

    /// Deliver every version to every watcher, never coalescing.
    ///
    /// Use when the source carries discrete events. Slow watchers build a
    /// backlog instead of skipping.
    pub fn disable_skipping(&self) {
        self.beam.inner.no_skip.store(true, Ordering::Release);
    }

    /// A read-only view of this source.
    #[must_use]
    pub fn beam(&self) -> Beam<T> {
        self.beam.clone()
    }
}

impl<T: PartialEq + Send + Sync + 'static> Source<T> {
    /// A source that suppresses writes equal (by `PartialEq`) to the current
    /// value.
    pub fn distinct(init: T) -> Self {
        Self::with_equality(init, |a, b| a == b)
    }
}
