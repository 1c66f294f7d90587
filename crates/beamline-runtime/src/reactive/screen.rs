#![forbid(unsafe_code)]

//! Per-scope subscriber nodes.
//!
//! A screen mirrors one source inside one cinema. It fans each version out
//! to its own watchers first, then to the screens of nested cinemas that
//! depend on the same source. Root screens subscribe to the source itself;
//! nested screens hang off the matching screen of the parent cinema.
//!
//! # Ordering
//!
//! A broadcast for one version starts only when three lineages agree:
//!
//! - the source's pass for that version (so the pass cannot finish early);
//! - a fresh frame from the cinema's scope (so it is ordered against the
//!   scope owner's work);
//! - the screen's own chain (so versions are committed one at a time).
//!
//! Each watcher delivery additionally joins that watcher's chain, so one
//! watcher never sees two callbacks at once.
//!
//! # Lifecycle
//!
//! A screen with no watchers and no children is pruned by its cinema in the
//! same operation that emptied it. Pruning and attaching both run under the
//! cinema lock, so an attach either finds the live screen or replaces it
//! with a fresh one, never a half-detached node.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use ahash::AHashMap;
use beamline_core::cx::Cx;
use beamline_core::frame::{Chain, FrameRef, Schedule, join};
use beamline_core::scheduler::{Inline, Scheduler};
use tracing::trace;

use super::cinema::CinemaInner;
use super::source::{AnySource, Pass, Seq, SourceId};
use super::watcher::{AnyWatcher, WatcherId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ScreenId(u64);

static NEXT_SCREEN_ID: AtomicU64 = AtomicU64::new(1);

impl ScreenId {
    fn next() -> Self {
        Self(NEXT_SCREEN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Point-in-time counts for one screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenStats {
    pub watchers: usize,
    pub children: usize,
    /// Last sequence broadcast through this screen.
    pub committed: Seq,
}

struct ScreenState {
    committed: Seq,
    watchers: AHashMap<WatcherId, Arc<dyn AnyWatcher>>,
    children: AHashMap<ScreenId, Arc<Screen>>,
    detached: bool,
}

impl ScreenState {
    fn is_empty(&self) -> bool {
        self.watchers.is_empty() && self.children.is_empty()
    }
}

pub(crate) struct Screen {
    id: ScreenId,
    source: Arc<dyn AnySource>,
    cinema: Weak<CinemaInner>,
    /// `None` for root screens, which subscribe to the source directly.
    parent: Option<Weak<Screen>>,
    lane: Chain,
    state: Mutex<ScreenState>,
}

impl fmt::Debug for Screen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Screen")
            .field("id", &self.id)
            .field("source_id", &self.source.id())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Screen {
    pub(crate) fn new(
        source: Arc<dyn AnySource>,
        cinema: Weak<CinemaInner>,
        parent: Option<Weak<Screen>>,
        committed: Seq,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ScreenId::next(),
            source,
            cinema,
            parent,
            lane: Chain::new(),
            state: Mutex::new(ScreenState {
                committed,
                watchers: AHashMap::new(),
                children: AHashMap::new(),
                detached: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ScreenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn id(&self) -> ScreenId {
        self.id
    }

    pub(crate) fn source_id(&self) -> SourceId {
        self.source.id()
    }

    #[cfg(test)]
    pub(crate) fn source(&self) -> &Arc<dyn AnySource> {
        &self.source
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.lock().detached
    }

    pub(crate) fn stats(&self) -> ScreenStats {
        let state = self.lock();
        ScreenStats {
            watchers: state.watchers.len(),
            children: state.children.len(),
            committed: state.committed,
        }
    }

    /// Call `f` with the committed sequence while it cannot change.
    pub(crate) fn with_committed(&self, f: &mut dyn FnMut(Seq)) {
        let state = self.lock();
        f(state.committed);
    }

    // ── Membership ──────────────────────────────────────────────────

    /// Insert `watcher`, calling `bind` with the committed sequence under
    /// the screen lock. False if the screen has been detached.
    pub(crate) fn add_watcher(
        &self,
        watcher: Arc<dyn AnyWatcher>,
        bind: &mut dyn FnMut(Seq),
    ) -> bool {
        let mut state = self.lock();
        if state.detached {
            return false;
        }
        bind(state.committed);
        state.watchers.insert(watcher.id(), watcher);
        true
    }

    /// Create a child screen with `make(committed)` and adopt it.
    pub(crate) fn adopt(&self, make: &mut dyn FnMut(Seq) -> Arc<Screen>) -> Option<Arc<Screen>> {
        let mut state = self.lock();
        if state.detached {
            return None;
        }
        let child = make(state.committed);
        state.children.insert(child.id, Arc::clone(&child));
        Some(child)
    }

    pub(crate) fn remove_watcher(self: &Arc<Self>, id: WatcherId) {
        let emptied = {
            let mut state = self.lock();
            state.watchers.remove(&id).is_some() && state.is_empty() && !state.detached
        };
        if emptied {
            self.prune();
        }
    }

    pub(crate) fn remove_child(self: &Arc<Self>, id: ScreenId) {
        let emptied = {
            let mut state = self.lock();
            state.children.remove(&id).is_some() && state.is_empty() && !state.detached
        };
        if emptied {
            self.prune();
        }
    }

    fn prune(self: &Arc<Self>) {
        if let Some(cinema) = self.cinema.upgrade() {
            cinema.try_remove(self);
        }
    }

    /// Mark the screen detached if it is still empty. Called by the owning
    /// cinema under its lock.
    pub(crate) fn detach_if_empty(&self) -> bool {
        let mut state = self.lock();
        if state.detached || !state.is_empty() {
            return false;
        }
        state.detached = true;
        true
    }

    /// Unsubscribe from the parent screen or the source.
    pub(crate) fn release_upstream(&self) {
        trace!(source_id = %self.source.id(), screen = self.id.0, "screen released");
        match &self.parent {
            None => self.source.detach(self.id),
            Some(parent) => {
                if let Some(parent) = parent.upgrade() {
                    parent.remove_child(self.id);
                }
            }
        }
    }

    /// Cancel every watcher and child screen, then unsubscribe.
    pub(crate) fn cancel(&self) {
        let (watchers, children) = {
            let mut state = self.lock();
            if state.detached {
                return;
            }
            state.detached = true;
            (
                std::mem::take(&mut state.watchers),
                std::mem::take(&mut state.children),
            )
        };
        for watcher in watchers.into_values() {
            watcher.cancel();
        }
        for child in children.into_values() {
            child.cancel();
        }
        self.release_upstream();
    }

    // ── Propagation ─────────────────────────────────────────────────

    /// Schedule the broadcast of `pass` through this screen's subtree.
    pub(crate) fn sync(self: &Arc<Self>, pass: &Arc<Pass>) {
        let Some(cinema) = self.cinema.upgrade() else {
            pass.abandon();
            return;
        };
        let scope_frame = cinema.scope().new_frame();
        let lane_frame = self.lane.frame();
        let gate = join(&[&pass.root, &scope_frame, &lane_frame]);
        drop(scope_frame);
        drop(lane_frame);

        let screen = Arc::clone(self);
        let pass = Arc::clone(pass);
        let gate_ref = gate.handle();
        let scheduler = cinema.scheduler().clone();
        let cx = cinema.cx().clone();
        gate.submit(cinema.scheduler(), cinema.cx(), move |dispatch| {
            if dispatch.is_live() {
                screen.broadcast(&pass, &gate_ref, &scheduler, &cx);
            } else {
                pass.abandon();
            }
        });
    }

    fn broadcast(&self, pass: &Arc<Pass>, gate: &FrameRef, scheduler: &Scheduler, cx: &Cx) {
        if pass.is_stale() {
            return;
        }
        let (watchers, children) = {
            let mut state = self.lock();
            if state.detached {
                return;
            }
            if pass.seq > state.committed {
                state.committed = pass.seq;
            }
            (
                state.watchers.values().cloned().collect::<Vec<_>>(),
                state.children.values().cloned().collect::<Vec<_>>(),
            )
        };
        trace!(
            source_id = %self.source.id(),
            seq = pass.seq,
            watchers = watchers.len(),
            children = children.len(),
            "screen committed"
        );

        let order = Chain::new();
        let watchers_frame = order.frame();
        let children_frame = order.frame();

        let deliver = join(&[gate, &watchers_frame]);
        drop(watchers_frame);
        for watcher in watchers {
            let lane = watcher.lane();
            let job = join(&[&deliver, &lane]);
            drop(lane);
            let pass = Arc::clone(pass);
            let target = Arc::clone(&watcher);
            job.submit(scheduler, watcher.cx(), move |dispatch| {
                if dispatch.is_live() && !pass.is_stale() {
                    target.deliver(pass.seq);
                }
            });
        }
        drop(deliver);

        let descend = join(&[gate, &children_frame]);
        drop(children_frame);
        let pass = Arc::clone(pass);
        descend.run(&Inline, cx, move |dispatch| {
            if !dispatch.is_live() {
                if !children.is_empty() {
                    pass.abandon();
                }
                return;
            }
            for child in &children {
                if pass.is_stale() {
                    return;
                }
                child.sync(&pass);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::source::Source;

    fn root_screen() -> Arc<Screen> {
        let source = Source::new(0_u8);
        let erased: Arc<dyn AnySource> = Arc::clone(&source.inner) as Arc<dyn AnySource>;
        source.inner.attach(&mut |seq| Screen::new(Arc::clone(&erased), Weak::new(), None, seq))
    }

    #[test]
    fn new_screen_starts_at_current_seq() {
        let screen = root_screen();
        assert_eq!(
            screen.stats(),
            ScreenStats {
                watchers: 0,
                children: 0,
                committed: 1,
            }
        );
    }

    #[test]
    fn adopted_child_inherits_committed_seq() {
        let parent = root_screen();
        let erased = Arc::clone(parent.source());
        let weak = Arc::downgrade(&parent);
        let child = parent
            .adopt(&mut |seq| Screen::new(Arc::clone(&erased), Weak::new(), Some(weak.clone()), seq))
            .unwrap();
        assert_eq!(child.stats().committed, 1);
        assert_eq!(parent.stats().children, 1);
    }

    #[test]
    fn detach_only_when_empty() {
        let parent = root_screen();
        let erased = Arc::clone(parent.source());
        let child = parent
            .adopt(&mut |seq| Screen::new(Arc::clone(&erased), Weak::new(), None, seq))
            .unwrap();
        assert!(!parent.detach_if_empty());
        parent.remove_child(child.id());
        assert!(parent.detach_if_empty());
        assert!(!parent.detach_if_empty());
        assert!(parent.adopt(&mut |seq| Screen::new(Arc::clone(&erased), Weak::new(), None, seq)).is_none());
    }

    #[test]
    fn cancel_detaches_subtree() {
        let parent = root_screen();
        let erased = Arc::clone(parent.source());
        let weak = Arc::downgrade(&parent);
        let child = parent
            .adopt(&mut |seq| Screen::new(Arc::clone(&erased), Weak::new(), Some(weak.clone()), seq))
            .unwrap();
        parent.cancel();
        assert!(parent.is_detached());
        assert!(child.is_detached());
        assert_eq!(parent.stats().children, 0);
    }
}
