#![forbid(unsafe_code)]

//! Scope tree of screens.
//!
//! A [`Cinema`] mirrors one consumer scope (a component, a request). It owns
//! at most one screen per source; the screen is created lazily on first
//! subscription and wired either to the source (root cinema) or to the
//! matching screen of the parent cinema, creating that one too if needed.
//!
//! # Invariants
//!
//! 1. One live screen per source per cinema.
//! 2. Lock order is child cinema, child screen, parent cinema, parent
//!    screen, source. Frames touched under these locks are freshly created.
//! 3. Once cancelled, a cinema refuses attaches with
//!    [`ReactiveError::Unmounted`].
//!
//! # Failure Modes
//!
//! - **Scope cancelled**: the cinema cancels itself, which cancels every
//!   watcher attached through it and detaches every screen.
//! - **Cinema dropped**: same as cancel.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ahash::AHashMap;
use beamline_core::cx::{CancelHook, Cx};
use beamline_core::scheduler::Scheduler;
use tracing::debug;

use super::screen::{Screen, ScreenStats};
use super::source::{AnySource, Seq, SourceId};
use super::watcher::AnyWatcher;
use crate::error::{ReactiveError, Result};
use crate::scope::Scope;

static NEXT_CINEMA_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct CinemaState {
    screens: AHashMap<SourceId, Arc<Screen>>,
    killed: bool,
}

pub(crate) struct CinemaInner {
    id: u64,
    parent: Option<Arc<CinemaInner>>,
    scope: Arc<dyn Scope>,
    scheduler: Scheduler,
    state: Mutex<CinemaState>,
    hook: Mutex<Option<CancelHook>>,
}

impl CinemaInner {
    fn lock(&self) -> MutexGuard<'_, CinemaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn scope(&self) -> &Arc<dyn Scope> {
        &self.scope
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub(crate) fn cx(&self) -> &Cx {
        self.scope.cx()
    }

    /// The live screen for `source`, created and wired upstream if missing.
    fn screen_locked(
        self: &Arc<Self>,
        state: &mut CinemaState,
        source: &Arc<dyn AnySource>,
    ) -> Result<Arc<Screen>> {
        if state.killed {
            return Err(ReactiveError::Unmounted);
        }
        if let Some(screen) = state.screens.get(&source.id()) {
            if !screen.is_detached() {
                return Ok(Arc::clone(screen));
            }
        }

        let cinema = Arc::downgrade(self);
        let screen = match &self.parent {
            None => source.attach(&mut |seq| {
                Screen::new(Arc::clone(source), cinema.clone(), None, seq)
            }),
            Some(parent) => parent.attach_child(source, &mut |seq, upstream| {
                Screen::new(Arc::clone(source), cinema.clone(), Some(upstream), seq)
            })?,
        };
        debug!(cinema = self.id, source_id = %source.id(), "screen created");
        state.screens.insert(source.id(), Arc::clone(&screen));
        Ok(screen)
    }

    /// Create a child screen under this cinema's screen for `source`.
    fn attach_child(
        self: &Arc<Self>,
        source: &Arc<dyn AnySource>,
        make: &mut dyn FnMut(Seq, std::sync::Weak<Screen>) -> Arc<Screen>,
    ) -> Result<Arc<Screen>> {
        let mut state = self.lock();
        let upstream = self.screen_locked(&mut state, source)?;
        let weak = Arc::downgrade(&upstream);
        upstream
            .adopt(&mut |seq| make(seq, weak.clone()))
            .ok_or(ReactiveError::Unmounted)
    }

    pub(crate) fn attach_watcher(
        self: &Arc<Self>,
        source: &Arc<dyn AnySource>,
        watcher: Arc<dyn AnyWatcher>,
        bind: &mut dyn FnMut(Seq),
    ) -> Result<Arc<Screen>> {
        let (screen, added) = {
            let mut state = self.lock();
            let screen = self.screen_locked(&mut state, source)?;
            let added = screen.add_watcher(watcher, bind);
            (screen, added)
        };
        if added {
            Ok(screen)
        } else {
            self.try_remove(&screen);
            Err(ReactiveError::Unmounted)
        }
    }

    /// Call `f` with the committed sequence of this cinema's view of
    /// `source`, then drop the screen again if nothing else uses it.
    pub(crate) fn peek(
        self: &Arc<Self>,
        source: &Arc<dyn AnySource>,
        f: &mut dyn FnMut(Seq),
    ) -> Result<()> {
        let screen = {
            let mut state = self.lock();
            let screen = self.screen_locked(&mut state, source)?;
            screen.with_committed(f);
            screen
        };
        self.try_remove(&screen);
        Ok(())
    }

    /// Remove `screen` if it is empty.
    pub(crate) fn try_remove(&self, screen: &Arc<Screen>) {
        let mut state = self.lock();
        if !screen.detach_if_empty() {
            return;
        }
        let source_id = screen.source_id();
        let current = state
            .screens
            .get(&source_id)
            .is_some_and(|cur| Arc::ptr_eq(cur, screen));
        if current {
            state.screens.remove(&source_id);
        }
        debug!(cinema = self.id, source_id = %source_id, "screen pruned");
        screen.release_upstream();
    }

    fn cancel(&self) {
        let screens = {
            let mut state = self.lock();
            if state.killed {
                return;
            }
            state.killed = true;
            std::mem::take(&mut state.screens)
        };
        debug!(cinema = self.id, screens = screens.len(), "cinema cancelled");
        drop(
            self.hook
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        for screen in screens.into_values() {
            screen.cancel();
        }
    }
}

impl Drop for CinemaInner {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// One node of the scope tree.
///
/// Cloning shares the node. When the last handle is dropped the cinema is
/// cancelled.
#[derive(Clone)]
pub struct Cinema {
    inner: Arc<CinemaInner>,
}

impl fmt::Debug for Cinema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cinema")
            .field("id", &self.inner.id)
            .field("root", &self.inner.parent.is_none())
            .field("screens", &self.screen_count())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Cinema {
    /// A root cinema: its screens subscribe to sources directly.
    pub fn root(scope: Arc<dyn Scope>, scheduler: Scheduler) -> Self {
        Self::build(None, scope, scheduler)
    }

    /// A nested cinema sharing this one's scheduler. Its screens hang off
    /// this cinema's screens.
    #[must_use]
    pub fn child(&self, scope: Arc<dyn Scope>) -> Self {
        Self::build(
            Some(Arc::clone(&self.inner)),
            scope,
            self.inner.scheduler.clone(),
        )
    }

    fn build(parent: Option<Arc<CinemaInner>>, scope: Arc<dyn Scope>, scheduler: Scheduler) -> Self {
        let inner = Arc::new(CinemaInner {
            id: NEXT_CINEMA_ID.fetch_add(1, Ordering::Relaxed),
            parent,
            scope,
            scheduler,
            state: Mutex::new(CinemaState::default()),
            hook: Mutex::new(None),
        });
        let weak = Arc::downgrade(&inner);
        let hook = inner.scope.cx().on_cancel(move || {
            if let Some(inner) = weak.upgrade() {
                inner.cancel();
            }
        });
        if !inner.lock().killed {
            *inner.hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(hook);
        }
        Self { inner }
    }

    pub(crate) fn attach_watcher(
        &self,
        source: &Arc<dyn AnySource>,
        watcher: Arc<dyn AnyWatcher>,
        bind: &mut dyn FnMut(Seq),
    ) -> Result<Arc<Screen>> {
        self.inner.attach_watcher(source, watcher, bind)
    }

    pub(crate) fn peek(&self, source: &Arc<dyn AnySource>, f: &mut dyn FnMut(Seq)) -> Result<()> {
        self.inner.peek(source, f)
    }

    /// The scope's context.
    #[must_use]
    pub fn cx(&self) -> &Cx {
        self.inner.cx()
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Cancel every watcher attached through this cinema, detach every
    /// screen, and refuse further attaches. Idempotent.
    ///
    /// Nested cinemas lose their upstream screens and re-wire on their next
    /// attach.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().killed
    }

    /// Live screens in this cinema.
    #[must_use]
    pub fn screen_count(&self) -> usize {
        self.inner.lock().screens.len()
    }

    /// Counts for this cinema's screen of `source`, if it has one.
    #[must_use]
    pub fn screen_stats(&self, source: SourceId) -> Option<ScreenStats> {
        let screen = self.inner.lock().screens.get(&source).cloned();
        screen.map(|screen| screen.stats())
    }
}
