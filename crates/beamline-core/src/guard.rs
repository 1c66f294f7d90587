#![forbid(unsafe_code)]

//! Group-gated deferred callbacks.
//!
//! A [`Guard`] holds callbacks tagged with a group until that group is
//! opened. Opening is permanent: once a group is open, later callbacks for
//! it run immediately on the calling thread.
//!
//! # Invariants
//!
//! 1. Every callback runs at most once.
//! 2. `open` runs the matching queued callbacks in registration order.
//! 3. Re-opening an already-open group never re-runs a drained callback.
//! 4. Callbacks run without the guard's lock held, so they may call back
//!    into the same guard.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

type Deferred = Box<dyn FnOnce() + Send>;

struct GuardState<G> {
    opened: Vec<G>,
    pending: Vec<(G, Deferred)>,
}

/// Registry of callbacks deferred until their group opens.
pub struct Guard<G> {
    state: Mutex<GuardState<G>>,
}

impl<G: PartialEq + Send> Guard<G> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GuardState {
                opened: Vec::new(),
                pending: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuardState<G>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` now if `group` is open, otherwise queue it.
    pub fn run(&self, group: G, f: impl FnOnce() + Send + 'static) {
        let mut state = self.lock();
        if state.opened.contains(&group) {
            drop(state);
            f();
        } else {
            state.pending.push((group, Box::new(f)));
        }
    }

    /// Open `groups` and run every queued callback tagged with one of them.
    pub fn open(&self, groups: impl IntoIterator<Item = G>) {
        let ready: Vec<Deferred> = {
            let mut state = self.lock();
            for group in groups {
                if !state.opened.contains(&group) {
                    state.opened.push(group);
                }
            }
            let GuardState { opened, pending } = &mut *state;
            let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(pending)
                .into_iter()
                .partition(|(group, _)| opened.contains(group));
            *pending = waiting;
            ready.into_iter().map(|(_, f)| f).collect()
        };
        for f in ready {
            f();
        }
    }

    #[must_use]
    pub fn is_open(&self, group: &G) -> bool {
        self.lock().opened.contains(group)
    }

    /// Callbacks still waiting for their group.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }
}

impl<G: PartialEq + Send> Default for Guard<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: fmt::Debug> fmt::Debug for Guard<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Guard")
            .field("opened", &state.opened)
            .field("pending", &state.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Stage {
        Init,
        Render,
        Unmount,
    }

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn queued_until_open() {
        let guard = Guard::new();
        let out = recorder();
        let o = Arc::clone(&out);
        guard.run(Stage::Init, move || o.lock().unwrap().push("init"));
        assert!(out.lock().unwrap().is_empty());
        assert_eq!(guard.pending(), 1);
        guard.open([Stage::Init]);
        assert_eq!(*out.lock().unwrap(), vec!["init"]);
        assert_eq!(guard.pending(), 0);
    }

    #[test]
    fn open_group_runs_immediately() {
        let guard = Guard::new();
        guard.open([Stage::Render]);
        let out = recorder();
        let o = Arc::clone(&out);
        guard.run(Stage::Render, move || o.lock().unwrap().push("render"));
        assert_eq!(*out.lock().unwrap(), vec!["render"]);
    }

    #[test]
    fn only_matching_groups_drain_in_order() {
        let guard = Guard::new();
        let out = recorder();
        for (stage, label) in [
            (Stage::Init, "a"),
            (Stage::Unmount, "b"),
            (Stage::Init, "c"),
            (Stage::Render, "d"),
        ] {
            let o = Arc::clone(&out);
            guard.run(stage, move || o.lock().unwrap().push(label));
        }
        guard.open([Stage::Init, Stage::Render]);
        assert_eq!(*out.lock().unwrap(), vec!["a", "c", "d"]);
        assert!(!guard.is_open(&Stage::Unmount));
        guard.open([Stage::Unmount]);
        assert_eq!(*out.lock().unwrap(), vec!["a", "c", "d", "b"]);
    }

    #[test]
    fn reopen_does_not_rerun() {
        let guard = Guard::new();
        let out = recorder();
        let o = Arc::clone(&out);
        guard.run(Stage::Init, move || o.lock().unwrap().push("once"));
        guard.open([Stage::Init]);
        guard.open([Stage::Init]);
        assert_eq!(*out.lock().unwrap(), vec!["once"]);
    }

    #[test]
    fn callbacks_may_reenter_guard() {
        let guard = Arc::new(Guard::new());
        let out = recorder();
        let g = Arc::clone(&guard);
        let o = Arc::clone(&out);
        guard.run(Stage::Init, move || {
            let o2 = Arc::clone(&o);
            g.run(Stage::Init, move || o2.lock().unwrap().push("nested"));
            g.open([Stage::Render]);
        });
        guard.open([Stage::Init]);
        assert_eq!(*out.lock().unwrap(), vec!["nested"]);
        assert!(guard.is_open(&Stage::Render));
    }
}
