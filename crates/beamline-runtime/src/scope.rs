#![forbid(unsafe_code)]

//! Scope capability: how the reactive layer obtains scoping frames.
//!
//! Every [`Cinema`](crate::reactive::Cinema) belongs to a [`Scope`]. Before
//! a screen broadcasts a new version it joins a fresh frame from its scope,
//! so propagation into that scope is serialized against whatever else the
//! scope's owner (a renderer, a request handler) orders through the same
//! frames, without the reactive layer knowing what that work is.
//!
//! [`SerialScope`] is the stock implementation: a [`Chain`] of frames behind
//! an optional first-render gate, plus a [`Guard`] of lifecycle callbacks
//! keyed by [`Phase`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use beamline_core::cx::{Cx, CxController};
use beamline_core::frame::{Chain, Completion, Frame, Schedule, Valve};
use beamline_core::guard::Guard;
use tracing::debug;

/// Capability exposed by the owner of a cinema.
pub trait Scope: Send + Sync + 'static {
    /// Context cancelled when the scope goes away.
    fn cx(&self) -> &Cx;
    /// A new frame ordered against the scope's other work. The caller
    /// releases it.
    fn new_frame(&self) -> Frame;
}

/// Lifecycle phases callbacks can be deferred to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// The scope finished initialization.
    Init,
    /// The first render committed.
    Render,
    /// The scope was torn down.
    Unmount,
}

/// Frame-chain scope with a first-render gate and phase callbacks.
pub struct SerialScope {
    cx: Cx,
    ctrl: CxController,
    lane: Chain,
    gate: Valve,
    opened: AtomicBool,
    phases: Guard<Phase>,
}

impl fmt::Debug for SerialScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialScope")
            .field("cx", &self.cx)
            .field("open", &self.is_open())
            .field("phases", &self.phases)
            .finish()
    }
}

impl SerialScope {
    /// An open scope whose context is a child of `parent`.
    #[must_use]
    pub fn new(parent: &Cx) -> Self {
        let scope = Self::gated(parent);
        scope.open();
        scope
    }

    /// A scope whose frames stay inactive until [`open`](Self::open).
    ///
    /// Propagation into a gated scope queues up behind the gate, so a
    /// component can subscribe during construction and receive updates only
    /// once its first render has committed.
    #[must_use]
    pub fn gated(parent: &Cx) -> Self {
        let (cx, ctrl) = parent.child();
        let lane = Chain::new();
        let gate = Valve::new();
        let first = lane.frame();
        gate.schedule(Box::new(move |done: Completion| {
            drop(first);
            done();
        }));
        Self {
            cx,
            ctrl,
            lane,
            gate,
            opened: AtomicBool::new(false),
            phases: Guard::new(),
        }
    }

    /// A child scope of this one; unmounting this scope unmounts the child.
    #[must_use]
    pub fn child(&self) -> Self {
        Self::new(&self.cx)
    }

    /// Open the gate and the `Init` and `Render` phases. Idempotent.
    pub fn open(&self) {
        self.open_gate();
        self.phases.open([Phase::Init, Phase::Render]);
    }

    fn open_gate(&self) {
        if !self.opened.swap(true, Ordering::AcqRel) {
            self.gate.activate();
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// Open an individual phase.
    pub fn mark(&self, phase: Phase) {
        self.phases.open([phase]);
    }

    /// Run `f` once `phase` has been reached (immediately if it has).
    pub fn defer(&self, phase: Phase, f: impl FnOnce() + Send + 'static) {
        self.phases.run(phase, f);
    }

    /// Tear the scope down: cancel its context, release anything queued
    /// behind the gate (it takes its cancel path), and open `Unmount`.
    pub fn unmount(&self) {
        debug!(cx_id = self.cx.id(), "scope unmounted");
        self.ctrl.cancel();
        self.open_gate();
        self.phases.open([Phase::Unmount]);
    }
}

impl Scope for SerialScope {
    fn cx(&self) -> &Cx {
        &self.cx
    }

    fn new_frame(&self) -> Frame {
        self.lane.frame()
    }
}
