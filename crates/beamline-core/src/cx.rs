#![forbid(unsafe_code)]

//! Cancellation context (`Cx`) for cooperative, hierarchical cancellation.
//!
//! `Cx` is a lightweight handle threaded through every scheduled task, write,
//! and subscription in Beamline. It enables:
//!
//! - **Cooperative cancellation**: any holder can check `cx.is_cancelled()` and
//!   take the cancel path instead of doing work.
//! - **Scoped hierarchies**: a child context is cancelled whenever any of its
//!   ancestors is, so cancelling a session cancels every scope below it.
//! - **Cancellation hooks**: [`Cx::on_cancel`] registers a callback that runs
//!   exactly once when the context is cancelled.
//!
//! # Design
//!
//! `Cx` is cheaply cloneable (`Arc` inside) and immutable from the outside.
//! To cancel, hold the companion [`CxController`]. Children register
//! themselves (weakly) on their parent, so cancellation is pushed down the
//! tree eagerly and `is_cancelled()` is a single atomic load.
//!
//! # Invariants
//!
//! 1. Cancellation is monotonic: once cancelled, a context never reverts.
//! 2. Each hook runs at most once, on the thread that triggered cancellation,
//!    in registration order, and never while an internal lock is held.
//! 3. A hook registered on an already-cancelled context runs immediately.
//! 4. Dropping a [`CancelHook`] before cancellation disarms it.
//!
//! # Tracing
//!
//! Cancellation emits a `WARN`-level event with a `cx_id` field.
//!
//! # Example
//!
//! ```
//! use beamline_core::cx::Cx;
//!
//! let (root, ctrl) = Cx::background();
//! let (child, _child_ctrl) = root.child();
//! assert!(!child.is_cancelled());
//!
//! ctrl.cancel();
//! assert!(child.is_cancelled());
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::warn;

// ─── Cx ID generation ────────────────────────────────────────────────────────

static NEXT_CX_ID: AtomicU64 = AtomicU64::new(1);

fn next_cx_id() -> u64 {
    NEXT_CX_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Metrics counters ────────────────────────────────────────────────────────

/// Total number of Cx cancellations observed.
static CX_CANCELLATIONS_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Read the total cancellation count (for diagnostics/telemetry).
#[must_use]
pub fn cx_cancellations_total() -> u64 {
    CX_CANCELLATIONS_TOTAL.load(Ordering::Relaxed)
}

// ─── Inner shared state ──────────────────────────────────────────────────────

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Registry {
    next_key: u64,
    hooks: BTreeMap<u64, Hook>,
    children: BTreeMap<u64, Weak<CxInner>>,
}

impl Registry {
    fn key(&mut self) -> u64 {
        self.next_key += 1;
        self.next_key
    }
}

struct CxInner {
    id: u64,
    cancelled: AtomicBool,
    /// Parent and the key this context is registered under in the parent.
    parent: Option<(Weak<CxInner>, u64)>,
    registry: Mutex<Registry>,
}

impl CxInner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        CX_CANCELLATIONS_TOTAL.fetch_add(1, Ordering::Relaxed);
        warn!(cx_id = self.id, "cx cancelled");

        let (hooks, children) = {
            let mut registry = self.registry();
            (
                std::mem::take(&mut registry.hooks),
                std::mem::take(&mut registry.children),
            )
        };
        for hook in hooks.into_values() {
            hook();
        }
        for child in children.into_values().filter_map(|weak| weak.upgrade()) {
            child.cancel();
        }
    }
}

impl Drop for CxInner {
    fn drop(&mut self) {
        if let Some((parent, key)) = self.parent.take() {
            if let Some(parent) = parent.upgrade() {
                parent.registry().children.remove(&key);
            }
        }
    }
}

// ─── Cx ──────────────────────────────────────────────────────────────────────

/// Cancellation context handle.
///
/// Cheaply cloneable. Check `is_cancelled()` before starting work and at
/// natural yield points.
#[derive(Clone)]
pub struct Cx {
    inner: Arc<CxInner>,
}

impl fmt::Debug for Cx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cx")
            .field("id", &self.inner.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Cx {
    // ── Constructors ─────────────────────────────────────────────────

    /// Create a root context and its controller.
    #[must_use]
    pub fn background() -> (Self, CxController) {
        let cx = Self::root();
        let ctrl = CxController {
            inner: Arc::clone(&cx.inner),
        };
        (cx, ctrl)
    }

    /// Create a context that can never be cancelled.
    ///
    /// Used for internal bookkeeping work that must run to completion
    /// regardless of which caller triggered it.
    #[must_use]
    pub fn detached() -> Self {
        Self::root()
    }

    fn root() -> Self {
        Self {
            inner: Arc::new(CxInner {
                id: next_cx_id(),
                cancelled: AtomicBool::new(false),
                parent: None,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Derive a child context.
    ///
    /// Cancelling this context (or any ancestor) also cancels the child.
    /// Cancelling the child leaves the parent untouched.
    #[must_use]
    pub fn child(&self) -> (Self, CxController) {
        let parent = &self.inner;
        let inner = {
            let mut registry = parent.registry();
            let key = registry.key();
            let inner = Arc::new(CxInner {
                id: next_cx_id(),
                cancelled: AtomicBool::new(false),
                parent: Some((Arc::downgrade(parent), key)),
                registry: Mutex::new(Registry::default()),
            });
            registry.children.insert(key, Arc::downgrade(&inner));
            inner
        };
        // The parent may have been cancelled after its children were drained
        // but before the registration above became visible.
        if parent.cancelled.load(Ordering::Acquire) {
            inner.cancel();
        }
        let ctrl = CxController {
            inner: Arc::clone(&inner),
        };
        (Self { inner }, ctrl)
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Unique identifier for this context (for tracing/logging).
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Check if this context (or any ancestor) has been cancelled.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Check if the context is still live; return `Err` if cancelled.
    ///
    /// Intended for use at yield points:
    /// ```ignore
    /// cx.check()?;
    /// ```
    pub fn check(&self) -> Result<(), CxError> {
        if self.is_cancelled() {
            Err(CxError::Cancelled)
        } else {
            Ok(())
        }
    }

    // ── Hooks ────────────────────────────────────────────────────────

    /// Run `f` once when this context is cancelled.
    ///
    /// If the context is already cancelled, `f` runs immediately on the
    /// calling thread. The returned [`CancelHook`] disarms the callback when
    /// dropped; keep it alive for as long as the callback should stay armed.
    pub fn on_cancel(&self, f: impl FnOnce() + Send + 'static) -> CancelHook {
        {
            let mut registry = self.inner.registry();
            if !self.is_cancelled() {
                let key = registry.key();
                registry.hooks.insert(key, Box::new(f));
                return CancelHook {
                    cx: Arc::downgrade(&self.inner),
                    key: Some(key),
                };
            }
        }
        f();
        CancelHook {
            cx: Weak::new(),
            key: None,
        }
    }
}

// ─── CxController ────────────────────────────────────────────────────────────

/// Control handle for a [`Cx`].
///
/// Held by the owner of the context to trigger cancellation.
/// Dropping the controller does **not** cancel the context; cancellation
/// is always explicit.
pub struct CxController {
    inner: Arc<CxInner>,
}

impl fmt::Debug for CxController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CxController")
            .field("id", &self.inner.id)
            .finish()
    }
}

impl CxController {
    /// Cancel the associated context.
    ///
    /// All clones of the `Cx` (and children) will observe
    /// `is_cancelled() == true`, and every armed hook runs. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Whether this context has already been cancelled.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// A `Cx` handle for the controlled context.
    #[must_use]
    pub fn cx(&self) -> Cx {
        Cx {
            inner: Arc::clone(&self.inner),
        }
    }
}

// ─── CancelHook ──────────────────────────────────────────────────────────────

/// Registration returned by [`Cx::on_cancel`]. Dropping it disarms the hook.
#[must_use = "dropping a CancelHook disarms it immediately"]
pub struct CancelHook {
    cx: Weak<CxInner>,
    key: Option<u64>,
}

impl fmt::Debug for CancelHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHook")
            .field("armed", &self.key.is_some())
            .finish()
    }
}

impl Drop for CancelHook {
    fn drop(&mut self) {
        if let (Some(key), Some(inner)) = (self.key.take(), self.cx.upgrade()) {
            inner.registry().hooks.remove(&key);
        }
    }
}

// ─── CxError ─────────────────────────────────────────────────────────────────

/// Error returned when an operation observes a cancelled `Cx`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CxError {
    /// The context was explicitly cancelled.
    Cancelled,
}

impl fmt::Display for CxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "context cancelled"),
        }
    }
}

impl std::error::Error for CxError {}
