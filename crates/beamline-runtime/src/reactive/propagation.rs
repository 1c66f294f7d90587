#![forbid(unsafe_code)]

//! Completion handle for a single write.
//!
//! Every [`Source`](super::Source) write returns a [`Propagation`] that
//! settles once the new version has been carried through the whole screen
//! tree (or superseded by a newer one). Waiting is the only blocking
//! operation in the crate and is refused on scheduler workers: a worker
//! blocked on a propagation can starve the pool that has to finish it.
//!
//! Cancelling the writer's context settles the propagation early with
//! [`ReactiveError::Cancelled`]; the write itself is never rolled back.

use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use beamline_core::cx::{CancelHook, Cx};
use beamline_core::scheduler::on_worker_thread;
use tracing::warn;

use super::source::Seq;
use crate::error::{ReactiveError, Result};

type Outcome = std::result::Result<(), ReactiveError>;

/// Write end of a propagation. The first settle wins; later ones are no-ops.
#[derive(Clone)]
pub(crate) struct Settler {
    tx: Arc<Mutex<Option<SyncSender<Outcome>>>>,
}

impl Settler {
    pub(crate) fn settle(&self, outcome: Outcome) {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(outcome);
        }
    }
}

/// Awaitable completion of one write.
pub struct Propagation {
    seq: Seq,
    rx: Receiver<Outcome>,
    resolved: Option<Outcome>,
    _cancel: CancelHook,
}

impl fmt::Debug for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Propagation")
            .field("seq", &self.seq)
            .field("resolved", &self.resolved)
            .finish()
    }
}

impl Propagation {
    /// A pending propagation for version `seq`, settled early with
    /// `Cancelled` if `cx` is (or becomes) cancelled.
    pub(crate) fn pending(cx: &Cx, seq: Seq) -> (Self, Settler) {
        let (tx, rx) = mpsc::sync_channel(1);
        let settler = Settler {
            tx: Arc::new(Mutex::new(Some(tx))),
        };
        let weak = Arc::downgrade(&settler.tx);
        let hook = cx.on_cancel(move || {
            if let Some(tx) = weak.upgrade() {
                Settler { tx }.settle(Err(ReactiveError::Cancelled));
            }
        });
        (
            Self {
                seq,
                rx,
                resolved: None,
                _cancel: hook,
            },
            settler,
        )
    }

    /// An already-complete propagation (no-op write, or no subscribers).
    pub(crate) fn settled(cx: &Cx, seq: Seq) -> Self {
        let (propagation, settler) = Self::pending(cx, seq);
        settler.settle(Ok(()));
        propagation
    }

    /// The version this write produced, or the current version if the write
    /// was suppressed as equal.
    #[must_use]
    pub fn seq(&self) -> Seq {
        self.seq
    }

    /// Block until the write has propagated.
    ///
    /// # Errors
    ///
    /// - [`beamline_core::Error::BlockingOnWorker`] when called on a scheduler
    ///   worker thread.
    /// - [`ReactiveError::Cancelled`] if the writer's context was cancelled.
    /// - [`ReactiveError::Interrupted`] if the propagation was torn down.
    pub fn wait(mut self) -> Result<Seq> {
        if let Some(outcome) = self.resolved.take() {
            return outcome.map(|()| self.seq);
        }
        refuse_on_worker("wait")?;
        match self.rx.recv() {
            Ok(outcome) => outcome.map(|()| self.seq),
            Err(_) => Err(ReactiveError::Interrupted),
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Seq> {
        if let Some(outcome) = &self.resolved {
            return outcome.clone().map(|()| self.seq);
        }
        refuse_on_worker("wait_timeout")?;
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => {
                self.resolved = Some(outcome.clone());
                outcome.map(|()| self.seq)
            }
            Err(RecvTimeoutError::Timeout) => Err(ReactiveError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(ReactiveError::Interrupted),
        }
    }

    /// Non-blocking poll; `None` while still in flight. Safe on workers.
    pub fn try_wait(&mut self) -> Option<Result<Seq>> {
        if self.resolved.is_none() {
            match self.rx.try_recv() {
                Ok(outcome) => self.resolved = Some(outcome),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => {
                    self.resolved = Some(Err(ReactiveError::Interrupted));
                }
            }
        }
        self.resolved
            .clone()
            .map(|outcome| outcome.map(|()| self.seq))
    }
}

fn refuse_on_worker(op: &'static str) -> Result<()> {
    if on_worker_thread() {
        warn!(op, "blocking propagation wait on a scheduler worker refused");
        return Err(beamline_core::Error::BlockingOnWorker.into());
    }
    Ok(())
}
