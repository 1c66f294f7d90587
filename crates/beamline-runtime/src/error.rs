#![forbid(unsafe_code)]

//! Errors surfaced by the reactive layer.

use thiserror::Error;

/// Failures observed by callers of sources, beams, and propagations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReactiveError {
    /// The cinema (or one of its ancestors) has been cancelled; nothing can
    /// attach to it any more.
    #[error("scope is unmounted")]
    Unmounted,
    /// The caller's context was cancelled before the operation completed.
    /// The underlying write still happens.
    #[error("caller context cancelled")]
    Cancelled,
    /// The propagation was torn down before it reported completion.
    #[error("propagation interrupted before completion")]
    Interrupted,
    #[error("timed out waiting for propagation")]
    Timeout,
    #[error(transparent)]
    Core(#[from] beamline_core::Error),
}

pub type Result<T> = std::result::Result<T, ReactiveError>;
