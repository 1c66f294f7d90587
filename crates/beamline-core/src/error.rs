#![forbid(unsafe_code)]

//! Error types shared by the scheduler, frames, and reactive layer.

use thiserror::Error;

use crate::cx::CxError;

/// Recoverable failures surfaced by Beamline's core.
///
/// Contract violations (releasing a frame twice, scheduling onto a completed
/// frame, opening a valve twice) are not represented here: they panic.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("context cancelled")]
    Cancelled,
    #[error("task panicked: {message}")]
    TaskPanicked { message: String },
    #[error("blocking wait attempted on a scheduler worker thread")]
    BlockingOnWorker,
}

impl From<CxError> for Error {
    fn from(err: CxError) -> Self {
        match err {
            CxError::Cancelled => Self::Cancelled,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cx_error_converts_to_cancelled() {
        assert_eq!(Error::from(CxError::Cancelled), Error::Cancelled);
    }

    #[test]
    fn panic_message_is_rendered() {
        let err = Error::TaskPanicked {
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "task panicked: boom");
    }
}
