#![forbid(unsafe_code)]

//! Core: cancellation contexts, the worker pool, completion frames, and
//! group-gated callbacks.

pub mod config;
pub mod cx;
pub mod error;
pub mod frame;
pub mod guard;
#[cfg(feature = "tracing-json")]
pub mod logging;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use cx::{CancelHook, Cx, CxController, CxError};
pub use error::{Error, Result};
pub use frame::{Chain, Frame, FrameRef, Schedule, Unit, Valve, join};
pub use guard::Guard;
pub use scheduler::{
    Completion, Dispatch, Executor, Inline, Scheduler, SchedulerHooks, SchedulerStats, Task,
};
