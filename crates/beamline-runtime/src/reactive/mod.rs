#![forbid(unsafe_code)]

//! Versioned sources and the scope tree that carries their changes.
//!
//! # Architecture
//!
//! ```text
//! Source ──pass──▶ Screen (root cinema) ──▶ Watchers
//!                     │
//!                     └──▶ Screen (child cinema) ──▶ Watchers
//!                              │
//!                              └──▶ ...
//! ```
//!
//! - [`Source`] / [`Beam`]: the versioned cell and its read-only view.
//! - [`Watcher`]: leaf subscriber; `init` once, then `update`s.
//! - [`Cinema`]: one node of the consumer's scope tree, holding one screen
//!   per source it observes.
//! - [`Propagation`]: completion of one write.

pub mod cinema;
pub mod propagation;
pub mod screen;
pub mod source;
pub mod watcher;

pub use cinema::Cinema;
pub use propagation::Propagation;
pub use screen::ScreenStats;
pub use source::{Beam, Seq, Source, SourceId};
pub use watcher::{Flow, FnWatcher, Watcher, WatcherHandle, WatcherId};
