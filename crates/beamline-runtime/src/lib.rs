#![forbid(unsafe_code)]

//! Reactive layer: versioned sources fanned out through a tree of scoped
//! screens to leaf watchers, ordered by `beamline-core` frames.

pub mod error;
pub mod reactive;
pub mod scope;

pub use error::{ReactiveError, Result};
pub use reactive::{
    Beam, Cinema, Flow, FnWatcher, Propagation, ScreenStats, Seq, Source, SourceId, Watcher,
    WatcherHandle, WatcherId,
};
pub use scope::{Phase, Scope, SerialScope};
