#![forbid(unsafe_code)]

//! Beamline public facade crate.
//!
//! Ordered completion frames and an elastic worker pool from
//! `beamline-core`, versioned reactive sources from `beamline-runtime`.
//!
//! # Example
//!
//! ```
//! use beamline::prelude::*;
//! use std::sync::{Arc, Mutex};
//!
//! let (root, _ctrl) = Cx::background();
//! let cinema = Cinema::root(Arc::new(SerialScope::new(&root)), Scheduler::with_defaults(&root));
//!
//! let count = Source::distinct(0_u32);
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&seen);
//! let _watch = count
//!     .subscribe(&cinema, &Cx::detached(), move |_cx, v, _seq| {
//!         sink.lock().unwrap().push(*v);
//!         Flow::Continue
//!     })
//!     .unwrap();
//!
//! count.update(&Cx::detached(), 3).wait().unwrap();
//! assert_eq!(*seen.lock().unwrap(), vec![0, 3]);
//! ```

pub use beamline_core as core;
pub use beamline_runtime as runtime;

pub mod prelude {
    pub use beamline_core::{
        Chain, Cx, CxController, Dispatch, Frame, FrameRef, Guard, Inline, Schedule, Scheduler,
        SchedulerConfig, SchedulerHooks, Valve, join,
    };
    pub use beamline_runtime::{
        Beam, Cinema, Flow, Phase, Propagation, ReactiveError, Scope, Seq, SerialScope, Source,
        Watcher, WatcherHandle,
    };
}
