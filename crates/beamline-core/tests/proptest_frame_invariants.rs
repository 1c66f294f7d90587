#![forbid(unsafe_code)]

//! Property-based invariant tests for completion frames and guards.
//!
//! 1. A frame fires exactly once for any interleaving of schedule, finish,
//!    and release, and never before every registered unit has finished.
//! 2. A chain of frames completes in creation order for any release order.
//! 3. Guard callbacks run once each, in registration order per open call.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use beamline_core::frame::{Chain, Completion, Frame, Schedule};
use beamline_core::guard::Guard;
use proptest::prelude::*;

// ── Strategies ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Step {
    /// Register a new unit that stays pending.
    Schedule,
    /// Finish the pending unit at this index (modulo outstanding count).
    Finish(usize),
}

fn steps() -> impl Strategy<Value = Vec<Step>> {
    proptest::collection::vec(
        prop_oneof![Just(Step::Schedule), (0usize..64).prop_map(Step::Finish)],
        0..80,
    )
}

fn permutation(len: usize) -> impl Strategy<Value = Vec<usize>> {
    Just((0..len).collect::<Vec<_>>()).prop_shuffle()
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn hold(frame: &impl Schedule, parked: &Arc<Mutex<Vec<Completion>>>) {
    let parked = Arc::clone(parked);
    frame.schedule(Box::new(move |done: Completion| {
        parked.lock().unwrap().push(done);
    }));
}

// ═════════════════════════════════════════════════════════════════════════
// 1. Exactly-once completion
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn frame_fires_exactly_once(script in steps(), release_at in 0usize..80) {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let mut frame = Some(Frame::new(move || { f.fetch_add(1, Ordering::SeqCst); }));
        let handle = frame.as_ref().unwrap().handle();
        let parked = Arc::new(Mutex::new(Vec::new()));
        let mut outstanding: Vec<Completion> = Vec::new();

        for (i, step) in script.iter().enumerate() {
            if i == release_at {
                frame.take().unwrap().release();
            }
            if handle.is_complete() {
                break;
            }
            match *step {
                Step::Schedule => {
                    hold(&handle, &parked);
                    outstanding.extend(parked.lock().unwrap().drain(..));
                }
                Step::Finish(idx) if !outstanding.is_empty() => {
                    let done = outstanding.remove(idx % outstanding.len());
                    done();
                }
                Step::Finish(_) => {}
            }
            let expected = usize::from(frame.is_none() && outstanding.is_empty());
            prop_assert_eq!(fired.load(Ordering::SeqCst), expected);
        }

        drop(frame.take());
        for done in outstanding.drain(..) {
            prop_assert_eq!(fired.load(Ordering::SeqCst), 0);
            done();
        }
        prop_assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 2. Chain FIFO for any release order
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn chain_completes_in_creation_order(order in (1usize..24).prop_flat_map(permutation)) {
        let chain = Chain::new();
        let completed = Arc::new(Mutex::new(Vec::new()));
        let mut frames: Vec<Option<Frame>> = Vec::new();
        for i in 0..order.len() {
            let frame = chain.frame();
            let completed = Arc::clone(&completed);
            frame.schedule(Box::new(move |done: Completion| {
                completed.lock().unwrap().push(i);
                done();
            }));
            frames.push(Some(frame));
        }
        for idx in order {
            frames[idx].take().unwrap().release();
        }
        let completed = completed.lock().unwrap();
        prop_assert_eq!(completed.clone(), (0..frames.len()).collect::<Vec<_>>());
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 3. Guard replay
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn guard_runs_each_callback_once(
        tags in proptest::collection::vec(0u8..4, 0..40),
        opens in proptest::collection::vec(proptest::collection::vec(0u8..4, 0..3), 0..6),
    ) {
        let guard = Guard::new();
        let ran = Arc::new(Mutex::new(Vec::new()));
        for (i, tag) in tags.iter().copied().enumerate() {
            let ran = Arc::clone(&ran);
            guard.run(tag, move || ran.lock().unwrap().push(i));
        }

        let mut opened = BTreeSet::new();
        for batch in &opens {
            let before = ran.lock().unwrap().len();
            opened.extend(batch.iter().copied());
            guard.open(batch.iter().copied());
            let ran = ran.lock().unwrap();
            let drained = &ran[before..];
            prop_assert!(drained.windows(2).all(|w| w[0] < w[1]));
        }

        let ran = ran.lock().unwrap();
        let unique: BTreeSet<_> = ran.iter().copied().collect();
        prop_assert_eq!(unique.len(), ran.len());
        let expected: BTreeSet<_> = tags
            .iter()
            .enumerate()
            .filter(|(_, t)| opened.contains(*t))
            .map(|(i, _)| i)
            .collect();
        prop_assert_eq!(unique, expected);
        prop_assert_eq!(guard.pending(), tags.len() - ran.len());
    }
}
