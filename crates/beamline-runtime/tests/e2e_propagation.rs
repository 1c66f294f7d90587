//! E2E integration test: value propagation through cinemas and watchers.
//!
//! Validates:
//! 1. With skipping disabled every watcher sees every version in order.
//! 2. With skipping enabled a version superseded before it could be
//!    broadcast is never delivered.
//! 3. Late joiners start from the version in effect at attach time.
//! 4. Equal writes on a distinct source allocate nothing and notify nobody.
//! 5. Cancellation is idempotent and prunes empty screens up the tree.
//! 6. Concurrent attach/cancel never loses a subscriber or leaks a screen.
//! 7. Blocking waits are refused on scheduler workers.
//! 8. A panicking watcher cancels its scheduler but leaves the committed
//!    value readable.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use beamline_core::config::SchedulerConfig;
use beamline_core::cx::{Cx, CxController};
use beamline_core::scheduler::{Scheduler, SchedulerHooks};
use beamline_runtime::error::ReactiveError;
use beamline_runtime::reactive::{Cinema, Flow, Propagation, Seq, Source};
use beamline_runtime::scope::SerialScope;

const WAIT: Duration = Duration::from_secs(10);

type Log = Arc<Mutex<Vec<(u32, Seq)>>>;

struct Harness {
    scope: Arc<SerialScope>,
    cinema: Cinema,
    ctrl: CxController,
}

fn harness(gated: bool) -> Harness {
    let (root, ctrl) = Cx::background();
    let scheduler = Scheduler::start(
        &root,
        SchedulerConfig::default().with_worker_limit(4),
        SchedulerHooks::new(),
    );
    let scope = Arc::new(if gated {
        SerialScope::gated(&root)
    } else {
        SerialScope::new(&root)
    });
    let cinema = Cinema::root(scope.clone(), scheduler);
    Harness {
        scope,
        cinema,
        ctrl,
    }
}

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn recording(log: &Log) -> impl FnMut(&Cx, &u32, Seq) -> Flow + Send + 'static {
    let log = Arc::clone(log);
    move |_cx, value, seq| {
        log.lock().unwrap().push((*value, seq));
        Flow::Continue
    }
}

fn settle(mut propagation: Propagation) -> Seq {
    propagation
        .wait_timeout(WAIT)
        .expect("propagation did not settle")
}

// ═════════════════════════════════════════════════════════════════════════
// 1. Ordered delivery
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn no_skip_delivers_every_version_to_every_watcher() {
    let h = harness(false);
    let source = Source::new(0_u32);
    source.disable_skipping();
    let (a, b) = (log(), log());
    let _wa = source.subscribe(&h.cinema, &Cx::detached(), recording(&a)).unwrap();
    let _wb = source.subscribe(&h.cinema, &Cx::detached(), recording(&b)).unwrap();

    let cx = Cx::detached();
    let p5 = source.update(&cx, 5);
    let p7 = source.update(&cx, 7);
    assert_eq!(settle(p5), 2);
    assert_eq!(settle(p7), 3);

    for log in [&a, &b] {
        assert_eq!(*log.lock().unwrap(), vec![(0, 1), (5, 2), (7, 3)]);
    }
}

#[test]
fn superseded_version_is_skipped_behind_a_closed_scope() {
    let h = harness(true);
    let source = Source::new(0_u32);
    let (a, b) = (log(), log());
    let _wa = source.subscribe(&h.cinema, &Cx::detached(), recording(&a)).unwrap();
    let _wb = source.subscribe(&h.cinema, &Cx::detached(), recording(&b)).unwrap();

    let cx = Cx::detached();
    let p5 = source.update(&cx, 5);
    let p7 = source.update(&cx, 7);
    h.scope.open();
    assert_eq!(settle(p5), 2);
    assert_eq!(settle(p7), 3);

    for log in [&a, &b] {
        assert_eq!(*log.lock().unwrap(), vec![(0, 1), (7, 3)]);
    }
}

#[test]
fn rapid_writes_end_on_latest_with_increasing_seqs() {
    const WRITES: u32 = 200;

    let h = harness(false);
    let source = Source::new(0_u32);
    let seen = log();
    let _w = source.subscribe(&h.cinema, &Cx::detached(), recording(&seen)).unwrap();

    let cx = Cx::detached();
    let pending: Vec<_> = (1..=WRITES).map(|v| source.update(&cx, v)).collect();
    for p in pending {
        settle(p);
    }

    let seen = seen.lock().unwrap();
    assert!(seen.windows(2).all(|w| w[0].1 < w[1].1), "{seen:?}");
    assert_eq!(seen.last(), Some(&(WRITES, Seq::from(WRITES) + 1)));
}

// ═════════════════════════════════════════════════════════════════════════
// 2. Attach semantics
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn late_joiner_starts_at_attach_time_version() {
    let h = harness(false);
    let source = Source::new(0_u32);
    let cx = Cx::detached();
    for v in 1..=3 {
        settle(source.update(&cx, v));
    }

    let early = log();
    let _we = source.subscribe(&h.cinema, &cx, recording(&early)).unwrap();
    settle(source.update(&cx, 4));

    let at_attach = source.seq();
    let late = log();
    let _wl = source.subscribe(&h.cinema, &cx, recording(&late)).unwrap();

    assert_eq!(early.lock().unwrap()[0], (3, 4));
    let (value, seq) = late.lock().unwrap()[0];
    assert!(seq >= at_attach);
    assert_eq!(value, 4);
}

#[test]
fn read_reflects_committed_version_in_scope() {
    let h = harness(true);
    let source = Source::new(0_u32);
    let _w = source
        .subscribe(&h.cinema, &Cx::detached(), |_: &Cx, _: &u32, _: Seq| Flow::Continue)
        .unwrap();

    let p = source.update(&Cx::detached(), 5);
    assert_eq!(*source.read(&h.cinema).unwrap(), 0);
    assert_eq!(*source.latest(), 5);

    h.scope.open();
    settle(p);
    assert_eq!(*source.read(&h.cinema).unwrap(), 5);
}

#[test]
fn read_and_subscribe_returns_current_and_streams_updates() {
    let h = harness(false);
    let source = Source::new(10_u32);
    let seen = log();
    let (value, _w) = source
        .read_and_subscribe(&h.cinema, &Cx::detached(), recording(&seen))
        .unwrap();
    assert_eq!(*value, 10);
    assert!(seen.lock().unwrap().is_empty());

    settle(source.update(&Cx::detached(), 11));
    assert_eq!(*seen.lock().unwrap(), vec![(11, 2)]);
}

#[test]
fn equal_write_on_distinct_source_is_silent() {
    let h = harness(false);
    let source = Source::distinct(5_u32);
    let seen = log();
    let _w = source.subscribe(&h.cinema, &Cx::detached(), recording(&seen)).unwrap();

    let cx = Cx::detached();
    assert_eq!(settle(source.update(&cx, 5)), 1);
    assert_eq!(source.seq(), 1);
    assert_eq!(settle(source.update(&cx, 6)), 2);
    assert_eq!(*seen.lock().unwrap(), vec![(5, 1), (6, 2)]);
}

#[test]
fn nested_cinema_receives_through_parent_screen() {
    let h = harness(false);
    let child_scope = Arc::new(h.scope.child());
    let child = h.cinema.child(child_scope);
    let source = Source::new(0_u32);
    let seen = log();
    let _w = source.subscribe(&child, &Cx::detached(), recording(&seen)).unwrap();

    let parent_stats = h.cinema.screen_stats(source.id()).unwrap();
    assert_eq!((parent_stats.watchers, parent_stats.children), (0, 1));

    settle(source.update(&Cx::detached(), 9));
    assert_eq!(*seen.lock().unwrap(), vec![(0, 1), (9, 2)]);
    assert_eq!(child.screen_stats(source.id()).unwrap().committed, 2);
}

// ═════════════════════════════════════════════════════════════════════════
// 3. Termination and pruning
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn cancel_is_idempotent_and_hook_runs_once() {
    let h = harness(false);
    let source = Source::new(0_u32);
    let hooks = Arc::new(AtomicUsize::new(0));
    let seen = log();
    let hk = Arc::clone(&hooks);
    let handle = source
        .subscribe_with_cancel(&h.cinema, &Cx::detached(), recording(&seen), move || {
            hk.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    handle.cancel();
    handle.cancel();
    assert!(handle.is_done());
    assert_eq!(hooks.load(Ordering::SeqCst), 1);
    assert_eq!(h.cinema.screen_count(), 0);

    settle(source.update(&Cx::detached(), 1));
    assert_eq!(*seen.lock().unwrap(), vec![(0, 1)]);
}

#[test]
fn done_detaches_without_cancel_hook() {
    let h = harness(false);
    let source = Source::new(0_u32);
    let hooks = Arc::new(AtomicUsize::new(0));
    let hk = Arc::clone(&hooks);
    let handle = source
        .subscribe_with_cancel(
            &h.cinema,
            &Cx::detached(),
            |_: &Cx, v: &u32, _: Seq| if *v >= 2 { Flow::Done } else { Flow::Continue },
            move || {
                hk.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

    settle(source.update(&Cx::detached(), 2));
    assert!(handle.is_done());
    assert_eq!(h.cinema.screen_count(), 0);
    handle.cancel();
    assert_eq!(hooks.load(Ordering::SeqCst), 0);
}

#[test]
fn last_watcher_prunes_screens_up_the_tree() {
    let h = harness(false);
    let child = h.cinema.child(Arc::new(h.scope.child()));
    let source = Source::new(0_u32);
    let noop = |_: &Cx, _: &u32, _: Seq| Flow::Continue;
    let direct = source.subscribe(&h.cinema, &Cx::detached(), noop).unwrap();
    let nested = source.subscribe(&child, &Cx::detached(), noop).unwrap();

    nested.cancel();
    assert_eq!(child.screen_count(), 0);
    let stats = h.cinema.screen_stats(source.id()).unwrap();
    assert_eq!((stats.watchers, stats.children), (1, 0));

    direct.cancel();
    assert_eq!(h.cinema.screen_count(), 0);
}

#[test]
fn watcher_context_cancellation_cancels_watcher() {
    let h = harness(false);
    let source = Source::new(0_u32);
    let (cx, ctrl) = Cx::background();
    let handle = source
        .subscribe(&h.cinema, &cx, |_: &Cx, _: &u32, _: Seq| Flow::Continue)
        .unwrap();
    ctrl.cancel();
    assert!(handle.is_done());
    assert_eq!(h.cinema.screen_count(), 0);
    assert_eq!(
        source
            .subscribe(&h.cinema, &cx, |_: &Cx, _: &u32, _: Seq| Flow::Continue)
            .unwrap_err(),
        ReactiveError::Cancelled
    );
}

#[test]
fn cancelled_cinema_refuses_attach_and_cancels_watchers() {
    let h = harness(false);
    let source = Source::new(0_u32);
    let handle = source
        .subscribe(&h.cinema, &Cx::detached(), |_: &Cx, _: &u32, _: Seq| Flow::Continue)
        .unwrap();

    h.ctrl.cancel();
    assert!(h.cinema.is_cancelled());
    assert!(handle.is_done());
    assert_eq!(
        source
            .subscribe(&h.cinema, &Cx::detached(), |_: &Cx, _: &u32, _: Seq| Flow::Continue)
            .unwrap_err(),
        ReactiveError::Unmounted
    );
}

// ═════════════════════════════════════════════════════════════════════════
// 4. Concurrency
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn concurrent_attach_and_prune_never_loses_a_subscriber() {
    const THREADS: usize = 6;
    const ROUNDS: u32 = 100;

    let h = harness(false);
    let source = Source::new(0_u32);
    let barrier = Arc::new(Barrier::new(THREADS + 1));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let source = source.beam();
            let cinema = h.cinema.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    let w = source
                        .subscribe(&cinema, &Cx::detached(), |_: &Cx, _: &u32, _: Seq| {
                            Flow::Continue
                        })
                        .unwrap();
                    w.cancel();
                }
            })
        })
        .collect();

    barrier.wait();
    let cx = Cx::detached();
    for v in 1..=ROUNDS {
        settle(source.update(&cx, v));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(h.cinema.screen_count(), 0);

    let seen = log();
    let _w = source.subscribe(&h.cinema, &cx, recording(&seen)).unwrap();
    let seq = settle(source.update(&cx, 999));
    assert_eq!(seen.lock().unwrap().last(), Some(&(999, seq)));
}

#[test]
fn writers_on_many_threads_allocate_unique_seqs() {
    const THREADS: usize = 8;
    const PER_THREAD: u32 = 50;

    let h = harness(false);
    let source = Source::new(0_u32);
    let seen = log();
    let _w = source.subscribe(&h.cinema, &Cx::detached(), recording(&seen)).unwrap();
    let barrier = Arc::new(Barrier::new(THREADS));
    let (tx, rx) = mpsc::channel();

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let source = source.clone();
            let barrier = Arc::clone(&barrier);
            let tx = tx.clone();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..PER_THREAD {
                    let seq = settle(source.update(&Cx::detached(), t as u32 * 1000 + i));
                    tx.send(seq).unwrap();
                }
            })
        })
        .collect();
    drop(tx);
    for handle in handles {
        handle.join().unwrap();
    }

    let mut seqs: Vec<Seq> = rx.iter().collect();
    seqs.sort_unstable();
    seqs.dedup();
    assert_eq!(seqs.len(), THREADS * PER_THREAD as usize);
    assert_eq!(source.seq(), 1 + Seq::from(PER_THREAD) * THREADS as Seq);

    let seen = seen.lock().unwrap();
    assert!(seen.windows(2).all(|w| w[0].1 < w[1].1));
    assert_eq!(seen.last().map(|&(_, s)| s), Some(source.seq()));
}

#[test]
fn wait_on_worker_is_refused() {
    let h = harness(false);
    let source = Source::new(0_u32);
    let (tx, rx) = mpsc::channel();
    h.cinema.scheduler().spawn(&Cx::detached(), move |_| {
        tx.send(source.update(&Cx::detached(), 1).wait()).unwrap();
    });
    let result = rx.recv_timeout(WAIT).expect("worker never reported");
    assert_eq!(
        result,
        Err(ReactiveError::Core(beamline_core::Error::BlockingOnWorker))
    );
}

// ═════════════════════════════════════════════════════════════════════════
// 8. Task panics
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn panicking_watcher_keeps_committed_value_readable() {
    let h = harness(false);
    let source = Source::new(0_u32);
    let _w = source
        .subscribe(&h.cinema, &Cx::detached(), |_: &Cx, v: &u32, _: Seq| {
            assert_ne!(*v, 1, "watcher rejects 1");
            Flow::Continue
        })
        .unwrap();

    assert_eq!(settle(source.update(&Cx::detached(), 1)), 2);
    assert!(h.cinema.scheduler().is_cancelled());
    assert!(!h.cinema.is_cancelled());

    // Broadcasts now take the cancel path; the screen stays at seq 2.
    settle(source.update(&Cx::detached(), 2));
    settle(source.update(&Cx::detached(), 3));
    assert_eq!(source.seq(), 4);
    assert_eq!(*source.read(&h.cinema).unwrap(), 1);
    assert_eq!(*source.latest(), 3);

    let (value, _late) = source
        .read_and_subscribe(&h.cinema, &Cx::detached(), |_: &Cx, _: &u32, _: Seq| {
            Flow::Continue
        })
        .unwrap();
    assert_eq!(*value, 1);
}
