//! Benchmarks for completion-frame scheduling overhead.
//!
//! Run with: cargo bench -p beamline-core -- frame

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use beamline_core::cx::Cx;
use beamline_core::frame::{Chain, Frame, Schedule, join};
use beamline_core::scheduler::Inline;

// ---------------------------------------------------------------------------
// 1. Plain frame: schedule N inline units, release
// ---------------------------------------------------------------------------

fn bench_plain(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame/plain");
    let cx = Cx::detached();
    for count in [1_u64, 16, 256] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let frame = Frame::new(|| {});
                for i in 0..count {
                    frame.run(&Inline, &cx, move |_| {
                        black_box(i);
                    });
                }
                frame.release();
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// 2. Chain: append and drain
// ---------------------------------------------------------------------------

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame/chain");
    let cx = Cx::detached();
    for len in [16_u64, 256, 4096] {
        group.throughput(Throughput::Elements(len));
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            b.iter(|| {
                let chain = Chain::new();
                let head = chain.frame();
                for i in 0..len {
                    let frame = chain.frame();
                    frame.run(&Inline, &cx, move |_| {
                        black_box(i);
                    });
                }
                drop(head);
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// 3. Join of K chain frames
// ---------------------------------------------------------------------------

fn bench_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame/join");
    let cx = Cx::detached();
    for width in [2_usize, 3, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            let chains: Vec<Chain> = (0..width).map(|_| Chain::new()).collect();
            b.iter(|| {
                let frames: Vec<Frame> = chains.iter().map(Chain::frame).collect();
                let inputs: Vec<&dyn Schedule> = frames.iter().map(|f| f as &dyn Schedule).collect();
                let joined = join(&inputs);
                joined.run(&Inline, &cx, |_| {
                    black_box(());
                });
                drop(frames);
                drop(joined);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_plain, bench_chain, bench_join);
criterion_main!(benches);
