//! Buffer ownership benchmarks.
//!
//! One producer step and one consumer step per iteration over a shared
//! I/O area, the hot path of every processing cycle.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use parallax_remote::memory::{MemFd, MemoryKind, ProtFlags, RegionRegistry};
use parallax_remote::ownership::{BufferSlots, INVALID_ID, Produced, consume, produce};
use parallax_remote::port::IoBuffers;

fn io_area(registry: &mut RegionRegistry) -> IoBuffers {
    let memfd = MemFd::new("bench-ownership", 4096).unwrap();
    registry
        .register(0, MemoryKind::MemFd, memfd.try_clone_fd().unwrap(), 0)
        .unwrap();
    let handle = registry.acquire(0).unwrap();
    let range = registry
        .map(&handle, 0, 8, ProtFlags::READ | ProtFlags::WRITE)
        .unwrap();
    let io = IoBuffers::new(range).unwrap();
    io.set_buffer_id(INVALID_ID);
    io
}

fn bench_produce_consume(c: &mut Criterion) {
    let mut group = c.benchmark_group("produce_consume");

    for n_buffers in [2u32, 16, 64] {
        let mut registry = RegionRegistry::new();
        let io = io_area(&mut registry);
        let mut slots = BufferSlots::new(n_buffers);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(n_buffers), &n_buffers, |b, _| {
            b.iter(|| {
                let produced = produce(&io, &mut slots, |id| {
                    std::hint::black_box(id);
                });
                debug_assert!(matches!(produced, Produced::Published(_)));
                std::hint::black_box(consume(&io));
            });
        });
    }

    group.finish();
}

fn bench_slots(c: &mut Criterion) {
    let mut group = c.benchmark_group("slots_dequeue_recycle");

    for n_buffers in [16u32, 256] {
        let mut slots = BufferSlots::new(n_buffers);

        group.throughput(Throughput::Elements(u64::from(n_buffers)));
        group.bench_with_input(BenchmarkId::from_parameter(n_buffers), &n_buffers, |b, &n| {
            b.iter(|| {
                while let Some(id) = slots.dequeue() {
                    std::hint::black_box(id);
                }
                for id in 0..n {
                    slots.recycle(id).unwrap();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_produce_consume, bench_slots);
criterion_main!(benches);
