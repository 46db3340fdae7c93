// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use taskflow::{Completion, Registry, Scheduler, Task};

fn map_chain_100_resolved(c: &mut Criterion) {
    const STAGES: usize = 100;

    c.bench_function("map_chain_100_resolved", |b| {
        b.iter(|| {
            let chain = (0..STAGES).fold(Task::success(0u64), |task, _| task.map(|x| x + 1));
            black_box(chain.wait().unwrap());
        });
    });
}

fn then_chain_100_current_thread(c: &mut Criterion) {
    const STAGES: usize = 100;
    let queue = Scheduler::current_thread("bench");

    c.bench_function("then_chain_100_current_thread", |b| {
        b.iter(|| {
            let chain = (0..STAGES).fold(Task::success(0u64), |task, _| {
                let queue = queue.clone();
                task.then(move |x| {
                    Task::from_fn(move |done: Completion<u64>| done.succeed(x + 1)).on(&queue)
                })
            });
            black_box(queue.block_on(chain).unwrap());
        });
    });
}

fn serial_queue_10k_jobs(c: &mut Criterion) {
    const JOBS: usize = 10_000;
    let queue = Scheduler::serial("bench-serial");

    c.bench_function("serial_queue_10k_jobs", |b| {
        b.iter(|| {
            for _ in 0..JOBS - 1 {
                queue.spawn(|| {}).unwrap();
            }
            let last = Task::from_fn(|done: Completion<()>| done.succeed(())).on(&queue);
            queue.block_on(last).unwrap();
        });
    });
}

fn registry_supersede_1k(c: &mut Criterion) {
    const TASKS: u32 = 1_000;
    let queue = Scheduler::current_thread("bench-registry");
    let registry = Registry::new(&queue);

    c.bench_function("registry_supersede_1k", |b| {
        b.iter(|| {
            for i in 0..TASKS {
                let task = Task::from_fn(move |done: Completion<u32>| done.succeed(i));
                registry.execute(task.keyed("bench")).unwrap();
            }
            queue.run_until_idle();
        });
    });
}

criterion_group!(
    benches,
    map_chain_100_resolved,
    then_chain_100_current_thread,
    serial_queue_10k_jobs,
    registry_supersede_1k
);
criterion_main!(benches);
