// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{criterion_group, criterion_main, Criterion};
use flowrt::{collect_all, lazy, sync_await, Lazy, SimpleExecutor, Yield};
use std::sync::Arc;

const PINGS: usize = 10_000;

fn yielding_task() -> Lazy<()> {
    lazy(async {
        for _ in 0..PINGS {
            Yield::default().await;
        }
    })
}

/// Wraps a `RescheduleLazy` back into a plain `Lazy` so a batch of executor-bound tasks can
/// be handed to [`collect_all`], which only takes un-bound `Lazy<T>`s.
fn bound_yielding_task(ex: &Arc<dyn flowrt::Executor>) -> Lazy<()> {
    let bound = yielding_task().via(ex.clone());
    lazy(async move { bound.await.value() })
}

fn ping_ping_10k_single_threaded(c: &mut Criterion) {
    let ex: Arc<dyn flowrt::Executor> = SimpleExecutor::new(1);
    c.bench_function("ping_ping_10k_single_threaded", |b| {
        b.iter(|| sync_await(bound_yielding_task(&ex)));
    });
}

fn ping_pong_10k_single_threaded(c: &mut Criterion) {
    let ex: Arc<dyn flowrt::Executor> = SimpleExecutor::new(1);
    c.bench_function("ping_pong_10k_single_threaded", |b| {
        b.iter(|| {
            let tasks = vec![bound_yielding_task(&ex), bound_yielding_task(&ex)];
            sync_await(lazy(collect_all(tasks)));
        });
    });
}

fn ping_ping_10k_multi_threaded(c: &mut Criterion) {
    let ex: Arc<dyn flowrt::Executor> = SimpleExecutor::new(2);
    c.bench_function("ping_ping_10k_multi_threaded", |b| {
        b.iter(|| sync_await(bound_yielding_task(&ex)));
    });
}

fn ping_pong_10k_multi_threaded(c: &mut Criterion) {
    let ex: Arc<dyn flowrt::Executor> = SimpleExecutor::new(2);
    c.bench_function("ping_pong_10k_multi_threaded", |b| {
        b.iter(|| {
            let tasks = vec![bound_yielding_task(&ex), bound_yielding_task(&ex)];
            sync_await(lazy(collect_all(tasks)));
        });
    });
}

criterion_group!(
    ping_pong,
    ping_ping_10k_single_threaded,
    ping_pong_10k_single_threaded,
    ping_ping_10k_multi_threaded,
    ping_pong_10k_multi_threaded,
);
criterion_main!(ping_pong);
