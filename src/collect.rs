// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fan-out / fan-in combinators over a batch of [`Lazy`] tasks.
//!
//! The upstream `CountEvent` is a lock-free down-counter that hands back a parked
//! coroutine handle on its final decrement, with a `+1` initial bias specifically to make
//! "install the handle, then do one more decrement" race-free against tasks that finish
//! synchronously before the handle is ever installed. We don't have a coroutine handle to
//! park in the first place here -- only a `Waker` -- and a `Waker` is safe to store and
//! invoke from any thread at any time, including before anyone is polling yet. So the bias
//! trick isn't needed: each combinator below keeps its per-slot results behind a plain
//! `Mutex` and treats "remaining count reached zero" as the sole readiness signal, checked
//! fresh on every poll. That sidesteps the lock-free handle-installation race entirely
//! instead of replicating it.

use crate::executor::{current_executor, Executor};
use crate::future::{Future as FlowFuture, Promise};
use crate::lazy::{Lazy, Yield};
use crate::try_::Try;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context as PollContext, Poll, Waker};

fn resolve_executor(task: &mut Lazy<impl Send + 'static>, inherited: &Option<Arc<dyn Executor>>) {
    if task.executor.is_none() {
        task.executor = inherited.clone();
    }
}

// === CollectAll / CollectAllPara ===

struct CollectAllShared<T> {
    remaining: AtomicUsize,
    results: Mutex<Vec<Try<T>>>,
    waker: Mutex<Option<Waker>>,
}

enum CollectAllState<T> {
    NotStarted(Vec<Lazy<T>>, bool),
    Taking,
    Running(Arc<CollectAllShared<T>>),
}

/// Future returned by [`collect_all`] / [`collect_all_para`]. Fans a batch of lazy tasks
/// out on first poll and resolves once every one of them has completed, in input order.
pub struct CollectAll<T> {
    state: CollectAllState<T>,
}

impl<T: Send + 'static> CollectAll<T> {
    fn new(tasks: Vec<Lazy<T>>, parallel: bool) -> Self {
        Self {
            state: CollectAllState::NotStarted(tasks, parallel),
        }
    }
}

impl<T: Send + 'static> Future for CollectAll<T> {
    type Output = Vec<Try<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<Vec<Try<T>>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                CollectAllState::NotStarted(_, _) => {
                    let CollectAllState::NotStarted(tasks, parallel) =
                        std::mem::replace(&mut this.state, CollectAllState::Taking)
                    else {
                        unreachable!("just matched NotStarted");
                    };

                    let n = tasks.len();
                    let inherited = current_executor();
                    let shared = Arc::new(CollectAllShared {
                        remaining: AtomicUsize::new(n),
                        results: Mutex::new((0..n).map(|_| Try::Empty).collect()),
                        waker: Mutex::new(Some(cx.waker().clone())),
                    });

                    for (i, mut task) in tasks.into_iter().enumerate() {
                        resolve_executor(&mut task, &inherited);
                        let for_task = shared.clone();
                        let dispatch = move || {
                            task.start(move |t| {
                                for_task.results.lock()[i] = t;
                                if for_task.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                                    if let Some(waker) = for_task.waker.lock().take() {
                                        waker.wake();
                                    }
                                }
                            });
                        };
                        if parallel && n > 1 {
                            if let Some(executor) = &inherited {
                                executor.schedule(Box::new(dispatch));
                                continue;
                            }
                        }
                        dispatch();
                    }

                    this.state = CollectAllState::Running(shared);
                }
                CollectAllState::Taking => unreachable!("poll called while mid-transition"),
                CollectAllState::Running(shared) => {
                    if shared.remaining.load(Ordering::Acquire) == 0 {
                        let results = std::mem::take(&mut *shared.results.lock());
                        return Poll::Ready(results);
                    }
                    *shared.waker.lock() = Some(cx.waker().clone());
                    return Poll::Pending;
                }
            }
        }
    }
}

/// Fans a batch of lazy tasks out serially (on the calling worker) and resolves once all
/// complete, with output order matching input order regardless of completion order.
#[must_use]
pub fn collect_all<T: Send + 'static>(tasks: Vec<Lazy<T>>) -> CollectAll<T> {
    CollectAll::new(tasks, false)
}

/// As [`collect_all`], but when there's an ambient executor and more than one task, each
/// task's start is itself dispatched through `executor.schedule` so the starts fan out
/// across workers instead of running serially on the current one.
#[must_use]
pub fn collect_all_para<T: Send + 'static>(tasks: Vec<Lazy<T>>) -> CollectAll<T> {
    CollectAll::new(tasks, true)
}

// === CollectAny ===

/// The `{index, value}` pair returned by [`collect_any`]: which task finished first and
/// what it produced.
pub struct CollectAnyResult<T> {
    pub index: usize,
    pub value: Try<T>,
}

struct CollectAnyShared<T> {
    done: AtomicBool,
    slot: Mutex<Option<CollectAnyResult<T>>>,
    waker: Mutex<Option<Waker>>,
}

enum CollectAnyState<T> {
    NotStarted(Vec<Lazy<T>>),
    Taking,
    Running(Arc<CollectAnyShared<T>>),
}

/// Future returned by [`collect_any`]. Resolves with the first task to complete; the rest
/// keep running to completion but their results are discarded.
pub struct CollectAny<T> {
    state: CollectAnyState<T>,
}

impl<T: Send + 'static> Future for CollectAny<T> {
    type Output = CollectAnyResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<CollectAnyResult<T>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                CollectAnyState::NotStarted(_) => {
                    let CollectAnyState::NotStarted(tasks) =
                        std::mem::replace(&mut this.state, CollectAnyState::Taking)
                    else {
                        unreachable!("just matched NotStarted");
                    };

                    let inherited = current_executor();
                    let shared = Arc::new(CollectAnyShared {
                        done: AtomicBool::new(false),
                        slot: Mutex::new(None),
                        waker: Mutex::new(Some(cx.waker().clone())),
                    });

                    for (i, mut task) in tasks.into_iter().enumerate() {
                        resolve_executor(&mut task, &inherited);
                        let for_task = shared.clone();
                        task.start(move |t| {
                            if for_task
                                .done
                                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                                .is_ok()
                            {
                                *for_task.slot.lock() = Some(CollectAnyResult { index: i, value: t });
                                if let Some(waker) = for_task.waker.lock().take() {
                                    waker.wake();
                                }
                            }
                        });
                    }

                    this.state = CollectAnyState::Running(shared);
                }
                CollectAnyState::Taking => unreachable!("poll called while mid-transition"),
                CollectAnyState::Running(shared) => {
                    if let Some(result) = shared.slot.lock().take() {
                        return Poll::Ready(result);
                    }
                    *shared.waker.lock() = Some(cx.waker().clone());
                    return Poll::Pending;
                }
            }
        }
    }
}

/// Returns the result of the first task (among `tasks`) to complete. The remaining tasks
/// continue running to completion; their results are silently discarded.
///
/// # Panics
///
/// Never resolves if `tasks` is empty -- callers must guarantee at least one task, mirroring
/// the upstream's lack of an empty-input guard here.
#[must_use]
pub fn collect_any<T: Send + 'static>(tasks: Vec<Lazy<T>>) -> CollectAny<T> {
    CollectAny {
        state: CollectAnyState::NotStarted(tasks),
    }
}

// === CollectAllWindowed ===

/// As [`collect_all`], but never runs more than `max_concurrency` tasks at once: `tasks`
/// is processed in chunks of that size, in input order. When `max_concurrency` is `0` or
/// at least as large as `tasks.len()`, this just delegates to [`collect_all`].
pub async fn collect_all_windowed<T: Send + 'static>(
    max_concurrency: usize,
    yield_between: bool,
    tasks: Vec<Lazy<T>>,
) -> Vec<Try<T>> {
    collect_all_windowed_impl(max_concurrency, yield_between, tasks, false).await
}

/// As [`collect_all_windowed`], but each chunk is dispatched the way [`collect_all_para`]
/// dispatches its tasks.
pub async fn collect_all_windowed_para<T: Send + 'static>(
    max_concurrency: usize,
    yield_between: bool,
    tasks: Vec<Lazy<T>>,
) -> Vec<Try<T>> {
    collect_all_windowed_impl(max_concurrency, yield_between, tasks, true).await
}

async fn collect_all_windowed_impl<T: Send + 'static>(
    max_concurrency: usize,
    yield_between: bool,
    tasks: Vec<Lazy<T>>,
    parallel: bool,
) -> Vec<Try<T>> {
    let n = tasks.len();
    if max_concurrency == 0 || n <= max_concurrency {
        return CollectAll::new(tasks, parallel).await;
    }

    let mut results = Vec::with_capacity(n);
    let mut remaining: Vec<Lazy<T>> = tasks;
    remaining.reverse();
    while !remaining.is_empty() {
        let chunk_size = max_concurrency.min(remaining.len());
        let chunk: Vec<Lazy<T>> = (0..chunk_size)
            .map(|_| remaining.pop().expect("chunk_size <= remaining.len()"))
            .collect();
        let is_last_chunk = remaining.is_empty();
        let chunk_results = CollectAll::new(chunk, parallel).await;
        results.extend(chunk_results);
        if yield_between && !is_last_chunk {
            Yield::default().await;
        }
    }
    results
}

// === CollectAll over plain Futures ===

/// Collects an already-existing range of [`FlowFuture`] handles (as opposed to the cold
/// [`Lazy`] tasks the rest of this module fans out) into one future of their results, in
/// input order. Unlike [`collect_all`], nothing here is started -- each input is already
/// hot, so this only has to chain a continuation onto each one.
pub fn collect_all_futures<T, I>(futures: I) -> FlowFuture<Vec<Try<T>>>
where
    T: Send + 'static,
    I: IntoIterator<Item = FlowFuture<T>>,
{
    let futures: Vec<_> = futures.into_iter().collect();
    let n = futures.len();
    let promise = Promise::<Vec<Try<T>>>::new();
    let downstream = promise.future();

    if n == 0 {
        promise.set_value(Vec::new());
        return downstream;
    }

    let remaining = Arc::new(AtomicUsize::new(n));
    let results = Arc::new(Mutex::new((0..n).map(|_| Try::Empty).collect::<Vec<_>>()));

    for (i, fut) in futures.into_iter().enumerate() {
        let remaining = remaining.clone();
        let results = results.clone();
        let promise = promise.clone();
        // The downstream of `then_try` is discarded: this chain exists purely for the
        // side effect of writing into `results` and counting down `remaining`.
        let _ = fut.then_try(move |t| {
            results.lock()[i] = t;
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                promise.set_value(std::mem::take(&mut *results.lock()));
            }
        });
    }

    downstream
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SimpleExecutor;
    use crate::lazy::{lazy, sync_await};
    use std::time::Duration;

    #[test]
    fn collect_all_preserves_input_order() {
        let tasks: Vec<_> = (0..10).map(|i| lazy(async move { i * i })).collect();
        let task = lazy(async move {
            let results = collect_all(tasks).await;
            results.into_iter().map(Try::value).collect::<Vec<_>>()
        });
        let results = sync_await(task);
        assert_eq!(results, (0..10).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn collect_all_futures_preserves_input_order_over_hot_futures() {
        use crate::future::make_ready_future;

        let promise = Promise::<i32>::new();
        let futures = vec![make_ready_future(0), promise.future(), make_ready_future(2)];
        let combined = collect_all_futures(futures);
        promise.set_value(1);
        let results: Vec<_> = combined.get().into_iter().map(Try::value).collect();
        assert_eq!(results, vec![0, 1, 2]);
    }

    #[test]
    fn collect_all_futures_empty_resolves_immediately() {
        let combined = collect_all_futures::<i32, _>(Vec::new());
        assert!(combined.get().is_empty());
    }

    #[test]
    fn collect_all_para_preserves_input_order() {
        let ex = SimpleExecutor::new(4);
        let tasks: Vec<_> = (0..10).map(|i| lazy(async move { i * i })).collect();
        let task = lazy(async move {
            let results = collect_all_para(tasks).await;
            results.into_iter().map(Try::value).collect::<Vec<_>>()
        })
        .via(ex);
        let results = sync_await(task);
        assert_eq!(results, (0..10).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn collect_any_returns_a_valid_index() {
        let ex = SimpleExecutor::new(4);
        let tasks: Vec<_> = (0..21)
            .map(|i| {
                lazy(async move {
                    std::thread::sleep(Duration::from_micros(fastrand::u64(0..500)));
                    i + 1
                })
            })
            .collect();
        let task = lazy(async move { collect_any(tasks).await }).via(ex);
        let result = sync_await(task);
        assert!(result.index < 21);
        assert!(result.value.value() > 0);
    }

    #[test]
    fn collect_all_empty_resolves_immediately() {
        let task = lazy(async move { collect_all::<i32>(Vec::new()).await });
        assert!(sync_await(task).is_empty());
    }

    #[test]
    fn collect_all_windowed_delegates_when_under_limit() {
        let tasks: Vec<_> = (0..3).map(|i| lazy(async move { i })).collect();
        let task = lazy(async move { collect_all_windowed(10, true, tasks).await });
        let results: Vec<_> = sync_await(task).into_iter().map(Try::value).collect();
        assert_eq!(results, vec![0, 1, 2]);
    }

    #[test]
    fn collect_all_windowed_interleaves_two_series_on_one_worker() {
        let ex = SimpleExecutor::new(1);
        let log = Arc::new(Mutex::new(Vec::new()));

        let log_a = log.clone();
        let a = lazy(async move {
            let tasks: Vec<_> = [1, 2, 3, 4]
                .into_iter()
                .map(|v| {
                    let log_a = log_a.clone();
                    lazy(async move {
                        log_a.lock().push(v);
                        v
                    })
                })
                .collect();
            collect_all_windowed(1, true, tasks).await;
        })
        .via(ex.clone());

        let log_b = log.clone();
        let b = lazy(async move {
            let tasks: Vec<_> = [5, 6, 7, 8]
                .into_iter()
                .map(|v| {
                    let log_b = log_b.clone();
                    lazy(async move {
                        log_b.lock().push(v);
                        v
                    })
                })
                .collect();
            collect_all_windowed(1, true, tasks).await;
        })
        .via(ex);

        let (tx, rx) = std::sync::mpsc::channel();
        let tx2 = tx.clone();
        a.start(move |_| tx.send(()).unwrap());
        b.start(move |_| tx2.send(()).unwrap());
        rx.recv().unwrap();
        rx.recv().unwrap();

        assert_eq!(*log.lock(), vec![1, 5, 2, 6, 3, 7, 4, 8]);
    }
}
