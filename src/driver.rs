// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Drives a detached future to completion, re-entering the bound executor on every wake.
//!
//! This is the "start a coroutine and run it in the background" primitive everything
//! that doesn't have an enclosing `.await` chain is built on: `Lazy::start`,
//! `RescheduleLazy`, `sync_await`, and each collect combinator's per-task dispatch.
//!
//! It doubles as the `ViaCoroutine` re-entry wrapper: a bound executor's context token is
//! captured every time the inner future returns `Pending`, and the next wake checks back
//! in through that same context instead of just re-scheduling blindly. Native
//! `async`/`await` already gives nested `.await`s symmetric transfer for free (no
//! scheduler round-trip), so this machinery only has to run once per detached future, not
//! once per nested await point the way the coroutine-based original needed it to.

use crate::error::Failure;
use crate::executor::{self, Context, Executor, ScheduleOptions};
use crate::pool::Job;
use crate::try_::Try;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context as PollContext, Poll, Wake, Waker};

struct Inner<T> {
    fut: Option<Pin<Box<dyn Future<Output = Try<T>> + Send>>>,
    on_complete: Option<Box<dyn FnOnce(Try<T>) + Send>>,
    context: Context,
}

pub(crate) struct Driver<T> {
    inner: Mutex<Inner<T>>,
    executor: Option<Arc<dyn Executor>>,
    polling: AtomicBool,
}

impl<T: Send + 'static> Driver<T> {
    fn poll_once(self: Arc<Self>) {
        // Only one poll may run at a time; a wake that arrives while we're already
        // polling (e.g. the inner future waking itself synchronously) just requests
        // another round after this one finishes instead of reentering the lock.
        if self.polling.swap(true, Ordering::AcqRel) {
            return;
        }

        let waker = Waker::from(self.clone());
        let mut cx = PollContext::from_waker(&waker);

        let mut guard = self.inner.lock();
        let Some(fut) = guard.fut.as_mut() else {
            drop(guard);
            self.polling.store(false, Ordering::Release);
            return;
        };

        // `Lazy` bodies are plain `async` blocks, so we can't wrap a panic raised across
        // one of their `.await` points with `catch_unwind` at the call site the way
        // `make_try_call` does for a synchronous closure. Catching it here instead, once
        // per poll, covers every path a lazy task gets driven through (`start`,
        // `RescheduleLazy`, `sync_await`, the collect combinators) without each of them
        // needing its own panic handling.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            executor::with_current(self.executor.as_ref(), || fut.as_mut().poll(&mut cx))
        }));

        match result {
            Ok(Poll::Pending) => {
                if let Some(executor) = &self.executor {
                    guard.context = executor.checkout();
                }
                drop(guard);
                self.polling.store(false, Ordering::Release);
            }
            Ok(Poll::Ready(value)) => {
                guard.fut = None;
                let on_complete = guard.on_complete.take();
                drop(guard);
                self.polling.store(false, Ordering::Release);
                if let Some(on_complete) = on_complete {
                    on_complete(value);
                }
            }
            Err(payload) => {
                guard.fut = None;
                let on_complete = guard.on_complete.take();
                drop(guard);
                self.polling.store(false, Ordering::Release);
                if let Some(on_complete) = on_complete {
                    on_complete(Try::Failure(Failure::msg(panic_message(&payload))));
                }
            }
        }
    }

    fn redispatch(self: Arc<Self>) {
        match self.executor.clone() {
            Some(executor) => {
                let context = self.inner.lock().context;
                let me = self.clone();
                let job: Job = Box::new(move || me.poll_once());
                let dispatched = if context.is_null() {
                    executor.schedule(job)
                } else {
                    executor.checkin(job, context, ScheduleOptions::default())
                };
                if !dispatched {
                    tracing::trace!("executor rejected dispatch, driving inline");
                    self.poll_once();
                }
            }
            None => self.poll_once(),
        }
    }
}

impl<T: Send + 'static> Wake for Driver<T> {
    fn wake(self: Arc<Self>) {
        self.redispatch();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.clone().redispatch();
    }
}

/// Spawns `fut` detached, invoking `on_complete` exactly once when it resolves.
///
/// If `executor` is `Some`, the very first poll is dispatched through
/// `Executor::schedule` rather than run inline -- matching a `RescheduleLazy`'s contract
/// that its first resumption never runs on the starting thread when the executor has
/// workers of its own.
pub(crate) fn spawn<T, Fut>(
    executor: Option<Arc<dyn Executor>>,
    fut: Fut,
    on_complete: impl FnOnce(Try<T>) + Send + 'static,
) where
    T: Send + 'static,
    Fut: Future<Output = Try<T>> + Send + 'static,
{
    let driver = Arc::new(Driver {
        inner: Mutex::new(Inner {
            fut: Some(Box::pin(fut)),
            on_complete: Some(Box::new(on_complete)),
            context: Context::NULL,
        }),
        executor: executor.clone(),
        polling: AtomicBool::new(false),
    });

    match executor {
        Some(executor) => {
            let d = driver.clone();
            if !executor.schedule(Box::new(move || d.poll_once())) {
                tracing::trace!("executor rejected initial dispatch, driving inline");
                driver.poll_once();
            }
        }
        None => driver.poll_once(),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}
