// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The thread-safe rendezvous between a result-producing [`Promise`] and a
//! continuation-installing [`Future`].
//!
//! The hard part here isn't the public API, it's [`FutureState`]: a producer can call
//! [`FutureState::set_result`] before, after, or concurrently with a consumer calling
//! [`FutureState::set_continuation`], and exactly one of the two call sites must end up
//! running the continuation. The original C++ does this with a lock-free four-state CAS
//! machine (`Start -> OnlyResult|OnlyContinuation -> Done`); we get the same race-free
//! guarantee from a single `Mutex<Slot<T>>` instead. A mutex around a short-lived
//! continuation is exactly the trade the design notes call out as acceptable ("mandatory
//! locking can replace the CAS scheme ... provided both paths end by running the
//! continuation exactly once"), and it spares us hand-verified acquire/release reasoning
//! we have no toolchain here to check.

use crate::error::Failure;
use crate::executor::{Context, Executor, ScheduleOptions};
use crate::pool::Job;
use crate::try_::{call_catching, Try};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

type Continuation<T> = Box<dyn FnOnce(Try<T>) + Send>;

enum Slot<T> {
    Start,
    OnlyResult(Try<T>),
    OnlyContinuation(Continuation<T>),
    Done,
}

/// Heap-allocated, reference-counted rendezvous shared by a `Promise` and its `Future`s.
///
/// `attached`/`continuation` reference counting from the original design collapses onto
/// `Arc`'s own strong count here (every `Promise` clone and every pending dispatch closure
/// just holds an `Arc<FutureState<T>>`); only `promise_refs` needs to stay an explicit
/// counter, since it has to reach zero strictly before the state's overall `Arc` count
/// does in order to detect a broken promise.
/// `pub` only so [`Future::Shared`] can name it; every member stays crate-private, so
/// there is nothing an external crate can do with one besides move it around.
pub struct FutureState<T> {
    slot: Mutex<Slot<T>>,
    result_published: AtomicBool,
    promise_refs: AtomicUsize,
    executor: Mutex<Option<Arc<dyn Executor>>>,
    context: Mutex<Context>,
    force_scheduled: AtomicBool,
}

impl<T: Send + 'static> FutureState<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Slot::Start),
            result_published: AtomicBool::new(false),
            promise_refs: AtomicUsize::new(0),
            executor: Mutex::new(None),
            context: Mutex::new(Context::NULL),
            force_scheduled: AtomicBool::new(false),
        })
    }

    pub(crate) fn executor(&self) -> Option<Arc<dyn Executor>> {
        self.executor.lock().clone()
    }

    pub(crate) fn set_executor(&self, executor: Arc<dyn Executor>) {
        *self.executor.lock() = Some(executor);
    }

    /// Records the executor's own context token so a later continuation dispatch can ask
    /// to come back to the same worker. A no-op without a bound executor.
    pub(crate) fn checkout(&self) {
        if let Some(executor) = self.executor() {
            *self.context.lock() = executor.checkout();
        }
    }

    /// `SetForceScheduled` is documented as flagged `force` yet a no-op without an
    /// executor attached; we preserve that as written rather than "fixing" it.
    pub(crate) fn set_force_scheduled(&self) {
        if self.executor.lock().is_some() {
            self.force_scheduled.store(true, Ordering::Relaxed);
        }
    }

    pub(crate) fn set_result(&self, value: Try<T>) {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Done) {
            Slot::Start => {
                *slot = Slot::OnlyResult(value);
                drop(slot);
                self.result_published.store(true, Ordering::Release);
            }
            Slot::OnlyContinuation(cont) => {
                drop(slot);
                self.result_published.store(true, Ordering::Release);
                self.schedule_continuation(cont, value, false);
            }
            Slot::OnlyResult(_) | Slot::Done => {
                drop(slot);
                panic!("logic error: FutureState already has a result");
            }
        }
    }

    pub(crate) fn set_continuation(&self, cont: Continuation<T>) {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Done) {
            Slot::Start => {
                *slot = Slot::OnlyContinuation(cont);
            }
            Slot::OnlyResult(value) => {
                drop(slot);
                self.schedule_continuation(cont, value, true);
            }
            Slot::OnlyContinuation(_) | Slot::Done => {
                drop(slot);
                panic!("logic error: FutureState already has a continuation");
            }
        }
    }

    fn schedule_continuation(
        &self,
        cont: Continuation<T>,
        value: Try<T>,
        triggered_by_continuation: bool,
    ) {
        let executor = self.executor();
        let force = self.force_scheduled.load(Ordering::Relaxed);
        let inline = !force
            && (executor.is_none()
                || triggered_by_continuation
                || executor.as_ref().is_some_and(|e| e.current_thread_in_executor()));
        if inline {
            cont(value);
            return;
        }

        // The payload outlives the dispatch: if the executor rejects the job we still
        // need to run it inline, so stash it behind a lock rather than letting `schedule`
        // consume it unconditionally.
        let payload = Arc::new(Mutex::new(Some((cont, value))));
        let for_job = payload.clone();
        let job: Job = Box::new(move || {
            if let Some((cont, value)) = for_job.lock().take() {
                cont(value);
            }
        });

        let executor = executor.expect("inline branch above handles the executor-less case");
        let context = *self.context.lock();
        let dispatched = if context.is_null() {
            executor.schedule(job)
        } else {
            executor.checkin(job, context, ScheduleOptions { prompt: !force })
        };
        if !dispatched {
            if let Some((cont, value)) = payload.lock().take() {
                cont(value);
            }
        }
    }
}

// === impl Promise ===

/// Owns one promise reference on a shared [`FutureState`].
///
/// Copying a `Promise` shares the same state: every copy may attempt to set the result
/// once, and the state machine enforces single-set (a second `set_value`/`set_failure`
/// call is a logic error, matching the upstream `LOGIC_ASSERT`). Dropping the last copy
/// without ever setting a result synthesizes a "broken promise" failure.
pub struct Promise<T> {
    state: Arc<FutureState<T>>,
}
static_assertions::assert_impl_all!(Promise<()>: Send, Sync);

impl<T: Send + 'static> Promise<T> {
    #[must_use]
    pub fn new() -> Self {
        let state = FutureState::new();
        state.promise_refs.store(1, Ordering::Relaxed);
        Self { state }
    }

    /// Binds an executor that the eventual continuation should be dispatched through.
    #[must_use]
    pub fn via(self, executor: Arc<dyn Executor>) -> Self {
        self.state.set_executor(executor);
        self
    }

    /// Captures the calling context so the continuation prefers returning to it.
    pub fn checkout(&self) {
        self.state.checkout();
    }

    pub fn set_force_scheduled(&self) {
        self.state.set_force_scheduled();
    }

    #[must_use]
    pub fn future(&self) -> Future<T> {
        Future::Shared(self.state.clone())
    }

    pub fn set_value(&self, value: T) {
        self.state.set_result(Try::of_value(value));
    }

    pub fn set_failure(&self, failure: Failure) {
        self.state.set_result(Try::of_failure(failure));
    }

    pub fn set_try(&self, value: Try<T>) {
        self.state.set_result(value);
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        self.state.promise_refs.fetch_add(1, Ordering::Relaxed);
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Send + 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.state.promise_refs.fetch_sub(1, Ordering::AcqRel) == 1
            && !self.state.result_published.load(Ordering::Acquire)
        {
            self.state.set_result(Try::of_failure(Failure::BrokenPromise));
        }
    }
}

// === impl Future ===

/// A single-owner carrier holding an already-ready `Try<T>` plus an optional executor.
///
/// This is the zero-allocation fast path: a `Future` built from an immediate value never
/// touches a `FutureState` at all.
pub struct LocalState<T> {
    pub(crate) try_value: Try<T>,
    pub(crate) executor: Option<Arc<dyn Executor>>,
}

/// A move-only handle over a future result: either a shared, reference-counted
/// [`FutureState`] or an embedded, allocation-free [`LocalState`].
pub enum Future<T> {
    Shared(Arc<FutureState<T>>),
    Local(LocalState<T>),
}
static_assertions::assert_impl_all!(Future<()>: Send);

/// Builds an already-ready `Future` without allocating shared state.
#[must_use]
pub fn make_ready_future<T: Send + 'static>(value: T) -> Future<T> {
    Future::Local(LocalState {
        try_value: Try::of_value(value),
        executor: None,
    })
}

/// Builds an already-failed `Future` without allocating shared state.
#[must_use]
pub fn make_failed_future<T: Send + 'static>(failure: Failure) -> Future<T> {
    Future::Local(LocalState {
        try_value: Try::of_failure(failure),
        executor: None,
    })
}

impl<T: Send + 'static> Future<T> {
    /// Binds (or rebinds) the executor this future's continuations dispatch through.
    #[must_use]
    pub fn via(self, executor: Arc<dyn Executor>) -> Self {
        match self {
            Future::Local(mut local) => {
                local.executor = Some(executor);
                Future::Local(local)
            }
            Future::Shared(state) => {
                state.set_executor(executor);
                Future::Shared(state)
            }
        }
    }

    fn executor(&self) -> Option<Arc<dyn Executor>> {
        match self {
            Future::Local(local) => local.executor.clone(),
            Future::Shared(state) => state.executor(),
        }
    }

    /// Whether this future already has its result in hand (the `Local` fast path).
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Future::Local(_))
    }

    /// Chains `f` over the raw `Try<T>`, producing a `Future<U>` from `f`'s plain return
    /// value. Any panic inside `f` is captured into the downstream failure.
    pub fn then_try<U, F>(self, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(Try<T>) -> U + Send + 'static,
    {
        match self {
            Future::Local(local) => Future::Local(LocalState {
                try_value: call_catching(move || f(local.try_value)),
                executor: local.executor,
            }),
            Future::Shared(state) => {
                let promise = Promise::<U>::new();
                if let Some(executor) = state.executor() {
                    promise.state.set_executor(executor);
                }
                let downstream = promise.future();
                state.set_continuation(Box::new(move |t| {
                    promise.set_try(call_catching(move || f(t)));
                }));
                downstream
            }
        }
    }

    /// As [`Future::then_try`], but `f` returns a `Future<U>` that the downstream future
    /// chains through rather than a raw value.
    pub fn then_try_with<U, F>(self, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(Try<T>) -> Future<U> + Send + 'static,
    {
        match self {
            Future::Local(local) => {
                let mut inner = f(local.try_value);
                if local.executor.is_some() && inner.executor().is_none() {
                    inner = inner.via(local.executor.unwrap());
                }
                inner
            }
            Future::Shared(state) => {
                let promise = Promise::<U>::new();
                if let Some(executor) = state.executor() {
                    promise.state.set_executor(executor);
                }
                let downstream = promise.future();
                state.set_continuation(Box::new(move |t| {
                    pipe_into(f(t), promise);
                }));
                downstream
            }
        }
    }

    /// Chains `f` over the unwrapped value. If the upstream failed, `f` is never invoked
    /// and the failure propagates unchanged.
    pub fn then_value<U, F>(self, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        flatten_try_future(self.then_try(|t| match t {
            Try::Value(v) => call_catching(move || f(v)),
            Try::Failure(e) => Try::Failure(e),
            Try::Empty => Try::Failure(Failure::Logic("Try object is empty")),
        }))
    }

    /// As [`Future::then_value`], but `f` returns a `Future<U>`.
    pub fn then_value_with<U, F>(self, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Future<U> + Send + 'static,
    {
        self.then_try_with(move |t| match t {
            Try::Value(v) => f(v),
            Try::Failure(e) => Future::Local(LocalState {
                try_value: Try::Failure(e),
                executor: None,
            }),
            Try::Empty => Future::Local(LocalState {
                try_value: Try::Failure(Failure::Logic("Try object is empty")),
                executor: None,
            }),
        })
    }

    /// Blocks the calling OS thread until the result is available.
    ///
    /// # Panics
    ///
    /// Panics if called from a thread already inside this future's own executor (it would
    /// deadlock waiting for a continuation that can only run on that same thread).
    #[must_use]
    pub fn wait(self) -> Self {
        match self {
            Future::Local(local) => Future::Local(local),
            Future::Shared(state) => {
                if let Some(executor) = state.executor() {
                    assert!(
                        !executor.current_thread_in_executor(),
                        "logic error: wait() called from inside the future's own executor"
                    );
                }
                let pair = Arc::new((Mutex::new(None::<Try<T>>), Condvar::new()));
                let for_cont = pair.clone();
                state.set_continuation(Box::new(move |t| {
                    let (lock, cvar) = &*for_cont;
                    *lock.lock() = Some(t);
                    cvar.notify_one();
                }));
                let (lock, cvar) = &*pair;
                let mut guard = lock.lock();
                while guard.is_none() {
                    cvar.wait(&mut guard);
                }
                let try_value = guard.take().expect("just checked Some");
                drop(guard);
                Future::Local(LocalState {
                    try_value,
                    executor: state.executor(),
                })
            }
        }
    }

    /// `wait()` followed by unwrapping the value. Re-raises a captured failure.
    #[must_use]
    pub fn get(self) -> T {
        match self.wait() {
            Future::Local(local) => local.try_value.value(),
            Future::Shared(_) => unreachable!("wait() always returns Local"),
        }
    }

    /// Extracts the raw `Try<T>` from an already-ready future.
    ///
    /// # Panics
    ///
    /// Panics if the future hasn't been waited on yet (i.e. is still `Shared`).
    #[must_use]
    pub fn into_try(self) -> Try<T> {
        match self {
            Future::Local(local) => local.try_value,
            Future::Shared(_) => panic!("logic error: into_try() called before the result was ready"),
        }
    }
}

/// Forwards `inner`'s eventual result into `promise`, whatever mode `inner` is in.
fn pipe_into<U: Send + 'static>(inner: Future<U>, promise: Promise<U>) {
    match inner {
        Future::Local(local) => promise.set_try(local.try_value),
        Future::Shared(state) => {
            state.set_continuation(Box::new(move |t| promise.set_try(t)));
        }
    }
}

/// `then_value` chains through `then_try` with a closure that returns `Try<U>` (so a user
/// panic and an upstream failure both land in the same place); this peels that one extra
/// `Try` layer back off so callers see a plain `Future<U>`.
fn flatten_try_future<U: Send + 'static>(future: Future<Try<U>>) -> Future<U> {
    fn flatten<U>(t: Try<Try<U>>) -> Try<U> {
        match t {
            Try::Value(inner) => inner,
            Try::Failure(e) => Try::Failure(e),
            Try::Empty => Try::Empty,
        }
    }

    match future {
        Future::Local(local) => Future::Local(LocalState {
            try_value: flatten(local.try_value),
            executor: local.executor,
        }),
        Future::Shared(state) => {
            let promise = Promise::<U>::new();
            if let Some(executor) = state.executor() {
                promise.state.set_executor(executor);
            }
            let downstream = promise.future();
            state.set_continuation(Box::new(move |t| {
                promise.set_try(flatten(t));
            }));
            downstream
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SimpleExecutor;

    #[test]
    fn make_ready_future_roundtrips() {
        assert_eq!(make_ready_future(42).get(), 42);
    }

    #[test]
    fn then_value_chain_on_ready_future() {
        let g = make_ready_future(1000)
            .then_value(|v| v + 100)
            .then_value(|v| v + 10)
            .then_value(|v| v.to_string());
        assert_eq!(g.get(), "1110");
    }

    #[test]
    fn promise_future_chain_with_executor() {
        let ex = SimpleExecutor::new(2);
        let p = Promise::<i32>::new();
        let f = p.future().via(ex.clone());
        let g = f
            .then_value(|v| v + 100)
            .then_value(|v| v + 10)
            .then_value(|v| v.to_string());
        p.set_value(1000);
        assert_eq!(g.get(), "1110");
    }

    #[test]
    fn then_value_skips_callback_on_failure() {
        let p = Promise::<i32>::new();
        let f = p.future();
        let g = f.then_value(|_: i32| panic!("should not run"));
        p.set_failure(Failure::msg("boom"));
        assert!(g.into_try().has_failure());
    }

    #[test]
    fn broken_promise_surfaces_as_failure() {
        let p = Promise::<i32>::new();
        let f = p.future();
        drop(p);
        let result = f.wait().into_try();
        assert!(result.has_failure());
    }

    #[test]
    fn continuation_runs_exactly_once_result_first() {
        let p = Promise::<i32>::new();
        p.set_value(7);
        let f = p.future();
        assert_eq!(f.get(), 7);
    }

    #[test]
    fn continuation_runs_exactly_once_continuation_first() {
        let ex = SimpleExecutor::new(1);
        let p = Promise::<i32>::new().via(ex);
        let f = p.future();
        let (tx, rx) = std::sync::mpsc::channel();
        let g = f.then_value(move |v| {
            tx.send(v).unwrap();
            v
        });
        p.set_value(9);
        assert_eq!(g.get(), 9);
        assert_eq!(rx.recv().unwrap(), 9);
    }

    #[test]
    fn deep_synchronous_chain_does_not_blow_the_stack() {
        let mut f = make_ready_future(0);
        for _ in 0..2000 {
            f = f.then_value(|v| v + 1);
        }
        assert_eq!(f.get(), 2000);
    }
}
