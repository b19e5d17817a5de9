// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The pluggable scheduling surface every other module dispatches work through.

use crate::io::IOExecutor;
use crate::pool::{Job, ThreadPool};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context as PollContext, Poll};
use std::time::Duration;

/// Opaque token naming the execution context (worker) a result was produced on, so a
/// later dispatch can ask to come back to the same one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Context(Option<usize>);

impl Context {
    pub const NULL: Context = Context(None);

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }
}

/// Options governing a `checkin` dispatch.
#[derive(Copy, Clone, Debug)]
pub struct ScheduleOptions {
    /// When the caller is already on the requested context, run inline instead of
    /// round-tripping through the scheduler.
    pub prompt: bool,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self { prompt: true }
    }
}

/// Abstract scheduling surface.
///
/// Implementations must be cheap to clone around as `Arc<dyn Executor>`: lazy tasks,
/// futures, and the collect combinators all hold onto one for the lifetime of a
/// pending operation.
pub trait Executor: Send + Sync + fmt::Debug + 'static {
    /// Dispatches `job` for execution. Returns `false` if the executor can't accept it
    /// (e.g. it has been shut down).
    fn schedule(&self, job: Job) -> bool;

    /// Whether the calling thread is currently a worker of this executor.
    fn current_thread_in_executor(&self) -> bool;

    /// The worker index of the calling thread, or `None` if it isn't one.
    fn current_context_id(&self) -> Option<usize>;

    /// Captures a token naming the calling thread's context.
    fn checkout(&self) -> Context;

    /// Dispatches `job`, preferring to run it on `context`. If `options.prompt` is set
    /// and the caller is already on `context`, runs inline immediately.
    fn checkin(&self, job: Job, context: Context, options: ScheduleOptions) -> bool;

    /// The associated I/O submission surface, if this executor has one.
    fn io_executor(&self) -> Option<&dyn IOExecutor> {
        None
    }

    /// Timed dispatch. The default implementation spawns a detached thread that sleeps
    /// for `delay` and then calls [`Executor::schedule`] -- timers are not native to the
    /// thread pool, so the default just buys time on an ad-hoc thread before handing
    /// the job back to the scheduler proper.
    fn schedule_after(self: Arc<Self>, job: Job, delay: Duration)
    where
        Self: Sized,
    {
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            self.schedule(job);
        });
    }

    /// Blocks the calling thread until `job` has been dispatched (not necessarily
    /// completed), via a binary-semaphore handshake.
    fn sync_schedule(&self, job: Job) -> bool {
        let pair = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = pair.clone();
        let dispatched = self.schedule(Box::new(move || {
            job();
            let (lock, cvar) = &*signal;
            *lock.lock() = true;
            cvar.notify_one();
        }));
        if !dispatched {
            return false;
        }
        let (lock, cvar) = &*pair;
        let mut done = lock.lock();
        while !*done {
            cvar.wait(&mut done);
        }
        true
    }
}

/// Timed dispatch for a boxed trait object: `schedule_after` needs `Self: Sized` to take
/// an owned `Arc<Self>` receiver, so `Arc<dyn Executor>` gets its own free function that
/// falls back to a plain detached-thread sleep + `schedule`.
pub fn schedule_after(executor: &Arc<dyn Executor>, job: Job, delay: Duration) {
    let executor = executor.clone();
    std::thread::spawn(move || {
        std::thread::sleep(delay);
        executor.schedule(job);
    });
}

thread_local! {
    static CURRENT_EXECUTOR: RefCell<Vec<Arc<dyn Executor>>> = const { RefCell::new(Vec::new()) };
}

/// Pushes `executor` as the ambient "current executor" for the duration of `f`.
///
/// This is the stand-in for `await_transform` hooks C++ coroutines get for free: every
/// place that drives a lazy task's inner future pushes its bound executor (if any) here
/// first, so that `co_await CurrentExecutor` and `Yield` can find it without threading an
/// extra parameter through every combinator.
pub(crate) fn with_current<R>(executor: Option<&Arc<dyn Executor>>, f: impl FnOnce() -> R) -> R {
    if let Some(executor) = executor {
        CURRENT_EXECUTOR.with(|stack| stack.borrow_mut().push(executor.clone()));
        let result = f();
        CURRENT_EXECUTOR.with(|stack| {
            stack.borrow_mut().pop();
        });
        result
    } else {
        f()
    }
}

pub(crate) fn current_executor() -> Option<Arc<dyn Executor>> {
    CURRENT_EXECUTOR.with(|stack| stack.borrow().last().cloned())
}

/// `co_await CurrentExecutor` -- yields the executor of the enclosing lazy task without
/// ever actually suspending.
#[derive(Copy, Clone, Debug, Default)]
pub struct CurrentExecutor;

impl Future for CurrentExecutor {
    type Output = Option<Arc<dyn Executor>>;

    fn poll(self: Pin<&mut Self>, _cx: &mut PollContext<'_>) -> Poll<Self::Output> {
        Poll::Ready(current_executor())
    }
}

/// `co_await Schedule{}` -- suspends and reschedules the caller through the current
/// executor, unless the caller is already running on it.
#[derive(Default)]
pub struct Schedule {
    state: ScheduleState,
}

#[derive(Default)]
enum ScheduleState {
    #[default]
    Start,
    Done,
}

impl Future for Schedule {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<Self::Output> {
        match self.state {
            ScheduleState::Done => Poll::Ready(()),
            ScheduleState::Start => {
                self.state = ScheduleState::Done;
                match current_executor() {
                    Some(executor) if !executor.current_thread_in_executor() => {
                        let waker = cx.waker().clone();
                        if executor.schedule(Box::new(move || waker.wake())) {
                            Poll::Pending
                        } else {
                            Poll::Ready(())
                        }
                    }
                    _ => Poll::Ready(()),
                }
            }
        }
    }
}

/// `co_await ScheduleAfter(duration)` -- a timed reschedule through the current executor.
pub struct ScheduleAfterFuture {
    delay: Duration,
    state: ScheduleState,
}

#[must_use]
pub fn schedule_after_awaitable(delay: Duration) -> ScheduleAfterFuture {
    ScheduleAfterFuture {
        delay,
        state: ScheduleState::Start,
    }
}

impl Future for ScheduleAfterFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<Self::Output> {
        match self.state {
            ScheduleState::Done => Poll::Ready(()),
            ScheduleState::Start => {
                self.state = ScheduleState::Done;
                match current_executor() {
                    Some(executor) => {
                        let waker = cx.waker().clone();
                        schedule_after(&executor, Box::new(move || waker.wake()), self.delay);
                        Poll::Pending
                    }
                    None => {
                        std::thread::sleep(self.delay);
                        Poll::Ready(())
                    }
                }
            }
        }
    }
}

/// The default, thread-pool-backed `Executor`.
///
/// Maps the worker id onto `Context` directly: unlike a raw pointer-sized context token
/// there is no "no context" sentinel value to collide with, `Option<usize>` already
/// distinguishes "no context" from "context 0".
pub struct SimpleExecutor {
    pool: Arc<ThreadPool>,
    closed: AtomicBool,
}

impl SimpleExecutor {
    #[must_use]
    pub fn new(num_threads: usize) -> Arc<Self> {
        Self::with_work_stealing(num_threads, false)
    }

    #[must_use]
    pub fn with_work_stealing(num_threads: usize, enable_work_steal: bool) -> Arc<Self> {
        Arc::new(Self {
            pool: ThreadPool::new(num_threads, enable_work_steal),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn thread_num(&self) -> usize {
        self.pool.thread_num()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl fmt::Debug for SimpleExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleExecutor")
            .field("thread_num", &self.pool.thread_num())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Executor for SimpleExecutor {
    fn schedule(&self, job: Job) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.pool.schedule_by_id(None, job);
        true
    }

    fn current_thread_in_executor(&self) -> bool {
        self.pool.current_id().is_some()
    }

    fn current_context_id(&self) -> Option<usize> {
        self.pool.current_id()
    }

    fn checkout(&self) -> Context {
        Context(self.pool.current_id())
    }

    fn checkin(&self, job: Job, context: Context, options: ScheduleOptions) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match context.0 {
            Some(id) => {
                if options.prompt && self.pool.current_id() == Some(id) {
                    job();
                } else {
                    self.pool.schedule_by_id(Some(id), job);
                }
                true
            }
            None => self.schedule(job),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt::try_init();
    }

    #[test]
    fn schedule_runs_on_a_worker() {
        init_tracing();
        let ex = SimpleExecutor::new(2);
        let (tx, rx) = std::sync::mpsc::channel();
        assert!(ex.schedule(Box::new(move || tx.send(()).unwrap())));
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn checkin_prefers_requested_context() {
        init_tracing();
        let ex = SimpleExecutor::new(4);
        let (tx, rx) = std::sync::mpsc::channel();
        let tx2 = tx.clone();
        ex.schedule(Box::new(move || {
            tx2.send(std::thread::current().id()).unwrap();
        }));
        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let _ = first;

        let ctx = ex.checkout();
        assert!(ex.checkin(
            Box::new(move || tx.send(std::thread::current().id()).unwrap()),
            ctx,
            ScheduleOptions::default()
        ));
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn closed_executor_rejects_schedule() {
        init_tracing();
        let ex = SimpleExecutor::new(1);
        ex.close();
        assert!(!ex.schedule(Box::new(|| {})));
    }

    #[test]
    fn sync_schedule_blocks_until_done() {
        init_tracing();
        let ex = SimpleExecutor::new(1);
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = flag.clone();
        assert!(ex.sync_schedule(Box::new(move || flag2.store(true, Ordering::SeqCst))));
        assert!(flag.load(Ordering::SeqCst));
    }
}
