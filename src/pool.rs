// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A fixed-size worker pool with per-worker FIFO queues and optional work stealing.
//!
//! This is the "external collaborator" the executor schedules onto: it knows nothing
//! about futures, lazy tasks, or continuations, only about running boxed closures.

use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct WorkItem {
    can_steal: bool,
    job: Job,
}

struct Queue {
    items: Mutex<VecDeque<WorkItem>>,
    not_empty: Condvar,
    stopped: AtomicBool,
}

impl Queue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            stopped: AtomicBool::new(false),
        }
    }

    fn push(&self, item: WorkItem) {
        let mut items = self.items.lock();
        items.push_back(item);
        self.not_empty.notify_one();
    }

    /// Pushes only if the queue is currently empty, handing `item` back otherwise.
    ///
    /// Used for round-robin fan-out of stealable work: we'd rather spread load
    /// across idle workers than pile everything onto the first one.
    fn try_push(&self, item: WorkItem) -> Result<(), WorkItem> {
        let mut items = self.items.lock();
        if items.is_empty() {
            items.push_back(item);
            self.not_empty.notify_one();
            Ok(())
        } else {
            Err(item)
        }
    }

    /// Blocks until an item is available or the queue is stopped.
    fn pop(&self) -> Option<Job> {
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item.job);
            }
            if self.stopped.load(Ordering::Acquire) {
                return None;
            }
            self.not_empty.wait(&mut items);
        }
    }

    fn try_pop_if(&self, pred: impl Fn(&WorkItem) -> bool) -> Option<Job> {
        let mut items = self.items.lock();
        let idx = items.iter().position(&pred)?;
        items.remove(idx).map(|item| item.job)
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.not_empty.notify_all();
    }
}

thread_local! {
    static CURRENT: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

/// A worker pool of `n` OS threads, each draining its own FIFO queue.
///
/// When `enable_work_steal` is set, jobs submitted without a specific target worker are
/// first offered round-robin to any idle worker (as stealable), and workers that run dry
/// on their own queue try to steal stealable work from their peers before blocking.
pub struct ThreadPool {
    id: usize,
    queues: Vec<Arc<Queue>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    enable_work_steal: bool,
}

static NEXT_POOL_ID: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(1);

impl ThreadPool {
    #[must_use]
    pub fn new(thread_num: usize, enable_work_steal: bool) -> Arc<Self> {
        let thread_num = if thread_num == 0 {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        } else {
            thread_num
        };
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let queues: Vec<_> = (0..thread_num).map(|_| Arc::new(Queue::new())).collect();

        let pool = Arc::new(Self {
            id,
            queues,
            threads: Mutex::new(Vec::with_capacity(thread_num)),
            enable_work_steal,
        });

        let mut threads = Vec::with_capacity(thread_num);
        for worker_id in 0..thread_num {
            let pool = pool.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("flowrt-worker-{worker_id}"))
                    .spawn(move || pool.worker_main(worker_id))
                    .expect("failed to spawn worker thread"),
            );
        }
        *pool.threads.lock() = threads;
        pool
    }

    /// Schedules `fn` on the worker identified by `id`, or pseudo-randomly (trying
    /// stealable round-robin placement first if stealing is enabled) when `id` is `None`.
    pub fn schedule_by_id(&self, id: Option<usize>, job: Job) {
        match id {
            Some(id) => {
                assert!(id < self.queues.len(), "worker id out of range");
                self.queues[id].push(WorkItem {
                    can_steal: false,
                    job,
                });
            }
            None => {
                let mut item = WorkItem {
                    can_steal: true,
                    job,
                };
                if self.enable_work_steal {
                    let n = self.queues.len();
                    for k in 0..n * 2 {
                        match self.queues[k % n].try_push(item) {
                            Ok(()) => return,
                            Err(back) => item = back,
                        }
                    }
                }
                let id = fastrand::usize(..self.queues.len());
                item.can_steal = self.enable_work_steal;
                self.queues[id].push(item);
            }
        }
    }

    #[must_use]
    pub fn current_id(&self) -> Option<usize> {
        CURRENT.with(|c| c.get()).and_then(|(pool_id, worker_id)| {
            if pool_id == self.id {
                Some(worker_id)
            } else {
                None
            }
        })
    }

    #[must_use]
    pub fn item_count(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    #[must_use]
    pub fn thread_num(&self) -> usize {
        self.queues.len()
    }

    fn worker_main(&self, id: usize) {
        CURRENT.with(|c| c.set(Some((self.id, id))));
        let n = self.queues.len();
        tracing::trace!(worker = id, "worker starting");
        loop {
            let mut job = None;
            if self.enable_work_steal {
                for k in 0..n * 2 {
                    let victim = (id + k) % n;
                    if let Some(j) = self.queues[victim].try_pop_if(|item| item.can_steal) {
                        job = Some(j);
                        break;
                    }
                }
            }
            let job = match job {
                Some(job) => job,
                None => match self.queues[id].pop() {
                    Some(job) => job,
                    None => break,
                },
            };
            job();
        }
        tracing::trace!(worker = id, "worker stopping");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for queue in &self.queues {
            queue.stop();
        }
        for thread in self.threads.lock().drain(..) {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("thread_num", &self.queues.len())
            .field("enable_work_steal", &self.enable_work_steal)
            .finish()
    }
}
