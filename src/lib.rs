// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A small coroutine-flavoured async runtime.
//!
//! Three layers, bottom to top:
//!
//! - [`try_`] and [`error`]: the `Try<T>` value carrier and the `Failure` error type
//!   every other module reports through.
//! - [`pool`] and [`executor`]: a fixed-size worker pool and the pluggable [`Executor`]
//!   trait dispatch happens through.
//! - [`future`], [`lazy`], [`collect`]: the thread-safe `Future`/`Promise` rendezvous,
//!   the cold-coroutine `Lazy`/`RescheduleLazy` pair, and the `collect_*` fan-out
//!   combinators built on top of both.
//!
//! [`driver`] is the detail that wires the lazy-task layer into the executor layer: it
//! drives a detached future to completion and re-enters the bound executor on every
//! wake, playing the part `ViaCoroutine` plays in the coroutine-native original.

mod collect;
mod driver;
pub mod error;
pub mod executor;
pub mod future;
pub mod io;
pub mod lazy;
mod pool;
pub mod try_;

pub use collect::{
    collect_all, collect_all_futures, collect_all_para, collect_all_windowed,
    collect_all_windowed_para, collect_any, CollectAll, CollectAny, CollectAnyResult,
};
pub use error::Failure;
pub use executor::{
    schedule_after, schedule_after_awaitable, CurrentExecutor, Executor, Schedule,
    ScheduleOptions, SimpleExecutor,
};
pub use future::{make_failed_future, make_ready_future, Future, Promise};
pub use io::{IOExecutor, IOOp, IOResult, IOVec};
pub use lazy::{lazy, sleep, sync_await, try_lazy, Lazy, RescheduleLazy, Startable, Yield};
pub use pool::{Job, ThreadPool};
pub use try_::{Try, Unit};
