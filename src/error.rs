// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use thiserror::Error;

/// Failure captured inside a [`Try`](crate::try_::Try) slot.
///
/// This is the "opaque captured error" the design calls for: callers mostly move it
/// around and re-raise it, they rarely need to match on the variant.
#[derive(Debug, Error)]
pub enum Failure {
    /// A user-supplied error raised from inside a task body.
    #[error("{0}")]
    User(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// A contract violation: calling a method in a state the API forbids.
    #[error("logic error: {0}")]
    Logic(&'static str),
    /// All `Promise` handles for a shared state dropped before a result was set.
    #[error("broken promise: result never set")]
    BrokenPromise,
}

impl Failure {
    pub fn user<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Failure::User(Box::new(err))
    }

    pub fn msg(msg: impl Into<String>) -> Self {
        Failure::User(Box::new(Message(msg.into())))
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

/// Error returned when dispatching work onto an [`Executor`](crate::executor::Executor) fails.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The executor has been shut down and no longer accepts new work.
    #[error("executor was closed")]
    Closed,
}

impl From<Closed> for SpawnError {
    fn from(_: Closed) -> Self {
        Self::Closed
    }
}

/// Zero-sized token returned by internals that only ever fail in one way.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
#[error("closed")]
pub struct Closed(pub(crate) ());
