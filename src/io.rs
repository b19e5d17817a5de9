// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The I/O submission contract an [`Executor`](crate::executor::Executor) may expose.
//!
//! This module specifies the surface only: no implementation (Linux AIO or otherwise)
//! ships here, the way an executor backend wires a real completion mechanism into
//! [`IOExecutor`] is an external collaborator's problem.

/// A single file-descriptor-oriented I/O operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IOOp {
    PRead,
    PWrite,
    FSync,
    FDSync,
    Noop,
    PReadV,
    PWriteV,
}

/// The result delivered to a submission's callback once the OS reports completion.
#[derive(Copy, Clone, Debug)]
pub struct IOResult {
    pub data: u64,
    pub obj: u64,
    pub res: i64,
    pub res2: i64,
}

/// A single scatter/gather buffer, as would be passed to `preadv`/`pwritev`.
#[derive(Copy, Clone, Debug)]
pub struct IOVec {
    pub base: *mut u8,
    pub len: usize,
}

/// Submission surface an executor's I/O backend must provide.
///
/// # Safety
///
/// Implementations receive raw buffer pointers from the caller and must not retain them
/// past the point the completion callback fires.
pub trait IOExecutor: Send + Sync {
    /// Submits a single-buffer operation. The callback runs with the `IOResult` the OS
    /// reports for this submission.
    fn submit_io(
        &self,
        fd: i32,
        op: IOOp,
        buffer: *mut u8,
        len: usize,
        offset: i64,
        callback: Box<dyn FnOnce(IOResult) + Send>,
    );

    /// Submits a scatter/gather operation over `iov`.
    fn submit_iov(
        &self,
        fd: i32,
        op: IOOp,
        iov: &[IOVec],
        offset: i64,
        callback: Box<dyn FnOnce(IOResult) + Send>,
    );
}
