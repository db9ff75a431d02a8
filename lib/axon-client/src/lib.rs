//! Client library for the Axon kernel-object broker.
//!
//! One [`Connection`] per process, holding the request channel to the
//! broker and the notification channel drained by a dedicated reader
//! thread. Threads that issue waits or asynchronous I/O register a
//! [`ThreadIoContext`] and pass it explicitly into every call; the
//! context owns that thread's pending-operation slots and its APC queue,
//! so nothing is ever reached through implicit current-thread lookup and
//! no cross-thread code path mutates another thread's state directly.

mod connection;
mod objects;
mod thread_io;

pub use connection::{ChildSpec, Connection};
pub use objects::ObjectInfo;
pub use thread_io::{
    ApcArgs, ApcRoutine, AsyncIo, CompletionRoutine, IoResult, IoStatusBlock, ThreadIoContext,
};

pub use axon_wire::{
    Handle, ObjType, Result, Status, ACCESS_ALL, ACCESS_DUP, ACCESS_MODIFY, ACCESS_QUERY,
    ACCESS_READ, ACCESS_SYNCHRONIZE, ACCESS_WRITE, DUP_CLOSE_SOURCE, DUP_SAME_ACCESS,
    DUP_SAME_VALUE, HANDLE_FLAG_INHERIT, HANDLE_FLAG_PROTECT_FROM_CLOSE, TIMEOUT_INFINITE,
};
