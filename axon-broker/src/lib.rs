//! The Axon kernel-object broker.
//!
//! One arbitration process holds the canonical state of every kernel
//! object — processes, events, mutexes, semaphores, pipes — and every
//! per-process handle table. Clients reach it over a unix socket with
//! the `axon-wire` protocol; all object mutation happens on a single
//! state thread, so each request is atomic with respect to every other.

mod broker;
mod config;
mod objects;
mod process;

pub use broker::{start, BrokerHandle};
pub use config::Config;
