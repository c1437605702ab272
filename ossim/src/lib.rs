//! Worker side of a simulated multiprogramming operating system.
//!
//! A worker attaches to the orchestrator's simulated clock (System V shared
//! memory, read-only), then alternates between consuming scheduling quanta
//! and negotiating reusable resources over a System V message queue until
//! its CPU burst is used up, it exits voluntarily, or it receives SIGTERM.

pub mod burst;
pub mod channel;
pub mod clock;
pub mod config;
pub mod dice;
pub mod error;
pub mod ipc;
pub mod protocol;
pub mod report;
pub mod resources;
pub mod signal;
pub mod worker;

mod trace;

#[cfg(test)]
mod testing;

pub use trace::init_tracing;

#[doc(inline)]
pub use ipc::shmem::SharedMemorySafe;

pub use error::WorkerError;
pub use worker::{Exit, Summary, Worker, WorkerIdentity};
