//! Asynchronous execution core for the gNB L2/L3 stack.
//!
//! Four tightly coupled pieces live here: resumable task frames,
//! awaitable event primitives, a backend-timed, epoch-protected timer
//! service, and protocol-transaction channels layered over both,
//! plus the task sequencer and per-cell command queue
//! built on top of them.
//!
//! Everything above is cooperative and single-threaded-per-executor; the
//! only thing that legally crosses an executor boundary without an explicit
//! hop is a timer expiry, which is why the timer service is the largest
//! single piece here.

pub mod cell;
pub mod closure;
pub mod error;
pub mod executor;
pub mod sequencer;
pub mod sync;
pub mod task;
pub mod time;
pub mod transaction;

pub use error::{Closed, SpawnError};
pub use executor::Executor;
pub use task::{JoinHandle, Task};
