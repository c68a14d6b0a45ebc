//! Crate-wide error types.
//!
//! Recoverable conditions are encoded as these types; fatal programming
//! errors (awaiting an empty task, destroying a running frame, setting an
//! already-set indexed transaction slot, ...) remain `panic!`s, matching the
//! original's `srsran_assert`/`srsgnb_assert` discipline rather than being
//! wrapped in `Result`.

use thiserror::Error;

/// The executor (or primitive) a task was being dispatched to has been closed.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
#[error("closed")]
pub struct Closed(pub(crate) ());

/// Failure to spawn a task.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The executor the task was spawned onto has been closed.
    #[error("executor was closed")]
    Closed,
    /// The executor's queue was full and back-pressure was not resolved.
    #[error("executor queue is full")]
    Full,
}

impl From<Closed> for SpawnError {
    fn from(_: Closed) -> Self {
        Self::Closed
    }
}

/// A `try_push` onto a bounded [`crate::sync::AsyncQueue`] found it full.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
#[error("queue is at capacity")]
pub struct QueueFull;
