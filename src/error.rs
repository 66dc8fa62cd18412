//! Error types for misuse of the scheduler surface.
//!
//! Fetch failures are not represented here; they are ordinary data and are
//! delivered to every interested callback as [`Outcome::Failure`].
//!
//! [`Outcome::Failure`]: crate::Outcome::Failure

use futures::task::SpawnError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Grouping or flushing was attempted on an empty buffer.
    #[error("queue does not have any items")]
    EmptyQueue,

    /// A callback was requested for a slot that was never registered.
    #[error("undefined callback for slot \"{slot}\"")]
    UnknownSlot { slot: String },

    /// A subscription was used after `destroy()`.
    #[error("subscription is already destroyed; do not use it after destroy()")]
    Destroyed,

    /// A waiter was attached to a cache worker that has already expired.
    #[error("cache worker for {request} is expired")]
    ExpiredWorker { request: String },

    /// A canonical argument could not be serialized.
    #[error("failed to serialize canonical argument: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The spawner refused a task (usually because the executor shut down).
    #[error("failed to spawn task: {0}")]
    Spawn(#[from] SpawnError),

    /// A named fetch was dropped before anything was delivered to it.
    #[error("no outcome was delivered for \"{slot}\"")]
    Abandoned { slot: String },
}

pub type Result<T> = std::result::Result<T, Error>;
