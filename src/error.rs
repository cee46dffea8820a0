//! Error types for the thread controller.

use thiserror::Error;

use crate::thread::{Id, State};

/// Every failure the controller, registry and snapshot service can report.
///
/// Interruption and thread death are ordinary variants so that a thread body
/// can propagate them with `?` out of a blocking call.
#[derive(Debug, Error)]
pub enum Error {
    /// `start` was called on a thread that is not `NEW`, or that another caller
    /// is already starting.
    #[error("thread {0} has already been started")]
    AlreadyStarted(Id),

    /// The operation is not valid for the thread's current state.
    #[error("illegal state for {op} on thread {id}: {state}")]
    IllegalThreadState {
        id: Id,
        state: State,
        op: &'static str,
    },

    /// The platform (or the configured thread limit) refused a new OS thread.
    #[error("cannot create native thread for {id}: {reason}")]
    ResourceExhausted { id: Id, reason: String },

    /// An interrupt was delivered while the thread was in an interruptible wait.
    #[error("thread interrupted")]
    Interrupted,

    /// The thread was stopped through legacy control and observed it at a safe point.
    #[error("thread {0} was stopped")]
    Stopped(Id),

    /// The registry already holds this identity. Controller and registry are
    /// out of sync; the operation is aborted.
    #[error("duplicate thread identity {0} in registry")]
    DuplicateIdentity(Id),

    /// A value lies outside its permitted range.
    #[error("value {value} outside of range {min}..={max}")]
    ValueOutOfRange { value: i32, min: i32, max: i32 },

    /// A monitor operation was attempted by a thread that does not own the monitor.
    #[error("thread {id} does not own monitor {monitor}")]
    NotOwner { id: Id, monitor: u64 },

    /// Legacy control (stop, suspend, resume) was requested without opting in.
    #[error("legacy operation `{0}` is disabled by configuration")]
    LegacyDisabled(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
