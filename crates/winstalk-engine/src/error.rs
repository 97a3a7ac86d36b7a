use crate::breakpoint::Target;
use crate::native::{Address, NativeError, Tid};

/// Error returned by event handlers and breakpoint actions, once erased.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A breakpoint (or watch, or hook) already exists at this exact target.
    #[error("{0} is already taken")]
    Conflict(Target),

    /// Every debug register of the thread is already in use.
    #[error("no free debug register on thread {0}")]
    ResourceExhausted(Tid),

    /// No breakpoint was ever set at this target.
    #[error("{0} was never set")]
    NotFound(Target),

    /// The target process or thread has already exited.
    #[error("target process or thread is gone")]
    TargetGone,

    /// A native debug API call failed.
    #[error("OS error {0}")]
    Os(u32),

    /// The address or size failed validation.
    #[error("invalid target {address:#x}: {reason}")]
    InvalidTarget {
        /// Rejected address.
        address: Address,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// An event handler callback failed.
    #[error("event handler failed")]
    Handler(#[source] BoxError),

    /// A breakpoint action failed.
    #[error("breakpoint action failed")]
    Action(#[source] BoxError),
}

impl From<NativeError> for Error {
    fn from(err: NativeError) -> Self {
        match err {
            NativeError::TargetGone => Self::TargetGone,
            NativeError::Os(code) => Self::Os(code),
        }
    }
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
