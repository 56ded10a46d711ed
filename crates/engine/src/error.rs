//! Engine Error Types
//!
//! Storage failures are raised into one of these kinds with
//! [`or_raise`](exn::ResultExt::or_raise), so the error tree still shows the
//! underlying storage error (and where it happened) below the engine's view
//! of what was being attempted.

use derive_more::{Display, Error};

/// An engine error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// ### Fatal
/// - [`ErrorKind::Identity`] - raised before the loop starts.
///
/// ### Per Cycle
/// - [`ErrorKind::ListRemote`] and [`ErrorKind::ListLocal`] abort a cycle
///   before any decision is made.
/// - [`ErrorKind::Action`] wraps a single failed action.
/// - [`ErrorKind::Storage`] is the replica operation underneath an action.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("no usable network interface to derive a client identity from")]
    Identity,
    #[display("listing the remote replica failed")]
    ListRemote,
    #[display("listing the local replica failed")]
    ListLocal,
    #[display("action {_0} failed")]
    Action(#[error(not(source))] String),
    #[display("storage operation failed")]
    Storage,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Identity => false,
            Self::ListRemote | Self::ListLocal | Self::Action(_) | Self::Storage => true,
        }
    }
}
