use bitcoin::Amount;
use log::error;

use crate::persist;

/// A classified failure of a channel operation.
///
/// Protocol violations by the remote party are not reported through this type,
/// they cause the offending session to be closed instead.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The wallet cannot fund the requested amount
    #[error("insufficient funds: needed {needed}, available {available}")]
    InsufficientFunds {
        /// the amount required
        needed: Amount,
        /// the spendable amount
        available: Amount,
    },
    /// The caller supplied an argument that can never succeed
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The operation is not allowed in the current channel state
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// A transaction failed structural or signature validation
    #[error("bad transaction: {0}")]
    BadTransaction(String),
    /// Persisted state could not be encoded or decoded
    #[error("persistence: {0}")]
    Persist(#[from] persist::Error),
    /// The broadcaster could not propagate a transaction
    #[error("broadcast failed: {0}")]
    Broadcast(String),
    /// No async runtime is available to schedule background work
    #[error("runtime: {0}")]
    Runtime(String),
}

/// Result
pub type Result<T> = core::result::Result<T, Error>;

/// An invalid argument was detected
pub fn invalid_argument(msg: impl Into<String>) -> Error {
    let s = msg.into();
    error!("INVALID ARGUMENT: {}", &s);
    Error::InvalidArgument(s)
}

/// The operation was attempted in the wrong state
pub fn illegal_state(msg: impl Into<String>) -> Error {
    let s = msg.into();
    error!("ILLEGAL STATE: {}", &s);
    Error::IllegalState(s)
}

/// A transaction failed validation
pub fn bad_transaction(msg: impl Into<String>) -> Error {
    let s = msg.into();
    error!("BAD TRANSACTION: {}", &s);
    Error::BadTransaction(s)
}
