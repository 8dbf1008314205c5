//! The payment channel wire protocol: one protobuf envelope,
//! [`msgs::TwoWayChannelMessage`], framed with a big-endian u32 length.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Length-prefixed framing
pub mod codec;
/// Errors
pub mod error;
/// Protocol messages
pub mod msgs;

pub use error::{Error, Result};
pub use msgs::{ErrorCode, MessageType, TwoWayChannelMessage};
