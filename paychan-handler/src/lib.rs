//! The two roles of the payment channel protocol.
//!
//! Both machines are driven by their transport: it hands every received
//! message to `receive_message` and reports closure through
//! `connection_closed`.  The machines talk back through a connection trait
//! the transport implements.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// The paying side
pub mod client;
/// Close reasons
pub mod close;
/// The receiving side
pub mod server;

#[cfg(test)]
mod test_utils;

pub use client::{ClientConnection, ClientStep, PaymentChannelClient};
pub use close::CloseReason;
pub use server::{PaymentChannelServer, ServerConnection, ServerStep};

use paychan_protocol::ErrorCode;

/// A protocol violation or negotiation failure that ends the session
#[derive(Debug)]
pub(crate) struct Fault {
    pub code: ErrorCode,
    pub reason: CloseReason,
    pub explanation: String,
}

impl Fault {
    pub(crate) fn new(code: ErrorCode, reason: CloseReason, explanation: impl Into<String>) -> Self {
        Fault { code, reason, explanation: explanation.into() }
    }

    /// The peer sent something malformed or out of order
    pub(crate) fn invalid(explanation: impl Into<String>) -> Self {
        Self::new(ErrorCode::SyntaxError, CloseReason::RemoteSentInvalidMessage, explanation)
    }

    /// The peer sent a transaction or signature that failed validation
    pub(crate) fn bad_transaction(explanation: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadTransaction, CloseReason::RemoteSentInvalidMessage, explanation)
    }
}
