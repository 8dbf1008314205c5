use core::fmt;

/// Why a session ended, as reported locally.
///
/// Not all reasons are sent on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The transport closed, or the session was dropped without settling
    ConnectionClosed,
    /// The client asked to settle
    ClientRequestedClose,
    /// The server closed the session, with or without settling
    ServerRequestedClose,
    /// The peer sent an ERROR message
    RemoteSentError,
    /// The peer sent a malformed or out-of-order message
    RemoteSentInvalidMessage,
    /// The peer speaks an incompatible protocol version
    NoAcceptableVersion,
    /// The server asked for a refund lock longer than the client accepts
    TimeWindowTooLarge,
    /// The server asked for more value than the client wants to escrow
    ServerRequestedTooMuchValue,
    /// The client's wallet could not fund a new channel
    InsufficientFunds,
}

impl CloseReason {
    /// Whether the session ended because something went wrong
    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            CloseReason::ConnectionClosed
                | CloseReason::ClientRequestedClose
                | CloseReason::ServerRequestedClose
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::ConnectionClosed => "connection closed",
            CloseReason::ClientRequestedClose => "client requested close",
            CloseReason::ServerRequestedClose => "server requested close",
            CloseReason::RemoteSentError => "remote sent error",
            CloseReason::RemoteSentInvalidMessage => "remote sent invalid message",
            CloseReason::NoAcceptableVersion => "no acceptable version",
            CloseReason::TimeWindowTooLarge => "time window too large",
            CloseReason::ServerRequestedTooMuchValue => "server requested too much value",
            CloseReason::InsufficientFunds => "insufficient funds",
        };
        f.write_str(s)
    }
}
