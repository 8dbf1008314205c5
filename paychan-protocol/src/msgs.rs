//! Messages are hand-derived with `prost`; the schema they encode is:
//!
//! ```text
//! message TwoWayChannelMessage {
//!   MessageType type = 1;
//!   ClientVersion client_version = 2;   ServerVersion server_version = 3;
//!   Initiate initiate = 4;              ProvideRefund provide_refund = 5;
//!   ReturnRefund return_refund = 6;     ProvideContract provide_contract = 7;
//!   UpdatePayment update_payment = 8;   Settlement settlement = 9;
//!   Error error = 10;                   ChannelOpen channel_open = 11;
//! }
//! ```

#![allow(missing_docs)]

/// The major protocol version both roles speak
pub const PROTOCOL_MAJOR_VERSION: i32 = 1;
/// The minor protocol version this implementation sends
pub const PROTOCOL_MINOR_VERSION: i32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    ClientVersion = 1,
    ServerVersion = 2,
    Initiate = 3,
    ProvideRefund = 4,
    ReturnRefund = 5,
    ProvideContract = 6,
    ChannelOpen = 7,
    UpdatePayment = 8,
    Close = 9,
    Error = 10,
    PaymentAck = 11,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Timeout = 1,
    SyntaxError = 2,
    NoAcceptableVersion = 3,
    BadTransaction = 4,
    TimeWindowTooLarge = 5,
    ChannelValueTooLarge = 6,
    MinPaymentTooLarge = 7,
    Other = 8,
}

/// The envelope of every protocol message.
///
/// Exactly the payload field matching `type` is expected to be set.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TwoWayChannelMessage {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub client_version: Option<ClientVersion>,
    #[prost(message, optional, tag = "3")]
    pub server_version: Option<ServerVersion>,
    #[prost(message, optional, tag = "4")]
    pub initiate: Option<Initiate>,
    #[prost(message, optional, tag = "5")]
    pub provide_refund: Option<ProvideRefund>,
    #[prost(message, optional, tag = "6")]
    pub return_refund: Option<ReturnRefund>,
    #[prost(message, optional, tag = "7")]
    pub provide_contract: Option<ProvideContract>,
    #[prost(message, optional, tag = "8")]
    pub update_payment: Option<UpdatePayment>,
    #[prost(message, optional, tag = "9")]
    pub settlement: Option<Settlement>,
    #[prost(message, optional, tag = "10")]
    pub error: Option<ErrorMsg>,
    #[prost(message, optional, tag = "11")]
    pub channel_open: Option<ChannelOpen>,
}

/// client -> server: the first message of a session
#[derive(Clone, PartialEq, prost::Message)]
pub struct ClientVersion {
    #[prost(int32, tag = "1")]
    pub major: i32,
    #[prost(int32, tag = "2")]
    pub minor: i32,
    /// The escrow txid of a stored channel the client wants to resume
    #[prost(bytes = "vec", optional, tag = "3")]
    pub previous_channel_contract_hash: Option<Vec<u8>>,
}

/// server -> client
#[derive(Clone, PartialEq, prost::Message)]
pub struct ServerVersion {
    #[prost(int32, tag = "1")]
    pub major: i32,
    #[prost(int32, tag = "2")]
    pub minor: i32,
}

/// server -> client: the terms of a new channel
#[derive(Clone, PartialEq, prost::Message)]
pub struct Initiate {
    /// The server's multisig key, compressed
    #[prost(bytes = "vec", tag = "1")]
    pub multisig_key: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub min_accepted_channel_size: u64,
    /// The UNIX time the refund must not unlock before
    #[prost(uint64, tag = "3")]
    pub expire_time_secs: u64,
    /// Also charged as the first payment
    #[prost(uint64, tag = "4")]
    pub min_payment: u64,
}

/// client -> server: the refund to sign
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProvideRefund {
    /// The client's multisig key, compressed
    #[prost(bytes = "vec", tag = "1")]
    pub multisig_key: Vec<u8>,
    /// The unsigned refund, consensus encoded
    #[prost(bytes = "vec", tag = "2")]
    pub tx: Vec<u8>,
}

/// server -> client
#[derive(Clone, PartialEq, prost::Message)]
pub struct ReturnRefund {
    /// The server's NONE|ANYONECANPAY signature over the refund
    #[prost(bytes = "vec", tag = "1")]
    pub signature: Vec<u8>,
}

/// client -> server: the escrow and the first payment
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProvideContract {
    /// The signed escrow, consensus encoded
    #[prost(bytes = "vec", tag = "1")]
    pub tx: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub initial_payment: Option<UpdatePayment>,
}

/// server -> client: the channel is open
#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelOpen {
    /// The escrow txid
    #[prost(bytes = "vec", tag = "1")]
    pub contract_hash: Vec<u8>,
}

/// client -> server: a new cumulative payment
#[derive(Clone, PartialEq, prost::Message)]
pub struct UpdatePayment {
    /// What the client keeps of the escrow after this payment
    #[prost(uint64, tag = "1")]
    pub client_change_value: u64,
    /// The client's signature over the payment
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
}

/// server -> client: the final settlement, carried by CLOSE
#[derive(Clone, PartialEq, prost::Message)]
pub struct Settlement {
    #[prost(bytes = "vec", tag = "3")]
    pub tx: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ErrorMsg {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, optional, tag = "2")]
    pub explanation: Option<String>,
}

impl TwoWayChannelMessage {
    /// A message of `message_type` with no payload
    pub fn new(message_type: MessageType) -> Self {
        TwoWayChannelMessage { r#type: message_type as i32, ..Default::default() }
    }

    /// The message type, if it is one we know
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.r#type).ok()
    }

    pub fn client_version(previous_channel_contract_hash: Option<Vec<u8>>) -> Self {
        TwoWayChannelMessage {
            client_version: Some(ClientVersion {
                major: PROTOCOL_MAJOR_VERSION,
                minor: PROTOCOL_MINOR_VERSION,
                previous_channel_contract_hash,
            }),
            ..Self::new(MessageType::ClientVersion)
        }
    }

    pub fn server_version() -> Self {
        TwoWayChannelMessage {
            server_version: Some(ServerVersion {
                major: PROTOCOL_MAJOR_VERSION,
                minor: PROTOCOL_MINOR_VERSION,
            }),
            ..Self::new(MessageType::ServerVersion)
        }
    }

    pub fn initiate(initiate: Initiate) -> Self {
        TwoWayChannelMessage { initiate: Some(initiate), ..Self::new(MessageType::Initiate) }
    }

    pub fn provide_refund(multisig_key: Vec<u8>, tx: Vec<u8>) -> Self {
        TwoWayChannelMessage {
            provide_refund: Some(ProvideRefund { multisig_key, tx }),
            ..Self::new(MessageType::ProvideRefund)
        }
    }

    pub fn return_refund(signature: Vec<u8>) -> Self {
        TwoWayChannelMessage {
            return_refund: Some(ReturnRefund { signature }),
            ..Self::new(MessageType::ReturnRefund)
        }
    }

    pub fn provide_contract(tx: Vec<u8>, initial_payment: UpdatePayment) -> Self {
        TwoWayChannelMessage {
            provide_contract: Some(ProvideContract { tx, initial_payment: Some(initial_payment) }),
            ..Self::new(MessageType::ProvideContract)
        }
    }

    pub fn channel_open(contract_hash: Vec<u8>) -> Self {
        TwoWayChannelMessage {
            channel_open: Some(ChannelOpen { contract_hash }),
            ..Self::new(MessageType::ChannelOpen)
        }
    }

    pub fn update_payment(payment: UpdatePayment) -> Self {
        TwoWayChannelMessage {
            update_payment: Some(payment),
            ..Self::new(MessageType::UpdatePayment)
        }
    }

    pub fn payment_ack() -> Self {
        Self::new(MessageType::PaymentAck)
    }

    /// A close request, or from the server a close carrying the settlement
    pub fn close(settlement: Option<Vec<u8>>) -> Self {
        TwoWayChannelMessage {
            settlement: settlement.map(|tx| Settlement { tx }),
            ..Self::new(MessageType::Close)
        }
    }

    pub fn error(code: ErrorCode, explanation: impl Into<String>) -> Self {
        TwoWayChannelMessage {
            error: Some(ErrorMsg { code: code as i32, explanation: Some(explanation.into()) }),
            ..Self::new(MessageType::Error)
        }
    }

    /// The error code of an ERROR message
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().and_then(|e| ErrorCode::try_from(e.code).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;
    use test_log::test;

    #[test]
    fn wire_numbering_is_fixed() {
        assert_eq!(MessageType::ClientVersion as i32, 1);
        assert_eq!(MessageType::PaymentAck as i32, 11);
        assert_eq!(ErrorCode::Timeout as i32, 1);
        assert_eq!(ErrorCode::Other as i32, 8);
    }

    #[test]
    fn unknown_type_is_reported() {
        let msg = TwoWayChannelMessage { r#type: 42, ..Default::default() };
        let decoded = TwoWayChannelMessage::decode(msg.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.r#type, 42);
        assert_eq!(decoded.message_type(), None);
    }

    #[test]
    fn error_carries_code_and_explanation() {
        let msg = TwoWayChannelMessage::error(ErrorCode::BadTransaction, "bad refund");
        let decoded = TwoWayChannelMessage::decode(msg.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.message_type(), Some(MessageType::Error));
        assert_eq!(decoded.error_code(), Some(ErrorCode::BadTransaction));
        assert_eq!(decoded.error.unwrap().explanation.as_deref(), Some("bad refund"));
    }

    #[test]
    fn resume_hash_is_optional() {
        let fresh = TwoWayChannelMessage::client_version(None);
        let decoded = TwoWayChannelMessage::decode(fresh.encode_to_vec().as_slice()).unwrap();
        let version = decoded.client_version.unwrap();
        assert_eq!(version.major, PROTOCOL_MAJOR_VERSION);
        assert_eq!(version.previous_channel_contract_hash, None);

        let resume = TwoWayChannelMessage::client_version(Some(vec![7; 32]));
        let decoded = TwoWayChannelMessage::decode(resume.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.client_version.unwrap().previous_channel_contract_hash, Some(vec![7; 32]));
    }
}
