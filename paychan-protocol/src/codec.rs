use std::io::{ErrorKind, Read, Write};

use log::error;
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::msgs::TwoWayChannelMessage;

/// The largest frame either side accepts
pub const MAX_MESSAGE_SIZE: usize = 32767;

fn check_len(len: usize) -> Result<()> {
    if len > MAX_MESSAGE_SIZE {
        error!("message too large {}", len);
        return Err(Error::MessageTooLarge(len));
    }
    Ok(())
}

/// Encode a message into a length framed buffer:
///
/// - u32 big-endian payload length
/// - protobuf payload
pub fn to_frame(msg: &TwoWayChannelMessage) -> Result<Vec<u8>> {
    let payload = msg.encode_to_vec();
    check_len(payload.len())?;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

fn from_payload(payload: &[u8]) -> Result<TwoWayChannelMessage> {
    Ok(TwoWayChannelMessage::decode(payload)?)
}

fn header_error(e: std::io::Error) -> Error {
    if e.kind() == ErrorKind::UnexpectedEof {
        Error::Eof
    } else {
        Error::Io(e)
    }
}

/// Write a length framed message
pub fn write<W: Write>(writer: &mut W, msg: &TwoWayChannelMessage) -> Result<()> {
    writer.write_all(&to_frame(msg)?)?;
    writer.flush()?;
    Ok(())
}

/// Read a length framed message
pub fn read<R: Read>(reader: &mut R) -> Result<TwoWayChannelMessage> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).map_err(header_error)?;
    let len = u32::from_be_bytes(header) as usize;
    check_len(len)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    from_payload(&payload)
}

/// Write a length framed message to an async writer
pub async fn write_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &TwoWayChannelMessage,
) -> Result<()> {
    writer.write_all(&to_frame(msg)?).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length framed message from an async reader
pub async fn read_async<R: AsyncRead + Unpin>(reader: &mut R) -> Result<TwoWayChannelMessage> {
    let len = reader.read_u32().await.map_err(header_error)? as usize;
    check_len(len)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    from_payload(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msgs::{ErrorCode, MessageType};
    use test_log::test;

    #[test]
    fn frames_are_length_prefixed() {
        let msg = TwoWayChannelMessage::payment_ack();
        let frame = to_frame(&msg).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);

        let mut buf = Vec::new();
        write(&mut buf, &msg).unwrap();
        write(&mut buf, &TwoWayChannelMessage::error(ErrorCode::Timeout, "idle")).unwrap();
        let mut reader = buf.as_slice();
        assert_eq!(read(&mut reader).unwrap().message_type(), Some(MessageType::PaymentAck));
        assert_eq!(read(&mut reader).unwrap().error_code(), Some(ErrorCode::Timeout));
        assert!(matches!(read(&mut reader), Err(Error::Eof)));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut frame = ((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes().to_vec();
        frame.resize(4 + MAX_MESSAGE_SIZE + 1, 0);
        assert!(matches!(read(&mut frame.as_slice()), Err(Error::MessageTooLarge(_))));

        let huge = TwoWayChannelMessage::provide_refund(vec![], vec![0; MAX_MESSAGE_SIZE]);
        assert!(matches!(to_frame(&huge), Err(Error::MessageTooLarge(_))));
    }

    #[test]
    fn truncated_payload_is_an_io_error() {
        let frame = to_frame(&TwoWayChannelMessage::client_version(None)).unwrap();
        let truncated = &frame[..frame.len() - 1];
        assert!(matches!(read(&mut &truncated[..]), Err(Error::Io(_))));
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let frame = [0u8, 0, 0, 2, 0xff, 0xff];
        assert!(matches!(read(&mut &frame[..]), Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn async_framing_matches_sync() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = TwoWayChannelMessage::client_version(Some(vec![1; 32]));
        write_async(&mut a, &msg).await.unwrap();
        drop(a);
        let received = read_async(&mut b).await.unwrap();
        assert!(received == msg);
        assert!(matches!(read_async(&mut b).await, Err(Error::Eof)));
    }
}
