use core::fmt;

/// Framing or decoding failure
#[derive(Debug)]
pub enum Error {
    /// The transport failed
    Io(std::io::Error),
    /// The frame did not hold a valid message
    Decode(prost::DecodeError),
    /// The frame length exceeds the protocol maximum
    MessageTooLarge(usize),
    /// The peer closed the stream between frames
    Eof,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Decode(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io: {}", e),
            Error::Decode(e) => write!(f, "decode: {}", e),
            Error::MessageTooLarge(len) => write!(f, "message too large: {} bytes", len),
            Error::Eof => write!(f, "end of stream"),
        }
    }
}

impl std::error::Error for Error {}

/// Result
pub type Result<T> = core::result::Result<T, Error>;
