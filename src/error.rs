use thiserror::Error;

use crate::value::RpcValue;

#[derive(Debug, Error)]
pub enum Error {
    /// Decoder ran out of bytes in the middle of a value. The framing layer
    /// treats this as "frame incomplete, resume after more bytes"; user
    /// decode calls treat it as fatal.
    #[error("unexpected end of input")]
    BufferUnderflow,

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The peer answered a request with an Error payload.
    #[error("method call error: {0}")]
    MethodCall(RpcValue),

    #[error("transport closed")]
    TransportClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
