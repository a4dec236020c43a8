//! Core error taxonomy.
//!
//! Component boundaries swallow recoverable errors: a bad inbound frame
//! becomes a dropped frame (and a counter bump), a transport failure
//! becomes a disconnect plus reconnect backoff, a refused login becomes a
//! terminal disconnect. Only `Fatal` aborts startup. A sequence gap is not
//! an error at all: it triggers the reset protocol.

use thiserror::Error;

use mw_protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum CoreError {
    /// I/O on a channel transport.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Malformed inbound frame; the frame is dropped and never forwarded.
    #[error(transparent)]
    Parse(#[from] ProtocolError),

    /// The in-memory send buffer refused an item.
    #[error("send buffer full")]
    BufferFull,

    /// The remote refused our login (or we refused theirs).
    #[error("login refused: {0}")]
    LoginRefused(String),

    /// An application callback failed; processing continues.
    #[error("application callback failed: {0}")]
    Application(String),

    /// The channel is closed and will not accept further traffic.
    #[error("channel closed")]
    ChannelClosed,

    /// Startup cannot proceed (missing configuration, unknown type code).
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<mw_codec::CodecError> for CoreError {
    fn from(e: mw_codec::CodecError) -> Self {
        CoreError::Parse(ProtocolError::Codec(e))
    }
}
