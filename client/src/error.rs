//! Error taxonomy for the voice client.

use thiserror::Error;
use voicelink_common::WireError;

use crate::codec::CodecError;

/// Convenience alias used throughout the library.
pub type Result<T, E = VoiceError> = std::result::Result<T, E>;

/// Everything that can go wrong inside a voice connection.
///
/// The first three variants are packet-local: the receive loop logs them and
/// moves on to the next datagram. `ProtocolViolation` ends the current session
/// and hands control to the reconnect policy. `Configuration` is only ever
/// returned from `connect`.
#[derive(Debug, Error)]
pub enum VoiceError {
    // ---
    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] WireError),

    #[error("AEAD open failed")]
    DecryptionFailure,

    #[error("AEAD seal failed")]
    EncryptionFailure,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid connection parameters: {0}")]
    Configuration(String),

    #[error("signaling layer failed: {0}")]
    Signaling(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid gateway payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("connection closed")]
    Closed,
}

impl VoiceError {
    // ---
    /// True for errors the receive loop recovers from by dropping one packet.
    pub fn is_packet_local(&self) -> bool {
        // ---
        matches!(
            self,
            VoiceError::MalformedPacket(_) | VoiceError::DecryptionFailure | VoiceError::Codec(_)
        )
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        // ---
        VoiceError::ProtocolViolation(msg.into())
    }

    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        // ---
        VoiceError::Configuration(msg.into())
    }
}
