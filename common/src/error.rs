//! Structural errors raised by the wire codecs.

use thiserror::Error;

/// A datagram failed structural validation.
///
/// Every variant is local to one packet; callers on the receive path drop the
/// offending datagram and keep going.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    // ---
    #[error("{what} needs at least {expected} bytes, got {actual}")]
    TooShort {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("unknown RTP version byte 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("unexpected payload type {0}")]
    UnknownPayloadType(u8),

    #[error("packet type {0} is not an RTCP receiver report")]
    NotReceiverReport(u8),

    #[error("discovery address is not valid UTF-8")]
    InvalidAddress,
}

impl WireError {
    // ---
    pub(crate) fn too_short(what: &'static str, expected: usize, actual: usize) -> Self {
        // ---
        WireError::TooShort {
            what,
            expected,
            actual,
        }
    }
}
