//! RTP header framing for the voice media plane.
//!
//! Every audio datagram starts with a fixed 12-byte RTP header (RFC 3550),
//! optionally followed by a one-byte-profile header extension block. The
//! payload after the header is AEAD-sealed and handled elsewhere; this module
//! only deals with the clear-text framing.

use crate::error::WireError;

/// Version byte: V=2, no padding, no extension, no CSRC.
pub const RTP_VERSION: u8 = 0x80;

/// Version byte with the extension flag (bit 4) set.
pub const RTP_VERSION_WITH_EXTENSION: u8 = 0x90;

/// Payload type the relay assigns to Opus.
pub const PAYLOAD_TYPE_OPUS: u8 = 0x78;

/// Size of the fixed RTP header in bytes.
pub const RTP_HEADER_SIZE: usize = 12;

/// Profile marker that opens a one-byte header extension block (RFC 8285).
pub const EXTENSION_PROFILE: [u8; 2] = [0xBE, 0xDE];

const EXTENSION_FLAG: u8 = 0x10;
const MARKER_FLAG: u8 = 0x80;

/// Decoded fixed RTP header.
///
/// # Wire Format
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|   PT=0x78   |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    // ---
    /// Packet sequence number (wraps at 65535)
    pub sequence: u16,

    /// RTP timestamp in sample units
    pub timestamp: u32,

    /// Synchronization source identifier
    pub ssrc: u32,

    /// Whether a header extension block follows the fixed header
    pub has_extension: bool,

    /// Marker bit from the second byte
    pub marker: bool,
}

impl RtpHeader {
    // ---
    /// Creates a header for an outbound packet (no extension, no marker).
    pub fn new(sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        // ---
        Self {
            sequence,
            timestamp,
            ssrc,
            has_extension: false,
            marker: false,
        }
    }

    /// Decodes the fixed header at the start of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] if the buffer is shorter than 12 bytes, the first
    /// byte is neither `0x80` nor `0x90`, or the low 7 bits of the second byte
    /// are not the Opus payload type.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        // ---
        if bytes.len() < RTP_HEADER_SIZE {
            return Err(WireError::too_short(
                "RTP header",
                RTP_HEADER_SIZE,
                bytes.len(),
            ));
        }

        let version = bytes[0];
        if version != RTP_VERSION && version != RTP_VERSION_WITH_EXTENSION {
            return Err(WireError::UnknownVersion(version));
        }

        let payload_type = bytes[1] & !MARKER_FLAG;
        if payload_type != PAYLOAD_TYPE_OPUS {
            return Err(WireError::UnknownPayloadType(payload_type));
        }

        Ok(Self {
            sequence: u16::from_be_bytes([bytes[2], bytes[3]]),
            timestamp: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            ssrc: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            has_extension: version & EXTENSION_FLAG != 0,
            marker: bytes[1] & MARKER_FLAG != 0,
        })
    }

    /// Encodes the header into its 12-byte wire form.
    pub fn encode(&self) -> [u8; RTP_HEADER_SIZE] {
        // ---
        let mut buf = [0u8; RTP_HEADER_SIZE];

        buf[0] = if self.has_extension {
            RTP_VERSION_WITH_EXTENSION
        } else {
            RTP_VERSION
        };
        buf[1] = if self.marker {
            PAYLOAD_TYPE_OPUS | MARKER_FLAG
        } else {
            PAYLOAD_TYPE_OPUS
        };

        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        buf
    }
}

/// Returns true if `bytes` starts with a valid Opus RTP header.
pub fn is_rtp_header(bytes: &[u8]) -> bool {
    // ---
    RtpHeader::decode(bytes).is_ok()
}

/// Returns the total size of the header extension block at the start of `block`.
///
/// The block is a 2-byte profile marker, a 16-bit big-endian word count, then
/// that many 32-bit words. The result (`4 + 4 * count`) is the offset at which
/// the Opus payload begins.
///
/// # Errors
///
/// Returns [`WireError::TooShort`] if the block is truncated.
pub fn extension_block_len(block: &[u8]) -> Result<usize, WireError> {
    // ---
    if block.len() < 4 {
        return Err(WireError::too_short("extension header", 4, block.len()));
    }

    let words = u16::from_be_bytes([block[2], block[3]]) as usize;
    let total = 4 + 4 * words;
    if block.len() < total {
        return Err(WireError::too_short("extension block", total, block.len()));
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        // ---
        for (seq, ts, ssrc) in [
            (0u16, 0u32, 0u32),
            (1234, 567_890, 0x1234_5678),
            (u16::MAX, u32::MAX, u32::MAX),
        ] {
            let header = RtpHeader::new(seq, ts, ssrc);
            let decoded = RtpHeader::decode(&header.encode()).expect("decode failed");
            assert_eq!(decoded, header);
        }
    }

    #[test]
    fn test_header_layout() {
        // ---
        let bytes = RtpHeader::new(0x0102, 0x0304_0506, 0x0708_090A).encode();
        assert_eq!(
            bytes,
            [0x80, 0x78, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A]
        );
    }

    #[test]
    fn test_decode_too_short() {
        // ---
        let result = RtpHeader::decode(&[0x80, 0x78, 0, 0, 0]);
        assert!(matches!(result, Err(WireError::TooShort { actual: 5, .. })));
    }

    #[test]
    fn test_decode_wrong_version() {
        // ---
        let mut bytes = RtpHeader::new(1, 2, 3).encode();
        bytes[0] = 0x40;
        assert_eq!(RtpHeader::decode(&bytes), Err(WireError::UnknownVersion(0x40)));
    }

    #[test]
    fn test_decode_wrong_payload_type() {
        // ---
        let mut bytes = RtpHeader::new(1, 2, 3).encode();
        bytes[1] = 96;
        assert_eq!(
            RtpHeader::decode(&bytes),
            Err(WireError::UnknownPayloadType(96))
        );
    }

    #[test]
    fn test_extension_and_marker_flags() {
        // ---
        let mut bytes = RtpHeader::new(9, 9, 9).encode();
        bytes[0] = RTP_VERSION_WITH_EXTENSION;
        bytes[1] |= 0x80;

        let header = RtpHeader::decode(&bytes).expect("decode failed");
        assert!(header.has_extension);
        assert!(header.marker);
        assert_eq!(header.encode(), bytes);
    }

    #[test]
    fn test_rtcp_is_not_rtp() {
        // ---
        let rtcp = [0x81, 201, 0, 7, 0, 0, 0, 1, 0, 0, 0, 0];
        assert!(!is_rtp_header(&rtcp));
    }

    #[test]
    fn test_extension_block_len() {
        // ---
        let block = [0xBE, 0xDE, 0x00, 0x02, 1, 2, 3, 4, 5, 6, 7, 8, 0xAA];
        assert_eq!(extension_block_len(&block), Ok(12));

        let truncated = [0xBE, 0xDE, 0x00, 0x02, 1, 2];
        assert!(extension_block_len(&truncated).is_err());
        assert!(extension_block_len(&[0xBE]).is_err());
    }
}
