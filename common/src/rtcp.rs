//! RTCP receiver report framing.
//!
//! The relay periodically sends receiver reports describing how it sees our
//! outbound stream. They are only consumed for observability.

use crate::error::WireError;

/// Size of the RTCP header in bytes.
pub const RTCP_HEADER_SIZE: usize = 8;

/// Packet type of an RTCP receiver report.
pub const RTCP_RECEIVER_REPORT: u8 = 201;

/// Size of one report block in bytes.
pub const REPORT_BLOCK_SIZE: usize = 24;

/// Decoded 8-byte RTCP header.
///
/// ```text
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|    RC   |   PT=RR=201   |             length            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                     SSRC of packet sender                     |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpHeader {
    // ---
    pub version: u8,
    pub padding: bool,
    pub report_count: u8,
    pub packet_type: u8,
    /// Length in 32-bit words minus one
    pub length: u16,
    pub ssrc: u32,
}

impl RtcpHeader {
    // ---
    /// Decodes the header at the start of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] for fewer than 8 bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        // ---
        if bytes.len() < RTCP_HEADER_SIZE {
            return Err(WireError::too_short(
                "RTCP header",
                RTCP_HEADER_SIZE,
                bytes.len(),
            ));
        }

        Ok(Self {
            version: bytes[0] >> 6,
            padding: bytes[0] & 0x20 != 0,
            report_count: bytes[0] & 0x1F,
            packet_type: bytes[1],
            length: u16::from_be_bytes([bytes[2], bytes[3]]),
            ssrc: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }

    /// Encodes the header into its 8-byte wire form.
    pub fn encode(&self) -> [u8; RTCP_HEADER_SIZE] {
        // ---
        let mut buf = [0u8; RTCP_HEADER_SIZE];
        buf[0] = (self.version << 6) | (u8::from(self.padding) << 5) | (self.report_count & 0x1F);
        buf[1] = self.packet_type;
        buf[2..4].copy_from_slice(&self.length.to_be_bytes());
        buf[4..8].copy_from_slice(&self.ssrc.to_be_bytes());
        buf
    }
}

/// One 24-byte reception report block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportBlock {
    // ---
    /// Source this block reports on
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// 24-bit cumulative packets lost
    pub cumulative_lost: u32,
    pub extended_highest_sequence: u32,
    pub jitter: u32,
    pub last_sender_report: u32,
    pub delay_since_last_sender_report: u32,
}

impl ReportBlock {
    // ---
    /// Decodes one block from the first 24 bytes of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if fewer than 24 bytes remain.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        // ---
        if bytes.len() < REPORT_BLOCK_SIZE {
            return Err(WireError::too_short(
                "report block",
                REPORT_BLOCK_SIZE,
                bytes.len(),
            ));
        }

        let word = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

        Ok(Self {
            ssrc: word(0),
            fraction_lost: bytes[4],
            cumulative_lost: u32::from_be_bytes([0, bytes[5], bytes[6], bytes[7]]),
            extended_highest_sequence: word(8),
            jitter: word(12),
            last_sender_report: word(16),
            delay_since_last_sender_report: word(20),
        })
    }

    /// Encodes the block into its 24-byte wire form.
    pub fn encode(&self) -> [u8; REPORT_BLOCK_SIZE] {
        // ---
        let mut buf = [0u8; REPORT_BLOCK_SIZE];
        buf[0..4].copy_from_slice(&self.ssrc.to_be_bytes());
        buf[4] = self.fraction_lost;
        buf[5..8].copy_from_slice(&self.cumulative_lost.to_be_bytes()[1..]);
        buf[8..12].copy_from_slice(&self.extended_highest_sequence.to_be_bytes());
        buf[12..16].copy_from_slice(&self.jitter.to_be_bytes());
        buf[16..20].copy_from_slice(&self.last_sender_report.to_be_bytes());
        buf[20..24].copy_from_slice(&self.delay_since_last_sender_report.to_be_bytes());
        buf
    }
}

/// Returns true if `bytes` looks like an RTCP receiver report.
pub fn is_receiver_report(bytes: &[u8]) -> bool {
    // ---
    bytes.len() >= RTCP_HEADER_SIZE && bytes[1] == RTCP_RECEIVER_REPORT
}

/// Decodes `count` consecutive report blocks from `bytes`.
///
/// # Errors
///
/// Returns [`WireError::TooShort`] if the buffer holds fewer than `count` blocks.
pub fn decode_report_blocks(bytes: &[u8], count: usize) -> Result<Vec<ReportBlock>, WireError> {
    // ---
    let needed = count * REPORT_BLOCK_SIZE;
    if bytes.len() < needed {
        return Err(WireError::too_short("report blocks", needed, bytes.len()));
    }

    bytes
        .chunks_exact(REPORT_BLOCK_SIZE)
        .take(count)
        .map(ReportBlock::decode)
        .collect()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn sample_block(ssrc: u32) -> ReportBlock {
        // ---
        ReportBlock {
            ssrc,
            fraction_lost: 12,
            cumulative_lost: 0x00AB_CDEF,
            extended_highest_sequence: 70_000,
            jitter: 42,
            last_sender_report: 7,
            delay_since_last_sender_report: 65_536,
        }
    }

    #[test]
    fn test_header_fields() {
        // ---
        let header = RtcpHeader::decode(&[0x82, 201, 0x00, 0x0D, 0, 0, 0x30, 0x39])
            .expect("decode failed");

        assert_eq!(header.version, 2);
        assert!(!header.padding);
        assert_eq!(header.report_count, 2);
        assert_eq!(header.packet_type, RTCP_RECEIVER_REPORT);
        assert_eq!(header.length, 13);
        assert_eq!(header.ssrc, 12345);
    }

    #[test]
    fn test_is_receiver_report() {
        // ---
        assert!(is_receiver_report(&[0x80, 201, 0, 1, 0, 0, 0, 1]));
        assert!(!is_receiver_report(&[0x80, 200, 0, 1, 0, 0, 0, 1]));
        assert!(!is_receiver_report(&[0x80, 201, 0]));
    }

    #[test]
    fn test_decode_report_blocks_sequentially() {
        // ---
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&sample_block(1).encode());
        bytes.extend_from_slice(&sample_block(2).encode());

        let blocks = decode_report_blocks(&bytes, 2).expect("decode failed");
        assert_eq!(blocks, vec![sample_block(1), sample_block(2)]);
        assert_eq!(blocks[0].cumulative_lost, 0x00AB_CDEF);
    }

    #[test]
    fn test_report_blocks_truncated() {
        // ---
        let bytes = sample_block(1).encode();
        assert!(decode_report_blocks(&bytes[..20], 1).is_err());
        assert!(decode_report_blocks(&bytes, 2).is_err());
        assert_eq!(decode_report_blocks(&[], 0), Ok(Vec::new()));
    }
}
