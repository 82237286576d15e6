//! IP discovery packet.
//!
//! Before selecting a protocol the client sends one request to the relay's UDP
//! endpoint and the relay echoes back the external address and port it saw.

use crate::error::WireError;

/// Total size of a discovery packet.
pub const IP_DISCOVERY_SIZE: usize = 74;

/// Value of the length field (everything after type and length).
pub const IP_DISCOVERY_LENGTH: u16 = 70;

/// Packet type of an outbound request.
pub const IP_DISCOVERY_REQUEST: u16 = 1;

/// Packet type of the relay's response.
pub const IP_DISCOVERY_RESPONSE: u16 = 2;

const ADDRESS_OFFSET: usize = 8;
const ADDRESS_SIZE: usize = 64;
const PORT_OFFSET: usize = ADDRESS_OFFSET + ADDRESS_SIZE;

/// An IP discovery request or response.
///
/// ```text
/// | type (2) | length (2) | ssrc (4) | address (64, NUL padded) | port (2) |
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpDiscoveryPacket {
    // ---
    pub packet_type: u16,
    pub length: u16,
    pub ssrc: u32,
    pub address: String,
    pub port: u16,
}

impl IpDiscoveryPacket {
    // ---
    /// Builds the request packet for our own SSRC.
    pub fn request(ssrc: u32) -> Self {
        // ---
        Self {
            packet_type: IP_DISCOVERY_REQUEST,
            length: IP_DISCOVERY_LENGTH,
            ssrc,
            address: String::new(),
            port: 0,
        }
    }

    /// Encodes the packet into its 74-byte wire form.
    ///
    /// The address field is zero-filled first. Addresses longer than 63 bytes
    /// are truncated at a character boundary so the field always ends in a
    /// NUL.
    pub fn encode(&self) -> [u8; IP_DISCOVERY_SIZE] {
        // ---
        let mut buf = [0u8; IP_DISCOVERY_SIZE];

        buf[0..2].copy_from_slice(&self.packet_type.to_be_bytes());
        buf[2..4].copy_from_slice(&self.length.to_be_bytes());
        buf[4..8].copy_from_slice(&self.ssrc.to_be_bytes());

        let mut len = self.address.len().min(ADDRESS_SIZE - 1);
        while !self.address.is_char_boundary(len) {
            len -= 1;
        }
        buf[ADDRESS_OFFSET..ADDRESS_OFFSET + len].copy_from_slice(&self.address.as_bytes()[..len]);

        buf[PORT_OFFSET..PORT_OFFSET + 2].copy_from_slice(&self.port.to_be_bytes());

        buf
    }

    /// Decodes a packet, trimming trailing NUL bytes from the address.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] if the buffer is shorter than 74 bytes or the
    /// address is not UTF-8.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        // ---
        if bytes.len() < IP_DISCOVERY_SIZE {
            return Err(WireError::too_short(
                "IP discovery packet",
                IP_DISCOVERY_SIZE,
                bytes.len(),
            ));
        }

        let raw = &bytes[ADDRESS_OFFSET..PORT_OFFSET];
        let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        let address = std::str::from_utf8(&raw[..end])
            .map_err(|_| WireError::InvalidAddress)?
            .to_string();

        Ok(Self {
            packet_type: u16::from_be_bytes([bytes[0], bytes[1]]),
            length: u16::from_be_bytes([bytes[2], bytes[3]]),
            ssrc: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            address,
            port: u16::from_be_bytes([bytes[PORT_OFFSET], bytes[PORT_OFFSET + 1]]),
        })
    }
}
