//! External address discovery over the media socket.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};
use voicelink_common::ip_discovery::{IP_DISCOVERY_RESPONSE, IP_DISCOVERY_SIZE};
use voicelink_common::IpDiscoveryPacket;

use crate::error::{Result, VoiceError};

/// Asks the relay which address and port our datagrams arrive from.
///
/// Sends one 74-byte request carrying `ssrc` and waits up to `wait` for the
/// type-2 response. Anything else arriving on the socket in the meantime is
/// skipped.
///
/// # Errors
///
/// Returns [`VoiceError::Timeout`] if no response arrives in time, or an I/O
/// error if the socket fails.
pub async fn discover_external_address(
    socket: &UdpSocket,
    remote: SocketAddr,
    ssrc: u32,
    wait: Duration,
) -> Result<(String, u16)> {
    // ---
    socket
        .send_to(&IpDiscoveryPacket::request(ssrc).encode(), remote)
        .await?;
    debug!("IP discovery request sent to {} (ssrc {})", remote, ssrc);

    let deadline = Instant::now() + wait;
    let mut buf = [0u8; 2 * IP_DISCOVERY_SIZE];

    loop {
        let (len, from) = timeout_at(deadline, socket.recv_from(&mut buf))
            .await
            .map_err(|_| VoiceError::Timeout("IP discovery response"))??;

        match IpDiscoveryPacket::decode(&buf[..len]) {
            Ok(packet) if packet.packet_type == IP_DISCOVERY_RESPONSE => {
                if packet.address.is_empty() {
                    return Err(VoiceError::protocol("IP discovery response has no address"));
                }
                return Ok((packet.address, packet.port));
            }
            Ok(packet) => trace!(
                "Ignoring IP discovery packet of type {} from {}",
                packet.packet_type,
                from
            ),
            Err(e) => trace!("Ignoring {} byte datagram from {}: {}", len, from, e),
        }
    }
}
