//! UDP media plane: the receive loop and the send path.
//!
//! Both sides work from an immutable [`MediaContext`] published when the
//! session description arrives. A reconnect publishes a new context rather
//! than mutating the old one, so a packet is always sealed or opened with the
//! key that belongs to its session.

mod discovery;
mod receiver;
mod sender;

pub use discovery::discover_external_address;
pub use receiver::{MediaReceiver, PacketOutcome};
pub use sender::{MediaSender, PcmWriter};
pub(crate) use sender::run_send_loop;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::crypto::{SecretKey, VoiceCipher};

/// Largest datagram the receive loop reads.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Everything the media plane needs for one session.
#[derive(Debug)]
pub struct MediaContext {
    // ---
    /// Our own SSRC
    pub ssrc: u32,
    pub key: SecretKey,
    pub cipher: Arc<VoiceCipher>,
    pub socket: Arc<UdpSocket>,
    /// Relay UDP endpoint
    pub remote: SocketAddr,
}
