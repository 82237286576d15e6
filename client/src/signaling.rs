//! Boundary with the host's signaling layer.
//!
//! The voice client does not talk to the main gateway itself. The host hands
//! it voice-state and voice-server events and provides a [`Signaling`]
//! implementation to send voice-state updates on its behalf.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use crate::error::{Result, VoiceError};

/// Boxed future returned by the collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Default relay port when the endpoint omits one.
pub const DEFAULT_GATEWAY_PORT: u16 = 443;

/// Channel type as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Text,
    Voice,
    Stage,
    Category,
    Other,
}

/// The channel a caller wants to join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceChannel {
    // ---
    pub id: u64,
    /// `None` for channels outside a server (DMs)
    pub server_id: Option<u64>,
    pub kind: ChannelKind,
}

impl VoiceChannel {
    // ---
    pub fn new(id: u64, server_id: u64, kind: ChannelKind) -> Self {
        // ---
        Self {
            id,
            server_id: Some(server_id),
            kind,
        }
    }
}

/// Voice state requested when joining.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoiceStateFlags {
    // ---
    pub self_mute: bool,
    pub self_deaf: bool,
    /// Must be unset at connect time; speaking starts after the session is ready
    pub speaking: bool,
}

/// A voice-state update the host must send on the main gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceStateCommand {
    // ---
    pub server_id: u64,
    /// `None` leaves voice
    pub channel_id: Option<u64>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// A resolved server member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    // ---
    pub user_id: u64,
    pub display_name: Option<String>,
}

/// Sends voice-state updates through the host's main gateway connection.
pub trait Signaling: Send + Sync + 'static {
    // ---
    fn update_voice_state(&self, command: VoiceStateCommand) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Looks up members by user id for speaking notifications.
pub trait MemberDirectory: Send + Sync + 'static {
    // ---
    fn resolve_member(&self, server_id: u64, user_id: u64) -> BoxFuture<'_, Option<Member>>;
}

/// Everything needed to open (or resume) a voice session.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    // ---
    pub server_id: u64,
    pub user_id: u64,
    pub session_id: String,
    pub token: String,
    /// Relay endpoint, `host[:port]` or a full `ws://`/`wss://` URL
    pub endpoint: String,
}

impl Credentials {
    // ---
    /// Builds the gateway URL for this endpoint.
    ///
    /// `host[:port]` becomes `wss://host:port/?v=<version>&encoding=json`,
    /// with the port defaulting to 443. A URL that already has a websocket
    /// scheme is used verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::ProtocolViolation`] for an empty host or an
    /// unparseable port.
    pub fn gateway_url(&self, version: u8) -> Result<String> {
        // ---
        let endpoint = self.endpoint.trim().trim_end_matches('/');
        if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
            return Ok(endpoint.to_string());
        }

        let (host, port) = match endpoint.rsplit_once(':') {
            Some((host, port)) if !host.ends_with(':') => {
                let port = port.parse::<u16>().map_err(|_| {
                    VoiceError::protocol(format!("invalid port in endpoint {endpoint:?}"))
                })?;
                (host, port)
            }
            _ => (endpoint, DEFAULT_GATEWAY_PORT),
        };

        if host.is_empty() {
            return Err(VoiceError::protocol("voice endpoint has no host"));
        }

        Ok(format!("wss://{host}:{port}/?v={version}&encoding=json"))
    }
}

impl fmt::Debug for Credentials {
    // ---
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.debug_struct("Credentials")
            .field("server_id", &self.server_id)
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn credentials(endpoint: &str) -> Credentials {
        // ---
        Credentials {
            server_id: 1,
            user_id: 2,
            session_id: "session".into(),
            token: "secret-token".into(),
            endpoint: endpoint.into(),
        }
    }

    #[test]
    fn test_gateway_url_with_port() {
        // ---
        let url = credentials("relay.example.com:8443").gateway_url(4).expect("valid");
        assert_eq!(url, "wss://relay.example.com:8443/?v=4&encoding=json");
    }

    #[test]
    fn test_gateway_url_default_port() {
        // ---
        let url = credentials("relay.example.com").gateway_url(4).expect("valid");
        assert_eq!(url, "wss://relay.example.com:443/?v=4&encoding=json");
    }

    #[test]
    fn test_gateway_url_keeps_explicit_scheme() {
        // ---
        let url = credentials("ws://127.0.0.1:9000").gateway_url(4).expect("valid");
        assert_eq!(url, "ws://127.0.0.1:9000");
    }

    #[test]
    fn test_gateway_url_rejects_bad_input() {
        // ---
        assert!(credentials("relay:notaport").gateway_url(4).is_err());
        assert!(credentials(":443").gateway_url(4).is_err());
    }

    #[test]
    fn test_debug_hides_token() {
        // ---
        let text = format!("{:?}", credentials("relay"));
        assert!(!text.contains("secret-token"));
    }
}
