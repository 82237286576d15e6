//! Entry point: joins voice channels and routes signaling events.
//!
//! The host application owns the main gateway connection. It hands us a
//! [`Signaling`] implementation for outgoing voice-state updates and forwards
//! the two inbound events a connect waits for through
//! [`VoiceLink::handle_voice_state_update`] and
//! [`VoiceLink::handle_voice_server_update`].

use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use voicelink_common::MetricsContext;

use crate::config::VoiceLinkConfig;
use crate::connection::{ConnectionShared, LinkContext, VoiceConnection};
use crate::error::{Result, VoiceError};
use crate::events::EventHub;
use crate::registry::{PendingReceivers, SessionRegistry, VoiceServerInfo, VoiceStateInfo};
use crate::signaling::{
    ChannelKind, Credentials, MemberDirectory, Signaling, VoiceChannel, VoiceStateCommand,
    VoiceStateFlags,
};

/// Voice support for one bot or client identity.
pub struct VoiceLink {
    // ---
    link: LinkContext,
    registry: SessionRegistry,
}

impl VoiceLink {
    // ---
    /// Creates the extension with its own metrics registry.
    ///
    /// # Errors
    ///
    /// Fails if the metrics registry cannot be built.
    pub fn new(config: VoiceLinkConfig, signaling: Arc<dyn Signaling>) -> anyhow::Result<Self> {
        // ---
        let metrics = MetricsContext::new("voicelink")?;
        Ok(Self::with_metrics(config, signaling, metrics))
    }

    pub fn with_metrics(
        config: VoiceLinkConfig,
        signaling: Arc<dyn Signaling>,
        metrics: MetricsContext,
    ) -> Self {
        // ---
        let registry = SessionRegistry::new();
        let mut link = LinkContext::new(config, metrics);
        link.signaling = Some(signaling);
        link.registry = Some(registry.clone());
        Self { link, registry }
    }

    /// Resolves members for speaking notifications.
    pub fn with_directory(mut self, directory: Arc<dyn MemberDirectory>) -> Self {
        // ---
        self.link.directory = Some(directory);
        self
    }

    pub fn config(&self) -> &VoiceLinkConfig {
        // ---
        &self.link.config
    }

    /// Observer hub shared by every connection.
    pub fn events(&self) -> &EventHub {
        // ---
        &self.link.events
    }

    pub fn metrics(&self) -> &MetricsContext {
        // ---
        &self.link.metrics
    }

    pub fn registry(&self) -> &SessionRegistry {
        // ---
        &self.registry
    }

    pub fn connection(&self, server_id: u64) -> Option<Arc<VoiceConnection>> {
        // ---
        self.registry.get(server_id)
    }

    /// Joins `channel` and waits until audio can flow.
    ///
    /// # Arguments
    ///
    /// * `channel` - A voice or stage channel belonging to a server
    /// * `flags` - Initial mute/deaf state; `speaking` must be clear
    ///
    /// # Errors
    ///
    /// * [`VoiceError::Configuration`] if the request is invalid or the
    ///   server already has a connection
    /// * [`VoiceError::Timeout`] if the signaling events or the session
    ///   description do not arrive in time
    /// * [`VoiceError::ProtocolViolation`] if the relay endpoint is missing
    pub async fn connect(
        &self,
        channel: &VoiceChannel,
        flags: VoiceStateFlags,
    ) -> Result<Arc<VoiceConnection>> {
        // ---
        let server_id = validate(channel, flags)?;
        let pending = self.registry.begin_pending(server_id)?;
        let _pending = PendingGuard {
            registry: &self.registry,
            server_id,
        };
        debug!("Connection {}: joining channel {}", server_id, channel.id);

        let result = self.establish(channel, server_id, flags, pending).await;

        if let Err(e) = &result {
            warn!("Connection {}: connect failed: {}", server_id, e);
        }
        result
    }

    async fn establish(
        &self,
        channel: &VoiceChannel,
        server_id: u64,
        flags: VoiceStateFlags,
        pending: PendingReceivers,
    ) -> Result<Arc<VoiceConnection>> {
        // ---
        let signaling = self
            .link
            .signaling
            .as_ref()
            .ok_or_else(|| VoiceError::configuration("no signaling layer configured"))?;
        signaling
            .update_voice_state(VoiceStateCommand {
                server_id,
                channel_id: Some(channel.id),
                self_mute: flags.self_mute,
                self_deaf: flags.self_deaf,
            })
            .await
            .map_err(|e| VoiceError::Signaling(format!("{e:#}")))?;

        let both = async {
            let state = pending.state.await.map_err(|_| VoiceError::Closed)?;
            let server = pending.server.await.map_err(|_| VoiceError::Closed)?;
            Ok::<_, VoiceError>((state, server))
        };
        let (state, server) = timeout(self.link.config.signaling_timeout, both)
            .await
            .map_err(|_| VoiceError::Timeout("voice state and voice server updates"))??;

        let endpoint = server
            .endpoint
            .ok_or_else(|| VoiceError::protocol("voice server update carries no endpoint"))?;
        let credentials = Credentials {
            server_id,
            user_id: state.user_id,
            session_id: state.session_id,
            token: server.token,
            endpoint,
        };
        credentials.gateway_url(self.link.config.gateway_version)?;

        let shared = ConnectionShared::new(credentials, channel.id, self.link.clone());
        let connection = VoiceConnection::start(shared);
        self.registry.insert(Arc::clone(&connection));

        if let Err(e) = connection.wait_ready(self.link.config.ready_timeout).await {
            if let Err(leave) = connection.disconnect().await {
                debug!("Connection {}: leave after failed connect: {}", server_id, leave);
            }
            return Err(e);
        }

        if !connection.shared.announce_created() {
            return Err(VoiceError::Closed);
        }
        info!(
            "Connection {}: connected to channel {}",
            server_id, channel.id
        );
        Ok(connection)
    }

    /// Inbound hook: our own voice state changed.
    ///
    /// Completes a pending connect, or refreshes the session id of a live
    /// connection for its next resume.
    pub fn handle_voice_state_update(&self, server_id: u64, user_id: u64, session_id: String) {
        // ---
        if let Some(connection) = self.registry.get(server_id) {
            connection.update_session_id(session_id);
            return;
        }

        let info = VoiceStateInfo {
            user_id,
            session_id,
        };
        if !self.registry.fulfil_state(server_id, info) {
            debug!("Connection {}: voice state update with nobody waiting", server_id);
        }
    }

    /// Inbound hook: the voice server for `server_id` was (re)assigned.
    ///
    /// A `None` endpoint tears down an established connection; a new
    /// endpoint re-points it.
    pub fn handle_voice_server_update(&self, server_id: u64, token: String, endpoint: Option<String>) {
        // ---
        if let Some(connection) = self.registry.get(server_id) {
            match endpoint {
                Some(endpoint) => connection.repoint(token, endpoint),
                None => {
                    let err = VoiceError::protocol("voice server update carries no endpoint");
                    warn!("Connection {}: {}", server_id, err);
                    connection.destroy(err.to_string());
                }
            }
            return;
        }

        if !self
            .registry
            .fulfil_server(server_id, VoiceServerInfo { token, endpoint })
        {
            debug!("Connection {}: voice server update with nobody waiting", server_id);
        }
    }

    /// Leaves the voice channel of `server_id`, if connected.
    pub async fn disconnect(&self, server_id: u64) -> Result<()> {
        // ---
        match self.registry.get(server_id) {
            Some(connection) => connection.disconnect().await,
            None => Ok(()),
        }
    }
}

/// Clears the pending entry however the connect future ends.
struct PendingGuard<'a> {
    // ---
    registry: &'a SessionRegistry,
    server_id: u64,
}

impl Drop for PendingGuard<'_> {
    // ---
    fn drop(&mut self) {
        // ---
        self.registry.end_pending(self.server_id);
    }
}

/// Checks a connect request and returns its server id.
fn validate(channel: &VoiceChannel, flags: VoiceStateFlags) -> Result<u64> {
    // ---
    if !matches!(channel.kind, ChannelKind::Voice | ChannelKind::Stage) {
        return Err(VoiceError::configuration(format!(
            "channel {} is a {:?} channel, not a voice channel",
            channel.id, channel.kind
        )));
    }
    let server_id = channel.server_id.ok_or_else(|| {
        VoiceError::configuration(format!("channel {} does not belong to a server", channel.id))
    })?;
    if flags.speaking {
        return Err(VoiceError::configuration(
            "cannot be speaking before the connection exists",
        ));
    }
    Ok(server_id)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_validate_rejects_bad_requests() {
        // ---
        let flags = VoiceStateFlags::default();

        let text = VoiceChannel::new(1, 2, ChannelKind::Text);
        assert!(matches!(validate(&text, flags), Err(VoiceError::Configuration(_))));

        let mut orphan = VoiceChannel::new(1, 2, ChannelKind::Voice);
        orphan.server_id = None;
        assert!(matches!(validate(&orphan, flags), Err(VoiceError::Configuration(_))));

        let speaking = VoiceStateFlags {
            speaking: true,
            ..flags
        };
        let voice = VoiceChannel::new(1, 2, ChannelKind::Voice);
        assert!(matches!(validate(&voice, speaking), Err(VoiceError::Configuration(_))));

        let stage = VoiceChannel::new(1, 2, ChannelKind::Stage);
        assert_eq!(validate(&stage, flags).expect("valid"), 2);
    }
}
