//! Control-plane message handling for one voice session.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{SessionSignal, SessionState};
use crate::connection::ConnectionShared;
use crate::crypto::{EncryptionMode, SecretKey, VoiceCipher};
use crate::error::{Result, VoiceError};
use crate::events::{SpeakingEvent, VoiceEvent};
use crate::gateway::{
    spawn_heartbeat, unix_millis, ClientConnectedPayload, ClientDisconnectPayload,
    GatewayMessage, HeartbeatTracker, HelloPayload, IdentifyPayload, OpCode, ReadyPayload,
    ResumePayload, SelectProtocolPayload, SessionDescriptionPayload, SpeakingPayload,
};
use crate::media::{discover_external_address, MediaContext, MediaReceiver};
use crate::speaker::{SpeakerMap, SpeakerState, SpeakingFlags};

/// What the websocket loop should do after a message.
#[derive(Debug)]
pub(crate) enum Flow {
    Continue,
    /// Tear down this session and let the reconnect policy decide
    Reconnect(VoiceError),
}

/// UDP endpoint bound during Ready, waiting for the session description.
struct PendingMedia {
    // ---
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    ssrc: u32,
    mode: EncryptionMode,
}

/// Drives the handshake and reacts to relay messages.
pub(crate) struct GatewayDriver {
    // ---
    shared: Arc<ConnectionShared>,
    server_id: u64,
    generation: u64,
    state: SessionState,
    speakers: Arc<SpeakerMap>,
    outbound: mpsc::UnboundedSender<GatewayMessage>,
    signals: mpsc::UnboundedSender<SessionSignal>,
    heartbeat: Arc<Mutex<HeartbeatTracker>>,
    heartbeat_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    pending: Option<PendingMedia>,
    media: Option<Arc<MediaContext>>,
    reached_ready: bool,
}

impl GatewayDriver {
    // ---
    pub(crate) fn new(
        shared: Arc<ConnectionShared>,
        generation: u64,
        speakers: Arc<SpeakerMap>,
        signals: mpsc::UnboundedSender<SessionSignal>,
        cancel: CancellationToken,
    ) -> Self {
        // ---
        let config = shared.config();
        let heartbeat = HeartbeatTracker::new(
            config.max_heartbeat_queue_size,
            config.strict_heartbeat_ack,
        );
        // Replaced by attach() once a websocket is open.
        let (outbound, _) = mpsc::unbounded_channel();

        Self {
            server_id: shared.server_id,
            shared,
            generation,
            state: SessionState::None,
            speakers,
            outbound,
            signals,
            heartbeat: Arc::new(Mutex::new(heartbeat)),
            heartbeat_task: None,
            cancel,
            pending: None,
            media: None,
            reached_ready: false,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        // ---
        self.state
    }

    /// True once a session description has been accepted.
    pub(crate) fn reached_ready(&self) -> bool {
        // ---
        self.reached_ready
    }

    fn set_state(&mut self, state: SessionState) {
        // ---
        if self.state != state {
            debug!("Connection {}: {} -> {}", self.server_id, self.state, state);
            self.state = state;
            self.shared.state.send_replace(state);
        }
    }

    /// Points outgoing messages at a freshly opened websocket.
    pub(crate) fn attach(&mut self, outbound: mpsc::UnboundedSender<GatewayMessage>) {
        // ---
        self.shared.set_outbound(Some(outbound.clone()));
        self.outbound = outbound;
    }

    /// Stops per-websocket work after the socket has gone away.
    pub(crate) fn detach(&mut self) {
        // ---
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
        self.heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        self.shared.set_outbound(None);
    }

    /// Releases everything this session owns.
    pub(crate) fn shutdown(&mut self) {
        // ---
        self.detach();
        self.cancel.cancel();
        self.pending = None;

        if let Some(ctx) = self.media.take() {
            self.shared.media.send_if_modified(|current| {
                let ours = current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &ctx));
                if ours {
                    *current = None;
                }
                ours
            });
        }
        self.set_state(SessionState::None);
    }

    fn send<T: serde::Serialize>(&self, op: OpCode, payload: &T) -> Result<()> {
        // ---
        let msg = GatewayMessage::new(op, payload)?;
        self.outbound.send(msg).map_err(|_| VoiceError::Closed)
    }

    /// Sends Resume on the current websocket.
    pub(crate) fn begin_resume(&mut self) -> Result<()> {
        // ---
        let creds = self.shared.credentials();
        self.send(
            OpCode::Resume,
            &ResumePayload {
                server_id: creds.server_id,
                session_id: creds.session_id.clone(),
                token: creds.token.clone(),
            },
        )?;
        self.shared.link.metrics.resumes_total.inc();
        info!("Connection {}: resuming session", self.server_id);
        self.set_state(SessionState::Resuming);
        Ok(())
    }

    /// Applies one relay message, in arrival order.
    pub(crate) async fn handle(&mut self, msg: GatewayMessage) -> Flow {
        // ---
        let Some(op) = msg.opcode() else {
            debug!(
                "Connection {}: ignoring unknown opcode {}",
                self.server_id, msg.op
            );
            return Flow::Continue;
        };
        trace!("Connection {}: received {:?}", self.server_id, op);

        let result = match op {
            OpCode::Hello => self.on_hello(&msg),
            OpCode::Ready => self.on_ready(&msg).await,
            OpCode::SessionDescription => self.on_session_description(&msg),
            OpCode::HeartbeatAck => self.on_heartbeat_ack(&msg),
            OpCode::Resumed => self.on_resumed(),
            OpCode::Speaking => self.on_speaking(&msg),
            OpCode::ClientConnected => self.on_client_connected(&msg),
            OpCode::ClientDisconnect => self.on_client_disconnect(&msg),
            OpCode::Identify | OpCode::SelectProtocol | OpCode::Heartbeat | OpCode::Resume => {
                debug!(
                    "Connection {}: ignoring client opcode {:?} from relay",
                    self.server_id, op
                );
                Ok(())
            }
        };

        match result {
            Ok(()) => Flow::Continue,
            Err(e) if ends_session(op, &e) => {
                warn!("Connection {}: {:?} failed: {}", self.server_id, op, e);
                self.set_state(SessionState::None);
                Flow::Reconnect(e)
            }
            Err(e) => {
                warn!("Connection {}: ignoring bad {:?}: {}", self.server_id, op, e);
                Flow::Continue
            }
        }
    }

    fn on_hello(&mut self, msg: &GatewayMessage) -> Result<()> {
        // ---
        let hello: HelloPayload = msg.payload()?;
        let period = hello.interval();
        if period.is_zero() {
            return Err(VoiceError::protocol("Hello carries a zero heartbeat interval"));
        }
        self.start_heartbeat(period);

        if self.state == SessionState::Resuming {
            return Ok(());
        }

        let creds = self.shared.credentials();
        self.send(
            OpCode::Identify,
            &IdentifyPayload {
                server_id: creds.server_id,
                user_id: creds.user_id,
                session_id: creds.session_id.clone(),
                token: creds.token.clone(),
            },
        )?;
        info!("Connection {}: identifying", self.server_id);
        self.set_state(SessionState::Identify);
        Ok(())
    }

    fn start_heartbeat(&mut self, period: Duration) {
        // ---
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
        self.heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();

        self.heartbeat_task = Some(spawn_heartbeat(
            self.server_id,
            period,
            Arc::clone(&self.heartbeat),
            self.outbound.clone(),
            self.signals.clone(),
            self.cancel.child_token(),
        ));
    }

    async fn on_ready(&mut self, msg: &GatewayMessage) -> Result<()> {
        // ---
        if self.state != SessionState::Identify {
            warn!(
                "Connection {}: unexpected Ready in state {}",
                self.server_id, self.state
            );
            return Ok(());
        }

        let ready: ReadyPayload = msg.payload()?;
        let mode = self.negotiate_mode(&ready.modes)?;

        let remote = lookup_host((ready.ip.as_str(), ready.port))
            .await?
            .next()
            .ok_or_else(|| {
                VoiceError::protocol(format!("relay address {} did not resolve", ready.ip))
            })?;
        let local: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;

        let (address, port) = discover_external_address(
            &socket,
            remote,
            ready.ssrc,
            self.shared.config().ip_discovery_timeout,
        )
        .await?;
        info!(
            "Connection {}: relay {} sees us as {}:{} (ssrc {}, mode {})",
            self.server_id, remote, address, port, ready.ssrc, mode
        );

        self.send(
            OpCode::SelectProtocol,
            &SelectProtocolPayload::udp(address, port, mode.protocol_name()),
        )?;
        self.pending = Some(PendingMedia {
            socket: Arc::new(socket),
            remote,
            ssrc: ready.ssrc,
            mode,
        });
        self.set_state(SessionState::SelectProtocol);
        Ok(())
    }

    /// Keeps the configured mode when the relay offers it (or lists
    /// nothing), otherwise takes the first offered mode we support.
    fn negotiate_mode(&self, offered: &[String]) -> Result<EncryptionMode> {
        // ---
        let preferred = self.shared.config().encryption_mode;
        if offered.is_empty() || offered.iter().any(|m| m == preferred.protocol_name()) {
            return Ok(preferred);
        }

        offered
            .iter()
            .find_map(|m| EncryptionMode::from_protocol_name(m))
            .ok_or_else(|| {
                VoiceError::protocol(format!("relay offers no supported mode: {offered:?}"))
            })
    }

    fn on_session_description(&mut self, msg: &GatewayMessage) -> Result<()> {
        // ---
        if self.state != SessionState::SelectProtocol {
            warn!(
                "Connection {}: unexpected SessionDescription in state {}",
                self.server_id, self.state
            );
            return Ok(());
        }

        let description: SessionDescriptionPayload = msg.payload()?;
        let key = SecretKey::from_slice(&description.secret_key)?;
        let pending = self
            .pending
            .take()
            .ok_or_else(|| VoiceError::protocol("SessionDescription before UDP setup"))?;

        let mode = match EncryptionMode::from_protocol_name(&description.mode) {
            Some(mode) => mode,
            None => {
                return Err(VoiceError::protocol(format!(
                    "relay selected unsupported mode {:?}",
                    description.mode
                )))
            }
        };
        if mode != pending.mode {
            warn!(
                "Connection {}: relay chose {} over requested {}",
                self.server_id, mode, pending.mode
            );
        }

        let ctx = Arc::new(MediaContext {
            ssrc: pending.ssrc,
            key,
            cipher: Arc::new(VoiceCipher::new(mode)),
            socket: pending.socket,
            remote: pending.remote,
        });

        let receiver = MediaReceiver::new(
            self.server_id,
            Arc::clone(&ctx),
            Arc::clone(&self.speakers),
            self.shared.link.metrics.clone(),
        )
        .with_max_consecutive_codec_failures(self.shared.config().max_consecutive_codec_failures);
        tokio::spawn(receiver.run(self.cancel.child_token()));

        self.shared.media.send_replace(Some(Arc::clone(&ctx)));
        self.media = Some(ctx);
        self.reached_ready = true;
        self.set_state(SessionState::Heartbeating);
        self.shared.mark_ready(self.generation);
        info!("Connection {}: session ready ({})", self.server_id, mode);
        Ok(())
    }

    fn on_heartbeat_ack(&mut self, msg: &GatewayMessage) -> Result<()> {
        // ---
        let value = msg.nonce()?;
        let rtt = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .acknowledge(value, unix_millis())?;

        self.shared.set_ping(rtt);
        self.shared
            .link
            .metrics
            .heartbeat_rtt_seconds
            .observe(rtt.as_secs_f64());
        trace!("Connection {}: heartbeat ack after {:?}", self.server_id, rtt);
        Ok(())
    }

    fn on_resumed(&mut self) -> Result<()> {
        // ---
        if self.state == SessionState::Resuming {
            info!("Connection {}: session resumed", self.server_id);
            self.set_state(SessionState::Heartbeating);
        } else {
            debug!(
                "Connection {}: ignoring Resumed in state {}",
                self.server_id, self.state
            );
        }
        Ok(())
    }

    fn on_speaking(&mut self, msg: &GatewayMessage) -> Result<()> {
        // ---
        let payload: SpeakingPayload = msg.payload()?;
        let flags = SpeakingFlags::from_bits(payload.speaking);

        let (speaker, created) = match payload.user_id {
            Some(user_id) => self.speakers.upsert_identity(payload.ssrc, user_id),
            None => self.speakers.get_or_create(payload.ssrc),
        };
        speaker.set_speaking_flags(flags);
        if created {
            self.shared
                .link
                .metrics
                .set_active_speakers(self.server_id, self.speakers.len());
        }

        debug!(
            "Connection {}: ssrc {} speaking flags {} (user {:?})",
            self.server_id,
            payload.ssrc,
            flags.bits(),
            payload.user_id
        );
        self.notify_speaking(speaker, payload.user_id, flags);
        Ok(())
    }

    /// Resolves the member and fires UserSpeaking off the read loop.
    fn notify_speaking(&self, speaker: Arc<SpeakerState>, user_id: Option<u64>, flags: SpeakingFlags) {
        // ---
        let server_id = self.server_id;
        let events = self.shared.link.events.clone();
        let directory = self.shared.link.directory.clone();

        // Not awaited: a slow directory must not hold up later messages.
        tokio::spawn(async move {
            let member = match (directory, user_id) {
                (Some(directory), Some(user_id)) => directory.resolve_member(server_id, user_id).await,
                _ => None,
            };
            events.dispatch(VoiceEvent::UserSpeaking(SpeakingEvent {
                server_id,
                ssrc: speaker.ssrc(),
                user_id,
                flags,
                member,
                speaker,
            }));
        });
    }

    fn on_client_connected(&mut self, msg: &GatewayMessage) -> Result<()> {
        // ---
        let payload: ClientConnectedPayload = msg.payload()?;
        let ssrc = payload.audio_ssrc.filter(|&ssrc| ssrc != 0);
        if let Some(ssrc) = ssrc {
            self.speakers.upsert_identity(ssrc, payload.user_id);
        }

        debug!(
            "Connection {}: user {} connected (ssrc {:?})",
            self.server_id, payload.user_id, ssrc
        );
        self.shared.link.events.dispatch(VoiceEvent::UserConnected {
            server_id: self.server_id,
            user_id: payload.user_id,
            ssrc,
        });
        Ok(())
    }

    fn on_client_disconnect(&mut self, msg: &GatewayMessage) -> Result<()> {
        // ---
        let payload: ClientDisconnectPayload = msg.payload()?;
        let removed = self.speakers.remove_user(payload.user_id);
        self.shared
            .link
            .metrics
            .set_active_speakers(self.server_id, self.speakers.len());

        debug!(
            "Connection {}: user {} disconnected ({} speaker(s) dropped)",
            self.server_id,
            payload.user_id,
            removed.len()
        );
        self.shared.link.events.dispatch(VoiceEvent::UserDisconnected {
            server_id: self.server_id,
            user_id: payload.user_id,
        });
        Ok(())
    }
}

/// Handshake failures and protocol violations end the session; a malformed
/// notification does not.
fn ends_session(op: OpCode, err: &VoiceError) -> bool {
    // ---
    matches!(
        op,
        OpCode::Hello | OpCode::Ready | OpCode::SessionDescription | OpCode::HeartbeatAck
    ) || matches!(err, VoiceError::ProtocolViolation(_))
}
