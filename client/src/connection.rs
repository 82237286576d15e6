//! A voice connection to one server, kept alive across sessions.
//!
//! The connection owns a supervisor task that runs one [`VoiceSession`] at a
//! time. A session may resume itself after a dropped websocket; when it
//! cannot, the supervisor discards it and builds a fresh one from the same
//! credentials, with capped exponential backoff.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voicelink_common::MetricsContext;

use crate::config::VoiceLinkConfig;
use crate::error::{Result, VoiceError};
use crate::events::{EventHub, VoiceEvent};
use crate::gateway::{GatewayMessage, OpCode, SpeakingPayload};
use crate::media::{run_send_loop, MediaContext, MediaSender, PcmWriter};
use crate::registry::SessionRegistry;
use crate::session::{Readiness, SessionEnd, SessionState, VoiceSession};
use crate::signaling::{Credentials, MemberDirectory, Signaling, VoiceStateCommand};
use crate::speaker::{SpeakerMap, SpeakerState, SpeakingFlags};

const PING_UNKNOWN: u64 = u64::MAX;

/// Collaborators shared by every connection of one `VoiceLink`.
#[derive(Clone)]
pub(crate) struct LinkContext {
    // ---
    pub(crate) config: Arc<VoiceLinkConfig>,
    pub(crate) events: EventHub,
    pub(crate) directory: Option<Arc<dyn MemberDirectory>>,
    pub(crate) signaling: Option<Arc<dyn Signaling>>,
    pub(crate) metrics: MetricsContext,
    pub(crate) registry: Option<SessionRegistry>,
}

impl LinkContext {
    // ---
    pub(crate) fn new(config: VoiceLinkConfig, metrics: MetricsContext) -> Self {
        // ---
        Self {
            config: Arc::new(config),
            events: EventHub::new(),
            directory: None,
            signaling: None,
            metrics,
            registry: None,
        }
    }
}

/// State shared between the connection handle, its supervisor and the tasks
/// of the current session.
pub(crate) struct ConnectionShared {
    // ---
    pub(crate) server_id: u64,
    pub(crate) channel_id: u64,
    pub(crate) link: LinkContext,
    credentials: RwLock<Arc<Credentials>>,
    pub(crate) state: watch::Sender<SessionState>,
    pub(crate) readiness: watch::Sender<Readiness>,
    pub(crate) media: watch::Sender<Option<Arc<MediaContext>>>,
    speakers: RwLock<Arc<SpeakerMap>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<GatewayMessage>>>,
    ping_ms: AtomicU64,
    pub(crate) cancel: CancellationToken,
    /// Bumped on every relay reallocation
    pub(crate) repoint: watch::Sender<u64>,
    closed: AtomicBool,
    /// Set once "connection created" has fired
    announced: Mutex<bool>,
    audio_tx: mpsc::UnboundedSender<Bytes>,
    audio_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
}

impl ConnectionShared {
    // ---
    pub(crate) fn new(credentials: Credentials, channel_id: u64, link: LinkContext) -> Arc<Self> {
        // ---
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            server_id: credentials.server_id,
            channel_id,
            link,
            credentials: RwLock::new(Arc::new(credentials)),
            state: watch::Sender::new(SessionState::None),
            readiness: watch::Sender::new(Readiness::default()),
            media: watch::Sender::new(None),
            speakers: RwLock::new(Arc::new(SpeakerMap::new())),
            outbound: Mutex::new(None),
            ping_ms: AtomicU64::new(PING_UNKNOWN),
            cancel: CancellationToken::new(),
            repoint: watch::Sender::new(0),
            closed: AtomicBool::new(false),
            announced: Mutex::new(false),
            audio_tx,
            audio_rx: Mutex::new(Some(audio_rx)),
        })
    }

    pub(crate) fn config(&self) -> &VoiceLinkConfig {
        // ---
        &self.link.config
    }

    pub(crate) fn credentials(&self) -> Arc<Credentials> {
        // ---
        Arc::clone(&self.credentials.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn speakers(&self) -> Arc<SpeakerMap> {
        // ---
        Arc::clone(&self.speakers.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Re-arms readiness and swaps in an empty speaker map for a new session.
    pub(crate) fn begin_attempt(&self, generation: u64) -> Arc<SpeakerMap> {
        // ---
        self.readiness.send_replace(Readiness {
            generation,
            ready: false,
        });

        let fresh = Arc::new(SpeakerMap::new());
        let old = std::mem::replace(
            &mut *self.speakers.write().unwrap_or_else(PoisonError::into_inner),
            Arc::clone(&fresh),
        );
        old.close_all();
        self.link.metrics.set_active_speakers(self.server_id, 0);
        fresh
    }

    /// Marks `generation` ready; ignored if a newer attempt has started.
    pub(crate) fn mark_ready(&self, generation: u64) {
        // ---
        self.readiness.send_if_modified(|r| {
            if r.generation == generation && !r.ready {
                r.ready = true;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn set_outbound(&self, outbound: Option<mpsc::UnboundedSender<GatewayMessage>>) {
        // ---
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = outbound;
    }

    pub(crate) fn send_gateway(&self, msg: GatewayMessage) -> Result<()> {
        // ---
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .ok_or(VoiceError::Closed)?
            .send(msg)
            .map_err(|_| VoiceError::Closed)
    }

    pub(crate) fn set_ping(&self, rtt: Duration) {
        // ---
        self.ping_ms.store(rtt.as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn update_credentials(&self, update: impl FnOnce(&mut Credentials)) {
        // ---
        let mut slot = self.credentials.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Credentials::clone(&slot);
        update(&mut next);
        *slot = Arc::new(next);
    }

    pub(crate) fn is_closed(&self) -> bool {
        // ---
        self.closed.load(Ordering::Acquire)
    }

    /// Fires "connection created" unless the connection is already gone.
    pub(crate) fn announce_created(&self) -> bool {
        // ---
        let mut announced = self.announced.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return false;
        }

        *announced = true;
        self.link.events.dispatch(VoiceEvent::ConnectionCreated {
            server_id: self.server_id,
            channel_id: self.channel_id,
        });
        true
    }

    /// Releases everything. Runs once.
    ///
    /// "Connection destroyed" fires only for a connection whose creation was
    /// announced, so a connect that fails stays silent.
    pub(crate) fn finish(&self, reason: String) {
        // ---
        let announced = {
            let announced = self.announced.lock().unwrap_or_else(PoisonError::into_inner);
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            *announced
        };

        self.cancel.cancel();
        self.speakers().close_all();
        self.media.send_replace(None);
        self.state.send_replace(SessionState::None);
        self.set_outbound(None);
        self.link.metrics.clear_active_speakers(self.server_id);

        if let Some(registry) = &self.link.registry {
            registry.remove_connection(self.server_id, self);
        }

        info!("Connection {}: destroyed ({})", self.server_id, reason);
        if announced {
            self.link.events.dispatch(VoiceEvent::ConnectionDestroyed {
                server_id: self.server_id,
                reason,
            });
        }
    }
}

/// Handle to an established voice connection.
pub struct VoiceConnection {
    // ---
    pub(crate) shared: Arc<ConnectionShared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl VoiceConnection {
    // ---
    /// Starts the supervisor for `shared`.
    pub(crate) fn start(shared: Arc<ConnectionShared>) -> Arc<Self> {
        // ---
        let task = tokio::spawn(supervise(Arc::clone(&shared)));
        Arc::new(Self {
            shared,
            supervisor: Mutex::new(Some(task)),
        })
    }

    pub fn server_id(&self) -> u64 {
        // ---
        self.shared.server_id
    }

    pub fn channel_id(&self) -> u64 {
        // ---
        self.shared.channel_id
    }

    pub fn state(&self) -> SessionState {
        // ---
        *self.shared.state.borrow()
    }

    /// Watches session state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        // ---
        self.shared.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        // ---
        self.shared.is_closed()
    }

    /// Last measured gateway heartbeat round trip.
    pub fn ping(&self) -> Option<Duration> {
        // ---
        match self.shared.ping_ms.load(Ordering::Relaxed) {
            PING_UNKNOWN => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Our own SSRC in the current session.
    pub fn ssrc(&self) -> Option<u32> {
        // ---
        self.shared.media.borrow().as_ref().map(|ctx| ctx.ssrc)
    }

    /// Speakers of the current session.
    pub fn speakers(&self) -> Vec<Arc<SpeakerState>> {
        // ---
        self.shared.speakers().snapshot()
    }

    pub fn speaker(&self, ssrc: u32) -> Option<Arc<SpeakerState>> {
        // ---
        self.shared.speakers().get(ssrc)
    }

    pub fn speaker_for_user(&self, user_id: u64) -> Option<Arc<SpeakerState>> {
        // ---
        self.shared.speakers().find_by_user(user_id)
    }

    /// Waits until the current session attempt has its session description.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Timeout`] if `wait` elapses and
    /// [`VoiceError::Closed`] if the connection is torn down first.
    pub async fn wait_ready(&self, wait: Duration) -> Result<()> {
        // ---
        let mut readiness = self.shared.readiness.subscribe();
        let ready = async {
            readiness
                .wait_for(|r| r.ready)
                .await
                .map(|_| ())
                .map_err(|_| VoiceError::Closed)
        };

        tokio::select! {
            _ = self.shared.cancel.cancelled() => Err(VoiceError::Closed),
            result = timeout(wait, ready) => {
                result.map_err(|_| VoiceError::Timeout("session description"))?
            }
        }
    }

    /// Producer end of the outbound audio pipe.
    pub fn audio_input(&self) -> PcmWriter {
        // ---
        PcmWriter::new(self.shared.audio_tx.clone())
    }

    /// Announces that we are speaking and starts transmitting queued PCM.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Closed`] if no session is ready.
    pub fn start_speaking(&self) -> Result<()> {
        // ---
        self.send_speaking(SpeakingFlags::MICROPHONE)?;
        self.ensure_send_loop()
    }

    /// Clears our speaking indicator. Queued PCM keeps flowing.
    pub fn stop_speaking(&self) -> Result<()> {
        // ---
        self.send_speaking(SpeakingFlags::NONE)
    }

    /// Leaves the channel and releases every resource.
    ///
    /// No reconnect is attempted. Speakers' PCM streams end, the signaling
    /// layer is told to leave, and "connection destroyed" fires.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Signaling`] if the leave request fails; local
    /// resources are released regardless.
    pub async fn disconnect(&self) -> Result<()> {
        // ---
        if self.shared.is_closed() {
            return Ok(());
        }

        info!("Connection {}: disconnecting", self.shared.server_id);
        self.shared.cancel.cancel();

        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = supervisor {
            let _ = task.await;
        }

        let left = match &self.shared.link.signaling {
            Some(signaling) => {
                signaling
                    .update_voice_state(VoiceStateCommand {
                        server_id: self.shared.server_id,
                        channel_id: None,
                        self_mute: false,
                        self_deaf: false,
                    })
                    .await
            }
            None => Ok(()),
        };

        self.shared.finish("disconnected locally".to_string());
        left.map_err(|e| VoiceError::Signaling(format!("{e:#}")))
    }

    /// Switches to a reallocated relay; the current session is replaced by a
    /// full reconnect using the new token and endpoint.
    pub(crate) fn repoint(&self, token: String, endpoint: String) {
        // ---
        info!(
            "Connection {}: voice server moved to {}",
            self.shared.server_id, endpoint
        );
        self.shared.update_credentials(|creds| {
            creds.token = token;
            creds.endpoint = endpoint;
        });
        self.shared.repoint.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub(crate) fn update_session_id(&self, session_id: String) {
        // ---
        self.shared.update_credentials(|creds| creds.session_id = session_id);
    }

    /// Tears the connection down without a reconnect.
    pub(crate) fn destroy(&self, reason: String) {
        // ---
        self.shared.finish(reason);
    }

    fn send_speaking(&self, flags: SpeakingFlags) -> Result<()> {
        // ---
        let ssrc = self.ssrc().ok_or(VoiceError::Closed)?;
        let payload = SpeakingPayload {
            user_id: None,
            ssrc,
            speaking: flags.bits(),
            delay: 0,
        };
        self.shared
            .send_gateway(GatewayMessage::new(OpCode::Speaking, &payload)?)?;
        debug!(
            "Connection {}: speaking flags set to {}",
            self.shared.server_id,
            flags.bits()
        );
        Ok(())
    }

    fn ensure_send_loop(&self) -> Result<()> {
        // ---
        let mut slot = self
            .shared
            .audio_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            return Ok(());
        }

        let sender = MediaSender::new(self.shared.server_id, self.shared.link.metrics.clone())?;
        if let Some(pcm_rx) = slot.take() {
            tokio::spawn(run_send_loop(
                sender,
                pcm_rx,
                self.shared.media.subscribe(),
                self.shared.cancel.clone(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for VoiceConnection {
    // ---
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ---
        f.debug_struct("VoiceConnection")
            .field("server_id", &self.shared.server_id)
            .field("channel_id", &self.shared.channel_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Runs sessions until a local disconnect, a fatal close, or the reconnect
/// budget runs out.
async fn supervise(shared: Arc<ConnectionShared>) {
    // ---
    let server_id = shared.server_id;
    let mut generation = 0u64;
    let mut attempt = 0u32;

    let failure = loop {
        generation += 1;
        let speakers = shared.begin_attempt(generation);
        let mut session = VoiceSession::new(Arc::clone(&shared), generation, speakers);

        let end = session.run().await;
        if session.reached_ready() {
            attempt = 0;
        }

        match end {
            SessionEnd::Disconnected => break None,
            SessionEnd::Fatal(reason) => break Some(reason),
            SessionEnd::Reconnect(reason) => {
                attempt += 1;
                if attempt > shared.config().max_reconnect_attempts {
                    break Some(format!(
                        "gave up after {} reconnect attempts: {}",
                        attempt - 1,
                        reason
                    ));
                }

                shared.link.metrics.reconnects_total.inc();
                let delay = shared.config().backoff_for(attempt);
                warn!(
                    "Connection {}: reconnecting in {:?} (attempt {}): {}",
                    server_id, delay, attempt, reason
                );

                tokio::select! {
                    _ = shared.cancel.cancelled() => break None,
                    _ = sleep(delay) => {}
                }
            }
        }
    };

    if let Some(reason) = failure {
        shared.finish(reason);
    }
    debug!("Connection {}: supervisor stopped", server_id);
}
