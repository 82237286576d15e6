//! Websocket ownership and the resume-or-reconnect policy.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Flow, GatewayDriver, SessionSignal, SessionState};
use crate::connection::ConnectionShared;
use crate::error::VoiceError;
use crate::gateway::GatewayMessage;
use crate::speaker::SpeakerMap;

/// Authentication rejected.
const CLOSE_AUTHENTICATION_FAILED: u16 = 4004;
/// Session no longer valid; identify from scratch.
const CLOSE_SESSION_INVALID: u16 = 4006;
/// Removed from the channel (kicked, moved or channel deleted).
const CLOSE_DISCONNECTED: u16 = 4014;

/// How a session ended.
#[derive(Debug)]
pub(crate) enum SessionEnd {
    /// Local disconnect
    Disconnected,
    /// Start over with a new session
    Reconnect(String),
    /// The relay will not take us back
    Fatal(String),
}

/// How one websocket ended.
#[derive(Debug)]
enum SocketEnd {
    Cancelled,
    Repointed,
    Closed(Option<u16>),
    Failed(VoiceError),
}

#[derive(Debug, PartialEq, Eq)]
enum CloseAction {
    Resume,
    Reconnect,
    Fatal,
}

fn classify_close(code: Option<u16>) -> CloseAction {
    // ---
    match code {
        Some(CLOSE_AUTHENTICATION_FAILED) | Some(CLOSE_DISCONNECTED) => CloseAction::Fatal,
        Some(CLOSE_SESSION_INVALID) => CloseAction::Reconnect,
        _ => CloseAction::Resume,
    }
}

/// One voice session: a handshake plus any number of resumes.
pub(crate) struct VoiceSession {
    // ---
    shared: Arc<ConnectionShared>,
    driver: GatewayDriver,
    signals: mpsc::UnboundedReceiver<SessionSignal>,
    repoint: watch::Receiver<u64>,
    cancel: CancellationToken,
}

impl VoiceSession {
    // ---
    pub(crate) fn new(shared: Arc<ConnectionShared>, generation: u64, speakers: Arc<SpeakerMap>) -> Self {
        // ---
        let cancel = shared.cancel.child_token();
        let repoint = shared.repoint.subscribe();
        let (signals_tx, signals) = mpsc::unbounded_channel();
        let driver = GatewayDriver::new(
            Arc::clone(&shared),
            generation,
            speakers,
            signals_tx,
            cancel.clone(),
        );

        Self {
            shared,
            driver,
            signals,
            repoint,
            cancel,
        }
    }

    pub(crate) fn reached_ready(&self) -> bool {
        // ---
        self.driver.reached_ready()
    }

    /// Runs until the session cannot continue on its own.
    pub(crate) async fn run(&mut self) -> SessionEnd {
        // ---
        let server_id = self.shared.server_id;
        let mut resume = false;

        let end = loop {
            let socket_end = self.run_socket(resume).await;
            let state = self.driver.state();
            self.driver.detach();

            match socket_end {
                SocketEnd::Cancelled => break SessionEnd::Disconnected,
                SocketEnd::Repointed => break SessionEnd::Reconnect("voice server changed".to_string()),
                SocketEnd::Failed(e) => break SessionEnd::Reconnect(e.to_string()),
                SocketEnd::Closed(code) => {
                    let reason = match code {
                        Some(code) => format!("websocket closed with code {code}"),
                        None => "websocket closed".to_string(),
                    };
                    match classify_close(code) {
                        CloseAction::Fatal => break SessionEnd::Fatal(reason),
                        CloseAction::Reconnect => break SessionEnd::Reconnect(reason),
                        CloseAction::Resume if state == SessionState::Heartbeating => {
                            warn!("Connection {}: {}, resuming", server_id, reason);
                            resume = true;
                        }
                        CloseAction::Resume => break SessionEnd::Reconnect(reason),
                    }
                }
            }
        };

        self.driver.shutdown();
        debug!("Connection {}: session ended: {:?}", server_id, end);
        end
    }

    async fn run_socket(&mut self, resume: bool) -> SocketEnd {
        // ---
        let server_id = self.shared.server_id;
        let url = match self
            .shared
            .credentials()
            .gateway_url(self.shared.config().gateway_version)
        {
            Ok(url) => url,
            Err(e) => return SocketEnd::Failed(e),
        };

        debug!("Connection {}: connecting to {}", server_id, url);
        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return SocketEnd::Cancelled,
            Ok(()) = self.repoint.changed() => return SocketEnd::Repointed,
            r = timeout(self.shared.config().ready_timeout, connect_async(url.as_str())) => r,
        };
        let ws = match connected {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => return SocketEnd::Failed(e.into()),
            Err(_) => return SocketEnd::Failed(VoiceError::Timeout("websocket connect")),
        };
        info!("Connection {}: websocket open", server_id);

        let (mut sink, mut stream) = ws.split();
        let (outbound_tx, mut outbound) = mpsc::unbounded_channel::<GatewayMessage>();
        self.driver.attach(outbound_tx);

        if resume {
            if let Err(e) = self.driver.begin_resume() {
                return SocketEnd::Failed(e);
            }
        }

        let end = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break SocketEnd::Cancelled,
                Ok(()) = self.repoint.changed() => break SocketEnd::Repointed,
                Some(signal) = self.signals.recv() => match signal {
                    SessionSignal::HeartbeatOverdue(e) => break SocketEnd::Failed(e),
                },
                Some(msg) = outbound.recv() => {
                    let text = match msg.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Connection {}: dropping unserializable message: {}", server_id, e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        break SocketEnd::Failed(e.into());
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let msg = match GatewayMessage::from_json(&text) {
                            Ok(msg) => msg,
                            Err(e) => {
                                warn!("Connection {}: unparseable frame: {}", server_id, e);
                                continue;
                            }
                        };
                        let flow = tokio::select! {
                            _ = self.cancel.cancelled() => break SocketEnd::Cancelled,
                            Ok(()) = self.repoint.changed() => break SocketEnd::Repointed,
                            flow = self.driver.handle(msg) => flow,
                        };
                        if let Flow::Reconnect(e) = flow {
                            break SocketEnd::Failed(e);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code));
                        info!("Connection {}: relay closed the websocket ({:?})", server_id, code);
                        return SocketEnd::Closed(code);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Connection {}: websocket error: {}", server_id, e);
                        return SocketEnd::Closed(None);
                    }
                    None => return SocketEnd::Closed(None),
                },
            }
        };

        // Locally initiated end.
        let close = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        if let Err(e) = sink.send(Message::Close(Some(close))).await {
            debug!("Connection {}: close frame not sent: {}", server_id, e);
        }
        end
    }
}
