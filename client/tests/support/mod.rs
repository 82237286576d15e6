//! Mock relay for integration tests.
//!
//! Speaks just enough of the gateway protocol to take a client through the
//! handshake and resume, and answers IP discovery on a local UDP socket.
//! Tests drive it with [`MockRelay::send`], [`MockRelay::abort`] and
//! [`MockRelay::close`], and observe what the client sent through
//! [`MockRelay::next_op`] and [`MockRelay::next_datagram`].

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use voicelink::codec::{OpusEncoder, MAX_BUFFER_SIZE, MAX_OPUS_PACKET_SIZE, SAMPLE_RATE};
use voicelink::gateway::{GatewayMessage, OpCode};
use voicelink::signaling::BoxFuture;
use voicelink::{
    EncryptionMode, SecretKey, Signaling, VoiceCipher, VoiceLink, VoiceLinkConfig,
    VoiceStateCommand,
};
use voicelink_common::ip_discovery::{IP_DISCOVERY_REQUEST, IP_DISCOVERY_RESPONSE, IP_DISCOVERY_SIZE};
use voicelink_common::{IpDiscoveryPacket, MetricsContext, RtpHeader};

/// SSRC the relay assigns to the client.
pub const CLIENT_SSRC: u32 = 1111;
pub const SERVER_ID: u64 = 500;
pub const CHANNEL_ID: u64 = 600;
pub const USER_ID: u64 = 700;
pub const SESSION_ID: &str = "session-1";
pub const TOKEN: &str = "token-1";
pub const KEY: [u8; 32] = [7u8; 32];

const WAIT: Duration = Duration::from_secs(5);

enum Control {
    Send(GatewayMessage),
    Close(u16),
    Abort,
}

struct RelayShared {
    // ---
    control: Mutex<Option<mpsc::UnboundedSender<Control>>>,
    events: mpsc::UnboundedSender<GatewayMessage>,
    datagrams: mpsc::UnboundedSender<Vec<u8>>,
    client_addr: Mutex<Option<SocketAddr>>,
    connections: AtomicUsize,
    ignore_resume: AtomicBool,
    udp_port: u16,
}

pub struct MockRelay {
    // ---
    pub endpoint: String,
    shared: Arc<RelayShared>,
    udp: Arc<UdpSocket>,
    events: mpsc::UnboundedReceiver<GatewayMessage>,
    datagrams: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MockRelay {
    // ---
    pub async fn start() -> Self {
        // ---
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind gateway");
        let endpoint = format!("ws://{}", listener.local_addr().expect("gateway addr"));
        let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.expect("bind udp"));

        let (events_tx, events) = mpsc::unbounded_channel();
        let (datagrams_tx, datagrams) = mpsc::unbounded_channel();
        let shared = Arc::new(RelayShared {
            control: Mutex::new(None),
            events: events_tx,
            datagrams: datagrams_tx,
            client_addr: Mutex::new(None),
            connections: AtomicUsize::new(0),
            ignore_resume: AtomicBool::new(false),
            udp_port: udp.local_addr().expect("udp addr").port(),
        });

        tokio::spawn(accept_loop(listener, Arc::clone(&shared)));
        tokio::spawn(udp_loop(Arc::clone(&udp), Arc::clone(&shared)));

        Self {
            endpoint,
            shared,
            udp,
            events,
            datagrams,
        }
    }

    /// Websocket connections accepted so far.
    pub fn connections(&self) -> usize {
        // ---
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub fn send(&self, op: OpCode, d: Value) {
        // ---
        self.control(Control::Send(GatewayMessage { op: op as u8, d }));
    }

    /// Leaves later Resume requests unanswered.
    pub fn ignore_resume(&self) {
        // ---
        self.shared.ignore_resume.store(true, Ordering::SeqCst);
    }

    /// Drops the current websocket without a close frame.
    pub fn abort(&self) {
        // ---
        self.control(Control::Abort);
    }

    pub fn close(&self, code: u16) {
        // ---
        self.control(Control::Close(code));
    }

    fn control(&self, control: Control) {
        // ---
        let guard = self.shared.control.lock().expect("control lock");
        guard
            .as_ref()
            .expect("client connected")
            .send(control)
            .unwrap_or_else(|_| panic!("connection handler gone"));
    }

    /// Next client message with opcode `op`, skipping others.
    pub async fn next_op(&mut self, op: OpCode) -> GatewayMessage {
        // ---
        timeout(WAIT, async {
            loop {
                let msg = self.events.recv().await.expect("relay running");
                if msg.op == op as u8 {
                    return msg;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {op:?} from client"))
    }

    /// Client messages received so far, without waiting.
    pub fn drain_ops(&mut self) -> Vec<u8> {
        // ---
        let mut ops = Vec::new();
        while let Ok(msg) = self.events.try_recv() {
            ops.push(msg.op);
        }
        ops
    }

    /// Next non-discovery datagram from the client.
    pub async fn next_datagram(&mut self) -> Vec<u8> {
        // ---
        timeout(WAIT, self.datagrams.recv())
            .await
            .expect("datagram within timeout")
            .expect("relay running")
    }

    /// Sends a raw datagram to the client's media socket.
    pub async fn send_udp(&self, datagram: &[u8]) {
        // ---
        let addr = self
            .shared
            .client_addr
            .lock()
            .expect("addr lock")
            .expect("client discovered");
        self.udp.send_to(datagram, addr).await.expect("send udp");
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<RelayShared>) {
    // ---
    while let Ok((stream, _)) = listener.accept().await {
        let Ok(ws) = accept_async(stream).await else {
            continue;
        };
        shared.connections.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve(ws, Arc::clone(&shared)));
    }
}

async fn serve(ws: WebSocketStream<tokio::net::TcpStream>, shared: Arc<RelayShared>) {
    // ---
    let (mut sink, mut stream) = ws.split();
    let (control_tx, mut control) = mpsc::unbounded_channel();
    *shared.control.lock().expect("control lock") = Some(control_tx);

    let hello = GatewayMessage {
        op: OpCode::Hello as u8,
        d: json!({ "heartbeat_interval": 60000.0 }),
    };
    if send(&mut sink, &hello).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            command = control.recv() => match command {
                Some(Control::Send(msg)) => {
                    if send(&mut sink, &msg).await.is_err() {
                        return;
                    }
                }
                Some(Control::Close(code)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: "".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    return;
                }
                Some(Control::Abort) | None => return,
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let msg = GatewayMessage::from_json(&text).expect("client sends valid JSON");
                    let _ = shared.events.send(msg.clone());
                    if let Some(reply) = respond(&msg, &shared) {
                        if send(&mut sink, &reply).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
        }
    }
}

fn respond(msg: &GatewayMessage, shared: &RelayShared) -> Option<GatewayMessage> {
    // ---
    let udp_port = shared.udp_port;
    let (op, d) = match msg.opcode()? {
        OpCode::Identify => (
            OpCode::Ready,
            json!({
                "ssrc": CLIENT_SSRC,
                "ip": "127.0.0.1",
                "port": udp_port,
                "modes": ["xsalsa20_poly1305", "xsalsa20_poly1305_suffix", "xsalsa20_poly1305_lite"],
            }),
        ),
        OpCode::SelectProtocol => (
            OpCode::SessionDescription,
            json!({ "mode": msg.d["data"]["mode"], "secret_key": KEY.to_vec() }),
        ),
        OpCode::Heartbeat => (OpCode::HeartbeatAck, msg.d.clone()),
        OpCode::Resume if shared.ignore_resume.load(Ordering::SeqCst) => return None,
        OpCode::Resume => (OpCode::Resumed, Value::Null),
        _ => return None,
    };
    Some(GatewayMessage { op: op as u8, d })
}

async fn send<S>(sink: &mut S, msg: &GatewayMessage) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    // ---
    let text = msg.to_json().map_err(|_| ())?;
    sink.send(Message::Text(text)).await.map_err(|_| ())
}

async fn udp_loop(udp: Arc<UdpSocket>, shared: Arc<RelayShared>) {
    // ---
    let mut buf = vec![0u8; 2048];
    while let Ok((len, from)) = udp.recv_from(&mut buf).await {
        let datagram = &buf[..len];
        if len == IP_DISCOVERY_SIZE {
            if let Ok(request) = IpDiscoveryPacket::decode(datagram) {
                if request.packet_type == IP_DISCOVERY_REQUEST {
                    *shared.client_addr.lock().expect("addr lock") = Some(from);
                    let reply = IpDiscoveryPacket {
                        packet_type: IP_DISCOVERY_RESPONSE,
                        address: from.ip().to_string(),
                        port: from.port(),
                        ..request
                    };
                    let _ = udp.send_to(&reply.encode(), from).await;
                    continue;
                }
            }
        }
        let _ = shared.datagrams.send(datagram.to_vec());
    }
}

/// One 20 ms frame of a 440 Hz tone, encoded.
pub fn encoded_tone() -> Vec<u8> {
    // ---
    let mut pcm = Vec::with_capacity(MAX_BUFFER_SIZE);
    for i in 0..MAX_BUFFER_SIZE / 4 {
        let t = i as f32 / SAMPLE_RATE as f32;
        let sample = ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 8000.0) as i16;
        pcm.extend_from_slice(&sample.to_le_bytes());
        pcm.extend_from_slice(&sample.to_le_bytes());
    }

    let mut encoder = OpusEncoder::new().expect("encoder");
    let mut out = vec![0u8; MAX_OPUS_PACKET_SIZE];
    let len = encoder.encode(&pcm, &mut out).expect("encode");
    out.truncate(len);
    out
}

/// A sealed RTP audio datagram.
pub fn sealed_rtp(cipher: &VoiceCipher, key: &SecretKey, sequence: u16, ssrc: u32, opus: &[u8]) -> Vec<u8> {
    // ---
    let mut packet = RtpHeader::new(sequence, u32::from(sequence) * 960, ssrc)
        .encode()
        .to_vec();
    cipher.seal(ssrc, &mut packet, opus, key).expect("seal");
    packet
}

pub fn relay_cipher() -> (VoiceCipher, SecretKey) {
    // ---
    (VoiceCipher::new(EncryptionMode::Lite), SecretKey::new(KEY))
}

/// Signaling stand-in that answers joins with the relay's credentials and
/// reports every command it was given.
pub struct TestSignaling {
    // ---
    commands: mpsc::UnboundedSender<VoiceStateCommand>,
}

impl Signaling for TestSignaling {
    // ---
    fn update_voice_state(&self, command: VoiceStateCommand) -> BoxFuture<'_, anyhow::Result<()>> {
        // ---
        let sent = self
            .commands
            .send(command)
            .map_err(|_| anyhow::anyhow!("responder stopped"));
        Box::pin(async move { sent })
    }
}

/// Builds a `VoiceLink` whose signaling points at `endpoint`.
///
/// Leave commands (`channel_id: None`) are forwarded on the returned
/// receiver.
pub fn voice_link(
    endpoint: &str,
    config: VoiceLinkConfig,
) -> (Arc<VoiceLink>, mpsc::UnboundedReceiver<VoiceStateCommand>) {
    // ---
    answering_link(Some(endpoint.to_string()), config)
}

/// Like [`voice_link`], but the voice-server update carries no endpoint.
pub fn endpointless_link(config: VoiceLinkConfig) -> Arc<VoiceLink> {
    // ---
    answering_link(None, config).0
}

/// A `VoiceLink` whose signaling layer accepts requests and never answers.
pub fn silent_link(config: VoiceLinkConfig) -> Arc<VoiceLink> {
    // ---
    let (commands, mut requests) = mpsc::unbounded_channel();
    tokio::spawn(async move { while requests.recv().await.is_some() {} });
    let metrics = MetricsContext::new("integration").expect("metrics");
    Arc::new(VoiceLink::with_metrics(
        config,
        Arc::new(TestSignaling { commands }),
        metrics,
    ))
}

fn answering_link(
    endpoint: Option<String>,
    config: VoiceLinkConfig,
) -> (Arc<VoiceLink>, mpsc::UnboundedReceiver<VoiceStateCommand>) {
    // ---
    let (commands, mut requests) = mpsc::unbounded_channel();
    let (leaves_tx, leaves) = mpsc::unbounded_channel();
    let metrics = MetricsContext::new("integration").expect("metrics");
    let link = Arc::new(VoiceLink::with_metrics(
        config,
        Arc::new(TestSignaling { commands }),
        metrics,
    ));

    let weak = Arc::downgrade(&link);
    tokio::spawn(async move {
        while let Some(command) = requests.recv().await {
            let Some(link) = weak.upgrade() else { break };
            if command.channel_id.is_none() {
                let _ = leaves_tx.send(command);
                continue;
            }
            link.handle_voice_state_update(command.server_id, USER_ID, SESSION_ID.to_string());
            link.handle_voice_server_update(command.server_id, TOKEN.to_string(), endpoint.clone());
        }
    });

    (link, leaves)
}
