//! Voice relay client - CLI binary.
//!
//! Joins a relay with statically supplied credentials, records every speaker
//! to `<output-dir>/<ssrc>.pcm` (48 kHz stereo s16le) and optionally
//! transmits a raw PCM file in the same format.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use voicelink::signaling::BoxFuture;
use voicelink::{
    ChannelKind, EncryptionMode, EventKind, PcmStream, Signaling, VoiceChannel, VoiceEvent,
    VoiceLink, VoiceLinkConfig, VoiceStateCommand, VoiceStateFlags,
};
use voicelink_common::{init_tracing, ColorWhen, MetricsContext, MetricsServerConfig};

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum ModeArg {
    Normal,
    Lite,
    Suffix,
}

impl From<ModeArg> for EncryptionMode {
    fn from(v: ModeArg) -> Self {
        match v {
            ModeArg::Normal => EncryptionMode::Normal,
            ModeArg::Lite => EncryptionMode::Lite,
            ModeArg::Suffix => EncryptionMode::Suffix,
        }
    }
}

/// Voice relay client - join a voice session and record its speakers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Relay endpoint, `host[:port]` or a full ws:// / wss:// URL
    #[arg(short, long)]
    endpoint: String,

    /// Server the voice channel belongs to
    #[arg(long)]
    server_id: u64,

    /// Voice channel to join
    #[arg(long)]
    channel_id: u64,

    /// Our own user id
    #[arg(long)]
    user_id: u64,

    /// Session id issued by the signaling layer
    #[arg(long)]
    session_id: String,

    /// Voice token issued by the signaling layer
    #[arg(long)]
    token: String,

    /// Directory receiving one raw PCM file per speaker
    #[arg(short, long, default_value = "voice-out")]
    output_dir: PathBuf,

    /// Raw 48 kHz stereo s16le file to transmit after joining
    #[arg(short, long)]
    play: Option<PathBuf>,

    /// Encryption mode to request
    #[arg(long, value_enum, default_value = "lite")]
    mode: ModeArg,

    /// Heartbeats allowed in flight before the session is reset
    #[arg(long, default_value = "5")]
    max_heartbeat_queue: usize,

    /// Full reconnects attempted before giving up
    #[arg(long, default_value = "5")]
    reconnect_attempts: u32,

    /// Seconds to wait for the session to become ready
    #[arg(long, default_value = "10")]
    ready_timeout_secs: u64,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long, default_value = "127.0.0.1:9100")]
    metrics_bind: String,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorWhen,
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Signaling stand-in: voice-state requests are answered from the command
/// line credentials.
struct StaticSignaling {
    // ---
    commands: mpsc::UnboundedSender<VoiceStateCommand>,
}

impl Signaling for StaticSignaling {
    // ---
    fn update_voice_state(&self, command: VoiceStateCommand) -> BoxFuture<'_, anyhow::Result<()>> {
        // ---
        let sent = self
            .commands
            .send(command)
            .map_err(|_| anyhow!("signaling responder stopped"));
        Box::pin(async move { sent })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();

    init_tracing(args.color)?;

    info!("Starting voicelink v{VERSION}");
    info!("Endpoint: {}", args.endpoint);
    info!("Server {} channel {}", args.server_id, args.channel_id);
    info!("Output directory: {}", args.output_dir.display());
    info!("Metrics bind: {}", args.metrics_bind);

    let metrics = MetricsContext::new("voicelink")?;
    let metrics_bind = args.metrics_bind.parse().context("invalid metrics bind")?;
    let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(metrics_bind));

    tokio::fs::create_dir_all(&args.output_dir)
        .await
        .with_context(|| format!("failed to create {}", args.output_dir.display()))?;

    let config = VoiceLinkConfig::default()
        .with_encryption_mode(args.mode.into())
        .with_max_heartbeat_queue_size(args.max_heartbeat_queue)
        .with_reconnect_policy(args.reconnect_attempts, Duration::from_secs(1))
        .with_ready_timeout(Duration::from_secs(args.ready_timeout_secs));

    let (commands, mut requests) = mpsc::unbounded_channel();
    let link = Arc::new(VoiceLink::with_metrics(
        config,
        Arc::new(StaticSignaling { commands }),
        metrics,
    ));

    let responder = {
        let link = Arc::clone(&link);
        let (server_id, user_id) = (args.server_id, args.user_id);
        let (session_id, token, endpoint) =
            (args.session_id.clone(), args.token.clone(), args.endpoint.clone());
        tokio::spawn(async move {
            while let Some(command) = requests.recv().await {
                if command.channel_id.is_none() {
                    info!("Left voice on server {}", command.server_id);
                    continue;
                }
                link.handle_voice_state_update(server_id, user_id, session_id.clone());
                link.handle_voice_server_update(server_id, token.clone(), Some(endpoint.clone()));
            }
        })
    };

    let output_dir = args.output_dir.clone();
    link.events()
        .subscribe(EventKind::UserSpeaking, move |event: VoiceEvent| {
            let output_dir = output_dir.clone();
            async move {
                if let VoiceEvent::UserSpeaking(speaking) = event {
                    if let Some(stream) = speaking.speaker.take_pcm_stream() {
                        let path = output_dir.join(format!("{}.pcm", speaking.ssrc));
                        info!(
                            "Recording ssrc {} (user {:?}) to {}",
                            speaking.ssrc,
                            speaking.user_id,
                            path.display()
                        );
                        tokio::spawn(record(stream, path));
                    }
                }
                Ok::<_, anyhow::Error>(())
            }
        });
    link.events()
        .subscribe(EventKind::ConnectionDestroyed, |event: VoiceEvent| async move {
            if let VoiceEvent::ConnectionDestroyed { server_id, reason } = event {
                warn!("Connection {} destroyed: {}", server_id, reason);
            }
            Ok::<_, anyhow::Error>(())
        });

    let channel = VoiceChannel::new(args.channel_id, args.server_id, ChannelKind::Voice);
    let connection = link
        .connect(&channel, VoiceStateFlags::default())
        .await
        .context("failed to join voice channel")?;
    info!("Connected (ssrc {:?})", connection.ssrc());

    if let Some(path) = &args.play {
        let pcm = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        info!(
            "Transmitting {} ({:.2}s)",
            path.display(),
            pcm.len() as f64 / f64::from(voicelink::codec::SAMPLE_RATE * 4)
        );
        connection.audio_input().write(pcm)?;
        connection.start_speaking()?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for Ctrl-C")?;
    info!("Shutting down");

    connection.disconnect().await?;
    responder.abort();

    if let Some(rtt) = connection.ping() {
        info!("Last heartbeat round trip: {:?}", rtt);
    }
    Ok(())
}

/// Appends a speaker's PCM to `path` until the stream ends.
async fn record(mut stream: PcmStream, path: PathBuf) {
    // ---
    if let Err(e) = write_stream(&mut stream, &path).await {
        warn!("Recording {} failed: {:#}", path.display(), e);
    }
}

async fn write_stream(stream: &mut PcmStream, path: &Path) -> Result<()> {
    // ---
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut frames = 0u64;

    while let Some(chunk) = stream.recv().await {
        file.write_all(&chunk).await?;
        frames += 1;
        if frames % 100 == 0 {
            file.flush().await?;
        }
    }

    file.flush().await?;
    info!("Finished {} ({} frames)", path.display(), frames);
    Ok(())
}
