//! The outbound send path.
//!
//! PCM written through a [`PcmWriter`] is cut into 20 ms frames, encoded,
//! framed with our own sequence/timestamp, sealed and sent to the relay at a
//! real-time pace.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use voicelink_common::{MetricsContext, RtpHeader};

use super::MediaContext;
use crate::codec::{
    OpusEncoder, FRAME_DURATION_MS, MAX_BUFFER_SIZE, MAX_OPUS_PACKET_SIZE, SAMPLES_PER_FRAME,
};
use crate::error::{Result, VoiceError};

/// Producer end of the outbound PCM pipe.
///
/// Accepts 48kHz stereo 16-bit little-endian PCM in chunks of any size.
#[derive(Debug, Clone)]
pub struct PcmWriter {
    // ---
    tx: mpsc::UnboundedSender<Bytes>,
}

impl PcmWriter {
    // ---
    pub(crate) fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        // ---
        Self { tx }
    }

    /// Queues PCM for transmission.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Closed`] once the connection is gone.
    pub fn write(&self, pcm: impl Into<Bytes>) -> Result<()> {
        // ---
        self.tx.send(pcm.into()).map_err(|_| VoiceError::Closed)
    }
}

/// Encoder plus the sequencing state of our own outbound stream.
pub struct MediaSender {
    // ---
    server_id: u64,
    encoder: OpusEncoder,
    sequence: u16,
    timestamp: u32,
    opus: Vec<u8>,
    packet: Vec<u8>,
    metrics: MetricsContext,
    packets_sent: u64,
}

impl MediaSender {
    // ---
    /// Creates a sender with random initial sequence number and timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Codec`] if the encoder cannot be created.
    pub fn new(server_id: u64, metrics: MetricsContext) -> Result<Self> {
        // ---
        Ok(Self {
            server_id,
            encoder: OpusEncoder::new()?,
            sequence: rand::random(),
            timestamp: rand::random(),
            opus: vec![0u8; MAX_OPUS_PACKET_SIZE],
            packet: Vec::with_capacity(MAX_OPUS_PACKET_SIZE),
            metrics,
            packets_sent: 0,
        })
    }

    /// Restarts sequencing for a new session.
    pub fn reset(&mut self) {
        // ---
        self.sequence = rand::random();
        self.timestamp = rand::random();
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u16 {
        // ---
        self.sequence
    }

    /// Timestamp the next packet will carry.
    pub fn timestamp(&self) -> u32 {
        // ---
        self.timestamp
    }

    /// Encodes and seals one frame of PCM, advancing sequence and timestamp.
    ///
    /// # Returns
    ///
    /// The complete datagram.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Codec`] or [`VoiceError::EncryptionFailure`].
    pub fn build_packet(&mut self, ctx: &MediaContext, pcm: &[u8]) -> Result<&[u8]> {
        // ---
        let started = Instant::now();
        let len = self.encoder.encode(pcm, &mut self.opus)?;
        self.metrics
            .encode_seconds
            .observe(started.elapsed().as_secs_f64());

        let header = RtpHeader::new(self.sequence, self.timestamp, ctx.ssrc);
        self.packet.clear();
        self.packet.extend_from_slice(&header.encode());
        ctx.cipher
            .seal(ctx.ssrc, &mut self.packet, &self.opus[..len], &ctx.key)?;

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(SAMPLES_PER_FRAME as u32);

        Ok(&self.packet)
    }

    /// Builds one packet and sends it to the relay.
    ///
    /// # Errors
    ///
    /// Returns the build error or [`VoiceError::Io`] if the send fails.
    pub async fn send_frame(&mut self, ctx: &MediaContext, pcm: &[u8]) -> Result<usize> {
        // ---
        self.build_packet(ctx, pcm)?;
        let sent = ctx.socket.send_to(&self.packet, ctx.remote).await?;

        self.packets_sent += 1;
        self.metrics.packets_sent_total.inc();
        self.metrics.bytes_sent_total.inc_by(sent as u64);

        if self.packets_sent % 100 == 0 {
            debug!(
                "Connection {}: sent {} packets - seq={} ts={}",
                self.server_id,
                self.packets_sent,
                self.sequence.wrapping_sub(1),
                self.timestamp.wrapping_sub(SAMPLES_PER_FRAME as u32)
            );
        }

        Ok(sent)
    }
}

/// Drains the outbound PCM pipe until the connection is cancelled or every
/// writer is dropped.
///
/// Frames are paced at 20 ms. The active media context is re-read for every
/// frame; when it changes (new session) sequencing restarts, and while there
/// is none (reconnecting) frames are discarded.
pub(crate) async fn run_send_loop(
    mut sender: MediaSender,
    mut pcm_rx: mpsc::UnboundedReceiver<Bytes>,
    media: watch::Receiver<Option<Arc<MediaContext>>>,
    cancel: CancellationToken,
) {
    // ---
    let server_id = sender.server_id;
    let mut pending = BytesMut::with_capacity(MAX_BUFFER_SIZE * 4);
    let mut current: Option<Arc<MediaContext>> = None;
    let mut ticker = interval(Duration::from_millis(FRAME_DURATION_MS as u64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut input_open = true;

    info!("Connection {}: send loop started", server_id);

    loop {
        while input_open && pending.len() < MAX_BUFFER_SIZE {
            tokio::select! {
                _ = cancel.cancelled() => return,
                chunk = pcm_rx.recv() => match chunk {
                    Some(chunk) => pending.extend_from_slice(&chunk),
                    None => input_open = false,
                },
            }
        }

        if pending.is_empty() {
            break;
        }
        if pending.len() < MAX_BUFFER_SIZE {
            pending.resize(MAX_BUFFER_SIZE, 0);
        }
        let frame = pending.split_to(MAX_BUFFER_SIZE);

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let ctx = media.borrow().clone();
        let Some(ctx) = ctx else {
            trace!("Connection {}: no media session, frame discarded", server_id);
            continue;
        };

        if !current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &ctx)) {
            debug!("Connection {}: sending as ssrc {}", server_id, ctx.ssrc);
            sender.reset();
            current = Some(Arc::clone(&ctx));
        }

        if let Err(e) = sender.send_frame(&ctx, &frame).await {
            warn!("Connection {}: failed to send frame: {}", server_id, e);
        }
    }

    info!("Connection {}: send loop finished", server_id);
}
