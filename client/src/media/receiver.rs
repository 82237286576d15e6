//! The UDP receive loop.
//!
//! Classifies each datagram as RTP audio, an RTCP receiver report or a
//! keepalive, then decrypts, strips the header extension, tracks sequence
//! gaps, decodes and publishes PCM for the speaker. Every failure is local to
//! one datagram; the loop itself only stops on cancellation.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use voicelink_common::rtcp::{decode_report_blocks, is_receiver_report, RTCP_HEADER_SIZE};
use voicelink_common::rtp::{extension_block_len, RTP_HEADER_SIZE};
use voicelink_common::{DropReason, MetricsContext, RtcpHeader, RtpHeader};

use super::{MediaContext, MAX_DATAGRAM_SIZE};
use crate::codec::{OpusDecoder, MAX_BUFFER_SIZE};
use crate::error::{Result, VoiceError};
use crate::pool::BufferPool;
use crate::speaker::{SpeakerMap, SpeakerState};

/// Size of a UDP keepalive datagram.
const KEEPALIVE_SIZE: usize = 8;

/// What happened to one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    Audio {
        ssrc: u32,
        sequence: u16,
        has_loss: bool,
        pcm_bytes: usize,
    },
    Report {
        ssrc: u32,
        blocks: usize,
    },
    Keepalive,
    Dropped(DropReason),
}

/// Receive side of the media plane for one session.
pub struct MediaReceiver {
    // ---
    server_id: u64,
    ctx: Arc<MediaContext>,
    speakers: Arc<SpeakerMap>,
    pool: BufferPool,
    metrics: MetricsContext,
    max_codec_failures: Option<u32>,
    packets_received: u64,
    packets_dropped: u64,
}

impl MediaReceiver {
    // ---
    pub fn new(
        server_id: u64,
        ctx: Arc<MediaContext>,
        speakers: Arc<SpeakerMap>,
        metrics: MetricsContext,
    ) -> Self {
        // ---
        Self {
            server_id,
            ctx,
            speakers,
            pool: BufferPool::new(MAX_BUFFER_SIZE),
            metrics,
            max_codec_failures: None,
            packets_received: 0,
            packets_dropped: 0,
        }
    }

    /// Drop a speaker's state after `limit` consecutive codec failures.
    pub fn with_max_consecutive_codec_failures(mut self, limit: Option<u32>) -> Self {
        // ---
        self.max_codec_failures = limit;
        self
    }

    /// Runs until `cancel` fires. Datagrams from anywhere but the relay are
    /// ignored.
    pub async fn run(mut self, cancel: CancellationToken) {
        // ---
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        info!(
            "Connection {}: media receive loop started (relay {})",
            self.server_id, self.ctx.remote
        );

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.ctx.socket.recv_from(&mut buf) => r,
            };

            match received {
                Ok((len, from)) if from == self.ctx.remote => {
                    self.process_datagram(&buf[..len]);
                }
                Ok((len, from)) => {
                    trace!(
                        "Connection {}: ignored {}-byte datagram from {}",
                        self.server_id,
                        len,
                        from
                    );
                    self.dropped(DropReason::Unknown);
                }
                Err(e) => warn!("Connection {}: UDP receive failed: {}", self.server_id, e),
            }
        }

        info!(
            "Connection {}: media receive loop stopped ({} packets, {} dropped)",
            self.server_id, self.packets_received, self.packets_dropped
        );
    }

    /// Handles one datagram. Never fails; problems are logged and counted.
    pub fn process_datagram(&mut self, datagram: &[u8]) -> PacketOutcome {
        // ---
        self.metrics
            .bytes_received_total
            .inc_by(datagram.len() as u64);

        if let Ok(header) = RtpHeader::decode(datagram) {
            if header.marker {
                debug!(
                    "Connection {}: dropped RTP datagram with marker bit (ssrc={} seq={})",
                    self.server_id, header.ssrc, header.sequence
                );
                return self.dropped(DropReason::Unknown);
            }
            return self.audio(header, datagram);
        }

        if is_receiver_report(datagram) {
            return self.report(datagram);
        }

        if datagram.len() == KEEPALIVE_SIZE {
            trace!("Connection {}: keepalive", self.server_id);
            self.metrics.keepalives_total.inc();
            return PacketOutcome::Keepalive;
        }

        if datagram.len() < RTP_HEADER_SIZE {
            warn!(
                "Connection {}: dropped {}-byte datagram (too short)",
                self.server_id,
                datagram.len()
            );
            return self.dropped(DropReason::Malformed);
        }

        debug!(
            "Connection {}: dropped unknown {}-byte datagram (first bytes {:02x?})",
            self.server_id,
            datagram.len(),
            &datagram[..2]
        );
        self.dropped(DropReason::Unknown)
    }

    /// Returns (packets_received, packets_dropped).
    pub fn stats(&self) -> (u64, u64) {
        // ---
        (self.packets_received, self.packets_dropped)
    }

    fn audio(&mut self, header: RtpHeader, datagram: &[u8]) -> PacketOutcome {
        // ---
        match self.decode_audio(&header, datagram) {
            Ok((has_loss, pcm_bytes)) => {
                self.packets_received += 1;
                self.metrics.packets_received_total.inc();

                if self.packets_received % 100 == 0 {
                    debug!(
                        "Connection {}: received {} packets ({} dropped) - ssrc={} seq={}",
                        self.server_id,
                        self.packets_received,
                        self.packets_dropped,
                        header.ssrc,
                        header.sequence
                    );
                }

                PacketOutcome::Audio {
                    ssrc: header.ssrc,
                    sequence: header.sequence,
                    has_loss,
                    pcm_bytes,
                }
            }
            Err(e) => {
                if e.is_packet_local() {
                    warn!(
                        "Connection {}: dropped packet ssrc={} seq={}: {}",
                        self.server_id, header.ssrc, header.sequence, e
                    );
                } else {
                    error!(
                        "Connection {}: unexpected failure on ssrc={} seq={}: {}",
                        self.server_id, header.ssrc, header.sequence, e
                    );
                }
                let reason = match e {
                    VoiceError::MalformedPacket(_) => DropReason::Malformed,
                    VoiceError::DecryptionFailure => DropReason::Decrypt,
                    VoiceError::Codec(_) => DropReason::Codec,
                    _ => DropReason::Unknown,
                };
                self.dropped(reason)
            }
        }
    }

    fn decode_audio(&self, header: &RtpHeader, datagram: &[u8]) -> Result<(bool, usize)> {
        // ---
        let mut plain = self.pool.take();
        self.ctx
            .cipher
            .open(datagram, RTP_HEADER_SIZE, &self.ctx.key, &mut plain)?;

        let offset = if header.has_extension {
            extension_block_len(&plain)?
        } else {
            0
        };

        // Only authenticated packets may create speaker state.
        let (speaker, created) = self.speakers.get_or_create(header.ssrc);
        if created {
            debug!(
                "Connection {}: audio from new ssrc {} before its speaking event",
                self.server_id, header.ssrc
            );
            self.metrics
                .set_active_speakers(self.server_id, self.speakers.len());
        }

        let mut guard = speaker.media();
        let media = &mut *guard;
        let has_loss = media.sequence.update(header.sequence);

        let mut decoder = match media.decoder.take() {
            Some(decoder) => decoder,
            None => OpusDecoder::new()?,
        };

        let started = Instant::now();
        let result = self.decode_into(&speaker, &mut decoder, has_loss, &plain[offset..]);
        self.metrics
            .decode_seconds
            .observe(started.elapsed().as_secs_f64());
        media.decoder = Some(decoder);

        match result {
            Ok(written) => {
                media.consecutive_failures = 0;
                Ok((has_loss, written))
            }
            Err(e) => {
                media.consecutive_failures += 1;
                let failures = media.consecutive_failures;
                drop(guard);

                if self.max_codec_failures.is_some_and(|limit| failures >= limit) {
                    warn!(
                        "Connection {}: ssrc {} failed to decode {} times in a row, resetting speaker",
                        self.server_id, header.ssrc, failures
                    );
                    self.speakers.remove(header.ssrc);
                    self.metrics
                        .set_active_speakers(self.server_id, self.speakers.len());
                }
                Err(e)
            }
        }
    }

    fn decode_into(
        &self,
        speaker: &SpeakerState,
        decoder: &mut OpusDecoder,
        has_loss: bool,
        payload: &[u8],
    ) -> Result<usize> {
        // ---
        let mut pcm = self.pool.take();

        if has_loss {
            self.metrics.packets_lost_total.inc();
            decoder.decode(true, &[], &mut pcm)?;
            speaker.publish(Bytes::copy_from_slice(&pcm));
        }

        let written = decoder.decode(false, payload, &mut pcm)?;
        if !speaker.publish(Bytes::copy_from_slice(&pcm[..written])) {
            trace!(
                "Connection {}: ssrc {} has no PCM consumer",
                self.server_id,
                speaker.ssrc()
            );
        }
        Ok(written)
    }

    fn report(&mut self, datagram: &[u8]) -> PacketOutcome {
        // ---
        match self.decode_report(datagram) {
            Ok((ssrc, blocks)) => {
                self.metrics.rtcp_reports_total.inc();
                PacketOutcome::Report { ssrc, blocks }
            }
            Err(e) => {
                debug!("Connection {}: dropped RTCP report: {}", self.server_id, e);
                let reason = match e {
                    VoiceError::DecryptionFailure => DropReason::Decrypt,
                    _ => DropReason::Malformed,
                };
                self.dropped(reason)
            }
        }
    }

    fn decode_report(&self, datagram: &[u8]) -> Result<(u32, usize)> {
        // ---
        let header = RtcpHeader::decode(datagram)?;

        let mut plain = self.pool.take();
        self.ctx
            .cipher
            .open(datagram, RTCP_HEADER_SIZE, &self.ctx.key, &mut plain)?;

        let blocks = decode_report_blocks(&plain, header.report_count as usize)?;
        for block in &blocks {
            trace!(
                "Connection {}: RTCP report on ssrc {}: fraction lost {}/256, cumulative {}, jitter {}",
                self.server_id,
                block.ssrc,
                block.fraction_lost,
                block.cumulative_lost,
                block.jitter
            );
        }

        Ok((header.ssrc, blocks.len()))
    }

    fn dropped(&mut self, reason: DropReason) -> PacketOutcome {
        // ---
        self.packets_dropped += 1;
        self.metrics.record_drop(reason);
        PacketOutcome::Dropped(reason)
    }
}
