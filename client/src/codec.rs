//! Opus codec adapter.
//!
//! Wraps the native encoder/decoder handles at the relay's fixed operating
//! point: 48 kHz, stereo, 20 ms frames, 16-bit little-endian interleaved PCM.
//! Each handle is owned by exactly one speaker (decoder) or one send loop
//! (encoder) and is released when the wrapper drops.

use opus::{Application, Channels};
use thiserror::Error;

/// Sample rate for audio encoding and decoding (48kHz fullband)
pub const SAMPLE_RATE: u32 = 48_000;

/// Number of interleaved audio channels (stereo)
pub const CHANNELS: usize = 2;

/// Frame duration in milliseconds
pub const FRAME_DURATION_MS: usize = 20;

/// Samples per channel in one frame (20ms at 48kHz)
pub const SAMPLES_PER_FRAME: usize = (SAMPLE_RATE as usize * FRAME_DURATION_MS) / 1000;

/// Bytes in one PCM sample
pub const BYTES_PER_SAMPLE: usize = 2;

/// Bytes of PCM in one decoded or encodable frame
pub const MAX_BUFFER_SIZE: usize = SAMPLES_PER_FRAME * CHANNELS * BYTES_PER_SAMPLE;

/// Upper bound on one encoded Opus packet
pub const MAX_OPUS_PACKET_SIZE: usize = 4000;

/// `OPUS_BAD_ARG`
const BAD_ARG: i32 = -1;

/// A failure reported by the Opus primitive.
#[derive(Debug, Clone, Error)]
#[error("opus {operation} failed (code {code}): {message}")]
pub struct CodecError {
    // ---
    pub operation: &'static str,
    /// Native Opus error code (negative)
    pub code: i32,
    pub message: String,
}

impl CodecError {
    // ---
    fn from_opus(operation: &'static str, err: opus::Error) -> Self {
        // ---
        Self {
            operation,
            code: err.code() as i32,
            message: err.to_string(),
        }
    }

    fn bad_arg(operation: &'static str, message: String) -> Self {
        // ---
        Self {
            operation,
            code: BAD_ARG,
            message,
        }
    }
}

/// Stateful per-speaker Opus decoder.
///
/// # Example
///
/// ```no_run
/// use voicelink::codec::OpusDecoder;
///
/// let mut decoder = OpusDecoder::new().unwrap();
/// let mut pcm = Vec::new();
/// let written = decoder.decode(true, &[], &mut pcm).unwrap();
/// assert_eq!(written, pcm.len());
/// ```
pub struct OpusDecoder {
    // ---
    decoder: opus::Decoder,
    samples: Vec<i16>,
}

impl OpusDecoder {
    // ---
    /// Creates a decoder at 48kHz stereo.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the native handle cannot be created.
    pub fn new() -> Result<Self, CodecError> {
        // ---
        let decoder = opus::Decoder::new(SAMPLE_RATE, Channels::Stereo)
            .map_err(|e| CodecError::from_opus("decoder init", e))?;

        Ok(Self {
            decoder,
            samples: vec![0i16; SAMPLES_PER_FRAME * CHANNELS],
        })
    }

    /// Decodes one frame into `output` as little-endian interleaved PCM.
    ///
    /// When `has_packet_loss` is set, `input` is ignored and the decoder
    /// synthesizes a concealment frame from its prior state.
    ///
    /// # Returns
    ///
    /// Number of PCM bytes written; `output` is replaced, not appended to.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] carrying the native code if decoding fails.
    pub fn decode(&mut self, has_packet_loss: bool, input: &[u8], output: &mut Vec<u8>) -> Result<usize, CodecError> {
        // ---
        let packet: &[u8] = if has_packet_loss { &[] } else { input };

        let per_channel = self
            .decoder
            .decode(packet, &mut self.samples, false)
            .map_err(|e| CodecError::from_opus("decode", e))?;

        output.clear();
        for sample in &self.samples[..per_channel * CHANNELS] {
            output.extend_from_slice(&sample.to_le_bytes());
        }

        Ok(output.len())
    }

    /// Clears decoder state for a fresh stream.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the reset control call fails.
    pub fn reset(&mut self) -> Result<(), CodecError> {
        // ---
        self.decoder
            .reset_state()
            .map_err(|e| CodecError::from_opus("decoder reset", e))
    }
}

/// Opus encoder for the outbound stream.
pub struct OpusEncoder {
    // ---
    encoder: opus::Encoder,
    samples: Vec<i16>,
}

impl OpusEncoder {
    // ---
    /// Creates an encoder at 48kHz stereo tuned for general audio.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the native handle cannot be created.
    pub fn new() -> Result<Self, CodecError> {
        // ---
        let encoder = opus::Encoder::new(SAMPLE_RATE, Channels::Stereo, Application::Audio)
            .map_err(|e| CodecError::from_opus("encoder init", e))?;

        Ok(Self {
            encoder,
            samples: vec![0i16; SAMPLES_PER_FRAME * CHANNELS],
        })
    }

    /// Encodes one frame of little-endian interleaved PCM.
    ///
    /// `pcm` must be exactly [`MAX_BUFFER_SIZE`] bytes.
    ///
    /// # Returns
    ///
    /// Number of encoded bytes written to the front of `output`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] for a wrong frame size or a native failure.
    pub fn encode(&mut self, pcm: &[u8], output: &mut [u8]) -> Result<usize, CodecError> {
        // ---
        if pcm.len() != MAX_BUFFER_SIZE {
            return Err(CodecError::bad_arg(
                "encode",
                format!("frame must be {} bytes, got {}", MAX_BUFFER_SIZE, pcm.len()),
            ));
        }

        for (sample, bytes) in self.samples.iter_mut().zip(pcm.chunks_exact(2)) {
            *sample = i16::from_le_bytes([bytes[0], bytes[1]]);
        }

        self.encoder
            .encode(&self.samples, output)
            .map_err(|e| CodecError::from_opus("encode", e))
    }
}
