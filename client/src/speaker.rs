//! Per-speaker media state.
//!
//! A speaker is keyed by SSRC. It may be created by the first audio packet
//! (identity unknown) or by a Speaking/ClientConnected message, whichever
//! arrives first; the other source backfills the missing half.

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::Stream;
use std::fmt;
use std::ops::BitOr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::codec::OpusDecoder;

/// Speaking indicator bits carried by the Speaking message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SpeakingFlags(u8);

impl SpeakingFlags {
    // ---
    pub const NONE: SpeakingFlags = SpeakingFlags(0);
    pub const MICROPHONE: SpeakingFlags = SpeakingFlags(1);
    pub const SOUNDSHARE: SpeakingFlags = SpeakingFlags(2);
    pub const PRIORITY: SpeakingFlags = SpeakingFlags(4);

    pub fn from_bits(bits: u8) -> Self {
        // ---
        SpeakingFlags(bits)
    }

    pub fn bits(self) -> u8 {
        // ---
        self.0
    }

    pub fn contains(self, other: SpeakingFlags) -> bool {
        // ---
        self.0 & other.0 == other.0
    }

    pub fn is_speaking(self) -> bool {
        // ---
        self.0 != 0
    }
}

impl BitOr for SpeakingFlags {
    // ---
    type Output = SpeakingFlags;

    fn bitor(self, rhs: SpeakingFlags) -> SpeakingFlags {
        // ---
        SpeakingFlags(self.0 | rhs.0)
    }
}

/// Detects gaps in a speaker's RTP sequence numbers.
#[derive(Debug, Default, Clone)]
pub struct SequenceTracker {
    // ---
    last: Option<u16>,
}

impl SequenceTracker {
    // ---
    /// Records `observed` and reports whether packets went missing before it.
    ///
    /// The first observation only seeds the tracker. Each gap is reported once,
    /// on the packet that ends it, however many packets it spans.
    pub fn update(&mut self, observed: u16) -> bool {
        // ---
        let has_loss = match self.last {
            Some(last) => observed != last.wrapping_add(1),
            None => false,
        };
        self.last = Some(observed);
        has_loss
    }

    pub fn last(&self) -> Option<u16> {
        // ---
        self.last
    }
}

/// Decoder-side state only the receive loop touches.
pub(crate) struct SpeakerMedia {
    // ---
    pub(crate) decoder: Option<OpusDecoder>,
    pub(crate) sequence: SequenceTracker,
    pub(crate) consecutive_failures: u32,
}

/// Consumer end of a speaker's decoded PCM pipe.
///
/// Yields 48kHz stereo 16-bit little-endian chunks, one per decoded frame,
/// and ends when the speaker leaves or the session is torn down.
#[derive(Debug)]
pub struct PcmStream {
    // ---
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl PcmStream {
    // ---
    /// Waits for the next chunk; `None` at end of stream.
    pub async fn recv(&mut self) -> Option<Bytes> {
        // ---
        self.rx.recv().await
    }

    /// Returns a chunk if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        // ---
        self.rx.try_recv().ok()
    }
}

impl Stream for PcmStream {
    // ---
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        // ---
        self.rx.poll_recv(cx)
    }
}

/// One remote participant's media state.
pub struct SpeakerState {
    // ---
    ssrc: u32,
    user_id: RwLock<Option<u64>>,
    flags: AtomicU8,
    media: Mutex<SpeakerMedia>,
    sink: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    stream: Mutex<Option<PcmStream>>,
}

impl SpeakerState {
    // ---
    pub fn new(ssrc: u32, user_id: Option<u64>) -> Self {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            ssrc,
            user_id: RwLock::new(user_id),
            flags: AtomicU8::new(0),
            media: Mutex::new(SpeakerMedia {
                decoder: None,
                sequence: SequenceTracker::default(),
                consecutive_failures: 0,
            }),
            sink: Mutex::new(Some(tx)),
            stream: Mutex::new(Some(PcmStream { rx })),
        }
    }

    pub fn ssrc(&self) -> u32 {
        // ---
        self.ssrc
    }

    /// The user behind this SSRC, once known.
    pub fn user_id(&self) -> Option<u64> {
        // ---
        *self.user_id.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fills in or replaces the identity. Returns true if it changed.
    pub fn set_user_id(&self, user_id: u64) -> bool {
        // ---
        let mut slot = self.user_id.write().unwrap_or_else(PoisonError::into_inner);
        let changed = *slot != Some(user_id);
        *slot = Some(user_id);
        changed
    }

    pub fn speaking_flags(&self) -> SpeakingFlags {
        // ---
        SpeakingFlags(self.flags.load(Ordering::Relaxed))
    }

    pub fn set_speaking_flags(&self, flags: SpeakingFlags) {
        // ---
        self.flags.store(flags.bits(), Ordering::Relaxed);
    }

    /// Takes the PCM consumer end. Only the first caller gets it.
    pub fn take_pcm_stream(&self) -> Option<PcmStream> {
        // ---
        self.stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// True once the PCM sink has been closed.
    pub fn is_closed(&self) -> bool {
        // ---
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Hands a decoded chunk to the consumer. Returns false if the sink is closed.
    pub(crate) fn publish(&self, chunk: Bytes) -> bool {
        // ---
        match self.sink.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(tx) => tx.send(chunk).is_ok(),
            None => false,
        }
    }

    /// Closes the PCM sink; the consumer sees end of stream after draining.
    pub(crate) fn close(&self) {
        // ---
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub(crate) fn media(&self) -> MutexGuard<'_, SpeakerMedia> {
        // ---
        self.media.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SpeakerState {
    // ---
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.debug_struct("SpeakerState")
            .field("ssrc", &self.ssrc)
            .field("user_id", &self.user_id())
            .field("flags", &self.speaking_flags())
            .finish()
    }
}

/// All speakers of one session, keyed by SSRC.
#[derive(Debug, Default)]
pub struct SpeakerMap {
    // ---
    by_ssrc: DashMap<u32, Arc<SpeakerState>>,
}

impl SpeakerMap {
    // ---
    pub fn new() -> Self {
        // ---
        Self::default()
    }

    pub fn get(&self, ssrc: u32) -> Option<Arc<SpeakerState>> {
        // ---
        self.by_ssrc.get(&ssrc).map(|s| Arc::clone(s.value()))
    }

    /// Returns the speaker for `ssrc`, creating an anonymous one if needed.
    ///
    /// The boolean is true when this call created it.
    pub fn get_or_create(&self, ssrc: u32) -> (Arc<SpeakerState>, bool) {
        // ---
        let mut created = false;
        let speaker = self
            .by_ssrc
            .entry(ssrc)
            .or_insert_with(|| {
                created = true;
                Arc::new(SpeakerState::new(ssrc, None))
            })
            .value()
            .clone();
        (speaker, created)
    }

    /// Associates `ssrc` with `user_id`, creating the speaker if needed.
    pub fn upsert_identity(&self, ssrc: u32, user_id: u64) -> (Arc<SpeakerState>, bool) {
        // ---
        let (speaker, created) = self.get_or_create(ssrc);
        speaker.set_user_id(user_id);
        (speaker, created)
    }

    pub fn find_by_user(&self, user_id: u64) -> Option<Arc<SpeakerState>> {
        // ---
        self.by_ssrc
            .iter()
            .find(|s| s.user_id() == Some(user_id))
            .map(|s| Arc::clone(s.value()))
    }

    /// Removes every speaker owned by `user_id` and closes their sinks.
    pub fn remove_user(&self, user_id: u64) -> Vec<Arc<SpeakerState>> {
        // ---
        let ssrcs: Vec<u32> = self
            .by_ssrc
            .iter()
            .filter(|s| s.user_id() == Some(user_id))
            .map(|s| *s.key())
            .collect();

        ssrcs.into_iter().filter_map(|ssrc| self.remove(ssrc)).collect()
    }

    /// Removes one speaker and closes its sink.
    pub fn remove(&self, ssrc: u32) -> Option<Arc<SpeakerState>> {
        // ---
        let (_, speaker) = self.by_ssrc.remove(&ssrc)?;
        speaker.close();
        Some(speaker)
    }

    /// Closes every sink and empties the map.
    pub fn close_all(&self) {
        // ---
        for speaker in self.snapshot() {
            speaker.close();
        }
        self.by_ssrc.clear();
    }

    pub fn snapshot(&self) -> Vec<Arc<SpeakerState>> {
        // ---
        self.by_ssrc.iter().map(|s| Arc::clone(s.value())).collect()
    }

    pub fn len(&self) -> usize {
        // ---
        self.by_ssrc.len()
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.by_ssrc.is_empty()
    }
}
