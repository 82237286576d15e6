//! Real-time voice transport client.
//!
//! Joins a voice channel through a gateway-and-relay service: a JSON
//! websocket drives the session handshake, heartbeats and resume, while
//! encrypted Opus audio flows over UDP as RTP. Incoming audio is decoded per
//! speaker into 48 kHz stereo PCM streams; outgoing PCM is encoded, sealed
//! and paced at one 20 ms frame per tick.
//!
//! Start from [`VoiceLink`]: give it a [`Signaling`] implementation, forward
//! the host's voice-state and voice-server events to it, and call
//! [`VoiceLink::connect`].

pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod gateway;
pub mod media;
pub mod pool;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod speaker;

mod connection;
mod extension;

pub use config::VoiceLinkConfig;
pub use connection::VoiceConnection;
pub use crypto::{EncryptionMode, SecretKey, VoiceCipher};
pub use error::{Result, VoiceError};
pub use events::{EventHub, EventKind, SpeakingEvent, VoiceEvent};
pub use extension::VoiceLink;
pub use media::{MediaContext, MediaReceiver, MediaSender, PacketOutcome, PcmWriter};
pub use registry::SessionRegistry;
pub use session::SessionState;
pub use signaling::{
    ChannelKind, Credentials, Member, MemberDirectory, Signaling, VoiceChannel,
    VoiceStateCommand, VoiceStateFlags,
};
pub use speaker::{PcmStream, SpeakerState, SpeakingFlags};
