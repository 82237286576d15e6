//! Authenticated encryption of media payloads.
//!
//! Every RTP payload is sealed with XSalsa20-Poly1305. The three negotiable
//! modes share the primitive and differ only in where the 24-byte nonce comes
//! from:
//!
//! - [`EncryptionMode::Normal`]: the clear header, zero-padded.
//! - [`EncryptionMode::Lite`]: a per-SSRC 32-bit big-endian counter, carried
//!   as a 4-byte suffix.
//! - [`EncryptionMode::Suffix`]: 24 random bytes, carried verbatim as a suffix.
//!
//! Sealed layout after the clear header is `tag (16) | ciphertext | suffix`.

use crypto_secretbox::aead::generic_array::GenericArray;
use crypto_secretbox::aead::{AeadInPlace, KeyInit};
use crypto_secretbox::XSalsa20Poly1305;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use voicelink_common::WireError;

use crate::error::{Result, VoiceError};

/// Secret key size of the primitive.
pub const KEY_SIZE: usize = 32;

/// Nonce size of the primitive.
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size.
pub const TAG_SIZE: usize = 16;

const LITE_SUFFIX_SIZE: usize = 4;

/// AEAD nonce scheme negotiated with the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionMode {
    /// Nonce is the packet header.
    Normal,
    /// Nonce is an incrementing 32-bit suffix.
    Lite,
    /// Nonce is a random 24-byte suffix.
    Suffix,
}

impl EncryptionMode {
    // ---
    pub const ALL: [EncryptionMode; 3] = [
        EncryptionMode::Normal,
        EncryptionMode::Lite,
        EncryptionMode::Suffix,
    ];

    /// Name used in SelectProtocol and SessionDescription.
    pub fn protocol_name(self) -> &'static str {
        // ---
        match self {
            EncryptionMode::Normal => "xsalsa20_poly1305",
            EncryptionMode::Lite => "xsalsa20_poly1305_lite",
            EncryptionMode::Suffix => "xsalsa20_poly1305_suffix",
        }
    }

    pub fn from_protocol_name(name: &str) -> Option<Self> {
        // ---
        Self::ALL.into_iter().find(|m| m.protocol_name() == name)
    }

    /// Bytes of nonce material carried after the ciphertext.
    pub fn suffix_len(self) -> usize {
        // ---
        match self {
            EncryptionMode::Normal => 0,
            EncryptionMode::Lite => LITE_SUFFIX_SIZE,
            EncryptionMode::Suffix => NONCE_SIZE,
        }
    }
}

impl fmt::Display for EncryptionMode {
    // ---
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.write_str(self.protocol_name())
    }
}

/// Session secret delivered in SessionDescription.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    // ---
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        // ---
        Self(bytes)
    }

    /// Builds a key from the gateway's byte list.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::ProtocolViolation`] unless exactly 32 bytes are given.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        // ---
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            VoiceError::protocol(format!(
                "secret key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    fn primitive(&self) -> XSalsa20Poly1305 {
        // ---
        XSalsa20Poly1305::new(&GenericArray::from(self.0))
    }
}

impl fmt::Debug for SecretKey {
    // ---
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.write_str("SecretKey(..)")
    }
}

/// The negotiated mode plus the per-SSRC counters [`EncryptionMode::Lite`] needs.
///
/// Chosen once per session; never re-selected per packet.
#[derive(Debug)]
pub struct VoiceCipher {
    // ---
    mode: EncryptionMode,
    counters: DashMap<u32, u32>,
}

impl VoiceCipher {
    // ---
    pub fn new(mode: EncryptionMode) -> Self {
        // ---
        Self {
            mode,
            counters: DashMap::new(),
        }
    }

    pub fn mode(&self) -> EncryptionMode {
        // ---
        self.mode
    }

    /// Size of the sealed region for `plain_len` bytes of plaintext.
    pub fn encrypted_size(&self, plain_len: usize) -> usize {
        // ---
        plain_len + TAG_SIZE + self.mode.suffix_len()
    }

    /// Size of the plaintext recovered from `cipher_len` sealed bytes.
    pub fn decrypted_size(&self, cipher_len: usize) -> usize {
        // ---
        cipher_len.saturating_sub(TAG_SIZE + self.mode.suffix_len())
    }

    /// Seals `plaintext` onto the end of `packet`.
    ///
    /// `packet` must already hold the clear header (12 bytes for RTP, 8 for
    /// RTCP); in [`EncryptionMode::Normal`] those bytes form the nonce.
    /// `ssrc` selects the counter in [`EncryptionMode::Lite`].
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::EncryptionFailure`] if the primitive rejects the input.
    pub fn seal(&self, ssrc: u32, packet: &mut Vec<u8>, plaintext: &[u8], key: &SecretKey) -> Result<()> {
        // ---
        let mut nonce = [0u8; NONCE_SIZE];
        let mut suffix = [0u8; NONCE_SIZE];

        match self.mode {
            EncryptionMode::Normal => {
                let len = packet.len().min(NONCE_SIZE);
                nonce[..len].copy_from_slice(&packet[..len]);
            }
            EncryptionMode::Lite => {
                let counter = self.next_counter(ssrc);
                nonce[..LITE_SUFFIX_SIZE].copy_from_slice(&counter.to_be_bytes());
                suffix[..LITE_SUFFIX_SIZE].copy_from_slice(&counter.to_be_bytes());
            }
            EncryptionMode::Suffix => {
                OsRng.fill_bytes(&mut nonce);
                suffix = nonce;
            }
        }

        let tag_at = packet.len();
        packet.reserve(self.encrypted_size(plaintext.len()));
        packet.resize(tag_at + TAG_SIZE, 0);
        packet.extend_from_slice(plaintext);

        let tag = key
            .primitive()
            .encrypt_in_place_detached(
                &GenericArray::from(nonce),
                b"",
                &mut packet[tag_at + TAG_SIZE..],
            )
            .map_err(|_| VoiceError::EncryptionFailure)?;

        packet[tag_at..tag_at + TAG_SIZE].copy_from_slice(&tag);
        packet.extend_from_slice(&suffix[..self.mode.suffix_len()]);
        Ok(())
    }

    /// Opens the sealed region that follows `header_len` clear bytes of `packet`.
    ///
    /// The plaintext replaces the contents of `out`.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::MalformedPacket`] if the packet cannot hold a tag
    /// and nonce suffix, and [`VoiceError::DecryptionFailure`] if
    /// authentication fails.
    pub fn open(&self, packet: &[u8], header_len: usize, key: &SecretKey, out: &mut Vec<u8>) -> Result<()> {
        // ---
        let suffix_len = self.mode.suffix_len();
        let minimum = header_len + TAG_SIZE + suffix_len;
        if packet.len() < minimum {
            return Err(WireError::TooShort {
                what: "sealed payload",
                expected: minimum,
                actual: packet.len(),
            }
            .into());
        }

        let body_end = packet.len() - suffix_len;
        let mut nonce = [0u8; NONCE_SIZE];
        match self.mode {
            EncryptionMode::Normal => {
                let len = header_len.min(NONCE_SIZE);
                nonce[..len].copy_from_slice(&packet[..len]);
            }
            EncryptionMode::Lite | EncryptionMode::Suffix => {
                nonce[..suffix_len].copy_from_slice(&packet[body_end..]);
            }
        }

        let tag = GenericArray::from_slice(&packet[header_len..header_len + TAG_SIZE]);

        out.clear();
        out.extend_from_slice(&packet[header_len + TAG_SIZE..body_end]);

        key.primitive()
            .decrypt_in_place_detached(&GenericArray::from(nonce), b"", out, tag)
            .map_err(|_| VoiceError::DecryptionFailure)
    }

    fn next_counter(&self, ssrc: u32) -> u32 {
        // ---
        let mut counter = self.counters.entry(ssrc).or_insert(0);
        let value = *counter;
        *counter = value.wrapping_add(1);
        value
    }
}
