//! Tunables for a voice connection.

use std::time::Duration;

use crate::crypto::EncryptionMode;

/// Heartbeats allowed in flight before the gateway is considered gone.
pub const DEFAULT_MAX_HEARTBEAT_QUEUE_SIZE: usize = 5;

/// Gateway protocol version requested in the connection URL.
pub const DEFAULT_GATEWAY_VERSION: u8 = 4;

/// Configuration shared by every connection created from one `VoiceLink`.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use voicelink::{EncryptionMode, VoiceLinkConfig};
///
/// let config = VoiceLinkConfig::default()
///     .with_encryption_mode(EncryptionMode::Suffix)
///     .with_ready_timeout(Duration::from_secs(5));
/// assert_eq!(config.max_heartbeat_queue_size, 5);
/// ```
#[derive(Debug, Clone)]
pub struct VoiceLinkConfig {
    // ---
    /// AEAD scheme offered in SelectProtocol
    pub encryption_mode: EncryptionMode,

    /// Outstanding heartbeats tolerated before reconnecting
    pub max_heartbeat_queue_size: usize,

    /// Treat an ack whose value differs from the oldest heartbeat as fatal
    pub strict_heartbeat_ack: bool,

    /// Bound on the wait for the IP discovery reply
    pub ip_discovery_timeout: Duration,

    /// Bound on `connect` waiting for the session description
    pub ready_timeout: Duration,

    /// Bound on waiting for both signaling events
    pub signaling_timeout: Duration,

    /// Full reconnects attempted before the connection is destroyed
    pub max_reconnect_attempts: u32,

    /// Base delay of the exponential reconnect backoff
    pub reconnect_backoff: Duration,

    /// Drop a speaker's state after this many codec failures in a row.
    /// `None` keeps the speaker regardless.
    pub max_consecutive_codec_failures: Option<u32>,

    /// `v=` query parameter sent to the gateway
    pub gateway_version: u8,
}

impl Default for VoiceLinkConfig {
    // ---
    fn default() -> Self {
        // ---
        Self {
            encryption_mode: EncryptionMode::Lite,
            max_heartbeat_queue_size: DEFAULT_MAX_HEARTBEAT_QUEUE_SIZE,
            strict_heartbeat_ack: true,
            ip_discovery_timeout: Duration::from_secs(2),
            ready_timeout: Duration::from_secs(10),
            signaling_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            reconnect_backoff: Duration::from_secs(1),
            max_consecutive_codec_failures: None,
            gateway_version: DEFAULT_GATEWAY_VERSION,
        }
    }
}

impl VoiceLinkConfig {
    // ---
    pub fn with_encryption_mode(mut self, mode: EncryptionMode) -> Self {
        // ---
        self.encryption_mode = mode;
        self
    }

    pub fn with_max_heartbeat_queue_size(mut self, size: usize) -> Self {
        // ---
        self.max_heartbeat_queue_size = size;
        self
    }

    pub fn with_strict_heartbeat_ack(mut self, strict: bool) -> Self {
        // ---
        self.strict_heartbeat_ack = strict;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        // ---
        self.ready_timeout = timeout;
        self
    }

    pub fn with_signaling_timeout(mut self, timeout: Duration) -> Self {
        // ---
        self.signaling_timeout = timeout;
        self
    }

    pub fn with_reconnect_policy(mut self, attempts: u32, backoff: Duration) -> Self {
        // ---
        self.max_reconnect_attempts = attempts;
        self.reconnect_backoff = backoff;
        self
    }

    pub fn with_max_consecutive_codec_failures(mut self, limit: Option<u32>) -> Self {
        // ---
        self.max_consecutive_codec_failures = limit;
        self
    }

    /// Delay before full reconnect number `attempt` (1-based), doubling up to 30 s.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        // ---
        let factor = 1u32 << attempt.saturating_sub(1).min(5);
        (self.reconnect_backoff * factor).min(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_defaults() {
        // ---
        let config = VoiceLinkConfig::default();
        assert_eq!(config.encryption_mode, EncryptionMode::Lite);
        assert_eq!(config.max_heartbeat_queue_size, 5);
        assert!(config.strict_heartbeat_ack);
        assert_eq!(config.ip_discovery_timeout, Duration::from_secs(2));
        assert_eq!(config.max_consecutive_codec_failures, None);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        // ---
        let config = VoiceLinkConfig::default()
            .with_reconnect_policy(10, Duration::from_millis(500));

        assert_eq!(config.backoff_for(1), Duration::from_millis(500));
        assert_eq!(config.backoff_for(2), Duration::from_secs(1));
        assert_eq!(config.backoff_for(3), Duration::from_secs(2));
        assert_eq!(config.backoff_for(20), Duration::from_secs(16));
    }
}
