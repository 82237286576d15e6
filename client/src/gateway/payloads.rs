//! Typed `d` payloads of the voice gateway opcodes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::snowflake;

/// Hello (op 8).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    // ---
    /// Milliseconds; some relays send a float
    pub heartbeat_interval: f64,
}

impl HelloPayload {
    // ---
    pub fn interval(&self) -> Duration {
        // ---
        Duration::from_millis(self.heartbeat_interval.max(0.0) as u64)
    }
}

/// Identify (op 0).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyPayload {
    // ---
    #[serde(with = "snowflake")]
    pub server_id: u64,
    #[serde(with = "snowflake")]
    pub user_id: u64,
    pub session_id: String,
    pub token: String,
}

/// Resume (op 7).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePayload {
    // ---
    #[serde(with = "snowflake")]
    pub server_id: u64,
    pub session_id: String,
    pub token: String,
}

/// Ready (op 2): our SSRC and the relay's UDP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyPayload {
    // ---
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub modes: Vec<String>,
}

/// SelectProtocol (op 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectProtocolPayload {
    // ---
    pub protocol: String,
    pub data: SelectProtocolData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectProtocolData {
    // ---
    pub address: String,
    pub port: u16,
    pub mode: String,
}

impl SelectProtocolPayload {
    // ---
    pub fn udp(address: String, port: u16, mode: &str) -> Self {
        // ---
        Self {
            protocol: "udp".to_string(),
            data: SelectProtocolData {
                address,
                port,
                mode: mode.to_string(),
            },
        }
    }
}

/// SessionDescription (op 4): the negotiated mode and secret key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptionPayload {
    // ---
    pub mode: String,
    pub secret_key: Vec<u8>,
}

/// Speaking (op 5), in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakingPayload {
    // ---
    #[serde(
        default,
        with = "snowflake::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<u64>,
    pub ssrc: u32,
    /// Speaking indicator bits
    pub speaking: u8,
    #[serde(default)]
    pub delay: u32,
}

/// ClientConnected (op 12).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConnectedPayload {
    // ---
    #[serde(with = "snowflake")]
    pub user_id: u64,
    #[serde(default)]
    pub audio_ssrc: Option<u32>,
}

/// ClientDisconnect (op 13).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDisconnectPayload {
    // ---
    #[serde(with = "snowflake")]
    pub user_id: u64,
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identify_shape() {
        // ---
        let identify = IdentifyPayload {
            server_id: 41771983423143937,
            user_id: 104694319306248192,
            session_id: "my_session_id".into(),
            token: "my_token".into(),
        };

        assert_eq!(
            serde_json::to_value(&identify).expect("serialize"),
            json!({
                "server_id": "41771983423143937",
                "user_id": "104694319306248192",
                "session_id": "my_session_id",
                "token": "my_token"
            })
        );
    }

    #[test]
    fn test_select_protocol_shape() {
        // ---
        let payload = SelectProtocolPayload::udp("1.2.3.4".into(), 9999, "xsalsa20_poly1305_lite");
        assert_eq!(
            serde_json::to_value(&payload).expect("serialize"),
            json!({
                "protocol": "udp",
                "data": {"address": "1.2.3.4", "port": 9999, "mode": "xsalsa20_poly1305_lite"}
            })
        );
    }

    #[test]
    fn test_speaking_accepts_string_or_number_ids() {
        // ---
        let from_string: SpeakingPayload =
            serde_json::from_value(json!({"user_id": "42", "ssrc": 7, "speaking": 1}))
                .expect("string id");
        let from_number: SpeakingPayload =
            serde_json::from_value(json!({"user_id": 42, "ssrc": 7, "speaking": 1}))
                .expect("numeric id");

        assert_eq!(from_string, from_number);
        assert_eq!(from_string.user_id, Some(42));
        assert_eq!(from_string.delay, 0);
    }

    #[test]
    fn test_outbound_speaking_omits_user() {
        // ---
        let payload = SpeakingPayload {
            user_id: None,
            ssrc: 9,
            speaking: 1,
            delay: 0,
        };
        assert_eq!(
            serde_json::to_value(&payload).expect("serialize"),
            json!({"ssrc": 9, "speaking": 1, "delay": 0})
        );
    }

    #[test]
    fn test_ready_and_session_description() {
        // ---
        let ready: ReadyPayload = serde_json::from_value(json!({
            "ssrc": 1, "ip": "127.0.0.1", "port": 1234,
            "modes": ["xsalsa20_poly1305", "xsalsa20_poly1305_suffix"],
            "heartbeat_interval": 1
        }))
        .expect("ready");
        assert_eq!(ready.modes.len(), 2);

        let description: SessionDescriptionPayload = serde_json::from_value(json!({
            "mode": "xsalsa20_poly1305",
            "secret_key": (0..32).collect::<Vec<u8>>()
        }))
        .expect("session description");
        assert_eq!(description.secret_key.len(), 32);
    }
}
