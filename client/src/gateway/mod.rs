//! Control-plane protocol: JSON messages exchanged over the voice websocket.
//!
//! Every frame is an envelope `{"op": <opcode>, "d": <payload>}`. Opcode
//! numbers are fixed by the relay.

mod heartbeat;
mod payloads;

pub use heartbeat::{unix_millis, HeartbeatTracker};
pub(crate) use heartbeat::spawn_heartbeat;
pub use payloads::{
    ClientConnectedPayload, ClientDisconnectPayload, HelloPayload, IdentifyPayload,
    ReadyPayload, ResumePayload, SelectProtocolData, SelectProtocolPayload,
    SessionDescriptionPayload, SpeakingPayload,
};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, VoiceError};

/// Voice gateway operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Identify = 0,
    SelectProtocol = 1,
    Ready = 2,
    Heartbeat = 3,
    SessionDescription = 4,
    Speaking = 5,
    HeartbeatAck = 6,
    Resume = 7,
    Hello = 8,
    Resumed = 9,
    ClientConnected = 12,
    ClientDisconnect = 13,
}

impl OpCode {
    // ---
    pub fn from_u8(op: u8) -> Option<Self> {
        // ---
        let op = match op {
            0 => OpCode::Identify,
            1 => OpCode::SelectProtocol,
            2 => OpCode::Ready,
            3 => OpCode::Heartbeat,
            4 => OpCode::SessionDescription,
            5 => OpCode::Speaking,
            6 => OpCode::HeartbeatAck,
            7 => OpCode::Resume,
            8 => OpCode::Hello,
            9 => OpCode::Resumed,
            12 => OpCode::ClientConnected,
            13 => OpCode::ClientDisconnect,
            _ => return None,
        };
        Some(op)
    }
}

/// The JSON envelope carried by every websocket text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayMessage {
    // ---
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

impl GatewayMessage {
    // ---
    /// Wraps a typed payload.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Json`] if the payload cannot be serialized.
    pub fn new<T: Serialize>(op: OpCode, payload: &T) -> Result<Self> {
        // ---
        Ok(Self {
            op: op as u8,
            d: serde_json::to_value(payload)?,
        })
    }

    /// Heartbeat carrying `nonce`, echoed back in the ack.
    pub fn heartbeat(nonce: u64) -> Self {
        // ---
        Self {
            op: OpCode::Heartbeat as u8,
            d: Value::from(nonce),
        }
    }

    pub fn opcode(&self) -> Option<OpCode> {
        // ---
        OpCode::from_u8(self.op)
    }

    /// Decodes the payload as `T`.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Json`] if `d` does not have the expected shape.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        // ---
        Ok(T::deserialize(&self.d)?)
    }

    /// Integer payload of Heartbeat and HeartbeatAck.
    pub fn nonce(&self) -> Result<u64> {
        // ---
        let nonce = match &self.d {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        };
        nonce.ok_or_else(|| {
            VoiceError::protocol(format!("heartbeat payload is not an integer: {}", self.d))
        })
    }

    pub fn to_json(&self) -> Result<String> {
        // ---
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        // ---
        Ok(serde_json::from_str(text)?)
    }
}

/// Ids travel as strings but some relays send numbers; accept both.
pub(crate) mod snowflake {
    // ---
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    fn parse<E: serde::de::Error>(raw: Raw) -> Result<u64, E> {
        // ---
        match raw {
            Raw::Number(n) => Ok(n),
            Raw::Text(s) => s.parse().map_err(E::custom),
        }
    }

    pub fn serialize<S: Serializer>(id: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        // ---
        serializer.collect_str(id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        // ---
        parse(Raw::deserialize(deserializer)?)
    }

    pub mod option {
        // ---
        use super::{parse, Raw};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(id: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
            // ---
            match id {
                Some(id) => serializer.collect_str(id),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
            // ---
            Option::<Raw>::deserialize(deserializer)?.map(parse).transpose()
        }
    }
}
