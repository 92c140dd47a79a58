//! Protocol message types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a forwarded request, unique within its session while pending.
///
/// Allocated from a per-session monotonic counter by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Control channel envelope
///
/// Encoded as a JSON object tagged by `type`, e.g.
/// `{"type":"subdomain_assigned","subdomain":"abcd1234"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Relay → client: the routing label allocated for this connection
    SubdomainAssigned {
        subdomain: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_url: Option<String>,
    },
    /// Relay → client: a public HTTP request to execute against the upstream
    Request(RequestFrame),
    /// Client → relay: the upstream's answer to a [`ControlMessage::Request`]
    Response(ResponseFrame),
    Heartbeat {
        #[serde(default)]
        timestamp: u64,
    },
    HeartbeatAck {
        #[serde(default)]
        timestamp: u64,
    },
    /// Either side: the sender is about to close the channel
    Disconnect { reason: String },
}

impl ControlMessage {
    /// Short name of the variant, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::SubdomainAssigned { .. } => "subdomain_assigned",
            ControlMessage::Request(_) => "request",
            ControlMessage::Response(_) => "response",
            ControlMessage::Heartbeat { .. } => "heartbeat",
            ControlMessage::HeartbeatAck { .. } => "heartbeat_ack",
            ControlMessage::Disconnect { .. } => "disconnect",
        }
    }
}

/// A forwarded HTTP request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestFrame {
    pub id: RequestId,
    pub method: String,
    /// Path including the query string, e.g. `/foo?bar=1`
    pub path: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "body_base64")]
    pub body: Vec<u8>,
}

/// The upstream's response to a [`RequestFrame`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseFrame {
    pub id: RequestId,
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "body_base64")]
    pub body: Vec<u8>,
}

impl ResponseFrame {
    /// Build a plain-text response, as the client relay does for upstream failures
    pub fn text(id: RequestId, status: u16, body: impl Into<String>) -> Self {
        Self {
            id,
            status,
            headers: vec![(
                "content-type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body: body.into().into_bytes(),
        }
    }

    /// Look up the first header with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

// Bodies travel as base64 so that binary payloads survive the JSON envelope
mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
