use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{SessionId, StreamId, TunnelId};
use crate::error::{Result, SluiceError};

/// Error codes carried by [`Frame::Error`]
pub mod codes {
    pub const AUTH_FAILED: &str = "auth_failed";
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const UNSUPPORTED_PROTO: &str = "unsupported_proto";
    pub const BIND_FAILED: &str = "bind_failed";
    pub const UNKNOWN_TUNNEL: &str = "unknown_tunnel";
}

/// PROXY protocol header written in front of forwarded connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProxyProto {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "1")]
    V1,
    #[serde(rename = "2")]
    V2,
}

impl FromStr for ProxyProto {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(ProxyProto::None),
            "1" | "v1" => Ok(ProxyProto::V1),
            "2" | "v2" => Ok(ProxyProto::V2),
            other => Err(SluiceError::Protocol(format!(
                "unknown proxy protocol version '{}' (expected \"\", \"1\" or \"2\")",
                other
            ))),
        }
    }
}

impl fmt::Display for ProxyProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyProto::None => write!(f, "none"),
            ProxyProto::V1 => write!(f, "1"),
            ProxyProto::V2 => write!(f, "2"),
        }
    }
}

/// Options sent with a `listen` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointOptions {
    pub proto: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwards_to: Option<String>,
    #[serde(default)]
    pub proxy_proto: ProxyProto,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_cidrs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny_cidrs: Vec<String>,
}

impl EndpointOptions {
    pub fn tcp() -> Self {
        Self {
            proto: "tcp".to_string(),
            metadata: None,
            remote_addr: None,
            forwards_to: None,
            proxy_proto: ProxyProto::None,
            allow_cidrs: Vec::new(),
            deny_cidrs: Vec::new(),
        }
    }
}

/// A control connection frame. Both peers speak the same set; each side
/// ignores or rejects the variants it never expects to receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Auth {
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume: Option<SessionId>,
        #[serde(default)]
        client_version: String,
    },
    AuthOk {
        session_id: SessionId,
    },
    Listen {
        request_id: u64,
        endpoint: EndpointOptions,
    },
    Listening {
        request_id: u64,
        tunnel_id: TunnelId,
        url: String,
        remote_addr: String,
    },
    Unlisten {
        tunnel_id: TunnelId,
    },
    StreamOpen {
        stream_id: StreamId,
        tunnel_id: TunnelId,
        remote_addr: String,
        local_addr: String,
    },
    StreamData {
        stream_id: StreamId,
        data: String,
    },
    StreamAck {
        stream_id: StreamId,
        bytes: u32,
    },
    StreamClose {
        stream_id: StreamId,
        #[serde(default)]
        reason: String,
    },
    StreamReset {
        stream_id: StreamId,
        #[serde(default)]
        reason: String,
    },
    Heartbeat {
        timestamp: u64,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        code: String,
        message: String,
    },
}

impl Frame {
    pub fn auth(token: &str, metadata: Option<&str>, resume: Option<SessionId>) -> Self {
        Frame::Auth {
            token: token.to_string(),
            metadata: metadata.map(|m| m.to_string()),
            resume,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn stream_data(stream_id: StreamId, data: &[u8]) -> Self {
        Frame::StreamData {
            stream_id,
            data: base64::engine::general_purpose::STANDARD.encode(data),
        }
    }

    pub fn stream_close(stream_id: StreamId, reason: &str) -> Self {
        Frame::StreamClose {
            stream_id,
            reason: reason.to_string(),
        }
    }

    pub fn stream_reset(stream_id: StreamId, reason: &str) -> Self {
        Frame::StreamReset {
            stream_id,
            reason: reason.to_string(),
        }
    }

    pub fn error(request_id: Option<u64>, code: &str, message: impl Into<String>) -> Self {
        Frame::Error {
            request_id,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn heartbeat() -> Self {
        Frame::Heartbeat {
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    /// The stream this frame belongs to, if it is a stream frame
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Frame::StreamOpen { stream_id, .. }
            | Frame::StreamData { stream_id, .. }
            | Frame::StreamAck { stream_id, .. }
            | Frame::StreamClose { stream_id, .. }
            | Frame::StreamReset { stream_id, .. } => Some(*stream_id),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Decode a base64 `stream_data` payload
pub fn decode_data(data: &str) -> Result<Vec<u8>> {
    Ok(base64::engine::general_purpose::STANDARD.decode(data)?)
}
