//! Broker protocol frames.
//!
//! Frames are JSON sent as binary WebSocket frames (UTF-8 bytes), tagged by
//! `"type"`. Payload bodies are opaque bytes (JSON number arrays); the
//! broker never looks inside them.
//!
//! Session lifecycle: the broker greets with `welcome`, the client answers
//! `hello`. Requests carry a client-chosen `serial` that comes back on the
//! matching `done`, `names` or `return`.

use serde::{Deserialize, Serialize};
use sharedpad_core::{BusError, MethodCall, Signal};

/// Maximum frame size (50MB) to prevent memory exhaustion from misbehaving clients.
pub const MAX_FRAME_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    /// Broker -> client, first frame on every connection.
    #[serde(rename_all = "camelCase")]
    Welcome { unique_name: String, wire_version: u32 },

    /// Client -> broker, acknowledges the welcome.
    Hello,

    #[serde(rename_all = "camelCase")]
    RegisterTypes { serial: u64, wire_version: u32 },

    RegisterObject {
        serial: u64,
        path: String,
        interface: String,
    },

    RequestName { serial: u64, name: String },

    ListNames { serial: u64 },

    Subscribe { serial: u64, interface: String },

    /// Client -> broker broadcast.
    Emit { signal: Signal },

    /// Broker -> subscriber delivery.
    Signal { signal: Signal },

    /// Both directions: caller -> broker, then broker -> callee.
    Call { serial: u64, call: MethodCall },

    /// Both directions: callee -> broker, then broker -> caller.
    Return {
        serial: u64,
        result: Result<Vec<u8>, BusError>,
    },

    /// Broker -> client, outcome of a registration or subscription request.
    Done {
        serial: u64,
        result: Result<(), BusError>,
    },

    /// Broker -> client, reply to `listNames`.
    Names { serial: u64, names: Vec<String> },
}

impl Frame {
    /// Serialize to UTF-8 JSON bytes for sending as binary WebSocket frame.
    pub fn to_binary(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Try to parse a frame from binary data.
    ///
    /// Returns None if the data is not valid UTF-8 JSON or not a known frame.
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(data).ok()?;
        serde_json::from_str(text).ok()
    }

    /// Serial of a request or reply frame.
    pub fn serial(&self) -> Option<u64> {
        match self {
            Self::RegisterTypes { serial, .. }
            | Self::RegisterObject { serial, .. }
            | Self::RequestName { serial, .. }
            | Self::ListNames { serial }
            | Self::Subscribe { serial, .. }
            | Self::Call { serial, .. }
            | Self::Return { serial, .. }
            | Self::Done { serial, .. }
            | Self::Names { serial, .. } => Some(*serial),
            Self::Welcome { .. } | Self::Hello | Self::Emit { .. } | Self::Signal { .. } => None,
        }
    }
}
