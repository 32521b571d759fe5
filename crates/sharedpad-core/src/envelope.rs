//! Edit events exchanged between instances and their wire codec.
//!
//! Each event travels as a bus signal whose member name is the variant's
//! name (`characterInserted`, `fullSnapshot`, ...) and whose body is the
//! bincode encoding of an [`EditEnvelope`]: the sender identity followed by
//! the variant's fields in declaration order.
//!
//! Replies to direct calls (`bool`, [`ToolbarSnapshot`]) use the same codec.
//!
//! [`ToolbarSnapshot`]: crate::format::ToolbarSnapshot

use crate::format::FormatKind;
use crate::identity::InstanceId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version of the envelope wire shape.
///
/// Registered with the bus before any traffic; increment on any change to
/// `EditEvent`, `EditEnvelope` or `ToolbarSnapshot`.
pub const WIRE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to encode {what}: {reason}")]
    Encode { what: &'static str, reason: String },

    #[error("Failed to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },

    #[error("Signal member {member:?} does not match payload variant {variant:?}")]
    MemberMismatch { member: String, variant: &'static str },

    #[error("Unknown event member: {0}")]
    UnknownMember(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// A single local edit or command, replayed by every peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EditEvent {
    /// One typed or pasted character plus the format it was typed with.
    CharacterInserted {
        character: char,
        color_hex: String,
        font_descriptor: String,
    },
    /// Whole-document replacement.
    FullSnapshot { html: String, cursor_pos: usize },
    CursorMoved { pos: usize },
    SelectionChanged { start: usize, end: usize },
    DeleteBackward,
    DeleteForward,
    SelectAll,
    /// Clipboard paste, rich (`is_html`) or plain.
    RawInsert { is_html: bool, payload: String },
    FormatToggled { kind: FormatKind, enabled: bool },
    TextFamilyChanged { name: String },
    TextSizeChanged { points: f32 },
    TextColorChanged { color_hex: String },
}

/// Every member name, in variant order.
pub const EVENT_MEMBERS: &[&str] = &[
    "characterInserted",
    "fullSnapshot",
    "cursorMoved",
    "selectionChanged",
    "deleteBackward",
    "deleteForward",
    "selectAll",
    "rawInsert",
    "formatToggled",
    "textFamilyChanged",
    "textSizeChanged",
    "textColorChanged",
];

impl EditEvent {
    /// Bus member name for this variant.
    pub fn member(&self) -> &'static str {
        match self {
            Self::CharacterInserted { .. } => "characterInserted",
            Self::FullSnapshot { .. } => "fullSnapshot",
            Self::CursorMoved { .. } => "cursorMoved",
            Self::SelectionChanged { .. } => "selectionChanged",
            Self::DeleteBackward => "deleteBackward",
            Self::DeleteForward => "deleteForward",
            Self::SelectAll => "selectAll",
            Self::RawInsert { .. } => "rawInsert",
            Self::FormatToggled { .. } => "formatToggled",
            Self::TextFamilyChanged { .. } => "textFamilyChanged",
            Self::TextSizeChanged { .. } => "textSizeChanged",
            Self::TextColorChanged { .. } => "textColorChanged",
        }
    }

    pub fn is_event_member(member: &str) -> bool {
        EVENT_MEMBERS.contains(&member)
    }
}

/// An event stamped with its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditEnvelope {
    pub sender: InstanceId,
    pub event: EditEvent,
}

impl EditEnvelope {
    pub fn new(sender: InstanceId, event: EditEvent) -> Self {
        Self { sender, event }
    }

    pub fn member(&self) -> &'static str {
        self.event.member()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_value("edit envelope", self)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        decode_value("edit envelope", data)
    }

    /// Decode a payload received under `member`, rejecting payloads whose
    /// variant disagrees with the member they arrived on.
    pub fn decode_for(member: &str, data: &[u8]) -> Result<Self> {
        if !EditEvent::is_event_member(member) {
            return Err(CodecError::UnknownMember(member.to_string()));
        }
        let envelope = Self::decode(data)?;
        if envelope.member() != member {
            return Err(CodecError::MemberMismatch {
                member: member.to_string(),
                variant: envelope.member(),
            });
        }
        Ok(envelope)
    }
}

/// Encode any reply or payload with the envelope codec.
pub fn encode_value<T: Serialize>(what: &'static str, value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| CodecError::Encode {
        what,
        reason: e.to_string(),
    })
}

/// Decode any reply or payload with the envelope codec.
pub fn decode_value<T: DeserializeOwned>(what: &'static str, data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| CodecError::Decode {
        what,
        reason: e.to_string(),
    })
}
