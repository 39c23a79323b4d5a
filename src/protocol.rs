//! Defines the wire message protocol exchanged with the remote agent endpoint.

use crate::codec;
use serde::{Deserialize, Serialize};

/// Content kind of a payload-bearing envelope.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeType {
    #[serde(rename = "text/plain")]
    TextPlain,
    #[serde(rename = "audio/pcm")]
    AudioPcm,
}

/// Who authored a text payload.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One discrete message unit exchanged over the duplex channel.
///
/// A payload-bearing envelope carries exactly one of {text, audio} in `data`,
/// tagged by `mime_type`. A turn-boundary envelope sets `turn_complete` or
/// `interrupted` and carries no payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mime_type: Option<MimeType>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub turn_complete: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub interrupted: Option<bool>,
}

impl Envelope {
    /// Builds an outbound text envelope. Outbound text is always user-authored.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            mime_type: Some(MimeType::TextPlain),
            data: Some(text.into()),
            role: Some(Role::User),
            turn_complete: None,
            interrupted: None,
        }
    }

    /// Builds an outbound audio envelope from a raw PCM16 buffer. No role tag.
    pub fn audio_chunk(pcm: &[u8]) -> Self {
        Self {
            mime_type: Some(MimeType::AudioPcm),
            data: Some(codec::encode(pcm)),
            role: None,
            turn_complete: None,
            interrupted: None,
        }
    }

    /// True when this envelope ends the in-flight model turn, either normally
    /// or because the turn was cut short.
    pub fn is_turn_boundary(&self) -> bool {
        self.turn_complete == Some(true) || self.interrupted == Some(true)
    }
}
