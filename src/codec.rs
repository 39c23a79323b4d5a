//! Text-safe framing for binary audio payloads carried inside wire envelopes.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Returned when an inbound payload is not valid encoded audio.
#[derive(Debug, thiserror::Error)]
#[error("malformed payload: {0}")]
pub struct MalformedPayload(#[from] base64::DecodeError);

/// Encodes a raw byte buffer into its text-safe wire form.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decodes a text-safe wire payload back into raw bytes.
///
/// Never fails on output previously produced by [`encode`].
pub fn decode(text: &str) -> Result<Vec<u8>, MalformedPayload> {
    Ok(STANDARD.decode(text)?)
}
