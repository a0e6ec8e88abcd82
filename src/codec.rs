//! Frame codec: (de)serialization of the wire envelope.
//!
//! The codec is a stateless strategy seam so the connection machinery can be
//! reused with a different wire format.

use crate::Result;
use crate::message::Envelope;

/// Codec converting raw socket payloads to and from [`Envelope`]s.
pub trait FrameCodec: Send + Sync + 'static {
    /// Decode incoming bytes into envelopes.
    ///
    /// Handles both single objects and arrays of envelopes. May return an
    /// empty vec for keep-alive payloads with no content.
    fn decode(&self, bytes: &[u8]) -> Result<Vec<Envelope>>;

    /// Encode an envelope into its wire representation.
    fn encode(&self, envelope: &Envelope) -> Result<String>;
}

/// JSON codec for the standard `{type, data, timestamp, user_id?}` format.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl FrameCodec for JsonCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Vec<Envelope>> {
        // Handle empty or whitespace-only input (server keepalive payloads)
        let trimmed = bytes
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .map_or(&[][..], |start| &bytes[start..]);

        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        // Try parsing as array first, fall back to single object
        if trimmed.first() == Some(&b'[') {
            Ok(serde_json::from_slice(trimmed)?)
        } else {
            let envelope: Envelope = serde_json::from_slice(trimmed)?;
            Ok(vec![envelope])
        }
    }

    fn encode(&self, envelope: &Envelope) -> Result<String> {
        Ok(serde_json::to_string(envelope)?)
    }
}
