//! Codec for encoding and decoding Chorus envelopes.
//!
//! Envelopes travel as JSON text. A single outbound frame may carry several
//! envelopes separated by `\n` when the writer batches queued messages, so
//! readers should use [`decode_batch`].

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum encoded envelope size (1 MiB).
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// Separator between envelopes in a batched frame.
pub const BATCH_SEPARATOR: u8 = b'\n';

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds maximum size.
    #[error("Envelope size {0} exceeds maximum {MAX_ENVELOPE_SIZE}")]
    TooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode an envelope to bytes.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(envelope, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode an envelope and append it to an existing buffer.
///
/// If the buffer already holds data, a [`BATCH_SEPARATOR`] is written first.
/// On error the buffer is left unchanged.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode_into(envelope: &Envelope, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = serde_json::to_vec(envelope)?;

    if payload.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(payload.len()));
    }

    buf.reserve(payload.len() + 1);
    if !buf.is_empty() {
        buf.put_u8(BATCH_SEPARATOR);
    }
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode exactly one envelope.
///
/// # Errors
///
/// Returns an error if the data is not a JSON envelope.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    if data.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(data.len()));
    }
    Ok(serde_json::from_slice(data)?)
}

/// Decode an inbound payload, degrading to plain text.
///
/// Anything that is not a JSON envelope is wrapped as a `text` message whose
/// text is the raw payload. The second value is `true` when the payload was
/// degraded.
#[must_use]
pub fn decode_lenient(data: &[u8]) -> (Envelope, bool) {
    match decode(data) {
        Ok(envelope) => (envelope, false),
        Err(_) => (Envelope::text(String::from_utf8_lossy(data)), true),
    }
}

/// Decode every envelope in a possibly batched frame.
///
/// # Errors
///
/// Returns the first decoding error encountered.
pub fn decode_batch(data: &[u8]) -> Result<Vec<Envelope>, ProtocolError> {
    serde_json::Deserializer::from_slice(data)
        .into_iter::<Envelope>()
        .map(|item| item.map_err(ProtocolError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageType;

    #[test]
    fn test_encode_decode() {
        let envelope = Envelope::text("hello").with_origin("r1", "alice");
        let encoded = encode(&envelope).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn test_wire_field_names() {
        let envelope = Envelope::text("hi").with_origin("r1", "alice");
        let value: serde_json::Value = serde_json::from_slice(&encode(&envelope).unwrap()).unwrap();

        assert_eq!(value["type"], "text");
        assert_eq!(value["room_id"], "r1");
        assert_eq!(value["sender_id"], "alice");
        assert_eq!(value["content"]["text"], "hi");
        assert!(value["created_at"].is_i64());
    }

    #[test]
    fn test_decode_lenient_wraps_garbage() {
        let (envelope, degraded) = decode_lenient(b"not json at all");
        assert!(degraded);
        assert_eq!(envelope.kind, MessageType::Text);
        assert_eq!(envelope.content["text"], "not json at all");
    }

    #[test]
    fn test_decode_lenient_wraps_wrong_shape() {
        // Valid JSON, but not an object.
        let (envelope, degraded) = decode_lenient(b"\"just a string\"");
        assert!(degraded);
        assert_eq!(envelope.content["text"], "\"just a string\"");

        let (envelope, degraded) = decode_lenient(br#"{"type":"text","room_id":7}"#);
        assert!(degraded);
        assert_eq!(envelope.kind, MessageType::Text);
    }

    #[test]
    fn test_batched_frame() {
        let first = Envelope::text("one").with_origin("r1", "alice");
        let second = Envelope::join("r1", "bob");

        let mut buf = BytesMut::new();
        encode_into(&first, &mut buf).unwrap();
        encode_into(&second, &mut buf).unwrap();
        assert_eq!(buf.iter().filter(|b| **b == BATCH_SEPARATOR).count(), 1);

        let decoded = decode_batch(&buf).unwrap();
        assert_eq!(decoded, vec![first, second]);
    }

    #[test]
    fn test_decode_too_large() {
        let data = vec![b' '; MAX_ENVELOPE_SIZE + 1];
        assert!(matches!(decode(&data), Err(ProtocolError::TooLarge(_))));
    }
}
