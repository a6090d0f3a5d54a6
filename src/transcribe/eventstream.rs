//! # Event-Stream Frame Codec
//!
//! The upstream speaks a self-describing binary framing protocol in both
//! directions: outbound audio and inbound transcripts/exceptions are all
//! carried as frames of named, typed headers plus an opaque payload.
//!
//! ## Frame Layout (all integers big-endian):
//! ```text
//! +-----------------+-----------------+------------------+
//! | total length u32| headers len u32 | prelude CRC-32   |  12-byte prelude
//! +-----------------+-----------------+------------------+
//! | header block: name len u8, name, type tag u8, value  |
//! |   (string values: length u16 + UTF-8 bytes)          |
//! +-------------------------------------------------------+
//! | payload bytes                                         |
//! +-------------------------------------------------------+
//! | message CRC-32 over everything above                  |
//! +-------------------------------------------------------+
//! ```
//!
//! Every frame this system exchanges uses string-typed headers. Decoding
//! still consumes the other value types by their wire size so frames with
//! extra headers pass through instead of failing — callers only interpret
//! `:message-type` and `:event-type`.

use crate::error::RelayError;
use byteorder::{BigEndian, ByteOrder};

/// Header type tag for UTF-8 string values.
const HEADER_TYPE_STRING: u8 = 7;

/// Prelude (two lengths + CRC) plus the trailing CRC.
const FRAME_OVERHEAD: usize = 16;

pub const HEADER_MESSAGE_TYPE: &str = ":message-type";
pub const HEADER_EVENT_TYPE: &str = ":event-type";
pub const HEADER_CONTENT_TYPE: &str = ":content-type";

/// One decoded frame: ordered string headers plus the raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub headers: Vec<(String, String)>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Look up a header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Message type (`event`, `exception`, ...), empty when absent.
    pub fn message_type(&self) -> &str {
        self.header(HEADER_MESSAGE_TYPE).unwrap_or_default()
    }

    /// Event type (`TranscriptEvent`, `BadRequestException`, ...), empty
    /// when absent.
    pub fn event_type(&self) -> &str {
        self.header(HEADER_EVENT_TYPE).unwrap_or_default()
    }
}

/// Build the outbound audio frame: exactly the three headers the upstream
/// expects plus the raw PCM bytes as payload.
pub fn audio_event(pcm: Vec<u8>) -> Frame {
    Frame {
        headers: vec![
            (HEADER_MESSAGE_TYPE.to_string(), "event".to_string()),
            (HEADER_EVENT_TYPE.to_string(), "AudioEvent".to_string()),
            (
                HEADER_CONTENT_TYPE.to_string(),
                "application/octet-stream".to_string(),
            ),
        ],
        payload: pcm,
    }
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    let mut bytes = [0u8; 4];
    BigEndian::write_u32(&mut bytes, value);
    buf.extend_from_slice(&bytes);
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    let mut bytes = [0u8; 2];
    BigEndian::write_u16(&mut bytes, value);
    buf.extend_from_slice(&bytes);
}

/// Encode a frame into its wire representation.
pub fn encode(frame: &Frame) -> Vec<u8> {
    let mut header_block = Vec::new();
    for (name, value) in &frame.headers {
        debug_assert!(name.len() <= u8::MAX as usize);
        debug_assert!(value.len() <= u16::MAX as usize);
        header_block.push(name.len() as u8);
        header_block.extend_from_slice(name.as_bytes());
        header_block.push(HEADER_TYPE_STRING);
        put_u16(&mut header_block, value.len() as u16);
        header_block.extend_from_slice(value.as_bytes());
    }

    let total_len = FRAME_OVERHEAD + header_block.len() + frame.payload.len();
    let mut out = Vec::with_capacity(total_len);
    put_u32(&mut out, total_len as u32);
    put_u32(&mut out, header_block.len() as u32);
    let prelude_crc = crc32fast::hash(&out[0..8]);
    put_u32(&mut out, prelude_crc);
    out.extend_from_slice(&header_block);
    out.extend_from_slice(&frame.payload);
    let message_crc = crc32fast::hash(&out);
    put_u32(&mut out, message_crc);

    out
}

/// Consume one header value of the given type tag, returning the string
/// content for string headers and `None` for every other type.
fn read_header_value(
    buf: &[u8],
    pos: &mut usize,
    type_tag: u8,
) -> Result<Option<String>, RelayError> {
    // Fixed-size and length-prefixed value sizes by type tag
    let value_len = match type_tag {
        0 | 1 => 0,              // boolean true / false, no value bytes
        2 => 1,                  // byte
        3 => 2,                  // short
        4 => 4,                  // integer
        5 | 8 => 8,              // long / timestamp
        9 => 16,                 // uuid
        6 | HEADER_TYPE_STRING => {
            if buf.len() < *pos + 2 {
                return Err(RelayError::Decode(
                    "truncated header value length".to_string(),
                ));
            }
            let len = BigEndian::read_u16(&buf[*pos..*pos + 2]) as usize;
            *pos += 2;
            len
        }
        other => {
            return Err(RelayError::Decode(format!(
                "unknown header value type {}",
                other
            )))
        }
    };

    if buf.len() < *pos + value_len {
        return Err(RelayError::Decode("truncated header value".to_string()));
    }
    let value_bytes = &buf[*pos..*pos + value_len];
    *pos += value_len;

    if type_tag == HEADER_TYPE_STRING {
        let value = String::from_utf8(value_bytes.to_vec())
            .map_err(|_| RelayError::Decode("header value is not UTF-8".to_string()))?;
        Ok(Some(value))
    } else {
        Ok(None)
    }
}

/// Decode one wire frame.
///
/// Rejects truncated input, length mismatches and checksum mismatches with
/// `RelayError::Decode`. Header names are passed through whether or not
/// this system recognizes them.
pub fn decode(buf: &[u8]) -> Result<Frame, RelayError> {
    if buf.len() < FRAME_OVERHEAD {
        return Err(RelayError::Decode(format!(
            "frame too short: {} bytes",
            buf.len()
        )));
    }

    let total_len = BigEndian::read_u32(&buf[0..4]) as usize;
    let headers_len = BigEndian::read_u32(&buf[4..8]) as usize;
    if total_len != buf.len() {
        return Err(RelayError::Decode(format!(
            "frame length mismatch: declared {}, got {}",
            total_len,
            buf.len()
        )));
    }
    if FRAME_OVERHEAD + headers_len > total_len {
        return Err(RelayError::Decode(
            "header block exceeds frame length".to_string(),
        ));
    }

    let prelude_crc = BigEndian::read_u32(&buf[8..12]);
    if prelude_crc != crc32fast::hash(&buf[0..8]) {
        return Err(RelayError::Decode("prelude checksum mismatch".to_string()));
    }
    let message_crc = BigEndian::read_u32(&buf[total_len - 4..]);
    if message_crc != crc32fast::hash(&buf[..total_len - 4]) {
        return Err(RelayError::Decode("message checksum mismatch".to_string()));
    }

    let header_block = &buf[12..12 + headers_len];
    let mut headers = Vec::new();
    let mut pos = 0usize;
    while pos < header_block.len() {
        let name_len = header_block[pos] as usize;
        pos += 1;
        if header_block.len() < pos + name_len + 1 {
            return Err(RelayError::Decode("truncated header name".to_string()));
        }
        let name = String::from_utf8(header_block[pos..pos + name_len].to_vec())
            .map_err(|_| RelayError::Decode("header name is not UTF-8".to_string()))?;
        pos += name_len;
        let type_tag = header_block[pos];
        pos += 1;

        // Non-string values are consumed but not surfaced
        if let Some(value) = read_header_value(header_block, &mut pos, type_tag)? {
            headers.push((name, value));
        }
    }

    Ok(Frame {
        headers,
        payload: buf[12 + headers_len..total_len - 4].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript_frame() -> Frame {
        Frame {
            headers: vec![
                (HEADER_MESSAGE_TYPE.to_string(), "event".to_string()),
                (HEADER_EVENT_TYPE.to_string(), "TranscriptEvent".to_string()),
                (
                    HEADER_CONTENT_TYPE.to_string(),
                    "application/json".to_string(),
                ),
            ],
            payload: br#"{"Transcript":{"Results":[]}}"#.to_vec(),
        }
    }

    #[test]
    fn test_round_trip_preserves_headers_and_payload() {
        let frame = transcript_frame();
        let decoded = decode(&encode(&frame)).unwrap();

        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_round_trip_with_empty_payload() {
        let frame = Frame {
            headers: vec![(HEADER_MESSAGE_TYPE.to_string(), "event".to_string())],
            payload: Vec::new(),
        };

        assert_eq!(decode(&encode(&frame)).unwrap(), frame);
    }

    #[test]
    fn test_audio_event_has_exactly_the_expected_headers() {
        let frame = audio_event(vec![0, 0, 0]);

        assert_eq!(
            frame.headers,
            vec![
                (":message-type".to_string(), "event".to_string()),
                (":event-type".to_string(), "AudioEvent".to_string()),
                (
                    ":content-type".to_string(),
                    "application/octet-stream".to_string()
                ),
            ]
        );
        assert_eq!(frame.payload, vec![0, 0, 0]);
    }

    #[test]
    fn test_truncated_frame_is_rejected() {
        let bytes = encode(&transcript_frame());

        assert!(decode(&bytes[..10]).is_err());
        assert!(decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn test_corrupted_payload_fails_message_checksum() {
        let mut bytes = encode(&transcript_frame());
        let payload_start = bytes.len() - 4 - 29;
        bytes[payload_start] ^= 0xFF;

        let err = decode(&bytes).unwrap_err();
        assert_eq!(
            err,
            RelayError::Decode("message checksum mismatch".to_string())
        );
    }

    #[test]
    fn test_corrupted_prelude_is_rejected() {
        let mut bytes = encode(&transcript_frame());
        // Flip a headers-length bit without fixing the prelude checksum
        bytes[7] ^= 0x01;

        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn test_unrecognized_header_names_pass_through() {
        let frame = Frame {
            headers: vec![
                (":message-type".to_string(), "event".to_string()),
                (":x-custom-header".to_string(), "anything".to_string()),
            ],
            payload: vec![1, 2, 3],
        };

        let decoded = decode(&encode(&frame)).unwrap();
        assert_eq!(decoded.header(":x-custom-header"), Some("anything"));
    }

    #[test]
    fn test_non_string_header_types_are_skipped_not_fatal() {
        // Hand-build a header block with a boolean header followed by a
        // string header, then frame it manually.
        let mut header_block = Vec::new();
        header_block.push(5u8);
        header_block.extend_from_slice(b":flag");
        header_block.push(0u8); // boolean true, no value bytes
        header_block.push(13u8);
        header_block.extend_from_slice(b":message-type");
        header_block.push(HEADER_TYPE_STRING);
        put_u16(&mut header_block, 5);
        header_block.extend_from_slice(b"event");

        let payload = b"x";
        let total_len = FRAME_OVERHEAD + header_block.len() + payload.len();
        let mut bytes = Vec::new();
        put_u32(&mut bytes, total_len as u32);
        put_u32(&mut bytes, header_block.len() as u32);
        let prelude_crc = crc32fast::hash(&bytes[0..8]);
        put_u32(&mut bytes, prelude_crc);
        bytes.extend_from_slice(&header_block);
        bytes.extend_from_slice(payload);
        let message_crc = crc32fast::hash(&bytes);
        put_u32(&mut bytes, message_crc);

        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.message_type(), "event");
        assert_eq!(frame.header(":flag"), None);
        assert_eq!(frame.payload, b"x");
    }

    #[test]
    fn test_frame_header_accessors() {
        let frame = transcript_frame();

        assert_eq!(frame.message_type(), "event");
        assert_eq!(frame.event_type(), "TranscriptEvent");
        assert_eq!(frame.header(":missing"), None);
    }
}
