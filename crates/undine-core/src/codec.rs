//! Length-prefixed CBOR framing for the undine channel.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`

use crate::error::{UndineError, UndineResult};
use crate::messages::{Inbound, InboundKind};
use ciborium::Value;
use std::io::Cursor;

/// Default upper bound for a single inbound frame (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> UndineResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    let len = u32::try_from(payload.len()).map_err(|_| UndineError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> UndineResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Outcome of matching one payload against the known inbound shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Record(Inbound),
    /// Well-formed record that fits none of the known shapes.
    Unrecognized { tag: Option<String>, reason: String },
}

impl Decoded {
    /// Index of the matched shape, or -1 when nothing matched.
    pub fn index(&self) -> i32 {
        match self {
            Decoded::Record(record) => record.kind().index() as i32,
            Decoded::Unrecognized { .. } => -1,
        }
    }
}

/// Decode one inbound payload and report which shape matched.
///
/// Malformed CBOR and non-map payloads are errors: the stream can no longer
/// be trusted. A map with an unknown tag or ill-fitting fields is
/// [`Decoded::Unrecognized`].
pub fn decode_inbound(payload: &[u8]) -> UndineResult<Decoded> {
    let value: Value = cbor_decode(payload)?;
    let map = value
        .as_map()
        .ok_or_else(|| UndineError::InvalidMessage("record is not a map".into()))?;

    let tag = map.iter().find_map(|(k, v)| match (k.as_text(), v.as_text()) {
        (Some("type"), Some(t)) => Some(t.to_string()),
        _ => None,
    });
    let Some(tag) = tag else {
        return Ok(Decoded::Unrecognized {
            tag: None,
            reason: "missing type tag".into(),
        });
    };
    if InboundKind::from_tag(&tag).is_none() {
        return Ok(Decoded::Unrecognized {
            tag: Some(tag),
            reason: "unknown type".into(),
        });
    }

    match value.deserialized::<Inbound>() {
        Ok(record) => Ok(Decoded::Record(record)),
        Err(e) => Ok(Decoded::Unrecognized {
            tag: Some(tag),
            reason: e.to_string(),
        }),
    }
}

/// Streaming frame decoder: accumulates bytes and yields complete messages.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_len,
        }
    }

    /// Feed bytes into the decoder and return all complete CBOR-decoded messages.
    pub fn feed<T: serde::de::DeserializeOwned>(&mut self, data: &[u8]) -> UndineResult<Vec<T>> {
        self.feed_raw(data)?
            .iter()
            .map(|payload| cbor_decode(payload))
            .collect()
    }

    /// Feed raw bytes and return complete raw frames (undecoded CBOR payloads).
    ///
    /// Fails once a length prefix exceeds the configured maximum; the
    /// buffer is left as-is since the stream cannot be resynchronized.
    pub fn feed_raw(&mut self, data: &[u8]) -> UndineResult<Vec<Vec<u8>>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            if self.buffer.len() < 4 {
                break;
            }
            let len =
                u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                    as usize;
            if len > self.max_frame_len {
                return Err(UndineError::FrameTooLarge {
                    len,
                    max: self.max_frame_len,
                });
            }

            if self.buffer.len() < 4 + len {
                break;
            }

            let payload = self.buffer[4..4 + len].to_vec();
            frames.push(payload);
            self.buffer.drain(..4 + len);
        }

        Ok(frames)
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Outbound;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestMsg {
        name: String,
        value: i64,
    }

    #[test]
    fn round_trip_multiple() {
        let msgs = vec![
            TestMsg {
                name: "a".into(),
                value: 1,
            },
            TestMsg {
                name: "b".into(),
                value: 2,
            },
        ];

        let mut combined = Vec::new();
        for m in &msgs {
            combined.extend(frame_encode(m).unwrap());
        }

        let mut decoder = FrameDecoder::new();
        let decoded: Vec<TestMsg> = decoder.feed(&combined).unwrap();
        assert_eq!(decoded, msgs);
    }

    #[test]
    fn incremental_feed() {
        let frame = frame_encode(&Outbound::Ping).unwrap();
        let mut decoder = FrameDecoder::new();

        // Feed one byte at a time
        for i in 0..frame.len() - 1 {
            let decoded: Vec<Outbound> = decoder.feed(&frame[i..i + 1]).unwrap();
            assert!(decoded.is_empty());
        }
        let decoded: Vec<Outbound> = decoder.feed(&frame[frame.len() - 1..]).unwrap();
        assert_eq!(decoded, vec![Outbound::Ping]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn pending_bytes() {
        let frame = frame_encode(&Outbound::Ping).unwrap();
        let mut decoder = FrameDecoder::new();

        decoder.feed_raw(&frame[..3]).unwrap();
        assert_eq!(decoder.pending(), 3);

        let frames = decoder.feed_raw(&frame[3..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut decoder = FrameDecoder::with_max_frame_len(8);
        let err = decoder.feed_raw(&[0, 0, 0, 9, 1, 2]).unwrap_err();
        assert!(matches!(err, UndineError::FrameTooLarge { len: 9, max: 8 }));
    }

    #[test]
    fn decode_reports_matched_shape() {
        let frame = frame_encode(&Inbound::RequestGlob {
            id: "g".into(),
            pattern: "*".into(),
        })
        .unwrap();
        let decoded = decode_inbound(&frame[4..]).unwrap();
        assert_eq!(decoded.index(), 5);
        assert!(matches!(decoded, Decoded::Record(Inbound::RequestGlob { .. })));

        let frame = frame_encode(&Inbound::Ping).unwrap();
        assert_eq!(decode_inbound(&frame[4..]).unwrap().index(), 4);
    }

    #[test]
    fn unknown_tag_is_unrecognized() {
        let frame = frame_encode(&TaggedOnly {
            kind: "resize".into(),
        })
        .unwrap();
        let decoded = decode_inbound(&frame[4..]).unwrap();
        assert_eq!(decoded.index(), -1);
        assert_eq!(
            decoded,
            Decoded::Unrecognized {
                tag: Some("resize".into()),
                reason: "unknown type".into(),
            }
        );
    }

    #[test]
    fn known_tag_with_missing_fields_is_unrecognized() {
        // `command` without `uuid` or `command` fields.
        let frame = frame_encode(&TaggedOnly {
            kind: "command".into(),
        })
        .unwrap();
        match decode_inbound(&frame[4..]).unwrap() {
            Decoded::Unrecognized { tag, .. } => assert_eq!(tag.as_deref(), Some("command")),
            other => panic!("expected unrecognized, got {other:?}"),
        }
    }

    #[test]
    fn missing_tag_is_unrecognized() {
        let frame = frame_encode(&TestMsg {
            name: "x".into(),
            value: 1,
        })
        .unwrap();
        assert!(matches!(
            decode_inbound(&frame[4..]).unwrap(),
            Decoded::Unrecognized { tag: None, .. }
        ));
    }

    #[test]
    fn malformed_payload_is_an_error() {
        // Map header promising one pair, then nothing.
        assert!(decode_inbound(&[0xa1]).is_err());
        // A bare integer is not a record.
        let frame = frame_encode(&7u32).unwrap();
        assert!(matches!(
            decode_inbound(&frame[4..]),
            Err(UndineError::InvalidMessage(_))
        ));
    }

    #[derive(Serialize)]
    struct TaggedOnly {
        #[serde(rename = "type")]
        kind: String,
    }
}
