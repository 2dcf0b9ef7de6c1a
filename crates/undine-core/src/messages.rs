// undine protocol record types.
//
// Every record is a CBOR map whose `type` key selects the kind; the
// remaining keys are the record fields. The correlation key is `uuid`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Error codes carried by [`Outbound::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "exec not found")]
    NotFound,
    #[serde(rename = "other")]
    Other,
    #[serde(rename = "fatal")]
    Fatal,
}

impl ErrorCode {
    /// Wire name, as used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "exec not found",
            ErrorCode::Other => "other",
            ErrorCode::Fatal => "fatal",
        }
    }
}

/// Shapes the peer may send, in decoder order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InboundKind {
    Command = 0,
    Stdin = 1,
    RequestReport = 2,
    RequestChdir = 3,
    Ping = 4,
    RequestGlob = 5,
}

impl InboundKind {
    /// Resolve a wire `type` tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "command" => Some(Self::Command),
            "stdin" => Some(Self::Stdin),
            "request_report" => Some(Self::RequestReport),
            "request_chdir" => Some(Self::RequestChdir),
            "ping" => Some(Self::Ping),
            "request_glob" => Some(Self::RequestGlob),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Stdin => "stdin",
            Self::RequestReport => "request_report",
            Self::RequestChdir => "request_chdir",
            Self::Ping => "ping",
            Self::RequestGlob => "request_glob",
        }
    }

    /// Position of this shape in the decoder's candidate list.
    pub fn index(&self) -> usize {
        *self as usize
    }
}

// ── Inbound (peer → daemon) ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Spawn `command` with `args` under a pseudo-terminal.
    Command {
        #[serde(rename = "uuid")]
        id: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Bytes for a running child's terminal input.
    Stdin {
        #[serde(rename = "uuid")]
        id: String,
        #[serde(with = "bytes")]
        buf: Vec<u8>,
    },
    RequestReport {
        #[serde(rename = "uuid")]
        id: String,
    },
    RequestChdir {
        #[serde(rename = "uuid")]
        id: String,
        dir: String,
    },
    RequestGlob {
        #[serde(rename = "uuid")]
        id: String,
        pattern: String,
    },
    Ping,
}

impl Inbound {
    pub fn kind(&self) -> InboundKind {
        match self {
            Inbound::Command { .. } => InboundKind::Command,
            Inbound::Stdin { .. } => InboundKind::Stdin,
            Inbound::RequestReport { .. } => InboundKind::RequestReport,
            Inbound::RequestChdir { .. } => InboundKind::RequestChdir,
            Inbound::RequestGlob { .. } => InboundKind::RequestGlob,
            Inbound::Ping => InboundKind::Ping,
        }
    }

    /// Request identifier, if the record carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Inbound::Command { id, .. }
            | Inbound::Stdin { id, .. }
            | Inbound::RequestReport { id }
            | Inbound::RequestChdir { id, .. }
            | Inbound::RequestGlob { id, .. } => Some(id),
            Inbound::Ping => None,
        }
    }
}

// ── Outbound (daemon → peer) ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Stdout {
        #[serde(rename = "uuid")]
        id: String,
        #[serde(with = "bytes")]
        buf: Vec<u8>,
    },
    Stderr {
        #[serde(rename = "uuid")]
        id: String,
        #[serde(with = "bytes")]
        buf: Vec<u8>,
    },
    /// Final status of a child. Times are CPU nanoseconds.
    Exit {
        #[serde(rename = "uuid")]
        id: String,
        success: bool,
        message: String,
        systime: u64,
        usertime: u64,
        code: i32,
    },
    Error {
        #[serde(rename = "uuid")]
        id: String,
        code: ErrorCode,
        message: String,
    },
    DirEntry {
        #[serde(rename = "uuid")]
        id: String,
        names: Vec<String>,
    },
    Report {
        #[serde(rename = "uuid")]
        id: String,
        username: String,
        cwd: String,
        #[serde(default)]
        environ: BTreeMap<String, String>,
    },
    Ping,
}

impl Outbound {
    /// Request identifier this event belongs to; `None` for heartbeats.
    pub fn id(&self) -> Option<&str> {
        match self {
            Outbound::Stdout { id, .. }
            | Outbound::Stderr { id, .. }
            | Outbound::Exit { id, .. }
            | Outbound::Error { id, .. }
            | Outbound::DirEntry { id, .. }
            | Outbound::Report { id, .. } => Some(id),
            Outbound::Ping => None,
        }
    }

    pub fn error(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Outbound::Error {
            id: id.into(),
            code,
            message: message.into(),
        }
    }
}

// ── Helper for bytes serde ────────────────────────────────────────────

/// Serializes `Vec<u8>` as a CBOR byte string; accepts byte strings or
/// integer arrays on the way in.
mod bytes {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BytesVisitor;

        impl<'de> serde::de::Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("bytes")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(v)
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
                Ok(v.as_bytes().to_vec())
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut bytes = Vec::new();
                while let Some(b) = seq.next_element::<u8>()? {
                    bytes.push(b);
                }
                Ok(bytes)
            }
        }

        deserializer.deserialize_any(BytesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{cbor_decode, frame_encode};

    fn reencode<T>(value: &T) -> T
    where
        T: Serialize + serde::de::DeserializeOwned,
    {
        let frame = frame_encode(value).unwrap();
        cbor_decode(&frame[4..]).unwrap()
    }

    #[test]
    fn inbound_records_survive_the_codec() {
        let records = vec![
            Inbound::Command {
                id: "c1".into(),
                command: "ls".into(),
                args: vec!["-la".into(), "/tmp".into()],
            },
            Inbound::Stdin {
                id: "c1".into(),
                buf: vec![0, 159, 146, 150, b'\n'],
            },
            Inbound::RequestReport { id: "r1".into() },
            Inbound::RequestChdir {
                id: "r2".into(),
                dir: "/tmp".into(),
            },
            Inbound::RequestGlob {
                id: "g1".into(),
                pattern: "*.rs".into(),
            },
            Inbound::Ping,
        ];
        for record in records {
            assert_eq!(reencode(&record), record);
        }
    }

    #[test]
    fn outbound_records_survive_the_codec() {
        let mut environ = BTreeMap::new();
        environ.insert("HOME".to_string(), "/root".to_string());
        let records = vec![
            Outbound::Stdout {
                id: "c1".into(),
                buf: b"hello\r\n".to_vec(),
            },
            Outbound::Stderr {
                id: "c1".into(),
                buf: vec![0xff, 0x00],
            },
            Outbound::Exit {
                id: "c1".into(),
                success: false,
                message: "exit status 3".into(),
                systime: 1_000,
                usertime: 2_000,
                code: 3,
            },
            Outbound::error("c2", ErrorCode::NotFound, "no such file"),
            Outbound::DirEntry {
                id: "g1".into(),
                names: vec!["a.rs".into(), "b.rs".into()],
            },
            Outbound::Report {
                id: "r1".into(),
                username: "root".into(),
                cwd: "/".into(),
                environ,
            },
            Outbound::Ping,
        ];
        for record in records {
            assert_eq!(reencode(&record), record);
        }
    }

    #[test]
    fn wire_names_match_protocol() {
        let frame = frame_encode(&Outbound::error("x", ErrorCode::NotFound, "m")).unwrap();
        let value: ciborium::Value = cbor_decode(&frame[4..]).unwrap();
        let map = value.as_map().unwrap();
        let get = |key: &str| {
            map.iter()
                .find(|(k, _)| k.as_text() == Some(key))
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("type").unwrap().as_text(), Some("error"));
        assert_eq!(get("uuid").unwrap().as_text(), Some("x"));
        assert_eq!(get("code").unwrap().as_text(), Some("exec not found"));
    }

    #[test]
    fn error_code_names_match_serde() {
        for code in [ErrorCode::NotFound, ErrorCode::Other, ErrorCode::Fatal] {
            let frame = frame_encode(&code).unwrap();
            let value: ciborium::Value = cbor_decode(&frame[4..]).unwrap();
            assert_eq!(value.as_text(), Some(code.as_str()));
        }
    }

    #[test]
    fn stdin_buf_is_a_byte_string() {
        let frame = frame_encode(&Inbound::Stdin {
            id: "x".into(),
            buf: b"ls\n".to_vec(),
        })
        .unwrap();
        let value: ciborium::Value = cbor_decode(&frame[4..]).unwrap();
        let buf = value
            .as_map()
            .unwrap()
            .iter()
            .find(|(k, _)| k.as_text() == Some("buf"))
            .map(|(_, v)| v.clone())
            .unwrap();
        assert_eq!(buf.as_bytes().map(Vec::as_slice), Some(&b"ls\n"[..]));
    }

    #[test]
    fn kind_indices_follow_decoder_order() {
        assert_eq!(InboundKind::Command.index(), 0);
        assert_eq!(InboundKind::Ping.index(), 4);
        assert_eq!(InboundKind::RequestGlob.index(), 5);
        for kind in [
            InboundKind::Command,
            InboundKind::Stdin,
            InboundKind::RequestReport,
            InboundKind::RequestChdir,
            InboundKind::Ping,
            InboundKind::RequestGlob,
        ] {
            assert_eq!(InboundKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(InboundKind::from_tag("resize"), None);
    }
}
