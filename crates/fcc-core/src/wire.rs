use chrono::Utc;
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);

    pub fn is_supported(self) -> bool {
        self <= Self::CURRENT
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

// Servers in the field send the version as a bare number, a decimal string
// or a "v"-prefixed string.
impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct VersionVisitor;

        impl<'de> Visitor<'de> for VersionVisitor {
            type Value = ProtocolVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a protocol version number or string")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                u16::try_from(value)
                    .map(ProtocolVersion)
                    .map_err(|_| E::custom(format!("protocol version out of range: {value}")))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                u64::try_from(value)
                    .map_err(|_| E::custom(format!("negative protocol version: {value}")))
                    .and_then(|value| self.visit_u64(value))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                let digits = value.trim().trim_start_matches(['v', 'V']);
                digits
                    .parse::<u16>()
                    .map(ProtocolVersion)
                    .map_err(|err| E::custom(format!("invalid protocol version '{value}': {err}")))
            }
        }

        deserializer.deserialize_any(VersionVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub sender_id: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub msg: WireMsg,
}

impl WireEnvelope {
    pub fn new(sender_id: impl Into<String>, msg: WireMsg) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            sender_id: sender_id.into(),
            timestamp: Utc::now().to_rfc3339(),
            msg,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireMsg {
    Hello(HelloPayload),
    Welcome(WelcomePayload),
    Call(CallPayload),
    Multicall(MulticallPayload),
    Reply(ReplyPayload),
    Error(ErrorPayload),
    Notify(NotifyPayload),
}

impl WireMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMsg::Hello(_) => "hello",
            WireMsg::Welcome(_) => "welcome",
            WireMsg::Call(_) => "call",
            WireMsg::Multicall(_) => "multicall",
            WireMsg::Reply(_) => "reply",
            WireMsg::Error(_) => "error",
            WireMsg::Notify(_) => "notify",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    pub client_id: String,
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WelcomePayload {
    pub server_id: String,
    #[serde(default)]
    pub motd: Option<String>,
}

/// One named remote call: method, positional arguments, named arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallSpec {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl CallSpec {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
            kwargs: Map::new(),
        }
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallPayload {
    pub id: u64,
    #[serde(flatten)]
    pub call: CallSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MulticallPayload {
    pub id: u64,
    #[serde(default)]
    pub calls: Vec<CallSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplyPayload {
    pub id: u64,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    #[serde(default)]
    pub id: Option<u64>,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotifyPayload {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

fn strip_line_end(mut raw: &[u8]) -> &[u8] {
    if let Some(rest) = raw.strip_suffix(b"\n") {
        raw = rest;
    }
    if let Some(rest) = raw.strip_suffix(b"\r") {
        raw = rest;
    }
    raw
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let raw = strip_line_end(bytes);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

/// Incremental newline-delimited JSON decoder. A bad line is reported and
/// skipped; decoding resumes at the next delimiter.
pub struct FrameDecoder<T> {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    marker: PhantomData<T>,
}

impl<T> FrameDecoder<T> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            marker: PhantomData,
        }
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

impl<T> Default for FrameDecoder<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<T: DeserializeOwned> FrameDecoder<T> {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        self.pending.extend_from_slice(chunk);

        let mut consumed = 0;
        while let Some(offset) = self.pending[consumed..].iter().position(|b| *b == b'\n') {
            let end = consumed + offset + 1;
            let line = strip_line_end(&self.pending[consumed..end]);
            if !line.is_empty() {
                self.decode_line(line, &mut report);
            }
            consumed = end;
        }
        self.pending.drain(..consumed);

        if self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }

        report
    }

    pub fn finish(&mut self) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        let rest = std::mem::take(&mut self.pending);
        let line = strip_line_end(&rest);
        if !line.is_empty() {
            self.decode_line(line, &mut report);
        }
        report
    }

    fn decode_line(&self, line: &[u8], report: &mut DecodeReport<T>) {
        if line.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedFrame {
                size: line.len(),
                max: self.max_frame_bytes,
            });
            return;
        }
        match serde_json::from_slice(line) {
            Ok(frame) => report.frames.push(frame),
            Err(err) => report.errors.push(FrameError::Decode(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call_envelope() -> WireEnvelope {
        WireEnvelope {
            version: ProtocolVersion::CURRENT,
            sender_id: "console-1".to_string(),
            timestamp: "2026-10-16T09:00:00Z".to_string(),
            msg: WireMsg::Call(CallPayload {
                id: 7,
                call: CallSpec::new("set_printer", vec![Value::Null, json!("/dev/ttyACM0")]),
            }),
        }
    }

    #[test]
    fn call_frame_uses_flat_payload_layout() {
        let frame = encode_frame(&call_envelope(), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert_eq!(frame.last(), Some(&b'\n'));
        let value: Value = serde_json::from_slice(&frame).expect("json");
        assert_eq!(value["type"], "call");
        assert_eq!(value["version"], 1);
        assert_eq!(value["payload"]["id"], 7);
        assert_eq!(value["payload"]["method"], "set_printer");
        assert_eq!(value["payload"]["args"], json!([null, "/dev/ttyACM0"]));
        assert_eq!(value["payload"]["kwargs"], json!({}));

        let decoded: WireEnvelope = decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(decoded, call_envelope());
    }

    #[test]
    fn server_frames_decode_with_defaults() {
        let reply: WireEnvelope = serde_json::from_str(
            r#"{"version":"v1","sender_id":"srv","timestamp":"t","type":"reply","payload":{"id":3}}"#,
        )
        .expect("reply");
        assert_eq!(
            reply.msg,
            WireMsg::Reply(ReplyPayload {
                id: 3,
                result: Value::Null
            })
        );

        let notify: WireEnvelope = serde_json::from_str(
            r#"{"sender_id":"srv","timestamp":"t","type":"notify","payload":{"name":"new_port","args":[1]}}"#,
        )
        .expect("notify");
        assert_eq!(notify.version, ProtocolVersion::CURRENT);
        let WireMsg::Notify(payload) = notify.msg else {
            panic!("expected notify");
        };
        assert_eq!(payload.name, "new_port");
        assert_eq!(payload.args, vec![json!(1)]);
    }

    #[test]
    fn newer_versions_are_flagged_unsupported() {
        let envelope: WireEnvelope = serde_json::from_str(
            r#"{"version":"2","sender_id":"srv","timestamp":"t","type":"welcome","payload":{"server_id":"s"}}"#,
        )
        .expect("parse");
        assert_eq!(envelope.version, ProtocolVersion(2));
        assert!(!envelope.version.is_supported());
        assert!(ProtocolVersion(1).is_supported());
    }

    #[test]
    fn negative_version_is_rejected() {
        let result: Result<WireEnvelope, _> = serde_json::from_str(
            r#"{"version":-1,"sender_id":"srv","timestamp":"t","type":"welcome","payload":{"server_id":"s"}}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn decoder_handles_split_chunks_and_bad_lines() {
        let good = encode_frame(&call_envelope(), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let mut stream = Vec::new();
        stream.extend_from_slice(&good);
        stream.extend_from_slice(b"{\"broken\":\r\n\r\n");
        stream.extend_from_slice(&good);

        let (first, second) = stream.split_at(good.len() + 5);
        let mut decoder = FrameDecoder::<WireEnvelope>::default();
        let report = decoder.push_chunk(first);
        assert_eq!(report.frames.len(), 1);
        assert!(report.errors.is_empty());
        assert_eq!(decoder.buffered(), 5);

        let report = decoder.push_chunk(second);
        assert_eq!(report.frames.len(), 1);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], FrameError::Decode(_)));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn decoder_drops_runaway_buffer() {
        let mut decoder = FrameDecoder::<WireEnvelope>::new(64);
        let report = decoder.push_chunk(&[b'x'; 100]);
        assert!(matches!(
            report.errors.as_slice(),
            [FrameError::OversizedBuffer { size: 100, max: 64 }]
        ));
        assert_eq!(decoder.buffered(), 0);

        let valid = encode_frame(
            &WireEnvelope::new("s", WireMsg::Reply(ReplyPayload { id: 1, result: json!(2) })),
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("encode");
        let mut decoder = FrameDecoder::<WireEnvelope>::default();
        let report = decoder.push_chunk(&valid[..valid.len() - 1]);
        assert!(report.frames.is_empty());
        assert_eq!(decoder.finish().frames.len(), 1);
    }

    #[test]
    fn encoder_rejects_oversized_payload() {
        let message = WireEnvelope::new(
            "console-1",
            WireMsg::Call(CallPayload {
                id: 1,
                call: CallSpec::new("gcode", vec![json!("G1 X10\n".repeat(32))]),
            }),
        );
        assert!(matches!(
            encode_frame(&message, 64),
            Err(FrameError::OversizedFrame { .. })
        ));
    }
}
