//! Wire-level building blocks shared by the gantry daemon and agent
//! processes: JSON-RPC 2.0 envelope types and the 0x03-delimited JSON
//! frame codec used on both the backend and agent Unix sockets.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame terminator used on Unix-socket transports in both directions.
pub const FRAME_TERMINATOR: u8 = 0x03;

/// Cap on a single framed payload, matching the socket buffer limit.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 20 * 1024 * 1024;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
/// Reserved application code for MQTT duplicate-request suppression.
pub const DUPLICATE_MQTT_REQUEST: i64 = -10000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    Oversized { len: usize, max: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oversized { len, max } => {
                write!(f, "framed payload too large: {len} > {max}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Incremental decoder for 0x03-delimited JSON frames.
///
/// Feed raw socket reads with [`FrameCodec::push`] and drain complete
/// payloads with [`FrameCodec::next_frame`]. The terminator byte is
/// stripped from yielded payloads.
pub struct FrameCodec {
    buf: VecDeque<u8>,
    scanned: usize,
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: VecDeque::new(),
            scanned: 0,
            max_frame_bytes,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend(data);
    }

    /// Pop the next complete payload, if one is buffered.
    ///
    /// Returns an error when the accumulated partial frame exceeds the
    /// configured cap; the connection should be dropped at that point
    /// since the stream can no longer be resynchronized cheaply.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        while self.scanned < self.buf.len() {
            if self.buf[self.scanned] == FRAME_TERMINATOR {
                let mut payload: Vec<u8> = self.buf.drain(..self.scanned).collect();
                self.buf.pop_front();
                self.scanned = 0;
                payload.shrink_to_fit();
                return Ok(Some(payload));
            }
            self.scanned += 1;
        }
        if self.buf.len() > self.max_frame_bytes {
            return Err(FrameError::Oversized {
                len: self.buf.len(),
                max: self.max_frame_bytes,
            });
        }
        Ok(None)
    }
}

/// Append the frame terminator to an encoded message.
pub fn encode_frame(mut payload: Vec<u8>) -> Vec<u8> {
    payload.push(FRAME_TERMINATOR);
    payload
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Build a JSON-RPC 2.0 result envelope.
pub fn build_result(result: Value, id: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "result": result,
        "id": id,
    })
}

/// Build a JSON-RPC 2.0 error envelope. A missing id serializes as null
/// per the specification's rules for undecodable requests.
pub fn build_error(error: RpcError, id: Option<Value>) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "error": error,
        "id": id.unwrap_or(Value::Null),
    })
}

/// Build a request envelope. `id: None` produces a notification.
pub fn build_request(method: &str, params: Option<Value>, id: Option<Value>) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("jsonrpc".into(), Value::String("2.0".into()));
    obj.insert("method".into(), Value::String(method.into()));
    if let Some(params) = params {
        obj.insert("params".into(), params);
    }
    if let Some(id) = id {
        obj.insert("id".into(), id);
    }
    Value::Object(obj)
}

/// JSON-RPC 2.0 restricts request ids to strings, numbers and null.
/// Anything else fails validation at the dispatcher.
pub fn is_valid_id(id: &Value) -> bool {
    matches!(id, Value::Null | Value::Number(_) | Value::String(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_codec_splits_joined_frames() {
        let mut codec = FrameCodec::default();
        codec.push(b"{\"a\":1}\x03{\"b\":2}\x03");
        assert_eq!(
            codec.next_frame().unwrap().as_deref(),
            Some(b"{\"a\":1}".as_ref())
        );
        assert_eq!(
            codec.next_frame().unwrap().as_deref(),
            Some(b"{\"b\":2}".as_ref())
        );
        assert_eq!(codec.next_frame().unwrap(), None);
    }

    #[test]
    fn frame_codec_reassembles_partial_reads() {
        let mut codec = FrameCodec::default();
        codec.push(b"{\"meth");
        assert_eq!(codec.next_frame().unwrap(), None);
        codec.push(b"od\":\"info\"}");
        assert_eq!(codec.next_frame().unwrap(), None);
        codec.push(&[FRAME_TERMINATOR]);
        assert_eq!(
            codec.next_frame().unwrap().as_deref(),
            Some(b"{\"method\":\"info\"}".as_ref())
        );
    }

    #[test]
    fn frame_codec_yields_empty_payloads() {
        let mut codec = FrameCodec::default();
        codec.push(&[FRAME_TERMINATOR]);
        assert_eq!(codec.next_frame().unwrap().as_deref(), Some(b"".as_ref()));
    }

    #[test]
    fn frame_codec_rejects_oversized_partial_frames() {
        let mut codec = FrameCodec::new(16);
        codec.push(&[b'x'; 17]);
        assert_eq!(
            codec.next_frame(),
            Err(FrameError::Oversized { len: 17, max: 16 })
        );
    }

    #[test]
    fn frame_codec_accepts_large_terminated_frames() {
        // The cap applies to unterminated buffers; a terminator found
        // within the scanned region always wins.
        let mut codec = FrameCodec::new(8);
        codec.push(b"12345678\x03");
        assert_eq!(
            codec.next_frame().unwrap().as_deref(),
            Some(b"12345678".as_ref())
        );
    }

    #[test]
    fn encode_frame_appends_terminator() {
        assert_eq!(encode_frame(b"{}".to_vec()), b"{}\x03".to_vec());
    }

    #[test]
    fn result_envelope_wire_shape() {
        let env = build_result(serde_json::json!({"ok": true}), serde_json::json!(7));
        assert_eq!(
            serde_json::to_string(&env).unwrap(),
            r#"{"id":7,"jsonrpc":"2.0","result":{"ok":true}}"#
        );
    }

    #[test]
    fn error_envelope_wire_shape() {
        let env = build_error(RpcError::new(PARSE_ERROR, "Parse error"), None);
        assert_eq!(
            serde_json::to_string(&env).unwrap(),
            r#"{"error":{"code":-32700,"message":"Parse error"},"id":null,"jsonrpc":"2.0"}"#
        );
    }

    #[test]
    fn error_data_is_omitted_when_absent() {
        let err = RpcError::new(METHOD_NOT_FOUND, "Method not found");
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"code":-32601,"message":"Method not found"}"#
        );
        let err = err.with_data(serde_json::json!({"agent": "probe"}));
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"code":-32601,"message":"Method not found","data":{"agent":"probe"}}"#
        );
    }

    #[test]
    fn notification_has_no_id() {
        let env = build_request("server.ping", None, None);
        assert_eq!(
            serde_json::to_string(&env).unwrap(),
            r#"{"jsonrpc":"2.0","method":"server.ping"}"#
        );
    }

    #[test]
    fn request_id_validation() {
        assert!(is_valid_id(&serde_json::json!(1)));
        assert!(is_valid_id(&serde_json::json!("abc")));
        assert!(is_valid_id(&Value::Null));
        assert!(!is_valid_id(&serde_json::json!([1])));
        assert!(!is_valid_id(&serde_json::json!({"id": 1})));
    }
}
