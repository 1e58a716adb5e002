//! Tag-prefixed encoding for namespace records.
//!
//! Values are stored as a one-byte type tag followed by the payload:
//! `q` little-endian i64, `d` little-endian f64, `?` one-byte bool,
//! `s` UTF-8 string, `[`/`{` raw JSON (the serialized text's first
//! byte doubles as the tag), and 0x00 for null.

use serde_json::Value;

use crate::error::{ErrorKind, Result, ServerError};

pub fn encode_record(value: &Value) -> Result<Vec<u8>> {
    match value {
        Value::Null => Ok(vec![0u8]),
        Value::Bool(b) => Ok(vec![b'?', *b as u8]),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                let mut out = Vec::with_capacity(9);
                out.push(b'q');
                out.extend_from_slice(&i.to_le_bytes());
                Ok(out)
            } else if let Some(f) = n.as_f64() {
                let mut out = Vec::with_capacity(9);
                out.push(b'd');
                out.extend_from_slice(&f.to_le_bytes());
                Ok(out)
            } else {
                Err(ServerError::with_kind(
                    ErrorKind::Decode,
                    format!("Error encoding value: {n} is out of range"),
                ))
            }
        }
        Value::String(s) => {
            let mut out = Vec::with_capacity(1 + s.len());
            out.push(b's');
            out.extend_from_slice(s.as_bytes());
            Ok(out)
        }
        Value::Array(_) | Value::Object(_) => Ok(serde_json::to_vec(value)?),
    }
}

pub fn decode_record(data: &[u8]) -> Result<Value> {
    let Some(&tag) = data.first() else {
        return Err(decode_error("empty record"));
    };
    let payload = &data[1..];
    match tag {
        0 => Ok(Value::Null),
        b'?' => match payload {
            [0] => Ok(Value::Bool(false)),
            [1] => Ok(Value::Bool(true)),
            _ => Err(decode_error("malformed bool record")),
        },
        b'q' => {
            let bytes: [u8; 8] = payload
                .try_into()
                .map_err(|_| decode_error("malformed integer record"))?;
            Ok(Value::from(i64::from_le_bytes(bytes)))
        }
        b'd' => {
            let bytes: [u8; 8] = payload
                .try_into()
                .map_err(|_| decode_error("malformed float record"))?;
            Ok(Value::from(f64::from_le_bytes(bytes)))
        }
        b's' => {
            let text = std::str::from_utf8(payload)
                .map_err(|_| decode_error("string record is not utf-8"))?;
            Ok(Value::String(text.to_string()))
        }
        b'[' | b'{' => serde_json::from_slice(data)
            .map_err(|error| decode_error(format!("malformed json record: {error}"))),
        other => Err(decode_error(format!(
            "unknown record tag: 0x{other:02x}"
        ))),
    }
}

fn decode_error(message: impl Into<String>) -> ServerError {
    ServerError::with_kind(ErrorKind::Decode, format!("Error decoding record: {}", message.into()))
}
