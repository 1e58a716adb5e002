//! The daemon-wide error type.
//!
//! Every fault that can cross an API boundary is a [`ServerError`]: an
//! [`ErrorKind`] plus a message. The kind determines both the HTTP
//! status used by the REST projection and the JSON-RPC error code used
//! by the dispatcher.

use std::fmt;

use gantry_wire::{
    DUPLICATE_MQTT_REQUEST, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, RpcError,
};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    /// Malformed JSON-RPC envelope.
    Protocol,
    MethodNotFound,
    TransportNotAllowed,
    InvalidParams,
    Unauthorized,
    /// Backend disconnected or not ready.
    BackendUnavailable,
    /// Backend RPC exceeded its deadline.
    Timeout,
    /// Persistence layer: traversal into a non-mapping value.
    InvalidNesting,
    /// Persistence layer: unknown record tag or bad payload.
    Decode,
    /// A remote agent answered a server-to-client call with an error.
    Agent(Value),
    /// MQTT duplicate suppression.
    DuplicateRequest,
    /// Application error carrying an HTTP-style numeric code.
    Application(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerError {
    kind: ErrorKind,
    message: String,
}

pub type Result<T> = std::result::Result<T, ServerError>;

impl ServerError {
    pub fn new(message: impl Into<String>, code: i64) -> Self {
        Self {
            kind: ErrorKind::Application(code),
            message: message.into(),
        }
    }

    pub fn with_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(message, 404)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::InvalidParams, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(message, 500)
    }

    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::BackendUnavailable, message)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// HTTP-style status code, used directly by the REST projection.
    pub fn status_code(&self) -> i64 {
        match &self.kind {
            ErrorKind::Protocol => 400,
            ErrorKind::MethodNotFound => 404,
            ErrorKind::TransportNotAllowed => 404,
            ErrorKind::InvalidParams => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::BackendUnavailable => 503,
            ErrorKind::Timeout => 500,
            ErrorKind::InvalidNesting => 400,
            ErrorKind::Decode => 500,
            ErrorKind::Agent(_) => 500,
            ErrorKind::DuplicateRequest => DUPLICATE_MQTT_REQUEST,
            ErrorKind::Application(code) => *code,
        }
    }

    /// Map onto a JSON-RPC error object per the dispatcher rules:
    /// 404 becomes method-not-found, 401 becomes invalid-params, and
    /// every other application code passes through unchanged.
    pub fn rpc_error(&self) -> RpcError {
        let code = match &self.kind {
            ErrorKind::Protocol => INVALID_REQUEST,
            ErrorKind::MethodNotFound | ErrorKind::TransportNotAllowed => METHOD_NOT_FOUND,
            ErrorKind::InvalidParams | ErrorKind::Unauthorized => INVALID_PARAMS,
            _ => match self.status_code() {
                404 => METHOD_NOT_FOUND,
                401 => INVALID_PARAMS,
                code => code,
            },
        };
        let err = RpcError::new(code, self.message.clone());
        match &self.kind {
            ErrorKind::Agent(data) => err.with_data(data.clone()),
            _ => err,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ServerError {}

impl From<rusqlite::Error> for ServerError {
    fn from(err: rusqlite::Error) -> Self {
        ServerError::internal(format!("sqlite error: {err}"))
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::with_kind(ErrorKind::Decode, format!("json error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_codes_pass_through() {
        let err = ServerError::new("Duplicate MQTT Request", -10000);
        assert_eq!(err.rpc_error().code, -10000);
        let err = ServerError::new("teapot", 418);
        assert_eq!(err.rpc_error().code, 418);
        assert_eq!(err.status_code(), 418);
    }

    #[test]
    fn http_codes_remap_to_rpc_codes() {
        assert_eq!(ServerError::not_found("x").rpc_error().code, -32601);
        assert_eq!(ServerError::new("x", 401).rpc_error().code, -32602);
        assert_eq!(
            ServerError::with_kind(ErrorKind::Unauthorized, "x")
                .rpc_error()
                .code,
            -32602
        );
        assert_eq!(
            ServerError::with_kind(ErrorKind::TransportNotAllowed, "x")
                .rpc_error()
                .code,
            -32601
        );
    }

    #[test]
    fn agent_errors_carry_data() {
        let err = ServerError::with_kind(
            ErrorKind::Agent(serde_json::json!({"detail": "probe failed"})),
            "Agent probe RPC error",
        );
        let rpc = err.rpc_error();
        assert_eq!(rpc.data, Some(serde_json::json!({"detail": "probe failed"})));
    }

    #[test]
    fn backend_unavailable_is_503() {
        assert_eq!(ServerError::backend_unavailable("x").status_code(), 503);
    }
}
