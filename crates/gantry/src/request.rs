//! The canonical internal request passed from a transport to a handler.

use std::net::IpAddr;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{Result, ServerError};
use crate::registry::RequestType;
use crate::transport::ApiTransport;

/// Authenticated principal attached to a connection or request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub username: String,
}

/// A single API call: created by a transport, consumed by a handler,
/// discarded once the response is produced.
pub struct WebRequest {
    endpoint: String,
    args: Map<String, Value>,
    request_type: RequestType,
    transport: Option<Arc<dyn ApiTransport>>,
    ip_addr: Option<IpAddr>,
    user: Option<UserInfo>,
}

impl WebRequest {
    pub fn new(
        endpoint: impl Into<String>,
        args: Map<String, Value>,
        request_type: RequestType,
        transport: Option<Arc<dyn ApiTransport>>,
        ip_addr: Option<IpAddr>,
        user: Option<UserInfo>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            args,
            request_type,
            transport,
            ip_addr,
            user,
        }
    }

    /// Internal call with no transport attached.
    pub fn internal(endpoint: impl Into<String>, args: Map<String, Value>) -> Self {
        Self::new(endpoint, args, RequestType::empty(), None, None, None)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn request_type(&self) -> RequestType {
        self.request_type
    }

    pub fn args(&self) -> &Map<String, Value> {
        &self.args
    }

    pub fn into_args(self) -> Map<String, Value> {
        self.args
    }

    /// The transport handle, when the caller can receive pushed status.
    pub fn transport(&self) -> Option<&Arc<dyn ApiTransport>> {
        self.transport.as_ref()
    }

    pub fn ip_addr(&self) -> Option<IpAddr> {
        self.ip_addr
    }

    pub fn user(&self) -> Option<&UserInfo> {
        self.user.as_ref()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.args.get(key)
    }

    pub fn get_str(&self, key: &str) -> Result<String> {
        match self.args.get(key) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(invalid_type(key, "string", other)),
            None => Err(missing_arg(key)),
        }
    }

    pub fn get_str_or(&self, key: &str, default: &str) -> Result<String> {
        match self.args.get(key) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(invalid_type(key, "string", other)),
            None => Ok(default.to_string()),
        }
    }

    pub fn get_i64(&self, key: &str) -> Result<i64> {
        match self.args.get(key) {
            Some(Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| invalid_type(key, "integer", &self.args[key])),
            Some(other) => Err(invalid_type(key, "integer", other)),
            None => Err(missing_arg(key)),
        }
    }

    pub fn get_i64_or(&self, key: &str, default: i64) -> Result<i64> {
        if self.args.contains_key(key) {
            self.get_i64(key)
        } else {
            Ok(default)
        }
    }

    pub fn get_f64_opt(&self, key: &str) -> Result<Option<f64>> {
        match self.args.get(key) {
            Some(Value::Number(n)) => Ok(n.as_f64()),
            Some(other) => Err(invalid_type(key, "number", other)),
            None => Ok(None),
        }
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.args.get(key) {
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(invalid_type(key, "boolean", other)),
            None => Ok(default),
        }
    }
}

fn missing_arg(key: &str) -> ServerError {
    ServerError::invalid_params(format!("Missing required argument '{key}'"))
}

fn invalid_type(key: &str, expected: &str, value: &Value) -> ServerError {
    ServerError::invalid_params(format!(
        "Argument '{key}' is not a valid {expected}: {value}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(args: Value) -> WebRequest {
        let Value::Object(map) = args else {
            panic!("test args must be an object")
        };
        WebRequest::internal("server/test", map)
    }

    #[test]
    fn typed_getters_enforce_types() {
        let req = request_with(serde_json::json!({
            "name": "probe", "count": 3, "enable": true,
        }));
        assert_eq!(req.get_str("name").unwrap(), "probe");
        assert_eq!(req.get_i64("count").unwrap(), 3);
        assert!(req.get_bool_or("enable", false).unwrap());
        assert!(req.get_str("count").is_err());
        assert!(req.get_i64("name").is_err());
    }

    #[test]
    fn defaults_apply_only_when_absent() {
        let req = request_with(serde_json::json!({"qos": 2}));
        assert_eq!(req.get_i64_or("qos", 0).unwrap(), 2);
        assert_eq!(req.get_i64_or("timeout", 5).unwrap(), 5);
        assert!(req.get_str_or("qos", "x").is_err());
    }

    #[test]
    fn missing_required_argument_is_invalid_params() {
        let req = request_with(serde_json::json!({}));
        let err = req.get_str("filename").unwrap_err();
        assert_eq!(err.rpc_error().code, -32602);
    }
}
