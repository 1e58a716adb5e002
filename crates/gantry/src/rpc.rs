//! JSON-RPC 2.0 dispatcher.
//!
//! Takes a raw frame plus the transport handle it arrived on, routes
//! each envelope through the endpoint registry, and produces the
//! serialized response frame (or nothing, for notifications).

use std::sync::Arc;

use gantry_wire::{
    INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR, RpcError, build_error,
    build_result,
};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{ErrorKind, ServerError};
use crate::registry::{ApiDefinition, Registry, RequestType};
use crate::request::WebRequest;
use crate::transport::ApiTransport;

pub struct JsonRpc {
    registry: Arc<Registry>,
}

impl JsonRpc {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Dispatch one frame. Returns the serialized response payload, or
    /// `None` when every envelope was a notification.
    pub async fn dispatch(&self, data: &[u8], transport: Arc<dyn ApiTransport>) -> Option<Vec<u8>> {
        let parsed: Value = match serde_json::from_slice(data) {
            Ok(value) => value,
            Err(error) => {
                info!(
                    transport = %transport.transport_type(),
                    %error,
                    "received frame is not valid json"
                );
                let envelope = build_error(RpcError::new(PARSE_ERROR, "Parse error"), None);
                return serde_json::to_vec(&envelope).ok();
            }
        };
        match parsed {
            Value::Array(items) => {
                if items.is_empty() {
                    let envelope =
                        build_error(RpcError::new(INVALID_REQUEST, "Invalid Request"), None);
                    return serde_json::to_vec(&envelope).ok();
                }
                let mut responses = Vec::new();
                for item in items {
                    if let Some(response) = self.process_object(item, &transport).await {
                        responses.push(response);
                    }
                }
                if responses.is_empty() {
                    None
                } else {
                    serde_json::to_vec(&responses).ok()
                }
            }
            other => {
                let response = self.process_object(other, &transport).await?;
                serde_json::to_vec(&response).ok()
            }
        }
    }

    async fn process_object(
        &self,
        obj: Value,
        transport: &Arc<dyn ApiTransport>,
    ) -> Option<Value> {
        let sanitize = log_request(&obj, transport);
        let Value::Object(envelope) = obj else {
            return Some(error_response(
                RpcError::new(INVALID_REQUEST, "Invalid Request"),
                None,
                "",
            ));
        };
        let req_id = envelope.get("id").cloned();
        if let Some(id) = &req_id {
            if !gantry_wire::is_valid_id(id) {
                return Some(error_response(
                    RpcError::new(INVALID_REQUEST, "Invalid Request"),
                    None,
                    "",
                ));
            }
        }
        if envelope.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Some(error_response(
                RpcError::new(INVALID_REQUEST, "Invalid Request"),
                req_id,
                "",
            ));
        }
        let method = match envelope.get("method") {
            None => {
                // No method: this is a response to a prior
                // server-initiated call.
                process_response(envelope, transport);
                return None;
            }
            Some(Value::String(method)) => method.clone(),
            Some(other) => {
                return Some(error_response(
                    RpcError::new(INVALID_REQUEST, "Invalid Request"),
                    req_id,
                    &other.to_string(),
                ));
            }
        };
        let Some((request_type, api_def)) = self.registry.lookup_method(&method) else {
            return Some(error_response(
                RpcError::new(METHOD_NOT_FOUND, "Method not found"),
                req_id,
                &method,
            ));
        };
        let transport_type = transport.transport_type();
        if !api_def.transports.contains(transport_type) {
            return Some(error_response(
                RpcError::new(
                    METHOD_NOT_FOUND,
                    format!("Method not found for transport {transport_type}"),
                ),
                req_id,
                &method,
            ));
        }
        let params = match envelope.get("params") {
            None => Map::new(),
            Some(Value::Object(params)) => params.clone(),
            Some(_) => {
                return Some(error_response(
                    RpcError::new(INVALID_PARAMS, "Invalid params:"),
                    req_id,
                    &method,
                ));
            }
        };
        let result = self
            .execute_method(&api_def, request_type, params, transport)
            .await;
        match result {
            Ok(result) => {
                let req_id = req_id.filter(|id| !id.is_null())?;
                log_response(sanitize);
                Some(build_result(result, req_id))
            }
            Err(error) => Some(error_response(error.rpc_error(), req_id, &method)),
        }
    }

    async fn execute_method(
        &self,
        api_def: &Arc<ApiDefinition>,
        request_type: RequestType,
        mut params: Map<String, Value>,
        transport: &Arc<dyn ApiTransport>,
    ) -> Result<Value, ServerError> {
        transport.screen_rpc_request(api_def, &mut params)?;
        let request = WebRequest::new(
            api_def.endpoint.clone(),
            params,
            request_type,
            Some(transport.clone()),
            transport.ip_addr(),
            transport.user_info(),
        );
        api_def.invoke(request).await
    }
}

/// Route a client-sent response envelope into the transport's pending
/// table. Unknown ids and non-socket transports are logged and
/// dropped.
fn process_response(envelope: Map<String, Value>, transport: &Arc<dyn ApiTransport>) {
    let Some(conn) = transport.remote_connection() else {
        debug!("rpc response on a transport without pending calls");
        return;
    };
    let Some(response_id) = envelope.get("id").and_then(Value::as_u64) else {
        debug!("rpc response with missing or null id");
        return;
    };
    let result = match envelope.get("result") {
        Some(result) => Ok(result.clone()),
        None => {
            let name = conn.client_data().name;
            Err(ServerError::with_kind(
                ErrorKind::Agent(envelope.get("error").cloned().unwrap_or(Value::Null)),
                format!("Agent {name} RPC error"),
            ))
        }
    };
    if !conn.resolve_pending_response(response_id, result) {
        debug!(response_id, "rpc response matches no pending request");
    }
}

fn error_response(error: RpcError, req_id: Option<Value>, method: &str) -> Value {
    if method.is_empty() {
        info!(code = error.code, message = error.message.as_str(), "json-rpc request error");
    } else {
        info!(
            method,
            code = error.code,
            message = error.message.as_str(),
            "json-rpc request error"
        );
    }
    build_error(error, req_id)
}

/// Verbose request logging with credential redaction. Returns whether
/// the matching response must be sanitized as well.
fn log_request(obj: &Value, transport: &Arc<dyn ApiTransport>) -> bool {
    let method = obj.get("method").and_then(Value::as_str).unwrap_or("");
    let sanitize = method.starts_with("access.") || method == "machine.sudo.password";
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return sanitize;
    }
    let mut output = obj.clone();
    if sanitize {
        if let Some(params) = output.get_mut("params").and_then(Value::as_object_mut) {
            for (_, value) in params.iter_mut() {
                *value = Value::String("<sanitized>".into());
            }
        }
    } else if method == "server.connection.identify" {
        if let Some(params) = output.get_mut("params").and_then(Value::as_object_mut) {
            for field in ["access_token", "api_key"] {
                if params.contains_key(field) {
                    params.insert(field.into(), Value::String("<sanitized>".into()));
                }
            }
        }
    }
    debug!(transport = %transport.transport_type(), request = %output, "jsonrpc received");
    sanitize
}

fn log_response(sanitized: bool) {
    if sanitized {
        debug!(response = "<sanitized>", "jsonrpc response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{EndpointSpec, TransportSet, TransportType, noop_handler};
    use crate::transport::next_uid;

    struct TestTransport {
        uid: u64,
        transport_type: TransportType,
    }

    impl TestTransport {
        fn new(transport_type: TransportType) -> Arc<Self> {
            Arc::new(Self {
                uid: next_uid(),
                transport_type,
            })
        }
    }

    impl ApiTransport for TestTransport {
        fn uid(&self) -> u64 {
            self.uid
        }

        fn transport_type(&self) -> TransportType {
            self.transport_type
        }

        fn send_status(&self, _status: Map<String, Value>, _eventtime: f64) {}
    }

    fn rpc_with_registry() -> (JsonRpc, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        (JsonRpc::new(registry.clone()), registry)
    }

    async fn dispatch_value(rpc: &JsonRpc, data: &str) -> Option<Value> {
        let transport = TestTransport::new(TransportType::WebSocket);
        rpc.dispatch(data.as_bytes(), transport)
            .await
            .map(|bytes| serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn parse_error_shape() {
        let (rpc, _registry) = rpc_with_registry();
        let response = dispatch_value(&rpc, "{bad json").await.unwrap();
        assert_eq!(
            response,
            serde_json::json!({
                "jsonrpc": "2.0",
                "error": {"code": -32700, "message": "Parse error"},
                "id": null,
            })
        );
    }

    #[tokio::test]
    async fn method_not_found_shape() {
        let (rpc, _registry) = rpc_with_registry();
        let response = dispatch_value(
            &rpc,
            r#"{"jsonrpc":"2.0","id":1,"method":"no.such.method"}"#,
        )
        .await
        .unwrap();
        assert_eq!(
            response,
            serde_json::json!({
                "jsonrpc": "2.0",
                "error": {"code": -32601, "message": "Method not found"},
                "id": 1,
            })
        );
    }

    #[tokio::test]
    async fn batch_omits_notification_responses() {
        let (rpc, registry) = rpc_with_registry();
        registry
            .register(
                EndpointSpec::new("/server/info", RequestType::GET),
                noop_handler(),
            )
            .unwrap();
        registry
            .register(
                EndpointSpec::new("/server/ping", RequestType::GET),
                noop_handler(),
            )
            .unwrap();
        let response = dispatch_value(
            &rpc,
            r#"[{"jsonrpc":"2.0","id":1,"method":"server.info"},
                {"jsonrpc":"2.0","method":"server.ping"}]"#,
        )
        .await
        .unwrap();
        let responses = response.as_array().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn batch_of_notifications_emits_nothing() {
        let (rpc, registry) = rpc_with_registry();
        registry
            .register(
                EndpointSpec::new("/server/ping", RequestType::GET),
                noop_handler(),
            )
            .unwrap();
        let response = dispatch_value(
            &rpc,
            r#"[{"jsonrpc":"2.0","method":"server.ping"},
                {"jsonrpc":"2.0","method":"server.ping"}]"#,
        )
        .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn empty_batch_is_invalid_request() {
        let (rpc, _registry) = rpc_with_registry();
        let response = dispatch_value(&rpc, "[]").await.unwrap();
        assert_eq!(response["error"]["code"], serde_json::json!(-32600));
    }

    #[tokio::test]
    async fn batch_response_ids_match_requests() {
        let (rpc, registry) = rpc_with_registry();
        registry
            .register(
                EndpointSpec::new("/server/info", RequestType::GET),
                noop_handler(),
            )
            .unwrap();
        let response = dispatch_value(
            &rpc,
            r#"[{"jsonrpc":"2.0","id":5,"method":"server.info"},
                {"jsonrpc":"2.0","id":"str-id","method":"server.info"},
                {"jsonrpc":"2.0","id":9,"method":"missing.method"}]"#,
        )
        .await
        .unwrap();
        let mut ids: Vec<Value> = response
            .as_array()
            .unwrap()
            .iter()
            .map(|resp| resp["id"].clone())
            .collect();
        ids.sort_by_key(|id| id.to_string());
        assert_eq!(
            ids,
            vec![
                serde_json::json!("str-id"),
                serde_json::json!(5),
                serde_json::json!(9)
            ]
        );
    }

    #[tokio::test]
    async fn missing_jsonrpc_version_is_rejected() {
        let (rpc, _registry) = rpc_with_registry();
        let response = dispatch_value(&rpc, r#"{"id":1,"method":"server.info"}"#)
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], serde_json::json!(-32600));
        assert_eq!(response["id"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn transport_gating_reports_method_not_found() {
        let (rpc, registry) = rpc_with_registry();
        registry
            .register(
                EndpointSpec::new("/server/sockets_only", RequestType::POST)
                    .transports(TransportSet::WEBSOCKET),
                noop_handler(),
            )
            .unwrap();
        let transport = TestTransport::new(TransportType::Internal);
        let response = rpc
            .dispatch(
                br#"{"jsonrpc":"2.0","id":3,"method":"server.sockets_only"}"#,
                transport,
            )
            .await
            .unwrap();
        let response: Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(response["error"]["code"], serde_json::json!(-32601));
        assert_eq!(
            response["error"]["message"],
            serde_json::json!("Method not found for transport INTERNAL")
        );
    }

    #[tokio::test]
    async fn non_object_params_are_invalid() {
        let (rpc, registry) = rpc_with_registry();
        registry
            .register(
                EndpointSpec::new("/server/info", RequestType::GET),
                noop_handler(),
            )
            .unwrap();
        let response = dispatch_value(
            &rpc,
            r#"{"jsonrpc":"2.0","id":2,"method":"server.info","params":[1,2]}"#,
        )
        .await
        .unwrap();
        assert_eq!(response["error"]["code"], serde_json::json!(-32602));
    }

    #[tokio::test]
    async fn handler_error_codes_pass_through() {
        let (rpc, registry) = rpc_with_registry();
        registry
            .register(
                EndpointSpec::new("/server/fails", RequestType::GET),
                Arc::new(|_req| {
                    Box::pin(async { Err(ServerError::new("backend busy", 503)) })
                }),
            )
            .unwrap();
        let response = dispatch_value(
            &rpc,
            r#"{"jsonrpc":"2.0","id":4,"method":"server.fails"}"#,
        )
        .await
        .unwrap();
        assert_eq!(response["error"]["code"], serde_json::json!(503));
        assert_eq!(response["error"]["message"], serde_json::json!("backend busy"));
    }

    #[tokio::test]
    async fn not_found_handler_errors_map_to_rpc_code() {
        let (rpc, registry) = rpc_with_registry();
        registry
            .register(
                EndpointSpec::new("/server/lost", RequestType::GET),
                Arc::new(|_req| Box::pin(async { Err(ServerError::not_found("no item")) })),
            )
            .unwrap();
        let response = dispatch_value(
            &rpc,
            r#"{"jsonrpc":"2.0","id":4,"method":"server.lost"}"#,
        )
        .await
        .unwrap();
        assert_eq!(response["error"]["code"], serde_json::json!(-32601));
    }
}
