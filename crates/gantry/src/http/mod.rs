//! HTTP transport: the REST projection of registered endpoints plus
//! the WebSocket upgrade.
//!
//! Routing happens through a fallback handler that consults the
//! endpoint registry per request, because remote endpoints appear
//! after startup once the backend reports them.

pub mod ws;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ServerError;
use crate::registry::RequestType;
use crate::request::WebRequest;
use crate::server::Server;
use crate::transport::{ApiTransport, HttpTransport};

const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub server: Arc<Server>,
}

pub fn build_router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/websocket", get(ws::websocket_upgrade))
        .fallback(any(rest_handler))
        .with_state(AppState { server })
}

async fn rest_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let Some(request_type) = RequestType::from_http_method(&method) else {
        return error_response(ServerError::new(format!("Method {method} not allowed"), 405));
    };
    let server = &state.server;
    let Some(api_def) = server.registry.lookup_http_path(&path) else {
        return error_response(ServerError::not_found(format!("No API registered for {path}")));
    };
    if api_def.is_debug() && !server.config.server.enable_debug {
        return error_response(ServerError::not_found(format!("No API registered for {path}")));
    }
    if !api_def.request_types.contains(request_type) {
        return error_response(ServerError::new(format!("Method {method} not allowed"), 405));
    }

    let mut args = Map::new();
    match Query::<HashMap<String, String>>::try_from_uri(request.uri()) {
        Ok(Query(query)) => {
            for (key, value) in query {
                args.insert(key, parse_query_value(&value));
            }
        }
        Err(error) => {
            return error_response(ServerError::invalid_params(format!(
                "Invalid query string: {error}"
            )));
        }
    }
    match read_json_body(request.into_body()).await {
        Ok(Some(body)) => {
            // The body wins on conflicts with query parameters.
            for (key, value) in body {
                args.insert(key, value);
            }
        }
        Ok(None) => {}
        Err(error) => return error_response(error),
    }

    let transport: Arc<dyn ApiTransport> = Arc::new(HttpTransport::new(Some(addr.ip())));
    let web_request = WebRequest::new(
        api_def.endpoint.clone(),
        args,
        request_type,
        Some(transport.clone()),
        transport.ip_addr(),
        None,
    );
    debug!(%path, method = method.as_str(), "http request dispatched");
    match api_def.invoke(web_request).await {
        Ok(result) => json_response(
            StatusCode::OK,
            &serde_json::json!({"result": result}),
        ),
        Err(error) => error_response(error),
    }
}

async fn read_json_body(body: Body) -> Result<Option<Map<String, Value>>, ServerError> {
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ServerError::new(format!("Failed to read request body: {e}"), 400))?;
    if bytes.is_empty() {
        return Ok(None);
    }
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(_) => Err(ServerError::invalid_params(
            "Request body must be a JSON object",
        )),
        Err(error) => Err(ServerError::invalid_params(format!(
            "Invalid JSON body: {error}"
        ))),
    }
}

/// Query parameters arrive as strings; values that parse as JSON keep
/// their typed form so numeric and boolean arguments work over GET.
fn parse_query_value(raw: &str) -> Value {
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(_) => Value::String(raw.to_string()),
    }
}

fn error_response(error: ServerError) -> Response {
    let code = error.status_code();
    let status = u16::try_from(code)
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(
        status,
        &serde_json::json!({
            "error": {"code": code, "message": error.message()},
        }),
    )
}

fn json_response(status: StatusCode, body: &Value) -> Response {
    let payload = serde_json::to_vec(body).unwrap_or_default();
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        payload,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_values_keep_json_types() {
        assert_eq!(parse_query_value("7"), serde_json::json!(7));
        assert_eq!(parse_query_value("true"), serde_json::json!(true));
        assert_eq!(parse_query_value("a.b"), serde_json::json!("a.b"));
        assert_eq!(
            parse_query_value("[\"x\"]"),
            serde_json::json!(["x"])
        );
    }
}
