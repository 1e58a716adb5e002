//! The canonical table of API definitions.
//!
//! Components register endpoints once during initialization; the
//! registry derives the HTTP path projection and the JSON-RPC method
//! names, validates the HTTP prefix, and feeds the dispatcher's
//! method lookup table.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::{ErrorKind, Result, ServerError};
use crate::request::WebRequest;

/// First path segment allow-list for HTTP-reachable endpoints.
pub const ENDPOINT_PREFIXES: &[&str] = &["printer", "server", "machine", "access", "api", "debug"];

/// Backend endpoints never exposed over an external transport.
pub const RESERVED_ENDPOINTS: &[&str] = &[
    "list_endpoints",
    "gcode/subscribe_output",
    "register_remote_method",
];

/// Set of request types an endpoint accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestType(u8);

impl RequestType {
    pub const GET: RequestType = RequestType(1);
    pub const POST: RequestType = RequestType(2);
    pub const DELETE: RequestType = RequestType(4);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Self::GET | Self::POST | Self::DELETE
    }

    pub fn contains(self, other: RequestType) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn iter(self) -> impl Iterator<Item = RequestType> {
        [Self::GET, Self::POST, Self::DELETE]
            .into_iter()
            .filter(move |rt| self.contains(*rt))
    }

    /// Name of a single request type; sets render via `Display`.
    pub fn name(self) -> &'static str {
        match self {
            Self::GET => "GET",
            Self::POST => "POST",
            Self::DELETE => "DELETE",
            _ => "",
        }
    }

    pub fn from_http_method(method: &str) -> Option<Self> {
        match method {
            "GET" => Some(Self::GET),
            "POST" => Some(Self::POST),
            "DELETE" => Some(Self::DELETE),
            _ => None,
        }
    }
}

impl std::ops::BitOr for RequestType {
    type Output = RequestType;

    fn bitor(self, rhs: RequestType) -> RequestType {
        RequestType(self.0 | rhs.0)
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(RequestType::name).collect();
        write!(f, "{}", names.join("|"))
    }
}

/// Concrete carrier of an API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Http,
    /// Covers both WebSocket and Unix-socket clients; the two share
    /// connection semantics and method availability.
    WebSocket,
    Mqtt,
    Internal,
}

impl TransportType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::WebSocket => "WEBSOCKET",
            Self::Mqtt => "MQTT",
            Self::Internal => "INTERNAL",
        }
    }

    fn bit(self) -> u8 {
        match self {
            Self::Http => 1,
            Self::WebSocket => 2,
            Self::Mqtt => 4,
            Self::Internal => 8,
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of transports an endpoint is reachable from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSet(u8);

impl TransportSet {
    pub const HTTP: TransportSet = TransportSet(1);
    pub const WEBSOCKET: TransportSet = TransportSet(2);
    pub const MQTT: TransportSet = TransportSet(4);
    pub const INTERNAL: TransportSet = TransportSet(8);

    pub fn all() -> Self {
        Self(15)
    }

    pub fn contains(self, transport: TransportType) -> bool {
        self.0 & transport.bit() != 0
    }

    fn is_http_only(self) -> bool {
        self == Self::HTTP
    }
}

impl std::ops::BitOr for TransportSet {
    type Output = TransportSet;

    fn bitor(self, rhs: TransportSet) -> TransportSet {
        TransportSet(self.0 | rhs.0)
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;
pub type Handler = Arc<dyn Fn(WebRequest) -> HandlerFuture + Send + Sync>;

/// Registration parameters; everything beyond the endpoint and
/// request types defaults to the permissive values.
pub struct EndpointSpec {
    pub endpoint: String,
    pub request_types: RequestType,
    pub transports: TransportSet,
    pub auth_required: bool,
    pub is_remote: bool,
}

impl EndpointSpec {
    pub fn new(endpoint: impl Into<String>, request_types: RequestType) -> Self {
        Self {
            endpoint: endpoint.into(),
            request_types,
            transports: TransportSet::all(),
            auth_required: true,
            is_remote: false,
        }
    }

    pub fn transports(mut self, transports: TransportSet) -> Self {
        self.transports = transports;
        self
    }

    pub fn auth_required(mut self, auth_required: bool) -> Self {
        self.auth_required = auth_required;
        self
    }

    pub fn remote(mut self) -> Self {
        self.is_remote = true;
        self.request_types = RequestType::GET | RequestType::POST;
        self
    }
}

/// An immutable published API definition.
pub struct ApiDefinition {
    pub endpoint: String,
    pub http_path: String,
    /// JSON-RPC method names, one per request type when the endpoint
    /// serves several.
    pub rpc_methods: Vec<(RequestType, String)>,
    pub request_types: RequestType,
    pub transports: TransportSet,
    pub auth_required: bool,
    pub is_remote: bool,
    handler: Handler,
}

impl ApiDefinition {
    pub fn invoke(&self, request: WebRequest) -> HandlerFuture {
        (self.handler)(request)
    }

    pub fn is_debug(&self) -> bool {
        self.http_path.starts_with("/debug/")
    }
}

impl fmt::Debug for ApiDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiDefinition")
            .field("endpoint", &self.endpoint)
            .field("http_path", &self.http_path)
            .field("rpc_methods", &self.rpc_methods)
            .field("auth_required", &self.auth_required)
            .field("is_remote", &self.is_remote)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryInner {
    endpoints: HashMap<String, Arc<ApiDefinition>>,
    methods: HashMap<String, (RequestType, Arc<ApiDefinition>)>,
}

/// Process-wide endpoint table. Registration happens during component
/// initialization and when the backend reports its endpoints; lookups
/// happen on every dispatched request.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint. Idempotent: registering an endpoint that
    /// already exists returns the first definition untouched.
    pub fn register(&self, spec: EndpointSpec, handler: Handler) -> Result<Arc<ApiDefinition>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.endpoints.get(&spec.endpoint) {
            return Ok(existing.clone());
        }
        let api_def = Arc::new(build_definition(spec, handler)?);
        for (request_type, method) in &api_def.rpc_methods {
            inner
                .methods
                .insert(method.clone(), (*request_type, api_def.clone()));
        }
        inner
            .endpoints
            .insert(api_def.endpoint.clone(), api_def.clone());
        Ok(api_def)
    }

    pub fn lookup_method(&self, name: &str) -> Option<(RequestType, Arc<ApiDefinition>)> {
        self.inner.lock().unwrap().methods.get(name).cloned()
    }

    pub fn lookup_http_path(&self, path: &str) -> Option<Arc<ApiDefinition>> {
        let inner = self.inner.lock().unwrap();
        inner
            .endpoints
            .values()
            .find(|def| def.transports.contains(TransportType::Http) && def.http_path == path)
            .cloned()
    }

    pub fn lookup_endpoint(&self, endpoint: &str) -> Option<Arc<ApiDefinition>> {
        self.inner.lock().unwrap().endpoints.get(endpoint).cloned()
    }

    /// Remove an endpoint and its method table entries. Used when the
    /// backend link drops remote definitions on reconnect.
    pub fn remove_endpoint(&self, endpoint: &str) -> Option<Arc<ApiDefinition>> {
        let mut inner = self.inner.lock().unwrap();
        let api_def = inner.endpoints.remove(endpoint)?;
        for (_, method) in &api_def.rpc_methods {
            inner.methods.remove(method);
        }
        Some(api_def)
    }

    /// Debug-only listing of every registered definition.
    pub fn list_endpoints(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut endpoints: Vec<String> = inner.endpoints.keys().cloned().collect();
        endpoints.sort();
        endpoints
    }
}

fn build_definition(spec: EndpointSpec, handler: Handler) -> Result<ApiDefinition> {
    let EndpointSpec {
        endpoint,
        mut request_types,
        transports,
        auth_required,
        is_remote,
    } = spec;
    if RESERVED_ENDPOINTS.contains(&endpoint.trim_matches('/')) {
        return Err(ServerError::new(
            format!("Endpoint '{endpoint}' is reserved"),
            500,
        ));
    }
    let http_path = if is_remote {
        format!("/printer/{}", endpoint.trim_matches('/'))
    } else {
        endpoint.clone()
    };
    if transports.contains(TransportType::Http) {
        let first_segment = http_path
            .strip_prefix('/')
            .and_then(|rest| rest.split('/').next())
            .unwrap_or("");
        if !ENDPOINT_PREFIXES.contains(&first_segment) {
            return Err(ServerError::new(
                format!(
                    "Invalid endpoint name '{endpoint}', must start with one of \
                     the following: {ENDPOINT_PREFIXES:?}"
                ),
                500,
            ));
        }
    }
    let mut rpc_methods = Vec::new();
    if is_remote {
        // Request types have no meaning for remote requests, so both
        // GET and POST are accepted and a single dotted method is
        // derived from the HTTP projection.
        request_types = RequestType::GET | RequestType::POST;
        rpc_methods.push((RequestType::GET, http_path[1..].replace('/', ".")));
    } else if !transports.is_http_only() {
        let name_parts: Vec<&str> = http_path.trim_start_matches('/').split('/').collect();
        if request_types.count() > 1 {
            for request_type in request_types.iter() {
                let mut parts = name_parts.clone();
                let last = parts.pop().unwrap_or_default();
                let func_name = format!("{}_{last}", request_type.name().to_lowercase());
                parts.push(&func_name);
                rpc_methods.push((request_type, parts.join(".")));
            }
        } else if let Some(request_type) = request_types.iter().next() {
            rpc_methods.push((request_type, name_parts.join(".")));
        }
        if request_types.count() as usize != rpc_methods.len() {
            return Err(ServerError::with_kind(
                ErrorKind::Application(500),
                "Invalid API definition: request type and method counts differ",
            ));
        }
    }
    Ok(ApiDefinition {
        endpoint,
        http_path,
        rpc_methods,
        request_types,
        transports,
        auth_required,
        is_remote,
        handler,
    })
}

#[cfg(test)]
pub(crate) fn noop_handler() -> Handler {
    Arc::new(|_req| Box::pin(async { Ok(Value::Null) }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(registry: &Registry, spec: EndpointSpec) -> Arc<ApiDefinition> {
        registry.register(spec, noop_handler()).unwrap()
    }

    #[test]
    fn http_paths_must_use_known_prefixes() {
        let registry = Registry::new();
        let err = registry
            .register(
                EndpointSpec::new("/widgets/list", RequestType::GET),
                noop_handler(),
            )
            .unwrap_err();
        assert!(err.message().contains("Invalid endpoint name"));

        for prefix in ENDPOINT_PREFIXES {
            register(
                &registry,
                EndpointSpec::new(format!("/{prefix}/case"), RequestType::GET),
            );
        }
    }

    #[test]
    fn prefix_validation_skipped_without_http() {
        let registry = Registry::new();
        let def = register(
            &registry,
            EndpointSpec::new("/connection/send_event", RequestType::POST)
                .transports(TransportSet::WEBSOCKET),
        );
        assert_eq!(def.rpc_methods[0].1, "connection.send_event");
    }

    #[test]
    fn remote_definitions_derive_method_and_request_types() {
        let registry = Registry::new();
        let def = register(
            &registry,
            EndpointSpec::new("gcode/script", RequestType::empty()).remote(),
        );
        assert_eq!(def.http_path, "/printer/gcode/script");
        assert_eq!(def.rpc_methods.len(), 1);
        assert_eq!(def.rpc_methods[0].1, "printer.gcode.script");
        assert!(def.request_types.contains(RequestType::GET));
        assert!(def.request_types.contains(RequestType::POST));
        assert!(!def.request_types.contains(RequestType::DELETE));
    }

    #[test]
    fn multi_request_type_endpoints_get_verb_prefixed_methods() {
        let registry = Registry::new();
        let def = register(
            &registry,
            EndpointSpec::new("/server/database/item", RequestType::all()),
        );
        let methods: Vec<&str> = def.rpc_methods.iter().map(|(_, m)| m.as_str()).collect();
        assert_eq!(
            methods,
            vec![
                "server.database.get_item",
                "server.database.post_item",
                "server.database.delete_item",
            ]
        );
        assert!(registry.lookup_method("server.database.get_item").is_some());
    }

    #[test]
    fn registration_is_idempotent() {
        let registry = Registry::new();
        let first = register(
            &registry,
            EndpointSpec::new("/server/info", RequestType::GET),
        );
        let second = register(
            &registry,
            EndpointSpec::new("/server/info", RequestType::GET | RequestType::POST),
        );
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.request_types, RequestType::GET);
    }

    #[test]
    fn reserved_endpoints_are_rejected() {
        let registry = Registry::new();
        for reserved in RESERVED_ENDPOINTS {
            assert!(
                registry
                    .register(
                        EndpointSpec::new(*reserved, RequestType::POST).remote(),
                        noop_handler(),
                    )
                    .is_err()
            );
        }
    }

    #[test]
    fn removal_clears_method_table() {
        let registry = Registry::new();
        register(
            &registry,
            EndpointSpec::new("objects/query", RequestType::empty()).remote(),
        );
        assert!(registry.lookup_method("printer.objects.query").is_some());
        registry.remove_endpoint("objects/query");
        assert!(registry.lookup_method("printer.objects.query").is_none());
        assert!(registry.lookup_http_path("/printer/objects/query").is_none());
    }

    #[test]
    fn debug_endpoints_are_tagged() {
        let registry = Registry::new();
        let def = register(
            &registry,
            EndpointSpec::new("/debug/database/list", RequestType::GET),
        );
        assert!(def.is_debug());
        let def = register(
            &registry,
            EndpointSpec::new("/server/database/list", RequestType::GET),
        );
        assert!(!def.is_debug());
    }
}
