//! Transport handles.
//!
//! Every API call is attributed to an [`ApiTransport`]: a capability
//! surface over the concrete carrier (HTTP exchange, WebSocket or Unix
//! stream, the MQTT singleton, or an in-process caller). Persistent
//! socket clients share [`RemoteConnection`], which owns the ordered
//! outbound queue and the pending table for server-to-client calls.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{ErrorKind, Result, ServerError};
use crate::registry::{ApiDefinition, TransportType};
use crate::request::UserInfo;

static NEXT_UID: AtomicU64 = AtomicU64::new(1);
static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_uid() -> u64 {
    NEXT_UID.fetch_add(1, Ordering::Relaxed)
}

/// Kernel-reported credentials of a Unix-socket peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCreds {
    pub process_id: i64,
    pub user_id: i64,
    pub group_id: i64,
}

pub trait ApiTransport: Send + Sync {
    fn uid(&self) -> u64;

    fn transport_type(&self) -> TransportType;

    fn user_info(&self) -> Option<UserInfo> {
        None
    }

    fn ip_addr(&self) -> Option<IpAddr> {
        None
    }

    /// Hook invoked before a JSON-RPC handler runs. Socket transports
    /// enforce authentication here; MQTT consumes the duplicate
    /// suppression timestamp.
    fn screen_rpc_request(
        &self,
        _api_def: &ApiDefinition,
        _args: &mut Map<String, Value>,
    ) -> Result<()> {
        Ok(())
    }

    /// Push a projected status update to this handle.
    fn send_status(&self, status: Map<String, Value>, eventtime: f64);

    /// The persistent connection behind this handle, when it has one.
    fn remote_connection(&self) -> Option<Arc<RemoteConnection>> {
        None
    }
}

/// Identification record supplied by `server.connection.identify`.
#[derive(Debug, Clone)]
pub struct ClientData {
    pub name: String,
    pub version: String,
    pub client_type: String,
    pub url: String,
}

impl Default for ClientData {
    fn default() -> Self {
        Self {
            name: "unknown".into(),
            version: String::new(),
            client_type: String::new(),
            url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ConnectionKind {
    WebSocket { ip: Option<IpAddr> },
    Unix { peer: Option<PeerCreds> },
}

struct ConnState {
    client_data: ClientData,
    identified: bool,
    user: Option<UserInfo>,
    need_auth: bool,
    closed: bool,
    pending_responses: HashMap<u64, oneshot::Sender<Result<Value>>>,
}

/// State shared by the persistent socket transports.
///
/// Outbound messages are funneled through an unbounded queue drained by
/// the transport's single writer task, which guarantees in-order
/// delivery without interleaving. Closing completes every pending
/// server-to-client call with a disconnect error.
pub struct RemoteConnection {
    uid: u64,
    kind: ConnectionKind,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    state: Mutex<ConnState>,
    self_ref: Weak<RemoteConnection>,
}

impl RemoteConnection {
    pub fn new(kind: ConnectionKind) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new_cyclic(|self_ref| Self {
            uid: next_uid(),
            kind,
            outbound: tx,
            state: Mutex::new(ConnState {
                client_data: ClientData::default(),
                identified: false,
                user: None,
                need_auth: false,
                closed: false,
                pending_responses: HashMap::new(),
            }),
            self_ref: self_ref.clone(),
        });
        (conn, rx)
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn peer_creds(&self) -> Option<PeerCreds> {
        match self.kind {
            ConnectionKind::Unix { peer } => peer,
            ConnectionKind::WebSocket { .. } => None,
        }
    }

    pub fn client_data(&self) -> ClientData {
        self.state.lock().unwrap().client_data.clone()
    }

    pub fn identified(&self) -> bool {
        self.state.lock().unwrap().identified
    }

    /// Record the identification data; the connection counts as
    /// identified from this point on.
    pub fn set_client_data(&self, data: ClientData) {
        let mut state = self.state.lock().unwrap();
        state.client_data = data;
        state.identified = true;
    }

    pub fn set_user_info(&self, user: UserInfo) {
        let mut state = self.state.lock().unwrap();
        state.user = Some(user);
        state.need_auth = false;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Queue a serialized message for ordered delivery.
    pub fn queue_raw(&self, payload: Vec<u8>) {
        if self.is_closed() {
            return;
        }
        let _ = self.outbound.send(payload);
    }

    pub fn queue_message(&self, message: &Value) {
        match serde_json::to_vec(message) {
            Ok(payload) => self.queue_raw(payload),
            Err(error) => debug!(uid = self.uid, %error, "failed to encode outbound message"),
        }
    }

    /// Send a JSON-RPC notification to the client.
    pub fn call_method(&self, method: &str, params: Option<Value>) {
        self.queue_message(&gantry_wire::build_request(method, params, None));
    }

    /// Call a method on the client and wait for its response, matched
    /// through the pending-response table.
    pub async fn call_method_with_response(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        let call_id = NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(ServerError::new("Client Socket Disconnected", 500));
            }
            state.pending_responses.insert(call_id, tx);
        }
        self.queue_message(&gantry_wire::build_request(
            method,
            params,
            Some(Value::from(call_id)),
        ));
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ServerError::new("Client Socket Disconnected", 500)),
        }
    }

    /// Resolve a response to a prior server-to-client call. Returns
    /// false when no pending call matches the id.
    pub fn resolve_pending_response(&self, response_id: u64, result: Result<Value>) -> bool {
        let sender = {
            let mut state = self.state.lock().unwrap();
            state.pending_responses.remove(&response_id)
        };
        match sender {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Mark closed and fail every pending server-to-client call. The
    /// transport's read loop drives the rest of the cleanup (manager
    /// removal, subscription removal, agent unregistration).
    pub fn close(&self) {
        let pending: Vec<oneshot::Sender<Result<Value>>> = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.pending_responses.drain().map(|(_, tx)| tx).collect()
        };
        for tx in pending {
            let _ = tx.send(Err(ServerError::new("Client Socket Disconnected", 500)));
        }
    }

    fn check_authenticated(&self, api_def: &ApiDefinition) -> Result<()> {
        let state = self.state.lock().unwrap();
        if state.need_auth && api_def.auth_required {
            return Err(ServerError::with_kind(ErrorKind::Unauthorized, "Unauthorized"));
        }
        Ok(())
    }
}

impl ApiTransport for RemoteConnection {
    fn uid(&self) -> u64 {
        self.uid
    }

    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }

    fn user_info(&self) -> Option<UserInfo> {
        self.state.lock().unwrap().user.clone()
    }

    fn ip_addr(&self) -> Option<IpAddr> {
        match self.kind {
            ConnectionKind::WebSocket { ip } => ip,
            ConnectionKind::Unix { .. } => None,
        }
    }

    fn screen_rpc_request(
        &self,
        api_def: &ApiDefinition,
        _args: &mut Map<String, Value>,
    ) -> Result<()> {
        self.check_authenticated(api_def)
    }

    fn send_status(&self, status: Map<String, Value>, eventtime: f64) {
        if status.is_empty() {
            return;
        }
        self.queue_message(&gantry_wire::build_request(
            "notify_status_update",
            Some(Value::Array(vec![Value::Object(status), eventtime.into()])),
            None,
        ));
    }

    fn remote_connection(&self) -> Option<Arc<RemoteConnection>> {
        self.self_ref.upgrade()
    }
}

/// Tracks every live persistent connection for broadcasts.
#[derive(Default)]
pub struct ConnectionManager {
    clients: Mutex<HashMap<u64, Arc<RemoteConnection>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_client(&self, conn: Arc<RemoteConnection>) {
        self.clients.lock().unwrap().insert(conn.uid(), conn);
    }

    pub fn remove_client(&self, uid: u64) -> Option<Arc<RemoteConnection>> {
        self.clients.lock().unwrap().remove(&uid)
    }

    pub fn get_client(&self, uid: u64) -> Option<Arc<RemoteConnection>> {
        self.clients.lock().unwrap().get(&uid).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Broadcast a JSON-RPC notification to every connected client.
    pub fn notify_clients(&self, name: &str, params: Value) {
        self.notify_clients_except(name, params, None);
    }

    /// Broadcast, optionally skipping the originating connection.
    pub fn notify_clients_except(&self, name: &str, params: Value, exclude_uid: Option<u64>) {
        let message = gantry_wire::build_request(name, Some(params), None);
        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(error) => {
                debug!(%error, "failed to encode notification");
                return;
            }
        };
        let clients: Vec<Arc<RemoteConnection>> =
            self.clients.lock().unwrap().values().cloned().collect();
        for client in clients {
            if Some(client.uid()) == exclude_uid {
                continue;
            }
            client.queue_raw(payload.clone());
        }
    }

    pub fn close_all(&self) {
        let clients: Vec<Arc<RemoteConnection>> =
            self.clients.lock().unwrap().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.close();
        }
    }
}

/// In-process caller; used for gateway-owned subscriptions and internal
/// requests.
pub struct InternalTransport {
    uid: u64,
}

impl InternalTransport {
    pub fn new() -> Self {
        Self { uid: next_uid() }
    }
}

impl Default for InternalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiTransport for InternalTransport {
    fn uid(&self) -> u64 {
        self.uid
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Internal
    }

    fn send_status(&self, status: Map<String, Value>, _eventtime: f64) {
        debug!(objects = status.len(), "internal status update dropped");
    }
}

/// One-shot handle for a single HTTP exchange.
pub struct HttpTransport {
    uid: u64,
    ip: Option<IpAddr>,
}

impl HttpTransport {
    pub fn new(ip: Option<IpAddr>) -> Self {
        Self {
            uid: next_uid(),
            ip,
        }
    }
}

impl ApiTransport for HttpTransport {
    fn uid(&self) -> u64 {
        self.uid
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Http
    }

    fn ip_addr(&self) -> Option<IpAddr> {
        self.ip
    }

    fn send_status(&self, _status: Map<String, Value>, _eventtime: f64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_queue_preserves_order() {
        let (conn, mut rx) = RemoteConnection::new(ConnectionKind::WebSocket { ip: None });
        conn.queue_raw(b"first".to_vec());
        conn.queue_raw(b"second".to_vec());
        conn.queue_raw(b"third".to_vec());
        assert_eq!(rx.try_recv().unwrap(), b"first");
        assert_eq!(rx.try_recv().unwrap(), b"second");
        assert_eq!(rx.try_recv().unwrap(), b"third");
    }

    #[tokio::test]
    async fn pending_call_resolves_by_id() {
        let (conn, mut rx) = RemoteConnection::new(ConnectionKind::Unix { peer: None });
        let call = conn.call_method_with_response("list_objects", None);
        tokio::pin!(call);

        // The request envelope carries the id the response must echo.
        let sent = rx.recv().await.unwrap();
        let envelope: Value = serde_json::from_slice(&sent).unwrap();
        let id = envelope["id"].as_u64().unwrap();

        assert!(conn.resolve_pending_response(id, Ok(serde_json::json!({"objects": []}))));
        let result = call.await.unwrap();
        assert_eq!(result, serde_json::json!({"objects": []}));
        assert!(!conn.resolve_pending_response(id, Ok(Value::Null)));
    }

    #[tokio::test]
    async fn close_fails_pending_calls() {
        let (conn, _rx) = RemoteConnection::new(ConnectionKind::WebSocket { ip: None });
        let call = conn.call_method_with_response("probe", None);
        tokio::pin!(call);
        conn.close();
        let err = call.await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        // Closed connections reject further calls immediately.
        let err = conn
            .call_method_with_response("probe", None)
            .await
            .unwrap_err();
        assert_eq!(err.message(), "Client Socket Disconnected");
    }

    #[test]
    fn identify_marks_connection() {
        let (conn, _rx) = RemoteConnection::new(ConnectionKind::WebSocket { ip: None });
        assert!(!conn.identified());
        conn.set_client_data(ClientData {
            name: "mainsail".into(),
            version: "2.8".into(),
            client_type: "web".into(),
            url: "http://example.local".into(),
        });
        assert!(conn.identified());
        assert_eq!(conn.client_data().name, "mainsail");
    }
}
