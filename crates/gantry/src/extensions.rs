//! Agent extension management.
//!
//! Agents are persistent clients (WebSocket or Unix socket) that
//! identify with type `"agent"`. They may register remote methods that
//! the backend can invoke, emit events to other clients, and service
//! server-to-client calls issued through `server/extensions/request`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tracing::info;

use crate::error::{Result, ServerError};
use crate::request::WebRequest;
use crate::server::Server;
use crate::transport::RemoteConnection;

pub struct ExtensionManager {
    server: Weak<Server>,
    agents: Mutex<HashMap<String, Arc<RemoteConnection>>>,
    agent_methods: Mutex<HashMap<u64, Vec<String>>>,
}

impl ExtensionManager {
    pub fn new(server: Weak<Server>) -> Self {
        Self {
            server,
            agents: Mutex::new(HashMap::new()),
            agent_methods: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_agent(&self, conn: &Arc<RemoteConnection>) -> Result<()> {
        let data = conn.client_data();
        if data.client_type != "agent" {
            return Err(ServerError::new(
                format!("Cannot register client type '{}' as an agent", data.client_type),
                400,
            ));
        }
        {
            let mut agents = self.agents.lock().unwrap();
            if agents.contains_key(&data.name) {
                return Err(ServerError::new(
                    format!("Agent '{}' already registered and connected", data.name),
                    400,
                ));
            }
            agents.insert(data.name.clone(), conn.clone());
        }
        info!(agent = data.name.as_str(), "agent registered");
        self.broadcast_agent_event(
            conn,
            serde_json::json!({
                "agent": data.name,
                "event": "connected",
                "data": {
                    "name": data.name,
                    "version": data.version,
                    "type": data.client_type,
                    "url": data.url,
                },
            }),
        );
        Ok(())
    }

    /// Drop an agent on connection close, unregistering any remote
    /// methods it claimed.
    pub fn remove_agent(&self, conn: &Arc<RemoteConnection>) {
        let name = conn.client_data().name;
        let removed = self.agents.lock().unwrap().remove(&name).is_some();
        if !removed {
            return;
        }
        let methods = self
            .agent_methods
            .lock()
            .unwrap()
            .remove(&conn.uid())
            .unwrap_or_default();
        if let Some(server) = self.server.upgrade() {
            for method in methods {
                server.klippy.unregister_method(&method);
            }
        }
        info!(agent = name.as_str(), "agent removed");
        self.broadcast_agent_event(
            conn,
            serde_json::json!({"agent": name, "event": "disconnected"}),
        );
    }

    /// Cleanup hook invoked by the transports when any persistent
    /// connection closes.
    pub fn on_connection_closed(&self, conn: &Arc<RemoteConnection>) {
        if conn.client_data().client_type == "agent" {
            self.remove_agent(conn);
        }
    }

    pub async fn handle_register_method(&self, web_request: WebRequest) -> Result<Value> {
        let conn = connection_for(&web_request)?;
        let method_name = web_request.get_str("method_name")?;
        let server = self.server()?;
        if conn.client_data().client_type != "agent" {
            return Err(ServerError::new(
                "Only connections of the 'agent' type can register methods",
                400,
            ));
        }
        server.klippy.register_method_from_agent(&conn, &method_name)?;
        self.agent_methods
            .lock()
            .unwrap()
            .entry(conn.uid())
            .or_default()
            .push(method_name);
        Ok(Value::String("ok".into()))
    }

    pub async fn handle_agent_event(&self, web_request: WebRequest) -> Result<Value> {
        let conn = connection_for(&web_request)?;
        let data = conn.client_data();
        if data.client_type != "agent" {
            return Err(ServerError::new(
                "Only connections of the 'agent' type can send events",
                400,
            ));
        }
        let event = web_request.get_str("event")?;
        if event == "connected" || event == "disconnected" {
            return Err(ServerError::new(
                format!("Event '{event}' is reserved"),
                400,
            ));
        }
        let mut payload = serde_json::json!({"agent": data.name, "event": event});
        if let Some(event_data) = web_request.get("data") {
            payload["data"] = event_data.clone();
        }
        self.broadcast_agent_event(&conn, payload);
        Ok(Value::String("ok".into()))
    }

    pub async fn handle_list_extensions(&self, _web_request: WebRequest) -> Result<Value> {
        let agents: Vec<Value> = self
            .agents
            .lock()
            .unwrap()
            .values()
            .map(|conn| {
                let data = conn.client_data();
                serde_json::json!({
                    "name": data.name,
                    "version": data.version,
                    "type": data.client_type,
                    "url": data.url,
                })
            })
            .collect();
        Ok(serde_json::json!({"agents": agents}))
    }

    /// Call a method on a connected agent and relay its response.
    pub async fn handle_call_agent(&self, web_request: WebRequest) -> Result<Value> {
        let agent = web_request.get_str("agent")?;
        let method = web_request.get_str("method")?;
        let arguments = web_request.get("arguments").cloned();
        if let Some(arguments) = &arguments {
            if !arguments.is_array() && !arguments.is_object() {
                return Err(ServerError::invalid_params(
                    "The 'arguments' field must contain an object or a list",
                ));
            }
        }
        let conn = self
            .agents
            .lock()
            .unwrap()
            .get(&agent)
            .cloned()
            .ok_or_else(|| ServerError::new(format!("Agent {agent} not connected"), 400))?;
        conn.call_method_with_response(&method, arguments).await
    }

    fn broadcast_agent_event(&self, conn: &Arc<RemoteConnection>, event: Value) {
        if let Some(server) = self.server.upgrade() {
            server.connections.notify_clients_except(
                "notify_agent_event",
                Value::Array(vec![event]),
                Some(conn.uid()),
            );
        }
    }

    fn server(&self) -> Result<Arc<Server>> {
        self.server
            .upgrade()
            .ok_or_else(|| ServerError::internal("server shutting down"))
    }
}

fn connection_for(web_request: &WebRequest) -> Result<Arc<RemoteConnection>> {
    web_request
        .transport()
        .and_then(|transport| transport.remote_connection())
        .ok_or_else(|| ServerError::new("No connection detected", 400))
}
