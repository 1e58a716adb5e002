//! The server aggregate: owns the registry, dispatcher, connection
//! manager, backend link, persistence engine, and extension manager,
//! and registers the built-in endpoints.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::info;

use crate::config::Config;
use crate::db::Database;
use crate::error::{Result, ServerError};
use crate::extensions::ExtensionManager;
use crate::klippy::KlippyConnection;
use crate::mqtt::MqttClient;
use crate::registry::{EndpointSpec, Handler, Registry, RequestType, TransportSet};
use crate::request::WebRequest;
use crate::rpc::JsonRpc;
use crate::transport::{ConnectionManager, InternalTransport, RemoteConnection};

pub const API_VERSION: (u8, u8, u8) = (1, 5, 0);

pub struct Server {
    pub config: Config,
    pub registry: Arc<Registry>,
    pub rpc: JsonRpc,
    pub connections: ConnectionManager,
    pub database: Arc<Database>,
    pub klippy: Arc<KlippyConnection>,
    pub extensions: ExtensionManager,
    pub internal_transport: Arc<InternalTransport>,
    mqtt: Mutex<Option<Arc<MqttClient>>>,
}

impl Server {
    pub fn new(config: Config, database: Database) -> Arc<Server> {
        let registry = Arc::new(Registry::new());
        Arc::new_cyclic(|weak: &Weak<Server>| Server {
            rpc: JsonRpc::new(registry.clone()),
            connections: ConnectionManager::new(),
            database: Arc::new(database),
            klippy: KlippyConnection::new(weak.clone(), config.klippy.uds_address.clone()),
            extensions: ExtensionManager::new(weak.clone()),
            internal_transport: Arc::new(InternalTransport::new()),
            registry,
            config,
            mqtt: Mutex::new(None),
        })
    }

    pub fn set_mqtt(&self, mqtt: Arc<MqttClient>) {
        *self.mqtt.lock().unwrap() = Some(mqtt);
    }

    pub fn mqtt(&self) -> Option<Arc<MqttClient>> {
        self.mqtt.lock().unwrap().clone()
    }

    /// Register an endpoint reported by the backend; requests forward
    /// through the backend connection.
    pub fn register_remote_endpoint(&self, endpoint: &str) -> Result<()> {
        let klippy = Arc::downgrade(&self.klippy);
        self.registry.register(
            EndpointSpec::new(endpoint, RequestType::empty()).remote(),
            Arc::new(move |request| {
                let klippy = klippy.clone();
                Box::pin(async move {
                    let klippy = klippy
                        .upgrade()
                        .ok_or_else(|| ServerError::internal("server shutting down"))?;
                    klippy.request(request).await
                })
            }),
        )?;
        Ok(())
    }

    /// Register every built-in endpoint. Runs during initialization,
    /// before any transport accepts traffic.
    pub fn register_builtin_endpoints(self: &Arc<Self>) -> Result<()> {
        self.registry.register(
            EndpointSpec::new("/server/info", RequestType::GET).auth_required(false),
            handler(self, handle_server_info),
        )?;
        self.registry.register(
            EndpointSpec::new("/server/connection/identify", RequestType::POST)
                .transports(TransportSet::WEBSOCKET),
            handler(self, handle_identify),
        )?;
        self.registry.register(
            EndpointSpec::new("/server/websocket/id", RequestType::GET)
                .transports(TransportSet::WEBSOCKET),
            handler(self, handle_websocket_id),
        )?;
        self.registry.register(
            EndpointSpec::new("/server/database/list", RequestType::GET),
            handler(self, handle_database_list),
        )?;
        self.registry.register(
            EndpointSpec::new("/server/database/item", RequestType::all()),
            handler(self, handle_database_item),
        )?;
        self.registry.register(
            EndpointSpec::new(
                "/server/database/backup",
                RequestType::POST | RequestType::DELETE,
            ),
            handler(self, handle_database_backup),
        )?;
        self.registry.register(
            EndpointSpec::new("/server/database/restore", RequestType::POST),
            handler(self, handle_database_restore),
        )?;
        self.registry.register(
            EndpointSpec::new("/server/database/compact", RequestType::POST),
            handler(self, handle_database_compact),
        )?;
        if self.config.server.enable_debug {
            self.registry.register(
                EndpointSpec::new("/debug/database/list", RequestType::GET),
                handler(self, handle_database_list),
            )?;
            self.registry.register(
                EndpointSpec::new("/debug/database/item", RequestType::all()),
                handler(self, handle_database_item),
            )?;
            self.registry.register(
                EndpointSpec::new("/debug/database/table", RequestType::GET),
                handler(self, handle_database_table),
            )?;
            self.registry.register(
                EndpointSpec::new("/debug/server/endpoints", RequestType::GET),
                handler(self, handle_list_registered_endpoints),
            )?;
        }
        self.registry.register(
            EndpointSpec::new("/connection/register_remote_method", RequestType::POST)
                .transports(TransportSet::WEBSOCKET),
            handler(self, |server, request| async move {
                server.extensions.handle_register_method(request).await
            }),
        )?;
        self.registry.register(
            EndpointSpec::new("/connection/send_event", RequestType::POST)
                .transports(TransportSet::WEBSOCKET),
            handler(self, |server, request| async move {
                server.extensions.handle_agent_event(request).await
            }),
        )?;
        self.registry.register(
            EndpointSpec::new("/server/extensions/list", RequestType::GET),
            handler(self, |server, request| async move {
                server.extensions.handle_list_extensions(request).await
            }),
        )?;
        self.registry.register(
            EndpointSpec::new("/server/extensions/request", RequestType::POST),
            handler(self, |server, request| async move {
                server.extensions.handle_call_agent(request).await
            }),
        )?;
        Ok(())
    }

    /// Transport-close cleanup shared by the WebSocket and Unix
    /// socket carriers.
    pub fn on_connection_closed(&self, conn: &Arc<RemoteConnection>) {
        conn.close();
        self.connections.remove_client(conn.uid());
        self.klippy.remove_subscription(conn.uid());
        self.extensions.on_connection_closed(conn);
    }

    pub async fn close(&self) {
        self.klippy.close().await;
        if let Some(mqtt) = self.mqtt() {
            mqtt.close().await;
        }
        self.connections.close_all();
        self.database.close().await;
        info!("server stopped");
    }
}

/// Wrap a `(Arc<Server>, WebRequest)` async fn as a registry handler.
/// The captured reference is weak so the registry never keeps the
/// server alive.
pub fn handler<F, Fut>(server: &Arc<Server>, func: F) -> Handler
where
    F: Fn(Arc<Server>, WebRequest) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
{
    let weak = Arc::downgrade(server);
    Arc::new(move |request| {
        let weak = weak.clone();
        let func = func.clone();
        Box::pin(async move {
            let server = weak
                .upgrade()
                .ok_or_else(|| ServerError::internal("server shutting down"))?;
            func(server, request).await
        })
    })
}

async fn handle_server_info(server: Arc<Server>, _request: WebRequest) -> Result<Value> {
    let mut components = vec!["database", "klippy_connection", "extensions"];
    if server.mqtt().is_some() {
        components.push("mqtt");
    }
    Ok(serde_json::json!({
        "klippy_connected": server.klippy.is_connected(),
        "klippy_state": server.klippy.state().name(),
        "components": components,
        "failed_components": [],
        "registered_directories": [],
        "warnings": [],
        "websocket_count": server.connections.client_count(),
        "moonraker_version": env!("CARGO_PKG_VERSION"),
        "api_version": [API_VERSION.0, API_VERSION.1, API_VERSION.2],
        "api_version_string": format!("{}.{}.{}", API_VERSION.0, API_VERSION.1, API_VERSION.2),
    }))
}

async fn handle_identify(server: Arc<Server>, request: WebRequest) -> Result<Value> {
    let conn = socket_connection(&request)?;
    let data = crate::transport::ClientData {
        name: request.get_str("client_name")?,
        version: request.get_str("version")?,
        client_type: request.get_str("type")?,
        url: request.get_str("url")?,
    };
    info!(
        name = data.name.as_str(),
        client_type = data.client_type.as_str(),
        uid = conn.uid(),
        "client identified"
    );
    conn.set_client_data(data.clone());
    if data.client_type == "agent" {
        server.extensions.register_agent(&conn)?;
    }
    Ok(serde_json::json!({"connection_id": conn.uid()}))
}

async fn handle_websocket_id(_server: Arc<Server>, request: WebRequest) -> Result<Value> {
    let conn = socket_connection(&request)?;
    Ok(serde_json::json!({"websocket_id": conn.uid()}))
}

async fn handle_list_registered_endpoints(
    server: Arc<Server>,
    _request: WebRequest,
) -> Result<Value> {
    Ok(serde_json::json!({"endpoints": server.registry.list_endpoints()}))
}

fn is_debug_request(request: &WebRequest) -> bool {
    request.endpoint().starts_with("/debug/")
}

async fn handle_database_list(server: Arc<Server>, request: WebRequest) -> Result<Value> {
    let is_debug = is_debug_request(&request);
    let mut namespaces = server.database.namespaces().await?;
    if !is_debug {
        let forbidden = server.database.forbidden_namespaces();
        namespaces.retain(|ns| !forbidden.contains(ns));
    }
    let mut backups = Vec::new();
    let backup_dir = server.database.backup_dir().clone();
    if backup_dir.is_dir() {
        let mut entries = tokio::fs::read_dir(&backup_dir)
            .await
            .map_err(|e| ServerError::internal(format!("read backup dir: {e}")))?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                backups.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }
    let mut response = serde_json::json!({
        "namespaces": namespaces,
        "backups": backups,
    });
    if is_debug {
        response["tables"] = serde_json::json!(server.database.tables().await?);
    }
    Ok(response)
}

/// Convert the `key` argument, which may be a dotted string or a list
/// of segments, into the dotted form used by the store.
fn key_argument(request: &WebRequest, required: bool) -> Result<Option<String>> {
    match request.get("key") {
        None | Some(Value::Null) => {
            if required {
                Err(ServerError::invalid_params("Missing required argument 'key'"))
            } else {
                Ok(None)
            }
        }
        Some(Value::String(key)) => Ok(Some(key.clone())),
        Some(Value::Array(segments)) => {
            let mut parts = Vec::with_capacity(segments.len());
            for segment in segments {
                match segment.as_str() {
                    Some(part) => parts.push(part.to_string()),
                    None => {
                        return Err(ServerError::invalid_params(
                            "Key list must contain only strings",
                        ));
                    }
                }
            }
            Ok(Some(parts.join(".")))
        }
        Some(other) => Err(ServerError::invalid_params(format!(
            "Value for argument 'key' is an invalid type: {other}"
        ))),
    }
}

async fn handle_database_item(server: Arc<Server>, request: WebRequest) -> Result<Value> {
    let is_debug = is_debug_request(&request);
    let namespace = request.get_str("namespace")?;
    if server.database.is_forbidden(&namespace) && !is_debug {
        return Err(ServerError::new(
            format!("Read/Write access to namespace '{namespace}' is forbidden"),
            403,
        ));
    }
    let request_type = request.request_type();
    let (key, value) = if request_type == RequestType::GET {
        let key = key_argument(&request, false)?;
        let value = server.database.get_item(&namespace, key.as_deref()).await?;
        (key, value)
    } else {
        if server.database.is_protected(&namespace) && !is_debug {
            return Err(ServerError::new(
                format!("Write access to namespace '{namespace}' is forbidden"),
                403,
            ));
        }
        let key = key_argument(&request, true)?.unwrap_or_default();
        if request_type == RequestType::POST {
            let value = request
                .get("value")
                .cloned()
                .ok_or_else(|| ServerError::invalid_params("Missing required argument 'value'"))?;
            server.database.insert_item(&namespace, &key, value.clone()).await?;
            (Some(key), value)
        } else {
            let value = server.database.delete_item(&namespace, &key).await?;
            server.database.drop_empty_namespace(&namespace).await?;
            (Some(key), value)
        }
    };
    Ok(serde_json::json!({
        "namespace": namespace,
        "key": key,
        "value": value,
    }))
}

/// Resolve a backup file name inside the backup directory, refusing
/// anything that would escape it.
fn backup_path(server: &Server, filename: &str) -> Result<PathBuf> {
    if filename.is_empty() || filename.contains('/') || filename.contains("..") {
        return Err(ServerError::invalid_params(format!(
            "Invalid name {filename}"
        )));
    }
    Ok(server.database.backup_dir().join(filename))
}

async fn handle_database_backup(server: Arc<Server>, request: WebRequest) -> Result<Value> {
    let _guard = server.database.backup_lock.lock().await;
    let path = match request.request_type() {
        RequestType::POST => {
            let suffix = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let filename =
                request.get_str_or("filename", &format!("sqldb-backup-{suffix}.db"))?;
            let path = backup_path(&server, &filename)?;
            server.database.backup(path.clone()).await?;
            path
        }
        RequestType::DELETE => {
            let filename = request.get_str("filename")?;
            let path = backup_path(&server, &filename)?;
            if !path.is_file() {
                return Err(ServerError::not_found(format!(
                    "Backup file {filename} does not exist"
                )));
            }
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| ServerError::internal(format!("remove backup: {e}")))?;
            path
        }
        _ => return Err(ServerError::invalid_params("Invalid request type")),
    };
    Ok(serde_json::json!({"backup_path": path.to_string_lossy()}))
}

async fn handle_database_restore(server: Arc<Server>, request: WebRequest) -> Result<Value> {
    let _guard = server.database.backup_lock.lock().await;
    let filename = request.get_str("filename")?;
    let path = backup_path(&server, &filename)?;
    let (restored_tables, restored_namespaces) = server.database.restore(path).await?;
    info!("database restored, restart required");
    Ok(serde_json::json!({
        "restored_tables": restored_tables,
        "restored_namespaces": restored_namespaces,
    }))
}

async fn handle_database_compact(server: Arc<Server>, _request: WebRequest) -> Result<Value> {
    let _guard = server.database.backup_lock.lock().await;
    let (previous_size, new_size) = server.database.compact().await?;
    Ok(serde_json::json!({
        "previous_size": previous_size,
        "new_size": new_size,
    }))
}

async fn handle_database_table(server: Arc<Server>, request: WebRequest) -> Result<Value> {
    let table = request.get_str("table")?;
    if !server.database.tables().await?.contains(&table) {
        return Err(ServerError::not_found(format!(
            "Table name '{table}' does not exist"
        )));
    }
    let rows = server
        .database
        .sql_query(&format!("SELECT rowid, * FROM {table}"), Vec::new())
        .await?;
    Ok(serde_json::json!({
        "table_name": table,
        "rows": rows.into_iter().map(Value::Object).collect::<Vec<_>>(),
    }))
}

fn socket_connection(request: &WebRequest) -> Result<Arc<RemoteConnection>> {
    request
        .transport()
        .and_then(|transport| transport.remote_connection())
        .ok_or_else(|| ServerError::new("Not a persistent connection", 400))
}
