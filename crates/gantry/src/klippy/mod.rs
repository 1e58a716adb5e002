//! The backend (klippy) connection.
//!
//! A state machine manages one Unix-socket RPC link to the printer
//! control process: a background task polls the socket path while
//! disconnected, the identification handshake runs the `info` method
//! on a fixed cadence during startup, and every outbound request is
//! correlated to its response by a monotonic id through the pending
//! table. Remote methods registered by components and agents are
//! announced to the backend once it reports ready.

pub mod subscriptions;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use gantry_wire::{DEFAULT_MAX_FRAME_BYTES, FrameCodec, encode_frame};
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, Result, ServerError};
use crate::registry::{RESERVED_ENDPOINTS, RequestType};
use crate::request::WebRequest;
use crate::server::Server;
use crate::transport::{ApiTransport, PeerCreds, RemoteConnection};

use subscriptions::{ObjectSubscription, Subscriptions, project_status};

const INIT_TIME: Duration = Duration::from_millis(250);
const LOG_ATTEMPT_INTERVAL: u64 = 8;
const MAX_LOG_ATTEMPTS: u64 = 80;
const SUBSCRIPTION_TIMEOUT: Duration = Duration::from_secs(20);

const SRC_PATH_KEY: &str = "klippy_connection.path";
const PY_EXEC_KEY: &str = "klippy_connection.executable";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KlippyState {
    Disconnected,
    Connecting,
    Startup,
    Ready,
    Error,
    Shutdown,
}

impl KlippyState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Startup => "startup",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Shutdown => "shutdown",
        }
    }

    fn from_report(state: &str) -> Self {
        match state {
            "startup" => Self::Startup,
            "ready" => Self::Ready,
            "shutdown" => Self::Shutdown,
            _ => Self::Error,
        }
    }

    /// Whether the backend finished its startup sequence, successfully
    /// or not.
    pub fn startup_complete(self) -> bool {
        matches!(self, Self::Ready | Self::Error | Self::Shutdown)
    }
}

type RemoteCallback = Arc<dyn Fn(Map<String, Value>) + Send + Sync>;

enum RemoteMethod {
    /// In-process callback.
    Local(RemoteCallback),
    /// Forwarded to a connected agent as a JSON-RPC notification.
    Agent { conn: Weak<RemoteConnection> },
}

pub struct KlippyConnection {
    server: Weak<Server>,
    uds_path: PathBuf,
    state: Mutex<(KlippyState, String)>,
    klippy_info: Mutex<Map<String, Value>>,
    klipper_version: Mutex<String>,
    peer_cred: Mutex<Option<PeerCreds>>,
    writer_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    next_id: AtomicU64,
    remote_methods: Mutex<HashMap<String, RemoteMethod>>,
    reg_methods: Mutex<Vec<String>>,
    methods_registered: AtomicBool,
    identified: AtomicBool,
    initializing: AtomicBool,
    closing: AtomicBool,
    log_no_access: AtomicBool,
    shutdown: Notify,
    pub subscriptions: Subscriptions,
}

impl KlippyConnection {
    pub fn new(server: Weak<Server>, uds_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            server,
            uds_path,
            state: Mutex::new((KlippyState::Disconnected, String::new())),
            klippy_info: Mutex::new(Map::new()),
            klipper_version: Mutex::new(String::new()),
            peer_cred: Mutex::new(None),
            writer_tx: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            remote_methods: Mutex::new(HashMap::new()),
            reg_methods: Mutex::new(Vec::new()),
            methods_registered: AtomicBool::new(false),
            identified: AtomicBool::new(false),
            initializing: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            log_no_access: AtomicBool::new(true),
            shutdown: Notify::new(),
            subscriptions: Subscriptions::new(),
        })
    }

    pub fn state(&self) -> KlippyState {
        self.state.lock().unwrap().0
    }

    pub fn state_message(&self) -> String {
        self.state.lock().unwrap().1.clone()
    }

    fn set_state(&self, state: KlippyState) {
        self.state.lock().unwrap().0 = state;
    }

    fn set_state_message(&self, message: String) {
        self.state.lock().unwrap().1 = message;
    }

    pub fn is_connected(&self) -> bool {
        self.writer_tx.lock().unwrap().is_some() && !self.closing.load(Ordering::Relaxed)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == KlippyState::Ready
    }

    pub fn klippy_info(&self) -> Map<String, Value> {
        self.klippy_info.lock().unwrap().clone()
    }

    pub fn peer_credentials(&self) -> Option<PeerCreds> {
        *self.peer_cred.lock().unwrap()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Register an in-process remote method. Announced to the backend
    /// with the rest of the set on the first transition into ready, or
    /// immediately when the backend is already ready.
    pub fn register_remote_method(
        self: &Arc<Self>,
        method_name: &str,
        callback: RemoteCallback,
    ) -> Result<()> {
        self.install_remote_method(method_name, RemoteMethod::Local(callback))
    }

    /// Register a remote method on behalf of a connected agent;
    /// incoming calls are forwarded to it as notifications.
    pub fn register_method_from_agent(
        self: &Arc<Self>,
        conn: &Arc<RemoteConnection>,
        method_name: &str,
    ) -> Result<()> {
        self.install_remote_method(
            method_name,
            RemoteMethod::Agent {
                conn: Arc::downgrade(conn),
            },
        )
    }

    fn install_remote_method(
        self: &Arc<Self>,
        method_name: &str,
        method: RemoteMethod,
    ) -> Result<()> {
        {
            let mut methods = self.remote_methods.lock().unwrap();
            if methods.contains_key(method_name) {
                return Err(ServerError::new(
                    format!("Remote method ({method_name}) already registered"),
                    500,
                ));
            }
            methods.insert(method_name.to_string(), method);
        }
        self.reg_methods.lock().unwrap().push(method_name.to_string());
        if self.methods_registered.load(Ordering::Relaxed)
            && self.state() != KlippyState::Disconnected
        {
            let klippy = self.clone();
            let method_name = method_name.to_string();
            tokio::spawn(async move {
                if let Err(error) = klippy.announce_method(&method_name).await {
                    warn!(method = method_name.as_str(), %error, "failed to register remote method");
                }
            });
        }
        Ok(())
    }

    pub fn unregister_method(&self, method_name: &str) {
        self.remote_methods.lock().unwrap().remove(method_name);
        self.reg_methods
            .lock()
            .unwrap()
            .retain(|name| name != method_name);
    }

    async fn announce_method(&self, method_name: &str) -> Result<Value> {
        let mut params = Map::new();
        params.insert(
            "response_template".into(),
            serde_json::json!({"method": method_name}),
        );
        params.insert("remote_method".into(), Value::String(method_name.into()));
        self.request_standard("register_remote_method", params, None)
            .await
    }

    /// Forward a client request to the backend. Subscription requests
    /// route through the subscription engine.
    pub async fn request(&self, web_request: WebRequest) -> Result<Value> {
        if !self.is_connected() {
            return Err(ServerError::backend_unavailable("Klippy Host not connected"));
        }
        if web_request.endpoint() == "objects/subscribe" {
            self.request_subscription(web_request).await
        } else {
            self.request_standard(
                &web_request.endpoint().to_string(),
                web_request.into_args(),
                None,
            )
            .await
        }
    }

    async fn request_subscription(&self, web_request: WebRequest) -> Result<Value> {
        let _guard = self.subscriptions.subscribe_lock.lock().await;
        let conn = web_request
            .transport()
            .cloned()
            .ok_or_else(|| {
                ServerError::internal("No connection associated with subscription request")
            })?;
        let mut args = web_request.into_args();
        let requested = match args.get("objects") {
            Some(objects) => Subscriptions::parse_objects(objects)?,
            None => ObjectSubscription::new(),
        };
        let union = self.subscriptions.begin_subscribe(conn.uid(), &requested);
        args.insert("objects".into(), subscription_to_value(&union));
        args.insert(
            "response_template".into(),
            serde_json::json!({"method": "process_status_update"}),
        );
        let mut result = self
            .request_standard("objects/subscribe", args, Some(SUBSCRIPTION_TIMEOUT))
            .await?;
        let Some(result_obj) = result.as_object_mut() else {
            return Err(ServerError::internal("Malformed subscription response"));
        };
        let all_status = result_obj
            .get("status")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let eventtime = result_obj
            .get("eventtime")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let diff = self.subscriptions.apply_snapshot(&all_status);
        if !diff.is_empty() {
            // Existing subscribers would otherwise miss changes that
            // landed during this call.
            debug!(diff = %serde_json::Value::Object(diff.clone()), "status difference during subscription");
            self.process_status_update(eventtime, diff);
        }
        result_obj.insert(
            "status".into(),
            Value::Object(project_status(&all_status, &requested)),
        );
        if !requested.is_empty() {
            self.subscriptions.install(conn, requested);
        }
        Ok(result)
    }

    /// Issue one correlated request to the backend.
    pub async fn request_standard(
        &self,
        method: &str,
        params: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);
        let envelope = serde_json::json!({
            "id": id,
            "method": method,
            "params": Value::Object(params),
        });
        let payload = encode_frame(serde_json::to_vec(&envelope)?);
        let sent = {
            let writer = self.writer_tx.lock().unwrap();
            match writer.as_ref() {
                Some(tx) => tx.send(payload).is_ok(),
                None => false,
            }
        };
        if !sent {
            self.pending.lock().unwrap().remove(&id);
            return Err(ServerError::backend_unavailable("Klippy Host not connected"));
        }
        let response = match timeout {
            Some(duration) => match tokio::time::timeout(duration, rx).await {
                Ok(response) => response,
                Err(_) => {
                    // A late response is logged and dropped by the
                    // reader.
                    self.pending.lock().unwrap().remove(&id);
                    return Err(ServerError::with_kind(
                        ErrorKind::Timeout,
                        "Klippy request timed out",
                    ));
                }
            },
            None => rx.await,
        };
        match response {
            Ok(result) => result,
            Err(_) => Err(ServerError::backend_unavailable("Klippy Disconnected")),
        }
    }

    pub fn remove_subscription(&self, uid: u64) {
        self.subscriptions.remove(uid);
    }

    /// Run the connection state machine until [`close`] is called.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.closing.load(Ordering::Relaxed) {
                break;
            }
            tokio::time::sleep(INIT_TIME).await;
            if !self.socket_accessible() {
                continue;
            }
            let stream = match UnixStream::connect(&self.uds_path).await {
                Ok(stream) => stream,
                Err(_) => continue,
            };
            info!("klippy connection established");
            self.capture_peer_credentials(&stream);
            let (read_half, write_half) = stream.into_split();
            let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
            *self.writer_tx.lock().unwrap() = Some(tx);
            self.set_state(KlippyState::Connecting);

            let writer_task = tokio::spawn(write_loop(write_half, rx));
            let init_task = tokio::spawn(self.clone().initialize());
            tokio::select! {
                _ = self.read_loop(read_half) => {}
                _ = self.shutdown.notified() => {}
            }
            init_task.abort();
            writer_task.abort();
            self.on_disconnect();
        }
    }

    pub async fn close(&self) {
        self.closing.store(true, Ordering::Relaxed);
        self.shutdown.notify_waiters();
    }

    fn socket_accessible(&self) -> bool {
        if !self.uds_path.exists() {
            return false;
        }
        #[cfg(unix)]
        {
            use std::ffi::CString;
            use std::os::unix::ffi::OsStrExt;
            let Ok(path) = CString::new(self.uds_path.as_os_str().as_bytes()) else {
                return false;
            };
            let accessible =
                unsafe { libc::access(path.as_ptr(), libc::R_OK | libc::W_OK) } == 0;
            if !accessible {
                if self.log_no_access.swap(false, Ordering::Relaxed) {
                    info!(
                        path = %self.uds_path.display(),
                        "cannot connect to klippy, no permission to open unix socket"
                    );
                }
                return false;
            }
            self.log_no_access.store(true, Ordering::Relaxed);
        }
        true
    }

    fn capture_peer_credentials(&self, stream: &UnixStream) {
        #[cfg(target_os = "linux")]
        {
            use std::os::fd::AsRawFd;
            if let Some(creds) = crate::unix::unix_peer_credentials(stream.as_raw_fd()) {
                if creds.process_id == 1 {
                    debug!("klipper unix socket created via systemd socket activation");
                    return;
                }
                debug!(?creds, "received klippy peer credentials");
                *self.peer_cred.lock().unwrap() = Some(creds);
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = stream;
    }

    async fn initialize(self: Arc<Self>) {
        self.identified.store(false, Ordering::Relaxed);
        self.methods_registered.store(false, Ordering::Relaxed);
        self.initializing.store(true, Ordering::Relaxed);
        self.set_state(KlippyState::Startup);
        let mut init_attempts: u64 = 0;
        loop {
            tokio::time::sleep(INIT_TIME).await;
            if self.closing.load(Ordering::Relaxed) || !self.is_connected() {
                self.initializing.store(false, Ordering::Relaxed);
                return;
            }
            self.check_ready(init_attempts).await;
            if !self.initializing.load(Ordering::Relaxed) {
                debug!("klippy connection initialized");
                return;
            }
            init_attempts += 1;
        }
    }

    async fn check_ready(self: &Arc<Self>, init_attempts: u64) {
        let send_id = !self.identified.load(Ordering::Relaxed);
        let mut params = Map::new();
        if send_id {
            params.insert(
                "client_info".into(),
                serde_json::json!({
                    "program": "gantry",
                    "version": env!("CARGO_PKG_VERSION"),
                }),
            );
        }
        let result = match self.request_standard("info", params, None).await {
            Ok(result) => result,
            Err(error) => {
                if init_attempts % LOG_ATTEMPT_INTERVAL == 0 && init_attempts <= MAX_LOG_ATTEMPTS {
                    info!(
                        %error,
                        "klippy info request error, check klippy.log for details"
                    );
                }
                return;
            }
        };
        let Some(info) = result.as_object() else {
            return;
        };
        if let Some(version) = info.get("software_version").and_then(Value::as_str) {
            let mut stored = self.klipper_version.lock().unwrap();
            if version != stored.as_str() {
                info!(version, "klipper version");
                *stored = version.to_string();
            }
        }
        // The backend's own report of its process credentials
        // supersedes the kernel-captured socket credentials.
        if let Some(process_id) = info.get("process_id").and_then(Value::as_i64) {
            let current = self.peer_cred.lock().unwrap().map(|c| c.process_id);
            if current != Some(process_id) {
                *self.peer_cred.lock().unwrap() = Some(PeerCreds {
                    process_id,
                    user_id: info.get("user_id").and_then(Value::as_i64).unwrap_or(-1),
                    group_id: info.get("group_id").and_then(Value::as_i64).unwrap_or(-1),
                });
            }
        }
        *self.klippy_info.lock().unwrap() = info.clone();
        if let Some(message) = info.get("state_message").and_then(Value::as_str) {
            self.set_state_message(message.to_string());
        }
        let Some(state) = info.get("state").and_then(Value::as_str) else {
            return;
        };
        if send_id {
            self.identified.store(true, Ordering::Relaxed);
            self.save_path_info().await;
            // Early registration picks up the info and emergency stop
            // endpoints before startup completes.
            self.request_endpoints().await;
        }
        let reported = KlippyState::from_report(state);
        self.set_state(reported);
        if reported != KlippyState::Startup {
            self.request_initial_subscriptions().await;
            self.request_endpoints().await;
            if reported == KlippyState::Ready {
                let methods: Vec<String> = self.reg_methods.lock().unwrap().clone();
                for method in methods {
                    if let Err(error) = self.announce_method(&method).await {
                        warn!(method = method.as_str(), %error, "unable to register method");
                    }
                }
                self.methods_registered.store(true, Ordering::Relaxed);
                info!("klippy ready");
                self.notify_clients("notify_klippy_ready");
                if let Some(server) = self.server.upgrade() {
                    if let Some(mqtt) = server.mqtt() {
                        mqtt.spawn_status_subscription();
                    }
                }
            } else {
                info!(state = reported.name(), message = %self.state_message(), "klippy startup incomplete");
                if reported == KlippyState::Shutdown {
                    self.notify_clients("notify_klippy_shutdown");
                }
            }
            self.initializing.store(false, Ordering::Relaxed);
        }
    }

    async fn save_path_info(&self) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let info = self.klippy_info();
        for (field, key) in [("klipper_path", SRC_PATH_KEY), ("python_path", PY_EXEC_KEY)] {
            if let Some(path) = info.get(field).and_then(Value::as_str) {
                if let Err(error) = server
                    .database
                    .insert_item("moonraker", key, Value::String(path.to_string()))
                    .await
                {
                    warn!(%error, field, "failed to store klippy path info");
                }
            }
        }
    }

    /// Import the backend's endpoint list, registering each one (minus
    /// reserved endpoints) as a remote definition.
    async fn request_endpoints(self: &Arc<Self>) {
        let result = match self.request_standard("list_endpoints", Map::new(), None).await {
            Ok(result) => result,
            Err(_) => return,
        };
        let Some(endpoints) = result.get("endpoints").and_then(Value::as_array) else {
            return;
        };
        let Some(server) = self.server.upgrade() else {
            return;
        };
        for endpoint in endpoints.iter().filter_map(Value::as_str) {
            if RESERVED_ENDPOINTS.contains(&endpoint) {
                continue;
            }
            if let Err(error) = server.register_remote_endpoint(endpoint) {
                warn!(endpoint, %error, "failed to register remote endpoint");
            }
        }
    }

    async fn request_initial_subscriptions(self: &Arc<Self>) {
        if let Some(server) = self.server.upgrade() {
            let mut args = Map::new();
            args.insert("objects".into(), serde_json::json!({"webhooks": null}));
            let request = WebRequest::new(
                "objects/subscribe",
                args,
                RequestType::POST,
                Some(server.internal_transport.clone() as Arc<dyn ApiTransport>),
                None,
                None,
            );
            match self.request(request).await {
                Ok(_) => info!("webhooks subscribed"),
                Err(error) => warn!(%error, "unable to subscribe to webhooks object"),
            }
        }
        let mut params = Map::new();
        params.insert(
            "response_template".into(),
            serde_json::json!({"method": "process_gcode_response"}),
        );
        match self
            .request_standard("gcode/subscribe_output", params, None)
            .await
        {
            Ok(_) => info!("gcode output subscribed"),
            Err(error) => warn!(%error, "unable to register gcode output subscription"),
        }
    }

    async fn read_loop(&self, mut read_half: tokio::net::unix::OwnedReadHalf) {
        let mut codec = FrameCodec::new(DEFAULT_MAX_FRAME_BYTES);
        let mut buf = [0u8; 8192];
        loop {
            let read = match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(read) => read,
            };
            codec.push(&buf[..read]);
            loop {
                match codec.next_frame() {
                    Ok(Some(frame)) => match serde_json::from_slice::<Value>(&frame) {
                        Ok(command) => self.process_command(command),
                        Err(error) => {
                            error!(%error, "error processing klippy response");
                        }
                    },
                    Ok(None) => break,
                    Err(error) => {
                        error!(%error, "klippy stream framing error");
                        return;
                    }
                }
            }
        }
    }

    fn process_command(&self, command: Value) {
        let Some(envelope) = command.as_object() else {
            error!("klippy sent a non-object message");
            return;
        };
        if let Some(method) = envelope.get("method").and_then(Value::as_str) {
            let params = envelope
                .get("params")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            self.execute_remote_method(method, params);
            return;
        }
        let request_id = envelope.get("id").and_then(Value::as_u64);
        let sender = request_id.and_then(|id| self.pending.lock().unwrap().remove(&id));
        let Some(sender) = sender else {
            info!(?request_id, "no request matching klippy response id");
            return;
        };
        if let Some(result) = envelope.get("result") {
            // An empty result still acknowledges the request.
            let result = if result.is_null() || result == &serde_json::json!({}) {
                Value::String("ok".into())
            } else {
                result.clone()
            };
            let _ = sender.send(Ok(result));
        } else {
            let message = match envelope.get("error") {
                Some(Value::String(message)) => message.clone(),
                Some(Value::Object(error)) => error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Malformed Klippy Response")
                    .to_string(),
                _ => "Malformed Klippy Response".to_string(),
            };
            let _ = sender.send(Err(ServerError::new(message, 400)));
        }
    }

    fn execute_remote_method(&self, method: &str, params: Map<String, Value>) {
        match method {
            "process_status_update" => {
                let eventtime = params
                    .get("eventtime")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                let status = params
                    .get("status")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                self.process_status_update(eventtime, status);
            }
            "process_gcode_response" => {
                if let Some(response) = params.get("response").and_then(Value::as_str) {
                    self.notify_clients_with(
                        "notify_gcode_response",
                        serde_json::json!([response]),
                    );
                }
            }
            _ => {
                let handler = {
                    let methods = self.remote_methods.lock().unwrap();
                    match methods.get(method) {
                        Some(RemoteMethod::Local(callback)) => Some(Ok(callback.clone())),
                        Some(RemoteMethod::Agent { conn }) => Some(Err(conn.clone())),
                        None => None,
                    }
                };
                match handler {
                    Some(Ok(callback)) => callback(params),
                    Some(Err(conn)) => {
                        if let Some(conn) = conn.upgrade() {
                            conn.call_method(method, Some(Value::Object(params)));
                        }
                    }
                    None => info!(method, "unknown method received from klippy"),
                }
            }
        }
    }

    /// Fold a pushed status update into the cache, track webhook state
    /// transitions, and fan the update out to subscribers.
    pub fn process_status_update(&self, eventtime: f64, status: Map<String, Value>) {
        self.subscriptions.update_cache(&status);
        if let Some(webhooks) = status.get("webhooks").and_then(Value::as_object) {
            if let Some(message) = webhooks.get("state_message").and_then(Value::as_str) {
                self.set_state_message(message.to_string());
            }
            if let Some(state) = webhooks.get("state").and_then(Value::as_str) {
                let new_state = KlippyState::from_report(state);
                if new_state == KlippyState::Shutdown
                    && !self.initializing.load(Ordering::Relaxed)
                    && self.state() != KlippyState::Shutdown
                {
                    info!("klippy has shutdown");
                    self.notify_clients("notify_klippy_shutdown");
                }
                self.set_state(new_state);
            }
        }
        self.subscriptions.fan_out(&status, eventtime);
    }

    fn on_disconnect(&self) {
        *self.writer_tx.lock().unwrap() = None;
        self.identified.store(false, Ordering::Relaxed);
        self.initializing.store(false, Ordering::Relaxed);
        self.methods_registered.store(false, Ordering::Relaxed);
        {
            let mut state = self.state.lock().unwrap();
            *state = (KlippyState::Disconnected, "Klippy Disconnected".into());
        }
        let drained: Vec<oneshot::Sender<Result<Value>>> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(ServerError::backend_unavailable("Klippy Disconnected")));
        }
        self.subscriptions.clear();
        *self.peer_cred.lock().unwrap() = None;
        info!("klippy connection removed");
        self.notify_clients("notify_klippy_disconnected");
    }

    fn notify_clients(&self, name: &str) {
        self.notify_clients_with(name, serde_json::json!([]));
    }

    fn notify_clients_with(&self, name: &str, params: Value) {
        if let Some(server) = self.server.upgrade() {
            server.connections.notify_clients(name, params);
        }
    }
}

fn subscription_to_value(objects: &ObjectSubscription) -> Value {
    let mut map = Map::new();
    for (name, fields) in objects {
        let value = match fields {
            None => Value::Null,
            Some(fields) => serde_json::json!(fields),
        };
        map.insert(name.clone(), value);
    }
    Value::Object(map)
}

async fn write_loop(
    mut write_half: tokio::net::unix::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = rx.recv().await {
        if write_half.write_all(&frame).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    struct FakeKlippy {
        stream: UnixStream,
        codec: FrameCodec,
    }

    impl FakeKlippy {
        async fn accept(listener: &UnixListener) -> Self {
            let (stream, _) = listener.accept().await.unwrap();
            Self {
                stream,
                codec: FrameCodec::new(DEFAULT_MAX_FRAME_BYTES),
            }
        }

        async fn read_request(&mut self) -> Value {
            let mut buf = [0u8; 4096];
            loop {
                if let Some(frame) = self.codec.next_frame().unwrap() {
                    return serde_json::from_slice(&frame).unwrap();
                }
                let read = self.stream.read(&mut buf).await.unwrap();
                assert!(read > 0, "klippy connection closed unexpectedly");
                self.codec.push(&buf[..read]);
            }
        }

        async fn send(&mut self, value: Value) {
            let frame = encode_frame(serde_json::to_vec(&value).unwrap());
            self.stream.write_all(&frame).await.unwrap();
        }
    }

    fn spawn_connection(path: PathBuf) -> Arc<KlippyConnection> {
        let klippy = KlippyConnection::new(Weak::new(), path);
        tokio::spawn(klippy.clone().run());
        klippy
    }

    #[tokio::test]
    async fn responses_match_requests_by_id_not_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("klippy.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let klippy = spawn_connection(path);
        let mut fake = FakeKlippy::accept(&listener).await;

        // The init task starts the info cadence; park its request.
        let info_req = fake.read_request().await;
        assert_eq!(info_req["method"], serde_json::json!("info"));

        let first = {
            let klippy = klippy.clone();
            tokio::spawn(async move {
                klippy
                    .request_standard("objects/list", Map::new(), None)
                    .await
            })
        };
        let first_req = fake.read_request().await;
        let second = {
            let klippy = klippy.clone();
            tokio::spawn(async move {
                klippy
                    .request_standard("gcode/script", Map::new(), None)
                    .await
            })
        };
        let second_req = fake.read_request().await;

        // Answer in reverse order; correlation is by id.
        fake.send(serde_json::json!({
            "id": second_req["id"], "result": {"res": "second"},
        }))
        .await;
        fake.send(serde_json::json!({
            "id": first_req["id"], "result": {"res": "first"},
        }))
        .await;

        assert_eq!(
            first.await.unwrap().unwrap(),
            serde_json::json!({"res": "first"})
        );
        assert_eq!(
            second.await.unwrap().unwrap(),
            serde_json::json!({"res": "second"})
        );
        klippy.close().await;
    }

    #[tokio::test]
    async fn disconnect_drains_pending_requests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("klippy.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let klippy = spawn_connection(path);
        let mut fake = FakeKlippy::accept(&listener).await;
        fake.read_request().await; // info

        let pending = {
            let klippy = klippy.clone();
            tokio::spawn(async move {
                klippy
                    .request_standard("objects/query", Map::new(), None)
                    .await
            })
        };
        fake.read_request().await;
        assert!(klippy.pending_count() >= 1);

        drop(fake);
        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::BackendUnavailable);
        assert_eq!(klippy.pending_count(), 0);
        assert_eq!(klippy.state(), KlippyState::Disconnected);
        klippy.close().await;
    }

    #[tokio::test]
    async fn timeout_removes_pending_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("klippy.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let klippy = spawn_connection(path);
        let mut fake = FakeKlippy::accept(&listener).await;
        fake.read_request().await; // info

        let err = klippy
            .request_standard(
                "objects/query",
                Map::new(),
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::Timeout);
        assert_eq!(klippy.pending_count(), 0);
        klippy.close().await;
    }

    #[tokio::test]
    async fn error_responses_surface_backend_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("klippy.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let klippy = spawn_connection(path);
        let mut fake = FakeKlippy::accept(&listener).await;
        fake.read_request().await; // info

        let request = {
            let klippy = klippy.clone();
            tokio::spawn(async move {
                klippy
                    .request_standard("gcode/script", Map::new(), None)
                    .await
            })
        };
        let req = fake.read_request().await;
        fake.send(serde_json::json!({
            "id": req["id"],
            "error": {"message": "Must home axis first"},
        }))
        .await;
        let err = request.await.unwrap().unwrap_err();
        assert_eq!(err.message(), "Must home axis first");
        assert_eq!(err.status_code(), 400);
        klippy.close().await;
    }

    #[tokio::test]
    async fn empty_results_become_ok() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("klippy.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let klippy = spawn_connection(path);
        let mut fake = FakeKlippy::accept(&listener).await;
        fake.read_request().await; // info

        let request = {
            let klippy = klippy.clone();
            tokio::spawn(async move {
                klippy
                    .request_standard("gcode/script", Map::new(), None)
                    .await
            })
        };
        let req = fake.read_request().await;
        fake.send(serde_json::json!({"id": req["id"], "result": {}}))
            .await;
        assert_eq!(
            request.await.unwrap().unwrap(),
            serde_json::json!("ok")
        );
        klippy.close().await;
    }
}
