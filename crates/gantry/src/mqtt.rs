//! MQTT transport.
//!
//! A single process-wide client carries JSON-RPC over a topic pair,
//! announces gateway availability on a retained status topic (with an
//! offline last-will), and optionally maintains a gateway-owned
//! subscription that republishes printer status to the broker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;
use crate::error::{ErrorKind, Result, ServerError};
use crate::klippy::subscriptions::ObjectSubscription;
use crate::registry::{ApiDefinition, EndpointSpec, RequestType, TransportSet, TransportType};
use crate::request::WebRequest;
use crate::server::{Server, handler};
use crate::transport::{ApiTransport, next_uid};

/// Entries kept in the duplicate-suppression deque.
const TIMESTAMP_WINDOW: usize = 20;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub struct MqttClient {
    uid: u64,
    server: Weak<Server>,
    client: AsyncClient,
    instance_name: String,
    qos: QoS,
    api_qos: QoS,
    enable_api: bool,
    status_objects: ObjectSubscription,
    publish_split_status: bool,
    api_request_topic: String,
    api_response_topic: String,
    klipper_status_topic: String,
    klipper_state_prefix: String,
    status_topic: String,
    connected: AtomicBool,
    closing: AtomicBool,
    timestamps: Mutex<VecDeque<Value>>,
    topic_waiters: Mutex<HashMap<String, Vec<oneshot::Sender<Vec<u8>>>>>,
}

fn qos_from(level: u8) -> QoS {
    match level {
        2 => QoS::ExactlyOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::AtMostOnce,
    }
}

fn hostname() -> Option<String> {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if ret == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            return String::from_utf8(buf[..end].to_vec()).ok();
        }
    }
    None
}

impl MqttClient {
    pub fn new(server: Weak<Server>, config: &MqttConfig) -> (Arc<Self>, EventLoop) {
        let instance_name = config
            .instance_name
            .clone()
            .or_else(hostname)
            .unwrap_or_else(|| "gantry".into());
        let qos = qos_from(config.default_qos);
        let api_qos = qos_from(config.api_qos.unwrap_or(config.default_qos));
        let status_topic = format!("{instance_name}/moonraker/status");

        let mut options = MqttOptions::new(
            format!("gantry-{instance_name}"),
            config.address.clone(),
            config.port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        options.set_last_will(LastWill::new(
            status_topic.clone(),
            serde_json::json!({"server": "offline"}).to_string(),
            qos,
            true,
        ));
        let (client, eventloop) = AsyncClient::new(options, 64);
        let mqtt = Arc::new(Self {
            uid: next_uid(),
            server,
            client,
            api_request_topic: format!("{instance_name}/moonraker/api/request"),
            api_response_topic: format!("{instance_name}/moonraker/api/response"),
            klipper_status_topic: format!("{instance_name}/klipper/status"),
            klipper_state_prefix: format!("{instance_name}/klipper/state"),
            status_topic,
            instance_name,
            qos,
            api_qos,
            enable_api: config.enable_moonraker_api,
            status_objects: config.parsed_status_objects(),
            publish_split_status: config.publish_split_status,
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            timestamps: Mutex::new(VecDeque::with_capacity(TIMESTAMP_WINDOW)),
            topic_waiters: Mutex::new(HashMap::new()),
        });
        info!(
            api_request = mqtt.api_request_topic.as_str(),
            api_response = mqtt.api_response_topic.as_str(),
            status = mqtt.status_topic.as_str(),
            "reserved mqtt topics"
        );
        (mqtt, eventloop)
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Drive the broker connection until [`close`]. Reconnects with a
    /// fixed delay and deduplicated error logging.
    pub fn start(self: &Arc<Self>, mut eventloop: EventLoop) -> tokio::task::JoinHandle<()> {
        let mqtt = self.clone();
        tokio::spawn(async move {
            let mut last_error = String::new();
            loop {
                if mqtt.closing.load(Ordering::Relaxed) {
                    break;
                }
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        last_error.clear();
                        mqtt.on_connect().await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        mqtt.on_message(publish.topic, publish.payload.to_vec());
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        mqtt.connected.store(false, Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(error) => {
                        mqtt.connected.store(false, Ordering::Relaxed);
                        let message = error.to_string();
                        if message != last_error {
                            warn!(error = message.as_str(), "mqtt connection error");
                            last_error = message;
                        }
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        })
    }

    async fn on_connect(self: &Arc<Self>) {
        info!("mqtt client connected");
        self.connected.store(true, Ordering::Relaxed);
        let _ = self
            .client
            .publish(
                &self.status_topic,
                self.qos,
                true,
                serde_json::json!({"server": "online"}).to_string(),
            )
            .await;
        if self.enable_api {
            if let Err(error) = self
                .client
                .subscribe(&self.api_request_topic, self.api_qos)
                .await
            {
                warn!(%error, "failed to subscribe to api request topic");
            }
        }
        let waiting: Vec<String> = self.topic_waiters.lock().unwrap().keys().cloned().collect();
        for topic in waiting {
            let _ = self.client.subscribe(topic, self.qos).await;
        }
        if let Some(server) = self.server.upgrade() {
            if !self.status_objects.is_empty() && server.klippy.state().startup_complete() {
                self.spawn_status_subscription();
            }
        }
    }

    fn on_message(self: &Arc<Self>, topic: String, payload: Vec<u8>) {
        let waiters = {
            let mut table = self.topic_waiters.lock().unwrap();
            table.remove(&topic)
        };
        if let Some(waiters) = waiters {
            for waiter in waiters {
                let _ = waiter.send(payload.clone());
            }
        }
        if topic == self.api_request_topic {
            let mqtt = self.clone();
            tokio::spawn(async move {
                mqtt.process_api_request(payload).await;
            });
        } else {
            debug!(topic = topic.as_str(), "unregistered mqtt topic received");
        }
    }

    async fn process_api_request(self: Arc<Self>, payload: Vec<u8>) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let transport: Arc<dyn ApiTransport> = self.clone();
        if let Some(response) = server.rpc.dispatch(&payload, transport).await {
            if let Err(error) = self
                .client
                .publish(&self.api_response_topic, self.api_qos, false, response)
                .await
            {
                warn!(%error, "failed to publish api response");
            }
        }
    }

    /// Subscribe the gateway's own status descriptor; results are
    /// republished to the broker through `send_status`.
    pub fn spawn_status_subscription(self: &Arc<Self>) {
        if self.status_objects.is_empty() {
            return;
        }
        let mqtt = self.clone();
        tokio::spawn(async move {
            let Some(server) = mqtt.server.upgrade() else {
                return;
            };
            let mut objects = Map::new();
            for (name, fields) in &mqtt.status_objects {
                let value = match fields {
                    None => Value::Null,
                    Some(fields) => serde_json::json!(fields),
                };
                objects.insert(name.clone(), value);
            }
            let mut args = Map::new();
            args.insert("objects".into(), Value::Object(objects));
            let transport: Arc<dyn ApiTransport> = mqtt.clone();
            let request = WebRequest::new(
                "objects/subscribe",
                args,
                RequestType::POST,
                Some(transport),
                None,
                None,
            );
            if let Err(error) = server.klippy.request(request).await {
                warn!(%error, "mqtt status subscription failed");
            }
        });
    }

    fn check_timestamp(&self, args: &mut Map<String, Value>) -> Result<()> {
        let Some(timestamp) = args.remove("mqtt_timestamp") else {
            return Ok(());
        };
        let mut seen = self.timestamps.lock().unwrap();
        if seen.contains(&timestamp) {
            debug!("duplicate mqtt api request received");
            return Err(ServerError::with_kind(
                ErrorKind::DuplicateRequest,
                "Duplicate MQTT Request",
            ));
        }
        if seen.len() >= TIMESTAMP_WINDOW {
            seen.pop_front();
        }
        seen.push_back(timestamp);
        Ok(())
    }

    pub async fn publish_topic(
        &self,
        topic: &str,
        payload: Option<Value>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        let encoded = match payload {
            None => Vec::new(),
            Some(Value::String(text)) => text.into_bytes(),
            Some(value) => serde_json::to_vec(&value)?,
        };
        self.client
            .publish(topic, qos, retain, encoded)
            .await
            .map_err(|e| ServerError::new(format!("MQTT Publish Error: {e}"), 503))
    }

    async fn handle_publish_request(&self, request: WebRequest) -> Result<Value> {
        let topic = request.get_str("topic")?;
        let payload = request.get("payload").cloned();
        let qos = qos_arg(&request, self.qos)?;
        let retain = request.get_bool_or("retain", false)?;
        let timeout = request.get_f64_opt("timeout")?;
        let publish = self.publish_topic(&topic, payload, qos, retain);
        match timeout {
            Some(seconds) => tokio::time::timeout(Duration::from_secs_f64(seconds), publish)
                .await
                .map_err(|_| ServerError::new("MQTT Publish Timed Out", 504))??,
            None => publish.await?,
        }
        Ok(serde_json::json!({"topic": topic}))
    }

    async fn handle_subscription_request(&self, request: WebRequest) -> Result<Value> {
        let topic = request.get_str("topic")?;
        if topic.contains('+') || topic.contains('#') {
            return Err(ServerError::invalid_params(
                "Wildcards may not be used in subscription requests",
            ));
        }
        let qos = qos_arg(&request, self.qos)?;
        let timeout = request.get_f64_opt("timeout")?;
        let (tx, rx) = oneshot::channel();
        self.topic_waiters
            .lock()
            .unwrap()
            .entry(topic.clone())
            .or_default()
            .push(tx);
        self.client
            .subscribe(topic.clone(), qos)
            .await
            .map_err(|e| ServerError::new(format!("MQTT Subscribe Error: {e}"), 503))?;
        let payload = match timeout {
            Some(seconds) => {
                match tokio::time::timeout(Duration::from_secs_f64(seconds), rx).await {
                    Ok(result) => result,
                    Err(_) => {
                        self.topic_waiters.lock().unwrap().remove(&topic);
                        let _ = self.client.unsubscribe(topic.clone()).await;
                        return Err(ServerError::new("MQTT Subscribe Timed Out", 504));
                    }
                }
            }
            None => rx.await,
        }
        .map_err(|_| ServerError::new("MQTT client closed", 503))?;
        let _ = self.client.unsubscribe(topic.clone()).await;
        let payload = match serde_json::from_slice::<Value>(&payload) {
            Ok(value) => value,
            Err(_) => Value::String(String::from_utf8_lossy(&payload).into_owned()),
        };
        Ok(serde_json::json!({"topic": topic, "payload": payload}))
    }

    pub async fn close(&self) {
        self.closing.store(true, Ordering::Relaxed);
        if self.is_connected() {
            let _ = self
                .publish_topic(
                    &self.status_topic.clone(),
                    Some(serde_json::json!({"server": "offline"})),
                    self.qos,
                    true,
                )
                .await;
        }
        let _ = self.client.disconnect().await;
    }
}

fn qos_arg(request: &WebRequest, default: QoS) -> Result<QoS> {
    match request.get_i64_or("qos", -1)? {
        -1 => Ok(default),
        level @ 0..=2 => Ok(qos_from(level as u8)),
        _ => Err(ServerError::invalid_params("QOS must be between 0 and 2")),
    }
}

impl ApiTransport for MqttClient {
    fn uid(&self) -> u64 {
        self.uid
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Mqtt
    }

    fn screen_rpc_request(
        &self,
        _api_def: &ApiDefinition,
        args: &mut Map<String, Value>,
    ) -> Result<()> {
        self.check_timestamp(args)
    }

    fn send_status(&self, status: Map<String, Value>, eventtime: f64) {
        if status.is_empty() || !self.is_connected() {
            return;
        }
        if self.publish_split_status {
            for (object, fields) in &status {
                let Some(fields) = fields.as_object() else {
                    continue;
                };
                for (field, value) in fields {
                    let topic = format!("{}/{object}/{field}", self.klipper_state_prefix);
                    let payload = serde_json::json!({"eventtime": eventtime, "value": value});
                    let _ = self.client.try_publish(
                        topic,
                        self.qos,
                        true,
                        payload.to_string(),
                    );
                }
            }
        } else {
            let payload = serde_json::json!({"eventtime": eventtime, "status": status});
            let _ = self.client.try_publish(
                &self.klipper_status_topic,
                self.qos,
                false,
                payload.to_string(),
            );
        }
    }
}

/// Register the MQTT endpoints and the backend-invokable publish
/// method. Called during initialization when an `[mqtt]` section is
/// configured.
pub fn register_endpoints(server: &Arc<Server>) -> Result<()> {
    server.registry.register(
        EndpointSpec::new("/server/mqtt/publish", RequestType::POST)
            .transports(TransportSet::HTTP | TransportSet::WEBSOCKET | TransportSet::INTERNAL),
        handler(server, |server, request| async move {
            let mqtt = server
                .mqtt()
                .ok_or_else(|| ServerError::internal("mqtt not configured"))?;
            mqtt.handle_publish_request(request).await
        }),
    )?;
    server.registry.register(
        EndpointSpec::new("/server/mqtt/subscribe", RequestType::POST)
            .transports(TransportSet::HTTP | TransportSet::WEBSOCKET | TransportSet::INTERNAL),
        handler(server, |server, request| async move {
            let mqtt = server
                .mqtt()
                .ok_or_else(|| ServerError::internal("mqtt not configured"))?;
            mqtt.handle_subscription_request(request).await
        }),
    )?;
    // Lets the backend publish arbitrary topics through the gateway.
    let weak = Arc::downgrade(server);
    server.klippy.register_remote_method(
        "publish_mqtt_topic",
        Arc::new(move |params: Map<String, Value>| {
            let Some(server) = weak.upgrade() else {
                return;
            };
            let Some(mqtt) = server.mqtt() else {
                return;
            };
            tokio::spawn(async move {
                let Some(topic) = params.get("topic").and_then(Value::as_str) else {
                    warn!("publish_mqtt_topic called without a topic");
                    return;
                };
                let use_prefix = params
                    .get("use_prefix")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let topic = if use_prefix {
                    format!("{}/{}", mqtt.instance_name(), topic.trim_start_matches('/'))
                } else {
                    topic.to_string()
                };
                let qos = params
                    .get("qos")
                    .and_then(Value::as_i64)
                    .map(|level| qos_from(level.clamp(0, 2) as u8))
                    .unwrap_or(mqtt.qos);
                let retain = params
                    .get("retain")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let payload = params.get("payload").cloned();
                if let Err(error) = mqtt.publish_topic(&topic, payload, qos, retain).await {
                    warn!(%error, topic = topic.as_str(), "failed to publish topic for klippy");
                }
            });
        }),
    )?;
    Ok(())
}
