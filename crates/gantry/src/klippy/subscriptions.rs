//! Per-client field subscriptions over backend objects.
//!
//! Each transport handle owns a descriptor mapping object names to an
//! optional field allow-list (`None` means every field). The upstream
//! subscription sent to the backend is always the union across every
//! descriptor, and a status cache supports diffing so late subscribers
//! observe changes that landed during their subscribe call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Result, ServerError};
use crate::transport::ApiTransport;

/// Fields excessively large and effectively immutable; kept out of the
/// cache while still returned to subscribe callers.
const CACHE_EXCLUSIONS: &[(&str, &[&str])] = &[("configfile", &["config", "settings"])];

/// Object name to optional field allow-list. `None` dominates a union.
pub type ObjectSubscription = HashMap<String, Option<Vec<String>>>;

struct SubscriptionEntry {
    transport: Arc<dyn ApiTransport>,
    objects: ObjectSubscription,
}

#[derive(Default)]
pub struct Subscriptions {
    /// Serializes the subscribe operation, which holds its descriptor
    /// snapshot across the single backend round-trip.
    pub(crate) subscribe_lock: tokio::sync::Mutex<()>,
    table: Mutex<HashMap<u64, SubscriptionEntry>>,
    cache: Mutex<HashMap<String, Map<String, Value>>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the `objects` argument of a subscribe request.
    pub fn parse_objects(value: &Value) -> Result<ObjectSubscription> {
        let Value::Object(map) = value else {
            return Err(ServerError::invalid_params(
                "Argument 'objects' must be an object",
            ));
        };
        let mut parsed = ObjectSubscription::new();
        for (name, fields) in map {
            let fields = match fields {
                Value::Null => None,
                Value::Array(items) => {
                    let mut list = Vec::with_capacity(items.len());
                    for item in items {
                        match item.as_str() {
                            Some(field) => list.push(field.to_string()),
                            None => {
                                return Err(ServerError::invalid_params(format!(
                                    "Invalid field list for object '{name}'"
                                )));
                            }
                        }
                    }
                    Some(list)
                }
                _ => {
                    return Err(ServerError::invalid_params(format!(
                        "Invalid field list for object '{name}'"
                    )));
                }
            };
            parsed.insert(name.clone(), fields);
        }
        Ok(parsed)
    }

    /// Drop the prior descriptor for a handle and compute the union of
    /// the request with every remaining descriptor.
    pub fn begin_subscribe(&self, uid: u64, requested: &ObjectSubscription) -> ObjectSubscription {
        let mut table = self.table.lock().unwrap();
        table.remove(&uid);
        let mut union: ObjectSubscription = requested.clone();
        for entry in table.values() {
            for (name, fields) in &entry.objects {
                match union.get_mut(name) {
                    None => {
                        union.insert(name.clone(), fields.clone());
                    }
                    Some(existing) => {
                        *existing = match (existing.take(), fields) {
                            (None, _) | (_, None) => None,
                            (Some(mut merged), Some(additional)) => {
                                for field in additional {
                                    if !merged.contains(field) {
                                        merged.push(field.clone());
                                    }
                                }
                                Some(merged)
                            }
                        };
                    }
                }
            }
        }
        union
    }

    pub fn install(&self, transport: Arc<dyn ApiTransport>, objects: ObjectSubscription) {
        let uid = transport.uid();
        self.table
            .lock()
            .unwrap()
            .insert(uid, SubscriptionEntry { transport, objects });
    }

    pub fn remove(&self, uid: u64) {
        self.table.lock().unwrap().remove(&uid);
    }

    pub fn subscriber_count(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    pub fn cached_status(&self) -> HashMap<String, Map<String, Value>> {
        self.cache.lock().unwrap().clone()
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    pub fn clear(&self) {
        self.table.lock().unwrap().clear();
        self.clear_cache();
    }

    /// Fold a subscribe-response snapshot into the cache. Returns the
    /// per-object diff of fields whose cached value changed, for the
    /// manual push to existing subscribers.
    pub fn apply_snapshot(&self, all_status: &Map<String, Value>) -> Map<String, Value> {
        let mut cache = self.cache.lock().unwrap();
        let mut diff = Map::new();
        for (object, fields) in all_status {
            let Some(fields) = fields.as_object() else {
                continue;
            };
            if let Some(cached) = cache.get(object) {
                let mut object_diff = Map::new();
                for (field, value) in fields {
                    if let Some(prior) = cached.get(field) {
                        if prior != value {
                            object_diff.insert(field.clone(), value.clone());
                        }
                    }
                }
                if !object_diff.is_empty() {
                    diff.insert(object.clone(), Value::Object(object_diff));
                }
            }
            cache.insert(object.clone(), strip_exclusions(object, fields));
        }
        // Objects absent from the new snapshot fell out of the
        // upstream union; drop them.
        cache.retain(|object, _| all_status.contains_key(object));
        diff
    }

    /// Merge a pushed status update into the cache.
    pub fn update_cache(&self, status: &Map<String, Value>) {
        let mut cache = self.cache.lock().unwrap();
        for (object, fields) in status {
            let Some(fields) = fields.as_object() else {
                continue;
            };
            let entry = cache.entry(object.clone()).or_default();
            for (field, value) in strip_exclusions(object, fields) {
                entry.insert(field, value);
            }
        }
    }

    /// Project a status update per handle and deliver it through each
    /// handle's `send_status`.
    pub fn fan_out(&self, status: &Map<String, Value>, eventtime: f64) {
        let targets: Vec<(Arc<dyn ApiTransport>, Map<String, Value>)> = {
            let table = self.table.lock().unwrap();
            table
                .values()
                .filter_map(|entry| {
                    let projected = project_status(status, &entry.objects);
                    if projected.is_empty() {
                        None
                    } else {
                        Some((entry.transport.clone(), projected))
                    }
                })
                .collect()
        };
        for (transport, projected) in targets {
            transport.send_status(projected, eventtime);
        }
    }
}

/// Restrict a status snapshot to the objects and fields a descriptor
/// asked for.
pub fn project_status(
    status: &Map<String, Value>,
    objects: &ObjectSubscription,
) -> Map<String, Value> {
    let mut projected = Map::new();
    for (object, fields) in objects {
        let Some(Value::Object(available)) = status.get(object) else {
            continue;
        };
        let value = match fields {
            None => available.clone(),
            Some(allowed) => {
                let mut filtered = Map::new();
                for field in allowed {
                    if let Some(value) = available.get(field) {
                        filtered.insert(field.clone(), value.clone());
                    }
                }
                filtered
            }
        };
        if !value.is_empty() {
            projected.insert(object.clone(), Value::Object(value));
        }
    }
    projected
}

fn strip_exclusions(object: &str, fields: &Map<String, Value>) -> Map<String, Value> {
    let Some((_, excluded)) = CACHE_EXCLUSIONS.iter().find(|(name, _)| *name == object) else {
        return fields.clone();
    };
    let mut kept = fields.clone();
    let mut removed = Vec::new();
    for field in *excluded {
        if kept.remove(*field).is_some() {
            removed.push(*field);
        }
    }
    if !removed.is_empty() {
        debug!(object, ?removed, "removed excluded fields from subscription cache");
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TransportType;
    use crate::transport::next_uid;
    use std::sync::Mutex as StdMutex;

    struct RecordingTransport {
        uid: u64,
        received: StdMutex<Vec<Map<String, Value>>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                uid: next_uid(),
                received: StdMutex::new(Vec::new()),
            })
        }
    }

    impl ApiTransport for RecordingTransport {
        fn uid(&self) -> u64 {
            self.uid
        }

        fn transport_type(&self) -> TransportType {
            TransportType::WebSocket
        }

        fn send_status(&self, status: Map<String, Value>, _eventtime: f64) {
            self.received.lock().unwrap().push(status);
        }
    }

    fn objects(value: Value) -> ObjectSubscription {
        Subscriptions::parse_objects(&value).unwrap()
    }

    #[test]
    fn union_merges_field_lists() {
        let subs = Subscriptions::new();
        let a = RecordingTransport::new();
        let b = RecordingTransport::new();
        let sub_a = objects(serde_json::json!({"toolhead": ["position"]}));
        subs.install(a.clone(), sub_a);

        let sub_b = objects(serde_json::json!({"toolhead": ["extruder"]}));
        let union = subs.begin_subscribe(b.uid(), &sub_b);
        let mut fields = union.get("toolhead").unwrap().clone().unwrap();
        fields.sort();
        assert_eq!(fields, vec!["extruder".to_string(), "position".to_string()]);
    }

    #[test]
    fn null_field_list_dominates_union() {
        let subs = Subscriptions::new();
        let a = RecordingTransport::new();
        subs.install(
            a.clone(),
            objects(serde_json::json!({"toolhead": null, "extruder": ["temperature"]})),
        );
        let b = RecordingTransport::new();
        let union = subs.begin_subscribe(
            b.uid(),
            &objects(serde_json::json!({"toolhead": ["position"], "gcode_move": null})),
        );
        assert_eq!(union.get("toolhead"), Some(&None));
        assert_eq!(union.get("gcode_move"), Some(&None));
        assert_eq!(
            union.get("extruder"),
            Some(&Some(vec!["temperature".to_string()]))
        );
    }

    #[test]
    fn resubscribe_is_idempotent() {
        let subs = Subscriptions::new();
        let a = RecordingTransport::new();
        let descriptor = objects(serde_json::json!({"toolhead": ["position"]}));
        subs.install(a.clone(), descriptor.clone());
        // The handle's prior descriptor is excluded from the union, so
        // repeating the subscribe yields the same upstream request.
        let union = subs.begin_subscribe(a.uid(), &descriptor);
        assert_eq!(union, descriptor);
    }

    #[test]
    fn snapshot_diffs_only_changed_cached_fields() {
        let subs = Subscriptions::new();
        let mut snapshot = Map::new();
        snapshot.insert(
            "toolhead".into(),
            serde_json::json!({"position": [0, 0, 0, 0], "homed_axes": ""}),
        );
        assert!(subs.apply_snapshot(&snapshot).is_empty());

        let mut snapshot = Map::new();
        snapshot.insert(
            "toolhead".into(),
            serde_json::json!({"position": [1, 0, 0, 0], "homed_axes": ""}),
        );
        let diff = subs.apply_snapshot(&snapshot);
        assert_eq!(
            Value::Object(diff),
            serde_json::json!({"toolhead": {"position": [1, 0, 0, 0]}})
        );
    }

    #[test]
    fn snapshot_prunes_dropped_objects() {
        let subs = Subscriptions::new();
        let mut snapshot = Map::new();
        snapshot.insert("toolhead".into(), serde_json::json!({"position": 1}));
        snapshot.insert("extruder".into(), serde_json::json!({"temperature": 22.5}));
        subs.apply_snapshot(&snapshot);

        let mut snapshot = Map::new();
        snapshot.insert("toolhead".into(), serde_json::json!({"position": 1}));
        subs.apply_snapshot(&snapshot);
        let cached = subs.cached_status();
        assert!(cached.contains_key("toolhead"));
        assert!(!cached.contains_key("extruder"));
    }

    #[test]
    fn cache_exclusions_apply_but_snapshot_is_returned_intact() {
        let subs = Subscriptions::new();
        let mut snapshot = Map::new();
        snapshot.insert(
            "configfile".into(),
            serde_json::json!({"config": {"printer": {}}, "settings": {}, "save_config_pending": false}),
        );
        subs.apply_snapshot(&snapshot);
        let cached = subs.cached_status();
        let configfile = cached.get("configfile").unwrap();
        assert!(!configfile.contains_key("config"));
        assert!(!configfile.contains_key("settings"));
        assert!(configfile.contains_key("save_config_pending"));
    }

    #[test]
    fn fan_out_projects_per_descriptor() {
        let subs = Subscriptions::new();
        let a = RecordingTransport::new();
        let b = RecordingTransport::new();
        subs.install(a.clone(), objects(serde_json::json!({"toolhead": ["position"]})));
        subs.install(b.clone(), objects(serde_json::json!({"extruder": null})));

        let mut status = Map::new();
        status.insert(
            "toolhead".into(),
            serde_json::json!({"position": [5], "homed_axes": "xyz"}),
        );
        status.insert("extruder".into(), serde_json::json!({"temperature": 190.0}));
        subs.fan_out(&status, 100.5);

        let received_a = a.received.lock().unwrap();
        assert_eq!(
            Value::Object(received_a[0].clone()),
            serde_json::json!({"toolhead": {"position": [5]}})
        );
        let received_b = b.received.lock().unwrap();
        assert_eq!(
            Value::Object(received_b[0].clone()),
            serde_json::json!({"extruder": {"temperature": 190.0}})
        );
    }

    #[test]
    fn removed_handles_receive_nothing() {
        let subs = Subscriptions::new();
        let a = RecordingTransport::new();
        subs.install(a.clone(), objects(serde_json::json!({"toolhead": null})));
        subs.remove(a.uid());
        let mut status = Map::new();
        status.insert("toolhead".into(), serde_json::json!({"position": 1}));
        subs.fan_out(&status, 1.0);
        assert!(a.received.lock().unwrap().is_empty());
    }
}
