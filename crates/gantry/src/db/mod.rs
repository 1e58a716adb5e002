//! Embedded persistence engine.
//!
//! One worker thread owns the SQLite connection; every operation is a
//! boxed closure shipped over a command queue and completed back on
//! the scheduler through a oneshot channel. Blocking filesystem work
//! (backup, restore, VACUUM) stays on the worker as well.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

pub mod record;
mod provider;

pub use provider::{MigrateFn, NAMESPACE_TABLE, REGISTRATION_TABLE, TableDefinition};

use provider::Provider;

use crate::error::{Result, ServerError};

type DbCommand = Box<dyn FnOnce(&mut Provider) + Send>;

const DATABASE_VERSION: i64 = 2;

/// Async handle to the persistence engine.
pub struct Database {
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<DbCommand>>>,
    protected: Mutex<HashSet<String>>,
    forbidden: Mutex<HashSet<String>>,
    unsafe_shutdowns: AtomicI64,
    backup_dir: PathBuf,
    pub(crate) backup_lock: tokio::sync::Mutex<()>,
}

impl Database {
    /// Open the store, start the worker, and run startup accounting
    /// (instance id check, unsafe-shutdown increment).
    pub async fn open(db_path: PathBuf, instance_id: String) -> Result<Database> {
        let backup_dir = db_path
            .parent()
            .map(|p| p.join("backup"))
            .unwrap_or_else(|| PathBuf::from("backup"));
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<DbCommand>();
        let (ready_tx, ready_rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("gantry-db".into())
            .spawn(move || {
                let mut provider = match Provider::open(db_path) {
                    Ok(provider) => {
                        let _ = ready_tx.send(Ok(()));
                        provider
                    }
                    Err(error) => {
                        let _ = ready_tx.send(Err(error));
                        return;
                    }
                };
                while let Some(command) = cmd_rx.blocking_recv() {
                    command(&mut provider);
                }
            })
            .map_err(|e| ServerError::internal(format!("spawn database worker: {e}")))?;
        ready_rx
            .await
            .map_err(|_| ServerError::internal("database worker exited during open"))??;

        let db = Database {
            cmd_tx: Mutex::new(Some(cmd_tx)),
            protected: Mutex::new(HashSet::new()),
            forbidden: Mutex::new(HashSet::new()),
            unsafe_shutdowns: AtomicI64::new(0),
            backup_dir,
            backup_lock: tokio::sync::Mutex::new(()),
        };
        db.startup_accounting(instance_id).await?;
        Ok(db)
    }

    async fn startup_accounting(&self, instance_id: String) -> Result<()> {
        let dbinfo = self
            .run(|provider| provider.get_namespace("database", false).map(Value::Object))
            .await?;
        let mut protected: HashSet<String> = string_set(dbinfo.get("protected_namespaces"));
        protected.insert("moonraker".into());
        let mut forbidden: HashSet<String> = string_set(dbinfo.get("forbidden_namespaces"));
        forbidden.insert("database".into());
        *self.protected.lock().unwrap() = protected;
        *self.forbidden.lock().unwrap() = forbidden;

        let shutdowns = dbinfo
            .get("unsafe_shutdowns")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        self.unsafe_shutdowns.store(shutdowns, Ordering::Relaxed);
        info!(count = shutdowns, "unsafe shutdown count");

        match self.get_item("moonraker", Some("instance_id")).await {
            Ok(stored) => {
                if stored != Value::String(instance_id.clone()) {
                    warn!(
                        stored = %stored,
                        current = instance_id.as_str(),
                        "stored instance id does not match current instance id"
                    );
                }
            }
            Err(_) => {
                self.insert_item("moonraker", "instance_id", Value::String(instance_id))
                    .await?;
            }
        }
        self.insert_item("database", "database_version", Value::from(DATABASE_VERSION))
            .await?;
        // Reset on graceful close; a crash leaves the increment behind.
        self.insert_item("database", "unsafe_shutdowns", Value::from(shutdowns + 1))
            .await?;
        Ok(())
    }

    async fn run<T, F>(&self, func: F) -> Result<T>
    where
        F: FnOnce(&mut Provider) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let cmd_tx = {
            let guard = self.cmd_tx.lock().unwrap();
            guard
                .as_ref()
                .cloned()
                .ok_or_else(|| ServerError::internal("database worker stopped"))?
        };
        cmd_tx
            .send(Box::new(move |provider| {
                let _ = tx.send(func(provider));
            }))
            .map_err(|_| ServerError::internal("database worker stopped"))?;
        rx.await
            .map_err(|_| ServerError::internal("database worker stopped"))?
    }

    pub async fn insert_item(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        let (namespace, key) = (namespace.to_string(), key.to_string());
        self.run(move |provider| provider.insert_item(&namespace, &key, value))
            .await
    }

    pub async fn update_item(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        let (namespace, key) = (namespace.to_string(), key.to_string());
        self.run(move |provider| provider.update_item(&namespace, &key, value))
            .await
    }

    pub async fn delete_item(&self, namespace: &str, key: &str) -> Result<Value> {
        let (namespace, key) = (namespace.to_string(), key.to_string());
        self.run(move |provider| provider.delete_item(&namespace, &key))
            .await
    }

    pub async fn get_item(&self, namespace: &str, key: Option<&str>) -> Result<Value> {
        let namespace = namespace.to_string();
        let key = key.map(str::to_string);
        self.run(move |provider| provider.get_item(&namespace, key.as_deref()))
            .await
    }

    /// Fetch with a fallback for missing keys; other failures still
    /// propagate.
    pub async fn get_item_or(&self, namespace: &str, key: &str, default: Value) -> Value {
        self.get_item(namespace, Some(key)).await.unwrap_or(default)
    }

    pub async fn contains(&self, namespace: &str, key: &str) -> Result<bool> {
        let (namespace, key) = (namespace.to_string(), key.to_string());
        self.run(move |provider| Ok(provider.contains(&namespace, &key)))
            .await
    }

    pub async fn insert_batch(&self, namespace: &str, records: Map<String, Value>) -> Result<()> {
        let namespace = namespace.to_string();
        self.run(move |provider| provider.insert_batch(&namespace, records))
            .await
    }

    pub async fn get_batch(&self, namespace: &str, keys: Vec<String>) -> Result<Map<String, Value>> {
        let namespace = namespace.to_string();
        self.run(move |provider| provider.get_batch(&namespace, keys))
            .await
    }

    pub async fn delete_batch(
        &self,
        namespace: &str,
        keys: Vec<String>,
    ) -> Result<Map<String, Value>> {
        let namespace = namespace.to_string();
        self.run(move |provider| provider.delete_batch(&namespace, keys))
            .await
    }

    pub async fn move_batch(
        &self,
        namespace: &str,
        source_keys: Vec<String>,
        dest_keys: Vec<String>,
    ) -> Result<()> {
        if source_keys.len() != dest_keys.len() {
            return Err(ServerError::invalid_params(
                "Source and destination key counts must match",
            ));
        }
        let namespace = namespace.to_string();
        self.run(move |provider| provider.move_batch(&namespace, source_keys, dest_keys))
            .await
    }

    pub async fn ns_keys(&self, namespace: &str) -> Result<Vec<String>> {
        let namespace = namespace.to_string();
        self.run(move |provider| provider.ns_keys(&namespace)).await
    }

    pub async fn ns_values(&self, namespace: &str) -> Result<Vec<Value>> {
        let namespace = namespace.to_string();
        self.run(move |provider| provider.ns_values(&namespace)).await
    }

    pub async fn ns_items(&self, namespace: &str) -> Result<Vec<(String, Value)>> {
        let namespace = namespace.to_string();
        self.run(move |provider| provider.ns_items(&namespace)).await
    }

    pub async fn ns_length(&self, namespace: &str) -> Result<usize> {
        let namespace = namespace.to_string();
        self.run(move |provider| provider.ns_length(&namespace)).await
    }

    /// One page of a keyed namespace scan; the streaming iterator is a
    /// loop over pages.
    pub async fn ns_range(
        &self,
        namespace: &str,
        offset: usize,
        count: usize,
    ) -> Result<Vec<(String, Value)>> {
        let namespace = namespace.to_string();
        self.run(move |provider| provider.ns_range(&namespace, offset, count))
            .await
    }

    pub async fn clear_namespace(&self, namespace: &str) -> Result<()> {
        let namespace = namespace.to_string();
        self.run(move |provider| provider.clear_namespace(&namespace))
            .await
    }

    pub async fn sync_namespace(
        &self,
        namespace: &str,
        values: Map<String, Value>,
    ) -> Result<()> {
        let namespace = namespace.to_string();
        self.run(move |provider| provider.sync_namespace(&namespace, values))
            .await
    }

    pub async fn drop_empty_namespace(&self, namespace: &str) -> Result<()> {
        let namespace = namespace.to_string();
        self.run(move |provider| provider.drop_empty_namespace(&namespace))
            .await
    }

    pub async fn namespaces(&self) -> Result<Vec<String>> {
        self.run(|provider| Ok(provider.namespaces())).await
    }

    pub async fn tables(&self) -> Result<Vec<String>> {
        self.run(|provider| Ok(provider.tables())).await
    }

    /// Register a namespace owned by a local component and record its
    /// access classification.
    pub async fn register_local_namespace(&self, namespace: &str, forbidden: bool) -> Result<()> {
        {
            let ns = namespace.to_string();
            self.run(move |provider| {
                provider.register_namespace(&ns);
                Ok(())
            })
            .await?;
        }
        let (key, set) = if forbidden {
            ("forbidden_namespaces", &self.forbidden)
        } else {
            ("protected_namespaces", &self.protected)
        };
        let updated: Vec<String> = {
            let mut guard = set.lock().unwrap();
            guard.insert(namespace.to_string());
            let mut list: Vec<String> = guard.iter().cloned().collect();
            list.sort();
            list
        };
        self.insert_item("database", key, serde_json::json!(updated))
            .await
    }

    pub fn is_protected(&self, namespace: &str) -> bool {
        self.protected.lock().unwrap().contains(namespace)
    }

    pub fn is_forbidden(&self, namespace: &str) -> bool {
        self.forbidden.lock().unwrap().contains(namespace)
    }

    pub fn forbidden_namespaces(&self) -> HashSet<String> {
        self.forbidden.lock().unwrap().clone()
    }

    pub fn backup_dir(&self) -> &PathBuf {
        &self.backup_dir
    }

    pub async fn register_table(&self, def: TableDefinition) -> Result<()> {
        self.run(move |provider| provider.register_table(def)).await
    }

    pub async fn sql_execute(&self, statement: &str, params: Vec<Value>) -> Result<usize> {
        let statement = statement.to_string();
        self.run(move |provider| provider.sql_execute(&statement, params))
            .await
    }

    pub async fn sql_query(
        &self,
        statement: &str,
        params: Vec<Value>,
    ) -> Result<Vec<Map<String, Value>>> {
        let statement = statement.to_string();
        self.run(move |provider| provider.sql_query(&statement, params))
            .await
    }

    pub async fn sql_executescript(&self, script: &str) -> Result<()> {
        let script = script.to_string();
        self.run(move |provider| provider.sql_executescript(&script))
            .await
    }

    /// VACUUM; returns (previous, new) file sizes.
    pub async fn compact(&self) -> Result<(u64, u64)> {
        self.run(|provider| provider.compact()).await
    }

    pub async fn backup(&self, path: PathBuf) -> Result<()> {
        self.run(move |provider| provider.backup(&path)).await
    }

    /// Swap in the contents of a backup file. Returns the restored
    /// table and namespace lists; the caller should restart afterward.
    pub async fn restore(&self, path: PathBuf) -> Result<(Vec<String>, Vec<String>)> {
        self.run(move |provider| provider.restore(&path)).await
    }

    pub async fn is_restored(&self) -> bool {
        self.run(|provider| Ok(provider.is_restored()))
            .await
            .unwrap_or(false)
    }

    pub fn unsafe_shutdown_count(&self) -> i64 {
        self.unsafe_shutdowns.load(Ordering::Relaxed)
    }

    /// Graceful close: write the pre-increment shutdown counter back
    /// (unless a restore happened) and stop the worker.
    pub async fn close(&self) {
        if !self.is_restored().await {
            let count = self.unsafe_shutdowns.load(Ordering::Relaxed);
            if let Err(error) = self
                .insert_item("database", "unsafe_shutdowns", Value::from(count))
                .await
            {
                warn!(%error, "failed to reset unsafe shutdown counter");
            }
        }
        // Dropping the sender lets the worker drain and exit.
        self.cmd_tx.lock().unwrap().take();
    }
}

fn string_set(value: Option<&Value>) -> HashSet<String> {
    value
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_db(dir: &tempfile::TempDir) -> Database {
        Database::open(dir.path().join("gantry-sql.db"), "test-instance".into())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn persisted_values_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;
        for value in [
            Value::Null,
            serde_json::json!(true),
            serde_json::json!(-7),
            serde_json::json!(1.25),
            serde_json::json!("text"),
            serde_json::json!([1, 2, 3]),
            serde_json::json!({"a": {"b": 1}}),
        ] {
            db.insert_item("ns", "probe", value.clone()).await.unwrap();
            assert_eq!(db.get_item("ns", Some("probe")).await.unwrap(), value);
        }
        db.close().await;
    }

    #[tokio::test]
    async fn nested_insert_matches_expected_shape() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;
        db.insert_item("ns", "a.b.c", serde_json::json!(7))
            .await
            .unwrap();
        assert_eq!(
            db.get_item("ns", Some("a")).await.unwrap(),
            serde_json::json!({"b": {"c": 7}})
        );
        db.close().await;
    }

    #[tokio::test]
    async fn reserved_namespace_classification() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;
        assert!(db.is_protected("moonraker"));
        assert!(db.is_forbidden("database"));
        assert!(!db.is_forbidden("moonraker"));

        db.register_local_namespace("secrets", true).await.unwrap();
        assert!(db.is_forbidden("secrets"));
        // The classification is itself persisted to the reserved
        // namespace.
        let stored = db
            .get_item("database", Some("forbidden_namespaces"))
            .await
            .unwrap();
        assert!(stored.as_array().unwrap().contains(&serde_json::json!("secrets")));
        db.close().await;
    }

    #[tokio::test]
    async fn unsafe_shutdown_counter_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gantry-sql.db");

        let db = Database::open(path.clone(), "iid".into()).await.unwrap();
        assert_eq!(db.unsafe_shutdown_count(), 0);
        assert_eq!(
            db.get_item("database", Some("unsafe_shutdowns"))
                .await
                .unwrap(),
            serde_json::json!(1)
        );
        // Graceful close writes the pre-increment value back.
        db.close().await;

        let db = Database::open(path.clone(), "iid".into()).await.unwrap();
        assert_eq!(db.unsafe_shutdown_count(), 0);
        // Simulate a crash: drop without close. The next open sees the
        // incremented counter.
        drop(db);
        let db = Database::open(path, "iid".into()).await.unwrap();
        assert_eq!(db.unsafe_shutdown_count(), 1);
        db.close().await;
    }

    #[tokio::test]
    async fn operations_after_close_fail_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;
        db.close().await;
        let err = db
            .insert_item("ns", "k", serde_json::json!(1))
            .await
            .unwrap_err();
        assert!(err.message().contains("database worker stopped"));
    }

    #[tokio::test]
    async fn batch_and_scan_surface() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;
        let mut records = Map::new();
        for i in 0..4 {
            records.insert(format!("k{i}"), serde_json::json!(i));
        }
        db.insert_batch("batch", records).await.unwrap();
        assert_eq!(db.ns_length("batch").await.unwrap(), 4);
        let fetched = db
            .get_batch("batch", vec!["k1".into(), "k3".into(), "missing".into()])
            .await
            .unwrap();
        assert_eq!(Value::Object(fetched), serde_json::json!({"k1": 1, "k3": 3}));
        let page = db.ns_range("batch", 0, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        db.close().await;
    }
}
