//! Synchronous SQL provider.
//!
//! Runs entirely on the database worker thread, which exclusively owns
//! the connection. The async surface in `db::Database` ships boxed
//! closures over these methods.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::db::record::{decode_record, encode_record};
use crate::error::{ErrorKind, Result, ServerError};

pub const NAMESPACE_TABLE: &str = "namespace_store";
pub const REGISTRATION_TABLE: &str = "table_registry";

const NAMESPACE_PROTO: &str = "namespace_store (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value RECORD NOT NULL,
    PRIMARY KEY (namespace, key)
)";

const REGISTRATION_PROTO: &str = "table_registry (
    name TEXT NOT NULL PRIMARY KEY,
    prototype TEXT NOT NULL,
    version INT
)";

/// Migration hook invoked when a registered table's version increases.
/// Receives the previously stored version and a synchronous handle to
/// the connection.
pub type MigrateFn = Box<dyn FnOnce(i64, &mut Connection) -> Result<()> + Send>;

pub struct TableDefinition {
    pub name: String,
    pub prototype: String,
    pub version: i64,
    pub migrate: MigrateFn,
}

pub(crate) struct Provider {
    conn: Connection,
    db_path: PathBuf,
    namespaces: HashSet<String>,
    tables: HashSet<String>,
    restored: bool,
}

pub(crate) fn parse_key(key: &str) -> Result<Vec<String>> {
    let segments: Vec<String> = key.split('.').map(str::to_string).collect();
    if segments.is_empty() || segments.iter().any(String::is_empty) {
        return Err(ServerError::invalid_params(format!(
            "Invalid key format: '{key}'"
        )));
    }
    Ok(segments)
}

impl Provider {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        let mut provider = Self {
            conn,
            db_path,
            namespaces: HashSet::new(),
            tables: HashSet::new(),
            restored: false,
        };
        provider.setup()?;
        Ok(provider)
    }

    fn setup(&mut self) -> Result<()> {
        self.tables = self.detect_tables()?;
        debug!(tables = ?self.tables, "detected sql tables");
        if !self.tables.contains(REGISTRATION_TABLE) {
            self.conn
                .execute(&format!("CREATE TABLE {REGISTRATION_PROTO}"), [])?;
            self.tables.insert(REGISTRATION_TABLE.to_string());
        }
        if !self.tables.contains(NAMESPACE_TABLE) {
            self.conn
                .execute(&format!("CREATE TABLE {NAMESPACE_PROTO}"), [])?;
            self.save_registered_table(NAMESPACE_TABLE, NAMESPACE_PROTO, 1)?;
            info!("created default sql table {NAMESPACE_TABLE}");
        }
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT DISTINCT namespace FROM {NAMESPACE_TABLE}"))?;
        let namespaces = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        drop(stmt);
        self.namespaces = namespaces;
        debug!(namespaces = ?self.namespaces, "detected namespaces");
        Ok(())
    }

    fn detect_tables(&self) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
        let tables = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(tables)
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self.namespaces.iter().cloned().collect();
        namespaces.sort();
        namespaces
    }

    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.tables.iter().cloned().collect();
        tables.sort();
        tables
    }

    pub fn is_restored(&self) -> bool {
        self.restored
    }

    fn insert_record(&mut self, namespace: &str, key: &str, value: &Value) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO {NAMESPACE_TABLE} VALUES(?1, ?2, ?3) \
                 ON CONFLICT(namespace, key) DO UPDATE SET value=excluded.value"
            ),
            rusqlite::params![namespace, key, encode_record(value)?],
        )?;
        self.namespaces.insert(namespace.to_string());
        Ok(())
    }

    fn get_record(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT value FROM {NAMESPACE_TABLE} WHERE namespace = ?1 and key = ?2"
        ))?;
        let mut rows = stmt.query(rusqlite::params![namespace, key])?;
        match rows.next()? {
            Some(row) => {
                let blob: Vec<u8> = row.get(0)?;
                Ok(Some(decode_record(&blob)?))
            }
            None => Ok(None),
        }
    }

    fn require_record(&self, namespace: &str, key: &str) -> Result<Value> {
        self.get_record(namespace, key)?.ok_or_else(|| {
            ServerError::not_found(format!(
                "Key '{key}' in namespace '{namespace}' not found"
            ))
        })
    }

    pub fn insert_item(&mut self, namespace: &str, key: &str, value: Value) -> Result<()> {
        let segments = parse_key(key)?;
        let record = if segments.len() == 1 {
            value
        } else {
            let mut record = self.get_record(namespace, &segments[0])?.unwrap_or_else(
                || Value::Object(Map::new()),
            );
            if !record.is_object() {
                warn!(
                    namespace,
                    key = segments[0].as_str(),
                    "overwriting non-mapping record with an object"
                );
                record = Value::Object(Map::new());
            }
            set_nested(&mut record, &segments, value, namespace)?;
            record
        };
        self.insert_record(namespace, &segments[0], &record)
    }

    pub fn update_item(&mut self, namespace: &str, key: &str, value: Value) -> Result<()> {
        let segments = parse_key(key)?;
        let mut record = self.require_record(namespace, &segments[0])?;
        if segments.len() == 1 {
            record = merge_or_replace(record, value);
        } else {
            let item = traverse_mut(&mut record, &segments[1..segments.len() - 1])
                .ok_or_else(|| {
                    ServerError::not_found(format!(
                        "Key '{key}' in namespace '{namespace}' not found"
                    ))
                })?;
            let Value::Object(map) = item else {
                return Err(not_a_mapping(&segments, namespace, "update"));
            };
            let last = &segments[segments.len() - 1];
            let Some(existing) = map.remove(last) else {
                return Err(not_a_mapping(&segments, namespace, "update"));
            };
            map.insert(last.clone(), merge_or_replace(existing, value));
        }
        self.insert_record(namespace, &segments[0], &record)
    }

    /// Delete a key, returning the removed value. Removing a nested
    /// leaf re-stores the remaining record; removing the last leaf (or
    /// a top-level key) drops the row.
    pub fn delete_item(&mut self, namespace: &str, key: &str) -> Result<Value> {
        let segments = parse_key(key)?;
        let mut record = self.require_record(namespace, &segments[0])?;
        let mut remove_record = true;
        let removed = if segments.len() == 1 {
            record.clone()
        } else {
            let not_found = || {
                ServerError::not_found(format!(
                    "Key '{key}' in namespace '{namespace}' not found"
                ))
            };
            let item = traverse_mut(&mut record, &segments[1..segments.len() - 1])
                .ok_or_else(not_found)?;
            let Value::Object(map) = item else {
                return Err(not_found());
            };
            let removed = map.remove(&segments[segments.len() - 1]).ok_or_else(not_found)?;
            remove_record = record.as_object().is_some_and(Map::is_empty);
            removed
        };
        if remove_record {
            self.conn.execute(
                &format!("DELETE FROM {NAMESPACE_TABLE} WHERE namespace = ?1 and key = ?2"),
                rusqlite::params![namespace, segments[0]],
            )?;
        } else {
            self.insert_record(namespace, &segments[0], &record)?;
        }
        Ok(removed)
    }

    pub fn get_item(&self, namespace: &str, key: Option<&str>) -> Result<Value> {
        let Some(key) = key else {
            return Ok(Value::Object(self.get_namespace(namespace, true)?));
        };
        let segments = parse_key(key)?;
        let record = self.require_record(namespace, &segments[0])?;
        let mut current = &record;
        for segment in &segments[1..] {
            current = current.get(segment).ok_or_else(|| {
                ServerError::not_found(format!(
                    "Key '{key}' in namespace '{namespace}' not found"
                ))
            })?;
        }
        Ok(current.clone())
    }

    pub fn contains(&self, namespace: &str, key: &str) -> bool {
        matches!(self.get_item(namespace, Some(key)), Ok(_))
    }

    pub fn get_namespace(&self, namespace: &str, must_exist: bool) -> Result<Map<String, Value>> {
        if !self.namespaces.contains(namespace) {
            if must_exist {
                return Err(ServerError::not_found(format!(
                    "Namespace '{namespace}' not found"
                )));
            }
            return Ok(Map::new());
        }
        let items = self.ns_items(namespace)?;
        Ok(items.into_iter().collect())
    }

    pub fn ns_keys(&self, namespace: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT key FROM {NAMESPACE_TABLE} WHERE namespace = ?1"
        ))?;
        let keys = stmt
            .query_map([namespace], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }

    pub fn ns_values(&self, namespace: &str) -> Result<Vec<Value>> {
        Ok(self
            .ns_items(namespace)?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    pub fn ns_items(&self, namespace: &str) -> Result<Vec<(String, Value)>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT key, value FROM {NAMESPACE_TABLE} WHERE namespace = ?1"
        ))?;
        let rows = stmt
            .query_map([namespace], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<(String, Vec<u8>)>>>()?;
        rows.into_iter()
            .map(|(key, blob)| Ok((key, decode_record(&blob)?)))
            .collect()
    }

    /// One page of a namespace scan, ordered by key.
    pub fn ns_range(
        &self,
        namespace: &str,
        offset: usize,
        count: usize,
    ) -> Result<Vec<(String, Value)>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT key, value FROM {NAMESPACE_TABLE} WHERE namespace = ?1 \
             ORDER BY key LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt
            .query_map(
                rusqlite::params![namespace, count as i64, offset as i64],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )?
            .collect::<rusqlite::Result<Vec<(String, Vec<u8>)>>>()?;
        rows.into_iter()
            .map(|(key, blob)| Ok((key, decode_record(&blob)?)))
            .collect()
    }

    pub fn ns_length(&self, namespace: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(namespace) FROM {NAMESPACE_TABLE} WHERE namespace = ?1"),
            [namespace],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn clear_namespace(&mut self, namespace: &str) -> Result<()> {
        self.conn.execute(
            &format!("DELETE FROM {NAMESPACE_TABLE} WHERE namespace = ?1"),
            [namespace],
        )?;
        Ok(())
    }

    pub fn drop_empty_namespace(&mut self, namespace: &str) -> Result<()> {
        if self.namespaces.contains(namespace) && self.ns_length(namespace)? == 0 {
            self.namespaces.remove(namespace);
        }
        Ok(())
    }

    /// Replace a namespace's contents wholesale.
    pub fn sync_namespace(
        &mut self,
        namespace: &str,
        values: Map<String, Value>,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            &format!("DELETE FROM {NAMESPACE_TABLE} WHERE namespace = ?1"),
            [namespace],
        )?;
        {
            let mut stmt =
                tx.prepare(&format!("INSERT INTO {NAMESPACE_TABLE} VALUES(?1, ?2, ?3)"))?;
            for (key, value) in &values {
                stmt.execute(rusqlite::params![namespace, key, encode_record(value)?])?;
            }
        }
        tx.commit()?;
        self.namespaces.insert(namespace.to_string());
        Ok(())
    }

    pub fn register_namespace(&mut self, namespace: &str) {
        self.namespaces.insert(namespace.to_string());
    }

    pub fn insert_batch(&mut self, namespace: &str, records: Map<String, Value>) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {NAMESPACE_TABLE} VALUES(?1, ?2, ?3) \
                 ON CONFLICT(namespace, key) DO UPDATE SET value=excluded.value"
            ))?;
            for (key, value) in &records {
                stmt.execute(rusqlite::params![namespace, key, encode_record(value)?])?;
            }
        }
        tx.commit()?;
        self.namespaces.insert(namespace.to_string());
        Ok(())
    }

    pub fn move_batch(
        &mut self,
        namespace: &str,
        source_keys: Vec<String>,
        dest_keys: Vec<String>,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "UPDATE OR REPLACE {NAMESPACE_TABLE} SET key = ?1 \
                 WHERE namespace = ?2 and key = ?3"
            ))?;
            for (src, dest) in source_keys.iter().zip(dest_keys.iter()) {
                stmt.execute(rusqlite::params![dest, namespace, src])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete several keys in one transaction, returning their prior
    /// values.
    pub fn delete_batch(
        &mut self,
        namespace: &str,
        keys: Vec<String>,
    ) -> Result<Map<String, Value>> {
        let tx = self.conn.transaction()?;
        let mut removed = Map::new();
        {
            let mut select = tx.prepare(&format!(
                "SELECT value FROM {NAMESPACE_TABLE} WHERE namespace = ?1 and key = ?2"
            ))?;
            let mut delete = tx.prepare(&format!(
                "DELETE FROM {NAMESPACE_TABLE} WHERE namespace = ?1 and key = ?2"
            ))?;
            for key in &keys {
                let blob: Option<Vec<u8>> = select
                    .query_row(rusqlite::params![namespace, key], |row| row.get(0))
                    .map(Some)
                    .or_else(|err| match err {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                if let Some(blob) = blob {
                    removed.insert(key.clone(), decode_record(&blob)?);
                    delete.execute(rusqlite::params![namespace, key])?;
                }
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    pub fn get_batch(&self, namespace: &str, keys: Vec<String>) -> Result<Map<String, Value>> {
        let mut out = Map::new();
        for key in &keys {
            if let Some(value) = self.get_record(namespace, key)? {
                out.insert(key.clone(), value);
            }
        }
        Ok(out)
    }

    /// Raw statement execution for components with registered tables.
    /// Returns the affected row count.
    pub fn sql_execute(&mut self, statement: &str, params: Vec<Value>) -> Result<usize> {
        let params: Vec<Box<dyn rusqlite::ToSql>> =
            params.into_iter().map(to_sql_param).collect::<Result<_>>()?;
        let refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(AsRef::as_ref).collect();
        Ok(self.conn.execute(statement, refs.as_slice())?)
    }

    /// Raw query execution; rows come back as JSON objects keyed by
    /// column name.
    pub fn sql_query(
        &mut self,
        statement: &str,
        params: Vec<Value>,
    ) -> Result<Vec<Map<String, Value>>> {
        let params: Vec<Box<dyn rusqlite::ToSql>> =
            params.into_iter().map(to_sql_param).collect::<Result<_>>()?;
        let refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(AsRef::as_ref).collect();
        let mut stmt = self.conn.prepare(statement)?;
        let column_names: Vec<String> =
            stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt.query(refs.as_slice())?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut obj = Map::new();
            for (index, name) in column_names.iter().enumerate() {
                obj.insert(name.clone(), column_to_json(row.get_ref(index)?));
            }
            out.push(obj);
        }
        Ok(out)
    }

    pub fn sql_executescript(&mut self, script: &str) -> Result<()> {
        self.conn.execute_batch(script)?;
        Ok(())
    }

    pub fn register_table(&mut self, def: TableDefinition) -> Result<()> {
        if def.name == NAMESPACE_TABLE || def.name == REGISTRATION_TABLE {
            return Err(ServerError::new(
                format!("Cannot register table '{}', it is reserved", def.name),
                500,
            ));
        }
        if def.version < 1 {
            return Err(ServerError::invalid_params(format!(
                "Table '{}' version must be >= 1",
                def.name
            )));
        }
        let declared = def
            .prototype
            .split('(')
            .next()
            .map(str::trim)
            .unwrap_or_default();
        if declared != def.name {
            return Err(ServerError::invalid_params(format!(
                "Table prototype declares '{declared}', expected '{}'",
                def.name
            )));
        }
        let (detected_proto, version) = if self.tables.contains(&def.name) {
            info!(table = def.name.as_str(), "found registered table");
            self.lookup_registered_table(&def.name)?
        } else {
            info!(table = def.name.as_str(), "creating table");
            self.conn
                .execute(&format!("CREATE TABLE {}", def.prototype), [])?;
            (def.prototype.clone(), 0)
        };
        if def.version > version {
            (def.migrate)(version, &mut self.conn)?;
            self.save_registered_table(&def.name, &def.prototype, def.version)?;
        } else if detected_proto != def.prototype {
            warn!(
                table = def.name.as_str(),
                expected = def.prototype.as_str(),
                stored = detected_proto.as_str(),
                "table definition does not match stored definition"
            );
        }
        Ok(())
    }

    fn save_registered_table(&mut self, name: &str, prototype: &str, version: i64) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO {REGISTRATION_TABLE} VALUES(?1, ?2, ?3) \
                 ON CONFLICT(name) DO UPDATE SET \
                 prototype=excluded.prototype, version=excluded.version"
            ),
            rusqlite::params![name, prototype, version],
        )?;
        self.tables.insert(name.to_string());
        Ok(())
    }

    fn lookup_registered_table(&self, name: &str) -> Result<(String, i64)> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT prototype, version FROM {REGISTRATION_TABLE} WHERE name = ?1"
        ))?;
        let mut rows = stmt.query([name])?;
        match rows.next()? {
            Some(row) => Ok((row.get(0)?, row.get(1)?)),
            None => Ok((String::new(), 0)),
        }
    }

    pub fn compact(&mut self) -> Result<(u64, u64)> {
        if self.restored {
            return Err(ServerError::new(
                "Cannot compact restored database, awaiting restart",
                500,
            ));
        }
        let previous_size = file_size(&self.db_path);
        self.conn.execute_batch("VACUUM")?;
        let new_size = file_size(&self.db_path);
        Ok((previous_size, new_size))
    }

    pub fn backup(&mut self, bkp_path: &Path) -> Result<()> {
        if self.restored {
            return Err(ServerError::new(
                "Cannot backup restored database, awaiting restart",
                500,
            ));
        }
        if let Some(parent) = bkp_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ServerError::internal(format!("create backup dir: {e}")))?;
            }
        }
        if bkp_path.exists() {
            std::fs::remove_file(bkp_path)
                .map_err(|e| ServerError::internal(format!("remove stale backup: {e}")))?;
        }
        let mut dst = Connection::open(bkp_path)?;
        let backup = rusqlite::backup::Backup::new(&self.conn, &mut dst)?;
        backup.run_to_completion(100, Duration::from_millis(5), None)?;
        Ok(())
    }

    /// Swap in the contents of another database file. The caller is
    /// expected to restart the process afterwards; until then every
    /// backup/compact/restore request refuses.
    pub fn restore(&mut self, restore_path: &Path) -> Result<(Vec<String>, Vec<String>)> {
        if self.restored {
            return Err(ServerError::new("Database already restored", 500));
        }
        if !restore_path.is_file() {
            return Err(ServerError::invalid_params(format!(
                "Restoration file '{}' does not exist",
                restore_path.display()
            )));
        }
        let src = Connection::open(restore_path)?;
        let mut stmt = src.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
        let tables = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        drop(stmt);
        if !tables.iter().any(|t| t == NAMESPACE_TABLE) {
            return Err(ServerError::invalid_params(format!(
                "Invalid database for restoration, missing table '{NAMESPACE_TABLE}'"
            )));
        }
        let mut stmt =
            src.prepare(&format!("SELECT DISTINCT namespace FROM {NAMESPACE_TABLE}"))?;
        let namespaces = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        drop(stmt);
        {
            let backup = rusqlite::backup::Backup::new(&src, &mut self.conn)?;
            backup.run_to_completion(100, Duration::from_millis(5), None)?;
        }
        self.restored = true;
        Ok((tables, namespaces))
    }
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

fn merge_or_replace(existing: Value, value: Value) -> Value {
    match (existing, value) {
        (Value::Object(mut map), Value::Object(update)) => {
            for (key, val) in update {
                map.insert(key, val);
            }
            Value::Object(map)
        }
        (_, value) => value,
    }
}

/// Walk into a record following intermediate segments; `None` when a
/// segment is missing or crosses a non-mapping value.
fn traverse_mut<'a>(record: &'a mut Value, segments: &[String]) -> Option<&'a mut Value> {
    let mut current = record;
    for segment in segments {
        current = current.as_object_mut()?.get_mut(segment)?;
    }
    Some(current)
}

fn set_nested(
    record: &mut Value,
    segments: &[String],
    value: Value,
    namespace: &str,
) -> Result<()> {
    let mut current = record;
    for segment in &segments[1..segments.len() - 1] {
        let map = current
            .as_object_mut()
            .ok_or_else(|| not_a_mapping(segments, namespace, "insert"))?;
        current = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let map = current
        .as_object_mut()
        .ok_or_else(|| not_a_mapping(segments, namespace, "insert"))?;
    map.insert(segments[segments.len() - 1].clone(), value);
    Ok(())
}

fn not_a_mapping(segments: &[String], namespace: &str, action: &str) -> ServerError {
    let parent = segments[..segments.len() - 1].join(".");
    ServerError::with_kind(
        ErrorKind::InvalidNesting,
        format!(
            "Item at key '{parent}' in namespace '{namespace}' is not a \
             mapping object, cannot {action}"
        ),
    )
}

fn to_sql_param(value: Value) -> Result<Box<dyn rusqlite::ToSql>> {
    Ok(match value {
        Value::Null => Box::new(rusqlite::types::Null),
        Value::Bool(b) => Box::new(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Box::new(i)
            } else if let Some(f) = n.as_f64() {
                Box::new(f)
            } else {
                return Err(ServerError::invalid_params(format!(
                    "SQL parameter out of range: {n}"
                )));
            }
        }
        Value::String(s) => Box::new(s),
        other => {
            return Err(ServerError::invalid_params(format!(
                "Unsupported SQL parameter type: {other}"
            )));
        }
    })
}

fn column_to_json(value: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(blob) => {
            decode_record(blob).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(blob).into_owned())
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_provider(dir: &tempfile::TempDir) -> Provider {
        Provider::open(dir.path().join("gantry-sql.db")).unwrap()
    }

    #[test]
    fn nested_insert_creates_intermediate_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = open_provider(&dir);
        provider
            .insert_item("ns", "a.b.c", serde_json::json!(7))
            .unwrap();
        assert_eq!(
            provider.get_item("ns", Some("a")).unwrap(),
            serde_json::json!({"b": {"c": 7}})
        );
        assert_eq!(
            provider.get_item("ns", Some("a.b.c")).unwrap(),
            serde_json::json!(7)
        );
    }

    #[test]
    fn nested_insert_into_non_mapping_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = open_provider(&dir);
        provider
            .insert_item("ns", "a.b", serde_json::json!(1))
            .unwrap();
        let err = provider
            .insert_item("ns", "a.b.c", serde_json::json!(2))
            .unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::InvalidNesting);
    }

    #[test]
    fn delete_leaf_restores_record_delete_last_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = open_provider(&dir);
        provider
            .insert_item("ns", "rec", serde_json::json!({"x": 1, "y": 2}))
            .unwrap();
        let removed = provider.delete_item("ns", "rec.x").unwrap();
        assert_eq!(removed, serde_json::json!(1));
        assert_eq!(
            provider.get_item("ns", Some("rec")).unwrap(),
            serde_json::json!({"y": 2})
        );
        provider.delete_item("ns", "rec.y").unwrap();
        assert!(provider.get_item("ns", Some("rec")).is_err());
    }

    #[test]
    fn update_merges_mappings_and_replaces_scalars() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = open_provider(&dir);
        provider
            .insert_item("ns", "cfg", serde_json::json!({"speed": 100}))
            .unwrap();
        provider
            .update_item("ns", "cfg", serde_json::json!({"accel": 3000}))
            .unwrap();
        assert_eq!(
            provider.get_item("ns", Some("cfg")).unwrap(),
            serde_json::json!({"speed": 100, "accel": 3000})
        );
        provider
            .update_item("ns", "cfg.speed", serde_json::json!(200))
            .unwrap();
        assert_eq!(
            provider.get_item("ns", Some("cfg.speed")).unwrap(),
            serde_json::json!(200)
        );
        assert!(provider
            .update_item("ns", "missing", serde_json::json!(1))
            .is_err());
    }

    #[test]
    fn delete_batch_returns_prior_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = open_provider(&dir);
        let mut records = Map::new();
        records.insert("one".into(), serde_json::json!(1));
        records.insert("two".into(), serde_json::json!("2"));
        provider.insert_batch("ns", records).unwrap();
        let removed = provider
            .delete_batch("ns", vec!["one".into(), "two".into(), "three".into()])
            .unwrap();
        assert_eq!(
            Value::Object(removed),
            serde_json::json!({"one": 1, "two": "2"})
        );
        assert_eq!(provider.ns_length("ns").unwrap(), 0);
    }

    #[test]
    fn move_batch_renames_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = open_provider(&dir);
        provider.insert_item("ns", "old", serde_json::json!(5)).unwrap();
        provider
            .move_batch("ns", vec!["old".into()], vec!["new".into()])
            .unwrap();
        assert!(provider.get_item("ns", Some("old")).is_err());
        assert_eq!(
            provider.get_item("ns", Some("new")).unwrap(),
            serde_json::json!(5)
        );
    }

    #[test]
    fn namespace_scans() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = open_provider(&dir);
        for i in 0..5 {
            provider
                .insert_item("scan", &format!("key{i}"), serde_json::json!(i))
                .unwrap();
        }
        assert_eq!(provider.ns_length("scan").unwrap(), 5);
        assert_eq!(provider.ns_keys("scan").unwrap().len(), 5);
        let page = provider.ns_range("scan", 2, 2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].0, "key2");
        provider.clear_namespace("scan").unwrap();
        provider.drop_empty_namespace("scan").unwrap();
        assert!(!provider.namespaces().contains(&"scan".to_string()));
    }

    #[test]
    fn table_registration_and_migration() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = open_provider(&dir);
        let proto = "job_totals (instance TEXT PRIMARY KEY, total INTEGER NOT NULL)";
        provider
            .register_table(TableDefinition {
                name: "job_totals".into(),
                prototype: proto.into(),
                version: 1,
                migrate: Box::new(|prior, _conn| {
                    assert_eq!(prior, 0);
                    Ok(())
                }),
            })
            .unwrap();
        assert!(provider.tables().contains(&"job_totals".to_string()));

        // Version bump runs the migration with the stored version.
        provider
            .register_table(TableDefinition {
                name: "job_totals".into(),
                prototype: proto.into(),
                version: 2,
                migrate: Box::new(|prior, conn| {
                    assert_eq!(prior, 1);
                    conn.execute("ALTER TABLE job_totals ADD COLUMN longest REAL", [])
                        .map_err(ServerError::from)?;
                    Ok(())
                }),
            })
            .unwrap();

        // Mismatched declared name is rejected.
        assert!(provider
            .register_table(TableDefinition {
                name: "job_totals".into(),
                prototype: "other_table (x INT)".into(),
                version: 3,
                migrate: Box::new(|_, _| Ok(())),
            })
            .is_err());
    }

    #[test]
    fn reserved_tables_cannot_be_registered() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = open_provider(&dir);
        assert!(provider
            .register_table(TableDefinition {
                name: NAMESPACE_TABLE.into(),
                prototype: NAMESPACE_PROTO.into(),
                version: 2,
                migrate: Box::new(|_, _| Ok(())),
            })
            .is_err());
    }

    #[test]
    fn backup_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = open_provider(&dir);
        provider
            .insert_item("ns", "kept", serde_json::json!("value"))
            .unwrap();
        let bkp_path = dir.path().join("backups/snapshot.db");
        provider.backup(&bkp_path).unwrap();

        provider
            .insert_item("ns", "dropped", serde_json::json!(true))
            .unwrap();
        let (tables, namespaces) = provider.restore(&bkp_path).unwrap();
        assert!(tables.iter().any(|t| t == NAMESPACE_TABLE));
        assert!(namespaces.contains(&"ns".to_string()));
        assert!(provider.is_restored());

        // Restored databases refuse further maintenance until restart.
        assert!(provider.backup(&bkp_path).is_err());
        assert!(provider.compact().is_err());
        assert!(provider.restore(&bkp_path).is_err());
    }

    #[test]
    fn restore_refuses_foreign_databases() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = open_provider(&dir);
        let foreign = dir.path().join("foreign.db");
        let conn = Connection::open(&foreign).unwrap();
        conn.execute("CREATE TABLE misc (x INT)", []).unwrap();
        drop(conn);
        let err = provider.restore(&foreign).unwrap_err();
        assert!(err.message().contains("missing table"));
        assert!(!provider.is_restored());
    }

    #[test]
    fn sql_query_converts_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = open_provider(&dir);
        provider
            .insert_item("ns", "k", serde_json::json!({"v": 1}))
            .unwrap();
        let rows = provider
            .sql_query(
                "SELECT namespace, key, value FROM namespace_store WHERE namespace = ?1",
                vec![serde_json::json!("ns")],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["namespace"], serde_json::json!("ns"));
        assert_eq!(rows[0]["value"], serde_json::json!({"v": 1}));
    }
}
