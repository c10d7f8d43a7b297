//! StateStore: redb-backed record persistence for Berth.
//!
//! Typed operations over instances, hosts, blueprints, provisioning logs
//! and advisory locks. Values are JSON-serialized into redb's `&[u8]`
//! columns. Both on-disk and in-memory backends are supported (the latter
//! for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe record store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [INSTANCES, HOSTS, BLUEPRINTS, INSTANCE_LOGS, LOCKS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn get_record<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn list_records<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let end = prefix_end(prefix);
        let range = match &end {
            Some(end) => table.range(prefix..end.as_str()),
            None => table.range(prefix..),
        }
        .map_err(map_err!(Read))?;
        let mut results = Vec::new();
        for entry in range {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    fn put_record<T: Serialize>(&self, table: Table, key: &str, record: &T) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Write `record` only if no record exists under `key`.
    fn insert_new<T: Serialize>(&self, table: Table, key: &str, record: &T) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            if table.get(key).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(key.to_string()));
            }
            table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Compare-and-swap: write `record` at `expected + 1` if the stored
    /// version still equals `expected`.
    fn cas_record<T, F>(
        &self,
        table: Table,
        key: &str,
        expected: u64,
        record: &T,
        version_of: F,
    ) -> StateResult<()>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&T) -> u64,
    {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            let stored: Option<T> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            let Some(stored) = stored else {
                return Err(StateError::NotFound(key.to_string()));
            };
            let found = version_of(&stored);
            if found != expected {
                return Err(StateError::Conflict {
                    key: key.to_string(),
                    expected,
                    found,
                });
            }
            table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn remove_record(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert a new instance record. Fails if the id is taken.
    pub fn insert_instance(&self, instance: &Instance) -> StateResult<()> {
        self.insert_new(INSTANCES, &instance.id, instance)?;
        debug!(instance_id = %instance.id, state = %instance.state, "instance stored");
        Ok(())
    }

    pub fn get_instance(&self, id: &str) -> StateResult<Option<Instance>> {
        self.get_record(INSTANCES, id)
    }

    /// Like [`get_instance`](Self::get_instance) but a missing record is an error.
    pub fn require_instance(&self, id: &str) -> StateResult<Instance> {
        self.get_instance(id)?
            .ok_or_else(|| StateError::NotFound(format!("instance {id}")))
    }

    /// List instances matching `filter`, oldest first.
    pub fn list_instances(&self, filter: &InstanceFilter) -> StateResult<Vec<Instance>> {
        let mut instances: Vec<Instance> = self
            .list_records(INSTANCES, "")?
            .into_iter()
            .filter(|inst| filter.matches(inst))
            .collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(instances)
    }

    /// Store `instance` if the stored version equals `instance.version`.
    ///
    /// Returns the record as written, with its version bumped.
    pub fn cas_instance(&self, instance: &Instance) -> StateResult<Instance> {
        let expected = instance.version;
        let mut next = instance.clone();
        next.version = expected + 1;
        self.cas_record(INSTANCES, &instance.id, expected, &next, |i: &Instance| {
            i.version
        })?;
        Ok(next)
    }

    // ── Hosts ──────────────────────────────────────────────────────

    pub fn insert_host(&self, host: &Host) -> StateResult<()> {
        self.insert_new(HOSTS, &host.id, host)?;
        debug!(host = %host.id, state = %host.state, "host stored");
        Ok(())
    }

    pub fn get_host(&self, id: &str) -> StateResult<Option<Host>> {
        self.get_record(HOSTS, id)
    }

    /// List all hosts, oldest first.
    pub fn list_hosts(&self) -> StateResult<Vec<Host>> {
        let mut hosts: Vec<Host> = self.list_records(HOSTS, "")?;
        hosts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(hosts)
    }

    /// Store `host` if the stored version equals `host.version`.
    pub fn cas_host(&self, host: &Host) -> StateResult<Host> {
        let expected = host.version;
        let mut next = host.clone();
        next.version = expected + 1;
        self.cas_record(HOSTS, &host.id, expected, &next, |h: &Host| h.version)?;
        Ok(next)
    }

    /// Delete a host record. Returns true if it existed.
    pub fn delete_host(&self, id: &str) -> StateResult<bool> {
        let existed = self.remove_record(HOSTS, id)?;
        debug!(host = %id, existed, "host deleted");
        Ok(existed)
    }

    // ── Blueprints ─────────────────────────────────────────────────

    /// Insert or update a blueprint.
    pub fn put_blueprint(&self, blueprint: &Blueprint) -> StateResult<()> {
        self.put_record(BLUEPRINTS, &blueprint.id, blueprint)?;
        debug!(blueprint = %blueprint.id, "blueprint stored");
        Ok(())
    }

    pub fn get_blueprint(&self, id: &str) -> StateResult<Option<Blueprint>> {
        self.get_record(BLUEPRINTS, id)
    }

    pub fn list_blueprints(&self) -> StateResult<Vec<Blueprint>> {
        self.list_records(BLUEPRINTS, "")
    }

    pub fn delete_blueprint(&self, id: &str) -> StateResult<bool> {
        self.remove_record(BLUEPRINTS, id)
    }

    // ── Provisioning logs ──────────────────────────────────────────

    /// Append a log line for an instance and return its sequence number.
    pub fn append_log(
        &self,
        instance_id: &str,
        log_type: LogType,
        level: LogLevel,
        timestamp: u64,
        message: &str,
    ) -> StateResult<u64> {
        let prefix = format!("{instance_id}:");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let seq;
        {
            let mut table = txn.open_table(INSTANCE_LOGS).map_err(map_err!(Table))?;
            let end = prefix_end(&prefix).unwrap_or_default();
            let last = table
                .range(prefix.as_str()..end.as_str())
                .map_err(map_err!(Read))?
                .next_back()
                .transpose()
                .map_err(map_err!(Read))?
                .map(|(key, _)| key.value().to_string());
            let next = match last {
                Some(key) => {
                    let n = key[prefix.len()..].parse::<u64>().map_err(|e| {
                        StateError::Deserialize(format!("log key {key}: {e}"))
                    })?;
                    n + 1
                }
                None => 0,
            };
            seq = next;
            let record = InstanceLog {
                instance_id: instance_id.to_string(),
                seq,
                log_type,
                level,
                timestamp,
                message: message.to_string(),
            };
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            let key = format!("{prefix}{seq:010}");
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(seq)
    }

    /// All log lines for an instance in write order.
    pub fn list_logs(&self, instance_id: &str) -> StateResult<Vec<InstanceLog>> {
        self.list_records(INSTANCE_LOGS, &format!("{instance_id}:"))
    }

    // ── Advisory locks ─────────────────────────────────────────────

    /// Take lock `name` for `holder` until `now + ttl_secs`.
    ///
    /// Succeeds if the lock is free, expired, or already held by `holder`
    /// (which renews it).
    pub fn try_lock(&self, name: &str, holder: &str, ttl_secs: u64, now: u64) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let acquired;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let current: Option<LockRecord> = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            acquired = match current {
                Some(lock) => lock.holder == holder || lock.expires_at <= now,
                None => true,
            };
            if acquired {
                let record = LockRecord {
                    holder: holder.to_string(),
                    expires_at: now + ttl_secs,
                };
                let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                table.insert(name, value.as_slice()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(acquired)
    }

    /// Release lock `name` if `holder` owns it. Returns true if released.
    pub fn unlock(&self, name: &str, holder: &str) -> StateResult<bool> {
        let Some(lock) = self.get_record::<LockRecord>(LOCKS, name)? else {
            return Ok(false);
        };
        if lock.holder != holder {
            return Ok(false);
        }
        self.remove_record(LOCKS, name)
    }
}

/// Smallest key greater than every key starting with `prefix`, or `None`
/// when the prefix is empty and the scan is unbounded.
fn prefix_end(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(next) = char::from_u32(last as u32 + 1) {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}
