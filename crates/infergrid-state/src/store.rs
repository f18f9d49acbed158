//! StateStore: redb-backed persistence for InferGrid.
//!
//! Typed operations over tenants, API keys, nodes, reservations, sealed
//! credentials, fleet specs and usage buckets. Values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

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

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
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
        for table in [TENANTS, API_KEYS, NODES, RESERVATIONS, CREDENTIALS, FLEET_SPECS, USAGE] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix` (empty prefix = whole table),
    /// in key order.
    fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
            }
        }
        Ok(results)
    }

    fn delete(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Tenants ────────────────────────────────────────────────────

    pub fn put_tenant(&self, tenant: &Tenant) -> StateResult<()> {
        self.put(TENANTS, &tenant.id, tenant)
    }

    pub fn get_tenant(&self, tenant_id: &str) -> StateResult<Option<Tenant>> {
        self.get(TENANTS, tenant_id)
    }

    pub fn list_tenants(&self) -> StateResult<Vec<Tenant>> {
        self.scan(TENANTS, "")
    }

    // ── API keys ───────────────────────────────────────────────────

    pub fn put_api_key(&self, key: &ApiKey) -> StateResult<()> {
        self.put(API_KEYS, &key.key_hash, key)?;
        debug!(key_id = %key.id, tenant = %key.tenant_id, status = ?key.status, "api key stored");
        Ok(())
    }

    /// Look up a key by the hash of its raw value.
    pub fn get_api_key_by_hash(&self, key_hash: &str) -> StateResult<Option<ApiKey>> {
        self.get(API_KEYS, key_hash)
    }

    pub fn find_api_key(&self, key_id: &str) -> StateResult<Option<ApiKey>> {
        Ok(self
            .scan::<ApiKey>(API_KEYS, "")?
            .into_iter()
            .find(|k| k.id == key_id))
    }

    pub fn list_api_keys_for_tenant(&self, tenant_id: &str) -> StateResult<Vec<ApiKey>> {
        let mut keys: Vec<ApiKey> = self
            .scan::<ApiKey>(API_KEYS, "")?
            .into_iter()
            .filter(|k| k.tenant_id == tenant_id)
            .collect();
        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub fn put_node(&self, node: &Node) -> StateResult<()> {
        self.put(NODES, &node.id, node)
    }

    pub fn get_node(&self, node_id: &str) -> StateResult<Option<Node>> {
        self.get(NODES, node_id)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        self.scan(NODES, "")
    }

    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        self.delete(NODES, node_id)
    }

    // ── Reservations ───────────────────────────────────────────────

    pub fn put_reservation(&self, reservation: &CapacityReservation) -> StateResult<()> {
        self.put(RESERVATIONS, &reservation.tenant_id, reservation)
    }

    pub fn get_reservation(&self, tenant_id: &str) -> StateResult<Option<CapacityReservation>> {
        self.get(RESERVATIONS, tenant_id)
    }

    pub fn list_reservations(&self) -> StateResult<Vec<CapacityReservation>> {
        self.scan(RESERVATIONS, "")
    }

    // ── Credentials ────────────────────────────────────────────────

    pub fn put_credential(&self, record: &EncryptedCredentialRecord) -> StateResult<()> {
        self.put(CREDENTIALS, &record.table_key(), record)
    }

    /// Replace a batch of records in a single transaction.
    pub fn put_credentials(&self, records: &[EncryptedCredentialRecord]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(CREDENTIALS).map_err(map_err!(Table))?;
            for record in records {
                let bytes = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
                t.insert(record.table_key().as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = records.len(), "credential batch stored");
        Ok(())
    }

    pub fn get_credential(
        &self,
        tenant_id: &str,
        provider: &str,
    ) -> StateResult<Option<EncryptedCredentialRecord>> {
        self.get(CREDENTIALS, &format!("{tenant_id}/{provider}"))
    }

    pub fn list_credentials(&self) -> StateResult<Vec<EncryptedCredentialRecord>> {
        self.scan(CREDENTIALS, "")
    }

    pub fn list_credentials_for_tenant(
        &self,
        tenant_id: &str,
    ) -> StateResult<Vec<EncryptedCredentialRecord>> {
        self.scan(CREDENTIALS, &format!("{tenant_id}/"))
    }

    // ── Fleet specs ────────────────────────────────────────────────

    pub fn put_fleet_spec(&self, spec: &DesiredFleetSpec) -> StateResult<()> {
        self.put(FLEET_SPECS, &spec.table_key(), spec)
    }

    pub fn get_fleet_spec(&self, tenant_id: &str, model: &str) -> StateResult<Option<DesiredFleetSpec>> {
        self.get(FLEET_SPECS, &fleet_key(tenant_id, model))
    }

    pub fn list_fleet_specs(&self) -> StateResult<Vec<DesiredFleetSpec>> {
        self.scan(FLEET_SPECS, "")
    }

    pub fn delete_fleet_spec(&self, tenant_id: &str, model: &str) -> StateResult<bool> {
        self.delete(FLEET_SPECS, &fleet_key(tenant_id, model))
    }

    // ── Usage ──────────────────────────────────────────────────────

    /// Add to the tenant's bucket for `hour`, creating it if needed.
    pub fn record_usage(
        &self,
        tenant_id: &str,
        hour: u64,
        tokens: u64,
        cost_micros: u64,
    ) -> StateResult<UsageBucket> {
        let key = usage_key(tenant_id, hour);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let bucket;
        {
            let mut t = txn.open_table(USAGE).map_err(map_err!(Table))?;
            let existing = t
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let mut current = match existing {
                Some(bytes) => serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?,
                None => UsageBucket {
                    tenant_id: tenant_id.to_string(),
                    hour,
                    tokens: 0,
                    requests: 0,
                    cost_micros: 0,
                },
            };
            current.tokens += tokens;
            current.requests += 1;
            current.cost_micros += cost_micros;
            let bytes = serde_json::to_vec(&current).map_err(map_err!(Serialize))?;
            t.insert(key.as_str(), bytes.as_slice()).map_err(map_err!(Write))?;
            bucket = current;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(bucket)
    }

    /// A tenant's hourly buckets, oldest first.
    pub fn list_usage(&self, tenant_id: &str) -> StateResult<Vec<UsageBucket>> {
        self.scan(USAGE, &format!("{tenant_id}:"))
    }
}
