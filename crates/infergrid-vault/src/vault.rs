//! Key ring and credential service.
//!
//! The [`Vault`] holds one active key (used for every new seal) plus any
//! number of decrypt-only keys, each addressed by its versioned id. Records
//! carry the id of the key that sealed them, so a staged rollout can add a
//! new active key while old records stay readable until they are rotated.

use std::collections::HashMap;
use std::sync::Arc;

use infergrid_core::VaultSettings;
use infergrid_state::{EncryptedCredentialRecord, StateStore};
use parking_lot::RwLock;
use ring::rand::SystemRandom;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cipher::VaultKey;
use crate::error::{VaultError, VaultResult};
use crate::providers::ProviderCredentials;

struct KeyRing {
    active: Arc<VaultKey>,
    keys: HashMap<String, Arc<VaultKey>>,
}

pub struct Vault {
    ring: RwLock<KeyRing>,
    rng: SystemRandom,
}

impl Vault {
    pub fn new(active: VaultKey) -> Self {
        let active = Arc::new(active);
        let mut keys = HashMap::new();
        keys.insert(active.id().to_string(), active.clone());
        Self {
            ring: RwLock::new(KeyRing { active, keys }),
            rng: SystemRandom::new(),
        }
    }

    /// Derive the active key and every retired key named in the settings.
    pub fn from_settings(settings: &VaultSettings) -> VaultResult<Self> {
        let salt = settings.salt.as_bytes();
        let active = VaultKey::derive(&settings.key_id, &settings.master_secret, salt, settings.iterations)?;
        let vault = Self::new(active);
        for retired in &settings.retired_keys {
            let key = VaultKey::derive(&retired.key_id, &retired.master_secret, salt, settings.iterations)?;
            vault.install(key);
        }
        Ok(vault)
    }

    /// Register a decrypt-only key.
    pub fn install(&self, key: VaultKey) {
        let mut ring = self.ring.write();
        debug!(key_id = %key.id(), "vault key installed");
        ring.keys.insert(key.id().to_string(), Arc::new(key));
    }

    /// Make `key` the sealing key. The previous active key stays available
    /// for decryption.
    pub fn activate(&self, key: VaultKey) {
        let key = Arc::new(key);
        let mut ring = self.ring.write();
        info!(from = %ring.active.id(), to = %key.id(), "vault active key changed");
        ring.keys.insert(key.id().to_string(), key.clone());
        ring.active = key;
    }

    pub fn active_key_id(&self) -> String {
        self.ring.read().active.id().to_string()
    }

    fn active(&self) -> Arc<VaultKey> {
        self.ring.read().active.clone()
    }

    fn key(&self, key_id: &str) -> VaultResult<Arc<VaultKey>> {
        self.ring
            .read()
            .keys
            .get(key_id)
            .cloned()
            .ok_or_else(|| VaultError::UnknownKey(key_id.to_string()))
    }

    /// Validate and seal credentials for `tenant_id` under the active key.
    pub fn encrypt(
        &self,
        tenant_id: &str,
        provider: &str,
        credentials: Value,
        now: u64,
    ) -> VaultResult<EncryptedCredentialRecord> {
        let creds = ProviderCredentials::parse(provider, credentials)?;
        let key = self.active();
        let ciphertext = key.encrypt(&self.rng, &creds)?;
        debug!(tenant = %tenant_id, %provider, key_id = %key.id(), "credentials sealed");
        Ok(EncryptedCredentialRecord {
            tenant_id: tenant_id.to_string(),
            provider: creds.provider().as_str().to_string(),
            ciphertext,
            key_id: key.id().to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Open a record with the key that sealed it.
    pub fn decrypt(&self, record: &EncryptedCredentialRecord) -> VaultResult<ProviderCredentials> {
        let key = self.key(&record.key_id)?;
        key.decrypt(&record.ciphertext).inspect_err(|e| {
            warn!(tenant = %record.tenant_id, provider = %record.provider, key_id = %record.key_id, error = %e, "credential decrypt failed");
        })
    }

    /// Re-seal a record under the active key. Records already on the active
    /// key are returned unchanged.
    pub fn rotate(&self, record: &EncryptedCredentialRecord, now: u64) -> VaultResult<EncryptedCredentialRecord> {
        let new = self.active();
        if record.key_id == new.id() {
            return Ok(record.clone());
        }
        let old = self.key(&record.key_id)?;
        let ciphertext = crate::cipher::rotate_key(&old, &new, &record.ciphertext)?;
        Ok(EncryptedCredentialRecord {
            ciphertext,
            key_id: new.id().to_string(),
            updated_at: now,
            ..record.clone()
        })
    }
}

/// What the admin API may reveal about a stored credential.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CredentialMetadata {
    pub tenant_id: String,
    pub provider: String,
    pub key_id: String,
    pub created_at: u64,
    pub updated_at: u64,
}

impl From<&EncryptedCredentialRecord> for CredentialMetadata {
    fn from(r: &EncryptedCredentialRecord) -> Self {
        Self {
            tenant_id: r.tenant_id.clone(),
            provider: r.provider.clone(),
            key_id: r.key_id.clone(),
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/// Result of a bulk rotation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RotationReport {
    pub key_id: String,
    pub rotated: usize,
    pub unchanged: usize,
}

/// Vault plus persistence: the only path by which credentials reach the store.
#[derive(Clone)]
pub struct CredentialService {
    vault: Arc<Vault>,
    store: StateStore,
}

impl CredentialService {
    pub fn new(vault: Arc<Vault>, store: StateStore) -> Self {
        Self { vault, store }
    }

    pub fn vault(&self) -> &Arc<Vault> {
        &self.vault
    }

    /// Validate, seal and store. Replaces any previous record for the same
    /// (tenant, provider), keeping its creation time.
    pub fn submit(
        &self,
        tenant_id: &str,
        provider: &str,
        credentials: Value,
        now: u64,
    ) -> VaultResult<CredentialMetadata> {
        let mut record = self.vault.encrypt(tenant_id, provider, credentials, now)?;
        if let Some(previous) = self.store.get_credential(tenant_id, &record.provider)? {
            record.created_at = previous.created_at;
        }
        self.store.put_credential(&record)?;
        info!(tenant = %tenant_id, provider = %record.provider, key_id = %record.key_id, "credentials stored");
        Ok(CredentialMetadata::from(&record))
    }

    pub fn list(&self, tenant_id: Option<&str>) -> VaultResult<Vec<CredentialMetadata>> {
        let records = match tenant_id {
            Some(t) => self.store.list_credentials_for_tenant(t)?,
            None => self.store.list_credentials()?,
        };
        Ok(records.iter().map(CredentialMetadata::from).collect())
    }

    /// Decrypted credentials for a provisioning call. Never persisted.
    pub fn load(&self, tenant_id: &str, provider: &str) -> VaultResult<Option<ProviderCredentials>> {
        match self.store.get_credential(tenant_id, provider)? {
            Some(record) => self.vault.decrypt(&record).map(Some),
            None => Ok(None),
        }
    }

    /// Install `new_key` as active and re-seal every stored record under it.
    /// All re-sealed records are written in one transaction; on any failure
    /// nothing is written and the error is returned.
    pub fn rotate_all(&self, new_key: VaultKey, now: u64) -> VaultResult<RotationReport> {
        let key_id = new_key.id().to_string();
        self.vault.activate(new_key);

        let records = self.store.list_credentials()?;
        let mut rotated = Vec::new();
        let mut unchanged = 0;
        for record in &records {
            if record.key_id == key_id {
                unchanged += 1;
                continue;
            }
            rotated.push(self.vault.rotate(record, now)?);
        }
        self.store.put_credentials(&rotated)?;
        info!(%key_id, rotated = rotated.len(), unchanged, "credential rotation complete");
        Ok(RotationReport {
            key_id,
            rotated: rotated.len(),
            unchanged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infergrid_core::RetiredKey;
    use serde_json::json;

    fn settings(key_id: &str, secret: &str) -> VaultSettings {
        VaultSettings {
            master_secret: secret.to_string(),
            key_id: key_id.to_string(),
            salt: "test-salt".to_string(),
            iterations: 1_000,
            retired_keys: Vec::new(),
        }
    }

    fn sample_for(provider: &str) -> Value {
        match provider {
            "aws" => json!({"access_key_id": "AKIA", "secret_access_key": "s", "session_token": "tok"}),
            "azure" => json!({"client_id": "c", "client_secret": "s", "tenant_id": "t", "subscription_id": "sub"}),
            "gcp" => json!({"project_id": "p", "service_account_json": {"type": "service_account", "private_key": "pk"}}),
            "lambda" => json!({"api_key": "lk"}),
            "runpod" => json!({"api_key": "rk", "endpoint": "https://api.runpod.io"}),
            "oci" => json!({"user_ocid": "u", "tenancy_ocid": "t", "fingerprint": "f", "private_key": "pk", "region": "r"}),
            "nebius" => json!({"api_key": "nk", "project_id": "np"}),
            other => panic!("no sample for {other}"),
        }
    }

    #[test]
    fn round_trip_every_provider() {
        let vault = Vault::from_settings(&settings("v1", "master")).unwrap();
        for provider in crate::Provider::ALL {
            let name = provider.as_str();
            let input = sample_for(name);
            let record = vault.encrypt("t1", name, input.clone(), 10).unwrap();
            assert_eq!(record.key_id, "v1");
            assert_eq!(record.provider, name);

            let expected = ProviderCredentials::parse(name, input).unwrap();
            assert_eq!(vault.decrypt(&record).unwrap(), expected, "{name}");
        }
    }

    #[test]
    fn invalid_credentials_are_never_sealed() {
        let vault = Vault::from_settings(&settings("v1", "master")).unwrap();
        let err = vault.encrypt("t1", "aws", json!({"access_key_id": "AKIA"}), 1).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn retired_keys_still_decrypt() {
        let old = Vault::from_settings(&settings("v1", "old")).unwrap();
        let record = old.encrypt("t1", "lambda", sample_for("lambda"), 1).unwrap();

        let mut s = settings("v2", "new");
        s.retired_keys.push(RetiredKey {
            key_id: "v1".to_string(),
            master_secret: "old".to_string(),
        });
        let vault = Vault::from_settings(&s).unwrap();
        assert_eq!(vault.active_key_id(), "v2");
        assert!(vault.decrypt(&record).is_ok());

        let rotated = vault.rotate(&record, 2).unwrap();
        assert_eq!(rotated.key_id, "v2");
        assert_eq!(rotated.created_at, 1);
        assert_eq!(rotated.updated_at, 2);
        assert!(vault.decrypt(&rotated).is_ok());
    }

    #[test]
    fn unknown_key_id_fails_closed() {
        let vault = Vault::from_settings(&settings("v1", "master")).unwrap();
        let mut record = vault.encrypt("t1", "runpod", sample_for("runpod"), 1).unwrap();
        record.key_id = "v9".to_string();
        assert!(matches!(vault.decrypt(&record), Err(VaultError::UnknownKey(_))));
    }

    #[test]
    fn service_stores_only_ciphertext_and_rotates() {
        let store = StateStore::open_in_memory().unwrap();
        let vault = Arc::new(Vault::from_settings(&settings("v1", "master")).unwrap());
        let service = CredentialService::new(vault, store.clone());

        service.submit("t1", "aws", sample_for("aws"), 5).unwrap();
        service.submit("t1", "gcp", sample_for("gcp"), 6).unwrap();
        service.submit("t2", "nebius", sample_for("nebius"), 7).unwrap();

        let raw = store.get_credential("t1", "aws").unwrap().unwrap();
        let stored = serde_json::to_string(&raw).unwrap();
        assert!(!stored.contains("AKIA"));

        assert_eq!(service.list(Some("t1")).unwrap().len(), 2);
        assert_eq!(service.list(None).unwrap().len(), 3);

        let new_key = VaultKey::derive("v2", "rotated", b"test-salt", 1_000).unwrap();
        let report = service.rotate_all(new_key, 100).unwrap();
        assert_eq!(report.rotated, 3);
        assert_eq!(report.unchanged, 0);

        for meta in service.list(None).unwrap() {
            assert_eq!(meta.key_id, "v2");
        }
        assert!(service.load("t1", "aws").unwrap().is_some());
        assert!(service.load("t1", "azure").unwrap().is_none());
    }

    #[test]
    fn resubmission_keeps_creation_time() {
        let store = StateStore::open_in_memory().unwrap();
        let vault = Arc::new(Vault::from_settings(&settings("v1", "master")).unwrap());
        let service = CredentialService::new(vault, store);

        service.submit("t1", "lambda", sample_for("lambda"), 5).unwrap();
        let meta = service.submit("t1", "lambda", json!({"api_key": "new"}), 9).unwrap();
        assert_eq!(meta.created_at, 5);
        assert_eq!(meta.updated_at, 9);
    }
}
