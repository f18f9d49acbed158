//! Domain types for the InferGrid state store.
//!
//! Tenants, API keys, nodes, capacity reservations, sealed credentials,
//! desired fleet shapes and usage buckets. All types are serializable to
//! JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Unique identifier for a tenant.
pub type TenantId = String;

/// Unique identifier for a compute node.
pub type NodeId = String;

// ── Tenant ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    /// "production", "staging", ...
    pub environment: String,
    pub created_at: u64,
}

// ── API keys ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyStatus {
    Active,
    Revoked,
}

/// A caller credential. Only the SHA-256 hash of the raw key is stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiKey {
    pub id: String,
    pub key_hash: String,
    /// First characters of the raw key, for display.
    pub prefix: String,
    pub tenant_id: TenantId,
    pub environment: String,
    /// Requests per second allowed for this key.
    pub rate_limit: u32,
    pub status: ApiKeyStatus,
    pub created_at: u64,
    pub revoked_at: Option<u64>,
}

impl ApiKey {
    /// Hex-encoded SHA-256 of a raw key, used as the table key.
    pub fn hash(raw: &str) -> String {
        hex::encode(Sha256::digest(raw.as_bytes()))
    }

    pub fn is_active(&self) -> bool {
        self.status == ApiKeyStatus::Active
    }
}

// ── Nodes ──────────────────────────────────────────────────────────

/// Lifecycle of a compute node.
///
/// ```text
/// Requested → Provisioning → Booting → Healthy ⇄ Degraded → Draining → Terminated
///                  └────────────┴──→ Failed
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Requested,
    Provisioning,
    Booting,
    Healthy,
    Degraded,
    Draining,
    Terminated,
    Failed,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Terminated | NodeStatus::Failed)
    }

    /// States that count towards a fleet's size (launched or launching).
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != NodeStatus::Draining
    }

    /// Whether `self → to` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, to: NodeStatus) -> bool {
        use NodeStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (Requested, Provisioning) => true,
            (Provisioning, Booting) => true,
            (Booting, Healthy) => true,
            (Healthy, Degraded) => true,
            (Degraded, Healthy) => true,
            (Healthy | Degraded, Draining) => true,
            (Draining, Terminated) => true,
            // Cancelling a launch that never acquired a resource.
            (Requested | Provisioning | Booting, Terminated) => true,
            (_, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Requested => "requested",
            NodeStatus::Provisioning => "provisioning",
            NodeStatus::Booting => "booting",
            NodeStatus::Healthy => "healthy",
            NodeStatus::Degraded => "degraded",
            NodeStatus::Draining => "draining",
            NodeStatus::Terminated => "terminated",
            NodeStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provisioned (or to-be-provisioned) GPU compute node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub tenant_id: TenantId,
    pub provider: String,
    pub region: String,
    pub model: String,
    pub instance_type: String,
    /// Provider-side instance id, set once the resource is acquired.
    pub instance_id: Option<String>,
    /// Base URL of the node's serving runtime.
    pub endpoint: Option<String>,
    /// USD per hour.
    pub spot_price: f64,
    pub status: NodeStatus,
    pub last_heartbeat: Option<u64>,
    pub health_score: f64,
    pub queue_depth: u32,
    pub active_requests: u32,
    /// Set when the runtime health probe has succeeded at least once.
    pub probe_passed: bool,
    pub created_at: u64,
    pub updated_at: u64,
    /// When `status` last changed.
    pub status_since: u64,
}

impl Node {
    /// A freshly requested node with no resource behind it yet.
    pub fn requested(
        id: impl Into<NodeId>,
        tenant_id: impl Into<TenantId>,
        model: impl Into<String>,
        provider: impl Into<String>,
        region: impl Into<String>,
        now: u64,
    ) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            provider: provider.into(),
            region: region.into(),
            model: model.into(),
            instance_type: String::new(),
            instance_id: None,
            endpoint: None,
            spot_price: 0.0,
            status: NodeStatus::Requested,
            last_heartbeat: None,
            health_score: 0.0,
            queue_depth: 0,
            active_requests: 0,
            probe_passed: false,
            created_at: now,
            updated_at: now,
            status_since: now,
        }
    }

    pub fn heartbeat_age(&self, now: u64) -> Option<u64> {
        self.last_heartbeat.map(|t| now.saturating_sub(t))
    }
}

// ── Capacity ───────────────────────────────────────────────────────

/// A tenant's committed throughput. One row per tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityReservation {
    pub tenant_id: TenantId,
    pub tokens_per_second: u64,
    pub updated_at: u64,
}

// ── Requests ───────────────────────────────────────────────────────

/// One inbound inference call, scoped to a single routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceRequest {
    pub tenant_id: TenantId,
    pub model: String,
    pub region: Option<String>,
    /// Prompt size in tokens.
    pub prompt_tokens: u64,
}

// ── Credentials ────────────────────────────────────────────────────

/// Sealed cloud credentials: `nonce || ciphertext || tag`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncryptedCredentialRecord {
    pub tenant_id: TenantId,
    pub provider: String,
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
    pub key_id: String,
    pub created_at: u64,
    pub updated_at: u64,
}

impl EncryptedCredentialRecord {
    /// Composite key: `{tenant_id}/{provider}`.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.tenant_id, self.provider)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

// ── Fleet ──────────────────────────────────────────────────────────

/// Target fleet shape for one (tenant, model) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesiredFleetSpec {
    pub tenant_id: TenantId,
    pub model: String,
    pub min_nodes: u32,
    pub max_nodes: u32,
    /// Preferred providers, in order. New nodes cycle through them.
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub instance_type: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl DesiredFleetSpec {
    /// Composite key: `{tenant_id}/{model}`.
    pub fn table_key(&self) -> String {
        fleet_key(&self.tenant_id, &self.model)
    }
}

pub fn fleet_key(tenant_id: &str, model: &str) -> String {
    format!("{tenant_id}/{model}")
}

// ── Usage ──────────────────────────────────────────────────────────

/// Hourly usage aggregate for a tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageBucket {
    pub tenant_id: TenantId,
    /// Start of the hour, epoch seconds.
    pub hour: u64,
    pub tokens: u64,
    pub requests: u64,
    /// Cost in millionths of a dollar.
    pub cost_micros: u64,
}

impl UsageBucket {
    /// Composite key: `{tenant_id}:{hour}`, zero-padded so keys sort by time.
    pub fn table_key(&self) -> String {
        usage_key(&self.tenant_id, self.hour)
    }

    pub fn cost(&self) -> f64 {
        self.cost_micros as f64 / 1_000_000.0
    }
}

pub fn usage_key(tenant_id: &str, hour: u64) -> String {
    format!("{tenant_id}:{hour:012}")
}

/// Truncate an epoch timestamp to the start of its hour.
pub fn hour_of(epoch_secs: u64) -> u64 {
    epoch_secs - epoch_secs % 3600
}

#[cfg(test)]
mod tests {
    use super::*;
    use NodeStatus::*;

    #[test]
    fn lifecycle_edges() {
        assert!(Requested.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Booting));
        assert!(Booting.can_transition_to(Healthy));
        assert!(Healthy.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Healthy));
        assert!(Degraded.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Terminated));
        assert!(Provisioning.can_transition_to(Failed));
        assert!(Booting.can_transition_to(Failed));
    }

    #[test]
    fn illegal_edges_are_rejected() {
        assert!(!Requested.can_transition_to(Healthy));
        assert!(!Booting.can_transition_to(Degraded));
        assert!(!Healthy.can_transition_to(Provisioning));
        assert!(!Draining.can_transition_to(Healthy));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for to in [Requested, Provisioning, Booting, Healthy, Degraded, Draining, Terminated, Failed] {
            assert!(!Terminated.can_transition_to(to));
            assert!(!Failed.can_transition_to(to));
        }
    }

    #[test]
    fn api_key_hash_is_stable_hex() {
        let a = ApiKey::hash("sk-test");
        assert_eq!(a, ApiKey::hash("sk-test"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, ApiKey::hash("sk-other"));
    }

    #[test]
    fn ciphertext_serializes_as_hex() {
        let record = EncryptedCredentialRecord {
            tenant_id: "t1".to_string(),
            provider: "aws".to_string(),
            ciphertext: vec![0xde, 0xad, 0xbe, 0xef],
            key_id: "v1".to_string(),
            created_at: 1,
            updated_at: 1,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["ciphertext"], "deadbeef");
        let back: EncryptedCredentialRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn hour_truncation() {
        assert_eq!(hour_of(7_200), 7_200);
        assert_eq!(hour_of(7_199), 3_600);
        assert_eq!(usage_key("t", 3_600), "t:000000003600");
    }
}
