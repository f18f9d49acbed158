//! redb table definitions for the InferGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Tenants keyed by `{tenant_id}`.
pub const TENANTS: TableDefinition<&str, &[u8]> = TableDefinition::new("tenants");

/// API keys keyed by the hex SHA-256 of the raw key.
pub const API_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("api_keys");

/// Nodes keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Capacity reservations keyed by `{tenant_id}`.
pub const RESERVATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("reservations");

/// Sealed credentials keyed by `{tenant_id}/{provider}`.
pub const CREDENTIALS: TableDefinition<&str, &[u8]> = TableDefinition::new("credentials");

/// Desired fleet shapes keyed by `{tenant_id}/{model}`.
pub const FLEET_SPECS: TableDefinition<&str, &[u8]> = TableDefinition::new("fleet_specs");

/// Hourly usage keyed by `{tenant_id}:{hour}`.
pub const USAGE: TableDefinition<&str, &[u8]> = TableDefinition::new("usage");
