//! redb table definitions for the Berth record store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Instance records keyed by `{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Pool hosts keyed by `{host_id}`.
pub const HOSTS: TableDefinition<&str, &[u8]> = TableDefinition::new("hosts");

/// Blueprints keyed by `{blueprint_id}`.
pub const BLUEPRINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("blueprints");

/// Provisioning logs keyed by `{instance_id}:{seq:010}` so a prefix scan
/// returns them in write order.
pub const INSTANCE_LOGS: TableDefinition<&str, &[u8]> = TableDefinition::new("instance_logs");

/// Advisory locks keyed by lock name.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");
