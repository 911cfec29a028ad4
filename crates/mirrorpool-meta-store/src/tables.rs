//! Redb table definitions for persistent metadata storage.

use redb::TableDefinition;

// Key: object id (uuid string), Value: bincode-encoded ObjectMetadata
pub const OBJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("objects");

// Key: account id, Value: used quota bytes
pub const ACCOUNT_USAGE: TableDefinition<&str, u64> = TableDefinition::new("account_usage");
