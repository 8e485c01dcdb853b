use redb::TableDefinition;

/// File records: uuid -> FileRecord (msgpack)
pub const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("files");

/// Owner index: owner_id -> msgpack Vec of file UUIDs
pub const OWNER_FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("owner_files");

/// Fingerprint index: "{owner_id}/{fingerprint}" -> msgpack Vec of file UUIDs.
/// Keys always carry the owner so lookups never cross tenants.
pub const OWNER_FINGERPRINTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("owner_fingerprints");

/// Plan assignments: owner_id -> plan name
pub const OWNER_PLANS: TableDefinition<&str, &str> = TableDefinition::new("owner_plans");

pub fn fingerprint_key(owner_id: &str, fingerprint: &str) -> String {
    format!("{owner_id}/{fingerprint}")
}
