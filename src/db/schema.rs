//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::HealthError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), HealthError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, HealthError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    ).map_err(|e| HealthError::Internal(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), HealthError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| HealthError::Internal(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| HealthError::Internal(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), HealthError> {
    conn.execute_batch(IDENTITY_SCHEMA)
        .map_err(|e| HealthError::Internal(format!("Failed to create identity tables: {}", e)))?;

    conn.execute_batch(RECORDS_SCHEMA)
        .map_err(|e| HealthError::Internal(format!("Failed to create record tables: {}", e)))?;

    conn.execute_batch(ACCESS_SCHEMA)
        .map_err(|e| HealthError::Internal(format!("Failed to create access tables: {}", e)))?;

    conn.execute_batch(LEDGER_SCHEMA)
        .map_err(|e| HealthError::Internal(format!("Failed to create ledger tables: {}", e)))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| HealthError::Internal(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

const IDENTITY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS principals (
    id TEXT PRIMARY KEY NOT NULL,
    wallet_key TEXT NOT NULL UNIQUE,
    role TEXT NOT NULL CHECK (role IN ('patient', 'researcher')),
    email TEXT,
    created_at TEXT NOT NULL
);
"#;

const RECORDS_SCHEMA: &str = r#"
-- Encrypted payload lives in the blob store, referenced by payload_pointer
CREATE TABLE IF NOT EXISTS health_records (
    id TEXT PRIMARY KEY NOT NULL,
    owner_id TEXT NOT NULL REFERENCES principals(id),
    data_hash TEXT NOT NULL,
    payload_pointer TEXT NOT NULL,
    metadata_pointer TEXT NOT NULL,
    data_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    consent_hash TEXT NOT NULL,

    -- Demographic facets used by researcher search
    age_group TEXT,
    gender TEXT,
    region TEXT,

    created_at TEXT NOT NULL
);

-- Consent versions; superseded rows stay with active = 0
CREATE TABLE IF NOT EXISTS consents (
    id TEXT PRIMARY KEY NOT NULL,
    record_id TEXT NOT NULL REFERENCES health_records(id),
    owner_id TEXT NOT NULL,
    consent_type TEXT NOT NULL,

    -- Capability set, one column per capability
    research_use INTEGER NOT NULL DEFAULT 0,
    commercial_use INTEGER NOT NULL DEFAULT 0,
    third_party_sharing INTEGER NOT NULL DEFAULT 0,
    anonymous_only INTEGER NOT NULL DEFAULT 0,

    expires_at TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);
"#;

const ACCESS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS access_requests (
    id TEXT PRIMARY KEY NOT NULL,
    requester_id TEXT NOT NULL REFERENCES principals(id),
    owner_id TEXT NOT NULL,
    record_id TEXT NOT NULL REFERENCES health_records(id),
    purpose TEXT NOT NULL,
    duration_days INTEGER,
    requested_fields_json TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'approved', 'rejected')),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Grants are immutable; expiry is evaluated at read time
CREATE TABLE IF NOT EXISTS access_policies (
    id TEXT PRIMARY KEY NOT NULL,
    request_id TEXT NOT NULL UNIQUE REFERENCES access_requests(id),
    record_id TEXT NOT NULL REFERENCES health_records(id),
    resource_type TEXT NOT NULL DEFAULT 'health_data',
    grantee_id TEXT NOT NULL,
    action TEXT NOT NULL DEFAULT 'read',
    granted_by TEXT NOT NULL,
    granted INTEGER NOT NULL DEFAULT 1,
    granted_at TEXT NOT NULL,
    expires_at TEXT,
    conditions_json TEXT NOT NULL DEFAULT '[]'
);
"#;

const LEDGER_SCHEMA: &str = r#"
-- Append-only; balances are always SUM(amount)
CREATE TABLE IF NOT EXISTS token_transactions (
    id TEXT PRIMARY KEY NOT NULL,
    principal_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    amount INTEGER NOT NULL,
    chain_reference TEXT NOT NULL,
    related_entity_id TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS notifications (
    id TEXT PRIMARY KEY NOT NULL,
    principal_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    message TEXT NOT NULL,
    related_id TEXT,
    is_read INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_records_owner ON health_records(owner_id);
CREATE INDEX IF NOT EXISTS idx_records_type ON health_records(data_type);

-- At most one active consent per record
CREATE UNIQUE INDEX IF NOT EXISTS idx_consents_one_active
    ON consents(record_id) WHERE active = 1;
CREATE INDEX IF NOT EXISTS idx_consents_record ON consents(record_id);

CREATE INDEX IF NOT EXISTS idx_requests_requester ON access_requests(requester_id);
CREATE INDEX IF NOT EXISTS idx_requests_owner ON access_requests(owner_id);

CREATE INDEX IF NOT EXISTS idx_policies_grantee ON access_policies(grantee_id, record_id);

CREATE INDEX IF NOT EXISTS idx_tokens_principal ON token_transactions(principal_id);
CREATE INDEX IF NOT EXISTS idx_notifications_principal ON notifications(principal_id, is_read);
"#;
