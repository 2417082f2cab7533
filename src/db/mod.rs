//! SQLite database module for the consent-gated exchange
//!
//! Encrypted payloads live in the blob store; this database holds everything
//! with invariants: record metadata, consent versions, the access request
//! state machine, the grants it produces, the reward ledger and notifications.
//!
//! ## Tables
//!
//! - `principals` - Patients and researchers keyed by wallet
//! - `health_records` - Record metadata and blob pointers
//! - `consents` - Consent versions, at most one active per record
//! - `access_requests` - Researcher requests (`pending` → `approved`|`rejected`)
//! - `access_policies` - Time-bound read grants created on approval
//! - `token_transactions` - Append-only reward ledger
//! - `notifications` - Per-principal inbox
//!
//! Repository functions take `&Connection` so they compose inside a
//! caller-owned `Transaction` (which derefs to `Connection`).

pub mod schema;
pub mod principals;
pub mod records;
pub mod consents;
pub mod access_requests;
pub mod access_policies;
pub mod token_transactions;
pub mod notifications;

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::HealthError;

/// Database file name inside the storage directory
pub const DB_FILE_NAME: &str = "healthshare.db";

/// SQLite database shared by all services
pub struct HealthDb {
    conn: Mutex<Connection>,
}

impl HealthDb {
    /// Open or create the database
    pub fn open(storage_dir: &Path) -> Result<Self, HealthError> {
        let db_path = storage_dir.join(DB_FILE_NAME);
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(&db_path)
            .map_err(|e| HealthError::Internal(format!("Failed to open SQLite: {}", e)))?;

        // WAL for concurrent readers; foreign keys are off by default in SQLite
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )
        .map_err(|e| HealthError::Internal(format!("Failed to set PRAGMA: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, HealthError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()
            .map_err(|e| HealthError::Internal(format!("Failed to open in-memory SQLite: {}", e)))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| HealthError::Internal(format!("Failed to set PRAGMA: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<(), HealthError> {
        let conn = self.conn.lock()
            .map_err(|e| HealthError::Internal(format!("Lock poisoned: {}", e)))?;

        schema::init_schema(&conn)
    }

    /// Run a read operation
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, HealthError>
    where
        F: FnOnce(&Connection) -> Result<T, HealthError>,
    {
        let conn = self.conn.lock()
            .map_err(|e| HealthError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access (for transactions)
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, HealthError>
    where
        F: FnOnce(&mut Connection) -> Result<T, HealthError>,
    {
        let mut conn = self.conn.lock()
            .map_err(|e| HealthError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Run `f` inside one transaction; commits on `Ok`, rolls back on `Err`
    pub fn transaction<F, T>(&self, f: F) -> Result<T, HealthError>
    where
        F: FnOnce(&Connection) -> Result<T, HealthError>,
    {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()
                .map_err(|e| HealthError::Internal(format!("Transaction failed: {}", e)))?;
            let value = f(&tx)?;
            tx.commit()
                .map_err(|e| HealthError::Internal(format!("Commit failed: {}", e)))?;
            Ok(value)
        })
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, HealthError> {
        self.with_conn(|conn| {
            let count = |table: &str| -> Result<u64, HealthError> {
                let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
                Ok(n as u64)
            };

            Ok(DbStats {
                principals: count("principals")?,
                health_records: count("health_records")?,
                active_consents: {
                    let n: i64 = conn.query_row(
                        "SELECT COUNT(*) FROM consents WHERE active = 1",
                        [],
                        |row| row.get(0),
                    )?;
                    n as u64
                },
                access_requests: count("access_requests")?,
                access_policies: count("access_policies")?,
                token_transactions: count("token_transactions")?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbStats {
    pub principals: u64,
    pub health_records: u64,
    pub active_consents: u64,
    pub access_requests: u64,
    pub access_policies: u64,
    pub token_transactions: u64,
}

/// Fixed-width RFC 3339 timestamp so lexical order in SQL matches time order
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time as a stored timestamp
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Parse a stored timestamp
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, HealthError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| HealthError::Validation(format!("invalid timestamp '{}': {}", value, e)))
}

/// Decode a JSON string-array column
pub(crate) fn json_string_list(value: String) -> Result<Vec<String>, rusqlite::Error> {
    serde_json::from_str(&value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = Utc::now();
        let later = earlier + Duration::milliseconds(1);
        assert!(format_timestamp(earlier) < format_timestamp(later));
        assert_eq!(format_timestamp(earlier).len(), format_timestamp(later).len());
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let ts = now_timestamp();
        let parsed = parse_timestamp(&ts).unwrap();
        assert_eq!(format_timestamp(parsed), ts);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_open_in_memory_and_stats() {
        let db = HealthDb::open_in_memory().unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.health_records, 0);
        assert_eq!(stats.active_consents, 0);
    }

    #[test]
    fn test_open_on_disk_reopens_schema() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let db = HealthDb::open(dir.path()).unwrap();
            db.stats().unwrap();
        }
        let db = HealthDb::open(dir.path()).unwrap();
        assert_eq!(db.stats().unwrap().principals, 0);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = HealthDb::open_in_memory().unwrap();
        let result: Result<(), HealthError> = db.transaction(|tx| {
            principals::insert_principal(tx, "0xabc", principals::Role::Patient, None)?;
            Err(HealthError::Internal("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(db.stats().unwrap().principals, 0);
    }
}
