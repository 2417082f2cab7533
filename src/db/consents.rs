//! Consent versions
//!
//! A record has exactly one active consent once initialized. Changing consent
//! never edits a row: the active row is deactivated and a new one inserted,
//! and callers must run [`replace_active`] inside a transaction so no reader
//! sees zero or two active rows. The partial unique index
//! `idx_consents_one_active` backs this up at the storage level.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{now_timestamp, records};
use crate::error::HealthError;
use crate::permissions::ConsentPermissions;

/// Consent row from database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRecord {
    pub id: String,
    pub record_id: String,
    pub owner_id: String,
    pub consent_type: String,
    pub permissions: ConsentPermissions,
    pub expires_at: Option<String>,
    pub active: bool,
    pub created_at: String,
}

impl ConsentRecord {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            record_id: row.get("record_id")?,
            owner_id: row.get("owner_id")?,
            consent_type: row.get("consent_type")?,
            permissions: ConsentPermissions {
                research_use: row.get("research_use")?,
                commercial_use: row.get("commercial_use")?,
                third_party_sharing: row.get("third_party_sharing")?,
                anonymous_only: row.get("anonymous_only")?,
            },
            expires_at: row.get("expires_at")?,
            active: row.get("active")?,
            created_at: row.get("created_at")?,
        })
    }

    /// Whether the consent has lapsed at `now` (same timestamp format)
    pub fn is_expired(&self, now: &str) -> bool {
        matches!(self.expires_at.as_deref(), Some(expires) if expires <= now)
    }

    /// Active, unexpired and granting research use
    pub fn permits_research(&self, now: &str) -> bool {
        self.active && self.permissions.research_use && !self.is_expired(now)
    }
}

/// Insert a new active consent for a record
pub fn insert_consent(
    conn: &Connection,
    record_id: &str,
    owner_id: &str,
    consent_type: &str,
    permissions: ConsentPermissions,
    expires_at: Option<&str>,
) -> Result<ConsentRecord, HealthError> {
    let consent = ConsentRecord {
        id: Uuid::new_v4().to_string(),
        record_id: record_id.to_string(),
        owner_id: owner_id.to_string(),
        consent_type: consent_type.to_string(),
        permissions,
        expires_at: expires_at.map(str::to_string),
        active: true,
        created_at: now_timestamp(),
    };

    conn.execute(
        r#"
        INSERT INTO consents (
            id, record_id, owner_id, consent_type,
            research_use, commercial_use, third_party_sharing, anonymous_only,
            expires_at, active, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
        "#,
        params![
            consent.id,
            consent.record_id,
            consent.owner_id,
            consent.consent_type,
            consent.permissions.research_use,
            consent.permissions.commercial_use,
            consent.permissions.third_party_sharing,
            consent.permissions.anonymous_only,
            consent.expires_at,
            consent.created_at,
        ],
    )
    .map_err(|e| HealthError::Internal(format!("Consent insert failed: {}", e)))?;

    Ok(consent)
}

/// Current active consent for a record
pub fn get_active(conn: &Connection, record_id: &str) -> Result<Option<ConsentRecord>, HealthError> {
    conn.query_row(
        "SELECT * FROM consents WHERE record_id = ? AND active = 1",
        params![record_id],
        |row| ConsentRecord::from_row(row),
    )
    .optional()
    .map_err(HealthError::from)
}

/// Supersede the active consent. Run inside a transaction.
///
/// Fails with `Ownership` when `owner_id` does not own the record.
pub fn replace_active(
    conn: &Connection,
    record_id: &str,
    owner_id: &str,
    consent_type: &str,
    permissions: ConsentPermissions,
    expires_at: Option<&str>,
) -> Result<ConsentRecord, HealthError> {
    match records::resolve_owner(conn, record_id)? {
        Some(owner) if owner == owner_id => {}
        _ => return Err(HealthError::Ownership(record_id.to_string())),
    }

    conn.execute(
        "UPDATE consents SET active = 0 WHERE record_id = ? AND active = 1",
        params![record_id],
    )?;

    insert_consent(conn, record_id, owner_id, consent_type, permissions, expires_at)
}

/// All consent versions for a record, newest first
pub fn history(conn: &Connection, record_id: &str) -> Result<Vec<ConsentRecord>, HealthError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM consents WHERE record_id = ? ORDER BY created_at DESC, rowid DESC",
    )?;

    let rows = stmt
        .query_map(params![record_id], |row| ConsentRecord::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Number of active consents for a record (always 1 after initialization)
pub fn count_active(conn: &Connection, record_id: &str) -> Result<i64, HealthError> {
    conn.query_row(
        "SELECT COUNT(*) FROM consents WHERE record_id = ? AND active = 1",
        params![record_id],
        |row| row.get(0),
    )
    .map_err(HealthError::from)
}
