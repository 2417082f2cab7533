//! Health record store
//!
//! Record metadata only; the encrypted payload sits in the blob store behind
//! `payload_pointer`. Records are immutable and have no delete path.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::consents::{self, ConsentRecord};
use super::now_timestamp;
use crate::error::HealthError;
use crate::permissions::ConsentPermissions;

/// Record types patients may submit
pub mod data_types {
    pub const BLOODWORK: &str = "bloodwork";
    pub const IMAGING: &str = "imaging";
    pub const GENOMIC: &str = "genomic";
    pub const PRESCRIPTION: &str = "prescription";
    pub const VITALS: &str = "vitals";
    pub const LAB_RESULTS: &str = "lab_results";
    pub const CLINICAL_NOTES: &str = "clinical_notes";
    pub const WEARABLE: &str = "wearable";
    pub const OTHER: &str = "other";

    pub const ALL: &[&str] = &[
        BLOODWORK, IMAGING, GENOMIC, PRESCRIPTION, VITALS,
        LAB_RESULTS, CLINICAL_NOTES, WEARABLE, OTHER,
    ];

    pub fn is_valid(value: &str) -> bool {
        ALL.contains(&value)
    }
}

/// Health record row from database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthDataRecord {
    pub id: String,
    pub owner_id: String,
    pub data_hash: String,
    pub payload_pointer: String,
    pub metadata_pointer: String,
    pub data_type: String,
    pub size_bytes: i64,
    pub consent_hash: String,
    pub age_group: Option<String>,
    pub gender: Option<String>,
    pub region: Option<String>,
    pub created_at: String,
}

impl HealthDataRecord {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            owner_id: row.get("owner_id")?,
            data_hash: row.get("data_hash")?,
            payload_pointer: row.get("payload_pointer")?,
            metadata_pointer: row.get("metadata_pointer")?,
            data_type: row.get("data_type")?,
            size_bytes: row.get("size_bytes")?,
            consent_hash: row.get("consent_hash")?,
            age_group: row.get("age_group")?,
            gender: row.get("gender")?,
            region: row.get("region")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Input for inserting a record
#[derive(Debug, Clone)]
pub struct NewHealthRecord {
    pub owner_id: String,
    pub data_type: String,
    pub payload_pointer: String,
    pub metadata_pointer: String,
    pub data_hash: String,
    pub consent_hash: String,
    pub size_bytes: i64,
    pub age_group: Option<String>,
    pub gender: Option<String>,
    pub region: Option<String>,
}

/// A record joined with its current consent
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordWithConsent {
    #[serde(flatten)]
    pub record: HealthDataRecord,
    pub consent: Option<ConsentRecord>,
}

/// Researcher search filters - camelCase for URL params
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilters {
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub age_group: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 { 100 }

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            data_type: None,
            age_group: None,
            gender: None,
            region: None,
            limit: default_limit(),
            offset: 0,
        }
    }
}

/// What a researcher sees of a discoverable record
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetListing {
    pub id: String,
    /// Omitted when the consent is anonymous-only
    pub owner_id: Option<String>,
    pub data_type: String,
    pub data_hash: String,
    pub size_bytes: i64,
    pub age_group: Option<String>,
    pub gender: Option<String>,
    pub region: Option<String>,
    pub consent_type: String,
    pub permissions: ConsentPermissions,
    pub consent_expires_at: Option<String>,
    pub created_at: String,
}

impl DatasetListing {
    fn new(record: HealthDataRecord, consent: ConsentRecord) -> Self {
        let owner_id = if consent.permissions.anonymous_only {
            None
        } else {
            Some(record.owner_id)
        };

        Self {
            id: record.id,
            owner_id,
            data_type: record.data_type,
            data_hash: record.data_hash,
            size_bytes: record.size_bytes,
            age_group: record.age_group,
            gender: record.gender,
            region: record.region,
            consent_type: consent.consent_type,
            permissions: consent.permissions,
            consent_expires_at: consent.expires_at,
            created_at: record.created_at,
        }
    }
}

/// Insert a record (caller supplies the transaction)
pub fn insert_record(conn: &Connection, input: NewHealthRecord) -> Result<HealthDataRecord, HealthError> {
    let record = HealthDataRecord {
        id: Uuid::new_v4().to_string(),
        owner_id: input.owner_id,
        data_hash: input.data_hash,
        payload_pointer: input.payload_pointer,
        metadata_pointer: input.metadata_pointer,
        data_type: input.data_type,
        size_bytes: input.size_bytes,
        consent_hash: input.consent_hash,
        age_group: input.age_group,
        gender: input.gender,
        region: input.region,
        created_at: now_timestamp(),
    };

    conn.execute(
        r#"
        INSERT INTO health_records (
            id, owner_id, data_hash, payload_pointer, metadata_pointer,
            data_type, size_bytes, consent_hash, age_group, gender, region, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            record.id,
            record.owner_id,
            record.data_hash,
            record.payload_pointer,
            record.metadata_pointer,
            record.data_type,
            record.size_bytes,
            record.consent_hash,
            record.age_group,
            record.gender,
            record.region,
            record.created_at,
        ],
    )
    .map_err(|e| HealthError::Internal(format!("Insert failed: {}", e)))?;

    Ok(record)
}

/// Get a record by id regardless of owner (internal use only)
pub fn get_record(conn: &Connection, id: &str) -> Result<Option<HealthDataRecord>, HealthError> {
    conn.query_row(
        "SELECT * FROM health_records WHERE id = ?",
        params![id],
        |row| HealthDataRecord::from_row(row),
    )
    .optional()
    .map_err(HealthError::from)
}

/// Ownership-scoped lookup; `None` when absent or owned by someone else
pub fn get_owned_record(
    conn: &Connection,
    id: &str,
    owner_id: &str,
) -> Result<Option<HealthDataRecord>, HealthError> {
    conn.query_row(
        "SELECT * FROM health_records WHERE id = ? AND owner_id = ?",
        params![id, owner_id],
        |row| HealthDataRecord::from_row(row),
    )
    .optional()
    .map_err(HealthError::from)
}

/// The one place ownership is derived from
pub fn resolve_owner(conn: &Connection, record_id: &str) -> Result<Option<String>, HealthError> {
    conn.query_row(
        "SELECT owner_id FROM health_records WHERE id = ?",
        params![record_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(HealthError::from)
}

/// Owner's records with their active consent, newest first
pub fn list_by_owner(conn: &Connection, owner_id: &str) -> Result<Vec<RecordWithConsent>, HealthError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM health_records WHERE owner_id = ? ORDER BY created_at DESC, rowid DESC",
    )?;

    let records = stmt
        .query_map(params![owner_id], |row| HealthDataRecord::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut results = Vec::with_capacity(records.len());
    for record in records {
        let consent = consents::get_active(conn, &record.id)?;
        results.push(RecordWithConsent { record, consent });
    }

    Ok(results)
}

/// Discoverable records matching the filters, newest first.
///
/// Only records whose active consent grants research use, and has not
/// expired, are ever returned.
pub fn search(
    conn: &Connection,
    filters: &SearchFilters,
    now: &str,
) -> Result<Vec<DatasetListing>, HealthError> {
    let mut sql = String::from(
        "SELECT r.* FROM health_records r \
         INNER JOIN consents c ON c.record_id = r.id AND c.active = 1",
    );
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];
    let mut conditions = vec![
        "c.research_use = 1".to_string(),
        "(c.expires_at IS NULL OR c.expires_at > ?)".to_string(),
    ];
    params.push(Box::new(now.to_string()));

    if let Some(ref data_type) = filters.data_type {
        conditions.push("r.data_type = ?".to_string());
        params.push(Box::new(data_type.clone()));
    }

    if let Some(ref age_group) = filters.age_group {
        conditions.push("r.age_group = ?".to_string());
        params.push(Box::new(age_group.clone()));
    }

    if let Some(ref gender) = filters.gender {
        conditions.push("r.gender = ?".to_string());
        params.push(Box::new(gender.clone()));
    }

    if let Some(ref region) = filters.region {
        conditions.push("r.region = ?".to_string());
        params.push(Box::new(region.clone()));
    }

    sql.push_str(" WHERE ");
    sql.push_str(&conditions.join(" AND "));
    sql.push_str(" ORDER BY r.created_at DESC, r.rowid DESC LIMIT ? OFFSET ?");
    params.push(Box::new(filters.limit as i64));
    params.push(Box::new(filters.offset as i64));

    debug!("Executing query: {}", sql);

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let records = stmt
        .query_map(param_refs.as_slice(), |row| HealthDataRecord::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut listings = Vec::with_capacity(records.len());
    for record in records {
        if let Some(consent) = consents::get_active(conn, &record.id)? {
            listings.push(DatasetListing::new(record, consent));
        }
    }

    Ok(listings)
}
