//! Time-bound read grants
//!
//! Rows are written once, by an approval, and never updated. Expiry is a
//! read-time filter: `granted = 1 AND (expires_at IS NULL OR expires_at > now)`.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::access_requests::AccessRequest;
use super::{json_string_list, now_timestamp};
use crate::error::HealthError;

pub mod resource_types {
    pub const HEALTH_DATA: &str = "health_data";
}

pub mod actions {
    pub const READ: &str = "read";
}

/// Access policy row from database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessPolicy {
    pub id: String,
    pub request_id: String,
    pub record_id: String,
    pub resource_type: String,
    pub grantee_id: String,
    pub action: String,
    pub granted_by: String,
    pub granted: bool,
    pub granted_at: String,
    pub expires_at: Option<String>,
    /// Field subset the grantee asked for
    pub conditions: Vec<String>,
}

impl AccessPolicy {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            request_id: row.get("request_id")?,
            record_id: row.get("record_id")?,
            resource_type: row.get("resource_type")?,
            grantee_id: row.get("grantee_id")?,
            action: row.get("action")?,
            granted_by: row.get("granted_by")?,
            granted: row.get("granted")?,
            granted_at: row.get("granted_at")?,
            expires_at: row.get("expires_at")?,
            conditions: json_string_list(row.get("conditions_json")?)?,
        })
    }

    pub fn is_effective(&self, now: &str) -> bool {
        self.granted && self.expires_at.as_deref().map_or(true, |expires| expires > now)
    }
}

/// Materialize an approved request into a read grant
pub fn insert_policy(
    conn: &Connection,
    request: &AccessRequest,
    expires_at: Option<String>,
) -> Result<AccessPolicy, HealthError> {
    let policy = AccessPolicy {
        id: Uuid::new_v4().to_string(),
        request_id: request.id.clone(),
        record_id: request.record_id.clone(),
        resource_type: resource_types::HEALTH_DATA.to_string(),
        grantee_id: request.requester_id.clone(),
        action: actions::READ.to_string(),
        granted_by: request.owner_id.clone(),
        granted: true,
        granted_at: now_timestamp(),
        expires_at,
        conditions: request.requested_fields.clone(),
    };

    let conditions_json = serde_json::to_string(&policy.conditions)?;

    conn.execute(
        r#"
        INSERT INTO access_policies (
            id, request_id, record_id, resource_type, grantee_id, action,
            granted_by, granted, granted_at, expires_at, conditions_json
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            policy.id,
            policy.request_id,
            policy.record_id,
            policy.resource_type,
            policy.grantee_id,
            policy.action,
            policy.granted_by,
            policy.granted,
            policy.granted_at,
            policy.expires_at,
            conditions_json,
        ],
    )
    .map_err(|e| HealthError::Internal(format!("Policy insert failed: {}", e)))?;

    Ok(policy)
}

/// Effective health-data grants held by a principal, newest first
pub fn granted_to(conn: &Connection, grantee_id: &str, now: &str) -> Result<Vec<AccessPolicy>, HealthError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT * FROM access_policies
        WHERE grantee_id = ?
          AND granted = 1
          AND resource_type = ?
          AND (expires_at IS NULL OR expires_at > ?)
        ORDER BY granted_at DESC, rowid DESC
        "#,
    )?;

    let rows = stmt
        .query_map(params![grantee_id, resource_types::HEALTH_DATA, now], |row| {
            AccessPolicy::from_row(row)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// The effective grant for one record, if any
pub fn fetch(
    conn: &Connection,
    grantee_id: &str,
    record_id: &str,
    now: &str,
) -> Result<Option<AccessPolicy>, HealthError> {
    conn.query_row(
        r#"
        SELECT * FROM access_policies
        WHERE grantee_id = ?
          AND record_id = ?
          AND granted = 1
          AND resource_type = ?
          AND (expires_at IS NULL OR expires_at > ?)
        ORDER BY granted_at DESC, rowid DESC
        LIMIT 1
        "#,
        params![grantee_id, record_id, resource_types::HEALTH_DATA, now],
        |row| AccessPolicy::from_row(row),
    )
    .optional()
    .map_err(HealthError::from)
}

/// Every policy (effective or not) for a grantee and record
pub fn list_for_grantee_record(
    conn: &Connection,
    grantee_id: &str,
    record_id: &str,
) -> Result<Vec<AccessPolicy>, HealthError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM access_policies WHERE grantee_id = ? AND record_id = ? ORDER BY granted_at DESC",
    )?;

    let rows = stmt
        .query_map(params![grantee_id, record_id], |row| AccessPolicy::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::access_requests::{insert_request, NewAccessRequest};
    use crate::db::principals::{insert_principal, Role};
    use crate::db::records::{insert_record, NewHealthRecord};
    use crate::db::HealthDb;

    fn approved_request(db: &HealthDb) -> AccessRequest {
        db.with_conn(|conn| {
            let owner = insert_principal(conn, "0xowner", Role::Patient, None)?;
            let researcher = insert_principal(conn, "0xlab", Role::Researcher, None)?;
            let record = insert_record(conn, NewHealthRecord {
                owner_id: owner.id.clone(),
                data_type: "imaging".into(),
                payload_pointer: "p".into(),
                metadata_pointer: "m".into(),
                data_hash: "h".into(),
                consent_hash: "c".into(),
                size_bytes: 1,
                age_group: None,
                gender: None,
                region: None,
            })?;
            insert_request(conn, NewAccessRequest {
                requester_id: researcher.id,
                owner_id: owner.id,
                record_id: record.id,
                purpose: "imaging ML".into(),
                duration_days: None,
                requested_fields: vec!["dicom".into()],
            })
        })
        .unwrap()
    }

    #[test]
    fn test_policy_without_expiry_is_effective() {
        let db = HealthDb::open_in_memory().unwrap();
        let request = approved_request(&db);
        let policy = db.with_conn(|c| insert_policy(c, &request, None)).unwrap();

        assert_eq!(policy.grantee_id, request.requester_id);
        assert_eq!(policy.granted_by, request.owner_id);
        assert_eq!(policy.conditions, vec!["dicom"]);

        let now = now_timestamp();
        let fetched = db.with_conn(|c| fetch(c, &request.requester_id, &request.record_id, &now)).unwrap();
        assert_eq!(fetched, Some(policy));
        assert_eq!(db.with_conn(|c| granted_to(c, &request.requester_id, &now)).unwrap().len(), 1);
        assert!(db.with_conn(|c| fetch(c, &request.owner_id, &request.record_id, &now)).unwrap().is_none());
    }

    #[test]
    fn test_expired_policy_is_not_effective() {
        let db = HealthDb::open_in_memory().unwrap();
        let request = approved_request(&db);
        let policy = db
            .with_conn(|c| insert_policy(c, &request, Some("2001-01-01T00:00:00.000000Z".into())))
            .unwrap();

        let now = now_timestamp();
        assert!(!policy.is_effective(&now));
        assert!(db.with_conn(|c| fetch(c, &request.requester_id, &request.record_id, &now)).unwrap().is_none());
        assert!(db.with_conn(|c| granted_to(c, &request.requester_id, &now)).unwrap().is_empty());
        // Still stored; expiry is evaluated, not enforced by deletion
        assert_eq!(
            db.with_conn(|c| list_for_grantee_record(c, &request.requester_id, &request.record_id)).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_one_policy_per_request() {
        let db = HealthDb::open_in_memory().unwrap();
        let request = approved_request(&db);
        db.with_conn(|c| insert_policy(c, &request, None)).unwrap();
        assert!(db.with_conn(|c| insert_policy(c, &request, None)).is_err());
    }
}
