//! Access request state machine storage
//!
//! `pending → approved | rejected`, both terminal. The only way out of
//! `pending` is [`transition_pending`], a conditional write guarded by
//! `status = 'pending'`; of two racing responses exactly one sees a row change.

use std::fmt;
use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{json_string_list, now_timestamp};
use crate::error::HealthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = HealthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "approved" => Ok(RequestStatus::Approved),
            "rejected" => Ok(RequestStatus::Rejected),
            other => Err(HealthError::Validation(format!("unknown request status '{}'", other))),
        }
    }
}

/// Access request row from database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRequest {
    pub id: String,
    pub requester_id: String,
    pub owner_id: String,
    pub record_id: String,
    pub purpose: String,
    pub requested_duration_days: Option<i64>,
    pub requested_fields: Vec<String>,
    pub status: RequestStatus,
    pub created_at: String,
    pub updated_at: String,
}

impl AccessRequest {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let status: String = row.get("status")?;
        let status = status.parse::<RequestStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(Self {
            id: row.get("id")?,
            requester_id: row.get("requester_id")?,
            owner_id: row.get("owner_id")?,
            record_id: row.get("record_id")?,
            purpose: row.get("purpose")?,
            requested_duration_days: row.get("duration_days")?,
            requested_fields: json_string_list(row.get("requested_fields_json")?)?,
            status,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Input for inserting a request; `owner_id` is already resolved
#[derive(Debug, Clone)]
pub struct NewAccessRequest {
    pub requester_id: String,
    pub owner_id: String,
    pub record_id: String,
    pub purpose: String,
    pub duration_days: Option<i64>,
    pub requested_fields: Vec<String>,
}

pub fn insert_request(conn: &Connection, input: NewAccessRequest) -> Result<AccessRequest, HealthError> {
    let now = now_timestamp();
    let request = AccessRequest {
        id: Uuid::new_v4().to_string(),
        requester_id: input.requester_id,
        owner_id: input.owner_id,
        record_id: input.record_id,
        purpose: input.purpose,
        requested_duration_days: input.duration_days,
        requested_fields: input.requested_fields,
        status: RequestStatus::Pending,
        created_at: now.clone(),
        updated_at: now,
    };

    let fields_json = serde_json::to_string(&request.requested_fields)?;

    conn.execute(
        r#"
        INSERT INTO access_requests (
            id, requester_id, owner_id, record_id, purpose,
            duration_days, requested_fields_json, status, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            request.id,
            request.requester_id,
            request.owner_id,
            request.record_id,
            request.purpose,
            request.requested_duration_days,
            fields_json,
            request.status.as_str(),
            request.created_at,
            request.updated_at,
        ],
    )
    .map_err(|e| HealthError::Internal(format!("Insert failed: {}", e)))?;

    Ok(request)
}

pub fn get_request(conn: &Connection, id: &str) -> Result<Option<AccessRequest>, HealthError> {
    conn.query_row(
        "SELECT * FROM access_requests WHERE id = ?",
        params![id],
        |row| AccessRequest::from_row(row),
    )
    .optional()
    .map_err(HealthError::from)
}

/// Request by id, only if `owner_id` owns the underlying record
pub fn get_for_owner(
    conn: &Connection,
    id: &str,
    owner_id: &str,
) -> Result<Option<AccessRequest>, HealthError> {
    conn.query_row(
        "SELECT * FROM access_requests WHERE id = ? AND owner_id = ?",
        params![id, owner_id],
        |row| AccessRequest::from_row(row),
    )
    .optional()
    .map_err(HealthError::from)
}

/// The requester's open request for a record, if one is still pending
pub fn find_pending(
    conn: &Connection,
    requester_id: &str,
    record_id: &str,
) -> Result<Option<AccessRequest>, HealthError> {
    conn.query_row(
        r#"
        SELECT * FROM access_requests
        WHERE requester_id = ? AND record_id = ? AND status = 'pending'
        ORDER BY created_at DESC, rowid DESC
        LIMIT 1
        "#,
        params![requester_id, record_id],
        |row| AccessRequest::from_row(row),
    )
    .optional()
    .map_err(HealthError::from)
}

/// Conditional `pending → to` write; returns false when no row changed
pub fn transition_pending(
    conn: &Connection,
    id: &str,
    owner_id: &str,
    to: RequestStatus,
) -> Result<bool, HealthError> {
    if !to.is_terminal() {
        return Err(HealthError::Validation("requests can only move to approved or rejected".into()));
    }

    let changed = conn.execute(
        r#"
        UPDATE access_requests
        SET status = ?, updated_at = ?
        WHERE id = ? AND owner_id = ? AND status = 'pending'
        "#,
        params![to.as_str(), now_timestamp(), id, owner_id],
    )?;

    Ok(changed == 1)
}

pub fn list_by_requester(conn: &Connection, requester_id: &str) -> Result<Vec<AccessRequest>, HealthError> {
    list_where(conn, "requester_id", requester_id)
}

pub fn list_by_owner(conn: &Connection, owner_id: &str) -> Result<Vec<AccessRequest>, HealthError> {
    list_where(conn, "owner_id", owner_id)
}

fn list_where(conn: &Connection, column: &str, value: &str) -> Result<Vec<AccessRequest>, HealthError> {
    let sql = format!(
        "SELECT * FROM access_requests WHERE {} = ? ORDER BY created_at DESC, rowid DESC",
        column
    );
    let mut stmt = conn.prepare(&sql)?;

    let rows = stmt
        .query_map(params![value], |row| AccessRequest::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::principals::{insert_principal, Role};
    use crate::db::records::{insert_record, NewHealthRecord};
    use crate::db::HealthDb;

    fn setup(db: &HealthDb) -> NewAccessRequest {
        db.with_conn(|conn| {
            let owner = insert_principal(conn, "0xowner", Role::Patient, None)?;
            let researcher = insert_principal(conn, "0xlab", Role::Researcher, None)?;
            let record = insert_record(conn, NewHealthRecord {
                owner_id: owner.id.clone(),
                data_type: "genomic".into(),
                payload_pointer: "p".into(),
                metadata_pointer: "m".into(),
                data_hash: "h".into(),
                consent_hash: "c".into(),
                size_bytes: 1,
                age_group: None,
                gender: None,
                region: None,
            })?;
            Ok(NewAccessRequest {
                requester_id: researcher.id,
                owner_id: owner.id,
                record_id: record.id,
                purpose: "cohort study".into(),
                duration_days: Some(30),
                requested_fields: vec!["hba1c".into(), "ldl".into()],
            })
        })
        .unwrap()
    }

    #[test]
    fn test_insert_and_read_back() {
        let db = HealthDb::open_in_memory().unwrap();
        let input = setup(&db);
        let created = db.with_conn(|c| insert_request(c, input.clone())).unwrap();

        assert_eq!(created.status, RequestStatus::Pending);
        let loaded = db.with_conn(|c| get_request(c, &created.id)).unwrap().unwrap();
        assert_eq!(loaded, created);
        assert_eq!(loaded.requested_fields, vec!["hba1c", "ldl"]);

        assert!(db.with_conn(|c| get_for_owner(c, &created.id, &input.owner_id)).unwrap().is_some());
        assert!(db.with_conn(|c| get_for_owner(c, &created.id, &input.requester_id)).unwrap().is_none());
    }

    #[test]
    fn test_transition_happens_once() {
        let db = HealthDb::open_in_memory().unwrap();
        let input = setup(&db);
        let created = db.with_conn(|c| insert_request(c, input.clone())).unwrap();

        let first = db
            .with_conn(|c| transition_pending(c, &created.id, &input.owner_id, RequestStatus::Rejected))
            .unwrap();
        let second = db
            .with_conn(|c| transition_pending(c, &created.id, &input.owner_id, RequestStatus::Approved))
            .unwrap();

        assert!(first);
        assert!(!second);
        let loaded = db.with_conn(|c| get_request(c, &created.id)).unwrap().unwrap();
        assert_eq!(loaded.status, RequestStatus::Rejected);
    }

    #[test]
    fn test_find_pending_ignores_answered_requests() {
        let db = HealthDb::open_in_memory().unwrap();
        let input = setup(&db);
        let created = db.with_conn(|c| insert_request(c, input.clone())).unwrap();

        let open = db.with_conn(|c| find_pending(c, &input.requester_id, &input.record_id)).unwrap();
        assert_eq!(open.map(|r| r.id), Some(created.id.clone()));
        assert!(db.with_conn(|c| find_pending(c, &input.owner_id, &input.record_id)).unwrap().is_none());

        db.with_conn(|c| transition_pending(c, &created.id, &input.owner_id, RequestStatus::Rejected))
            .unwrap();
        assert!(db.with_conn(|c| find_pending(c, &input.requester_id, &input.record_id)).unwrap().is_none());
    }

    #[test]
    fn test_transition_to_pending_rejected() {
        let db = HealthDb::open_in_memory().unwrap();
        let result = db.with_conn(|c| transition_pending(c, "x", "y", RequestStatus::Pending));
        assert!(matches!(result, Err(HealthError::Validation(_))));
    }

    #[test]
    fn test_lists_newest_first() {
        let db = HealthDb::open_in_memory().unwrap();
        let input = setup(&db);
        let a = db.with_conn(|c| insert_request(c, input.clone())).unwrap();
        let b = db.with_conn(|c| insert_request(c, input.clone())).unwrap();

        let by_requester = db.with_conn(|c| list_by_requester(c, &input.requester_id)).unwrap();
        assert_eq!(by_requester.iter().map(|r| r.id.clone()).collect::<Vec<_>>(), vec![b.id.clone(), a.id.clone()]);

        let by_owner = db.with_conn(|c| list_by_owner(c, &input.owner_id)).unwrap();
        assert_eq!(by_owner.len(), 2);
        assert!(db.with_conn(|c| list_by_owner(c, &input.requester_id)).unwrap().is_empty());
    }
}
