//! Per-principal notification inbox

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::now_timestamp;
use crate::error::HealthError;

pub mod notification_kinds {
    pub const ACCESS_REQUEST: &str = "access_request";
    pub const ACCESS_APPROVED: &str = "access_approved";
    pub const ACCESS_REJECTED: &str = "access_rejected";
    pub const CONSENT_UPDATED: &str = "consent_updated";
}

/// Notification row from database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub principal_id: String,
    pub kind: String,
    pub message: String,
    pub related_id: Option<String>,
    pub is_read: bool,
    pub created_at: String,
}

impl Notification {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            principal_id: row.get("principal_id")?,
            kind: row.get("kind")?,
            message: row.get("message")?,
            related_id: row.get("related_id")?,
            is_read: row.get("is_read")?,
            created_at: row.get("created_at")?,
        })
    }
}

pub fn insert_notification(
    conn: &Connection,
    principal_id: &str,
    kind: &str,
    message: &str,
    related_id: Option<&str>,
) -> Result<Notification, HealthError> {
    let notification = Notification {
        id: Uuid::new_v4().to_string(),
        principal_id: principal_id.to_string(),
        kind: kind.to_string(),
        message: message.to_string(),
        related_id: related_id.map(str::to_string),
        is_read: false,
        created_at: now_timestamp(),
    };

    conn.execute(
        r#"
        INSERT INTO notifications (id, principal_id, kind, message, related_id, is_read, created_at)
        VALUES (?, ?, ?, ?, ?, 0, ?)
        "#,
        params![
            notification.id,
            notification.principal_id,
            notification.kind,
            notification.message,
            notification.related_id,
            notification.created_at,
        ],
    )
    .map_err(|e| HealthError::Internal(format!("Insert failed: {}", e)))?;

    Ok(notification)
}

/// Notifications for a principal, newest first
pub fn list_for_principal(
    conn: &Connection,
    principal_id: &str,
    unread_only: bool,
) -> Result<Vec<Notification>, HealthError> {
    let sql = if unread_only {
        "SELECT * FROM notifications WHERE principal_id = ? AND is_read = 0 ORDER BY created_at DESC, rowid DESC"
    } else {
        "SELECT * FROM notifications WHERE principal_id = ? ORDER BY created_at DESC, rowid DESC"
    };
    let mut stmt = conn.prepare(sql)?;

    let rows = stmt
        .query_map(params![principal_id], |row| Notification::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Mark read; false when the notification is absent or not the caller's
pub fn mark_read(conn: &Connection, id: &str, principal_id: &str) -> Result<bool, HealthError> {
    let changed = conn.execute(
        "UPDATE notifications SET is_read = 1 WHERE id = ? AND principal_id = ?",
        params![id, principal_id],
    )?;

    Ok(changed > 0)
}

pub fn unread_count(conn: &Connection, principal_id: &str) -> Result<i64, HealthError> {
    conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE principal_id = ? AND is_read = 0",
        params![principal_id],
        |row| row.get(0),
    )
    .map_err(HealthError::from)
}
