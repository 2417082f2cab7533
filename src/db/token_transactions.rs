//! Reward token ledger
//!
//! Append-only. There is no update or delete; a balance is the sum of a
//! principal's rows, computed on every read and never stored.

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::now_timestamp;
use crate::error::HealthError;

pub mod token_kinds {
    pub const DATA_SUBMISSION_REWARD: &str = "data_submission_reward";
    pub const STUDY_PARTICIPATION: &str = "study_participation";

    pub const ALL: &[&str] = &[DATA_SUBMISSION_REWARD, STUDY_PARTICIPATION];

    pub fn is_valid(value: &str) -> bool {
        ALL.contains(&value)
    }
}

/// Token transaction row from database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTransaction {
    pub id: String,
    pub principal_id: String,
    pub kind: String,
    /// Positive is a credit
    pub amount: i64,
    pub chain_reference: String,
    pub related_entity_id: Option<String>,
    pub created_at: String,
}

impl TokenTransaction {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            principal_id: row.get("principal_id")?,
            kind: row.get("kind")?,
            amount: row.get("amount")?,
            chain_reference: row.get("chain_reference")?,
            related_entity_id: row.get("related_entity_id")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Append a transaction; `kind` is validated by the caller before anchoring
pub fn append(
    conn: &Connection,
    principal_id: &str,
    kind: &str,
    amount: i64,
    chain_reference: &str,
    related_entity_id: Option<&str>,
) -> Result<TokenTransaction, HealthError> {
    let tx = TokenTransaction {
        id: Uuid::new_v4().to_string(),
        principal_id: principal_id.to_string(),
        kind: kind.to_string(),
        amount,
        chain_reference: chain_reference.to_string(),
        related_entity_id: related_entity_id.map(str::to_string),
        created_at: now_timestamp(),
    };

    conn.execute(
        r#"
        INSERT INTO token_transactions (
            id, principal_id, kind, amount, chain_reference, related_entity_id, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            tx.id,
            tx.principal_id,
            tx.kind,
            tx.amount,
            tx.chain_reference,
            tx.related_entity_id,
            tx.created_at,
        ],
    )
    .map_err(|e| HealthError::Internal(format!("Insert failed: {}", e)))?;

    Ok(tx)
}

/// Sum of all transactions for a principal
pub fn balance(conn: &Connection, principal_id: &str) -> Result<i64, HealthError> {
    conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM token_transactions WHERE principal_id = ?",
        params![principal_id],
        |row| row.get(0),
    )
    .map_err(HealthError::from)
}

/// Transactions for a principal, newest first
pub fn list_by_principal(conn: &Connection, principal_id: &str) -> Result<Vec<TokenTransaction>, HealthError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM token_transactions WHERE principal_id = ? ORDER BY created_at DESC, rowid DESC",
    )?;

    let rows = stmt
        .query_map(params![principal_id], |row| TokenTransaction::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Transactions keyed to an entity (e.g. a record id)
pub fn list_by_related(conn: &Connection, related_entity_id: &str) -> Result<Vec<TokenTransaction>, HealthError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM token_transactions WHERE related_entity_id = ? ORDER BY created_at DESC, rowid DESC",
    )?;

    let rows = stmt
        .query_map(params![related_entity_id], |row| TokenTransaction::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}
