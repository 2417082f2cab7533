//! Identity directory - patients and researchers keyed by wallet

use std::fmt;
use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::now_timestamp;
use crate::error::HealthError;

/// Principal role; fixed at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Patient,
    Researcher,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Researcher => "researcher",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = HealthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patient" => Ok(Role::Patient),
            "researcher" => Ok(Role::Researcher),
            other => Err(HealthError::Validation(format!("unknown role '{}'", other))),
        }
    }
}

/// Principal row from database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub id: String,
    pub wallet_key: String,
    pub role: Role,
    pub email: Option<String>,
    pub created_at: String,
}

impl Principal {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let role: String = row.get("role")?;
        let role = role.parse::<Role>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(Self {
            id: row.get("id")?,
            wallet_key: row.get("wallet_key")?,
            role,
            email: row.get("email")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Insert a new principal; a taken wallet is a `Conflict`
pub fn insert_principal(
    conn: &Connection,
    wallet_key: &str,
    role: Role,
    email: Option<&str>,
) -> Result<Principal, HealthError> {
    if find_by_wallet(conn, wallet_key)?.is_some() {
        return Err(HealthError::Conflict(format!(
            "wallet {} is already registered",
            wallet_key
        )));
    }

    let principal = Principal {
        id: Uuid::new_v4().to_string(),
        wallet_key: wallet_key.to_string(),
        role,
        email: email.map(str::to_string),
        created_at: now_timestamp(),
    };

    conn.execute(
        "INSERT INTO principals (id, wallet_key, role, email, created_at) VALUES (?, ?, ?, ?, ?)",
        params![
            principal.id,
            principal.wallet_key,
            principal.role.as_str(),
            principal.email,
            principal.created_at,
        ],
    )?;

    Ok(principal)
}

pub fn get_principal(conn: &Connection, id: &str) -> Result<Option<Principal>, HealthError> {
    conn.query_row(
        "SELECT * FROM principals WHERE id = ?",
        params![id],
        |row| Principal::from_row(row),
    )
    .optional()
    .map_err(HealthError::from)
}

/// Resolve a wallet identifier to its principal
pub fn find_by_wallet(conn: &Connection, wallet_key: &str) -> Result<Option<Principal>, HealthError> {
    conn.query_row(
        "SELECT * FROM principals WHERE wallet_key = ?",
        params![wallet_key],
        |row| Principal::from_row(row),
    )
    .optional()
    .map_err(HealthError::from)
}
