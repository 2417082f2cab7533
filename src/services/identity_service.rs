//! Identity directory service
//!
//! Registration and wallet lookup. Authentication hands out a bearer token
//! for an existing principal; proving control of the wallet happens
//! upstream and is not repeated here.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::collaborators::TokenIssuer;
use crate::db::principals::{self, Principal, Role};
use crate::db::HealthDb;
use crate::error::HealthError;

use super::events::{EventBus, HealthEvent};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterInput {
    #[serde(alias = "walletAddress")]
    pub wallet_key: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateInput {
    #[serde(alias = "walletAddress")]
    pub wallet_key: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    pub principal: Principal,
    pub token: String,
}

pub struct IdentityService {
    db: Arc<HealthDb>,
    events: Arc<EventBus>,
    issuer: Arc<dyn TokenIssuer>,
}

impl IdentityService {
    pub fn new(db: Arc<HealthDb>, events: Arc<EventBus>, issuer: Arc<dyn TokenIssuer>) -> Self {
        Self { db, events, issuer }
    }

    pub fn register(&self, role: Role, input: RegisterInput) -> Result<Principal, HealthError> {
        let wallet_key = input.wallet_key.trim();
        if wallet_key.is_empty() {
            return Err(HealthError::Validation("walletKey is required".into()));
        }

        let email = input.email.as_deref().map(str::trim).filter(|e| !e.is_empty());
        if let Some(email) = email {
            if !email.contains('@') {
                return Err(HealthError::Validation(format!("invalid email: {}", email)));
            }
        }

        let principal = self
            .db
            .with_conn(|conn| principals::insert_principal(conn, wallet_key, role, email))?;

        info!(id = %principal.id, role = %role, "Principal registered");
        self.events.emit(HealthEvent::PrincipalRegistered {
            id: principal.id.clone(),
            role: role.to_string(),
        });

        Ok(principal)
    }

    /// Issue a token for a registered wallet of the expected role
    pub fn authenticate(&self, role: Role, input: AuthenticateInput) -> Result<AuthSession, HealthError> {
        let principal = self
            .find_by_wallet(input.wallet_key.trim())?
            .filter(|p| p.role == role)
            .ok_or_else(|| HealthError::Auth(format!("no {} registered for this wallet", role)))?;

        let token = self.issuer.issue(&principal)?;
        Ok(AuthSession { principal, token })
    }

    pub fn get(&self, id: &str) -> Result<Option<Principal>, HealthError> {
        self.db.with_conn(|conn| principals::get_principal(conn, id))
    }

    pub fn find_by_wallet(&self, wallet_key: &str) -> Result<Option<Principal>, HealthError> {
        self.db.with_conn(|conn| principals::find_by_wallet(conn, wallet_key))
    }
}
