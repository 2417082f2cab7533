//! Token service - rewards settled on the ledger, then logged locally
//!
//! A reward is anchored on the ledger first and only then appended to
//! `token_transactions`, so a local row always carries a real chain
//! reference. Workflows credit rewards after their own commit through
//! [`TokenService::credit_or_log`]: a lost reward is logged and retryable,
//! never a reason to fail the operation that earned it.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::collaborators::{Ledger, LedgerEvent};
use crate::db::token_transactions::{self, token_kinds, TokenTransaction};
use crate::db::HealthDb;
use crate::error::HealthError;

use super::events::{EventBus, HealthEvent};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalance {
    pub principal_id: String,
    pub balance: i64,
}

pub struct TokenService {
    db: Arc<HealthDb>,
    ledger: Arc<dyn Ledger>,
    events: Arc<EventBus>,
}

impl TokenService {
    pub fn new(db: Arc<HealthDb>, ledger: Arc<dyn Ledger>, events: Arc<EventBus>) -> Self {
        Self { db, ledger, events }
    }

    /// Anchor and append a reward
    pub async fn credit(
        &self,
        principal_id: &str,
        kind: &str,
        amount: i64,
        related_entity_id: Option<&str>,
    ) -> Result<TokenTransaction, HealthError> {
        if !token_kinds::is_valid(kind) {
            return Err(HealthError::Validation(format!(
                "Invalid token kind: {}. Valid kinds: {:?}",
                kind,
                token_kinds::ALL
            )));
        }

        let reference = self
            .ledger
            .record(&LedgerEvent::TokenReward {
                principal_id: principal_id.to_string(),
                kind: kind.to_string(),
                amount,
                related_entity_id: related_entity_id.map(str::to_string),
            })
            .await?;

        let tx = self.db.with_conn(|conn| {
            token_transactions::append(conn, principal_id, kind, amount, &reference, related_entity_id)
        })?;

        info!(principal = %principal_id, kind = %kind, amount, reference = %reference, "Tokens credited");
        self.events.emit(HealthEvent::TokensCredited {
            principal_id: principal_id.to_string(),
            kind: kind.to_string(),
            amount,
        });

        Ok(tx)
    }

    /// [`credit`](Self::credit), with failures logged and swallowed
    pub async fn credit_or_log(
        &self,
        principal_id: &str,
        kind: &str,
        amount: i64,
        related_entity_id: Option<&str>,
    ) -> Option<TokenTransaction> {
        match self.credit(principal_id, kind, amount, related_entity_id).await {
            Ok(tx) => Some(tx),
            Err(e) => {
                warn!(
                    principal = %principal_id,
                    kind = %kind,
                    amount,
                    related = ?related_entity_id,
                    error = %e,
                    "Reward not recorded; retry later"
                );
                None
            }
        }
    }

    pub fn balance(&self, principal_id: &str) -> Result<TokenBalance, HealthError> {
        let balance = self.db.with_conn(|conn| token_transactions::balance(conn, principal_id))?;
        Ok(TokenBalance {
            principal_id: principal_id.to_string(),
            balance,
        })
    }

    pub fn transactions(&self, principal_id: &str) -> Result<Vec<TokenTransaction>, HealthError> {
        self.db.with_conn(|conn| token_transactions::list_by_principal(conn, principal_id))
    }
}
