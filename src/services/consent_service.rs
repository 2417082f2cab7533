//! Consent service
//!
//! An update supersedes the active consent and notifies the owner in one
//! transaction. The new permissions are then re-anchored on the ledger; the
//! database row is authoritative, so an anchoring failure is only logged.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use crate::cipher;
use crate::collaborators::{Ledger, LedgerEvent};
use crate::db::consents::{self, ConsentRecord};
use crate::db::notifications::{self, notification_kinds};
use crate::db::{format_timestamp, records, HealthDb};
use crate::error::HealthError;
use crate::permissions::{consent_types, ConsentPermissions};

use super::events::{EventBus, HealthEvent};
use super::notification_service::NotificationService;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConsent {
    pub consent_type: String,
    #[serde(default)]
    pub permissions: ConsentPermissions,
    #[serde(default)]
    pub expiry_date: Option<DateTime<Utc>>,
}

/// Validate consent terms, returning the stored form of the expiry
pub(crate) fn consent_terms(
    consent_type: &str,
    expiry_date: Option<DateTime<Utc>>,
) -> Result<Option<String>, HealthError> {
    if !consent_types::is_valid(consent_type) {
        return Err(HealthError::Validation(format!(
            "Invalid consent type: {}. Valid types: {:?}",
            consent_type,
            consent_types::ALL
        )));
    }

    match expiry_date {
        Some(at) if at <= Utc::now() => {
            Err(HealthError::Validation("expiryDate must be in the future".into()))
        }
        Some(at) => Ok(Some(format_timestamp(at))),
        None => Ok(None),
    }
}

pub struct ConsentService {
    db: Arc<HealthDb>,
    events: Arc<EventBus>,
    ledger: Arc<dyn Ledger>,
    notifications: Arc<NotificationService>,
}

impl ConsentService {
    pub fn new(
        db: Arc<HealthDb>,
        events: Arc<EventBus>,
        ledger: Arc<dyn Ledger>,
        notifications: Arc<NotificationService>,
    ) -> Self {
        Self { db, events, ledger, notifications }
    }

    /// Replace the active consent of an owned record
    pub async fn update(
        &self,
        record_id: &str,
        owner_id: &str,
        input: UpdateConsent,
    ) -> Result<ConsentRecord, HealthError> {
        let expires_at = consent_terms(&input.consent_type, input.expiry_date)?;

        let (consent, data_hash, note) = self.db.transaction(|tx| {
            let consent = consents::replace_active(
                tx,
                record_id,
                owner_id,
                &input.consent_type,
                input.permissions,
                expires_at.as_deref(),
            )?;
            let data_hash = records::get_record(tx, record_id)?
                .map(|r| r.data_hash)
                .unwrap_or_default();
            let note = notifications::insert_notification(
                tx,
                owner_id,
                notification_kinds::CONSENT_UPDATED,
                &format!("Consent for record {} is now '{}'", record_id, input.consent_type),
                Some(record_id),
            )?;
            Ok((consent, data_hash, note))
        })?;

        info!(
            record = %record_id,
            consent = %consent.id,
            research_use = consent.permissions.research_use,
            "Consent superseded"
        );
        self.notifications.publish(&note);

        if let Err(e) = self.anchor(owner_id, data_hash, &consent.permissions).await {
            warn!(record = %record_id, consent = %consent.id, error = %e, "Consent anchor failed");
        }

        self.events.emit(HealthEvent::ConsentUpdated {
            record_id: record_id.to_string(),
            consent_id: consent.id.clone(),
            research_use: consent.permissions.research_use,
        });

        Ok(consent)
    }

    async fn anchor(
        &self,
        owner_id: &str,
        data_hash: String,
        permissions: &ConsentPermissions,
    ) -> Result<String, HealthError> {
        let permissions_token = cipher::encode_permissions(permissions)?;
        self.ledger
            .record(&LedgerEvent::ConsentAnchor {
                owner_id: owner_id.to_string(),
                data_hash,
                permissions_token,
            })
            .await
    }

    /// Active consent of an owned record
    pub fn get_active(&self, record_id: &str, owner_id: &str) -> Result<ConsentRecord, HealthError> {
        self.db.with_conn(|conn| {
            ensure_owner(conn, record_id, owner_id)?;
            consents::get_active(conn, record_id)?
                .ok_or_else(|| HealthError::NotFound(format!("consent for record {}", record_id)))
        })
    }

    /// Every consent version of an owned record, newest first
    pub fn history(&self, record_id: &str, owner_id: &str) -> Result<Vec<ConsentRecord>, HealthError> {
        self.db.with_conn(|conn| {
            ensure_owner(conn, record_id, owner_id)?;
            consents::history(conn, record_id)
        })
    }
}

fn ensure_owner(conn: &rusqlite::Connection, record_id: &str, owner_id: &str) -> Result<(), HealthError> {
    match records::resolve_owner(conn, record_id)? {
        Some(owner) if owner == owner_id => Ok(()),
        _ => Err(HealthError::NotFound(format!("record {}", record_id))),
    }
}
