//! Access workflow - requests, decisions, grants and dataset reads
//!
//! ```text
//! create ──► pending ──respond(true)──► approved  + policy + notify requester
//!                    └─respond(false)─► rejected  + notify requester
//! ```
//!
//! `respond` runs one transaction around a conditional status write. Of two
//! racing responses one commits; the other sees a terminal status (or zero
//! rows changed) and fails with `AlreadyResponded`, producing nothing.
//!
//! A researcher holds at most one open request or effective grant per
//! record; a second request fails with `Conflict` until the first is
//! rejected or its grant expires.
//!
//! A dataset read needs an effective policy *and* a current consent that
//! still permits research use. Every failure on that path is the same bare
//! `AccessDenied`.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::access_policies::{self, AccessPolicy};
use crate::db::access_requests::{self, AccessRequest, NewAccessRequest, RequestStatus};
use crate::db::consents;
use crate::db::notifications::{self, notification_kinds};
use crate::db::records::{self, HealthDataRecord};
use crate::db::token_transactions::token_kinds;
use crate::db::{format_timestamp, now_timestamp, HealthDb};
use crate::error::HealthError;

use super::events::{EventBus, HealthEvent};
use super::notification_service::NotificationService;
use super::record_service::{PayloadMetadata, RecordService};
use super::token_service::TokenService;

/// Longest grant a researcher may ask for
pub const MAX_DURATION_DAYS: i64 = 3650;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccessRequest {
    #[serde(alias = "recordId")]
    pub dataset_id: String,
    pub purpose: String,
    /// Days; absent means a grant without expiry
    #[serde(default, alias = "durationDays")]
    pub duration: Option<i64>,
    #[serde(default)]
    pub requested_fields: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondInput {
    pub approved: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessDecision {
    pub request: AccessRequest,
    pub policy: Option<AccessPolicy>,
}

/// An effective grant with the record it covers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovedDataset {
    pub policy: AccessPolicy,
    pub data_type: String,
    pub data_hash: String,
    pub size_bytes: i64,
    pub age_group: Option<String>,
    pub gender: Option<String>,
    pub region: Option<String>,
}

/// What a grantee receives for a record
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetAccess {
    pub record_id: String,
    pub data_type: String,
    pub data_hash: String,
    /// `iv || ciphertext`, base64; the key travels out of band
    pub encrypted_payload: String,
    pub metadata: PayloadMetadata,
    pub fields: Vec<String>,
    pub anonymous_only: bool,
    pub expires_at: Option<String>,
}

pub struct AccessService {
    db: Arc<HealthDb>,
    events: Arc<EventBus>,
    records: Arc<RecordService>,
    tokens: Arc<TokenService>,
    notifications: Arc<NotificationService>,
    participation_reward: i64,
}

impl AccessService {
    pub fn new(
        db: Arc<HealthDb>,
        events: Arc<EventBus>,
        records: Arc<RecordService>,
        tokens: Arc<TokenService>,
        notifications: Arc<NotificationService>,
        participation_reward: i64,
    ) -> Self {
        Self { db, events, records, tokens, notifications, participation_reward }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    pub fn create(&self, requester_id: &str, input: CreateAccessRequest) -> Result<AccessRequest, HealthError> {
        let purpose = input.purpose.trim();
        if purpose.is_empty() {
            return Err(HealthError::Validation("purpose is required".into()));
        }
        if let Some(days) = input.duration {
            if !(1..=MAX_DURATION_DAYS).contains(&days) {
                return Err(HealthError::Validation(format!(
                    "duration must be between 1 and {} days",
                    MAX_DURATION_DAYS
                )));
            }
        }
        let requested_fields: Vec<String> = input
            .requested_fields
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();

        let (request, note) = self.db.transaction(|tx| {
            let owner_id = records::resolve_owner(tx, &input.dataset_id)?
                .ok_or_else(|| HealthError::RecordNotFound(input.dataset_id.clone()))?;

            if let Some(open) = access_requests::find_pending(tx, requester_id, &input.dataset_id)? {
                return Err(HealthError::Conflict(format!(
                    "request {} for record {} is still pending",
                    open.id, input.dataset_id
                )));
            }
            if access_policies::fetch(tx, requester_id, &input.dataset_id, &now_timestamp())?.is_some() {
                return Err(HealthError::Conflict(format!(
                    "access to record {} is already granted",
                    input.dataset_id
                )));
            }

            let request = access_requests::insert_request(
                tx,
                NewAccessRequest {
                    requester_id: requester_id.to_string(),
                    owner_id: owner_id.clone(),
                    record_id: input.dataset_id.clone(),
                    purpose: purpose.to_string(),
                    duration_days: input.duration,
                    requested_fields,
                },
            )?;

            let note = notifications::insert_notification(
                tx,
                &owner_id,
                notification_kinds::ACCESS_REQUEST,
                &format!("New access request for record {}: {}", request.record_id, request.purpose),
                Some(&request.id),
            )?;

            Ok((request, note))
        })?;

        info!(request = %request.id, record = %request.record_id, requester = %requester_id, "Access requested");
        self.notifications.publish(&note);
        self.events.emit(HealthEvent::AccessRequested {
            request_id: request.id.clone(),
            record_id: request.record_id.clone(),
            requester_id: requester_id.to_string(),
        });

        Ok(request)
    }

    /// Owner's decision on a pending request
    pub async fn respond(
        &self,
        request_id: &str,
        owner_id: &str,
        approved: bool,
    ) -> Result<AccessDecision, HealthError> {
        let to = if approved { RequestStatus::Approved } else { RequestStatus::Rejected };

        let (request, policy, note) = self.db.transaction(|tx| {
            let pending = access_requests::get_for_owner(tx, request_id, owner_id)?
                .ok_or_else(|| HealthError::NotFound(format!("access request {}", request_id)))?;
            if pending.status.is_terminal() {
                return Err(HealthError::AlreadyResponded(request_id.to_string()));
            }

            if !access_requests::transition_pending(tx, request_id, owner_id, to)? {
                return Err(HealthError::AlreadyResponded(request_id.to_string()));
            }

            let request = access_requests::get_request(tx, request_id)?
                .ok_or_else(|| HealthError::Internal(format!("request {} vanished mid-transaction", request_id)))?;

            let (policy, kind, message) = if approved {
                let now = now_timestamp();
                if access_policies::fetch(tx, &request.requester_id, &request.record_id, &now)?.is_some() {
                    return Err(HealthError::Conflict(format!(
                        "access to record {} is already granted",
                        request.record_id
                    )));
                }
                let expires_at = request
                    .requested_duration_days
                    .map(|days| format_timestamp(Utc::now() + Duration::days(days)));
                let policy = access_policies::insert_policy(tx, &request, expires_at)?;
                let message = format!("Your access request for record {} was approved", request.record_id);
                (Some(policy), notification_kinds::ACCESS_APPROVED, message)
            } else {
                let message = format!("Your access request for record {} was rejected", request.record_id);
                (None, notification_kinds::ACCESS_REJECTED, message)
            };

            let note = notifications::insert_notification(
                tx,
                &request.requester_id,
                kind,
                &message,
                Some(&request.id),
            )?;

            Ok((request, policy, note))
        })?;

        info!(request = %request.id, status = %request.status, "Access request answered");
        self.notifications.publish(&note);
        self.events.emit(HealthEvent::AccessResponded {
            request_id: request.id.clone(),
            status: request.status.to_string(),
            policy_id: policy.as_ref().map(|p| p.id.clone()),
        });

        if policy.is_some() {
            self.tokens
                .credit_or_log(
                    owner_id,
                    token_kinds::STUDY_PARTICIPATION,
                    self.participation_reward,
                    Some(&request.id),
                )
                .await;
        }

        Ok(AccessDecision { request, policy })
    }

    pub fn list_by_requester(&self, requester_id: &str) -> Result<Vec<AccessRequest>, HealthError> {
        self.db.with_conn(|conn| access_requests::list_by_requester(conn, requester_id))
    }

    pub fn list_by_owner(&self, owner_id: &str) -> Result<Vec<AccessRequest>, HealthError> {
        self.db.with_conn(|conn| access_requests::list_by_owner(conn, owner_id))
    }

    // =========================================================================
    // Grants
    // =========================================================================

    /// Effective grants held by a researcher, newest first
    pub fn granted_to(&self, grantee_id: &str) -> Result<Vec<ApprovedDataset>, HealthError> {
        let now = now_timestamp();
        self.db.with_conn(|conn| {
            let policies = access_policies::granted_to(conn, grantee_id, &now)?;
            let mut datasets = Vec::with_capacity(policies.len());
            for policy in policies {
                if let Some(record) = records::get_record(conn, &policy.record_id)? {
                    datasets.push(ApprovedDataset {
                        policy,
                        data_type: record.data_type,
                        data_hash: record.data_hash,
                        size_bytes: record.size_bytes,
                        age_group: record.age_group,
                        gender: record.gender,
                        region: record.region,
                    });
                }
            }
            Ok(datasets)
        })
    }

    /// The effective grant for one record
    pub fn fetch(&self, grantee_id: &str, record_id: &str) -> Result<AccessPolicy, HealthError> {
        let now = now_timestamp();
        self.db
            .with_conn(|conn| access_policies::fetch(conn, grantee_id, record_id, &now))?
            .ok_or(HealthError::AccessDenied)
    }

    /// Read a record's sealed payload under an effective grant
    pub async fn dataset_access(&self, grantee_id: &str, record_id: &str) -> Result<DatasetAccess, HealthError> {
        let (policy, record, anonymous_only) = self.authorize(grantee_id, record_id)?;

        let sealed = self.records.sealed_payload(&record).await?;
        let metadata = self.records.metadata(&record).await?;

        info!(record = %record.id, grantee = %grantee_id, "Dataset payload served");
        self.events.emit(HealthEvent::DatasetAccessed {
            record_id: record.id.clone(),
            grantee_id: grantee_id.to_string(),
        });

        Ok(DatasetAccess {
            record_id: record.id,
            data_type: record.data_type,
            data_hash: record.data_hash,
            encrypted_payload: STANDARD.encode(sealed),
            metadata,
            fields: policy.conditions,
            anonymous_only,
            expires_at: policy.expires_at,
        })
    }

    fn authorize(
        &self,
        grantee_id: &str,
        record_id: &str,
    ) -> Result<(AccessPolicy, HealthDataRecord, bool), HealthError> {
        let now = now_timestamp();
        self.db.with_conn(|conn| {
            let policy = access_policies::fetch(conn, grantee_id, record_id, &now)?
                .ok_or(HealthError::AccessDenied)?;
            let consent = consents::get_active(conn, record_id)?
                .filter(|c| c.permits_research(&now))
                .ok_or(HealthError::AccessDenied)?;
            let record = records::get_record(conn, record_id)?.ok_or(HealthError::AccessDenied)?;
            Ok((policy, record, consent.permissions.anonymous_only))
        })
    }
}
