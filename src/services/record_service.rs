//! Record service - submission pipeline, owner reads and researcher search
//!
//! ## Submission
//!
//! ```text
//! validate → generate key → encrypt → blob put (payload, metadata)
//!   → ledger anchor (encoded consent)          failure aborts: Dependency
//!   → transaction { record + initial consent }
//!   → reward (ledger + token log)              failure is logged only
//! ```
//!
//! The encryption key exists only in the returned receipt. `dataHash` is the
//! digest of the sealed blob, checked again on every read.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cipher::{self, EncryptedPayload, EncryptionKey};
use crate::collaborators::{BlobStore, Ledger, LedgerEvent};
use crate::db::consents::{self, ConsentRecord};
use crate::db::records::{
    self, data_types, DatasetListing, HealthDataRecord, NewHealthRecord, RecordWithConsent, SearchFilters,
};
use crate::db::token_transactions::{token_kinds, TokenTransaction};
use crate::db::{now_timestamp, HealthDb};
use crate::error::HealthError;
use crate::permissions::{consent_types, ConsentPermissions};

use super::consent_service::consent_terms;
use super::events::{EventBus, HealthEvent};
use super::token_service::TokenService;

/// Consent supplied with a submission; omitted fields take research defaults
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentSettings {
    #[serde(default)]
    pub consent_type: Option<String>,
    #[serde(default)]
    pub permissions: Option<ConsentPermissions>,
    #[serde(default)]
    pub expiry_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitHealthData {
    pub data: serde_json::Value,
    pub data_type: String,
    #[serde(default)]
    pub consent_settings: Option<ConsentSettings>,
    #[serde(default)]
    pub age_group: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

/// Returned once; the key is not stored anywhere
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionReceipt {
    pub record: HealthDataRecord,
    pub consent: ConsentRecord,
    pub encryption_key: String,
    pub reward: Option<TokenTransaction>,
}

/// Document stored next to the payload under `metadataPointer`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadMetadata {
    pub data_type: String,
    pub plaintext_bytes: usize,
    pub sealed_bytes: usize,
    pub data_hash: String,
    pub cipher: String,
    pub sealed_at: String,
}

pub const CIPHER_NAME: &str = "chacha20poly1305";

pub struct RecordService {
    db: Arc<HealthDb>,
    events: Arc<EventBus>,
    blobs: Arc<dyn BlobStore>,
    ledger: Arc<dyn Ledger>,
    tokens: Arc<TokenService>,
    submission_reward: i64,
}

impl RecordService {
    pub fn new(
        db: Arc<HealthDb>,
        events: Arc<EventBus>,
        blobs: Arc<dyn BlobStore>,
        ledger: Arc<dyn Ledger>,
        tokens: Arc<TokenService>,
        submission_reward: i64,
    ) -> Self {
        Self { db, events, blobs, ledger, tokens, submission_reward }
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    pub async fn submit(&self, owner_id: &str, input: SubmitHealthData) -> Result<SubmissionReceipt, HealthError> {
        if !data_types::is_valid(&input.data_type) {
            return Err(HealthError::Validation(format!(
                "Invalid data type: {}. Valid types: {:?}",
                input.data_type,
                data_types::ALL
            )));
        }
        if input.data.is_null() {
            return Err(HealthError::Validation("data is required".into()));
        }

        let settings = input.consent_settings.unwrap_or_default();
        let consent_type = settings
            .consent_type
            .unwrap_or_else(|| consent_types::RESEARCH.to_string());
        let permissions = settings
            .permissions
            .unwrap_or_else(ConsentPermissions::research_default);
        let expires_at = consent_terms(&consent_type, settings.expiry_date)?;

        let plaintext = serde_json::to_vec(&input.data)?;
        let key = cipher::generate_key();
        let sealed = cipher::encrypt(&plaintext, &key)?.to_bytes();
        let data_hash = cipher::content_hash(&sealed);

        let payload_pointer = self.blobs.put(&sealed).await?;
        let metadata = PayloadMetadata {
            data_type: input.data_type.clone(),
            plaintext_bytes: plaintext.len(),
            sealed_bytes: sealed.len(),
            data_hash: data_hash.clone(),
            cipher: CIPHER_NAME.to_string(),
            sealed_at: now_timestamp(),
        };
        let metadata_pointer = self.blobs.put(&serde_json::to_vec(&metadata)?).await?;

        let consent_hash = self
            .ledger
            .record(&LedgerEvent::ConsentAnchor {
                owner_id: owner_id.to_string(),
                data_hash: data_hash.clone(),
                permissions_token: cipher::encode_permissions(&permissions)?,
            })
            .await?;

        let new_record = NewHealthRecord {
            owner_id: owner_id.to_string(),
            data_type: input.data_type,
            payload_pointer,
            metadata_pointer,
            data_hash,
            consent_hash,
            size_bytes: sealed.len() as i64,
            age_group: input.age_group,
            gender: input.gender,
            region: input.region,
        };

        let (record, consent) = self.db.transaction(|tx| {
            let record = records::insert_record(tx, new_record)?;
            let consent = consents::insert_consent(
                tx,
                &record.id,
                owner_id,
                &consent_type,
                permissions,
                expires_at.as_deref(),
            )?;
            Ok((record, consent))
        })?;

        info!(
            record = %record.id,
            owner = %owner_id,
            data_type = %record.data_type,
            size = record.size_bytes,
            "Health record stored"
        );
        self.events.emit(HealthEvent::RecordSubmitted {
            record_id: record.id.clone(),
            owner_id: owner_id.to_string(),
            data_type: record.data_type.clone(),
        });

        let reward = self
            .tokens
            .credit_or_log(
                owner_id,
                token_kinds::DATA_SUBMISSION_REWARD,
                self.submission_reward,
                Some(&record.id),
            )
            .await;

        Ok(SubmissionReceipt {
            record,
            consent,
            encryption_key: key.to_base64(),
            reward,
        })
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Owner's records with their active consent, newest first
    pub fn list(&self, owner_id: &str) -> Result<Vec<RecordWithConsent>, HealthError> {
        self.db.with_conn(|conn| records::list_by_owner(conn, owner_id))
    }

    /// One owned record; absent and foreign records are both `NotFound`
    pub fn get(&self, record_id: &str, owner_id: &str) -> Result<RecordWithConsent, HealthError> {
        self.db.with_conn(|conn| {
            let record = records::get_owned_record(conn, record_id, owner_id)?
                .ok_or_else(|| HealthError::NotFound(format!("record {}", record_id)))?;
            let consent = consents::get_active(conn, &record.id)?;
            Ok(RecordWithConsent { record, consent })
        })
    }

    /// Decrypt an owned record with the key from its receipt
    pub async fn decrypt(
        &self,
        record_id: &str,
        owner_id: &str,
        key_b64: &str,
    ) -> Result<serde_json::Value, HealthError> {
        let key = EncryptionKey::from_base64(key_b64)?;
        let record = self.get(record_id, owner_id)?.record;
        let sealed = self.sealed_payload(&record).await?;

        let payload = EncryptedPayload::from_bytes(&sealed)?;
        let plaintext = cipher::decrypt(&payload.ciphertext, &payload.iv, &key)?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| HealthError::Decryption(format!("payload is not JSON: {}", e)))
    }

    /// Fetch the sealed payload and check it against `dataHash`
    pub(crate) async fn sealed_payload(&self, record: &HealthDataRecord) -> Result<Vec<u8>, HealthError> {
        let sealed = self.blobs.get(&record.payload_pointer).await?;
        let actual = cipher::content_hash(&sealed);
        if actual != record.data_hash {
            return Err(HealthError::Dependency(format!(
                "payload for record {} failed integrity check",
                record.id
            )));
        }
        Ok(sealed)
    }

    pub(crate) async fn metadata(&self, record: &HealthDataRecord) -> Result<PayloadMetadata, HealthError> {
        let bytes = self.blobs.get(&record.metadata_pointer).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| HealthError::Dependency(format!("unreadable payload metadata: {}", e)))
    }

    /// Researcher discovery; research use is a hard filter
    pub fn search(&self, filters: &SearchFilters) -> Result<Vec<DatasetListing>, HealthError> {
        let now = now_timestamp();
        debug!(filters = ?filters, "Dataset search");
        self.db.with_conn(|conn| records::search(conn, filters, &now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MemoryBlobStore, MemoryLedger};
    use crate::db::principals::{insert_principal, Role};

    struct Fixture {
        service: RecordService,
        db: Arc<HealthDb>,
        blobs: Arc<MemoryBlobStore>,
        ledger: Arc<MemoryLedger>,
        owner: String,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(HealthDb::open_in_memory().unwrap());
        let events = Arc::new(EventBus::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let tokens = Arc::new(TokenService::new(db.clone(), ledger.clone(), events.clone()));
        let service = RecordService::new(db.clone(), events, blobs.clone(), ledger.clone(), tokens, 10);
        let owner = db
            .with_conn(|c| insert_principal(c, "0xpatient", Role::Patient, None))
            .unwrap()
            .id;
        Fixture { service, db, blobs, ledger, owner }
    }

    fn bloodwork() -> SubmitHealthData {
        SubmitHealthData {
            data: serde_json::json!({ "hba1c": 5.4, "ldl": 92 }),
            data_type: data_types::BLOODWORK.into(),
            consent_settings: None,
            age_group: Some("30-39".into()),
            gender: None,
            region: Some("EU".into()),
        }
    }

    #[tokio::test]
    async fn test_submit_and_decrypt() {
        let f = fixture();
        let receipt = f.service.submit(&f.owner, bloodwork()).await.unwrap();

        assert!(receipt.consent.permissions.research_use);
        assert!(receipt.consent.active);
        assert_eq!(receipt.reward.as_ref().map(|r| r.amount), Some(10));
        assert_eq!(f.blobs.len(), 2);
        assert!(f.ledger.lookup(&receipt.record.consent_hash).is_some());

        let data = f
            .service
            .decrypt(&receipt.record.id, &f.owner, &receipt.encryption_key)
            .await
            .unwrap();
        assert_eq!(data, serde_json::json!({ "hba1c": 5.4, "ldl": 92 }));

        let metadata = f.service.metadata(&receipt.record).await.unwrap();
        assert_eq!(metadata.data_hash, receipt.record.data_hash);
        assert_eq!(metadata.cipher, CIPHER_NAME);
    }

    #[tokio::test]
    async fn test_wrong_key_and_foreign_owner() {
        let f = fixture();
        let receipt = f.service.submit(&f.owner, bloodwork()).await.unwrap();

        let other_key = cipher::generate_key().to_base64();
        let wrong = f.service.decrypt(&receipt.record.id, &f.owner, &other_key).await;
        assert!(matches!(wrong, Err(HealthError::Decryption(_))));

        let foreign = f.service.decrypt(&receipt.record.id, "someone-else", &receipt.encryption_key).await;
        assert!(matches!(foreign, Err(HealthError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_tampered_blob_fails_integrity_check() {
        let f = fixture();
        let receipt = f.service.submit(&f.owner, bloodwork()).await.unwrap();
        assert!(f.blobs.replace(&receipt.record.payload_pointer, vec![0u8; 64]));

        let result = f
            .service
            .decrypt(&receipt.record.id, &f.owner, &receipt.encryption_key)
            .await;
        assert!(matches!(result, Err(HealthError::Dependency(_))));
    }

    #[tokio::test]
    async fn test_ledger_outage_aborts_before_persisting() {
        let f = fixture();
        f.ledger.set_available(false);

        let result = f.service.submit(&f.owner, bloodwork()).await;
        assert!(matches!(result, Err(HealthError::Dependency(_))));
        assert_eq!(f.db.stats().unwrap().health_records, 0);
        assert_eq!(f.db.stats().unwrap().token_transactions, 0);
    }

    #[tokio::test]
    async fn test_invalid_submissions() {
        let f = fixture();

        let mut unknown_type = bloodwork();
        unknown_type.data_type = "horoscope".into();
        assert!(matches!(
            f.service.submit(&f.owner, unknown_type).await,
            Err(HealthError::Validation(_))
        ));

        let mut no_data = bloodwork();
        no_data.data = serde_json::Value::Null;
        assert!(matches!(f.service.submit(&f.owner, no_data).await, Err(HealthError::Validation(_))));

        let mut bad_consent = bloodwork();
        bad_consent.consent_settings = Some(ConsentSettings {
            consent_type: Some("forever".into()),
            ..Default::default()
        });
        assert!(matches!(
            f.service.submit(&f.owner, bad_consent).await,
            Err(HealthError::Validation(_))
        ));

        assert!(f.blobs.is_empty());
    }

    #[tokio::test]
    async fn test_list_and_get_are_owner_scoped() {
        let f = fixture();
        let first = f.service.submit(&f.owner, bloodwork()).await.unwrap();
        let second = f.service.submit(&f.owner, bloodwork()).await.unwrap();

        let listed = f.service.list(&f.owner).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].record.id, second.record.id);
        assert!(listed.iter().all(|r| r.consent.is_some()));

        assert_eq!(f.service.get(&first.record.id, &f.owner).unwrap().record, first.record);
        assert!(matches!(
            f.service.get(&first.record.id, "intruder"),
            Err(HealthError::NotFound(_))
        ));
        assert!(f.service.list("intruder").unwrap().is_empty());
    }
}
