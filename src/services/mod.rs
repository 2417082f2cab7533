//! Service layer
//!
//! Services hold the business rules between HTTP handlers and the
//! repository functions in `db`: validation, transaction boundaries,
//! collaborator calls, rewards and event emission.
//!
//! ```text
//! HTTP Handlers (thin)
//!     ↓
//! Service Layer (business logic)  ──►  BlobStore / Ledger / IdentityVerifier
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod response;
pub mod events;
pub mod identity_service;
pub mod record_service;
pub mod consent_service;
pub mod access_service;
pub mod token_service;
pub mod notification_service;

pub use events::{EventBus, EventListener, HealthEvent};
pub use identity_service::IdentityService;
pub use record_service::RecordService;
pub use consent_service::ConsentService;
pub use access_service::AccessService;
pub use token_service::TokenService;
pub use notification_service::NotificationService;

use std::sync::Arc;

use crate::collaborators::{
    BlobStore, IdentityVerifier, JwtIdentity, Ledger, MemoryBlobStore, MemoryLedger, TokenIssuer,
};
use crate::db::HealthDb;

/// Implementations of the external systems
#[derive(Clone)]
pub struct Collaborators {
    pub blobs: Arc<dyn BlobStore>,
    pub ledger: Arc<dyn Ledger>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub issuer: Arc<dyn TokenIssuer>,
}

impl Collaborators {
    /// Memory blob store, memory ledger and the given JWT identity
    pub fn in_memory(identity: JwtIdentity) -> Self {
        let identity = Arc::new(identity);
        Self {
            blobs: Arc::new(MemoryBlobStore::new()),
            ledger: Arc::new(MemoryLedger::new()),
            verifier: identity.clone(),
            issuer: identity,
        }
    }
}

/// Token amounts paid by the workflows
#[derive(Debug, Clone, Copy)]
pub struct Rewards {
    /// Per accepted health record
    pub submission: i64,
    /// To the owner, per approved access request
    pub participation: i64,
}

impl Default for Rewards {
    fn default() -> Self {
        Self {
            submission: 10,
            participation: 5,
        }
    }
}

/// Service container, built once at startup
pub struct Services {
    pub db: Arc<HealthDb>,
    pub identity: Arc<IdentityService>,
    pub records: Arc<RecordService>,
    pub consent: Arc<ConsentService>,
    pub access: Arc<AccessService>,
    pub tokens: Arc<TokenService>,
    pub notifications: Arc<NotificationService>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub events: Arc<EventBus>,
}

impl Services {
    pub fn new(db: Arc<HealthDb>, collaborators: Collaborators, rewards: Rewards) -> Self {
        let events = Arc::new(EventBus::new());

        let tokens = Arc::new(TokenService::new(
            db.clone(),
            collaborators.ledger.clone(),
            events.clone(),
        ));
        let notifications = Arc::new(NotificationService::new(db.clone(), events.clone()));
        let records = Arc::new(RecordService::new(
            db.clone(),
            events.clone(),
            collaborators.blobs.clone(),
            collaborators.ledger.clone(),
            tokens.clone(),
            rewards.submission,
        ));

        Self {
            identity: Arc::new(IdentityService::new(db.clone(), events.clone(), collaborators.issuer.clone())),
            consent: Arc::new(ConsentService::new(
                db.clone(),
                events.clone(),
                collaborators.ledger.clone(),
                notifications.clone(),
            )),
            access: Arc::new(AccessService::new(
                db.clone(),
                events.clone(),
                records.clone(),
                tokens.clone(),
                notifications.clone(),
                rewards.participation,
            )),
            records,
            tokens,
            notifications,
            verifier: collaborators.verifier,
            events,
            db,
        }
    }
}
