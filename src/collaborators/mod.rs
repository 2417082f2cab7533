//! External collaborators
//!
//! The core never interprets what these hand back: blob pointers and ledger
//! references are opaque strings, and a verified principal is just an id and
//! a role. Each trait has an in-process implementation so the whole service
//! runs and tests without outside systems.
//!
//! | Trait | Implementations |
//! |-------|-----------------|
//! | [`BlobStore`] | [`MemoryBlobStore`], [`FsBlobStore`] |
//! | [`Ledger`] | [`MemoryLedger`] |
//! | [`IdentityVerifier`] + [`TokenIssuer`] | [`JwtIdentity`] |

pub mod blob;
pub mod identity;
pub mod ledger;

pub use blob::{FsBlobStore, MemoryBlobStore};
pub use identity::{Claims, JwtIdentity};
pub use ledger::MemoryLedger;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::principals::{Principal, Role};
use crate::error::HealthError;

/// Opaque storage for encrypted payloads and their metadata documents
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes, returning a pointer for [`BlobStore::get`]
    async fn put(&self, data: &[u8]) -> Result<String, HealthError>;

    /// Fetch bytes previously stored under `pointer`
    async fn get(&self, pointer: &str) -> Result<Vec<u8>, HealthError>;
}

/// What gets anchored on the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    /// Encoded consent permissions for a record (or a record about to exist)
    ConsentAnchor {
        owner_id: String,
        data_hash: String,
        permissions_token: String,
    },
    /// A reward credited to a principal
    TokenReward {
        principal_id: String,
        kind: String,
        amount: i64,
        related_entity_id: Option<String>,
    },
}

/// Settlement layer
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Record an event, returning its reference
    async fn record(&self, event: &LedgerEvent) -> Result<String, HealthError>;
}

/// Caller identity established by an [`IdentityVerifier`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedPrincipal {
    pub id: String,
    pub role: Role,
}

/// Turns a bearer token into a verified caller
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedPrincipal, HealthError>;
}

/// Issues bearer tokens that an [`IdentityVerifier`] accepts
pub trait TokenIssuer: Send + Sync {
    fn issue(&self, principal: &Principal) -> Result<String, HealthError>;
}
