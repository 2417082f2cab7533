//! healthshare - consent-gated exchange of encrypted health records
//!
//! Patients submit health data that is encrypted under a fresh per-record key
//! before it reaches storage, and attach consent that governs whether
//! researchers may discover and read it. Researchers search anonymized
//! listings, request time-bound access, and read sealed payloads once the
//! owner approves. Every accepted submission and approval credits reward
//! tokens to an append-only ledger.
//!
//! ## Architecture
//!
//! - **db**: SQLite tables for principals, records, consents, requests,
//!   policies, token transactions and notifications
//! - **collaborators**: Blob store, ledger and identity behind traits
//! - **services**: Workflows, transaction boundaries and events
//! - **http**: hyper API with bearer-token role checks
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/healthshare/
//! ├── blobs/              # Sealed payloads and metadata documents
//! │   └── abcd/sha256-abcd...
//! ├── healthshare.db      # SQLite (WAL)
//! └── config.toml         # Configuration
//! ```

pub mod cipher;
pub mod collaborators;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod permissions;
pub mod services;

pub use config::Config;
pub use db::HealthDb;
pub use error::{HealthError, Result};
pub use http::HttpServer;
pub use permissions::ConsentPermissions;
pub use services::{Collaborators, Rewards, Services};
