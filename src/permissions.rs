//! Consent capability set
//!
//! Permissions are a fixed set of boolean capabilities rather than a free-form
//! JSON map, so every check is exhaustive. New capabilities are added as new
//! fields (and new columns in `consents`), never as arbitrary keys.

use serde::{Deserialize, Serialize};

/// What a consent allows others to do with a health record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConsentPermissions {
    /// Record may be discovered and requested by researchers
    #[serde(default)]
    pub research_use: bool,
    #[serde(default)]
    pub commercial_use: bool,
    #[serde(default)]
    pub third_party_sharing: bool,
    /// Listings must not reveal the owning patient
    #[serde(default)]
    pub anonymous_only: bool,
}

impl ConsentPermissions {
    /// Permissions applied when a submission carries no consent settings
    pub fn research_default() -> Self {
        Self {
            research_use: true,
            anonymous_only: true,
            ..Default::default()
        }
    }

    /// Nothing granted
    pub fn none() -> Self {
        Self::default()
    }
}

/// Consent types accepted by the consent manager
pub mod consent_types {
    pub const RESEARCH: &str = "research";
    pub const COMMERCIAL: &str = "commercial";
    pub const LIMITED: &str = "limited";
    pub const FULL: &str = "full";

    pub const ALL: &[&str] = &[RESEARCH, COMMERCIAL, LIMITED, FULL];

    pub fn is_valid(value: &str) -> bool {
        ALL.contains(&value)
    }
}
