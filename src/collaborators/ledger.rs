//! In-process ledger
//!
//! References are `0x` + sha256(sequence || event digest), so they are
//! unique per call and reproducible for a given sequence of events.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{Ledger, LedgerEvent};
use crate::error::HealthError;

pub struct MemoryLedger {
    sequence: AtomicU64,
    entries: DashMap<String, LedgerEvent>,
    available: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
            entries: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage; `record` fails with `Dependency` while unavailable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, reference: &str) -> Option<LedgerEvent> {
        self.entries.get(reference).map(|e| e.value().clone())
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn reference_for(sequence: u64, event: &LedgerEvent) -> Result<String, HealthError> {
    let digest = Sha256::digest(serde_json::to_vec(event)?);

    let mut hasher = Sha256::new();
    hasher.update(sequence.to_be_bytes());
    hasher.update(digest);
    Ok(format!("0x{}", hex::encode(hasher.finalize())))
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn record(&self, event: &LedgerEvent) -> Result<String, HealthError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(HealthError::Dependency("ledger unavailable".into()));
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let reference = reference_for(sequence, event)?;
        self.entries.insert(reference.clone(), event.clone());

        debug!(sequence, reference = %reference, "Ledger event recorded");
        Ok(reference)
    }
}
