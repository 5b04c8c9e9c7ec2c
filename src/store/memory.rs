//! In-memory record store.

use crate::store::RecordStore;
use crate::types::{Result, ScriptsiftError};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

/// Thread-safe in-memory store, optionally bounded by a byte quota.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<DashMap<String, serde_json::Value>>,
    quota_bytes: Option<usize>,
}

impl MemoryStore {
    /// Create an unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that rejects writes once the serialized total would exceed `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            quota_bytes: Some(bytes),
        }
    }

    /// Serialized size of everything stored.
    pub fn used_bytes(&self) -> usize {
        self.records
            .iter()
            .map(|entry| entry.key().len() + entry.value().to_string().len())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RecordStore for MemoryStore {
    async fn get(&self, domain: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.records.get(domain).map(|entry| entry.value().clone()))
    }

    async fn set(&self, domain: &str, value: serde_json::Value) -> Result<()> {
        if let Some(quota) = self.quota_bytes {
            let current = self
                .records
                .get(domain)
                .map(|entry| domain.len() + entry.value().to_string().len())
                .unwrap_or(0);
            let projected = self.used_bytes() - current + domain.len() + value.to_string().len();
            if projected > quota {
                return Err(ScriptsiftError::Storage(format!(
                    "quota exceeded: {} of {} bytes",
                    projected, quota
                )));
            }
        }

        trace!("Storing record for {}", domain);
        self.records.insert(domain.to_string(), value);
        Ok(())
    }

    async fn remove(&self, domain: &str) -> Result<()> {
        self.records.remove(domain);
        Ok(())
    }
}
