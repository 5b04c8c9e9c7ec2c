//! Persistence gateway for domain records.
//!
//! Records are keyed by raw hostname and stored as JSON values so that older
//! persisted shapes can be read back and upgraded by the merger. No read is
//! isolated from concurrent writers.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::types::Result;
use std::future::Future;

/// Key-value store holding one JSON value per domain.
pub trait RecordStore: Send + Sync + 'static {
    /// Read the stored value for `domain`, if any.
    fn get(&self, domain: &str) -> impl Future<Output = Result<Option<serde_json::Value>>> + Send;

    /// Replace the stored value for `domain`.
    fn set(&self, domain: &str, value: serde_json::Value) -> impl Future<Output = Result<()>> + Send;

    /// Remove the stored value for `domain`. Removing a missing key succeeds.
    fn remove(&self, domain: &str) -> impl Future<Output = Result<()>> + Send;
}
