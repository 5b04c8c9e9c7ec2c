//! Merging discovery batches into persisted per-domain records.
//!
//! Merges are additive and idempotent per field: URLs are unique by exact
//! string, inline entries by hash, SRI entries by `(url, integrity)`. The CSP
//! string is latest-wins. When the file list exceeds the retention cap the
//! oldest entries are evicted first.

use crate::parser::{filename_of, host_of, normalize};
use crate::store::RecordStore;
use crate::types::{
    now_millis, DiscoveryBatch, DomainRecord, Result, ScriptReference, ScriptSource,
    ScriptsiftError, Timestamp,
};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default maximum number of files kept per domain.
pub const DEFAULT_RETENTION_CAP: usize = 500;

/// What a merge changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub added_files: usize,
    pub added_inlines: usize,
    pub added_sri: usize,
    pub csp_changed: bool,
    pub evicted: usize,
}

/// Result of a persisted merge.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub record: DomainRecord,
    pub stats: MergeStats,
}

/// Apply `batch` to `record` at time `now`, then enforce `cap`.
pub fn apply_batch(record: &mut DomainRecord, batch: &DiscoveryBatch, now: Timestamp, cap: usize) -> MergeStats {
    let mut stats = MergeStats::default();

    for candidate in &batch.urls {
        if record.contains_url(&candidate.url) {
            continue;
        }
        record.files.push(script_reference(&candidate.url, candidate.source, now));
        stats.added_files += 1;
    }

    for inline in &batch.inlines {
        if record.contains_inline(inline.hash) {
            continue;
        }
        record.inlines.push(inline.clone());
        stats.added_inlines += 1;
    }

    if let Some(csp) = &batch.csp {
        stats.csp_changed = record.csp.as_ref() != Some(csp);
        record.csp = Some(csp.clone());
    }

    for sri in &batch.sri {
        let present = record
            .sri
            .iter()
            .any(|s| s.url == sri.url && s.integrity == sri.integrity);
        if !present {
            record.sri.push(sri.clone());
            stats.added_sri += 1;
        }
    }

    stats.evicted = enforce_retention(record, cap);
    refresh_metadata(record, now);
    stats
}

/// Evict the oldest files until at most `cap` remain. Ties on timestamp are
/// broken by position, so later-appended entries count as newer. Survivors
/// keep their original order.
pub fn enforce_retention(record: &mut DomainRecord, cap: usize) -> usize {
    let len = record.files.len();
    if len <= cap {
        return 0;
    }

    let mut by_age: Vec<usize> = (0..len).collect();
    by_age.sort_by(|&a, &b| {
        record.files[b]
            .discovered_at
            .cmp(&record.files[a].discovered_at)
            .then(b.cmp(&a))
    });

    let mut keep = vec![false; len];
    for &idx in by_age.iter().take(cap) {
        keep[idx] = true;
    }

    let mut position = 0;
    record.files.retain(|_| {
        let kept = keep[position];
        position += 1;
        kept
    });

    len - cap
}

fn refresh_metadata(record: &mut DomainRecord, now: Timestamp) {
    record.metadata.last_updated = now;
    record.metadata.total_files = record.files.len();
    record.metadata.total_inlines = record.inlines.len();
}

fn script_reference(url: &str, source: ScriptSource, now: Timestamp) -> ScriptReference {
    ScriptReference {
        url: url.to_string(),
        domain: host_of(url).unwrap_or_default(),
        discovered_at: now,
        source,
        filename: filename_of(url),
    }
}

/// Decode a stored value, upgrading older shapes.
///
/// Returns the record and whether an upgrade took place. Accepted shapes:
/// the current record; a bare array of URL strings or partial file objects;
/// an object whose `files` hold strings or partial objects; an object with a
/// `urls` array.
pub fn upgrade_stored(domain: &str, value: Value, now: Timestamp) -> Result<(DomainRecord, bool)> {
    let corrupt = |reason: &str| ScriptsiftError::CorruptRecord {
        domain: domain.to_string(),
        reason: reason.to_string(),
    };

    match value {
        Value::Null => Ok((DomainRecord::default(), false)),
        Value::Array(items) => {
            let mut record = DomainRecord::default();
            push_legacy_files(&mut record, &items, now);
            refresh_metadata(&mut record, now);
            info!("Upgraded legacy URL list for {} ({} files)", domain, record.files.len());
            Ok((record, true))
        }
        Value::Object(ref map) => {
            if map.contains_key("files") || map.contains_key("inlines") || map.contains_key("metadata") {
                if let Ok(record) = serde_json::from_value::<DomainRecord>(value.clone()) {
                    return Ok((record, false));
                }
            }

            let legacy_files = map
                .get("files")
                .or_else(|| map.get("urls"))
                .and_then(Value::as_array)
                .ok_or_else(|| corrupt("object without a files or urls list"))?;

            let mut record = DomainRecord::default();
            push_legacy_files(&mut record, legacy_files, now);
            record.inlines = map
                .get("inlines")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            record.csp = map.get("csp").and_then(Value::as_str).map(str::to_string);
            record.sri = map
                .get("sri")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            refresh_metadata(&mut record, now);
            info!("Upgraded partial record for {} ({} files)", domain, record.files.len());
            Ok((record, true))
        }
        _ => Err(corrupt("unexpected JSON type")),
    }
}

fn push_legacy_files(record: &mut DomainRecord, items: &[Value], now: Timestamp) {
    for item in items {
        let raw = item
            .as_str()
            .or_else(|| item.get("url").and_then(Value::as_str));
        let Some(url) = raw.and_then(|r| normalize(r, "")).map(|u| u.to_string()) else {
            warn!("Dropping unreadable legacy entry: {}", item);
            continue;
        };
        if record.contains_url(&url) {
            continue;
        }

        let source = item
            .get("source")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(ScriptSource::Legacy);
        let discovered_at = item
            .get("discoveredAt")
            .or_else(|| item.get("timestamp"))
            .and_then(Value::as_i64)
            .unwrap_or(now);

        record.files.push(script_reference(&url, source, discovered_at));
    }
}

/// Merges batches into the records held by a store.
///
/// Read-modify-write cycles on one domain are serialized within this merger.
/// Writers in other processes sharing the store are not excluded.
pub struct DomainRecordMerger<S> {
    store: S,
    retention_cap: usize,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<S: RecordStore> DomainRecordMerger<S> {
    /// Create a merger with the default retention cap.
    pub fn new(store: S) -> Self {
        Self {
            store,
            retention_cap: DEFAULT_RETENTION_CAP,
            locks: DashMap::new(),
        }
    }

    /// Set the per-domain file cap (minimum 1).
    pub fn with_retention_cap(mut self, cap: usize) -> Self {
        self.retention_cap = cap.max(1);
        self
    }

    pub fn retention_cap(&self) -> usize {
        self.retention_cap
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn lock_for(&self, domain: &str) -> Arc<Mutex<()>> {
        self.locks.entry(domain.to_string()).or_default().clone()
    }

    /// Merge `batch` into the record for `domain` and write it back.
    pub async fn merge(&self, domain: &str, batch: &DiscoveryBatch) -> Result<MergeOutcome> {
        self.merge_at(domain, batch, now_millis()).await
    }

    /// Merge with an explicit timestamp for new entries.
    pub async fn merge_at(&self, domain: &str, batch: &DiscoveryBatch, now: Timestamp) -> Result<MergeOutcome> {
        let lock = self.lock_for(domain);
        let _guard = lock.lock().await;

        let mut record = match self.store.get(domain).await? {
            Some(value) => upgrade_stored(domain, value, now)?.0,
            None => DomainRecord::default(),
        };

        let stats = apply_batch(&mut record, batch, now, self.retention_cap);
        self.store.set(domain, serde_json::to_value(&record)?).await?;

        debug!(
            "Merged into {}: +{} files, +{} inlines, {} evicted ({} total)",
            domain, stats.added_files, stats.added_inlines, stats.evicted, record.files.len()
        );
        Ok(MergeOutcome { record, stats })
    }

    /// Read the record for `domain`, writing back an upgraded legacy shape.
    pub async fn load(&self, domain: &str) -> Result<Option<DomainRecord>> {
        let lock = self.lock_for(domain);
        let _guard = lock.lock().await;

        let Some(value) = self.store.get(domain).await? else {
            return Ok(None);
        };
        let (mut record, upgraded) = upgrade_stored(domain, value, now_millis())?;
        if upgraded {
            let evicted = enforce_retention(&mut record, self.retention_cap);
            if evicted > 0 {
                refresh_metadata(&mut record, now_millis());
            }
            self.store.set(domain, serde_json::to_value(&record)?).await?;
        }
        Ok(Some(record))
    }

    /// Remove the record for `domain`.
    pub async fn clear(&self, domain: &str) -> Result<()> {
        let lock = self.lock_for(domain);
        let _guard = lock.lock().await;
        self.store.remove(domain).await?;
        info!("Cleared record for {}", domain);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{DiscoveredUrl, InlineScriptEntry, SriEntry};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn url(u: &str) -> DiscoveredUrl {
        DiscoveredUrl {
            url: u.to_string(),
            source: ScriptSource::Dom,
        }
    }

    fn inline(hash: i32, snippet: &str, signals: &[&str]) -> InlineScriptEntry {
        InlineScriptEntry {
            hash,
            snippet: snippet.to_string(),
            suspicious_signals: signals.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            length: snippet.len(),
        }
    }

    fn batch(urls: &[&str]) -> DiscoveryBatch {
        DiscoveryBatch {
            domain: "a.com".to_string(),
            urls: urls.iter().map(|u| url(u)).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_merge_into_empty_record() {
        let merger = DomainRecordMerger::new(MemoryStore::new());
        let mut b = batch(&["https://a.com/a.js", "https://cdn.b.com/lib/b.js"]);
        b.inlines.push(inline(7, "eval(x)", &["eval"]));
        b.csp = Some("script-src 'self'".to_string());

        let outcome = merger.merge_at("a.com", &b, 1_000).await.unwrap();
        let record = outcome.record;
        assert_eq!(record.files.len(), 2);
        assert_eq!(record.files[1].domain, "cdn.b.com");
        assert_eq!(record.files[1].filename, "b.js");
        assert_eq!(record.files[0].discovered_at, 1_000);
        assert_eq!(record.metadata.total_files, 2);
        assert_eq!(record.metadata.total_inlines, 1);
        assert_eq!(record.metadata.last_updated, 1_000);
        assert_eq!(outcome.stats.added_files, 2);

        let stored = merger.load("a.com").await.unwrap().unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let merger = DomainRecordMerger::new(MemoryStore::new());
        let mut b = batch(&["https://a.com/a.js", "https://a.com/b.js"]);
        b.inlines.push(inline(1, "x()", &[]));
        b.sri.push(SriEntry {
            url: "https://a.com/a.js".to_string(),
            integrity: "sha384-abc".to_string(),
            algorithm: "sha384".to_string(),
        });

        let once = merger.merge_at("a.com", &b, 10).await.unwrap().record;
        let twice = merger.merge_at("a.com", &b, 20).await.unwrap();

        assert_eq!(twice.stats.added_files, 0);
        assert_eq!(twice.stats.added_inlines, 0);
        assert_eq!(twice.stats.added_sri, 0);
        assert_eq!(once.files, twice.record.files);
        assert_eq!(once.inlines, twice.record.inlines);
        assert_eq!(once.sri, twice.record.sri);
        assert_eq!(twice.record.metadata.last_updated, 20);
    }

    #[tokio::test]
    async fn test_merge_order_does_not_change_url_set() {
        let urls = ["https://a.com/1.js", "https://a.com/2.js", "https://a.com/3.js"];

        let forward = DomainRecordMerger::new(MemoryStore::new());
        forward.merge_at("a.com", &batch(&urls[..2]), 1).await.unwrap();
        let f = forward.merge_at("a.com", &batch(&urls[1..]), 2).await.unwrap().record;

        let reverse = DomainRecordMerger::new(MemoryStore::new());
        reverse.merge_at("a.com", &batch(&urls[1..]), 1).await.unwrap();
        let r = reverse.merge_at("a.com", &batch(&urls[..2]), 2).await.unwrap().record;

        let set = |rec: &DomainRecord| rec.files.iter().map(|f| f.url.clone()).collect::<BTreeSet<_>>();
        assert_eq!(set(&f), set(&r));
        assert_eq!(f.files.len(), 3);
    }

    #[tokio::test]
    async fn test_inline_first_seen_wins() {
        let merger = DomainRecordMerger::new(MemoryStore::new());
        let mut first = batch(&[]);
        first.inlines.push(inline(42, "first", &["eval"]));
        let mut second = batch(&[]);
        second.inlines.push(inline(42, "second", &[]));
        second.inlines.push(inline(42, "third", &[]));

        merger.merge_at("a.com", &first, 1).await.unwrap();
        let record = merger.merge_at("a.com", &second, 2).await.unwrap().record;

        assert_eq!(record.inlines.len(), 1);
        assert_eq!(record.inlines[0].snippet, "first");
        assert!(record.inlines[0].suspicious_signals.contains("eval"));
    }

    #[tokio::test]
    async fn test_csp_latest_wins() {
        let merger = DomainRecordMerger::new(MemoryStore::new());
        let mut a = batch(&[]);
        a.csp = Some("policy-A".to_string());
        let mut b = batch(&[]);
        b.csp = Some("policy-B".to_string());

        merger.merge_at("a.com", &a, 1).await.unwrap();
        let outcome = merger.merge_at("a.com", &b, 2).await.unwrap();
        assert_eq!(outcome.record.csp.as_deref(), Some("policy-B"));
        assert!(outcome.stats.csp_changed);

        // A batch without CSP leaves the stored value alone.
        let record = merger.merge_at("a.com", &batch(&[]), 3).await.unwrap().record;
        assert_eq!(record.csp.as_deref(), Some("policy-B"));
    }

    #[tokio::test]
    async fn test_retention_keeps_newest() {
        let cap = 5;
        let merger = DomainRecordMerger::new(MemoryStore::new()).with_retention_cap(cap);

        let mut last = DomainRecord::default();
        for i in 0..12 {
            let u = format!("https://a.com/f{}.js", i);
            last = merger.merge_at("a.com", &batch(&[&u]), 100 + i).await.unwrap().record;
        }

        let kept: Vec<&str> = last.files.iter().map(|f| f.url.as_str()).collect();
        assert_eq!(
            kept,
            vec![
                "https://a.com/f7.js",
                "https://a.com/f8.js",
                "https://a.com/f9.js",
                "https://a.com/f10.js",
                "https://a.com/f11.js",
            ]
        );
        assert_eq!(last.metadata.total_files, cap);
    }

    #[test]
    fn test_retention_within_one_batch_keeps_later_entries() {
        let mut record = DomainRecord::default();
        let b = batch(&["https://a.com/1.js", "https://a.com/2.js", "https://a.com/3.js"]);
        let stats = apply_batch(&mut record, &b, 5, 2);
        assert_eq!(stats.evicted, 1);
        assert_eq!(record.files[0].url, "https://a.com/2.js");
        assert_eq!(record.files[1].url, "https://a.com/3.js");
    }

    #[tokio::test]
    async fn test_legacy_bare_list_upgrade() {
        let store = MemoryStore::new();
        store.set("a.com", json!(["https://a.com/x.js", "not a url", 5])).await.unwrap();
        let merger = DomainRecordMerger::new(store.clone());

        let record = merger.load("a.com").await.unwrap().unwrap();
        assert_eq!(record.files.len(), 1);
        assert_eq!(record.files[0].url, "https://a.com/x.js");
        assert_eq!(record.files[0].source, ScriptSource::Legacy);
        assert_eq!(record.files[0].filename, "x.js");
        assert!(record.inlines.is_empty());
        assert_eq!(record.metadata.total_files, 1);

        // Upgraded in place.
        let stored = store.get("a.com").await.unwrap().unwrap();
        assert!(stored.is_object());
        assert_eq!(stored["files"][0]["source"], "legacy");
    }

    #[tokio::test]
    async fn test_merge_over_legacy_record_preserves_urls() {
        let store = MemoryStore::new();
        store.set("a.com", json!(["https://a.com/old.js"])).await.unwrap();
        let merger = DomainRecordMerger::new(store);

        let record = merger
            .merge_at("a.com", &batch(&["https://a.com/new.js", "https://a.com/old.js"]), 50)
            .await
            .unwrap()
            .record;
        let urls: Vec<&str> = record.files.iter().map(|f| f.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a.com/old.js", "https://a.com/new.js"]);
        assert_eq!(record.files[0].source, ScriptSource::Legacy);
    }

    #[test]
    fn test_partial_object_upgrade() {
        let value = json!({
            "files": ["https://a.com/a.js", {"url": "https://a.com/b.js", "timestamp": 9}],
            "csp": "default-src 'self'"
        });
        let (record, upgraded) = upgrade_stored("a.com", value, 100).unwrap();
        assert!(upgraded);
        assert_eq!(record.files.len(), 2);
        assert_eq!(record.files[1].discovered_at, 9);
        assert_eq!(record.csp.as_deref(), Some("default-src 'self'"));

        let (record, upgraded) = upgrade_stored("a.com", json!({"urls": ["https://a.com/u.js"]}), 1).unwrap();
        assert!(upgraded);
        assert_eq!(record.files[0].url, "https://a.com/u.js");
    }

    #[test]
    fn test_current_shape_is_not_upgraded() {
        let mut record = DomainRecord::default();
        apply_batch(&mut record, &batch(&["https://a.com/a.js"]), 3, 10);
        let value = serde_json::to_value(&record).unwrap();

        let (decoded, upgraded) = upgrade_stored("a.com", value, 99).unwrap();
        assert!(!upgraded);
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_unreadable_shapes_are_errors() {
        assert!(upgrade_stored("a.com", json!("just a string"), 1).is_err());
        assert!(upgrade_stored("a.com", json!({"other": true}), 1).is_err());
    }

    #[tokio::test]
    async fn test_clear_removes_record() {
        let merger = DomainRecordMerger::new(MemoryStore::new());
        merger.merge_at("a.com", &batch(&["https://a.com/a.js"]), 1).await.unwrap();
        merger.clear("a.com").await.unwrap();
        assert!(merger.load("a.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_storage_failure_surfaces() {
        let merger = DomainRecordMerger::new(MemoryStore::with_quota(16));
        let err = merger
            .merge_at("a.com", &batch(&["https://a.com/a.js"]), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptsiftError::Storage(_)));
        assert!(merger.load("a.com").await.unwrap().is_none());
    }
}
