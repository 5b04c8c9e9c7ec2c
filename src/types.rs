//! Core types and errors for script discovery and per-domain records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors that can occur while discovering or persisting script references.
#[derive(Error, Debug)]
pub enum ScriptsiftError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Stored record for {domain} is unreadable: {reason}")]
    CorruptRecord { domain: String, reason: String },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, ScriptsiftError>;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or_default()
}

/// Where a script reference was discovered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScriptSource {
    /// Observed as a completed script request.
    Network,
    /// `<script src>` element in the document.
    #[default]
    Dom,
    /// Import-map target or `import()` literal in an inline module.
    DynamicImport,
    /// `modulepreload` / script `preload` hint.
    Preload,
    /// Hyperlink pointing at a JS-like target.
    Link,
    /// Upgraded from a pre-record bare URL list.
    Legacy,
}

impl ScriptSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptSource::Network => "network",
            ScriptSource::Dom => "dom",
            ScriptSource::DynamicImport => "dynamic_import",
            ScriptSource::Preload => "preload",
            ScriptSource::Link => "link",
            ScriptSource::Legacy => "legacy",
        }
    }
}

/// One discovered JavaScript resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScriptReference {
    /// Absolute, normalized URL.
    pub url: String,
    /// Hostname of `url`.
    pub domain: String,
    pub discovered_at: Timestamp,
    pub source: ScriptSource,
    /// Last path segment, or `"unknown"`.
    pub filename: String,
}

/// Fingerprint of one inline `<script>` body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InlineScriptEntry {
    pub hash: i32,
    /// Bounded prefix of the body, for identification only.
    pub snippet: String,
    #[serde(default)]
    pub suspicious_signals: BTreeSet<String>,
    /// Body length in characters.
    pub length: usize,
}

/// A Subresource-Integrity observation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SriEntry {
    pub url: String,
    pub integrity: String,
    pub algorithm: String,
}

/// Bookkeeping recomputed on every merge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    pub last_updated: Timestamp,
    pub total_files: usize,
    pub total_inlines: usize,
}

/// The persisted unit, one per domain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DomainRecord {
    #[serde(default)]
    pub files: Vec<ScriptReference>,
    #[serde(default)]
    pub inlines: Vec<InlineScriptEntry>,
    #[serde(default)]
    pub csp: Option<String>,
    #[serde(default)]
    pub sri: Vec<SriEntry>,
    #[serde(default)]
    pub metadata: RecordMetadata,
}

impl DomainRecord {
    pub fn contains_url(&self, url: &str) -> bool {
        self.files.iter().any(|f| f.url == url)
    }

    pub fn contains_inline(&self, hash: i32) -> bool {
        self.inlines.iter().any(|i| i.hash == hash)
    }
}

/// A URL candidate together with the source that found it.
///
/// Also accepted as a bare URL string, which reads as a DOM discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(from = "DiscoveredUrlRepr")]
pub struct DiscoveredUrl {
    pub url: String,
    pub source: ScriptSource,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DiscoveredUrlRepr {
    Bare(String),
    Tagged {
        url: String,
        #[serde(default)]
        source: ScriptSource,
    },
}

impl From<DiscoveredUrlRepr> for DiscoveredUrl {
    fn from(repr: DiscoveredUrlRepr) -> Self {
        match repr {
            DiscoveredUrlRepr::Bare(url) => Self {
                url,
                source: ScriptSource::Dom,
            },
            DiscoveredUrlRepr::Tagged { url, source } => Self { url, source },
        }
    }
}

/// Discovery batch handed from a page session to the record owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DiscoveryBatch {
    /// Page hostname the batch belongs to.
    pub domain: String,
    #[serde(default)]
    pub urls: Vec<DiscoveredUrl>,
    #[serde(default)]
    pub inlines: Vec<InlineScriptEntry>,
    #[serde(default)]
    pub csp: Option<String>,
    #[serde(default)]
    pub sri: Vec<SriEntry>,
}

impl DiscoveryBatch {
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty() && self.inlines.is_empty() && self.csp.is_none() && self.sri.is_empty()
    }
}

/// Result of scanning a single target.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub target: String,
    /// Page domain the session ended on, if a document was seen.
    pub domain: Option<String>,
    pub urls_discovered: usize,
    pub inlines_discovered: usize,
    pub writes: usize,
    pub failed_writes: usize,
    /// Stored record after the scan.
    pub record: Option<DomainRecord>,
    pub errors: Vec<String>,
    pub duration_secs: f64,
}

impl ScanReport {
    pub fn failed(target: &str, error: String) -> Self {
        Self {
            target: target.to_string(),
            domain: None,
            urls_discovered: 0,
            inlines_discovered: 0,
            writes: 0,
            failed_writes: 0,
            record: None,
            errors: vec![error],
            duration_secs: 0.0,
        }
    }
}

/// Configuration for HTTP requests.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            user_agent: "Mozilla/5.0 (compatible; scriptsift/0.1)".to_string(),
        }
    }
}
