//! scriptsift - discover the JavaScript a page loads and keep per-domain records.
//!
//! A page session watches one page, scanning its document, DOM insertions and
//! network completions for script references, inline scripts, CSP and SRI
//! data. Discoveries are debounced, then merged into a deduplicated record per
//! page domain:
//! - URLs are normalized and classified as JavaScript-like
//! - Inline scripts are fingerprinted and checked for suspicious constructs
//! - Records keep the newest files under a retention cap
//! - Legacy record shapes are upgraded on read
//!
//! # Example
//!
//! ```no_run
//! use scriptsift::config::ScanConfig;
//! use scriptsift::scanner::Scanner;
//! use scriptsift::store::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() {
//!     let scanner = Scanner::new(&ScanConfig::default(), MemoryStore::new(), false).unwrap();
//!     let report = scanner.scan("https://example.com").await;
//!     println!("Found {} script references", report.urls_discovered);
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod merger;
pub mod notify;
pub mod parser;
pub mod scanner;
pub mod service;
pub mod store;
pub mod types;

pub mod browser;

pub use config::{Commands, Config, ScanConfig, SetupConfig};
pub use merger::DomainRecordMerger;
pub use scanner::Scanner;
pub use service::{Message, RecordService, Reply};
pub use types::{
    DiscoveredUrl, DiscoveryBatch, DomainRecord, InlineScriptEntry, Result, ScanReport, ScriptReference,
    ScriptSource, ScriptsiftError, SriEntry,
};
