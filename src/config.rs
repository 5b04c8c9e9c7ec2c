//! Command-line configuration.

use crate::discovery::WatchSettings;
use crate::merger::{DomainRecordMerger, DEFAULT_RETENTION_CAP};
use crate::store::FileStore;
use crate::types::{HttpConfig, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Discover and record the scripts a page loads.
#[derive(Parser, Debug, Clone)]
#[command(name = "scriptsift")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Scan pages and merge what they load into per-domain records
    Scan(ScanConfig),
    /// Print the stored record for a domain
    Show(ShowConfig),
    /// Delete the stored record for a domain
    Clear(ClearConfig),
    /// Download and set up a managed Chromium browser
    Setup(SetupConfig),
}

/// Where records live and how many files each may keep.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Record directory (defaults to ~/.scriptsift/records)
    #[arg(long, env = "SCRIPTSIFT_STORE")]
    pub store: Option<PathBuf>,

    /// Maximum files kept per domain record
    #[arg(long, default_value_t = DEFAULT_RETENTION_CAP)]
    pub retention_cap: usize,
}

impl Default for StoreArgs {
    fn default() -> Self {
        Self {
            store: None,
            retention_cap: DEFAULT_RETENTION_CAP,
        }
    }
}

impl StoreArgs {
    pub fn open(&self) -> Result<FileStore> {
        match &self.store {
            Some(dir) => Ok(FileStore::new(dir)),
            None => FileStore::default_location(),
        }
    }

    /// A merger over the opened store. Upgrades on read honor the same cap as scans.
    pub fn merger(&self) -> Result<DomainRecordMerger<FileStore>> {
        Ok(DomainRecordMerger::new(self.open()?).with_retention_cap(self.retention_cap))
    }
}

/// Configuration for the setup command.
#[derive(Parser, Debug, Clone)]
pub struct SetupConfig {
    /// Force re-download even if Chromium is already installed
    #[arg(long)]
    pub force: bool,
}

/// Configuration for the show command.
#[derive(Parser, Debug, Clone)]
pub struct ShowConfig {
    /// Page domain (hostname) to look up
    pub domain: String,

    #[command(flatten)]
    pub store: StoreArgs,

    /// Print the raw record as JSON
    #[arg(long)]
    pub json: bool,
}

/// Configuration for the clear command.
#[derive(Parser, Debug, Clone)]
pub struct ClearConfig {
    /// Page domain (hostname) to clear
    pub domain: String,

    #[command(flatten)]
    pub store: StoreArgs,
}

/// Configuration for the scan command.
#[derive(Parser, Debug, Clone)]
pub struct ScanConfig {
    /// Target URL(s) to scan
    #[arg(required_unless_present = "file")]
    pub targets: Vec<String>,

    /// File containing URLs to scan (one per line)
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Load pages in headless Chrome and watch them live
    #[arg(long)]
    pub browser: bool,

    /// Fast mode: shorter watch window (may miss late insertions)
    #[arg(long)]
    pub fast: bool,

    /// Path to Chrome/Chromium executable (overrides auto-detection)
    #[arg(long)]
    pub chrome_path: Option<PathBuf>,

    #[command(flatten)]
    pub store: StoreArgs,

    /// Quiet period before discoveries are written, in milliseconds
    #[arg(long, default_value = "300")]
    pub debounce_ms: u64,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    pub timeout: u64,

    /// Maximum retries for failed requests
    #[arg(long, default_value = "3")]
    pub max_retries: u32,

    /// Rate limit (requests per second)
    #[arg(long, default_value = "10")]
    pub rate_limit: u32,

    /// Custom User-Agent string
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Number of pages to scan in parallel
    #[arg(long, short = 'p', default_value = "1")]
    pub parallel: usize,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,

    /// Output file path (defaults to stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Quiet mode: only print the summary
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            file: None,
            browser: false,
            fast: false,
            chrome_path: None,
            store: StoreArgs::default(),
            debounce_ms: 300,
            timeout: 30,
            max_retries: 3,
            rate_limit: 10,
            user_agent: None,
            parallel: 1,
            json: false,
            output: None,
            quiet: false,
        }
    }
}

impl ScanConfig {
    /// Get HTTP configuration from scan config.
    pub fn http_config(&self) -> HttpConfig {
        let defaults = HttpConfig::default();
        HttpConfig {
            timeout_secs: self.timeout,
            max_retries: self.max_retries,
            user_agent: self.user_agent.clone().unwrap_or(defaults.user_agent),
        }
    }

    pub fn watch_settings(&self) -> WatchSettings {
        WatchSettings {
            debounce: Duration::from_millis(self.debounce_ms),
            retention_cap: self.store.retention_cap.max(1),
        }
    }

    /// Load targets from file if specified.
    pub fn load_targets(&self) -> Result<Vec<String>> {
        let mut targets = self.targets.clone();

        if let Some(ref file_path) = self.file {
            let content = std::fs::read_to_string(file_path)?;
            targets.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(str::to_string),
            );
        }

        Ok(targets
            .into_iter()
            .map(|t| {
                if t.starts_with("http://") || t.starts_with("https://") {
                    t
                } else {
                    format!("https://{}", t)
                }
            })
            .collect())
    }
}
