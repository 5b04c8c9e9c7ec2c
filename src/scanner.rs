//! Scanner wiring event sources, page sessions and the record service together.

use crate::config::ScanConfig;
use crate::discovery::{BrowserCapture, PageEvent, PageFetcher, PageSession, WatchSettings};
use crate::merger::DomainRecordMerger;
use crate::notify::ConsoleOutput;
use crate::service::RecordService;
use crate::store::RecordStore;
use crate::types::{Result, ScanReport};
use futures::stream::{self, StreamExt};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Event channel depth per page.
const EVENT_BUFFER: usize = 256;

/// Where page events come from.
pub enum EventSource {
    /// One HTTP fetch per target.
    Fetch(PageFetcher),
    /// Live headless browser session per target.
    Browser(BrowserCapture),
}

impl EventSource {
    async fn drive(&self, target: &str, events: mpsc::Sender<PageEvent>) -> Result<()> {
        match self {
            EventSource::Fetch(fetcher) => fetcher.drive(target, events).await,
            EventSource::Browser(capture) => capture.capture(target, events).await,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            EventSource::Fetch(_) => "fetch",
            EventSource::Browser(_) => "browser",
        }
    }
}

/// Main scanner: one page session per target, all sharing a record service.
pub struct Scanner<S> {
    source: EventSource,
    service: Arc<RecordService<S>>,
    settings: WatchSettings,
    enabled: Arc<AtomicBool>,
    parallel: usize,
    console: ConsoleOutput,
}

impl<S: RecordStore> Scanner<S> {
    /// Create a new scanner writing to `store`.
    pub fn new(config: &ScanConfig, store: S, verbose: bool) -> Result<Self> {
        let settings = config.watch_settings();

        let source = if config.browser {
            // Explicit flag > managed install > system default
            let chrome_exe = config
                .chrome_path
                .clone()
                .or_else(crate::browser::resolve_chrome_executable);
            EventSource::Browser(
                BrowserCapture::new(config.timeout, true)
                    .with_fast_mode(config.fast)
                    .with_chrome_executable(chrome_exe),
            )
        } else {
            EventSource::Fetch(PageFetcher::new(config.http_config(), config.rate_limit)?)
        };

        let merger = DomainRecordMerger::new(store).with_retention_cap(settings.retention_cap);

        Ok(Self {
            source,
            service: Arc::new(RecordService::new(merger)),
            settings,
            enabled: Arc::new(AtomicBool::new(true)),
            parallel: config.parallel.max(1),
            console: ConsoleOutput::new(verbose, config.json, config.quiet),
        })
    }

    pub fn service(&self) -> &Arc<RecordService<S>> {
        &self.service
    }

    /// Switch shared by every session this scanner starts.
    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        self.enabled.clone()
    }

    /// Scan a single target URL.
    pub async fn scan(&self, target: &str) -> ScanReport {
        let start_time = Instant::now();
        self.console.print_scan_start(target);
        self.console
            .print_progress(&format!("Driving page with {} source", self.source.name()));

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let session = PageSession::new(self.service.clone(), &self.settings).with_enabled_flag(self.enabled.clone());

        // The source owns the sender; the session ends when it is dropped.
        let (source_result, stats) = tokio::join!(self.source.drive(target, tx), session.run(rx));

        let mut errors = Vec::new();
        if let Err(e) = source_result {
            warn!("Event source failed for {}: {}", target, e);
            errors.push(format!("{} source failed: {}", self.source.name(), e));
        }
        if stats.failed_writes > 0 {
            errors.push(format!("{} record write(s) failed", stats.failed_writes));
        }

        let record = match &stats.domain {
            Some(domain) => match self.service.record(domain).await {
                Ok(record) => record,
                Err(e) => {
                    errors.push(format!("Failed to read record for {}: {}", domain, e));
                    None
                }
            },
            None => None,
        };

        debug!(
            "Session for {} ended: {} scans, {} writes",
            target, stats.scans, stats.writes
        );

        let report = ScanReport {
            target: target.to_string(),
            domain: stats.domain,
            urls_discovered: stats.urls_seen,
            inlines_discovered: stats.inlines_seen,
            writes: stats.writes,
            failed_writes: stats.failed_writes,
            record,
            errors,
            duration_secs: start_time.elapsed().as_secs_f64(),
        };

        self.console.print_summary(&report);
        report
    }

    /// Scan several targets concurrently. Reports come back in input order.
    pub async fn scan_multiple(&self, targets: Vec<String>) -> Vec<ScanReport> {
        let pb = if targets.len() > 1 {
            self.console.create_progress_bar(targets.len() as u64, "pages")
        } else {
            None
        };

        let mut indexed: Vec<(usize, ScanReport)> = stream::iter(targets.into_iter().enumerate())
            .map(|(idx, target)| {
                let pb = pb.clone();
                async move {
                    let report = self.scan(&target).await;
                    if let Some(pb) = pb {
                        pb.inc(1);
                    }
                    (idx, report)
                }
            })
            .buffer_unordered(self.parallel)
            .collect()
            .await;

        if let Some(pb) = pb {
            pb.finish_and_clear();
        }

        indexed.sort_by_key(|(idx, _)| *idx);
        indexed.into_iter().map(|(_, r)| r).collect()
    }
}
