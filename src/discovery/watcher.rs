//! Per-page session deciding when to scan and when to persist.
//!
//! A session moves `Idle -> Scanning -> Debouncing -> Idle`. Page-ready,
//! navigation commits, relevant DOM insertions and script network completions
//! trigger a scan. If the scan produced anything not yet persisted in this
//! session, the debounce window is (re)started; only when it elapses
//! uninterrupted is a discovery batch sent to the record service.
//!
//! The candidate cache is owned by the session and discarded on navigation.
//! On a failed write the pending candidates stay queued and are retried by the
//! next trigger.

use crate::discovery::debounce::Debouncer;
use crate::discovery::events::{NetworkCompletion, PageEvent};
use crate::discovery::page_scanner::{DocumentSnapshot, PageScanner, ScanOutput};
use crate::merger::DEFAULT_RETENTION_CAP;
use crate::parser::{host_of, is_javascript_like, normalize};
use crate::service::{Message, RecordService};
use crate::store::RecordStore;
use crate::types::{DiscoveryBatch, Result, ScriptSource};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Default debounce window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Tunables for a page session.
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub debounce: Duration,
    pub retention_cap: usize,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            retention_cap: DEFAULT_RETENTION_CAP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Scanning,
    Debouncing,
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub scans: usize,
    pub writes: usize,
    pub failed_writes: usize,
    pub skipped_disabled: usize,
    /// Domain of the last document seen.
    pub domain: Option<String>,
    pub urls_seen: usize,
    pub inlines_seen: usize,
}

/// What this session has already written for its current domain.
#[derive(Debug, Default)]
struct PersistedMarks {
    urls: HashSet<String>,
    hashes: HashSet<i32>,
    csp: Option<String>,
    sri: HashSet<(String, String)>,
}

impl PersistedMarks {
    fn record(&mut self, batch: &DiscoveryBatch) {
        self.urls.extend(batch.urls.iter().map(|u| u.url.clone()));
        self.hashes.extend(batch.inlines.iter().map(|i| i.hash));
        if batch.csp.is_some() {
            self.csp = batch.csp.clone();
        }
        self.sri
            .extend(batch.sri.iter().map(|s| (s.url.clone(), s.integrity.clone())));
    }
}

/// Session-scoped discovery state for one page.
pub struct PageSession<S> {
    service: Arc<RecordService<S>>,
    scanner: PageScanner,
    debouncer: Debouncer,
    enabled: Arc<AtomicBool>,
    state: WatchState,
    domain: Option<String>,
    base_url: Option<String>,
    cache: ScanOutput,
    persisted: PersistedMarks,
    stats: SessionStats,
}

impl<S: RecordStore> PageSession<S> {
    /// Create a session that persists through `service`.
    pub fn new(service: Arc<RecordService<S>>, settings: &WatchSettings) -> Self {
        Self {
            service,
            scanner: PageScanner::new(),
            debouncer: Debouncer::new(settings.debounce),
            enabled: Arc::new(AtomicBool::new(true)),
            state: WatchState::Idle,
            domain: None,
            base_url: None,
            cache: ScanOutput::default(),
            persisted: PersistedMarks::default(),
            stats: SessionStats::default(),
        }
    }

    /// Share an on/off switch; it is checked once per trigger.
    pub fn with_enabled_flag(mut self, enabled: Arc<AtomicBool>) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn candidates(&self) -> &ScanOutput {
        &self.cache
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// React to one event. Returns an error only when a forced write failed.
    pub async fn handle(&mut self, event: PageEvent) -> Result<()> {
        trace!("Session event: {}", event.name());

        let control = matches!(event, PageEvent::Flush | PageEvent::Teardown);
        if !control && !self.is_enabled() {
            self.stats.skipped_disabled += 1;
            return Ok(());
        }

        match event {
            PageEvent::Ready(snapshot) => {
                let switched = self
                    .domain
                    .as_deref()
                    .is_some_and(|d| host_of(&snapshot.url).as_deref() != Some(d));
                if switched {
                    self.start_new_document(&snapshot).await;
                } else {
                    self.adopt_document(&snapshot);
                }
                self.scan_document(&snapshot);
            }
            PageEvent::NavigationCommitted(snapshot) => {
                self.start_new_document(&snapshot).await;
                self.scan_document(&snapshot);
            }
            PageEvent::DomMutation { added, removed } => {
                trace!("Mutation batch: {} added, {} removed", added.len(), removed);
                let Some(base) = self.base_url.clone() else {
                    trace!("Mutation before first document, ignoring");
                    return Ok(());
                };
                let output = self.begin_scan(|scanner| scanner.scan_fragments(&base, &added));
                self.finish_scan(output);
            }
            PageEvent::NetworkCompleted(completion) => {
                let output = self.begin_scan(|_| network_candidates(&completion));
                self.finish_scan(output);
            }
            PageEvent::Flush => {
                if self.is_enabled() {
                    return self.persist_pending().await;
                }
            }
            PageEvent::Teardown => self.teardown(),
        }

        Ok(())
    }

    /// Drive the session from a channel until it closes or a teardown arrives.
    ///
    /// Pending data is flushed when the channel closes; a teardown cancels the
    /// pending window instead.
    pub async fn run(mut self, mut events: mpsc::Receiver<PageEvent>) -> SessionStats {
        enum Step {
            Event(Option<PageEvent>),
            Fire,
        }

        loop {
            let step = {
                let fired = self.debouncer.fired();
                tokio::select! {
                    event = events.recv() => Step::Event(event),
                    _ = fired => Step::Fire,
                }
            };

            match step {
                Step::Fire => self.window_elapsed().await,
                Step::Event(Some(PageEvent::Teardown)) => {
                    self.teardown();
                    break;
                }
                Step::Event(Some(event)) => {
                    if let Err(e) = self.handle(event).await {
                        debug!("Session event failed: {}", e);
                    }
                }
                Step::Event(None) => {
                    if self.is_enabled() {
                        let _ = self.persist_pending().await;
                    }
                    self.teardown();
                    break;
                }
            }
        }

        self.stats.clone()
    }

    /// The debounce window closed without another trigger.
    pub async fn window_elapsed(&mut self) {
        if self.is_enabled() {
            // Failure is logged and retried on the next trigger.
            let _ = self.persist_pending().await;
        } else {
            self.debouncer.cancel();
            self.state = WatchState::Idle;
        }
    }

    /// Write everything not yet persisted for the current domain.
    pub async fn persist_pending(&mut self) -> Result<()> {
        self.debouncer.cancel();

        let Some(batch) = self.pending_batch() else {
            self.state = WatchState::Idle;
            return Ok(());
        };

        debug!(
            "Persisting batch for {}: {} urls, {} inlines",
            batch.domain,
            batch.urls.len(),
            batch.inlines.len()
        );

        match self.service.handle(Message::Discovery(batch.clone())).await {
            Ok(_) => {
                self.persisted.record(&batch);
                self.stats.writes += 1;
                self.state = WatchState::Idle;
                Ok(())
            }
            Err(e) => {
                warn!("Failed to persist batch for {}: {}", batch.domain, e);
                self.stats.failed_writes += 1;
                self.state = WatchState::Idle;
                Err(e)
            }
        }
    }

    /// Candidates not yet persisted, as a batch for the current domain.
    pub fn pending_batch(&self) -> Option<DiscoveryBatch> {
        let domain = self.domain.clone()?;
        let batch = DiscoveryBatch {
            domain,
            urls: self
                .cache
                .urls
                .iter()
                .filter(|u| !self.persisted.urls.contains(&u.url))
                .cloned()
                .collect(),
            inlines: self
                .cache
                .inlines
                .iter()
                .filter(|i| !self.persisted.hashes.contains(&i.hash))
                .cloned()
                .collect(),
            csp: self
                .cache
                .csp
                .clone()
                .filter(|csp| self.persisted.csp.as_ref() != Some(csp)),
            sri: self
                .cache
                .sri
                .iter()
                .filter(|s| !self.persisted.sri.contains(&(s.url.clone(), s.integrity.clone())))
                .cloned()
                .collect(),
        };

        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }

    /// Full-document scan. Later fragments resolve against its `<base href>`.
    fn scan_document(&mut self, snapshot: &DocumentSnapshot) {
        let output = self.begin_scan(|scanner| scanner.scan(snapshot));
        self.base_url = Some(output.base_url.clone());
        self.finish_scan(output);
    }

    fn begin_scan<F>(&mut self, scan: F) -> ScanOutput
    where
        F: FnOnce(&PageScanner) -> ScanOutput,
    {
        self.state = WatchState::Scanning;
        self.stats.scans += 1;
        scan(&self.scanner)
    }

    fn finish_scan(&mut self, output: ScanOutput) {
        self.cache.absorb(output);
        self.stats.urls_seen = self.cache.urls.len();
        self.stats.inlines_seen = self.cache.inlines.len();

        if self.pending_batch().is_some() {
            self.debouncer.schedule();
            self.state = WatchState::Debouncing;
        } else if self.debouncer.is_pending() {
            // An earlier trigger's window is still open; the new one restarts it.
            self.debouncer.schedule();
            self.state = WatchState::Debouncing;
        } else {
            self.state = WatchState::Idle;
        }
    }

    /// Take the document's domain and base without dropping cached candidates.
    fn adopt_document(&mut self, snapshot: &DocumentSnapshot) {
        let domain = host_of(&snapshot.url);
        if domain.is_none() {
            debug!("Document URL has no host: {}", snapshot.url);
        }
        self.domain = domain.clone();
        self.stats.domain = domain;
        self.base_url = Some(snapshot.url.clone());
    }

    /// Flush what belongs to the previous document, then start fresh.
    async fn start_new_document(&mut self, snapshot: &DocumentSnapshot) {
        if self.pending_batch().is_some() {
            if let Err(e) = self.persist_pending().await {
                debug!("Dropping unpersisted candidates on navigation: {}", e);
            }
        }
        self.debouncer.cancel();

        let previous = self.domain.clone();
        self.adopt_document(snapshot);
        self.cache = ScanOutput::default();
        if previous != self.domain {
            self.persisted = PersistedMarks::default();
        }
    }

    /// Release the pending window without writing.
    fn teardown(&mut self) {
        if self.debouncer.cancel() {
            debug!("Teardown cancelled a pending write");
        }
        self.state = WatchState::Idle;
    }
}

/// Candidates contributed by one network completion.
fn network_candidates(completion: &NetworkCompletion) -> ScanOutput {
    let mut output = ScanOutput::default();
    let Some(url) = normalize(&completion.url, "") else {
        return output;
    };
    if completion.is_script_typed() || is_javascript_like(&url) {
        output.push_url(url.to_string(), ScriptSource::Network);
    }
    output
}
