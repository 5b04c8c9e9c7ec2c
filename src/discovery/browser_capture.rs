//! Live page capture over the Chrome DevTools Protocol.
//!
//! A page is opened in headless Chrome with a mutation observer injected into
//! every new document. Network completions, the initial document, DOM
//! insertions and main-frame navigations are forwarded to a page session as
//! [`PageEvent`]s until the page goes quiet, then a flush is sent.
//!
//! Main-frame responses are held back until the navigation that owns their
//! loader has been forwarded, so a new document's requests never reach the
//! session ahead of its commit.
//!
//! Requires: Chrome or Chromium browser installed (or `scriptsift setup`)

use crate::discovery::events::{NetworkCompletion, PageEvent, ResourceKind};
use crate::discovery::page_scanner::DocumentSnapshot;
use crate::types::{Result, ScriptsiftError};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{EventResponseReceived, ResourceType};
use chromiumoxide::cdp::browser_protocol::page::{AddScriptToEvaluateOnNewDocumentParams, EventFrameNavigated};
use chromiumoxide::Page;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Counter for generating unique browser profile directories
static BROWSER_INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Installed before any page script runs. Queues the outer HTML of inserted
/// elements that are, or contain, script-relevant tags.
const OBSERVER_SCRIPT: &str = r#"
(() => {
  if (window.__scriptsiftQueue) return;
  window.__scriptsiftQueue = [];
  window.__scriptsiftRemoved = 0;
  const relevant = 'script,link,a,meta';
  const start = () => {
    new MutationObserver((records) => {
      for (const record of records) {
        for (const node of record.addedNodes) {
          if (node.nodeType !== 1) continue;
          if (node.matches(relevant) || node.querySelector(relevant)) {
            window.__scriptsiftQueue.push(node.outerHTML);
          }
        }
        window.__scriptsiftRemoved += record.removedNodes.length;
      }
    }).observe(document.documentElement || document, { childList: true, subtree: true });
  };
  if (document.documentElement) start();
  else document.addEventListener('DOMContentLoaded', start);
})();
"#;

const DRAIN_SCRIPT: &str = r#"
(() => {
  const added = window.__scriptsiftQueue || [];
  const removed = window.__scriptsiftRemoved || 0;
  window.__scriptsiftQueue = [];
  window.__scriptsiftRemoved = 0;
  return { added, removed };
})()
"#;

#[derive(Debug, Default, Deserialize)]
struct MutationDrain {
    added: Vec<String>,
    removed: usize,
}

/// Browser-driven event source for page sessions.
pub struct BrowserCapture {
    /// Timeout for page load in seconds
    timeout_secs: u64,
    /// Whether to run headless
    headless: bool,
    /// Fast mode: shorter watch window (may miss late insertions)
    fast_mode: bool,
    /// Explicit path to Chrome/Chromium executable
    chrome_executable: Option<PathBuf>,
}

impl BrowserCapture {
    /// Create a new browser capture instance.
    pub fn new(timeout_secs: u64, headless: bool) -> Self {
        Self {
            timeout_secs,
            headless,
            fast_mode: false,
            chrome_executable: None,
        }
    }

    /// Enable fast mode for quicker scans.
    pub fn with_fast_mode(mut self, fast: bool) -> Self {
        self.fast_mode = fast;
        self
    }

    /// Set an explicit Chrome/Chromium executable path.
    pub fn with_chrome_executable(mut self, path: Option<PathBuf>) -> Self {
        self.chrome_executable = path;
        self
    }

    fn build_browser_config(&self, temp_dir: &Path, chrome_exe: Option<&Path>) -> Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder().user_data_dir(temp_dir);

        if let Some(exe) = chrome_exe {
            builder = builder.chrome_executable(exe);
        }
        if !self.headless {
            builder = builder.with_head();
        }

        builder
            .no_sandbox()
            .viewport(None)
            .build()
            .map_err(|e| ScriptsiftError::Browser(format!("Failed to build browser config: {}", e)))
    }

    /// Launch a browser, downloading Chromium if none can be found.
    async fn launch_browser(
        &self,
        temp_dir: &Path,
    ) -> Result<(
        Browser,
        impl futures::Stream<Item = std::result::Result<(), chromiumoxide::error::CdpError>>,
    )> {
        // Explicit path > previously downloaded > system Chrome
        let chrome_exe = self
            .chrome_executable
            .clone()
            .or_else(crate::browser::resolve_chrome_executable);

        let launch_result = match self.build_browser_config(temp_dir, chrome_exe.as_deref()) {
            Ok(config) => Browser::launch(config).await,
            Err(e) => Err(chromiumoxide::error::CdpError::msg(e.to_string())),
        };

        match (launch_result, chrome_exe) {
            (Ok(pair), _) => Ok(pair),
            (Err(e), Some(exe)) => Err(ScriptsiftError::Browser(format!(
                "Failed to launch browser with Chrome at {:?}: {}",
                exe, e
            ))),
            (Err(_), None) => {
                warn!("Chrome not found, downloading Chromium automatically... (run `scriptsift setup` to pre-install)");
                let exe = crate::browser::download_chrome(false).await?;

                let config = self.build_browser_config(temp_dir, Some(&exe))?;
                Browser::launch(config).await.map_err(|e| {
                    ScriptsiftError::Browser(format!(
                        "Failed to launch browser even after downloading Chromium: {}",
                        e
                    ))
                })
            }
        }
    }

    /// Open `url` and stream its page events into `events`.
    pub async fn capture(&self, url: &str, events: mpsc::Sender<PageEvent>) -> Result<()> {
        info!("Capturing with browser: {}", url);

        // Unique profile directory so parallel captures don't collide
        let instance_id = BROWSER_INSTANCE_COUNTER.fetch_add(1, Ordering::SeqCst);
        let temp_dir = std::env::temp_dir().join(format!(
            "scriptsift-browser-{}-{}",
            std::process::id(),
            instance_id
        ));
        if let Err(e) = std::fs::create_dir_all(&temp_dir) {
            debug!("Failed to create temp dir {:?}: {}", temp_dir, e);
        }

        let (browser, mut handler) = self.launch_browser(&temp_dir).await?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        // Hard timeout so a hung page cannot stall the scan
        let page_timeout = Duration::from_secs(self.timeout_secs + 15);
        let result = match tokio::time::timeout(page_timeout, self.watch_page(&browser, url, &events)).await {
            Ok(r) => r,
            Err(_) => {
                warn!("Hard timeout after {}s for {}, flushing what was seen", page_timeout.as_secs(), url);
                Ok(())
            }
        };

        // Pending data is persisted even when the page misbehaved.
        if events.send(PageEvent::Flush).await.is_err() {
            debug!("Session closed before final flush");
        }

        drop(browser);
        handler_task.abort();

        tokio::spawn(async move {
            // Small delay to ensure browser has fully exited
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Err(e) = std::fs::remove_dir_all(&temp_dir) {
                debug!("Failed to cleanup temp dir {:?}: {}", temp_dir, e);
            }
        });

        result
    }

    async fn watch_page(&self, browser: &Browser, url: &str, events: &mpsc::Sender<PageEvent>) -> Result<()> {
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| ScriptsiftError::Browser(format!("Failed to create page: {}", e)))?;

        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(OBSERVER_SCRIPT))
            .await
            .map_err(|e| ScriptsiftError::Browser(format!("Failed to install observer: {}", e)))?;

        let navigations = page
            .event_listener::<EventFrameNavigated>()
            .await
            .map_err(|e| ScriptsiftError::Browser(format!("Failed to set up event listener: {}", e)))?
            .filter_map(|event| async move {
                let frame = &event.frame;
                // Child frames never change the page's document.
                if frame.parent_id.is_some() {
                    return None;
                }
                Some(Observed::Navigated {
                    frame: frame.id.inner().clone(),
                    loader: frame.loader_id.inner().clone(),
                    url: frame.url.clone(),
                })
            });

        let responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|e| ScriptsiftError::Browser(format!("Failed to set up event listener: {}", e)))?
            .map(|event| {
                let response = &event.response;
                let kind = resource_kind(&event.r#type);
                Observed::Response(ObservedResponse {
                    frame: event.frame_id.as_ref().map(|f| f.inner().clone()),
                    loader: event.loader_id.inner().clone(),
                    csp: (kind == ResourceKind::Document)
                        .then(|| header_value(response.headers.inner(), "content-security-policy"))
                        .flatten(),
                    completion: NetworkCompletion {
                        url: response.url.clone(),
                        kind,
                        status: u16::try_from(response.status).ok(),
                        mime_type: Some(response.mime_type.clone()),
                    },
                })
            });

        let network_seen = Arc::new(AtomicUsize::new(0));
        let document_csp: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let (committed_tx, mut committed) = watch::channel(0usize);

        let listener = tokio::spawn(forward_ordered(
            navigations,
            responses,
            Forwarding {
                events: events.clone(),
                document_csp: document_csp.clone(),
                network_seen: network_seen.clone(),
                committed: committed_tx,
            },
        ));

        debug!("Navigating to: {}", url);
        match tokio::time::timeout(Duration::from_secs(self.timeout_secs), page.goto(url)).await {
            Ok(Ok(_)) => debug!("Navigation completed"),
            Ok(Err(e)) => warn!("Navigation error (continuing): {}", e),
            Err(_) => warn!("Navigation timeout (continuing with captured content)"),
        }

        // Let the commit reach the session before the document content does.
        let seen_commit = matches!(
            tokio::time::timeout(Duration::from_secs(1), committed.wait_for(|n| *n > 0)).await,
            Ok(Ok(_))
        );
        if !seen_commit {
            debug!("No main-frame commit observed for {}", url);
        }

        let mut page_url = current_url(&page).await.unwrap_or_else(|| url.to_string());
        let snapshot = take_snapshot(&page, &page_url, &document_csp).await?;
        send(events, PageEvent::Ready(snapshot)).await?;

        // Adaptive wait: stop after three quiet checks in a row
        let max_wait_secs = if self.fast_mode { 1 } else { 3 };
        let check_interval_ms = 500;
        let max_checks = (max_wait_secs * 1000) / check_interval_ms;

        let mut last_network = network_seen.load(Ordering::Relaxed);
        let mut quiet_checks = 0;

        debug!("Watching for up to {}s of late activity...", max_wait_secs);
        for _ in 0..max_checks {
            tokio::time::sleep(Duration::from_millis(check_interval_ms)).await;
            let mut active = false;

            // The commit itself was forwarded by the listener; this rescans the
            // document that now sits at the new URL.
            if let Some(now_at) = current_url(&page).await {
                if now_at != page_url {
                    debug!("Main frame moved: {} -> {}", page_url, now_at);
                    page_url = now_at;
                    let snapshot = take_snapshot(&page, &page_url, &document_csp).await?;
                    send(events, PageEvent::Ready(snapshot)).await?;
                    active = true;
                }
            }

            let drained = drain_mutations(&page).await;
            if !drained.added.is_empty() {
                send(
                    events,
                    PageEvent::DomMutation {
                        added: drained.added,
                        removed: drained.removed,
                    },
                )
                .await?;
                active = true;
            }

            let network = network_seen.load(Ordering::Relaxed);
            if network != last_network {
                last_network = network;
                active = true;
            }

            if active {
                quiet_checks = 0;
            } else {
                quiet_checks += 1;
                if quiet_checks >= 3 {
                    debug!("Page quiet for 1.5s, stopping early");
                    break;
                }
            }
        }

        listener.abort();
        if let Err(e) = page.close().await {
            debug!("Failed to close page: {}", e);
        }
        Ok(())
    }
}

impl Default for BrowserCapture {
    fn default() -> Self {
        Self::new(30, true)
    }
}

/// Page activity reported by the protocol listeners.
#[derive(Debug)]
enum Observed {
    /// Main-frame navigation committed.
    Navigated { frame: String, loader: String, url: String },
    Response(ObservedResponse),
}

#[derive(Debug)]
struct ObservedResponse {
    frame: Option<String>,
    loader: String,
    /// Header CSP, for document responses only.
    csp: Option<String>,
    completion: NetworkCompletion,
}

/// Holds main-frame responses whose loader has not committed yet.
#[derive(Debug, Default)]
struct DocumentGate {
    main_frame: Option<String>,
    loader: Option<String>,
    held: Vec<ObservedResponse>,
}

impl DocumentGate {
    /// The response if it can be forwarded now; otherwise it is held.
    fn response(&mut self, response: ObservedResponse) -> Option<ObservedResponse> {
        let other_frame = match (&self.main_frame, &response.frame) {
            (Some(main), Some(frame)) => main != frame,
            _ => false,
        };
        if other_frame || self.loader.as_deref() == Some(response.loader.as_str()) {
            return Some(response);
        }
        self.held.push(response);
        None
    }

    /// Commit a main-frame navigation, releasing the responses it owns.
    fn navigated(&mut self, frame: &str, loader: &str) -> Vec<ObservedResponse> {
        self.main_frame = Some(frame.to_string());
        self.loader = Some(loader.to_string());

        let (owned, held): (Vec<_>, Vec<_>) = std::mem::take(&mut self.held)
            .into_iter()
            .partition(|r| r.loader == loader || r.frame.as_deref().is_some_and(|f| f != frame));
        self.held = held;
        owned
    }
}

/// Shared outputs of the forwarding task.
struct Forwarding {
    events: mpsc::Sender<PageEvent>,
    document_csp: Arc<Mutex<Option<String>>>,
    network_seen: Arc<AtomicUsize>,
    /// Count of main-frame commits forwarded.
    committed: watch::Sender<usize>,
}

/// Merge navigation and response listeners into one ordered event stream.
async fn forward_ordered<N, R>(navigations: N, responses: R, out: Forwarding)
where
    N: Stream<Item = Observed>,
    R: Stream<Item = Observed>,
{
    let mut navigations = Box::pin(navigations.fuse());
    let mut responses = Box::pin(responses.fuse());
    let mut gate = DocumentGate::default();

    loop {
        // Responses first: anything early is held by the gate anyway.
        let observed = tokio::select! {
            biased;
            Some(observed) = responses.next() => observed,
            Some(observed) = navigations.next() => observed,
            else => break,
        };

        let mut outgoing = Vec::new();
        match observed {
            Observed::Navigated { frame, loader, url } => {
                let owned = gate.navigated(&frame, &loader);
                let csp = owned
                    .iter()
                    .find(|r| r.completion.kind == ResourceKind::Document && r.frame.as_deref() == Some(frame.as_str()))
                    .and_then(|r| r.csp.clone());
                *out.document_csp.lock().await = csp.clone();

                if url.starts_with("http://") || url.starts_with("https://") {
                    outgoing.push(PageEvent::NavigationCommitted(
                        DocumentSnapshot::new(url, String::new()).with_csp_header(csp),
                    ));
                    out.committed.send_modify(|n| *n += 1);
                }
                outgoing.extend(owned.into_iter().map(|r| PageEvent::NetworkCompleted(r.completion)));
            }
            Observed::Response(response) => {
                if let Some(response) = gate.response(response) {
                    outgoing.push(PageEvent::NetworkCompleted(response.completion));
                }
            }
        }

        for event in outgoing {
            if matches!(event, PageEvent::NetworkCompleted(_)) {
                out.network_seen.fetch_add(1, Ordering::Relaxed);
            }
            if out.events.send(event).await.is_err() {
                return;
            }
        }
    }
}

async fn send(events: &mpsc::Sender<PageEvent>, event: PageEvent) -> Result<()> {
    events
        .send(event)
        .await
        .map_err(|_| ScriptsiftError::Browser("page session closed".to_string()))
}

async fn current_url(page: &Page) -> Option<String> {
    page.url().await.ok().flatten()
}

async fn take_snapshot(page: &Page, url: &str, document_csp: &Mutex<Option<String>>) -> Result<DocumentSnapshot> {
    let html = page
        .content()
        .await
        .map_err(|e| ScriptsiftError::Browser(format!("Failed to read document: {}", e)))?;
    let csp = document_csp.lock().await.clone();
    Ok(DocumentSnapshot::new(url, html).with_csp_header(csp))
}

async fn drain_mutations(page: &Page) -> MutationDrain {
    match page.evaluate(DRAIN_SCRIPT).await {
        Ok(result) => result.into_value().unwrap_or_default(),
        Err(e) => {
            debug!("Mutation drain failed: {}", e);
            MutationDrain::default()
        }
    }
}

fn resource_kind(kind: &ResourceType) -> ResourceKind {
    match kind {
        ResourceType::Script => ResourceKind::Script,
        ResourceType::Document => ResourceKind::Document,
        ResourceType::Fetch | ResourceType::Xhr => ResourceKind::Fetch,
        _ => ResourceKind::Other,
    }
}

/// Case-insensitive lookup in a CDP header object.
fn header_value(headers: &serde_json::Value, name: &str) -> Option<String> {
    headers
        .as_object()?
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, value)| value.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_lookup_ignores_case() {
        let headers = json!({"Content-Security-Policy": "script-src 'self'", "X-Other": "1"});
        assert_eq!(
            header_value(&headers, "content-security-policy").as_deref(),
            Some("script-src 'self'")
        );
        assert_eq!(header_value(&headers, "missing"), None);
        assert_eq!(header_value(&json!(null), "x"), None);
    }

    #[test]
    fn test_resource_kind_mapping() {
        assert_eq!(resource_kind(&ResourceType::Script), ResourceKind::Script);
        assert_eq!(resource_kind(&ResourceType::Xhr), ResourceKind::Fetch);
        assert_eq!(resource_kind(&ResourceType::Image), ResourceKind::Other);
    }

    fn response(frame: &str, loader: &str, url: &str, kind: ResourceKind) -> Observed {
        Observed::Response(ObservedResponse {
            frame: Some(frame.to_string()),
            loader: loader.to_string(),
            csp: (kind == ResourceKind::Document).then(|| format!("policy for {}", url)),
            completion: NetworkCompletion {
                url: url.to_string(),
                kind,
                status: Some(200),
                mime_type: None,
            },
        })
    }

    fn navigated(loader: &str, url: &str) -> Observed {
        Observed::Navigated {
            frame: "main".to_string(),
            loader: loader.to_string(),
            url: url.to_string(),
        }
    }

    async fn forward(navigations: Vec<Observed>, responses: Vec<Observed>) -> (Vec<PageEvent>, Option<String>) {
        let (tx, mut rx) = mpsc::channel(64);
        let document_csp = Arc::new(Mutex::new(None));
        let (committed, _) = watch::channel(0);
        forward_ordered(
            futures::stream::iter(navigations),
            futures::stream::iter(responses),
            Forwarding {
                events: tx,
                document_csp: document_csp.clone(),
                network_seen: Arc::new(AtomicUsize::new(0)),
                committed,
            },
        )
        .await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        let csp = document_csp.lock().await.clone();
        (events, csp)
    }

    fn describe(event: &PageEvent) -> String {
        match event {
            PageEvent::NavigationCommitted(s) => format!("nav {}", s.url),
            PageEvent::NetworkCompleted(c) => format!("net {}", c.url),
            other => other.name().to_string(),
        }
    }

    #[tokio::test]
    async fn test_new_document_requests_follow_its_commit() {
        // The new document's responses are seen before its commit.
        let (events, csp) = forward(
            vec![navigated("L1", "https://a.com/"), navigated("L2", "https://b.org/")],
            vec![
                response("main", "L1", "https://a.com/a.js", ResourceKind::Script),
                response("main", "L2", "https://b.org/", ResourceKind::Document),
                response("main", "L2", "https://b.org/app.js", ResourceKind::Script),
            ],
        )
        .await;

        let order: Vec<String> = events.iter().map(describe).collect();
        assert_eq!(
            order,
            vec![
                "nav https://a.com/",
                "net https://a.com/a.js",
                "nav https://b.org/",
                "net https://b.org/",
                "net https://b.org/app.js",
            ]
        );
        assert_eq!(csp.as_deref(), Some("policy for https://b.org/"));
        let PageEvent::NavigationCommitted(snapshot) = &events[2] else {
            panic!("expected commit");
        };
        assert_eq!(snapshot.csp_header.as_deref(), Some("policy for https://b.org/"));
    }

    #[test]
    fn test_gate_passes_child_frames_and_current_loader() {
        let mut gate = DocumentGate::default();
        let Observed::Response(early) = response("main", "L1", "https://a.com/a.js", ResourceKind::Script) else {
            unreachable!()
        };
        assert!(gate.response(early).is_none());

        let owned = gate.navigated("main", "L1");
        assert_eq!(owned.len(), 1);

        let Observed::Response(child) = response("ad-frame", "L9", "https://ads.example/x.js", ResourceKind::Script)
        else {
            unreachable!()
        };
        assert!(gate.response(child).is_some());

        let Observed::Response(same) = response("main", "L1", "https://a.com/late.js", ResourceKind::Script) else {
            unreachable!()
        };
        assert!(gate.response(same).is_some());
        assert!(gate.held.is_empty());
    }

    #[tokio::test]
    async fn test_blank_commit_is_not_forwarded() {
        let (events, _) = forward(vec![navigated("L0", "about:blank")], vec![]).await;
        assert!(events.is_empty());
    }

    #[test]
    fn test_drain_payload_shape() {
        let drain: MutationDrain =
            serde_json::from_value(json!({"added": ["<script src='/x.js'></script>"], "removed": 2})).unwrap();
        assert_eq!(drain.added.len(), 1);
        assert_eq!(drain.removed, 2);
    }
}
