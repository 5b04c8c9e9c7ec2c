//! Typed page events consumed by a page session.

use crate::discovery::page_scanner::DocumentSnapshot;

/// Resource type reported with a network completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Script,
    Document,
    Fetch,
    Other,
}

/// A completed network request observed for the page.
#[derive(Debug, Clone)]
pub struct NetworkCompletion {
    pub url: String,
    pub kind: ResourceKind,
    pub status: Option<u16>,
    pub mime_type: Option<String>,
}

impl NetworkCompletion {
    pub fn script(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: ResourceKind::Script,
            status: None,
            mime_type: None,
        }
    }

    /// Typed as a script, or served with a JavaScript MIME type.
    pub fn is_script_typed(&self) -> bool {
        self.kind == ResourceKind::Script
            || self
                .mime_type
                .as_deref()
                .is_some_and(|m| m.to_ascii_lowercase().contains("javascript"))
    }
}

/// Events delivered to a page session by its event source.
#[derive(Debug, Clone)]
pub enum PageEvent {
    /// Document content is available. Same-domain repeats rescan without
    /// dropping cached candidates.
    Ready(DocumentSnapshot),
    /// Main-frame navigation committed to a new document. The snapshot may
    /// carry only the URL and header CSP when content is not loaded yet.
    NavigationCommitted(DocumentSnapshot),
    /// Batch of DOM insertions, as outer HTML of each added node.
    DomMutation { added: Vec<String>, removed: usize },
    /// A network request finished.
    NetworkCompleted(NetworkCompletion),
    /// Persist pending data now, bypassing the debounce window.
    Flush,
    /// Page is going away; pending timer is cancelled without writing.
    Teardown,
}

impl PageEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PageEvent::Ready(_) => "ready",
            PageEvent::NavigationCommitted(_) => "navigation",
            PageEvent::DomMutation { .. } => "mutation",
            PageEvent::NetworkCompleted(_) => "network",
            PageEvent::Flush => "flush",
            PageEvent::Teardown => "teardown",
        }
    }
}
