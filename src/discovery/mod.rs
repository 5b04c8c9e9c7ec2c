//! Script discovery for live pages.
//!
//! Event sources (a headless browser or a one-shot HTTP fetch) produce
//! [`PageEvent`]s; a [`PageSession`] scans, debounces and hands discoveries to
//! the record service.

pub mod browser_capture;
pub mod debounce;
pub mod events;
pub mod page_fetcher;
pub mod page_scanner;
pub mod watcher;

pub use browser_capture::BrowserCapture;
pub use debounce::Debouncer;
pub use events::{NetworkCompletion, PageEvent, ResourceKind};
pub use page_fetcher::{FetchedPage, PageFetcher};
pub use page_scanner::{DocumentSnapshot, PageScanner, ScanOutput};
pub use watcher::{PageSession, SessionStats, WatchSettings, WatchState, DEFAULT_DEBOUNCE};
