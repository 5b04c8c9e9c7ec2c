//! Classification and inspection of script candidates.
//!
//! This module handles:
//! - URL normalization and the JS-like test
//! - Inline body fingerprinting
//! - Suspicious-construct detection in inline bodies
//! - Import-map parsing

pub mod hasher;
pub mod import_map;
pub mod signals;
pub mod url_classifier;

pub use hasher::{fingerprint, inline_entry};
pub use import_map::import_map_targets;
pub use signals::{InlineAnalysis, SignalDetector};
pub use url_classifier::{classify, filename_of, host_of, is_javascript_like, locality, normalize, Locality};
