//! URL normalization and JavaScript-likeness classification.

use tracing::trace;
use url::Url;

/// Query parameters that mark an extensionless endpoint as serving a module.
const MODULE_MARKERS: &[&str] = &["jsModule", "module"];

/// Sentinel filename for URLs without a usable last path segment.
pub const UNKNOWN_FILENAME: &str = "unknown";

/// Whether a reference lives on the page's own domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locality {
    Local,
    External,
}

/// Resolve `candidate` against `base_url` into an absolute http(s) URL.
///
/// An absolute parse is tried first; a candidate that is not absolute is
/// retried once relative to the base. Anything that fails both, or that
/// resolves to a non-web scheme (`data:`, `javascript:`, `blob:`,
/// extension-internal schemes), yields `None`.
pub fn normalize(candidate: &str, base_url: &str) -> Option<Url> {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return None;
    }

    let resolved = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(_) => {
            let base = Url::parse(base_url).ok()?;
            match base.join(trimmed) {
                Ok(url) => url,
                Err(e) => {
                    trace!("Dropping unparsable candidate {:?}: {}", trimmed, e);
                    return None;
                }
            }
        }
    };

    if !matches!(resolved.scheme(), "http" | "https") {
        trace!("Dropping non-web scheme: {}", resolved.scheme());
        return None;
    }
    if resolved.host_str().is_none() {
        return None;
    }

    let mut url = resolved;
    url.set_fragment(None);
    Some(url)
}

/// True when the path ends in `.js`/`.mjs` or the query carries a module marker.
pub fn is_javascript_like(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    if path.ends_with(".js") || path.ends_with(".mjs") {
        return true;
    }

    url.query_pairs()
        .any(|(key, _)| MODULE_MARKERS.contains(&key.as_ref()))
}

/// Normalize then classify in one step; the result is the canonical URL string.
pub fn classify(candidate: &str, base_url: &str) -> Option<String> {
    let url = normalize(candidate, base_url)?;
    if is_javascript_like(&url) {
        Some(url.to_string())
    } else {
        None
    }
}

/// Hostname of an absolute URL string.
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

/// Last non-empty path segment, percent-decoded.
pub fn filename_of(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return UNKNOWN_FILENAME.to_string();
    };

    parsed
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| segment.to_string())
        })
        .unwrap_or_else(|| UNKNOWN_FILENAME.to_string())
}

/// Local when the reference host is the page domain or one of its subdomains.
pub fn locality(reference_host: &str, page_domain: &str) -> Locality {
    let host = reference_host.to_ascii_lowercase();
    let page = page_domain.to_ascii_lowercase();
    if host == page || host.ends_with(&format!(".{}", page)) {
        Locality::Local
    } else {
        Locality::External
    }
}
