//! Document scanning for script references.
//!
//! Enumerates, in order: external script sources, preload hints, JS-like
//! hyperlinks, inline bodies (and import maps), then CSP and SRI metadata.
//! A malformed element is skipped without aborting the scan.

use crate::parser::{classify, import_map_targets, inline_entry, normalize, SignalDetector};
use crate::types::{DiscoveredUrl, InlineScriptEntry, ScriptSource, SriEntry};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, trace};

/// A captured document: its URL, markup, and the CSP response header if seen.
#[derive(Debug, Clone, Default)]
pub struct DocumentSnapshot {
    pub url: String,
    pub html: String,
    pub csp_header: Option<String>,
}

impl DocumentSnapshot {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
            csp_header: None,
        }
    }

    pub fn with_csp_header(mut self, header: Option<String>) -> Self {
        self.csp_header = header;
        self
    }
}

/// Candidates found by one scan, each collection unique and in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutput {
    /// Base the candidates were resolved against.
    pub base_url: String,
    pub urls: Vec<DiscoveredUrl>,
    pub inlines: Vec<InlineScriptEntry>,
    pub csp: Option<String>,
    pub sri: Vec<SriEntry>,
}

impl ScanOutput {
    /// Add a URL unless already present; the first source seen wins.
    pub fn push_url(&mut self, url: String, source: ScriptSource) -> bool {
        if self.urls.iter().any(|u| u.url == url) {
            return false;
        }
        self.urls.push(DiscoveredUrl { url, source });
        true
    }

    /// Add an inline entry unless its hash is already present.
    pub fn push_inline(&mut self, entry: InlineScriptEntry) -> bool {
        if self.inlines.iter().any(|i| i.hash == entry.hash) {
            return false;
        }
        self.inlines.push(entry);
        true
    }

    /// Add an SRI entry unless the `(url, integrity)` pair is present.
    pub fn push_sri(&mut self, entry: SriEntry) -> bool {
        if self
            .sri
            .iter()
            .any(|s| s.url == entry.url && s.integrity == entry.integrity)
        {
            return false;
        }
        self.sri.push(entry);
        true
    }

    /// Union another output into this one. A CSP in `other` replaces ours.
    pub fn absorb(&mut self, other: ScanOutput) {
        for url in other.urls {
            self.push_url(url.url, url.source);
        }
        for inline in other.inlines {
            self.push_inline(inline);
        }
        for sri in other.sri {
            self.push_sri(sri);
        }
        if other.csp.is_some() {
            self.csp = other.csp;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty() && self.inlines.is_empty() && self.csp.is_none() && self.sri.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptKind {
    Classic,
    Module,
    ImportMap,
    Other,
}

fn script_kind(type_attr: Option<&str>) -> ScriptKind {
    let kind = type_attr.map(|t| t.trim().to_ascii_lowercase()).unwrap_or_default();
    match kind.as_str() {
        "" => ScriptKind::Classic,
        "module" => ScriptKind::Module,
        "importmap" => ScriptKind::ImportMap,
        t if t.contains("javascript") || t.contains("ecmascript") || t.contains("jscript") => {
            ScriptKind::Classic
        }
        _ => ScriptKind::Other,
    }
}

/// Quick test for mutation fragments worth rescanning.
pub fn is_relevant_fragment(fragment: &str) -> bool {
    let lower = fragment.to_ascii_lowercase();
    ["<script", "<link", "<a", "<meta"].iter().any(|open| {
        lower.match_indices(open).any(|(at, _)| {
            // The tag name must end here: `<a` is not `<abbr` or `<article`.
            lower[at + open.len()..]
                .chars()
                .next()
                .map_or(true, |c| c.is_ascii_whitespace() || c == '>' || c == '/')
        })
    })
}

/// Specifiers that are URLs or URL-relative (bare package names are not).
fn is_url_like_specifier(specifier: &str) -> bool {
    specifier.starts_with('/')
        || specifier.starts_with("./")
        || specifier.starts_with("../")
        || specifier.starts_with("http://")
        || specifier.starts_with("https://")
}

#[derive(Clone)]
struct Selectors {
    base: Selector,
    script_src: Selector,
    link_hint: Selector,
    anchor: Selector,
    inline_script: Selector,
    meta_csp: Selector,
    integrity: Selector,
}

impl Selectors {
    fn new() -> Self {
        Self {
            base: Selector::parse("base[href]").unwrap(),
            script_src: Selector::parse("script[src]").unwrap(),
            link_hint: Selector::parse("link[rel][href]").unwrap(),
            anchor: Selector::parse("a[href]").unwrap(),
            inline_script: Selector::parse("script:not([src])").unwrap(),
            meta_csp: Selector::parse("meta[http-equiv][content]").unwrap(),
            integrity: Selector::parse("script[integrity], link[integrity]").unwrap(),
        }
    }
}

/// Scanner that turns a document or fragments into a candidate set.
#[derive(Clone)]
pub struct PageScanner {
    selectors: Selectors,
    detector: SignalDetector,
}

impl PageScanner {
    /// Create a new page scanner.
    pub fn new() -> Self {
        Self {
            selectors: Selectors::new(),
            detector: SignalDetector::new(),
        }
    }

    /// Scan a full document.
    pub fn scan(&self, snapshot: &DocumentSnapshot) -> ScanOutput {
        let document = Html::parse_document(&snapshot.html);
        let base_url = self.resolve_base(&document, &snapshot.url);

        let mut output = ScanOutput {
            base_url: base_url.clone(),
            ..Default::default()
        };
        self.collect(&document, &base_url, &mut output);

        if output.csp.is_none() {
            output.csp = snapshot
                .csp_header
                .as_deref()
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string);
        }

        debug!(
            "Scanned {}: {} urls, {} inlines, csp={}, {} sri",
            snapshot.url,
            output.urls.len(),
            output.inlines.len(),
            output.csp.is_some(),
            output.sri.len()
        );
        output
    }

    /// Scan inserted fragments against an already-known base.
    pub fn scan_fragments(&self, base_url: &str, fragments: &[String]) -> ScanOutput {
        let mut output = ScanOutput {
            base_url: base_url.to_string(),
            ..Default::default()
        };

        for fragment in fragments.iter().filter(|f| is_relevant_fragment(f)) {
            let parsed = Html::parse_fragment(fragment);
            self.collect(&parsed, base_url, &mut output);
        }

        output
    }

    /// The `<base href>` target if it resolves, otherwise the page URL.
    fn resolve_base(&self, document: &Html, page_url: &str) -> String {
        document
            .select(&self.selectors.base)
            .next()
            .and_then(|el| el.value().attr("href"))
            .and_then(|href| normalize(href, page_url))
            .map(|url| url.to_string())
            .unwrap_or_else(|| page_url.to_string())
    }

    fn collect(&self, document: &Html, base: &str, output: &mut ScanOutput) {
        self.collect_script_sources(document, base, output);
        self.collect_preload_hints(document, base, output);
        self.collect_links(document, base, output);
        self.collect_inline_scripts(document, base, output);
        self.collect_csp(document, output);
        self.collect_integrity(document, base, output);
    }

    fn collect_script_sources(&self, document: &Html, base: &str, output: &mut ScanOutput) {
        for element in document.select(&self.selectors.script_src) {
            if let Some(url) = element.value().attr("src").and_then(|src| classify(src, base)) {
                output.push_url(url, ScriptSource::Dom);
            }
        }
    }

    fn collect_preload_hints(&self, document: &Html, base: &str, output: &mut ScanOutput) {
        for element in document.select(&self.selectors.link_hint) {
            if !is_script_hint(&element) {
                continue;
            }
            if let Some(url) = element.value().attr("href").and_then(|href| classify(href, base)) {
                output.push_url(url, ScriptSource::Preload);
            }
        }
    }

    fn collect_links(&self, document: &Html, base: &str, output: &mut ScanOutput) {
        for element in document.select(&self.selectors.anchor) {
            if let Some(url) = element.value().attr("href").and_then(|href| classify(href, base)) {
                output.push_url(url, ScriptSource::Link);
            }
        }
    }

    fn collect_inline_scripts(&self, document: &Html, base: &str, output: &mut ScanOutput) {
        for element in document.select(&self.selectors.inline_script) {
            let body: String = element.text().collect();
            match script_kind(element.value().attr("type")) {
                ScriptKind::ImportMap => {
                    for target in import_map_targets(&body) {
                        if let Some(url) = classify(&target, base) {
                            output.push_url(url, ScriptSource::DynamicImport);
                        }
                    }
                }
                kind @ (ScriptKind::Classic | ScriptKind::Module) => {
                    let trimmed = body.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let analysis = self.detector.inspect(trimmed, kind == ScriptKind::Module);
                    for specifier in analysis.imports.iter().filter(|s| is_url_like_specifier(s)) {
                        if let Some(url) = classify(specifier, base) {
                            output.push_url(url, ScriptSource::DynamicImport);
                        }
                    }
                    if let Some(entry) = inline_entry(trimmed, analysis.signals) {
                        if !output.push_inline(entry) {
                            trace!("Collapsed duplicate inline script");
                        }
                    }
                }
                ScriptKind::Other => {
                    trace!("Skipping non-JS inline script type {:?}", element.value().attr("type"));
                }
            }
        }
    }

    fn collect_csp(&self, document: &Html, output: &mut ScanOutput) {
        let policy = document
            .select(&self.selectors.meta_csp)
            .find(|el| {
                el.value()
                    .attr("http-equiv")
                    .is_some_and(|v| v.trim().eq_ignore_ascii_case("content-security-policy"))
            })
            .and_then(|el| el.value().attr("content"))
            .map(str::trim)
            .filter(|c| !c.is_empty());

        if let Some(policy) = policy {
            output.csp = Some(policy.to_string());
        }
    }

    fn collect_integrity(&self, document: &Html, base: &str, output: &mut ScanOutput) {
        for element in document.select(&self.selectors.integrity) {
            let attrs = element.value();
            let target = attrs.attr("src").or_else(|| attrs.attr("href"));
            let Some(url) = target.and_then(|t| normalize(t, base)) else {
                continue;
            };
            let Some(integrity) = attrs.attr("integrity") else {
                continue;
            };

            for token in integrity.split_whitespace() {
                match token.split_once('-') {
                    Some((algorithm, digest)) if !algorithm.is_empty() && !digest.is_empty() => {
                        output.push_sri(SriEntry {
                            url: url.to_string(),
                            integrity: token.to_string(),
                            algorithm: algorithm.to_ascii_lowercase(),
                        });
                    }
                    _ => trace!("Skipping malformed integrity token {:?}", token),
                }
            }
        }
    }
}

impl Default for PageScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// `modulepreload`, or `preload`/`prefetch` with `as="script"`.
fn is_script_hint(element: &ElementRef<'_>) -> bool {
    let Some(rel) = element.value().attr("rel") else {
        return false;
    };
    let as_script = element
        .value()
        .attr("as")
        .is_some_and(|a| a.trim().eq_ignore_ascii_case("script"));

    rel.split_whitespace().any(|token| {
        let token = token.to_ascii_lowercase();
        token == "modulepreload" || ((token == "preload" || token == "prefetch") && as_script)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::signals::SIGNAL_EVAL;

    fn scan(html: &str) -> ScanOutput {
        PageScanner::new().scan(&DocumentSnapshot::new("https://a.com/page", html))
    }

    fn urls(output: &ScanOutput) -> Vec<&str> {
        output.urls.iter().map(|u| u.url.as_str()).collect()
    }

    #[test]
    fn test_scan_basic_page() {
        let html = r#"
            <html><head>
              <meta http-equiv="Content-Security-Policy" content="script-src 'self'">
              <script src="/a.js"></script>
              <script src="/b.js"></script>
              <script>var x = "1"; eval(x);</script>
            </head><body></body></html>
        "#;

        let output = scan(html);
        assert_eq!(urls(&output), vec!["https://a.com/a.js", "https://a.com/b.js"]);
        assert!(output.urls.iter().all(|u| u.source == ScriptSource::Dom));
        assert_eq!(output.inlines.len(), 1);
        assert!(output.inlines[0].suspicious_signals.contains(SIGNAL_EVAL));
        assert_eq!(output.csp.as_deref(), Some("script-src 'self'"));
    }

    #[test]
    fn test_sources_are_tagged() {
        let html = r#"
            <link rel="modulepreload" href="/m/entry.mjs">
            <link rel="preload" as="script" href="https://cdn.b.com/lib.js">
            <link rel="preload" as="style" href="/style.js">
            <link rel="stylesheet" href="/main.css">
            <a href="/download/tool.js">tool</a>
            <a href="/about">about</a>
        "#;

        let output = scan(html);
        let tagged: Vec<(&str, ScriptSource)> = output
            .urls
            .iter()
            .map(|u| (u.url.as_str(), u.source))
            .collect();
        assert_eq!(
            tagged,
            vec![
                ("https://a.com/m/entry.mjs", ScriptSource::Preload),
                ("https://cdn.b.com/lib.js", ScriptSource::Preload),
                ("https://a.com/download/tool.js", ScriptSource::Link),
            ]
        );
    }

    #[test]
    fn test_non_js_and_bad_attributes_are_skipped() {
        let html = r#"
            <script src="data:text/javascript,alert(1)"></script>
            <script src="javascript:void(0)"></script>
            <script src="/api/loader"></script>
            <script src="http://[::1/x.js"></script>
            <script src="/ok.js"></script>
        "#;

        assert_eq!(urls(&scan(html)), vec!["https://a.com/ok.js"]);
    }

    #[test]
    fn test_duplicate_inline_bodies_collapse() {
        let html = r#"
            <script>track('x');</script>
            <script>  track('x');  </script>
            <script></script>
            <script type="text/template"><div>{{ x }}</div></script>
            <script type="application/ld+json">{"@type": "Thing"}</script>
        "#;

        let output = scan(html);
        assert_eq!(output.inlines.len(), 1);
        assert_eq!(output.inlines[0].snippet, "track('x');");
    }

    #[test]
    fn test_import_map_and_module_imports() {
        let html = r#"
            <script type="importmap">
              {"imports": {"app": "/js/app.js", "pkg/": "/pkg/"}}
            </script>
            <script type="importmap">{ not json</script>
            <script type="module">
              import "app";
              import("./lazy/panel.js");
            </script>
            <script src="/after.js"></script>
        "#;

        let output = scan(html);
        assert_eq!(
            urls(&output),
            vec![
                "https://a.com/after.js",
                "https://a.com/js/app.js",
                "https://a.com/lazy/panel.js",
            ]
        );
        assert_eq!(output.urls[1].source, ScriptSource::DynamicImport);
        assert_eq!(output.inlines.len(), 1);
    }

    #[test]
    fn test_base_href_changes_resolution() {
        let html = r#"
            <head><base href="https://static.a.com/assets/"></head>
            <script src="app.js"></script>
        "#;

        let output = scan(html);
        assert_eq!(output.base_url, "https://static.a.com/assets/");
        assert_eq!(urls(&output), vec!["https://static.a.com/assets/app.js"]);
    }

    #[test]
    fn test_sri_entries() {
        let html = r#"
            <script src="/lib.js" integrity="sha384-abc sha512-def"></script>
            <link rel="stylesheet" href="/main.css" integrity="sha256-xyz">
            <script src="/bad.js" integrity="garbage"></script>
        "#;

        let output = scan(html);
        assert_eq!(output.sri.len(), 3);
        assert_eq!(output.sri[0].url, "https://a.com/lib.js");
        assert_eq!(output.sri[0].algorithm, "sha384");
        assert_eq!(output.sri[1].integrity, "sha512-def");
        assert_eq!(output.sri[2].url, "https://a.com/main.css");
    }

    #[test]
    fn test_csp_header_fallback() {
        let scanner = PageScanner::new();
        let snapshot = DocumentSnapshot::new("https://a.com/", "<script src='/a.js'></script>")
            .with_csp_header(Some("default-src 'none'".to_string()));
        assert_eq!(scanner.scan(&snapshot).csp.as_deref(), Some("default-src 'none'"));

        let snapshot = DocumentSnapshot::new(
            "https://a.com/",
            r#"<meta http-equiv="content-security-policy" content="meta-policy">"#,
        )
        .with_csp_header(Some("header-policy".to_string()));
        assert_eq!(scanner.scan(&snapshot).csp.as_deref(), Some("meta-policy"));
    }

    #[test]
    fn test_scan_fragments() {
        let scanner = PageScanner::new();
        let fragments = vec![
            "<div><script src='/late.js'></script></div>".to_string(),
            "<p>no scripts here</p>".to_string(),
            "<a href='chunk.mjs'>x</a>".to_string(),
        ];

        let output = scanner.scan_fragments("https://a.com/app/", &fragments);
        let found: Vec<&str> = output.urls.iter().map(|u| u.url.as_str()).collect();
        assert_eq!(found, vec!["https://a.com/late.js", "https://a.com/app/chunk.mjs"]);
        assert!(is_relevant_fragment("<SCRIPT>x</SCRIPT>"));
        assert!(!is_relevant_fragment("<p>text</p>"));
        assert!(is_relevant_fragment("<a href='/x'>x</a>"));
        assert!(is_relevant_fragment("<div><a>x</a></div>"));
        assert!(!is_relevant_fragment("<abbr>x</abbr><article><aside>y</aside></article>"));
        assert!(!is_relevant_fragment("<linked-widget></linked-widget>"));
    }

    #[test]
    fn test_absorb_keeps_first_source_and_latest_csp() {
        let mut first = ScanOutput::default();
        first.push_url("https://a.com/a.js".to_string(), ScriptSource::Network);
        first.csp = Some("old".to_string());

        let mut second = ScanOutput::default();
        second.push_url("https://a.com/a.js".to_string(), ScriptSource::Dom);
        second.push_url("https://a.com/b.js".to_string(), ScriptSource::Dom);
        second.csp = Some("new".to_string());

        first.absorb(second);
        assert_eq!(first.urls.len(), 2);
        assert_eq!(first.urls[0].source, ScriptSource::Network);
        assert_eq!(first.csp.as_deref(), Some("new"));
    }
}
