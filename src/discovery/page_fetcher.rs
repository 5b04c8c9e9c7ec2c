//! Static page fetcher with rate limiting and retry support.
//!
//! Used when no browser is wanted: the document is fetched once over HTTP and
//! replayed to a page session as a ready event followed by a flush.

use crate::discovery::events::PageEvent;
use crate::discovery::page_scanner::DocumentSnapshot;
use crate::types::{HttpConfig, Result, ScriptsiftError};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::CONTENT_SECURITY_POLICY;
use reqwest::Client;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// A fetched document.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// URL after redirects.
    pub final_url: String,
    pub status: u16,
    pub html: String,
    pub csp_header: Option<String>,
}

impl FetchedPage {
    pub fn into_snapshot(self) -> DocumentSnapshot {
        DocumentSnapshot::new(self.final_url, self.html).with_csp_header(self.csp_header)
    }
}

/// HTTP fetcher for page documents.
pub struct PageFetcher {
    client: Client,
    config: HttpConfig,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
}

impl PageFetcher {
    /// Create a new fetcher allowing `rate_limit` requests per second.
    pub fn new(config: HttpConfig, rate_limit: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;

        let quota = Quota::per_second(NonZeroU32::new(rate_limit).unwrap_or(NonZeroU32::MIN));

        Ok(Self {
            client,
            config,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    /// Fetch a document, retrying transient failures.
    ///
    /// Client errors (4xx) fail immediately.
    pub async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        self.rate_limiter.until_ready().await;

        let mut attempt = 0;
        loop {
            match self.do_fetch(url).await {
                Ok(page) => {
                    debug!("Fetched {} ({} bytes)", page.final_url, page.html.len());
                    return Ok(page);
                }
                Err(e) => {
                    let retryable = match &e {
                        ScriptsiftError::HttpError(http_err) => http_err
                            .status()
                            .map(|status| !status.is_client_error())
                            .unwrap_or(true),
                        _ => true,
                    };

                    if !retryable || attempt >= self.config.max_retries {
                        if attempt > 0 {
                            warn!("Failed to fetch {} after {} retries: {}", url, attempt, e);
                        } else {
                            debug!("Failed to fetch {}: {}", url, e);
                        }
                        return Err(e);
                    }

                    attempt += 1;
                    trace!("Retry {} for {}", attempt, url);
                    tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                }
            }
        }
    }

    async fn do_fetch(&self, url: &str) -> Result<FetchedPage> {
        let response = self.client.get(url).send().await?.error_for_status()?;

        let final_url = response.url().to_string();
        let status = response.status().as_u16();
        let csp_header = response
            .headers()
            .get(CONTENT_SECURITY_POLICY)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let html = response.text().await?;

        Ok(FetchedPage {
            final_url,
            status,
            html,
            csp_header,
        })
    }

    /// Fetch `url` and feed it to a session as ready + flush.
    pub async fn drive(&self, url: &str, events: mpsc::Sender<PageEvent>) -> Result<()> {
        let page = self.fetch(url).await?;
        let closed = |_| ScriptsiftError::Browser("page session closed".to_string());

        events.send(PageEvent::Ready(page.into_snapshot())).await.map_err(closed)?;
        events.send(PageEvent::Flush).await.map_err(closed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(max_retries: u32) -> PageFetcher {
        let config = HttpConfig {
            max_retries,
            ..Default::default()
        };
        PageFetcher::new(config, 100).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_captures_csp_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-security-policy", "script-src 'self'")
                    .set_body_string("<script src='/a.js'></script>"),
            )
            .mount(&server)
            .await;

        let page = fetcher(0).fetch(&format!("{}/", server.uri())).await.unwrap();
        assert_eq!(page.status, 200);
        assert_eq!(page.csp_header.as_deref(), Some("script-src 'self'"));
        assert!(page.html.contains("a.js"));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let result = fetcher(3).fetch(&format!("{}/missing", server.uri())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let result = fetcher(1).fetch(&format!("{}/flaky", server.uri())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_drive_emits_ready_then_flush() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<p>hi</p>"))
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::channel(4);
        fetcher(0).drive(&server.uri(), tx).await.unwrap();

        match rx.recv().await {
            Some(PageEvent::Ready(snapshot)) => assert!(snapshot.html.contains("hi")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(rx.recv().await, Some(PageEvent::Flush)));
        assert!(rx.recv().await.is_none());
    }
}
