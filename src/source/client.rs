//! Blocking HTTP client with politeness (delay between metadata requests) and retries.

use super::SourceError;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, ORIGIN, REFERER};
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";
const SITE_ORIGIN: &str = "https://comick.io/";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DELAY_MS: u64 = 500;
const MAX_REDIRECTS: usize = 10;

/// Default number of attempts for get_with_retry (initial plus retries).
const DEFAULT_RETRY_COUNT: u32 = 4;
/// Default backoff in milliseconds after each failed attempt.
const DEFAULT_BACKOFF_MS: [u64; 3] = [1000, 2000, 4000];
/// Backoff for HTTP 429 (rate limit): wait longer so the server can recover.
const BACKOFF_429_SECS: [u64; 3] = [15, 30, 60];

/// Blocking HTTP client that enforces a delay between requests.
#[derive(Debug)]
pub struct PoliteClient {
    inner: reqwest::blocking::Client,
    delay: Duration,
    last_request: Option<Instant>,
    retry_count: u32,
    backoff: Vec<Duration>,
}

impl PoliteClient {
    pub fn new() -> Result<Self, SourceError> {
        Self::builder().build()
    }

    pub fn builder() -> PoliteClientBuilder {
        PoliteClientBuilder::default()
    }

    /// The underlying client, sharing headers and cookies. Cheap to clone and usable across threads.
    pub fn http(&self) -> reqwest::blocking::Client {
        self.inner.clone()
    }

    /// GET with retries for transient failures.
    ///
    /// Retries on timeout, connection errors, HTTP 5xx and HTTP 429. Other non-success statuses
    /// are returned as [SourceError::HttpStatus] immediately.
    pub fn get_with_retry(
        &mut self,
        url: &str,
    ) -> Result<reqwest::blocking::Response, SourceError> {
        let max_attempts = self.retry_count;
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.wait_delay();
            debug!(url, attempt, "GET");
            let result = self.inner.get(url).send();
            self.last_request = Some(Instant::now());
            let last = attempt >= max_attempts;
            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let retryable = status.is_server_error() || status.as_u16() == 429;
                    if !retryable || last {
                        return Err(SourceError::HttpStatus {
                            status: status.as_u16(),
                            url: url.to_string(),
                        });
                    }
                    let wait = if status.as_u16() == 429 {
                        let secs = BACKOFF_429_SECS
                            .get(attempt as usize - 1)
                            .or(BACKOFF_429_SECS.last())
                            .copied()
                            .unwrap_or(60);
                        Duration::from_secs(secs)
                    } else {
                        self.backoff_after(attempt)
                    };
                    warn!(url, status = status.as_u16(), "retrying in {:?}", wait);
                    std::thread::sleep(wait);
                }
                Err(e) => {
                    let retryable = e.is_timeout() || e.is_connect();
                    if !retryable || last {
                        return Err(SourceError::Network {
                            url: url.to_string(),
                            source: e,
                        });
                    }
                    let wait = self.backoff_after(attempt);
                    warn!(url, error = %e, "retrying in {:?}", wait);
                    std::thread::sleep(wait);
                }
            }
        }
    }

    pub fn get_text(&mut self, url: &str) -> Result<String, SourceError> {
        self.get_with_retry(url)?
            .text()
            .map_err(|e| SourceError::BodyRead {
                url: url.to_string(),
                source: e,
            })
    }

    pub fn get_json<T: DeserializeOwned>(&mut self, url: &str) -> Result<T, SourceError> {
        let body = self.get_text(url)?;
        serde_json::from_str(&body).map_err(|e| SourceError::Json {
            url: url.to_string(),
            source: e,
        })
    }

    fn backoff_after(&self, attempt: u32) -> Duration {
        self.backoff
            .get(attempt as usize - 1)
            .or(self.backoff.last())
            .copied()
            .unwrap_or(Duration::from_secs(1))
    }

    fn wait_delay(&mut self) {
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                std::thread::sleep(self.delay - elapsed);
            }
        }
    }
}

/// Builder for PoliteClient with optional User-Agent, cookies, delay, timeout, and retry settings.
#[derive(Debug)]
pub struct PoliteClientBuilder {
    user_agent: Option<String>,
    cookies: Option<String>,
    delay_ms: u64,
    timeout_secs: u64,
    retry_count: u32,
    retry_backoff_ms: Vec<u64>,
}

impl Default for PoliteClientBuilder {
    fn default() -> Self {
        Self {
            user_agent: None,
            cookies: None,
            delay_ms: DEFAULT_DELAY_MS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_backoff_ms: DEFAULT_BACKOFF_MS.to_vec(),
        }
    }
}

impl PoliteClientBuilder {
    /// Set a custom User-Agent. If not set, a browser-like default is used.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Raw `name=value; name2=value2` cookie string sent with every request.
    pub fn cookies(mut self, cookies: impl Into<String>) -> Self {
        let cookies = cookies.into();
        self.cookies = if cookies.trim().is_empty() {
            None
        } else {
            Some(cookies)
        };
        self
    }

    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Number of HTTP attempts for transient failures.
    pub fn retry_count(mut self, n: u32) -> Self {
        self.retry_count = n.max(1);
        self
    }

    /// Delays before each retry; if shorter than retry_count - 1, the last value is reused.
    pub fn retry_backoff_ms(mut self, ms: Vec<u64>) -> Self {
        self.retry_backoff_ms = ms;
        self
    }

    pub fn build(self) -> Result<PoliteClient, SourceError> {
        let user_agent = self
            .user_agent
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let mut headers = HeaderMap::new();
        headers.insert(REFERER, HeaderValue::from_static(SITE_ORIGIN));
        headers.insert(ORIGIN, HeaderValue::from_static(SITE_ORIGIN));
        if let Some(cookies) = &self.cookies {
            let value = HeaderValue::from_str(cookies.trim()).map_err(|e| {
                SourceError::InvalidCookies {
                    reason: e.to_string(),
                }
            })?;
            headers.insert(COOKIE, value);
        }
        let inner = reqwest::blocking::Client::builder()
            .cookie_store(true)
            .user_agent(user_agent)
            .default_headers(headers)
            .timeout(Duration::from_secs(self.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(SourceError::Client)?;
        let backoff = if self.retry_backoff_ms.is_empty() {
            let n = self.retry_count.saturating_sub(1) as usize;
            (0..n)
                .map(|i| Duration::from_millis(1000 << i.min(4)))
                .collect()
        } else {
            self.retry_backoff_ms
                .into_iter()
                .map(Duration::from_millis)
                .collect()
        };
        Ok(PoliteClient {
            inner,
            delay: Duration::from_millis(self.delay_ms),
            last_request: None,
            retry_count: self.retry_count,
            backoff,
        })
    }
}
