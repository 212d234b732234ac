//! Uniform "fetch next page of candidates" contract over external providers.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::models::{ProviderKind, ProviderUsage, SearchCriteria, SearchKind};

// ============ Raw hits ============

/// One organic web-search result.
#[derive(Debug, Clone, PartialEq)]
pub struct WebHit {
    pub title: String,
    pub link: String,
    pub snippet: String,
    pub image_url: Option<String>,
}

/// One maps/places listing, optionally completed with a details lookup.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlaceHit {
    pub place_id: String,
    pub name: String,
    pub formatted_address: Option<String>,
    pub rating: Option<f64>,
    pub rating_count: Option<u32>,
    pub types: Vec<String>,
    pub business_status: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub maps_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawHit {
    Web(WebHit),
    Place(PlaceHit),
}

// ============ Paging ============

/// Opaque position within a provider's result space.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PageCursor {
    /// Index into the gateway's list of query variations.
    pub variation: usize,
    /// Zero-based result offset within the variation.
    pub offset: u32,
    /// Provider-issued continuation token, when the provider pages by token.
    pub token: Option<String>,
}

impl PageCursor {
    pub fn start() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub hits: Vec<RawHit>,
    /// `None` when the provider has no more results for these criteria.
    pub next: Option<PageCursor>,
}

/// Result of one page fetch together with the calls it consumed.
///
/// `usage` counts every attempted call, successful or not, except calls the
/// provider refused outright (see [`ProviderError::is_billable`]).
#[derive(Debug)]
pub struct PageOutcome {
    pub usage: ProviderUsage,
    pub result: Result<Page, ProviderError>,
}

impl PageOutcome {
    pub fn ok(usage: ProviderUsage, page: Page) -> Self {
        Self {
            usage,
            result: Ok(page),
        }
    }

    pub fn err(usage: ProviderUsage, error: ProviderError) -> Self {
        Self {
            usage,
            result: Err(error),
        }
    }
}

// ============ Errors ============

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// HTTP 429 or provider-level rate limit. Stop fetching for this session.
    RateLimited,
    /// Bad or revoked credentials. Fatal, never retried.
    Unauthorized(String),
    /// Provider-side quota exhausted. Fatal.
    QuotaExhausted(String),
    /// Timeout, connection failure or 5xx.
    Transient(String),
    /// The provider answered with a payload we could not interpret.
    Malformed(String),
    /// Circuit breaker is open; no call was made.
    CircuitOpen,
}

impl ProviderError {
    /// Errors that abort the whole session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProviderError::Unauthorized(_) | ProviderError::QuotaExhausted(_)
        )
    }

    /// Whether the failed call still counts toward the session's cost.
    /// Refused calls (credentials, quota, rate limit) and calls never made
    /// because the breaker was open are free.
    pub fn is_billable(&self) -> bool {
        !self.is_fatal()
            && !matches!(self, ProviderError::RateLimited | ProviderError::CircuitOpen)
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::RateLimited => write!(f, "provider rate limit reached"),
            ProviderError::Unauthorized(msg) => write!(f, "provider rejected credentials: {}", msg),
            ProviderError::QuotaExhausted(msg) => write!(f, "provider quota exhausted: {}", msg),
            ProviderError::Transient(msg) => write!(f, "transient provider error: {}", msg),
            ProviderError::Malformed(msg) => write!(f, "malformed provider response: {}", msg),
            ProviderError::CircuitOpen => write!(f, "provider circuit breaker is open"),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Malformed(err.to_string())
        } else {
            ProviderError::Transient(err.to_string())
        }
    }
}

/// Maps a non-success HTTP status to the provider error taxonomy.
pub fn classify_status(provider: &str, status: StatusCode, body: &str) -> ProviderError {
    let lowered = body.to_lowercase();
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
        StatusCode::PAYMENT_REQUIRED => {
            ProviderError::QuotaExhausted(format!("{} returned {}", provider, status))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            if lowered.contains("ratelimitexceeded") {
                ProviderError::RateLimited
            } else if lowered.contains("quota") || lowered.contains("dailylimitexceeded") {
                ProviderError::QuotaExhausted(format!("{} returned {}", provider, status))
            } else {
                ProviderError::Unauthorized(format!("{} returned {}", provider, status))
            }
        }
        _ => ProviderError::Transient(format!("{} returned {}", provider, status)),
    }
}

// ============ Gateway contract ============

#[async_trait]
pub trait ProviderGateway: Send + Sync {
    fn name(&self) -> &'static str;

    /// Provider billed for one page of this gateway, used for pre-flight estimates.
    fn primary_provider(&self) -> ProviderKind;

    /// Fetches the page at `cursor`. Self-throttles to the provider's rate limit.
    async fn fetch_page(&self, criteria: &SearchCriteria, cursor: &PageCursor) -> PageOutcome;

    /// Where to continue after `cursor` failed transiently, if anywhere.
    /// `None` once no variation of `criteria` is left.
    fn skip(&self, criteria: &SearchCriteria, cursor: &PageCursor) -> Option<PageCursor>;
}

/// Builds the gateway for a search kind. Called once per session so no
/// paging state is shared between sessions; throttles and breakers are
/// per provider.
pub trait GatewayFactory: Send + Sync {
    fn gateway(&self, kind: SearchKind) -> Arc<dyn ProviderGateway>;
}

// ============ Throttle ============

/// Enforces a minimum delay between consecutive calls.
pub struct Throttle {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    /// Sleeps until `min_interval` has passed since the previous call, then
    /// marks a new call as started.
    pub async fn wait(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(
            classify_status("web", StatusCode::TOO_MANY_REQUESTS, ""),
            ProviderError::RateLimited
        );
        assert!(classify_status("web", StatusCode::UNAUTHORIZED, "").is_fatal());
        assert!(matches!(
            classify_status("web", StatusCode::FORBIDDEN, r#"{"reason":"dailyLimitExceeded"}"#),
            ProviderError::QuotaExhausted(_)
        ));
        assert!(!classify_status("web", StatusCode::BAD_GATEWAY, "").is_fatal());
        assert!(classify_status("web", StatusCode::BAD_GATEWAY, "").is_billable());
        assert!(!ProviderError::RateLimited.is_billable());
    }

    #[tokio::test]
    async fn test_throttle_spaces_calls() {
        let throttle = Throttle::new(Duration::from_millis(40));
        let start = Instant::now();
        throttle.wait().await;
        throttle.wait().await;
        throttle.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(80));
    }
}
