use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;

use crate::circuit_breaker::ProviderBreaker;
use crate::gateway::{
    classify_status, Page, PageCursor, PageOutcome, ProviderError, ProviderGateway, RawHit,
    Throttle, WebHit,
};
use crate::models::{ProviderKind, ProviderUsage, SearchCriteria};

/// Results per page returned by the Custom Search API.
pub const PAGE_SIZE: u32 = 10;
/// The API refuses `start` beyond 91, so one query yields at most 100 results.
pub const MAX_OFFSET: u32 = 90;

const PROFILE_SITE: &str = "site:linkedin.com/in";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
    #[serde(default)]
    queries: Option<SearchQueries>,
}

#[derive(Debug, Deserialize)]
struct SearchQueries {
    #[serde(rename = "nextPage", default)]
    next_page: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    pagemap: Option<serde_json::Value>,
}

impl SearchItem {
    fn image_url(&self) -> Option<String> {
        let pagemap = self.pagemap.as_ref()?;
        pagemap
            .get("cse_thumbnail")
            .and_then(|t| t.get(0))
            .and_then(|t| t.get("src"))
            .or_else(|| {
                pagemap
                    .get("metatags")
                    .and_then(|m| m.get(0))
                    .and_then(|m| m.get("og:image"))
            })
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

/// Expands people-search criteria into the ordered queries the gateway pages through.
pub fn query_variations(criteria: &SearchCriteria) -> Vec<String> {
    let clean = |v: &Option<String>| {
        v.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.replace('"', ""))
    };
    let location = clean(&criteria.location);

    if let Some(name) = clean(&criteria.exact_name) {
        let mut query = format!("{} \"{}\"", PROFILE_SITE, name);
        if let Some(loc) = &location {
            query.push_str(&format!(" \"{}\"", loc));
        }
        return vec![query];
    }

    let title = match clean(&criteria.job_title) {
        Some(t) => t,
        None => return Vec::new(),
    };
    let industry = clean(&criteria.industry);

    let mut variations = Vec::new();
    let mut base = format!("{} \"{}\"", PROFILE_SITE, title);
    if let Some(loc) = &location {
        base.push_str(&format!(" \"{}\"", loc));
    }
    variations.push(base.clone());

    if let Some(ind) = &industry {
        variations.push(format!("{} \"{}\"", base, ind));
    }

    let mut loose = format!("{} {}", PROFILE_SITE, title);
    if let Some(loc) = &location {
        loose.push_str(&format!(" {}", loc));
    }
    if let Some(ind) = &industry {
        loose.push_str(&format!(" {}", ind));
    }
    variations.push(loose);

    variations.dedup();
    variations
}

/// Web-search gateway for people leads (Google Custom Search JSON API).
pub struct WebSearchGateway {
    client: Client,
    base_url: String,
    api_key: String,
    cx: String,
    throttle: Arc<Throttle>,
    breaker: Arc<ProviderBreaker>,
}

impl WebSearchGateway {
    pub fn new(
        client: Client,
        base_url: String,
        api_key: String,
        cx: String,
        throttle: Arc<Throttle>,
        breaker: Arc<ProviderBreaker>,
    ) -> Self {
        Self {
            client,
            base_url,
            api_key,
            cx,
            throttle,
            breaker,
        }
    }

    fn advance(cursor: &PageCursor, variation_count: usize) -> Option<PageCursor> {
        if cursor.offset + PAGE_SIZE <= MAX_OFFSET {
            return Some(PageCursor {
                variation: cursor.variation,
                offset: cursor.offset + PAGE_SIZE,
                token: None,
            });
        }
        Self::next_variation(cursor, variation_count)
    }

    fn next_variation(cursor: &PageCursor, variation_count: usize) -> Option<PageCursor> {
        (cursor.variation + 1 < variation_count).then(|| PageCursor {
            variation: cursor.variation + 1,
            offset: 0,
            token: None,
        })
    }

    async fn request(&self, query: &str, offset: u32) -> Result<SearchResponse, ProviderError> {
        let start = (offset + 1).to_string();
        let num = PAGE_SIZE.to_string();
        let url = reqwest::Url::parse_with_params(
            &format!("{}/customsearch/v1", self.base_url),
            &[
                ("key", self.api_key.as_str()),
                ("cx", self.cx.as_str()),
                ("q", query),
                ("start", start.as_str()),
                ("num", num.as_str()),
            ],
        )
        .map_err(|e| ProviderError::Transient(format!("Failed to build URL: {}", e)))?;

        // Redact key from logs to prevent credential exposure
        tracing::debug!(
            "Web search URL: {}/customsearch/v1?key=[REDACTED]&q={}&start={}",
            self.base_url,
            query,
            start
        );

        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::warn!("Web search returned error {}: {}", status, body);
            return Err(classify_status("web search", status, &body));
        }

        Ok(response.json::<SearchResponse>().await?)
    }
}

#[async_trait]
impl ProviderGateway for WebSearchGateway {
    fn name(&self) -> &'static str {
        "web_search"
    }

    fn primary_provider(&self) -> ProviderKind {
        ProviderKind::WebSearch
    }

    async fn fetch_page(&self, criteria: &SearchCriteria, cursor: &PageCursor) -> PageOutcome {
        let variations = query_variations(criteria);
        let Some(query) = variations.get(cursor.variation) else {
            return PageOutcome::ok(
                ProviderUsage::default(),
                Page {
                    hits: Vec::new(),
                    next: None,
                },
            );
        };

        if !self.breaker.is_call_permitted() {
            tracing::warn!("Web search circuit open, skipping page");
            return PageOutcome::err(ProviderUsage::default(), ProviderError::CircuitOpen);
        }

        self.throttle.wait().await;
        let usage = ProviderUsage::single(ProviderKind::WebSearch);
        tracing::info!(
            "Fetching web search page (variation {}, offset {})",
            cursor.variation,
            cursor.offset
        );

        match self.request(query, cursor.offset).await {
            Ok(body) => {
                self.breaker.on_success();
                let full_page = body.items.len() as u32 >= PAGE_SIZE;
                let has_next = body
                    .queries
                    .as_ref()
                    .map(|q| !q.next_page.is_empty())
                    .unwrap_or(false);

                let next = if full_page && has_next {
                    Self::advance(cursor, variations.len())
                } else {
                    Self::next_variation(cursor, variations.len())
                };

                let hits = body
                    .items
                    .into_iter()
                    .filter(|item| !item.link.is_empty())
                    .map(|item| {
                        let image_url = item.image_url();
                        RawHit::Web(WebHit {
                            title: item.title,
                            link: item.link,
                            snippet: item.snippet,
                            image_url,
                        })
                    })
                    .collect::<Vec<_>>();

                tracing::info!("Web search page returned {} hits", hits.len());
                PageOutcome::ok(usage, Page { hits, next })
            }
            Err(e) => {
                self.breaker.on_error();
                let usage = if e.is_billable() {
                    usage
                } else {
                    ProviderUsage::default()
                };
                PageOutcome::err(usage, e)
            }
        }
    }

    fn skip(&self, criteria: &SearchCriteria, cursor: &PageCursor) -> Option<PageCursor> {
        Self::advance(cursor, query_variations(criteria).len())
    }
}
