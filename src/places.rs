use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;

use crate::circuit_breaker::ProviderBreaker;
use crate::gateway::{
    classify_status, Page, PageCursor, PageOutcome, PlaceHit, ProviderError, ProviderGateway,
    RawHit, Throttle,
};
use crate::models::{ProviderKind, ProviderUsage, SearchCriteria};

const DETAILS_FIELDS: &str = "formatted_phone_number,international_phone_number,website,url";

#[derive(Debug, Deserialize)]
struct TextSearchResponse {
    status: String,
    #[serde(default)]
    results: Vec<PlaceResult>,
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaceResult {
    #[serde(default)]
    place_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    formatted_address: Option<String>,
    #[serde(default)]
    rating: Option<f64>,
    #[serde(default)]
    user_ratings_total: Option<u32>,
    #[serde(default)]
    types: Vec<String>,
    #[serde(default)]
    business_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DetailsResponse {
    status: String,
    #[serde(default)]
    result: Option<DetailsResult>,
}

#[derive(Debug, Deserialize)]
struct DetailsResult {
    #[serde(default)]
    formatted_phone_number: Option<String>,
    #[serde(default)]
    international_phone_number: Option<String>,
    #[serde(default)]
    website: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

/// Maps the Places API `status` field onto the provider error taxonomy.
///
/// `Ok(())` for `OK` and `ZERO_RESULTS`.
pub fn check_places_status(status: &str, message: Option<&str>) -> Result<(), ProviderError> {
    let detail = message.unwrap_or(status).to_string();
    match status {
        "OK" | "ZERO_RESULTS" => Ok(()),
        "OVER_QUERY_LIMIT" => {
            if detail.to_lowercase().contains("daily") || detail.to_lowercase().contains("billing")
            {
                Err(ProviderError::QuotaExhausted(detail))
            } else {
                Err(ProviderError::RateLimited)
            }
        }
        "REQUEST_DENIED" => Err(ProviderError::Unauthorized(detail)),
        "INVALID_REQUEST" | "UNKNOWN_ERROR" => Err(ProviderError::Transient(detail)),
        other => Err(ProviderError::Malformed(format!("unexpected status {}", other))),
    }
}

/// Text query sent to the places search.
pub fn places_query(criteria: &SearchCriteria) -> Option<String> {
    let subject = criteria
        .exact_name
        .as_deref()
        .or(criteria.business_type.as_deref())
        .map(str::trim)
        .filter(|s| !s.is_empty())?;
    let mut query = subject.to_string();
    if let Some(industry) = criteria
        .industry
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        if criteria.exact_name.is_none() {
            query = format!("{} {}", industry, query);
        }
    }
    if let Some(location) = criteria
        .location
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        query.push_str(" in ");
        query.push_str(location);
    }
    Some(query)
}

/// Maps/places gateway for business leads (Google Places text search + details).
pub struct PlacesGateway {
    client: Client,
    base_url: String,
    api_key: String,
    fetch_details: bool,
    throttle: Arc<Throttle>,
    details_throttle: Arc<Throttle>,
    breaker: Arc<ProviderBreaker>,
}

impl PlacesGateway {
    pub fn new(
        client: Client,
        base_url: String,
        api_key: String,
        fetch_details: bool,
        throttle: Arc<Throttle>,
        details_throttle: Arc<Throttle>,
        breaker: Arc<ProviderBreaker>,
    ) -> Self {
        Self {
            client,
            base_url,
            api_key,
            fetch_details,
            throttle,
            details_throttle,
            breaker,
        }
    }

    async fn text_search(
        &self,
        query: &str,
        token: Option<&str>,
    ) -> Result<TextSearchResponse, ProviderError> {
        let mut params = vec![("query", query), ("key", self.api_key.as_str())];
        if let Some(token) = token {
            params.push(("pagetoken", token));
        }
        let url = reqwest::Url::parse_with_params(
            &format!("{}/maps/api/place/textsearch/json", self.base_url),
            &params,
        )
        .map_err(|e| ProviderError::Transient(format!("Failed to build URL: {}", e)))?;

        tracing::debug!(
            "Places text search: query={} page_token={}",
            query,
            token.is_some()
        );

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::warn!("Places search returned error {}: {}", status, body);
            return Err(classify_status("places", status, &body));
        }

        let body: TextSearchResponse = response.json().await?;
        check_places_status(&body.status, body.error_message.as_deref())?;
        Ok(body)
    }

    async fn details(&self, place_id: &str) -> Result<Option<DetailsResult>, ProviderError> {
        let url = reqwest::Url::parse_with_params(
            &format!("{}/maps/api/place/details/json", self.base_url),
            &[
                ("place_id", place_id),
                ("fields", DETAILS_FIELDS),
                ("key", self.api_key.as_str()),
            ],
        )
        .map_err(|e| ProviderError::Transient(format!("Failed to build URL: {}", e)))?;

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("place details", status, &body));
        }

        let body: DetailsResponse = response.json().await?;
        check_places_status(&body.status, None)?;
        Ok(body.result)
    }

    /// Completes hits with phone/website. Every billable attempt is counted in `usage`.
    ///
    /// Fatal errors are returned; other failures leave the hit incomplete and
    /// rate limiting stops further details calls for this page.
    async fn enrich(
        &self,
        hits: &mut [PlaceHit],
        usage: &mut ProviderUsage,
    ) -> Result<(), ProviderError> {
        for hit in hits.iter_mut() {
            if hit.place_id.is_empty() {
                continue;
            }
            self.details_throttle.wait().await;
            let result = self.details(&hit.place_id).await;
            if !matches!(&result, Err(e) if !e.is_billable()) {
                usage.record(ProviderKind::PlaceDetails, 1);
            }
            match result {
                Ok(Some(details)) => {
                    hit.phone = details
                        .formatted_phone_number
                        .or(details.international_phone_number);
                    hit.website = details.website;
                    if details.url.is_some() {
                        hit.maps_url = details.url;
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(ProviderError::RateLimited) => {
                    tracing::warn!("Place details rate limited, leaving remaining hits unenriched");
                    break;
                }
                Err(e) => {
                    tracing::warn!("Place details failed for {}: {}", hit.place_id, e);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderGateway for PlacesGateway {
    fn name(&self) -> &'static str {
        "places"
    }

    fn primary_provider(&self) -> ProviderKind {
        ProviderKind::PlacesSearch
    }

    async fn fetch_page(&self, criteria: &SearchCriteria, cursor: &PageCursor) -> PageOutcome {
        let Some(query) = places_query(criteria) else {
            return PageOutcome::ok(
                ProviderUsage::default(),
                Page {
                    hits: Vec::new(),
                    next: None,
                },
            );
        };

        if !self.breaker.is_call_permitted() {
            tracing::warn!("Places circuit open, skipping page");
            return PageOutcome::err(ProviderUsage::default(), ProviderError::CircuitOpen);
        }

        // Page tokens only become valid a short while after they are issued.
        self.throttle.wait().await;
        let mut usage = ProviderUsage::single(ProviderKind::PlacesSearch);
        tracing::info!("Fetching places page {} for: {}", cursor.offset, query);

        let body = match self.text_search(&query, cursor.token.as_deref()).await {
            Ok(body) => {
                self.breaker.on_success();
                body
            }
            Err(e) => {
                self.breaker.on_error();
                if !e.is_billable() {
                    usage = ProviderUsage::default();
                }
                return PageOutcome::err(usage, e);
            }
        };

        let mut hits: Vec<PlaceHit> = body
            .results
            .into_iter()
            .filter(|r| !r.name.trim().is_empty())
            .map(|r| PlaceHit {
                maps_url: (!r.place_id.is_empty()).then(|| {
                    format!(
                        "https://www.google.com/maps/place/?q=place_id:{}",
                        r.place_id
                    )
                }),
                place_id: r.place_id,
                name: r.name,
                formatted_address: r.formatted_address,
                rating: r.rating,
                rating_count: r.user_ratings_total,
                types: r.types,
                business_status: r.business_status,
                phone: None,
                website: None,
            })
            .collect();

        if self.fetch_details {
            if let Err(e) = self.enrich(&mut hits, &mut usage).await {
                return PageOutcome::err(usage, e);
            }
        }

        let next = body.next_page_token.map(|token| PageCursor {
            variation: 0,
            offset: cursor.offset + 1,
            token: Some(token),
        });

        tracing::info!(
            "Places page returned {} hits ({} provider calls)",
            hits.len(),
            usage.total()
        );
        PageOutcome::ok(usage, Page {
            hits: hits.into_iter().map(RawHit::Place).collect(),
            next,
        })
    }

    fn skip(&self, _criteria: &SearchCriteria, _cursor: &PageCursor) -> Option<PageCursor> {
        // Continuation requires the token from a successful response.
        None
    }
}
