//! Wires configured HTTP gateways together.

use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::{create_provider_circuit_breaker, ProviderBreaker};
use crate::config::ProviderConfig;
use crate::gateway::{GatewayFactory, ProviderGateway, Throttle};
use crate::models::SearchKind;
use crate::places::PlacesGateway;
use crate::query_parser::{LlmConfig, QueryParser, RegexQueryHeuristic};
use crate::web_search::WebSearchGateway;

/// Per-provider state shared by every session.
struct SharedLimits {
    breaker: Arc<ProviderBreaker>,
    throttle: Arc<Throttle>,
}

impl SharedLimits {
    fn new(min_interval_ms: u64) -> Self {
        Self {
            breaker: Arc::new(create_provider_circuit_breaker()),
            throttle: Arc::new(Throttle::new(Duration::from_millis(min_interval_ms))),
        }
    }
}

/// Builds a fresh gateway per session. The HTTP client, circuit breakers and
/// throttles are shared; paging state is not.
pub struct HttpGatewayFactory {
    client: Client,
    config: ProviderConfig,
    web: SharedLimits,
    places: SharedLimits,
    place_details: Arc<Throttle>,
}

impl HttpGatewayFactory {
    pub fn new(client: Client, config: ProviderConfig) -> Self {
        Self {
            web: SharedLimits::new(config.web_search_min_interval_ms),
            places: SharedLimits::new(config.places_min_interval_ms),
            place_details: Arc::new(Throttle::new(Duration::from_millis(
                config.place_details_min_interval_ms,
            ))),
            client,
            config,
        }
    }
}

impl GatewayFactory for HttpGatewayFactory {
    fn gateway(&self, kind: SearchKind) -> Arc<dyn ProviderGateway> {
        match kind {
            SearchKind::People => Arc::new(WebSearchGateway::new(
                self.client.clone(),
                self.config.google_search_base_url.clone(),
                self.config.google_search_api_key.clone(),
                self.config.google_search_cx.clone(),
                self.web.throttle.clone(),
                self.web.breaker.clone(),
            )),
            SearchKind::Business => Arc::new(PlacesGateway::new(
                self.client.clone(),
                self.config.places_base_url.clone(),
                self.config.places_api_key.clone(),
                self.config.places_fetch_details,
                self.places.throttle.clone(),
                self.place_details.clone(),
                self.places.breaker.clone(),
            )),
        }
    }
}

/// Query parser backed by the configured LLM, or by the heuristic alone
/// when no API key is set.
pub fn build_query_parser(client: Client, config: &ProviderConfig) -> QueryParser {
    let llm = config.openai_api_key.as_ref().map(|api_key| LlmConfig {
        base_url: config.openai_base_url.clone(),
        api_key: api_key.clone(),
        model: config.openai_model.clone(),
    });
    if llm.is_none() {
        tracing::warn!("OPENAI_API_KEY not set, free-text queries use the local heuristic");
    }
    QueryParser::new(client, llm, Arc::new(RegexQueryHeuristic::new()))
}
