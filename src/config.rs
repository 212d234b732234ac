use bigdecimal::BigDecimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_GOOGLE_SEARCH_URL: &str = "https://www.googleapis.com";
const DEFAULT_PLACES_URL: &str = "https://maps.googleapis.com";
const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub jwt_secret: String,
    pub providers: ProviderConfig,
    pub pricing: PricingConfig,
    pub limits: SearchLimits,
}

/// Credentials and endpoints of the external data sources.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub google_search_api_key: String,
    pub google_search_cx: String,
    pub google_search_base_url: String,
    pub places_api_key: String,
    pub places_base_url: String,
    pub places_fetch_details: bool,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub web_search_min_interval_ms: u64,
    pub places_min_interval_ms: u64,
    pub place_details_min_interval_ms: u64,
}

/// Per-call provider cost and the markup applied when charging users.
#[derive(Debug, Clone, Deserialize)]
pub struct PricingConfig {
    pub web_search_call: BigDecimal,
    pub places_search_call: BigDecimal,
    pub place_details_call: BigDecimal,
    pub query_parser_call: BigDecimal,
    pub markup: BigDecimal,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            web_search_call: BigDecimal::new(5.into(), 3),
            places_search_call: BigDecimal::new(32.into(), 3),
            place_details_call: BigDecimal::new(17.into(), 3),
            query_parser_call: BigDecimal::new(5.into(), 4),
            markup: BigDecimal::new(13.into(), 1),
        }
    }
}

/// Budgets and cadences that bound a single search session.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchLimits {
    pub max_results: u32,
    pub max_pages: u32,
    pub max_provider_calls: u32,
    pub wall_clock_secs: u64,
    /// Emit a progress snapshot at most once per this many provider pages.
    pub emit_every_pages: u32,
    pub cooldown_secs: u64,
    pub daily_cap: u32,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self {
            max_results: 50,
            max_pages: 10,
            max_provider_calls: 250,
            wall_clock_secs: 120,
            emit_every_pages: 2,
            cooldown_secs: 10,
            daily_cap: 100,
        }
    }
}

impl SearchLimits {
    pub fn wall_clock(&self) -> Duration {
        Duration::from_secs(self.wall_clock_secs)
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = SearchLimits::default();
        let default_pricing = PricingConfig::default();

        let config = Self {
            database_url: std::env::var("DB_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DB_URL or DATABASE_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DB_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            jwt_secret: required("JWT_SECRET")?,
            providers: ProviderConfig {
                google_search_api_key: required("GOOGLE_SEARCH_API_KEY")?,
                google_search_cx: required("GOOGLE_SEARCH_CX")?,
                google_search_base_url: base_url(
                    "GOOGLE_SEARCH_BASE_URL",
                    DEFAULT_GOOGLE_SEARCH_URL,
                )?,
                places_api_key: required("PLACES_API_KEY")?,
                places_base_url: base_url("PLACES_BASE_URL", DEFAULT_PLACES_URL)?,
                places_fetch_details: std::env::var("PLACES_FETCH_DETAILS")
                    .map(|v| !matches!(v.trim(), "0" | "false" | "FALSE" | "no"))
                    .unwrap_or(true),
                openai_api_key: std::env::var("OPENAI_API_KEY")
                    .ok()
                    .filter(|s| !s.trim().is_empty()),
                openai_base_url: base_url("OPENAI_BASE_URL", DEFAULT_OPENAI_URL)?,
                openai_model: std::env::var("OPENAI_MODEL")
                    .ok()
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| "gpt-4o-mini".to_string()),
                web_search_min_interval_ms: number("WEB_SEARCH_MIN_INTERVAL_MS", 200)?,
                places_min_interval_ms: number("PLACES_MIN_INTERVAL_MS", 2000)?,
                place_details_min_interval_ms: number("PLACE_DETAILS_MIN_INTERVAL_MS", 100)?,
            },
            pricing: PricingConfig {
                web_search_call: decimal("COST_WEB_SEARCH_CALL", default_pricing.web_search_call)?,
                places_search_call: decimal(
                    "COST_PLACES_SEARCH_CALL",
                    default_pricing.places_search_call,
                )?,
                place_details_call: decimal(
                    "COST_PLACE_DETAILS_CALL",
                    default_pricing.place_details_call,
                )?,
                query_parser_call: decimal(
                    "COST_QUERY_PARSER_CALL",
                    default_pricing.query_parser_call,
                )?,
                markup: decimal("CREDIT_MARKUP", default_pricing.markup).and_then(|m| {
                    if m <= BigDecimal::from(1) {
                        anyhow::bail!("CREDIT_MARKUP must be greater than 1");
                    }
                    Ok(m)
                })?,
            },
            limits: SearchLimits {
                max_results: number("SEARCH_MAX_RESULTS", defaults.max_results)?,
                max_pages: number("SEARCH_MAX_PAGES", defaults.max_pages)?,
                max_provider_calls: number(
                    "SEARCH_MAX_PROVIDER_CALLS",
                    defaults.max_provider_calls,
                )?,
                wall_clock_secs: number("SEARCH_WALL_CLOCK_SECS", defaults.wall_clock_secs)?,
                emit_every_pages: number("SEARCH_EMIT_EVERY_PAGES", defaults.emit_every_pages)?
                    .max(1),
                cooldown_secs: number("SEARCH_COOLDOWN_SECS", defaults.cooldown_secs)?,
                daily_cap: number("SEARCH_DAILY_CAP", defaults.daily_cap)?,
            },
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        tracing::debug!(
            "Web search: {}, Places: {} (details: {})",
            config.providers.google_search_base_url,
            config.providers.places_base_url,
            config.providers.places_fetch_details
        );
        if config.providers.openai_api_key.is_none() {
            tracing::warn!("OPENAI_API_KEY not set, free-text queries use the heuristic parser");
        }
        tracing::debug!("Credit markup: {}", config.pricing.markup);
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }
}

fn required(name: &str) -> anyhow::Result<String> {
    std::env::var(name)
        .map_err(|_| anyhow::anyhow!("{} environment variable required", name))
        .and_then(|value| {
            if value.trim().is_empty() {
                anyhow::bail!("{} cannot be empty", name);
            }
            Ok(value)
        })
}

fn base_url(name: &str, default: &str) -> anyhow::Result<String> {
    let url = std::env::var(name)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string());
    if !url.starts_with("http://") && !url.starts_with("https://") {
        anyhow::bail!("{} must start with http:// or https://", name);
    }
    Ok(url.trim_end_matches('/').to_string())
}

fn number<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid non-negative number", name)),
        _ => Ok(default),
    }
}

fn decimal(name: &str, default: BigDecimal) -> anyhow::Result<BigDecimal> {
    let value = match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => BigDecimal::from_str(raw.trim())
            .map_err(|_| anyhow::anyhow!("{} must be a decimal number", name))?,
        _ => default,
    };
    if value < BigDecimal::from(0) {
        anyhow::bail!("{} cannot be negative", name);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pricing_values() {
        let pricing = PricingConfig::default();
        assert_eq!(pricing.web_search_call, BigDecimal::from_str("0.005").unwrap());
        assert_eq!(pricing.query_parser_call, BigDecimal::from_str("0.0005").unwrap());
        assert_eq!(pricing.markup, BigDecimal::from_str("1.3").unwrap());
    }

    #[test]
    fn test_base_url_falls_back_to_default() {
        let url = base_url("LEAD_SEARCH_TEST_UNSET_URL", "https://example.com/").unwrap();
        assert_eq!(url, "https://example.com");
    }
}
