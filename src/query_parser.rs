use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::cache_validator::ValidatedCache;
use crate::dedup::normalize_component;
use crate::gateway::{classify_status, ProviderError};
use crate::models::{ProviderKind, ProviderUsage, SearchCriteria, SearchKind};

const SYSTEM_PROMPT: &str = "You extract lead search criteria from a short request. \
Reply with a JSON object with the keys job_title, business_type, location and industry. \
Use null for anything not stated. job_title is a person's role, business_type is a kind \
of local business. Do not invent values.";

/// Structured criteria recovered from free text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedQuery {
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub business_type: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
}

impl ParsedQuery {
    fn clean(self) -> Self {
        let clean = |v: Option<String>| {
            v.map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
        };
        Self {
            job_title: clean(self.job_title),
            business_type: clean(self.business_type),
            location: clean(self.location),
            industry: clean(self.industry),
        }
    }

    fn subject(&self, kind: SearchKind) -> Option<&str> {
        match kind {
            SearchKind::People => self.job_title.as_deref(),
            SearchKind::Business => self.business_type.as_deref(),
        }
    }

    /// Fills fields the caller left empty. Explicit criteria always win.
    pub fn apply_to(&self, criteria: &mut SearchCriteria) {
        fn fill(target: &mut Option<String>, value: &Option<String>) {
            let empty = target.as_deref().map(str::trim).unwrap_or("").is_empty();
            if empty {
                if let Some(v) = value {
                    *target = Some(v.clone());
                }
            }
        }
        fill(&mut criteria.job_title, &self.job_title);
        fill(&mut criteria.business_type, &self.business_type);
        fill(&mut criteria.location, &self.location);
        fill(&mut criteria.industry, &self.industry);
    }
}

/// Local parsing strategy used when the LLM is unavailable.
pub trait QueryHeuristic: Send + Sync {
    fn parse(&self, text: &str, kind: SearchKind) -> ParsedQuery;
}

/// Splits `"<subject> in <location>"` style requests.
pub struct RegexQueryHeuristic {
    lead_in: Regex,
    subject_location: Regex,
    industry: Regex,
}

impl RegexQueryHeuristic {
    pub fn new() -> Self {
        Self {
            lead_in: Regex::new(r"(?i)^(?:please\s+)?(?:find|search\s+for|looking\s+for|get\s+me|show\s+me)\s+").unwrap(),
            subject_location: Regex::new(r"(?i)^(.+?)\s+(?:in|near|around|based\s+in)\s+(.+)$").unwrap(),
            industry: Regex::new(r"(?i)^(.+?)\s+(?:in\s+the\s+)?(.+?)\s+industry$").unwrap(),
        }
    }
}

impl Default for RegexQueryHeuristic {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryHeuristic for RegexQueryHeuristic {
    fn parse(&self, text: &str, kind: SearchKind) -> ParsedQuery {
        let text = self.lead_in.replace(text.trim(), "");
        let (mut subject, location) = match self.subject_location.captures(&text) {
            Some(caps) => (caps[1].trim().to_string(), Some(caps[2].trim().to_string())),
            None => (text.trim().to_string(), None),
        };

        let mut industry = None;
        if let Some(caps) = self.industry.captures(&subject.clone()) {
            subject = caps[1].trim().to_string();
            industry = Some(caps[2].trim().to_string());
        }

        let mut parsed = ParsedQuery {
            location,
            industry,
            ..Default::default()
        };
        match kind {
            SearchKind::People => parsed.job_title = Some(subject),
            SearchKind::Business => parsed.business_type = Some(subject),
        }
        parsed.clean()
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

/// Result of parsing, with the calls made to get it.
///
/// `result` is `Err` only for fatal provider errors; every other failure
/// falls back to the heuristic.
#[derive(Debug)]
pub struct ParseOutcome {
    pub usage: ProviderUsage,
    pub result: Result<ParsedQuery, ProviderError>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// LLM-backed parser for free-text search requests.
pub struct QueryParser {
    client: Client,
    llm: Option<LlmConfig>,
    heuristic: Arc<dyn QueryHeuristic>,
    cache: ValidatedCache<ParsedQuery>,
}

impl QueryParser {
    pub fn new(client: Client, llm: Option<LlmConfig>, heuristic: Arc<dyn QueryHeuristic>) -> Self {
        Self {
            client,
            llm,
            heuristic,
            // 1 hour TTL, 10k entries
            cache: ValidatedCache::new(Duration::from_secs(3600), 10_000),
        }
    }

    pub async fn parse(&self, text: &str, kind: SearchKind) -> ParseOutcome {
        let cache_key = format!("{}:{}", kind, normalize_component(text));
        if let Some(cached) = self.cache.get(&cache_key).await {
            tracing::debug!("Query parser cache HIT for: {}", text);
            return ParseOutcome {
                usage: ProviderUsage::default(),
                result: Ok(cached),
            };
        }

        let Some(llm) = &self.llm else {
            return ParseOutcome {
                usage: ProviderUsage::default(),
                result: Ok(self.heuristic.parse(text, kind)),
            };
        };

        match self.request(llm, text).await {
            Ok(parsed) => {
                let mut parsed = parsed.clean();
                if parsed.subject(kind).is_none() {
                    let fallback = self.heuristic.parse(text, kind);
                    parsed.job_title = parsed.job_title.or(fallback.job_title);
                    parsed.business_type = parsed.business_type.or(fallback.business_type);
                    parsed.location = parsed.location.or(fallback.location);
                }
                tracing::info!("✓ Parsed search query: {:?}", parsed);
                self.cache.insert(&cache_key, &parsed).await;
                ParseOutcome {
                    usage: ProviderUsage::single(ProviderKind::QueryParser),
                    result: Ok(parsed),
                }
            }
            Err(e) if e.is_fatal() => {
                tracing::error!("Query parser rejected credentials: {}", e);
                ParseOutcome {
                    usage: ProviderUsage::default(),
                    result: Err(e),
                }
            }
            Err(e) => {
                tracing::warn!("Query parser failed, using heuristic: {}", e);
                let usage = if e.is_billable() {
                    ProviderUsage::single(ProviderKind::QueryParser)
                } else {
                    ProviderUsage::default()
                };
                ParseOutcome {
                    usage,
                    result: Ok(self.heuristic.parse(text, kind)),
                }
            }
        }
    }

    async fn request(&self, llm: &LlmConfig, text: &str) -> Result<ParsedQuery, ProviderError> {
        let body = json!({
            "model": llm.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": text },
            ],
        });

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", llm.base_url))
            .bearer_auth(&llm.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::warn!("Query parser returned error {}: {}", status, error_text);
            return Err(classify_status("query parser", status, &error_text));
        }

        let chat: ChatResponse = response.json().await?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Malformed("empty completion".to_string()))?;

        serde_json::from_str::<ParsedQuery>(&content)
            .map_err(|e| ProviderError::Malformed(format!("completion is not valid JSON: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heuristic_people_query() {
        let parsed = RegexQueryHeuristic::new().parse(
            "Find marketing directors in the fintech industry in New York",
            SearchKind::People,
        );
        assert_eq!(parsed.location.as_deref(), Some("New York"));
        assert_eq!(parsed.job_title.as_deref(), Some("marketing directors"));
        assert_eq!(parsed.industry.as_deref(), Some("fintech"));
    }

    #[test]
    fn test_heuristic_business_query_without_location() {
        let parsed = RegexQueryHeuristic::new().parse("dentists", SearchKind::Business);
        assert_eq!(parsed.business_type.as_deref(), Some("dentists"));
        assert_eq!(parsed.location, None);
    }

    #[test]
    fn test_apply_keeps_explicit_fields() {
        let parsed = ParsedQuery {
            job_title: Some("CTO".to_string()),
            location: Some("Austin".to_string()),
            ..Default::default()
        };
        let mut criteria = SearchCriteria {
            location: Some("Denver".to_string()),
            ..Default::default()
        };
        parsed.apply_to(&mut criteria);
        assert_eq!(criteria.job_title.as_deref(), Some("CTO"));
        assert_eq!(criteria.location.as_deref(), Some("Denver"));
    }

    #[tokio::test]
    async fn test_without_llm_uses_heuristic_at_no_cost() {
        let parser = QueryParser::new(Client::new(), None, Arc::new(RegexQueryHeuristic::new()));
        let outcome = parser.parse("plumbers near Denver", SearchKind::Business).await;
        assert!(outcome.usage.is_empty());
        let parsed = outcome.result.unwrap();
        assert_eq!(parsed.business_type.as_deref(), Some("plumbers"));
        assert_eq!(parsed.location.as_deref(), Some("Denver"));
    }
}
