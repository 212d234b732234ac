//! Converts raw provider hits into [`Lead`] records.
//!
//! Pure functions only. The text heuristics that mine names, titles and
//! locations out of search snippets live behind [`SnippetParser`] so they can
//! be replaced without touching the orchestration.

use regex::Regex;
use std::sync::Arc;

use crate::dedup::{city_from_address, identity_key, profile_handle};
use crate::gateway::{PlaceHit, RawHit, WebHit};
use crate::models::{Lead, LeadDetails, SearchCriteria};

/// Fields recovered from a profile search result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileFields {
    pub name: String,
    pub job_title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
}

/// Strategy for extracting profile fields from a result title and snippet.
pub trait SnippetParser: Send + Sync {
    fn parse_profile(&self, title: &str, snippet: &str) -> ProfileFields;
}

/// Regex heuristics for LinkedIn-style result titles such as
/// `"Jane Doe - CTO - Acme Corp | LinkedIn"` or
/// `"Jane Doe – Head of Sales at Acme | LinkedIn"`.
pub struct RegexSnippetParser {
    site_suffix: Regex,
    separator: Regex,
    at_company: Regex,
    location_label: Regex,
    location_prefix: Regex,
}

impl RegexSnippetParser {
    pub fn new() -> Self {
        Self {
            site_suffix: Regex::new(r"(?i)\s*[|·]\s*linkedin.*$").unwrap(),
            separator: Regex::new(r"\s+[-–—]\s+").unwrap(),
            at_company: Regex::new(r"(?i)^(.+?)\s+(?:at|@)\s+(.+)$").unwrap(),
            location_label: Regex::new(r"(?i)location:\s*([^·|.\n]+)").unwrap(),
            location_prefix: Regex::new(
                r"^([A-Z][\p{L} .'-]+(?:,\s*[A-Z][\p{L} .'-]+){1,2})\s*·",
            )
            .unwrap(),
        }
    }
}

impl Default for RegexSnippetParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SnippetParser for RegexSnippetParser {
    fn parse_profile(&self, title: &str, snippet: &str) -> ProfileFields {
        let title = self.site_suffix.replace(title.trim(), "");
        let parts: Vec<&str> = self
            .separator
            .split(&title)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();

        let mut fields = ProfileFields {
            name: parts.first().map(|s| s.to_string()).unwrap_or_default(),
            ..Default::default()
        };

        match parts.len() {
            0 | 1 => {}
            2 => {
                if let Some(caps) = self.at_company.captures(parts[1]) {
                    fields.job_title = Some(caps[1].trim().to_string());
                    fields.company = Some(caps[2].trim().to_string());
                } else {
                    fields.job_title = Some(parts[1].to_string());
                }
            }
            _ => {
                fields.job_title = Some(parts[1].to_string());
                fields.company = Some(parts[2].to_string());
            }
        }

        let snippet = snippet.trim();
        fields.location = self
            .location_label
            .captures(snippet)
            .or_else(|| self.location_prefix.captures(snippet))
            .map(|caps| caps[1].trim().to_string())
            .filter(|l| !l.is_empty());

        fields
    }
}

/// Place types that say nothing about the business.
const GENERIC_PLACE_TYPES: [&str; 3] = ["point_of_interest", "establishment", "premise"];

fn category_from_types(types: &[String]) -> Option<String> {
    types
        .iter()
        .find(|t| !GENERIC_PLACE_TYPES.contains(&t.as_str()))
        .map(|t| {
            let words = t.replace('_', " ");
            let mut chars = words.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => words,
            }
        })
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Clone)]
pub struct ResultNormalizer {
    parser: Arc<dyn SnippetParser>,
}

impl ResultNormalizer {
    pub fn new(parser: Arc<dyn SnippetParser>) -> Self {
        Self { parser }
    }

    /// Normalizes a hit, or `None` when it cannot become a lead
    /// (not a profile page, missing name, permanently closed business).
    pub fn normalize(&self, hit: RawHit, criteria: &SearchCriteria) -> Option<Lead> {
        let mut lead = match hit {
            RawHit::Web(web) => self.normalize_profile(web, criteria)?,
            RawHit::Place(place) => Self::normalize_place(place, criteria)?,
        };
        lead.identity_key = identity_key(&lead);
        Some(lead)
    }

    pub fn normalize_batch(&self, hits: Vec<RawHit>, criteria: &SearchCriteria) -> Vec<Lead> {
        hits.into_iter()
            .filter_map(|hit| self.normalize(hit, criteria))
            .collect()
    }

    fn normalize_profile(&self, hit: WebHit, criteria: &SearchCriteria) -> Option<Lead> {
        profile_handle(&hit.link)?;
        let fields = self.parser.parse_profile(&hit.title, &hit.snippet);
        if fields.name.trim().is_empty() {
            return None;
        }

        Some(Lead {
            identity_key: String::new(),
            name: fields.name,
            link: hit.link,
            location: fields
                .location
                .or_else(|| non_empty(criteria.location.as_deref())),
            snippet: non_empty(Some(&hit.snippet)),
            details: LeadDetails::People {
                job_title: fields
                    .job_title
                    .or_else(|| non_empty(criteria.job_title.as_deref())),
                company: fields.company,
                image_url: hit.image_url,
            },
        })
    }

    fn normalize_place(hit: PlaceHit, criteria: &SearchCriteria) -> Option<Lead> {
        let name = hit.name.trim().to_string();
        if name.is_empty() {
            return None;
        }
        if hit.business_status.as_deref() == Some("CLOSED_PERMANENTLY") {
            tracing::debug!("Skipping permanently closed business: {}", name);
            return None;
        }

        let location = hit
            .formatted_address
            .as_deref()
            .and_then(city_from_address)
            .or_else(|| non_empty(criteria.location.as_deref()));

        Some(Lead {
            identity_key: String::new(),
            name,
            link: hit.maps_url.unwrap_or_default(),
            location,
            snippet: None,
            details: LeadDetails::Business {
                address: non_empty(hit.formatted_address.as_deref()),
                phone: non_empty(hit.phone.as_deref()),
                email: None,
                website: non_empty(hit.website.as_deref()),
                rating: hit.rating,
                rating_count: hit.rating_count,
                category: category_from_types(&hit.types)
                    .or_else(|| non_empty(criteria.business_type.as_deref())),
                // Listings carry no owner; the searched name is never copied onto them.
                owner_name: None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> ResultNormalizer {
        ResultNormalizer::new(Arc::new(RegexSnippetParser::new()))
    }

    #[test]
    fn test_parse_dash_separated_title() {
        let fields = RegexSnippetParser::new().parse_profile(
            "Jane Doe - CTO - Acme Corp | LinkedIn",
            "Austin, Texas, United States · CTO at Acme Corp",
        );
        assert_eq!(fields.name, "Jane Doe");
        assert_eq!(fields.job_title.as_deref(), Some("CTO"));
        assert_eq!(fields.company.as_deref(), Some("Acme Corp"));
        assert_eq!(fields.location.as_deref(), Some("Austin, Texas, United States"));
    }

    #[test]
    fn test_parse_at_company_title() {
        let fields = RegexSnippetParser::new().parse_profile(
            "John Smith – Head of Sales at Initech | LinkedIn",
            "Location: Denver. 500+ connections",
        );
        assert_eq!(fields.name, "John Smith");
        assert_eq!(fields.job_title.as_deref(), Some("Head of Sales"));
        assert_eq!(fields.company.as_deref(), Some("Initech"));
        assert_eq!(fields.location.as_deref(), Some("Denver"));
    }

    #[test]
    fn test_non_profile_links_are_dropped() {
        let hit = RawHit::Web(WebHit {
            title: "Acme Corp | LinkedIn".to_string(),
            link: "https://www.linkedin.com/company/acme".to_string(),
            snippet: String::new(),
            image_url: None,
        });
        assert!(normalizer().normalize(hit, &SearchCriteria::default()).is_none());
    }

    #[test]
    fn test_place_normalization_sets_identity_but_no_owner() {
        let hit = RawHit::Place(PlaceHit {
            place_id: "abc".to_string(),
            name: "Joe's Bakery".to_string(),
            formatted_address: Some("12 Main St, Austin, TX 78701, USA".to_string()),
            types: vec!["establishment".to_string(), "bakery".to_string()],
            phone: Some("(512) 555-0101".to_string()),
            maps_url: Some("https://maps.google.com/?cid=1".to_string()),
            ..Default::default()
        });
        let criteria = SearchCriteria {
            owner_name: Some("Joe".to_string()),
            ..Default::default()
        };
        let lead = normalizer().normalize(hit, &criteria).unwrap();
        assert_eq!(lead.identity_key, "business:joe's bakery:austin:5125550101");
        assert_eq!(lead.location.as_deref(), Some("Austin"));
        match lead.details {
            LeadDetails::Business {
                category,
                owner_name,
                ..
            } => {
                assert_eq!(category.as_deref(), Some("Bakery"));
                assert!(owner_name.is_none());
            }
            _ => panic!("expected business lead"),
        }
    }

    #[test]
    fn test_closed_business_is_dropped() {
        let hit = RawHit::Place(PlaceHit {
            name: "Gone Cafe".to_string(),
            business_status: Some("CLOSED_PERMANENTLY".to_string()),
            ..Default::default()
        });
        assert!(normalizer().normalize(hit, &SearchCriteria::default()).is_none());
    }
}
