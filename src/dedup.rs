//! Lead identity keys and per-user novelty checks.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

use crate::models::{Lead, LeadDetails, LeadHistoryEntry, SearchKind};

/// Lowercases, trims and collapses inner whitespace.
pub fn normalize_component(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Extracts the profile handle from a LinkedIn-style `/in/<handle>` URL.
pub fn profile_handle(link: &str) -> Option<String> {
    let url = Url::parse(link.trim()).ok()?;
    let host = url.host_str()?.to_lowercase();
    if host != "linkedin.com" && !host.ends_with(".linkedin.com") {
        return None;
    }
    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
    match (segments.next(), segments.next()) {
        (Some(prefix), Some(handle)) if prefix.eq_ignore_ascii_case("in") => {
            Some(handle.to_lowercase())
        }
        _ => None,
    }
}

/// Digits of a phone number, if enough remain to be meaningful.
pub fn normalize_phone(phone: &str) -> Option<String> {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    (digits.len() > 5).then_some(digits)
}

fn normalize_email(email: &str) -> Option<String> {
    let email = email.trim().to_lowercase();
    (email.contains('@') && email.len() > 3).then_some(email)
}

/// City component of a formatted address.
///
/// `"500 Congress Ave, Austin, TX 78701, USA"` yields `"Austin"`; shorter
/// addresses fall back to their first component.
pub fn city_from_address(address: &str) -> Option<String> {
    let parts: Vec<&str> = address
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    let city = match parts.len() {
        0 => return None,
        1 | 2 => parts[0],
        n => parts[n - 3],
    };
    Some(city.to_string())
}

fn business_city(address: Option<&str>, location: Option<&str>) -> String {
    address
        .and_then(city_from_address)
        .or_else(|| location.and_then(|l| l.split(',').next().map(str::to_string)))
        .map(|c| normalize_component(&c))
        .unwrap_or_default()
}

/// Deterministic identity of a lead, independent of input formatting.
///
/// The lead's own `identity_key` field is ignored.
pub fn identity_key(lead: &Lead) -> String {
    match &lead.details {
        LeadDetails::People { company, .. } => match profile_handle(&lead.link) {
            Some(handle) => format!("people:{}", handle),
            None => format!(
                "people:{}:{}",
                normalize_component(&lead.name),
                normalize_component(company.as_deref().unwrap_or(""))
            ),
        },
        LeadDetails::Business {
            address,
            phone,
            email,
            ..
        } => {
            let mut key = format!(
                "business:{}:{}",
                normalize_component(&lead.name),
                business_city(address.as_deref(), lead.location.as_deref())
            );
            let disambiguator = phone
                .as_deref()
                .and_then(normalize_phone)
                .or_else(|| email.as_deref().and_then(normalize_email));
            if let Some(d) = disambiguator {
                key.push(':');
                key.push_str(&d);
            }
            key
        }
    }
}

// ============ History storage ============

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Which of `keys` the user has already been shown. One round trip.
    async fn seen_keys(&self, user_id: Uuid, keys: &[String])
        -> Result<HashSet<String>, sqlx::Error>;

    /// Inserts entries, silently skipping ones already present.
    /// Returns the number of new rows.
    async fn record(&self, entries: &[LeadHistoryEntry]) -> Result<u64, sqlx::Error>;
}

#[derive(Clone)]
pub struct Deduplicator {
    store: Arc<dyn HistoryStore>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Keeps the leads the user has not seen before.
    ///
    /// Leads whose key is already in `session_seen` (accepted earlier in the
    /// same session, or repeated within the batch) are dropped without a
    /// lookup. The history check for the rest is a single batched query.
    /// Accepted keys are added to `session_seen`.
    pub async fn filter_new(
        &self,
        user_id: Uuid,
        leads: Vec<Lead>,
        session_seen: &mut HashSet<String>,
    ) -> Result<Vec<Lead>, sqlx::Error> {
        let mut batch_keys = HashSet::new();
        let candidates: Vec<Lead> = leads
            .into_iter()
            .filter(|lead| {
                let fresh = !session_seen.contains(&lead.identity_key)
                    && batch_keys.insert(lead.identity_key.clone());
                if !fresh {
                    tracing::debug!("Dropping in-session duplicate: {}", lead.identity_key);
                }
                fresh
            })
            .collect();

        if candidates.is_empty() {
            return Ok(candidates);
        }

        let keys: Vec<String> = candidates.iter().map(|l| l.identity_key.clone()).collect();
        let seen = self.store.seen_keys(user_id, &keys).await?;

        let accepted: Vec<Lead> = candidates
            .into_iter()
            .filter(|lead| {
                if seen.contains(&lead.identity_key) {
                    tracing::debug!("Dropping previously shown lead: {}", lead.identity_key);
                    false
                } else {
                    true
                }
            })
            .collect();

        session_seen.extend(accepted.iter().map(|l| l.identity_key.clone()));
        Ok(accepted)
    }

    /// Records that `leads` were shown to the user.
    ///
    /// Best effort: failures are logged and reported as zero rows written.
    pub async fn record_shown(
        &self,
        user_id: Uuid,
        search_query: &str,
        kind: SearchKind,
        leads: &[Lead],
    ) -> u64 {
        if leads.is_empty() {
            return 0;
        }
        let now = Utc::now();
        let entries: Vec<LeadHistoryEntry> = leads
            .iter()
            .map(|lead| LeadHistoryEntry {
                user_id,
                lead_identifier: lead.identity_key.clone(),
                search_query: search_query.to_string(),
                lead_kind: kind,
                created_at: now,
            })
            .collect();

        match self.store.record(&entries).await {
            Ok(inserted) => {
                if inserted < entries.len() as u64 {
                    tracing::debug!(
                        "Lead history: {} of {} entries already present for user {}",
                        entries.len() as u64 - inserted,
                        entries.len(),
                        user_id
                    );
                }
                inserted
            }
            Err(e) => {
                tracing::warn!("Failed to record lead history for user {}: {}", user_id, e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(link: &str, name: &str, company: Option<&str>) -> Lead {
        Lead {
            identity_key: String::new(),
            name: name.to_string(),
            link: link.to_string(),
            location: None,
            snippet: None,
            details: LeadDetails::People {
                job_title: None,
                company: company.map(str::to_string),
                image_url: None,
            },
        }
    }

    fn business(name: &str, address: &str, phone: Option<&str>, email: Option<&str>) -> Lead {
        Lead {
            identity_key: String::new(),
            name: name.to_string(),
            link: "https://maps.google.com/?cid=1".to_string(),
            location: None,
            snippet: None,
            details: LeadDetails::Business {
                address: Some(address.to_string()),
                phone: phone.map(str::to_string),
                email: email.map(str::to_string),
                website: None,
                rating: None,
                rating_count: None,
                category: None,
                owner_name: None,
            },
        }
    }

    #[test]
    fn test_people_key_uses_profile_handle() {
        let a = person("https://www.linkedin.com/in/Jane-Doe-123/", "Jane", None);
        let b = person("https://uk.linkedin.com/in/jane-doe-123?trk=x", "J. Doe", Some("Acme"));
        assert_eq!(identity_key(&a), "people:jane-doe-123");
        assert_eq!(identity_key(&a), identity_key(&b));
    }

    #[test]
    fn test_people_key_falls_back_to_name_and_company() {
        let a = person("https://example.com/team", "  Jane   Doe ", Some("ACME Corp"));
        assert_eq!(identity_key(&a), "people:jane doe:acme corp");
    }

    #[test]
    fn test_business_key_prefers_phone() {
        let lead = business(
            "Joe's Bakery",
            "12 Main St, Austin, TX 78701, USA",
            Some("+1 (512) 555-0101"),
            Some("hi@joes.com"),
        );
        assert_eq!(identity_key(&lead), "business:joe's bakery:austin:15125550101");
    }

    #[test]
    fn test_business_key_uses_email_when_phone_too_short() {
        let lead = business("Joe's Bakery", "Austin, TX", Some("123"), Some(" HI@Joes.com "));
        assert_eq!(identity_key(&lead), "business:joe's bakery:austin:hi@joes.com");
    }

    #[test]
    fn test_business_key_without_disambiguator() {
        let lead = business("Joe's Bakery", "Austin", None, None);
        assert_eq!(identity_key(&lead), "business:joe's bakery:austin");
    }

    #[test]
    fn test_profile_handle_rejects_other_hosts() {
        assert_eq!(profile_handle("https://notlinkedin.com/in/someone"), None);
        assert_eq!(profile_handle("https://www.linkedin.com/company/acme"), None);
        assert_eq!(profile_handle("not a url"), None);
    }
}
