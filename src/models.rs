use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

use crate::errors::AppError;

// ============ Enumerations ============

/// Which kind of lead a search produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "search_kind", rename_all = "snake_case")]
#[serde(rename_all = "lowercase")]
pub enum SearchKind {
    People,
    Business,
}

impl SearchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchKind::People => "people",
            SearchKind::Business => "business",
        }
    }
}

impl fmt::Display for SearchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "account_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Suspended,
    Deleted,
}

/// Ledger row type. Stored as the `credit_transaction_type` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "credit_transaction_type", rename_all = "snake_case")]
#[serde(rename_all = "kebab-case")]
pub enum TransactionType {
    SearchCharge,
    Purchase,
    AdminAdjustment,
    AdminDeduction,
}

impl TransactionType {
    /// Whether rows of this type remove credits from the balance.
    pub fn is_debit(&self) -> bool {
        matches!(
            self,
            TransactionType::SearchCharge | TransactionType::AdminDeduction
        )
    }
}

/// Lifecycle of a search row: reserved as `Running`, then settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "search_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// External data sources that are billed per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    WebSearch,
    PlacesSearch,
    PlaceDetails,
    QueryParser,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::WebSearch,
        ProviderKind::PlacesSearch,
        ProviderKind::PlaceDetails,
        ProviderKind::QueryParser,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::WebSearch => "web_search",
            ProviderKind::PlacesSearch => "places_search",
            ProviderKind::PlaceDetails => "place_details",
            ProviderKind::QueryParser => "query_parser",
        }
    }
}

// ============ Provider usage ============

/// Per-provider call counters for one session.
///
/// Every attempted call is counted, including failed ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderUsage {
    #[serde(default)]
    pub web_search: u32,
    #[serde(default)]
    pub places_search: u32,
    #[serde(default)]
    pub place_details: u32,
    #[serde(default)]
    pub query_parser: u32,
}

impl ProviderUsage {
    pub fn single(kind: ProviderKind) -> Self {
        let mut usage = Self::default();
        usage.record(kind, 1);
        usage
    }

    pub fn record(&mut self, kind: ProviderKind, calls: u32) {
        match kind {
            ProviderKind::WebSearch => self.web_search += calls,
            ProviderKind::PlacesSearch => self.places_search += calls,
            ProviderKind::PlaceDetails => self.place_details += calls,
            ProviderKind::QueryParser => self.query_parser += calls,
        }
    }

    pub fn calls(&self, kind: ProviderKind) -> u32 {
        match kind {
            ProviderKind::WebSearch => self.web_search,
            ProviderKind::PlacesSearch => self.places_search,
            ProviderKind::PlaceDetails => self.place_details,
            ProviderKind::QueryParser => self.query_parser,
        }
    }

    pub fn total(&self) -> u32 {
        self.web_search + self.places_search + self.place_details + self.query_parser
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn merge(&mut self, other: &ProviderUsage) {
        for kind in ProviderKind::ALL {
            self.record(kind, other.calls(kind));
        }
    }
}

// ============ Database Models ============

/// An account holding a credit balance.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// Stored case-folded.
    pub email: String,
    pub credits: BigDecimal,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
}

/// Immutable ledger row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Signed amount. Negative for debits.
    pub amount: BigDecimal,
    pub transaction_type: TransactionType,
    pub balance_before: BigDecimal,
    pub balance_after: BigDecimal,
    pub description: Option<String>,
    /// Provider cost before markup (search charges only).
    pub actual_cost: Option<BigDecimal>,
    /// Marked-up cost requested for the search (search charges only).
    pub charged_cost: Option<BigDecimal>,
    pub provider_calls: Option<sqlx::types::Json<ProviderUsage>>,
    pub result_count: Option<i32>,
    pub created_at: DateTime<Utc>,
}

/// Record that a lead identity has been shown to a user.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LeadHistoryEntry {
    pub user_id: Uuid,
    pub lead_identifier: String,
    pub search_query: String,
    pub lead_kind: SearchKind,
    pub created_at: DateTime<Utc>,
}

/// A user's explicit bookmark of a lead.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SavedLead {
    pub id: Uuid,
    pub user_id: Uuid,
    pub lead_identifier: String,
    pub lead: sqlx::types::Json<Lead>,
    pub created_at: DateTime<Utc>,
}

/// Summary row of a search session. Inserted when the search is authorized,
/// rewritten when it is settled.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SearchRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: SearchKind,
    pub query: String,
    pub requested_count: i32,
    pub result_count: i32,
    pub status: SearchStatus,
    pub load_more: bool,
    pub provider_calls: sqlx::types::Json<ProviderUsage>,
    pub actual_cost: BigDecimal,
    pub charged_cost: BigDecimal,
    pub created_at: DateTime<Utc>,
}

impl SearchRecord {
    /// The row reserved for `request` before any provider is called.
    pub fn running(request: &SearchRequest) -> Self {
        Self {
            id: request.id(),
            user_id: request.user_id(),
            kind: request.kind(),
            query: request.describe(),
            requested_count: request.requested_count() as i32,
            result_count: 0,
            status: SearchStatus::Running,
            load_more: request.is_load_more(),
            provider_calls: sqlx::types::Json(ProviderUsage::default()),
            actual_cost: BigDecimal::from(0),
            charged_cost: BigDecimal::from(0),
            created_at: request.created_at(),
        }
    }
}

// ============ Search request ============

/// Target criteria shared by both search kinds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchCriteria {
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub business_type: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    /// Search for one specific person or business by name.
    #[serde(default)]
    pub exact_name: Option<String>,
    #[serde(default)]
    pub owner_name: Option<String>,
    /// Free text to be parsed into the structured fields above.
    #[serde(default)]
    pub query: Option<String>,
}

impl SearchCriteria {
    /// Subject of the search for the given kind (title, business type or exact name).
    pub fn subject(&self, kind: SearchKind) -> Option<&str> {
        let primary = match kind {
            SearchKind::People => self.job_title.as_deref(),
            SearchKind::Business => self.business_type.as_deref(),
        };
        non_blank(primary).or_else(|| non_blank(self.exact_name.as_deref()))
    }

    /// Whether the free-text query still has to be parsed before fetching.
    pub fn needs_parsing(&self, kind: SearchKind) -> bool {
        self.subject(kind).is_none() && non_blank(self.query.as_deref()).is_some()
    }

    /// Human-readable description used for history rows and logs.
    pub fn describe(&self, kind: SearchKind) -> String {
        let subject = self
            .subject(kind)
            .or_else(|| non_blank(self.query.as_deref()))
            .unwrap_or("");
        match non_blank(self.location.as_deref()) {
            Some(location) => format!("{} in {}", subject, location),
            None => subject.to_string(),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Inbound body of a search request, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParams {
    pub kind: SearchKind,
    #[serde(flatten)]
    pub criteria: SearchCriteria,
    #[serde(default = "default_count")]
    pub count: u32,
    /// Continuation of an earlier search: results are appended client-side.
    #[serde(default)]
    pub load_more: bool,
}

fn default_count() -> u32 {
    10
}

/// A validated, immutable description of one search intent.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    id: Uuid,
    user_id: Uuid,
    kind: SearchKind,
    criteria: SearchCriteria,
    requested_count: u32,
    load_more: bool,
    created_at: DateTime<Utc>,
}

impl SearchRequest {
    /// Validates inbound parameters for the given user.
    ///
    /// The requested count must be within `1..=max_results` and the criteria
    /// must name something to search for.
    pub fn new(user_id: Uuid, params: SearchParams, max_results: u32) -> Result<Self, AppError> {
        if params.count == 0 || params.count > max_results {
            return Err(AppError::BadRequest(format!(
                "count must be between 1 and {}",
                max_results
            )));
        }

        let criteria = params.criteria;
        if criteria.subject(params.kind).is_none() && non_blank(criteria.query.as_deref()).is_none()
        {
            let field = match params.kind {
                SearchKind::People => "job_title",
                SearchKind::Business => "business_type",
            };
            return Err(AppError::BadRequest(format!(
                "{}, exact_name or query is required",
                field
            )));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            user_id,
            kind: params.kind,
            criteria,
            requested_count: params.count,
            load_more: params.load_more,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn kind(&self) -> SearchKind {
        self.kind
    }

    pub fn criteria(&self) -> &SearchCriteria {
        &self.criteria
    }

    pub fn requested_count(&self) -> u32 {
        self.requested_count
    }

    pub fn is_load_more(&self) -> bool {
        self.load_more
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn describe(&self) -> String {
        self.criteria.describe(self.kind)
    }
}

// ============ Leads ============

/// A normalized search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    /// Deterministic identity used for deduplication.
    pub identity_key: String,
    pub name: String,
    /// Profile URL or maps link.
    pub link: String,
    pub location: Option<String>,
    pub snippet: Option<String>,
    #[serde(flatten)]
    pub details: LeadDetails,
}

/// Kind-specific lead attributes; serialized with a `kind` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LeadDetails {
    People {
        job_title: Option<String>,
        company: Option<String>,
        image_url: Option<String>,
    },
    Business {
        address: Option<String>,
        phone: Option<String>,
        email: Option<String>,
        website: Option<String>,
        rating: Option<f64>,
        rating_count: Option<u32>,
        category: Option<String>,
        owner_name: Option<String>,
    },
}

impl Lead {
    pub fn kind(&self) -> SearchKind {
        match self.details {
            LeadDetails::People { .. } => SearchKind::People,
            LeadDetails::Business { .. } => SearchKind::Business,
        }
    }
}

// ============ API payloads ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub user_id: Uuid,
    pub credits: BigDecimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PurchaseRequest {
    pub amount: BigDecimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminAdjustRequest {
    pub user_id: Uuid,
    /// Positive adds credits, negative deducts them.
    pub amount: BigDecimal,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaveLeadRequest {
    pub lead: Lead,
}
