//! Pre-flight checks run before a search may spend anything.

use bigdecimal::{BigDecimal, Zero};
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::SearchLimits;
use crate::errors::AppError;
use crate::ledger::{CostModel, LedgerError, LedgerStore};
use crate::models::{
    AccountStatus, ProviderKind, ProviderUsage, SearchKind, SearchRecord, SearchRequest,
};
use crate::store::{Reservation, SearchQuota, SearchStore};

/// Bearer token claims. Tokens are issued elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub is_admin: bool,
}

#[derive(Debug)]
pub enum GuardError {
    MissingToken,
    InvalidToken(String),
    AccountInactive,
    UserNotFound,
    CooldownActive { retry_after_secs: u64 },
    DailyCapReached { cap: u32 },
    InsufficientCredits {
        balance: BigDecimal,
        required: BigDecimal,
    },
    Storage(sqlx::Error),
    Ledger(LedgerError),
}

impl GuardError {
    /// Text sent to the client in the session's `error` message.
    pub fn user_message(&self) -> String {
        match self {
            GuardError::MissingToken | GuardError::InvalidToken(_) => {
                "Authentication required. Please sign in again.".to_string()
            }
            GuardError::AccountInactive => "This account is not active.".to_string(),
            GuardError::UserNotFound => "Account not found.".to_string(),
            GuardError::CooldownActive { retry_after_secs } => format!(
                "Please wait {} seconds before starting another search.",
                retry_after_secs
            ),
            GuardError::DailyCapReached { cap } => format!(
                "Daily search limit of {} reached. Try again tomorrow.",
                cap
            ),
            GuardError::InsufficientCredits { .. } => {
                "Not enough credits for this search. Please add credits.".to_string()
            }
            GuardError::Storage(_) | GuardError::Ledger(_) => "Internal server error".to_string(),
        }
    }
}

impl fmt::Display for GuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardError::MissingToken => write!(f, "missing bearer token"),
            GuardError::InvalidToken(msg) => write!(f, "invalid bearer token: {}", msg),
            GuardError::AccountInactive => write!(f, "account is not active"),
            GuardError::UserNotFound => write!(f, "user not found"),
            GuardError::CooldownActive { retry_after_secs } => {
                write!(f, "cooldown active for another {}s", retry_after_secs)
            }
            GuardError::DailyCapReached { cap } => write!(f, "daily cap of {} reached", cap),
            GuardError::InsufficientCredits { balance, required } => write!(
                f,
                "balance {} is below the minimum charge {}",
                balance, required
            ),
            GuardError::Storage(e) => write!(f, "guard storage error: {}", e),
            GuardError::Ledger(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for GuardError {}

impl From<sqlx::Error> for GuardError {
    fn from(err: sqlx::Error) -> Self {
        GuardError::Storage(err)
    }
}

impl From<LedgerError> for GuardError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::UserNotFound(_) => GuardError::UserNotFound,
            LedgerError::Storage(e) => GuardError::Storage(e),
            other => GuardError::Ledger(other),
        }
    }
}

impl From<GuardError> for AppError {
    fn from(err: GuardError) -> Self {
        let message = err.user_message();
        match err {
            GuardError::MissingToken | GuardError::InvalidToken(_) => {
                AppError::Unauthorized(message)
            }
            GuardError::AccountInactive => AppError::Forbidden(message),
            GuardError::UserNotFound => AppError::NotFound(message),
            GuardError::CooldownActive { .. } => AppError::RateLimited(message),
            GuardError::DailyCapReached { .. } => AppError::QuotaExceeded(message),
            GuardError::InsufficientCredits { .. } => AppError::InsufficientCredits(message),
            GuardError::Storage(e) => AppError::DatabaseError(e),
            GuardError::Ledger(e) => e.into(),
        }
    }
}

/// Provider billed for one page of a search of this kind.
pub fn primary_provider(kind: SearchKind) -> ProviderKind {
    match kind {
        SearchKind::People => ProviderKind::WebSearch,
        SearchKind::Business => ProviderKind::PlacesSearch,
    }
}

/// Rate and quota guard.
pub struct QuotaGuard {
    decoding_key: DecodingKey,
    validation: Validation,
    searches: Arc<dyn SearchStore>,
    balances: Arc<dyn LedgerStore>,
    cost_model: CostModel,
    limits: SearchLimits,
    recent_starts: Cache<Uuid, chrono::DateTime<Utc>>,
}

impl QuotaGuard {
    pub fn new(
        jwt_secret: &str,
        searches: Arc<dyn SearchStore>,
        balances: Arc<dyn LedgerStore>,
        cost_model: CostModel,
        limits: SearchLimits,
    ) -> Self {
        let ttl = Duration::from_secs(limits.cooldown_secs.max(1));
        Self {
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            searches,
            balances,
            cost_model,
            limits,
            recent_starts: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(100_000)
                .build(),
        }
    }

    /// Decodes and verifies a bearer token.
    pub fn authenticate(&self, bearer: Option<&str>) -> Result<AuthenticatedUser, GuardError> {
        let token = bearer
            .map(str::trim)
            .map(|t| t.strip_prefix("Bearer ").unwrap_or(t).trim())
            .filter(|t| !t.is_empty())
            .ok_or(GuardError::MissingToken)?;

        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| GuardError::InvalidToken(e.to_string()))?;

        Ok(AuthenticatedUser {
            user_id: data.claims.sub,
            is_admin: data.claims.role.as_deref() == Some("admin"),
        })
    }

    /// Smallest amount one page of this search can cost the user.
    pub fn minimum_charge(&self, request: &SearchRequest) -> BigDecimal {
        let mut usage = ProviderUsage::single(primary_provider(request.kind()));
        if request.criteria().needs_parsing(request.kind()) {
            usage.record(ProviderKind::QueryParser, 1);
        }
        self.cost_model.quote(&usage).charged_cost
    }

    /// Runs every pre-flight check for `request` and, when all pass, reserves
    /// its search row so the cooldown and daily cap see it immediately.
    /// Makes no provider calls.
    pub async fn authorize(&self, request: &SearchRequest) -> Result<(), GuardError> {
        let user_id = request.user_id();
        let user = self
            .searches
            .find_user(user_id)
            .await?
            .ok_or(GuardError::UserNotFound)?;
        if user.status != AccountStatus::Active {
            tracing::warn!("Search rejected for inactive user {}", user_id);
            return Err(GuardError::AccountInactive);
        }

        self.check_recent_start(user_id).await?;

        let balance = self.balances.balance(user_id).await?;
        let required = self.minimum_charge(request);
        if balance <= BigDecimal::zero() || balance < required {
            tracing::info!(
                "Insufficient credits for user {}: balance {} < required {}",
                user_id,
                balance,
                required
            );
            return Err(GuardError::InsufficientCredits { balance, required });
        }

        let quota = SearchQuota {
            cooldown: ChronoDuration::seconds(self.limits.cooldown_secs as i64),
            daily_cap: self.limits.daily_cap,
        };
        match self
            .searches
            .reserve_search(&SearchRecord::running(request), quota)
            .await?
        {
            Reservation::Reserved => {
                if self.limits.cooldown_secs > 0 {
                    self.recent_starts.insert(user_id, request.created_at()).await;
                }
                Ok(())
            }
            Reservation::CooldownActive { retry_after_secs } => {
                Err(GuardError::CooldownActive { retry_after_secs })
            }
            Reservation::DailyCapReached => {
                tracing::info!("Daily cap reached for user {}", user_id);
                Err(GuardError::DailyCapReached {
                    cap: self.limits.daily_cap,
                })
            }
        }
    }

    /// Fast rejection from this process's recent starts, before any storage round trip.
    async fn check_recent_start(&self, user_id: Uuid) -> Result<(), GuardError> {
        if self.limits.cooldown_secs == 0 {
            return Ok(());
        }
        let cooldown = ChronoDuration::seconds(self.limits.cooldown_secs as i64);

        if let Some(last) = self.recent_starts.get(&user_id).await {
            let elapsed = Utc::now() - last;
            if elapsed < cooldown {
                let remaining = (cooldown - elapsed).num_seconds().max(1) as u64;
                return Err(GuardError::CooldownActive {
                    retry_after_secs: remaining,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PricingConfig;
    use crate::memory_storage::MemoryStore;
    use crate::models::{SearchCriteria, SearchParams, SearchStatus};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::str::FromStr;

    const SECRET: &str = "test-secret";

    fn guard(store: Arc<MemoryStore>, limits: SearchLimits) -> QuotaGuard {
        QuotaGuard::new(
            SECRET,
            store.clone(),
            store,
            CostModel::new(PricingConfig::default()),
            limits,
        )
    }

    fn request(user_id: Uuid) -> SearchRequest {
        SearchRequest::new(
            user_id,
            SearchParams {
                kind: SearchKind::People,
                criteria: SearchCriteria {
                    job_title: Some("CTO".to_string()),
                    ..Default::default()
                },
                count: 10,
                load_more: false,
            },
            50,
        )
        .unwrap()
    }

    fn token(sub: Uuid, role: Option<&str>) -> String {
        let claims = Claims {
            sub,
            exp: (Utc::now().timestamp() + 3600) as usize,
            role: role.map(str::to_string),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_authenticate_reads_role_claim() {
        let store = Arc::new(MemoryStore::new());
        let g = guard(store, SearchLimits::default());
        let id = Uuid::new_v4();
        let user = g
            .authenticate(Some(&format!("Bearer {}", token(id, Some("admin")))))
            .unwrap();
        assert_eq!(user.user_id, id);
        assert!(user.is_admin);

        assert!(matches!(g.authenticate(None), Err(GuardError::MissingToken)));
        assert!(matches!(
            g.authenticate(Some("Bearer not.a.jwt")),
            Err(GuardError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn test_cooldown_blocks_second_start() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user(BigDecimal::from(10));
        let g = guard(store, SearchLimits::default());

        g.authorize(&request(user)).await.unwrap();
        assert!(matches!(
            g.authorize(&request(user)).await,
            Err(GuardError::CooldownActive { .. })
        ));
    }

    #[tokio::test]
    async fn test_balance_below_minimum_charge_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user(BigDecimal::from_str("0.001").unwrap());
        let g = guard(store, SearchLimits::default());
        // one web search call at 0.005 * 1.3
        assert_eq!(g.minimum_charge(&request(user)), BigDecimal::from_str("0.0065").unwrap());
        assert!(matches!(
            g.authorize(&request(user)).await,
            Err(GuardError::InsufficientCredits { .. })
        ));
    }

    #[tokio::test]
    async fn test_cooldown_holds_across_guard_instances() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user(BigDecimal::from(10));
        let first = guard(store.clone(), SearchLimits::default());
        let second = guard(store, SearchLimits::default());

        first.authorize(&request(user)).await.unwrap();
        // Nothing cached in `second`; the reserved row decides.
        assert!(matches!(
            second.authorize(&request(user)).await,
            Err(GuardError::CooldownActive { .. })
        ));
    }

    #[tokio::test]
    async fn test_running_searches_count_toward_daily_cap() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user(BigDecimal::from(10));
        let limits = SearchLimits {
            daily_cap: 1,
            cooldown_secs: 0,
            ..SearchLimits::default()
        };
        let g = guard(store.clone(), limits);

        g.authorize(&request(user)).await.unwrap();
        let rows = store.searches(user);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, SearchStatus::Running);

        assert!(matches!(
            g.authorize(&request(user)).await,
            Err(GuardError::DailyCapReached { cap: 1 })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_authorizations_respect_daily_cap() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user(BigDecimal::from(10));
        let limits = SearchLimits {
            daily_cap: 3,
            cooldown_secs: 0,
            ..SearchLimits::default()
        };
        let g = Arc::new(guard(store.clone(), limits));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let g = g.clone();
                tokio::spawn(async move { g.authorize(&request(user)).await })
            })
            .collect();
        let mut allowed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => allowed += 1,
                Err(GuardError::DailyCapReached { .. }) => {}
                Err(e) => panic!("unexpected guard error: {}", e),
            }
        }

        assert_eq!(allowed, 3);
        assert_eq!(store.searches(user).len(), 3);
    }

    #[tokio::test]
    async fn test_daily_cap() {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user(BigDecimal::from(10));
        let limits = SearchLimits {
            daily_cap: 0,
            cooldown_secs: 0,
            ..SearchLimits::default()
        };
        let g = guard(store, limits);
        assert!(matches!(
            g.authorize(&request(user)).await,
            Err(GuardError::DailyCapReached { cap: 0 })
        ));
    }
}
