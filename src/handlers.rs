use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use bigdecimal::{BigDecimal, Signed, Zero};
use futures::Stream;
use reqwest::Client;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::Config;
use crate::dedup::{identity_key, Deduplicator, HistoryStore};
use crate::errors::{AppError, ResultExt};
use crate::gateway::GatewayFactory;
use crate::guard::{AuthenticatedUser, QuotaGuard};
use crate::ledger::{CostModel, Ledger, LedgerStore};
use crate::models::*;
use crate::orchestrator::SearchOrchestrator;
use crate::providers::build_query_parser;
use crate::session::StreamingSession;
use crate::store::{SavedLeadStore, SearchStore};

/// Messages buffered per session before the orchestrator waits on the client.
const SESSION_BUFFER: usize = 16;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    pub orchestrator: Arc<SearchOrchestrator>,
    pub guard: Arc<QuotaGuard>,
    pub ledger: Ledger,
    pub searches: Arc<dyn SearchStore>,
    pub saved: Arc<dyn SavedLeadStore>,
}

impl AppState {
    /// Wires every component on top of one storage backend.
    pub fn new<S>(
        config: Config,
        client: Client,
        store: Arc<S>,
        gateways: Arc<dyn GatewayFactory>,
    ) -> Self
    where
        S: LedgerStore + HistoryStore + SearchStore + SavedLeadStore + 'static,
    {
        let cost_model = CostModel::new(config.pricing.clone());
        let ledger = Ledger::new(store.clone(), cost_model.clone());
        let guard = Arc::new(QuotaGuard::new(
            &config.jwt_secret,
            store.clone(),
            store.clone(),
            cost_model,
            config.limits.clone(),
        ));
        let parser = Arc::new(build_query_parser(client, &config.providers));
        let orchestrator = Arc::new(SearchOrchestrator::new(
            guard.clone(),
            gateways,
            parser,
            Deduplicator::new(store.clone()),
            ledger.clone(),
            store.clone(),
            config.limits.clone(),
        ));

        Self {
            config,
            orchestrator,
            guard,
            ledger,
            searches: store.clone(),
            saved: store,
        }
    }
}

/// Caller identity decoded from the `Authorization: Bearer` header.
pub struct AuthUser(pub AuthenticatedUser);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let user = state.guard.authenticate(header)?;
        Ok(AuthUser(user))
    }
}

/// Health check endpoint.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "lead-search-api",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// POST /api/v1/search
///
/// Starts a search and streams `progress`, then `complete` or `error`, as
/// Server-Sent Events. Authentication and quota failures arrive as the
/// stream's `error` event.
pub async fn start_search(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(params): Json<SearchParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::info!(
        "POST /search - kind: {}, count: {}, load_more: {}",
        params.kind,
        params.count,
        params.load_more
    );

    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let (session, receiver) = StreamingSession::channel(SESSION_BUFFER);

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        let outcome = orchestrator.run(bearer.as_deref(), params, session).await;
        tracing::debug!(
            "Search session finished: {:?} ({} leads)",
            outcome.phase,
            outcome.leads.len()
        );
    });

    Sse::new(receiver.into_stream())
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

/// GET /api/v1/credits/balance
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Result<Json<BalanceResponse>, AppError> {
    let credits = state.ledger.get_balance(user.user_id).await?;
    Ok(Json(BalanceResponse {
        user_id: user.user_id,
        credits,
    }))
}

/// GET /api/v1/credits/history?limit=
pub async fn get_credit_history(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<CreditTransaction>>, AppError> {
    let history = state
        .ledger
        .get_history(user.user_id, query.limit.unwrap_or(50))
        .await?;
    Ok(Json(history))
}

/// POST /api/v1/credits/purchase
///
/// Payment collection is not wired in; the requested amount is credited directly.
pub async fn purchase_credits(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(body): Json<PurchaseRequest>,
) -> Result<Json<CreditTransaction>, AppError> {
    if body.amount < BigDecimal::from(1) || body.amount > BigDecimal::from(1000) {
        return Err(AppError::BadRequest(
            "amount must be between 1 and 1000".to_string(),
        ));
    }

    tracing::info!("Credit purchase of {} for user {}", body.amount, user.user_id);
    let transaction = state
        .ledger
        .credit(
            user.user_id,
            &body.amount,
            TransactionType::Purchase,
            Some("Credit purchase".to_string()),
        )
        .await?;
    Ok(Json(transaction))
}

/// POST /api/v1/admin/credits/adjust
///
/// Positive amounts add credits, negative amounts deduct them and fail
/// rather than overdraw.
pub async fn admin_adjust_credits(
    State(state): State<Arc<AppState>>,
    AuthUser(admin): AuthUser,
    Json(body): Json<AdminAdjustRequest>,
) -> Result<Json<CreditTransaction>, AppError> {
    if !admin.is_admin {
        return Err(AppError::Forbidden("Admin role required".to_string()));
    }
    if body.amount.is_zero() {
        return Err(AppError::BadRequest("amount must not be zero".to_string()));
    }

    let description = body
        .description
        .unwrap_or_else(|| format!("Adjusted by admin {}", admin.user_id));
    tracing::info!(
        "Admin {} adjusting credits for user {} by {}",
        admin.user_id,
        body.user_id,
        body.amount
    );

    let transaction = if body.amount.is_positive() {
        state
            .ledger
            .credit(
                body.user_id,
                &body.amount,
                TransactionType::AdminAdjustment,
                Some(description),
            )
            .await?
    } else {
        state
            .ledger
            .debit(
                body.user_id,
                &body.amount.abs(),
                TransactionType::AdminDeduction,
                Some(description),
                None,
            )
            .await?
    };
    Ok(Json(transaction))
}

/// GET /api/v1/searches?limit=
pub async fn list_searches(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<SearchRecord>>, AppError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let searches = state
        .searches
        .list_searches(user.user_id, limit)
        .await
        .context("Failed to list searches")?;
    Ok(Json(searches))
}

/// POST /api/v1/leads/saved
///
/// The identity key is recomputed server-side; saving twice is a no-op.
pub async fn save_lead(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(body): Json<SaveLeadRequest>,
) -> Result<(StatusCode, Json<SavedLead>), AppError> {
    let mut lead = body.lead;
    if lead.name.trim().is_empty() {
        return Err(AppError::BadRequest("lead name is required".to_string()));
    }
    lead.identity_key = identity_key(&lead);

    let saved = state
        .saved
        .save_lead(user.user_id, &lead)
        .await
        .context("Failed to save lead")?;
    Ok((StatusCode::CREATED, Json(saved)))
}

/// DELETE /api/v1/leads/saved/:identity_key
pub async fn delete_saved_lead(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(key): Path<String>,
) -> Result<StatusCode, AppError> {
    let removed = state
        .saved
        .delete_saved(user.user_id, &key)
        .await
        .context("Failed to delete saved lead")?;
    if !removed {
        return Err(AppError::NotFound(format!("Saved lead {} not found", key)));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/leads/saved
pub async fn list_saved_leads(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<SavedLead>>, AppError> {
    let saved = state
        .saved
        .list_saved(user.user_id)
        .await
        .context("Failed to list saved leads")?;
    Ok(Json(saved))
}

/// Looks up a user by id for admin tooling.
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    AuthUser(admin): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<User>, AppError> {
    if !admin.is_admin {
        return Err(AppError::Forbidden("Admin role required".to_string()));
    }
    let user = state
        .searches
        .find_user(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User {} not found", id)))?;
    Ok(Json(user))
}
