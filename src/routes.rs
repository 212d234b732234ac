use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::handlers::{self, AppState};

/// Request body cap. Search bodies are tiny; saved leads are the largest.
const MAX_BODY_BYTES: usize = 1024 * 1024;

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/search", post(handlers::start_search))
        .route("/api/v1/credits/balance", get(handlers::get_balance))
        .route("/api/v1/credits/history", get(handlers::get_credit_history))
        .route("/api/v1/credits/purchase", post(handlers::purchase_credits))
        .route(
            "/api/v1/admin/credits/adjust",
            post(handlers::admin_adjust_credits),
        )
        .route("/api/v1/admin/users/:id", get(handlers::get_user))
        .route("/api/v1/searches", get(handlers::list_searches))
        .route(
            "/api/v1/leads/saved",
            get(handlers::list_saved_leads).post(handlers::save_lead),
        )
        .route(
            "/api/v1/leads/saved/:identity_key",
            delete(handlers::delete_saved_lead),
        )
}

/// Full application router.
///
/// With `rate_limit` set, API routes get a per-IP limiter
/// (10 req/sec, burst of 20); `/health` never does. The server must then be
/// started with connect info so the limiter can see client addresses.
pub fn router(state: Arc<AppState>, rate_limit: bool) -> anyhow::Result<Router> {
    let mut api = api_routes().layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES));

    if rate_limit {
        let governor_conf = Arc::new(
            GovernorConfigBuilder::default()
                .per_second(10)
                .burst_size(20)
                .key_extractor(SmartIpKeyExtractor)
                .finish()
                .ok_or_else(|| anyhow::anyhow!("Invalid rate limiter configuration"))?,
        );
        api = api.layer(ServiceBuilder::new().layer(GovernorLayer {
            config: governor_conf,
        }));
    }

    Ok(Router::new()
        .route("/health", get(handlers::health))
        .merge(api)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()))
}
