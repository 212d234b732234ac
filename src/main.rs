use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lead_search_api::config::Config;
use lead_search_api::db::Database;
use lead_search_api::db_storage::PgStore;
use lead_search_api::handlers::AppState;
use lead_search_api::obs;
use lead_search_api::providers::HttpGatewayFactory;
use lead_search_api::routes;

/// Main entry point for the application.
///
/// Initializes tracing, configuration, the database pool and provider
/// clients, then serves the HTTP API.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    obs::init_tracing();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    // Initialize database connection pool
    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    let gateways = Arc::new(HttpGatewayFactory::new(
        client.clone(),
        config.providers.clone(),
    ));
    tracing::info!(
        "✓ Provider gateways ready (places details: {})",
        config.providers.places_fetch_details
    );

    let store = Arc::new(PgStore::new(db.pool.clone()));
    let app_state = Arc::new(AppState::new(config.clone(), client, store, gateways));

    let app = routes::router(app_state, true)?;

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
