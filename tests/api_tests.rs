/// HTTP API tests: router, extractors and the SSE search stream
/// Providers are mocked with wiremock, storage is in memory
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use bigdecimal::BigDecimal;
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use lead_search_api::config::{Config, PricingConfig, ProviderConfig, SearchLimits};
use lead_search_api::guard::Claims;
use lead_search_api::handlers::AppState;
use lead_search_api::memory_storage::MemoryStore;
use lead_search_api::providers::HttpGatewayFactory;
use lead_search_api::routes;
use std::str::FromStr;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "api-test-secret";

fn config(provider_url: &str) -> Config {
    Config {
        database_url: "postgres://unused".to_string(),
        port: 0,
        jwt_secret: SECRET.to_string(),
        providers: ProviderConfig {
            google_search_api_key: "test_key".to_string(),
            google_search_cx: "test_cx".to_string(),
            google_search_base_url: provider_url.to_string(),
            places_api_key: "test_key".to_string(),
            places_base_url: provider_url.to_string(),
            places_fetch_details: false,
            openai_api_key: None,
            openai_base_url: provider_url.to_string(),
            openai_model: "gpt-4o-mini".to_string(),
            web_search_min_interval_ms: 0,
            places_min_interval_ms: 0,
            place_details_min_interval_ms: 0,
        },
        pricing: PricingConfig::default(),
        limits: SearchLimits {
            cooldown_secs: 0,
            ..SearchLimits::default()
        },
    }
}

fn app(store: Arc<MemoryStore>, provider_url: &str) -> axum::Router {
    let config = config(provider_url);
    let client = reqwest::Client::new();
    let gateways = Arc::new(HttpGatewayFactory::new(
        client.clone(),
        config.providers.clone(),
    ));
    let state = Arc::new(AppState::new(config, client, store, gateways));
    routes::router(state, false).unwrap()
}

fn token(user_id: Uuid, role: Option<&str>) -> String {
    let claims = Claims {
        sub: user_id,
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

fn get(uri: &str, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(bearer) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", bearer));
    }
    builder.body(Body::empty()).unwrap()
}

fn post_json(uri: &str, bearer: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(bearer) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", bearer));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn decimal(value: &serde_json::Value) -> BigDecimal {
    let text = value.to_string();
    BigDecimal::from_str(text.trim_matches('"')).unwrap()
}

#[tokio::test]
async fn test_health() {
    let app = app(Arc::new(MemoryStore::new()), "http://127.0.0.1:1");
    let response = app.oneshot(get("/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "healthy");
}

#[tokio::test]
async fn test_balance_requires_token() {
    let app = app(Arc::new(MemoryStore::new()), "http://127.0.0.1:1");
    let response = app
        .oneshot(get("/api/v1/credits/balance", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_purchase_then_balance() {
    let store = Arc::new(MemoryStore::new());
    let user = store.add_user(BigDecimal::from(0));
    let app = app(store, "http://127.0.0.1:1");
    let bearer = token(user, None);

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/credits/purchase",
            Some(&bearer),
            serde_json::json!({ "amount": "25" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let too_much = app
        .clone()
        .oneshot(post_json(
            "/api/v1/credits/purchase",
            Some(&bearer),
            serde_json::json!({ "amount": "5000" }),
        ))
        .await
        .unwrap();
    assert_eq!(too_much.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(get("/api/v1/credits/balance", Some(&bearer)))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(decimal(&body["credits"]), BigDecimal::from(25));
}

#[tokio::test]
async fn test_admin_adjust_requires_admin_role() {
    let store = Arc::new(MemoryStore::new());
    let user = store.add_user(BigDecimal::from(3));
    let admin = store.add_user(BigDecimal::from(0));
    let app = app(store.clone(), "http://127.0.0.1:1");
    let body = serde_json::json!({ "user_id": user, "amount": "-2", "description": "refund reversal" });

    let forbidden = app
        .clone()
        .oneshot(post_json(
            "/api/v1/admin/credits/adjust",
            Some(&token(user, None)),
            body.clone(),
        ))
        .await
        .unwrap();
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/admin/credits/adjust",
            Some(&token(admin, Some("admin"))),
            body,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let row = body_json(response).await;
    assert_eq!(row["transaction_type"], "admin-deduction");
    assert_eq!(decimal(&row["balance_after"]), BigDecimal::from(1));

    let overdraw = app
        .oneshot(post_json(
            "/api/v1/admin/credits/adjust",
            Some(&token(admin, Some("admin"))),
            serde_json::json!({ "user_id": user, "amount": "-2" }),
        ))
        .await
        .unwrap();
    assert_eq!(overdraw.status(), StatusCode::PAYMENT_REQUIRED);
}

#[tokio::test]
async fn test_saved_lead_lifecycle() {
    let store = Arc::new(MemoryStore::new());
    let user = store.add_user(BigDecimal::from(1));
    let app = app(store, "http://127.0.0.1:1");
    let bearer = token(user, None);

    let lead = serde_json::json!({
        "lead": {
            "identity_key": "client-supplied",
            "name": "Jane Doe",
            "link": "https://www.linkedin.com/in/JaneDoe",
            "location": "Austin",
            "snippet": null,
            "kind": "people",
            "job_title": "CTO",
            "company": "Acme",
            "image_url": null
        }
    });

    let created = app
        .clone()
        .oneshot(post_json("/api/v1/leads/saved", Some(&bearer), lead))
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let saved = body_json(created).await;
    assert_eq!(saved["lead_identifier"], "people:janedoe");

    let list = app
        .clone()
        .oneshot(get("/api/v1/leads/saved", Some(&bearer)))
        .await
        .unwrap();
    assert_eq!(body_json(list).await.as_array().unwrap().len(), 1);

    let delete = || {
        Request::builder()
            .method("DELETE")
            .uri("/api/v1/leads/saved/people:janedoe")
            .header(header::AUTHORIZATION, format!("Bearer {}", bearer))
            .body(Body::empty())
            .unwrap()
    };
    let removed = app.clone().oneshot(delete()).await.unwrap();
    assert_eq!(removed.status(), StatusCode::NO_CONTENT);
    let missing = app.oneshot(delete()).await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_search_without_token_streams_error_event() {
    let app = app(Arc::new(MemoryStore::new()), "http://127.0.0.1:1");
    let response = app
        .oneshot(post_json(
            "/api/v1/search",
            None,
            serde_json::json!({ "kind": "people", "job_title": "CTO" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    let text = body_text(response).await;
    assert!(text.contains("event: error"));
    assert!(!text.contains("event: complete"));
}

#[tokio::test]
async fn test_search_streams_leads_and_charges() {
    let mock_server = MockServer::start().await;
    let items: Vec<serde_json::Value> = (0..3)
        .map(|i| {
            serde_json::json!({
                "title": format!("Person {} - CTO - Company {} | LinkedIn", i, i),
                "link": format!("https://www.linkedin.com/in/person-{}", i),
                "snippet": "Austin, Texas, United States · CTO",
            })
        })
        .collect();
    Mock::given(method("GET"))
        .and(path("/customsearch/v1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "items": items })))
        .mount(&mock_server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let user = store.add_user(BigDecimal::from(1));
    let app = app(store.clone(), &mock_server.uri());
    let bearer = token(user, None);

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/search",
            Some(&bearer),
            serde_json::json!({ "kind": "people", "job_title": "CTO", "count": 10 }),
        ))
        .await
        .unwrap();
    let text = body_text(response).await;
    assert!(text.contains("event: progress"));
    assert!(text.contains("event: complete"));
    assert!(text.contains("people:person-2"));

    // Quoted and loose variations, one call each: 2 x 0.005 x 1.3.
    let balance = app
        .clone()
        .oneshot(get("/api/v1/credits/balance", Some(&bearer)))
        .await
        .unwrap();
    assert_eq!(
        decimal(&body_json(balance).await["credits"]),
        BigDecimal::from_str("0.987").unwrap()
    );

    let searches = app
        .oneshot(get("/api/v1/searches", Some(&bearer)))
        .await
        .unwrap();
    let searches = body_json(searches).await;
    assert_eq!(searches.as_array().unwrap().len(), 1);
    assert_eq!(searches[0]["result_count"], 3);
    assert_eq!(store.history_keys(user).len(), 3);
}
