//! Lead Search API Library
//!
//! Credit-metered lead search: a request is authorized against the caller's
//! quota and balance, candidates are paged in from web-search and maps
//! providers, normalized, deduplicated against what the user has already
//! seen, streamed back as Server-Sent Events, and settled against the
//! user's credit ledger.
//!
//! # Modules
//!
//! - `api`: HTTP handlers, routes and the streaming session.
//! - `core`: Orchestration, ledger, deduplication and normalization.
//! - `data`: Storage seams and their implementations.
//! - `integrations`: External provider gateways.
//! - `obs`: Observability and logging.
//! - `cache_validator`: Checksummed cache entries.
//! - `circuit_breaker`: Per-provider circuit breakers.
//! - `config`: Configuration management.
//! - `db`: Database connection and pool management.
//! - `db_storage`: Postgres storage.
//! - `dedup`: Lead identity keys and novelty checks.
//! - `errors`: Error handling types.
//! - `gateway`: Provider gateway contract and throttling.
//! - `guard`: Authentication, cooldown, daily cap and balance checks.
//! - `handlers`: HTTP request handlers.
//! - `ledger`: Credit accounting.
//! - `memory_storage`: In-memory storage for tests.
//! - `models`: Core data models.
//! - `normalizer`: Raw hit to lead conversion.
//! - `orchestrator`: Search state machine.
//! - `places`: Maps/places gateway.
//! - `providers`: Gateway and parser wiring.
//! - `query_parser`: Free-text query parsing.
//! - `routes`: Router construction.
//! - `session`: Streaming session.
//! - `store`: Search and saved-lead storage traits.
//! - `web_search`: Web-search gateway.

pub mod api;
pub mod core;
pub mod data;
pub mod integrations;
pub mod obs;

// Re-export primary modules for shared use in tests and other binaries
pub mod cache_validator;
pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod db_storage;
pub mod dedup;
pub mod errors;
pub mod gateway;
pub mod guard;
pub mod handlers;
pub mod ledger;
pub mod memory_storage;
pub mod models;
pub mod normalizer;
pub mod orchestrator;
pub mod places;
pub mod providers;
pub mod query_parser;
pub mod routes;
pub mod session;
pub mod store;
pub mod web_search;
