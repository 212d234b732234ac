use bigdecimal::BigDecimal;
use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use lead_search_api::config::PricingConfig;
use lead_search_api::db::Database;
use lead_search_api::db_storage::PgStore;
use lead_search_api::dedup::{Deduplicator, HistoryStore};
use lead_search_api::ledger::{CostModel, Ledger, LedgerError};
use lead_search_api::models::{
    Lead, LeadDetails, ProviderKind, ProviderUsage, SearchCriteria, SearchKind, SearchParams,
    SearchRecord, SearchRequest, SearchStatus,
};
use lead_search_api::store::{Reservation, SavedLeadStore, SearchQuota, SearchStore};

async fn connect() -> anyhow::Result<(Database, Uuid)> {
    let db_url = env::var("TEST_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("Set TEST_DATABASE_URL or DATABASE_URL to run this test"))?;

    let db = Database::new(&db_url).await?;

    // Unique email so repeated runs do not collide.
    let user_id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (id, email, credits) VALUES ($1, $2, $3)")
        .bind(user_id)
        .bind(format!("smoke-{}@example.com", user_id.simple()))
        .bind(BigDecimal::from_str("1.000000")?)
        .execute(&db.pool)
        .await?;

    Ok((db, user_id))
}

fn lead(handle: &str) -> Lead {
    Lead {
        identity_key: format!("people:{}", handle),
        name: handle.to_string(),
        link: format!("https://www.linkedin.com/in/{}", handle),
        location: Some("Austin".to_string()),
        snippet: None,
        details: LeadDetails::People {
            job_title: Some("CTO".to_string()),
            company: None,
            image_url: None,
        },
    }
}

/// Ledger smoke test against Postgres: settlement, strict debits and the row chain.
/// Marked ignored to avoid running against production by accident; set TEST_DATABASE_URL to run.
#[tokio::test]
#[ignore]
async fn ledger_round_trip_smoke_test() -> anyhow::Result<()> {
    let (db, user_id) = connect().await?;
    let store = Arc::new(PgStore::new(db.pool.clone()));
    let ledger = Ledger::new(store.clone(), CostModel::new(PricingConfig::default()));

    let mut usage = ProviderUsage::default();
    usage.record(ProviderKind::WebSearch, 4);
    let settlement = ledger
        .settle_search(user_id, &usage, 12, "people search: CTO".to_string())
        .await?;
    assert_eq!(settlement.charge.charged_cost, BigDecimal::from_str("0.026")?);
    assert_eq!(ledger.get_balance(user_id).await?, BigDecimal::from_str("0.974")?);

    let refused = ledger
        .debit(
            user_id,
            &BigDecimal::from(5),
            lead_search_api::models::TransactionType::AdminDeduction,
            None,
            None,
        )
        .await;
    assert!(matches!(refused, Err(LedgerError::InsufficientFunds { .. })));

    let history = ledger.get_history(user_id, 10).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].result_count, Some(12));
    Ok(())
}

/// History, search summary and saved-lead smoke test against Postgres.
#[tokio::test]
#[ignore]
async fn history_and_saved_leads_smoke_test() -> anyhow::Result<()> {
    let (db, user_id) = connect().await?;
    let store = Arc::new(PgStore::new(db.pool.clone()));
    let dedup = Deduplicator::new(store.clone());

    let shown = vec![lead("alice"), lead("bob")];
    let written = dedup
        .record_shown(user_id, "CTO in Austin", SearchKind::People, &shown)
        .await;
    assert_eq!(written, 2);
    // Repeats are ignored, not errors.
    assert_eq!(
        dedup
            .record_shown(user_id, "CTO in Austin", SearchKind::People, &shown)
            .await,
        0
    );

    let keys = vec!["people:alice".to_string(), "people:carol".to_string()];
    let seen = store.seen_keys(user_id, &keys).await?;
    assert_eq!(seen, HashSet::from(["people:alice".to_string()]));

    let mut session_seen = HashSet::new();
    let fresh = dedup
        .filter_new(user_id, vec![lead("alice"), lead("carol")], &mut session_seen)
        .await?;
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].identity_key, "people:carol");

    let saved = store.save_lead(user_id, &lead("carol")).await?;
    let again = store.save_lead(user_id, &lead("carol")).await?;
    assert_eq!(saved.id, again.id);
    assert_eq!(store.list_saved(user_id).await?.len(), 1);
    assert!(store.delete_saved(user_id, "people:carol").await?);
    assert!(!store.delete_saved(user_id, "people:carol").await?);

    assert!(store.find_user(user_id).await?.is_some());
    Ok(())
}

fn people_request(user_id: Uuid) -> SearchRequest {
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
    .expect("valid request")
}

/// Reservation and settlement of search rows against Postgres.
#[tokio::test]
#[ignore]
async fn search_reservation_smoke_test() -> anyhow::Result<()> {
    let (db, user_id) = connect().await?;
    let store = PgStore::new(db.pool.clone());
    let quota = SearchQuota {
        cooldown: chrono::Duration::seconds(60),
        daily_cap: 5,
    };

    let first = people_request(user_id);
    let reserved = SearchRecord::running(&first);
    assert_eq!(
        store.reserve_search(&reserved, quota).await?,
        Reservation::Reserved
    );
    assert!(matches!(
        store
            .reserve_search(&SearchRecord::running(&people_request(user_id)), quota)
            .await?,
        Reservation::CooldownActive { .. }
    ));

    let settled = SearchRecord {
        result_count: 7,
        status: SearchStatus::Completed,
        ..reserved
    };
    store.record_search(&settled).await?;

    let rows = store.list_searches(user_id, 10).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, SearchStatus::Completed);
    assert_eq!(rows[0].result_count, 7);
    Ok(())
}
