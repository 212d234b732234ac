/// Ledger behavior under concurrent sessions, using the in-memory store
use bigdecimal::{BigDecimal, Zero};
use lead_search_api::config::PricingConfig;
use lead_search_api::ledger::{CostModel, Ledger, LedgerError};
use lead_search_api::memory_storage::MemoryStore;
use lead_search_api::models::{ProviderKind, ProviderUsage, TransactionType};
use std::str::FromStr;
use std::sync::Arc;

fn money(value: &str) -> BigDecimal {
    BigDecimal::from_str(value).unwrap()
}

fn ledger(store: &Arc<MemoryStore>) -> Ledger {
    Ledger::new(store.clone(), CostModel::new(PricingConfig::default()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_debits_never_overdraw() {
    let store = Arc::new(MemoryStore::new());
    let user = store.add_user(money("1"));
    let ledger = ledger(&store);

    let handles: Vec<_> = (0..25)
        .map(|i| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .debit(
                        user,
                        &money("0.1"),
                        TransactionType::AdminDeduction,
                        Some(format!("deduction {}", i)),
                        None,
                    )
                    .await
            })
        })
        .collect();

    let mut succeeded = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(LedgerError::InsufficientFunds { .. }) => refused += 1,
            Err(e) => panic!("unexpected ledger error: {}", e),
        }
    }

    assert_eq!(succeeded, 10);
    assert_eq!(refused, 15);
    assert!(ledger.get_balance(user).await.unwrap().is_zero());

    // Each row continues from the previous one.
    let mut rows = store.transactions(user);
    rows.sort_by(|a, b| b.balance_before.cmp(&a.balance_before));
    for pair in rows.windows(2) {
        assert_eq!(pair[0].balance_after, pair[1].balance_before);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_settlements_cap_at_balance() {
    let store = Arc::new(MemoryStore::new());
    // Enough for one session of 10 web calls (0.065) but not two.
    let user = store.add_user(money("0.1"));
    let ledger = ledger(&store);

    let mut usage = ProviderUsage::default();
    usage.record(ProviderKind::WebSearch, 10);

    let first = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            ledger
                .settle_search(user, &usage, 10, "people search: CTO".to_string())
                .await
        })
    };
    let second = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            ledger
                .settle_search(user, &usage, 10, "people search: CFO".to_string())
                .await
        })
    };

    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();

    let total_shortfall = &a.shortfall + &b.shortfall;
    assert_eq!(total_shortfall, money("0.03"));
    assert!(ledger.get_balance(user).await.unwrap().is_zero());
    assert_eq!(store.transactions(user).len(), 2);
}

#[tokio::test]
async fn test_settlement_records_charge_details() {
    let store = Arc::new(MemoryStore::new());
    let user = store.add_user(money("5"));
    let ledger = ledger(&store);

    let mut usage = ProviderUsage::default();
    usage.record(ProviderKind::PlacesSearch, 2);
    usage.record(ProviderKind::PlaceDetails, 20);
    usage.record(ProviderKind::QueryParser, 1);

    let settlement = ledger
        .settle_search(user, &usage, 18, "business search: bakery in Austin".to_string())
        .await
        .unwrap();

    // 2 x 0.032 + 20 x 0.017 + 0.0005 = 0.4045, x 1.3 = 0.52585
    assert_eq!(settlement.charge.actual_cost, money("0.4045"));
    assert_eq!(settlement.charge.charged_cost, money("0.52585"));
    assert!(settlement.shortfall.is_zero());

    let row = settlement.transaction.unwrap();
    assert_eq!(row.transaction_type, TransactionType::SearchCharge);
    assert_eq!(row.amount, money("-0.52585"));
    assert_eq!(row.balance_after, money("4.47415"));
    assert_eq!(row.result_count, Some(18));
    assert_eq!(row.provider_calls.unwrap().0.calls(ProviderKind::PlaceDetails), 20);
}

#[tokio::test]
async fn test_zero_usage_settles_without_a_row() {
    let store = Arc::new(MemoryStore::new());
    let user = store.add_user(money("1"));
    let ledger = ledger(&store);

    let settlement = ledger
        .settle_search(user, &ProviderUsage::default(), 0, "people search".to_string())
        .await
        .unwrap();

    assert!(settlement.transaction.is_none());
    assert!(store.transactions(user).is_empty());
    assert_eq!(ledger.get_balance(user).await.unwrap(), money("1"));
}

#[tokio::test]
async fn test_credit_then_history_is_newest_first() {
    let store = Arc::new(MemoryStore::new());
    let user = store.add_user(BigDecimal::zero());
    let ledger = ledger(&store);

    ledger
        .credit(user, &money("25"), TransactionType::Purchase, None)
        .await
        .unwrap();
    ledger
        .debit(user, &money("5"), TransactionType::AdminDeduction, None, None)
        .await
        .unwrap();

    let history = ledger.get_history(user, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].transaction_type, TransactionType::AdminDeduction);
    assert_eq!(history[1].balance_after, money("25"));
    assert_eq!(ledger.get_balance(user).await.unwrap(), money("20"));
}

#[tokio::test]
async fn test_credit_rejects_debit_types_and_non_positive_amounts() {
    let store = Arc::new(MemoryStore::new());
    let user = store.add_user(money("1"));
    let ledger = ledger(&store);

    assert!(matches!(
        ledger
            .credit(user, &money("1"), TransactionType::SearchCharge, None)
            .await,
        Err(LedgerError::InvalidAmount(_))
    ));
    assert!(matches!(
        ledger
            .debit(user, &money("-1"), TransactionType::AdminDeduction, None, None)
            .await,
        Err(LedgerError::InvalidAmount(_))
    ));
    assert!(store.transactions(user).is_empty());
}
