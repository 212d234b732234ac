//! In-process implementation of every storage seam, used by tests.
//!
//! A single mutex guards all state, so ledger applies serialize the same way
//! row locks make them serialize in Postgres.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::dedup::HistoryStore;
use crate::ledger::{apply_transition, DebitPolicy, LedgerEntry, LedgerError, LedgerStore};
use crate::models::{
    AccountStatus, CreditTransaction, Lead, LeadHistoryEntry, SavedLead, SearchRecord, User,
};
use crate::store::{Reservation, SavedLeadStore, SearchQuota, SearchStore};

#[derive(Default)]
struct State {
    users: HashMap<Uuid, User>,
    transactions: Vec<CreditTransaction>,
    history: HashMap<(Uuid, String), LeadHistoryEntry>,
    searches: Vec<SearchRecord>,
    saved: Vec<SavedLead>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    history_lookups: AtomicUsize,
    fail_history_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-write.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates an active user with `balance` credits.
    pub fn add_user(&self, balance: BigDecimal) -> Uuid {
        self.add_user_with_status(balance, AccountStatus::Active)
    }

    pub fn add_user_with_status(&self, balance: BigDecimal, status: AccountStatus) -> Uuid {
        let id = Uuid::new_v4();
        self.state().users.insert(
            id,
            User {
                id,
                email: format!("{}@example.com", id.simple()),
                credits: balance,
                status,
                created_at: Utc::now(),
            },
        );
        id
    }

    /// Makes history inserts fail, to exercise best-effort paths.
    pub fn set_fail_history_writes(&self, fail: bool) {
        self.fail_history_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of batched history lookups served so far.
    pub fn history_lookups(&self) -> usize {
        self.history_lookups.load(Ordering::SeqCst)
    }

    pub fn history_keys(&self, user_id: Uuid) -> HashSet<String> {
        self.state()
            .history
            .keys()
            .filter(|(u, _)| *u == user_id)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn transactions(&self, user_id: Uuid) -> Vec<CreditTransaction> {
        self.state()
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn searches(&self, user_id: Uuid) -> Vec<SearchRecord> {
        self.state()
            .searches
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn apply(
        &self,
        entry: LedgerEntry,
        policy: DebitPolicy,
    ) -> Result<CreditTransaction, LedgerError> {
        let mut state = self.state();
        let user = state
            .users
            .get_mut(&entry.user_id)
            .ok_or(LedgerError::UserNotFound(entry.user_id))?;

        let transition = apply_transition(&user.credits, &entry.amount, policy)?;
        user.credits = transition.balance_after.clone();

        let details = entry.details;
        let transaction = CreditTransaction {
            id: Uuid::new_v4(),
            user_id: entry.user_id,
            amount: transition.applied,
            transaction_type: entry.transaction_type,
            balance_before: transition.balance_before,
            balance_after: transition.balance_after,
            description: entry.description,
            actual_cost: details.as_ref().map(|d| d.charge.actual_cost.clone()),
            charged_cost: details.as_ref().map(|d| d.charge.charged_cost.clone()),
            provider_calls: details
                .as_ref()
                .map(|d| sqlx::types::Json(d.charge.usage)),
            result_count: details.as_ref().map(|d| d.result_count as i32),
            created_at: Utc::now(),
        };
        state.transactions.push(transaction.clone());
        Ok(transaction)
    }

    async fn balance(&self, user_id: Uuid) -> Result<BigDecimal, LedgerError> {
        self.state()
            .users
            .get(&user_id)
            .map(|u| u.credits.clone())
            .ok_or(LedgerError::UserNotFound(user_id))
    }

    async fn history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<CreditTransaction>, LedgerError> {
        Ok(self
            .state()
            .transactions
            .iter()
            .rev()
            .filter(|t| t.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn seen_keys(
        &self,
        user_id: Uuid,
        keys: &[String],
    ) -> Result<HashSet<String>, sqlx::Error> {
        self.history_lookups.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        Ok(keys
            .iter()
            .filter(|k| state.history.contains_key(&(user_id, (*k).clone())))
            .cloned()
            .collect())
    }

    async fn record(&self, entries: &[LeadHistoryEntry]) -> Result<u64, sqlx::Error> {
        if self.fail_history_writes.load(Ordering::SeqCst) {
            return Err(sqlx::Error::PoolTimedOut);
        }
        let mut state = self.state();
        let mut inserted = 0;
        for entry in entries {
            let key = (entry.user_id, entry.lead_identifier.clone());
            if !state.history.contains_key(&key) {
                state.history.insert(key, entry.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[async_trait]
impl SearchStore for MemoryStore {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, sqlx::Error> {
        Ok(self.state().users.get(&user_id).cloned())
    }

    async fn reserve_search(
        &self,
        record: &SearchRecord,
        quota: SearchQuota,
    ) -> Result<Reservation, sqlx::Error> {
        let mut state = self.state();
        let now = Utc::now();
        let since = now - Duration::hours(24);
        let mut last_start = None;
        let mut started_today = 0;
        for search in state.searches.iter().filter(|s| s.user_id == record.user_id) {
            last_start = last_start.max(Some(search.created_at));
            if search.created_at >= since {
                started_today += 1;
            }
        }

        let decision = quota.check(now, last_start, started_today);
        if decision == Reservation::Reserved {
            state.searches.push(record.clone());
        }
        Ok(decision)
    }

    async fn record_search(&self, record: &SearchRecord) -> Result<(), sqlx::Error> {
        let mut state = self.state();
        match state.searches.iter_mut().find(|s| s.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => state.searches.push(record.clone()),
        }
        Ok(())
    }

    async fn list_searches(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<SearchRecord>, sqlx::Error> {
        let mut rows = self.searches(user_id);
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}

#[async_trait]
impl SavedLeadStore for MemoryStore {
    async fn save_lead(&self, user_id: Uuid, lead: &Lead) -> Result<SavedLead, sqlx::Error> {
        let mut state = self.state();
        if let Some(existing) = state
            .saved
            .iter()
            .find(|s| s.user_id == user_id && s.lead_identifier == lead.identity_key)
        {
            return Ok(existing.clone());
        }
        let saved = SavedLead {
            id: Uuid::new_v4(),
            user_id,
            lead_identifier: lead.identity_key.clone(),
            lead: sqlx::types::Json(lead.clone()),
            created_at: Utc::now(),
        };
        state.saved.push(saved.clone());
        Ok(saved)
    }

    async fn delete_saved(&self, user_id: Uuid, lead_identifier: &str) -> Result<bool, sqlx::Error> {
        let mut state = self.state();
        let before = state.saved.len();
        state
            .saved
            .retain(|s| !(s.user_id == user_id && s.lead_identifier == lead_identifier));
        Ok(state.saved.len() < before)
    }

    async fn list_saved(&self, user_id: Uuid) -> Result<Vec<SavedLead>, sqlx::Error> {
        let mut rows: Vec<SavedLead> = self
            .state()
            .saved
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }
}
