//! Storage seams for users, search records and saved leads.
//!
//! The ledger and lead history have their own traits next to the logic that
//! uses them ([`crate::ledger::LedgerStore`], [`crate::dedup::HistoryStore`]).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::{Lead, SavedLead, SearchRecord, User};

/// Per-user limits enforced when a search row is reserved.
#[derive(Debug, Clone, Copy)]
pub struct SearchQuota {
    /// Minimum time between two search starts. Zero disables the check.
    pub cooldown: Duration,
    /// Searches allowed in any rolling 24 hours, running ones included.
    pub daily_cap: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved,
    CooldownActive { retry_after_secs: u64 },
    DailyCapReached,
}

impl SearchQuota {
    /// Decides a reservation from the user's latest start and 24-hour count.
    pub fn check(
        &self,
        now: DateTime<Utc>,
        last_start: Option<DateTime<Utc>>,
        started_today: i64,
    ) -> Reservation {
        if self.cooldown > Duration::zero() {
            if let Some(last) = last_start {
                let elapsed = now - last;
                if elapsed < self.cooldown {
                    let remaining = (self.cooldown - elapsed).num_seconds().max(1) as u64;
                    return Reservation::CooldownActive {
                        retry_after_secs: remaining,
                    };
                }
            }
        }
        if started_today >= i64::from(self.daily_cap) {
            return Reservation::DailyCapReached;
        }
        Reservation::Reserved
    }
}

#[async_trait]
pub trait SearchStore: Send + Sync {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, sqlx::Error>;

    /// Inserts `record` (status `running`) unless `quota` forbids it.
    /// Check and insert are atomic per user, so concurrent sessions of one
    /// user cannot both pass.
    async fn reserve_search(
        &self,
        record: &SearchRecord,
        quota: SearchQuota,
    ) -> Result<Reservation, sqlx::Error>;

    /// Writes the settled state over the reserved row, inserting it if missing.
    async fn record_search(&self, record: &SearchRecord) -> Result<(), sqlx::Error>;

    /// Most recent first.
    async fn list_searches(&self, user_id: Uuid, limit: i64)
        -> Result<Vec<SearchRecord>, sqlx::Error>;
}

#[async_trait]
pub trait SavedLeadStore: Send + Sync {
    /// Saving the same lead twice returns the existing row.
    async fn save_lead(&self, user_id: Uuid, lead: &Lead) -> Result<SavedLead, sqlx::Error>;

    /// Returns whether a row was removed.
    async fn delete_saved(&self, user_id: Uuid, lead_identifier: &str) -> Result<bool, sqlx::Error>;

    async fn list_saved(&self, user_id: Uuid) -> Result<Vec<SavedLead>, sqlx::Error>;
}
