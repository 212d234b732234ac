use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool};
use std::collections::HashSet;
use uuid::Uuid;

use crate::dedup::HistoryStore;
use crate::ledger::{apply_transition, DebitPolicy, LedgerEntry, LedgerError, LedgerStore};
use crate::models::{
    CreditTransaction, Lead, LeadHistoryEntry, SavedLead, SearchKind, SearchRecord, User,
};
use crate::store::{Reservation, SavedLeadStore, SearchQuota, SearchStore};

/// Postgres implementation of every storage seam.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Inserts a search row, or overwrites the settled fields of an existing one.
async fn insert_search<'e>(
    executor: impl PgExecutor<'e>,
    record: &SearchRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO searches (
            id, user_id, kind, query, requested_count, result_count, status,
            load_more, provider_calls, actual_cost, charged_cost, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (id) DO UPDATE SET
            query = EXCLUDED.query,
            result_count = EXCLUDED.result_count,
            status = EXCLUDED.status,
            provider_calls = EXCLUDED.provider_calls,
            actual_cost = EXCLUDED.actual_cost,
            charged_cost = EXCLUDED.charged_cost
        "#,
    )
    .bind(record.id)
    .bind(record.user_id)
    .bind(record.kind)
    .bind(&record.query)
    .bind(record.requested_count)
    .bind(record.result_count)
    .bind(record.status)
    .bind(record.load_more)
    .bind(&record.provider_calls)
    .bind(&record.actual_cost)
    .bind(&record.charged_cost)
    .bind(record.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn apply(
        &self,
        entry: LedgerEntry,
        policy: DebitPolicy,
    ) -> Result<CreditTransaction, LedgerError> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes concurrent balance changes for this user.
        let current: Option<(BigDecimal,)> =
            sqlx::query_as("SELECT credits FROM users WHERE id = $1 FOR UPDATE")
                .bind(entry.user_id)
                .fetch_optional(&mut *tx)
                .await?;
        let (balance_before,) = current.ok_or(LedgerError::UserNotFound(entry.user_id))?;

        let transition = apply_transition(&balance_before, &entry.amount, policy)?;

        sqlx::query("UPDATE users SET credits = $2, updated_at = now() WHERE id = $1")
            .bind(entry.user_id)
            .bind(&transition.balance_after)
            .execute(&mut *tx)
            .await?;

        let details = entry.details.as_ref();
        let transaction: CreditTransaction = sqlx::query_as(
            r#"
            INSERT INTO credit_transactions (
                user_id, amount, transaction_type, balance_before, balance_after,
                description, actual_cost, charged_cost, provider_calls, result_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(entry.user_id)
        .bind(&transition.applied)
        .bind(entry.transaction_type)
        .bind(&transition.balance_before)
        .bind(&transition.balance_after)
        .bind(&entry.description)
        .bind(details.map(|d| d.charge.actual_cost.clone()))
        .bind(details.map(|d| d.charge.charged_cost.clone()))
        .bind(details.map(|d| Json(d.charge.usage)))
        .bind(details.map(|d| d.result_count as i32))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            "Ledger {:?} for user {}: {} -> {}",
            transaction.transaction_type,
            transaction.user_id,
            transaction.balance_before,
            transaction.balance_after
        );
        Ok(transaction)
    }

    async fn balance(&self, user_id: Uuid) -> Result<BigDecimal, LedgerError> {
        let row: Option<(BigDecimal,)> = sqlx::query_as("SELECT credits FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(credits,)| credits)
            .ok_or(LedgerError::UserNotFound(user_id))
    }

    async fn history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<CreditTransaction>, LedgerError> {
        let rows = sqlx::query_as::<_, CreditTransaction>(
            r#"
            SELECT * FROM credit_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl HistoryStore for PgStore {
    async fn seen_keys(
        &self,
        user_id: Uuid,
        keys: &[String],
    ) -> Result<HashSet<String>, sqlx::Error> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT lead_identifier FROM lead_history WHERE user_id = $1 AND lead_identifier = ANY($2)",
        )
        .bind(user_id)
        .bind(keys)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    async fn record(&self, entries: &[LeadHistoryEntry]) -> Result<u64, sqlx::Error> {
        if entries.is_empty() {
            return Ok(0);
        }
        let user_ids: Vec<Uuid> = entries.iter().map(|e| e.user_id).collect();
        let keys: Vec<String> = entries.iter().map(|e| e.lead_identifier.clone()).collect();
        let queries: Vec<String> = entries.iter().map(|e| e.search_query.clone()).collect();
        let kinds: Vec<SearchKind> = entries.iter().map(|e| e.lead_kind).collect();
        let created: Vec<DateTime<Utc>> = entries.iter().map(|e| e.created_at).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO lead_history (user_id, lead_identifier, search_query, lead_kind, created_at)
            SELECT * FROM UNNEST($1::uuid[], $2::text[], $3::text[], $4::search_kind[], $5::timestamptz[])
            ON CONFLICT (user_id, lead_identifier) DO NOTHING
            "#,
        )
        .bind(&user_ids)
        .bind(&keys)
        .bind(&queries)
        .bind(&kinds)
        .bind(&created)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SearchStore for PgStore {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            "SELECT id, email, credits, status, created_at FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn reserve_search(
        &self,
        record: &SearchRecord,
        quota: SearchQuota,
    ) -> Result<Reservation, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // Same row lock the ledger takes; one reservation per user at a time.
        sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(record.user_id)
            .fetch_one(&mut *tx)
            .await?;

        let (last_start, started_today): (Option<DateTime<Utc>>, i64) = sqlx::query_as(
            r#"
            SELECT MAX(created_at),
                   COUNT(*) FILTER (WHERE created_at >= now() - INTERVAL '24 hours')
            FROM searches
            WHERE user_id = $1
            "#,
        )
        .bind(record.user_id)
        .fetch_one(&mut *tx)
        .await?;

        let decision = quota.check(Utc::now(), last_start, started_today);
        if decision == Reservation::Reserved {
            insert_search(&mut *tx, record).await?;
        }
        tx.commit().await?;
        Ok(decision)
    }

    async fn record_search(&self, record: &SearchRecord) -> Result<(), sqlx::Error> {
        insert_search(&self.pool, record).await
    }

    async fn list_searches(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<SearchRecord>, sqlx::Error> {
        sqlx::query_as::<_, SearchRecord>(
            r#"
            SELECT id, user_id, kind, query, requested_count, result_count, status,
                   load_more, provider_calls, actual_cost, charged_cost, created_at
            FROM searches
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }
}

#[async_trait]
impl SavedLeadStore for PgStore {
    async fn save_lead(&self, user_id: Uuid, lead: &Lead) -> Result<SavedLead, sqlx::Error> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        sqlx::query_as::<_, SavedLead>(
            r#"
            INSERT INTO saved_leads (user_id, lead_identifier, lead)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, lead_identifier)
            DO UPDATE SET lead_identifier = EXCLUDED.lead_identifier
            RETURNING id, user_id, lead_identifier, lead, created_at
            "#,
        )
        .bind(user_id)
        .bind(&lead.identity_key)
        .bind(Json(lead))
        .fetch_one(&self.pool)
        .await
    }

    async fn delete_saved(&self, user_id: Uuid, lead_identifier: &str) -> Result<bool, sqlx::Error> {
        let result =
            sqlx::query("DELETE FROM saved_leads WHERE user_id = $1 AND lead_identifier = $2")
                .bind(user_id)
                .bind(lead_identifier)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_saved(&self, user_id: Uuid) -> Result<Vec<SavedLead>, sqlx::Error> {
        sqlx::query_as::<_, SavedLead>(
            r#"
            SELECT id, user_id, lead_identifier, lead, created_at
            FROM saved_leads
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }
}
