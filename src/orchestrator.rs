//! Drives one search from authorization to its terminal message.
//!
//! ```text
//! Idle -> Authorizing -> Fetching <-> Emitting -> Settling -> Completed
//!                 \___________\__________\___________\-----> Failed
//! ```
//!
//! No lock or database transaction is held across a provider call; the only
//! state shared with other sessions lives behind the ledger and history stores.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::config::SearchLimits;
use crate::dedup::Deduplicator;
use crate::gateway::{GatewayFactory, PageCursor, ProviderError};
use crate::guard::QuotaGuard;
use crate::ledger::{Ledger, Settlement};
use crate::models::{
    Lead, ProviderUsage, SearchCriteria, SearchParams, SearchRecord, SearchRequest, SearchStatus,
};
use crate::normalizer::{RegexSnippetParser, ResultNormalizer};
use crate::query_parser::QueryParser;
use crate::session::StreamingSession;
use crate::store::SearchStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPhase {
    Idle,
    Authorizing,
    Fetching,
    Emitting,
    Settling,
    Completed,
    Failed,
}

/// Why fetching ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The gateway has no further pages.
    Exhausted,
    TargetReached,
    PageBudget,
    CallCeiling,
    WallClock,
    RateLimited,
    Cancelled,
    /// A provider rejected credentials or quota.
    Fatal,
}

/// Summary of a finished session, returned to the caller for logging and tests.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub phase: SearchPhase,
    /// `None` when the search was rejected before it started.
    pub status: Option<SearchStatus>,
    pub stop_reason: Option<StopReason>,
    pub usage: ProviderUsage,
    pub leads: Vec<Lead>,
    pub settlement: Option<Settlement>,
    pub error: Option<String>,
}

impl SearchOutcome {
    fn rejected(message: String) -> Self {
        Self {
            phase: SearchPhase::Failed,
            status: None,
            stop_reason: None,
            usage: ProviderUsage::default(),
            leads: Vec::new(),
            settlement: None,
            error: Some(message),
        }
    }
}

/// Per-session working state. Never shared between sessions.
struct SearchRun {
    search_id: Uuid,
    phase: SearchPhase,
    started: Instant,
    usage: ProviderUsage,
    leads: Vec<Lead>,
    seen: HashSet<String>,
    pages_fetched: u32,
    pages_ok: u32,
    pages_failed: u32,
    pages_since_emit: u32,
    snapshots: u32,
    /// Leads already sent to the client in a progress snapshot.
    delivered: usize,
}

impl SearchRun {
    fn new(search_id: Uuid) -> Self {
        Self {
            search_id,
            phase: SearchPhase::Idle,
            started: Instant::now(),
            usage: ProviderUsage::default(),
            leads: Vec::new(),
            seen: HashSet::new(),
            pages_fetched: 0,
            pages_ok: 0,
            pages_failed: 0,
            pages_since_emit: 0,
            snapshots: 0,
            delivered: 0,
        }
    }

    fn enter(&mut self, next: SearchPhase) {
        tracing::debug!("Search {}: {:?} -> {:?}", self.search_id, self.phase, next);
        self.phase = next;
    }
}

pub struct SearchOrchestrator {
    guard: Arc<QuotaGuard>,
    gateways: Arc<dyn GatewayFactory>,
    parser: Arc<QueryParser>,
    normalizer: ResultNormalizer,
    dedup: Deduplicator,
    ledger: Ledger,
    searches: Arc<dyn SearchStore>,
    limits: SearchLimits,
}

impl SearchOrchestrator {
    pub fn new(
        guard: Arc<QuotaGuard>,
        gateways: Arc<dyn GatewayFactory>,
        parser: Arc<QueryParser>,
        dedup: Deduplicator,
        ledger: Ledger,
        searches: Arc<dyn SearchStore>,
        limits: SearchLimits,
    ) -> Self {
        Self {
            guard,
            gateways,
            parser,
            normalizer: ResultNormalizer::new(Arc::new(RegexSnippetParser::new())),
            dedup,
            ledger,
            searches,
            limits,
        }
    }

    pub fn with_normalizer(mut self, normalizer: ResultNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Authenticates the caller, validates the parameters and runs the search.
    pub async fn run(
        &self,
        bearer: Option<&str>,
        params: SearchParams,
        session: StreamingSession,
    ) -> SearchOutcome {
        let user = match self.guard.authenticate(bearer) {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!("Search rejected: {}", e);
                let message = e.user_message();
                session.fail(message.clone()).await;
                return SearchOutcome::rejected(message);
            }
        };

        let request = match SearchRequest::new(user.user_id, params, self.limits.max_results) {
            Ok(request) => request,
            Err(e) => {
                let message = e.user_message();
                session.fail(message.clone()).await;
                return SearchOutcome::rejected(message);
            }
        };

        self.execute(request, session).await
    }

    /// Runs an already validated request through the state machine.
    ///
    /// Exactly one terminal message is sent on `session`.
    pub async fn execute(&self, request: SearchRequest, session: StreamingSession) -> SearchOutcome {
        let mut run = SearchRun::new(request.id());
        let kind = request.kind();
        let user_id = request.user_id();

        run.enter(SearchPhase::Authorizing);
        if let Err(e) = self.guard.authorize(&request).await {
            tracing::info!("Search {} not authorized for user {}: {}", run.search_id, user_id, e);
            let message = e.user_message();
            session.fail(message.clone()).await;
            return SearchOutcome::rejected(message);
        }

        tracing::info!(
            "Search {} started: {} '{}' (count {}, load_more {})",
            run.search_id,
            kind,
            request.describe(),
            request.requested_count(),
            request.is_load_more()
        );

        run.enter(SearchPhase::Fetching);
        let mut criteria = request.criteria().clone();
        if criteria.needs_parsing(kind) {
            let text = criteria.query.clone().unwrap_or_default();
            let parsed = self.parser.parse(&text, kind).await;
            run.usage.merge(&parsed.usage);
            match parsed.result {
                Ok(parsed) => parsed.apply_to(&mut criteria),
                Err(e) => {
                    tracing::error!("Search {} aborted by query parser: {}", run.search_id, e);
                    return self
                        .fail(&request, &criteria, run, session, StopReason::Fatal, fatal_message(&e))
                        .await;
                }
            }
            if criteria.subject(kind).is_none() {
                return self
                    .fail(
                        &request,
                        &criteria,
                        run,
                        session,
                        StopReason::Exhausted,
                        "Could not understand the search query. Please add more detail.".to_string(),
                    )
                    .await;
            }
        }

        let gateway = self.gateways.gateway(kind);
        let target = request.requested_count() as usize;
        let cadence = self.limits.emit_every_pages.max(1);
        let wall_clock = self.limits.wall_clock();
        let mut cursor = Some(PageCursor::start());

        let stop = loop {
            let Some(current) = cursor.take() else {
                break StopReason::Exhausted;
            };

            let page = gateway.fetch_page(&criteria, &current).await;
            // A page answered without any provider call is not a successful fetch.
            let called = page.usage.total() > 0;
            run.usage.merge(&page.usage);
            run.pages_fetched += 1;
            run.pages_since_emit += 1;

            match page.result {
                Ok(page) => {
                    cursor = page.next;
                    let candidates = self.normalizer.normalize_batch(page.hits, &criteria);
                    match self.dedup.filter_new(user_id, candidates, &mut run.seen).await {
                        Ok(accepted) => {
                            if called {
                                run.pages_ok += 1;
                            }
                            let room = target.saturating_sub(run.leads.len());
                            let accepted: Vec<Lead> = accepted.into_iter().take(room).collect();
                            if !accepted.is_empty() {
                                run.leads.extend(accepted);
                                if run.snapshots == 0 || run.pages_since_emit >= cadence {
                                    run.enter(SearchPhase::Emitting);
                                    session.progress(&run.leads).await;
                                    run.snapshots += 1;
                                    run.delivered = run.leads.len();
                                    run.pages_since_emit = 0;
                                    run.enter(SearchPhase::Fetching);
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Search {}: history lookup failed, dropping page: {}",
                                run.search_id,
                                e
                            );
                            run.pages_failed += 1;
                        }
                    }
                }
                Err(ProviderError::RateLimited) => {
                    tracing::warn!(
                        "Search {}: {} rate limited, stopping",
                        run.search_id,
                        gateway.name()
                    );
                    run.pages_failed += 1;
                    break StopReason::RateLimited;
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(
                        "Search {}: fatal {} error: {}",
                        run.search_id,
                        gateway.name(),
                        e
                    );
                    return self
                        .fail(&request, &criteria, run, session, StopReason::Fatal, fatal_message(&e))
                        .await;
                }
                Err(e) => {
                    tracing::warn!(
                        "Search {}: {} page failed, treating as empty: {}",
                        run.search_id,
                        gateway.name(),
                        e
                    );
                    run.pages_failed += 1;
                    cursor = gateway.skip(&criteria, &current);
                }
            }

            if cursor.is_none() {
                break StopReason::Exhausted;
            }
            if run.leads.len() >= target {
                break StopReason::TargetReached;
            }
            if run.pages_fetched >= self.limits.max_pages {
                break StopReason::PageBudget;
            }
            if run.usage.total() >= self.limits.max_provider_calls {
                break StopReason::CallCeiling;
            }
            if run.started.elapsed() >= wall_clock {
                break StopReason::WallClock;
            }
            if session.is_cancelled() {
                break StopReason::Cancelled;
            }
        };

        tracing::info!(
            "Search {} stopped ({:?}) after {} pages: {} ok, {} failed, {} leads",
            run.search_id,
            stop,
            run.pages_fetched,
            run.pages_ok,
            run.pages_failed,
            run.leads.len()
        );

        if run.pages_ok == 0 && run.pages_failed > 0 {
            return self
                .fail(
                    &request,
                    &criteria,
                    run,
                    session,
                    stop,
                    "The search providers are not responding. Please try again later.".to_string(),
                )
                .await;
        }

        let status = if stop == StopReason::Cancelled {
            SearchStatus::Cancelled
        } else {
            SearchStatus::Completed
        };
        self.complete(&request, &criteria, run, session, stop, status)
            .await
    }

    async fn complete(
        &self,
        request: &SearchRequest,
        criteria: &SearchCriteria,
        mut run: SearchRun,
        session: StreamingSession,
        stop: StopReason,
        status: SearchStatus,
    ) -> SearchOutcome {
        run.enter(SearchPhase::Settling);
        let settlement = self.settle(request, criteria, &run, status).await;

        let shown = match status {
            SearchStatus::Cancelled => &run.leads[..run.delivered],
            _ => &run.leads[..],
        };
        self.dedup
            .record_shown(
                request.user_id(),
                &criteria.describe(request.kind()),
                request.kind(),
                shown,
            )
            .await;

        session.complete(run.leads.clone()).await;
        run.enter(SearchPhase::Completed);

        SearchOutcome {
            phase: run.phase,
            status: Some(status),
            stop_reason: Some(stop),
            usage: run.usage,
            leads: run.leads,
            settlement,
            error: None,
        }
    }

    /// Settles what was consumed and ends the session with an error.
    /// No lead history is written.
    async fn fail(
        &self,
        request: &SearchRequest,
        criteria: &SearchCriteria,
        mut run: SearchRun,
        session: StreamingSession,
        stop: StopReason,
        message: String,
    ) -> SearchOutcome {
        run.enter(SearchPhase::Settling);
        let settlement = self
            .settle(request, criteria, &run, SearchStatus::Failed)
            .await;

        session.fail(message.clone()).await;
        run.enter(SearchPhase::Failed);

        SearchOutcome {
            phase: run.phase,
            status: Some(SearchStatus::Failed),
            stop_reason: Some(stop),
            usage: run.usage,
            leads: Vec::new(),
            settlement,
            error: Some(message),
        }
    }

    /// Charges the session and persists its summary row. Storage failures
    /// are logged; the client still receives its terminal message.
    async fn settle(
        &self,
        request: &SearchRequest,
        criteria: &SearchCriteria,
        run: &SearchRun,
        status: SearchStatus,
    ) -> Option<Settlement> {
        let description = format!("{} search: {}", request.kind(), criteria.describe(request.kind()));
        let result_count = match status {
            SearchStatus::Failed => 0,
            _ => run.leads.len() as u32,
        };

        let settlement = match self
            .ledger
            .settle_search(request.user_id(), &run.usage, result_count, description)
            .await
        {
            Ok(settlement) => {
                tracing::info!(
                    "Search {} settled: {} calls, actual {} charged {}",
                    run.search_id,
                    run.usage.total(),
                    settlement.charge.actual_cost,
                    settlement.charge.charged_cost
                );
                Some(settlement)
            }
            Err(e) => {
                tracing::error!("Search {} settlement failed: {}", run.search_id, e);
                None
            }
        };

        let charge = settlement
            .as_ref()
            .map(|s| s.charge.clone())
            .unwrap_or_else(|| self.ledger.cost_model().quote(&run.usage));
        let record = SearchRecord {
            id: run.search_id,
            user_id: request.user_id(),
            kind: request.kind(),
            query: criteria.describe(request.kind()),
            requested_count: request.requested_count() as i32,
            result_count: result_count as i32,
            status,
            load_more: request.is_load_more(),
            provider_calls: sqlx::types::Json(run.usage),
            actual_cost: charge.actual_cost,
            charged_cost: charge.charged_cost,
            created_at: request.created_at(),
        };
        if let Err(e) = self.searches.record_search(&record).await {
            tracing::warn!("Failed to record search {}: {}", run.search_id, e);
        }

        settlement
    }
}

fn fatal_message(error: &ProviderError) -> String {
    match error {
        ProviderError::QuotaExhausted(_) => {
            "The search provider's quota is exhausted. Please try again later.".to_string()
        }
        _ => "The search provider rejected our request. Please contact support.".to_string(),
    }
}
