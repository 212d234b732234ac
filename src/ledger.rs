//! Credit accounting.
//!
//! Every balance change goes through [`LedgerStore::apply`], which reads the
//! balance, applies [`apply_transition`] and appends the transaction row inside
//! one atomic unit. Nothing else in the crate writes `users.credits`.

use async_trait::async_trait;
use bigdecimal::{BigDecimal, RoundingMode, Zero};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::PricingConfig;
use crate::errors::AppError;
use crate::models::{CreditTransaction, ProviderKind, ProviderUsage, TransactionType};

/// Decimal places kept for every stored or compared amount.
pub const MONEY_SCALE: i64 = 6;

/// Rounds half-up to [`MONEY_SCALE`] places.
pub fn round_money(value: &BigDecimal) -> BigDecimal {
    value.with_scale_round(MONEY_SCALE, RoundingMode::HalfUp)
}

// ============ Errors ============

#[derive(Debug)]
pub enum LedgerError {
    /// The debit would take the balance below zero.
    InsufficientFunds {
        balance: BigDecimal,
        required: BigDecimal,
    },
    UserNotFound(Uuid),
    InvalidAmount(String),
    Storage(sqlx::Error),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::InsufficientFunds { balance, required } => write!(
                f,
                "insufficient funds: balance {} is below required {}",
                balance, required
            ),
            LedgerError::UserNotFound(id) => write!(f, "user {} not found", id),
            LedgerError::InvalidAmount(msg) => write!(f, "invalid amount: {}", msg),
            LedgerError::Storage(e) => write!(f, "ledger storage error: {}", e),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Storage(err)
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds { .. } => AppError::InsufficientCredits(
                "Not enough credits for this operation. Please add credits.".to_string(),
            ),
            LedgerError::UserNotFound(id) => AppError::NotFound(format!("User {} not found", id)),
            LedgerError::InvalidAmount(msg) => AppError::BadRequest(msg),
            LedgerError::Storage(e) => AppError::DatabaseError(e),
        }
    }
}

// ============ Cost model ============

/// Provider cost of one settled session.
#[derive(Debug, Clone, PartialEq)]
pub struct Charge {
    pub usage: ProviderUsage,
    /// Sum of calls times unit cost.
    pub actual_cost: BigDecimal,
    /// `actual_cost * markup`, rounded.
    pub charged_cost: BigDecimal,
}

impl Charge {
    pub fn is_zero(&self) -> bool {
        self.charged_cost.is_zero()
    }
}

/// Unit prices per provider call plus the markup applied to users.
#[derive(Debug, Clone)]
pub struct CostModel {
    pricing: PricingConfig,
}

impl CostModel {
    pub fn new(pricing: PricingConfig) -> Self {
        Self { pricing }
    }

    pub fn unit_cost(&self, kind: ProviderKind) -> &BigDecimal {
        match kind {
            ProviderKind::WebSearch => &self.pricing.web_search_call,
            ProviderKind::PlacesSearch => &self.pricing.places_search_call,
            ProviderKind::PlaceDetails => &self.pricing.place_details_call,
            ProviderKind::QueryParser => &self.pricing.query_parser_call,
        }
    }

    pub fn markup(&self) -> &BigDecimal {
        &self.pricing.markup
    }

    pub fn actual_cost(&self, usage: &ProviderUsage) -> BigDecimal {
        let total = ProviderKind::ALL
            .iter()
            .fold(BigDecimal::zero(), |acc, kind| {
                acc + self.unit_cost(*kind) * BigDecimal::from(usage.calls(*kind))
            });
        round_money(&total)
    }

    pub fn charged_cost(&self, actual_cost: &BigDecimal) -> BigDecimal {
        round_money(&(actual_cost * &self.pricing.markup))
    }

    pub fn quote(&self, usage: &ProviderUsage) -> Charge {
        let actual_cost = self.actual_cost(usage);
        let charged_cost = self.charged_cost(&actual_cost);
        Charge {
            usage: *usage,
            actual_cost,
            charged_cost,
        }
    }
}

// ============ Transitions ============

/// How a debit that exceeds the balance is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitPolicy {
    /// Abort with [`LedgerError::InsufficientFunds`].
    Strict,
    /// Debit whatever is available, leaving the balance at zero.
    CapAtBalance,
}

/// Outcome of applying a signed amount to a balance.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub balance_before: BigDecimal,
    pub balance_after: BigDecimal,
    /// Signed amount actually applied. Differs from the request only when capped.
    pub applied: BigDecimal,
}

impl Transition {
    /// Part of a requested debit that could not be applied.
    pub fn shortfall(&self, requested: &BigDecimal) -> BigDecimal {
        round_money(&(&self.applied - requested))
    }
}

/// Computes the balance change for `requested` (signed, negative for debits).
///
/// Invariant: `balance_after == balance_before + applied` and
/// `balance_after >= 0` whenever `balance_before >= 0`.
pub fn apply_transition(
    balance_before: &BigDecimal,
    requested: &BigDecimal,
    policy: DebitPolicy,
) -> Result<Transition, LedgerError> {
    let before = round_money(balance_before);
    let requested = round_money(requested);
    let after = &before + &requested;

    if after >= BigDecimal::zero() {
        return Ok(Transition {
            balance_before: before,
            balance_after: after,
            applied: requested,
        });
    }

    match policy {
        DebitPolicy::Strict => Err(LedgerError::InsufficientFunds {
            balance: before,
            required: -requested,
        }),
        DebitPolicy::CapAtBalance => {
            let applied = if before > BigDecimal::zero() {
                -before.clone()
            } else {
                BigDecimal::zero()
            };
            Ok(Transition {
                balance_after: &before + &applied,
                balance_before: before,
                applied,
            })
        }
    }
}

// ============ Storage seam ============

/// Search-specific metadata stored on a search-charge row.
#[derive(Debug, Clone)]
pub struct ChargeDetails {
    pub charge: Charge,
    pub result_count: u32,
}

/// A balance change to be committed atomically.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub user_id: Uuid,
    /// Signed; negative for debits.
    pub amount: BigDecimal,
    pub transaction_type: TransactionType,
    pub description: Option<String>,
    pub details: Option<ChargeDetails>,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Reads the balance, applies the transition and appends the row in one
    /// isolated transaction. Concurrent calls for one user serialize.
    async fn apply(
        &self,
        entry: LedgerEntry,
        policy: DebitPolicy,
    ) -> Result<CreditTransaction, LedgerError>;

    async fn balance(&self, user_id: Uuid) -> Result<BigDecimal, LedgerError>;

    /// Most recent transactions first.
    async fn history(&self, user_id: Uuid, limit: i64)
        -> Result<Vec<CreditTransaction>, LedgerError>;
}

// ============ Ledger ============

/// Result of settling a search charge.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub charge: Charge,
    /// `None` when nothing was owed.
    pub transaction: Option<CreditTransaction>,
    /// Amount that could not be collected because the balance ran out.
    pub shortfall: BigDecimal,
}

#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    cost_model: CostModel,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, cost_model: CostModel) -> Self {
        Self { store, cost_model }
    }

    pub fn cost_model(&self) -> &CostModel {
        &self.cost_model
    }

    /// Removes `amount` from the balance, failing atomically if it would go negative.
    pub async fn debit(
        &self,
        user_id: Uuid,
        amount: &BigDecimal,
        transaction_type: TransactionType,
        description: Option<String>,
        details: Option<ChargeDetails>,
    ) -> Result<CreditTransaction, LedgerError> {
        let amount = positive_amount(amount)?;
        if !transaction_type.is_debit() {
            return Err(LedgerError::InvalidAmount(format!(
                "{:?} is not a debit transaction type",
                transaction_type
            )));
        }
        self.store
            .apply(
                LedgerEntry {
                    user_id,
                    amount: -amount,
                    transaction_type,
                    description,
                    details,
                },
                DebitPolicy::Strict,
            )
            .await
    }

    /// Adds `amount` to the balance. No upper bound.
    pub async fn credit(
        &self,
        user_id: Uuid,
        amount: &BigDecimal,
        transaction_type: TransactionType,
        description: Option<String>,
    ) -> Result<CreditTransaction, LedgerError> {
        let amount = positive_amount(amount)?;
        if transaction_type.is_debit() {
            return Err(LedgerError::InvalidAmount(format!(
                "{:?} is not a credit transaction type",
                transaction_type
            )));
        }
        self.store
            .apply(
                LedgerEntry {
                    user_id,
                    amount,
                    transaction_type,
                    description,
                    details: None,
                },
                DebitPolicy::Strict,
            )
            .await
    }

    /// Charges a finished search session for the provider calls it made.
    ///
    /// If a concurrent session drained the balance since the pre-flight
    /// check, the charge is capped at what is left and the shortfall is
    /// reported instead of failing.
    pub async fn settle_search(
        &self,
        user_id: Uuid,
        usage: &ProviderUsage,
        result_count: u32,
        description: String,
    ) -> Result<Settlement, LedgerError> {
        let charge = self.cost_model.quote(usage);
        if charge.is_zero() {
            return Ok(Settlement {
                charge,
                transaction: None,
                shortfall: BigDecimal::zero(),
            });
        }

        let requested = -charge.charged_cost.clone();
        let transaction = self
            .store
            .apply(
                LedgerEntry {
                    user_id,
                    amount: requested.clone(),
                    transaction_type: TransactionType::SearchCharge,
                    description: Some(description),
                    details: Some(ChargeDetails {
                        charge: charge.clone(),
                        result_count,
                    }),
                },
                DebitPolicy::CapAtBalance,
            )
            .await?;

        let shortfall = round_money(&(&transaction.amount - &requested));
        if shortfall > BigDecimal::zero() {
            tracing::error!(
                "Ledger shortfall for user {}: charged {} of {} ({} uncollected)",
                user_id,
                -transaction.amount.clone(),
                charge.charged_cost,
                shortfall
            );
        }

        Ok(Settlement {
            charge,
            transaction: Some(transaction),
            shortfall,
        })
    }

    pub async fn get_balance(&self, user_id: Uuid) -> Result<BigDecimal, LedgerError> {
        self.store.balance(user_id).await
    }

    pub async fn get_history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<CreditTransaction>, LedgerError> {
        self.store.history(user_id, limit.clamp(1, 500)).await
    }
}

fn positive_amount(amount: &BigDecimal) -> Result<BigDecimal, LedgerError> {
    let amount = round_money(amount);
    if amount <= BigDecimal::zero() {
        return Err(LedgerError::InvalidAmount(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn test_round_money_half_up() {
        assert_eq!(round_money(&dec("0.0000005")), dec("0.000001"));
        assert_eq!(round_money(&dec("0.00000049")), dec("0"));
        assert_eq!(round_money(&dec("1.2345674")), dec("1.234567"));
    }

    #[test]
    fn test_cost_model_applies_markup() {
        let model = CostModel::new(PricingConfig::default());
        let mut usage = ProviderUsage::default();
        usage.record(ProviderKind::WebSearch, 3);
        usage.record(ProviderKind::QueryParser, 1);

        let charge = model.quote(&usage);
        assert_eq!(charge.actual_cost, dec("0.0155"));
        assert_eq!(charge.charged_cost, dec("0.02015"));
    }

    #[test]
    fn test_strict_transition_rejects_overdraft() {
        let err = apply_transition(&dec("0.5"), &dec("-0.6"), DebitPolicy::Strict).unwrap_err();
        match err {
            LedgerError::InsufficientFunds { balance, required } => {
                assert_eq!(balance, dec("0.5"));
                assert_eq!(required, dec("0.6"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_capped_transition_stops_at_zero() {
        let t = apply_transition(&dec("0.5"), &dec("-0.6"), DebitPolicy::CapAtBalance).unwrap();
        assert_eq!(t.balance_after, dec("0"));
        assert_eq!(t.applied, dec("-0.5"));
        assert_eq!(t.shortfall(&dec("-0.6")), dec("0.1"));
    }

    #[test]
    fn test_credit_transition_has_no_upper_bound() {
        let t = apply_transition(&dec("10"), &dec("1000000"), DebitPolicy::Strict).unwrap();
        assert_eq!(t.balance_after, dec("1000010"));
        assert_eq!(&t.balance_before + &t.applied, t.balance_after);
    }
}
