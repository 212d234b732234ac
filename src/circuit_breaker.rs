use failsafe::backoff::{self, Exponential};
use failsafe::failure_policy::{self, ConsecutiveFailures};
use failsafe::{Config, StateMachine};
use std::time::Duration;

/// Circuit breaker guarding one external provider.
pub type ProviderBreaker = StateMachine<ConsecutiveFailures<Exponential>, ()>;

/// Creates a circuit breaker for provider calls to prevent hammering a failing API.
///
/// # Configuration
///
/// - **Failure threshold**: 5 consecutive failures triggers OPEN state.
/// - **Backoff**: Exponential backoff from 10s to 60s before attempting recovery.
///
/// # States
///
/// - **CLOSED**: Normal operation, calls pass through.
/// - **OPEN**: Too many failures, pages fail fast without a billable call.
/// - **HALF_OPEN**: Testing if the provider recovered.
///
/// The breaker is shared by every session using the same provider; gateways
/// report outcomes with `on_success` / `on_error`.
pub fn create_provider_circuit_breaker() -> ProviderBreaker {
    let backoff_strategy = backoff::exponential(
        Duration::from_secs(10), // Initial delay
        Duration::from_secs(60), // Maximum delay
    );

    let failure_policy = failure_policy::consecutive_failures(5, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_breaker_opens_after_failures() {
        let cb = create_provider_circuit_breaker();

        for _ in 0..5 {
            assert!(cb.is_call_permitted());
            cb.on_error();
        }

        assert!(!cb.is_call_permitted());
    }

    #[test]
    fn test_circuit_breaker_success_resets_failure_count() {
        let cb = create_provider_circuit_breaker();

        for _ in 0..4 {
            cb.on_error();
        }
        cb.on_success();
        cb.on_error();

        assert!(cb.is_call_permitted());
    }
}
