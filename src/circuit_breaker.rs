use failsafe::backoff::{self, Exponential};
use failsafe::failure_policy::{self, ConsecutiveFailures};
use failsafe::{Config, StateMachine};
use std::time::Duration;

/// Circuit breaker guarding the audit log writes.
pub type AuditCircuitBreaker = StateMachine<ConsecutiveFailures<Exponential>, ()>;

/// Creates the circuit breaker used in front of the audit database.
///
/// # Configuration
///
/// - **Failure threshold**: 5 consecutive failures triggers OPEN state.
/// - **Backoff**: Exponential backoff from 10s to 60s before attempting recovery.
///
/// While the circuit is open, outcome writes are rejected immediately and
/// the dispatch path only logs them.
pub fn create_audit_circuit_breaker() -> AuditCircuitBreaker {
    audit_circuit_breaker_with(5, Duration::from_secs(10), Duration::from_secs(60))
}

/// Same breaker with explicit threshold and backoff bounds.
pub fn audit_circuit_breaker_with(
    consecutive_failures: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
) -> AuditCircuitBreaker {
    let backoff_strategy = backoff::exponential(initial_backoff, max_backoff);
    let failure_policy =
        failure_policy::consecutive_failures(consecutive_failures, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}
