//! Cooldown arithmetic and the circuit breaker threshold

use std::time::Duration;

/// Error count at which a rate-limit or authentication failure takes the
/// credential out of rotation until an operator resets it. Unclassified
/// failures count toward it but never trip it.
pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 5;

pub const MAX_COOLDOWN: Duration = Duration::from_secs(60 * 60);

/// Cooldown after a classified failure that brought the credential's error
/// count to `error_count`: `min(60, 2^(error_count - 1))` minutes, and always
/// the maximum once the circuit breaker threshold is reached.
pub fn cooldown_for(error_count: u32) -> Duration {
    if error_count >= CIRCUIT_BREAKER_THRESHOLD {
        return MAX_COOLDOWN;
    }
    let exponent = error_count.saturating_sub(1);
    let minutes = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    Duration::from_secs(minutes.saturating_mul(60)).min(MAX_COOLDOWN)
}

/// Whether a classified failure bringing the count to `error_count` opens
/// the circuit.
pub fn trips_circuit_breaker(error_count: u32) -> bool {
    error_count >= CIRCUIT_BREAKER_THRESHOLD
}
