//! Retry delay computation.

use std::time::Duration;

use orderflow_core::rng::DeterministicRng;
use orderflow_core::subscription::DeliveryPolicy;

/// Delay before the retry that follows `attempts` failed attempts.
///
/// The exponential step `min(cap, base * 2^(attempts - 1))` is scaled by a
/// jitter factor drawn from `[0.5, 1.5)`, and the result never exceeds the
/// cap.
pub fn retry_delay(
    policy: &DeliveryPolicy,
    attempts: u32,
    rng: &mut dyn DeterministicRng,
) -> Duration {
    let exponent = attempts.saturating_sub(1);
    let step = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(exponent))
        .min(policy.backoff_cap_ms);

    let jitter = 0.5 + rng.next_f64().clamp(0.0, 1.0);
    // Millisecond delays are far below 2^52, so the round trip through f64
    // is exact enough; the clamp keeps the result within the cap.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let jittered = (step as f64 * jitter).round() as u64;

    Duration::from_millis(jittered.clamp(1, policy.backoff_cap_ms.max(1)))
}
