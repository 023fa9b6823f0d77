//! Bounded exponential backoff shared by the bulk-send loop and the step
//! scheduler's re-schedule path.

use rand::Rng;

/// Delay before retry attempt `attempt` (1-based): `base * 2^(attempt-1)`
/// plus up to half the base of jitter, capped at one hour.
pub fn backoff_secs(base_secs: u64, attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1).min(10);
    let delay = base_secs.saturating_mul(1u64 << exp);
    let jitter = if base_secs > 1 {
        rand::thread_rng().gen_range(0..base_secs / 2)
    } else {
        0
    };
    (delay + jitter).min(3600)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let first = backoff_secs(60, 1);
        assert!((60..90).contains(&first));

        let third = backoff_secs(60, 3);
        assert!(third >= 240);

        assert_eq!(backoff_secs(60, 12), 3600);
    }
}
