use rand::Rng;
use std::time::Duration;

/// Delay before attempt `attempt` (attempt >= 2):
/// `min(max_delay, retry_delay * 2^(attempt - 2))`.
pub fn delay_for_attempt(attempt: u32, retry_delay: Duration, max_delay: Duration) -> Duration {
    debug_assert!(attempt >= 2);
    let exp = attempt.saturating_sub(2).min(31);
    let factor = 2u32.saturating_pow(exp);
    retry_delay.saturating_mul(factor).min(max_delay)
}

/// Uniform ±10% jitter so concurrent runs don't retry in lockstep.
pub fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_per_attempt() {
        let base = Duration::from_millis(1000);
        let cap = Duration::from_millis(5000);
        assert_eq!(delay_for_attempt(2, base, cap), Duration::from_millis(1000));
        assert_eq!(delay_for_attempt(3, base, cap), Duration::from_millis(2000));
        assert_eq!(delay_for_attempt(4, base, cap), Duration::from_millis(4000));
    }

    #[test]
    fn delays_are_capped() {
        let base = Duration::from_millis(1000);
        let cap = Duration::from_millis(5000);
        assert_eq!(delay_for_attempt(5, base, cap), cap);
        assert_eq!(delay_for_attempt(40, base, cap), cap);
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let delay = Duration::from_millis(1000);
        for _ in 0..100 {
            let j = jittered(delay);
            assert!(j >= Duration::from_millis(900));
            assert!(j <= Duration::from_millis(1100));
        }
    }
}
