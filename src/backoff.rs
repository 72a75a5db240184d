//! Retry backoff derived from a job's priority.
//!
//! Every failure increments a row's `priority`, so the same integer orders
//! claims and counts failures. The delay grows as `e^priority` seconds.

use std::time::Duration;

/// Exponents above this are clamped, which caps the uncapped delay at
/// `e^21` seconds (about 41 years).
pub const MAX_EXPONENT: i32 = 21;

/// Delay before a job with the given `priority` should be retried.
///
/// With `max_delay` set, the result never exceeds it.
pub fn delay(priority: i32, max_delay: Option<Duration>) -> Duration {
    let mut exponent = f64::from(priority.min(MAX_EXPONENT));
    if let Some(max_delay) = max_delay {
        exponent = exponent.min(max_delay.as_secs_f64().ln());
    }

    let delay = Duration::from_secs_f64(exponent.exp());
    match max_delay {
        // `exp(ln(x))` can land a hair above `x`
        Some(max_delay) => delay.min(max_delay),
        None => delay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(duration: Duration) -> f64 {
        duration.as_secs_f64()
    }

    #[test]
    fn grows_exponentially() {
        assert!((secs(delay(0, None)) - 1.0).abs() < 1e-6);
        assert!((secs(delay(1, None)) - std::f64::consts::E).abs() < 1e-6);
        assert!((secs(delay(5, None)) - 148.413).abs() < 1e-3);
        assert!((secs(delay(10, None)) - 22026.466).abs() < 1e-3);
    }

    #[test]
    fn exponent_is_clamped() {
        assert_eq!(delay(MAX_EXPONENT, None), delay(MAX_EXPONENT + 1, None));
        assert_eq!(delay(MAX_EXPONENT, None), delay(i32::MAX, None));
    }

    #[test]
    fn negative_priorities_retry_quickly() {
        assert!(delay(-3, None) < Duration::from_secs(1));
        assert!(delay(i32::MIN, None) < Duration::from_millis(1));
    }

    #[test]
    fn never_exceeds_max_delay() {
        let max_delay = Some(Duration::from_secs(60));
        for priority in -5..=40 {
            assert!(delay(priority, max_delay) <= Duration::from_secs(60));
        }
        assert!((secs(delay(30, max_delay)) - 60.0).abs() < 1e-6);
        assert_eq!(delay(1, max_delay), delay(1, None));
    }

    #[test]
    fn zero_max_delay_retries_immediately() {
        assert_eq!(delay(5, Some(Duration::ZERO)), Duration::ZERO);
    }

    #[test]
    fn non_decreasing_in_failures() {
        for max_delay in [None, Some(Duration::from_secs(300))] {
            let delays: Vec<_> = (0..30).map(|p| delay(p, max_delay)).collect();
            assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        }
    }
}
