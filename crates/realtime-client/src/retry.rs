use std::time::Duration;

use rand::Rng;

/// Backoff grows linearly over the first few attempts and caps at twice the base.
pub fn backoff_coefficient(retry_count: u32) -> f64 {
    f64::from((retry_count + 2).min(6)) / 3.0
}

/// Up to 20% below 1.0 so clients retrying together spread out.
pub fn jitter_coefficient() -> f64 {
    1.0 - rand::thread_rng().gen_range(0.0..0.2)
}

/// Delay before retry number `retry_count` (1-based).
pub fn retry_time(initial: Duration, retry_count: u32) -> Duration {
    initial.mul_f64(backoff_coefficient(retry_count) * jitter_coefficient())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coefficient_ramps_then_caps() {
        assert!((backoff_coefficient(1) - 1.0).abs() < f64::EPSILON);
        assert!((backoff_coefficient(2) - 4.0 / 3.0).abs() < f64::EPSILON);
        assert!((backoff_coefficient(3) - 5.0 / 3.0).abs() < f64::EPSILON);
        assert!((backoff_coefficient(4) - 2.0).abs() < f64::EPSILON);
        assert!((backoff_coefficient(40) - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn retry_time_stays_in_jitter_window() {
        let base = Duration::from_secs(15);
        for _ in 0..100 {
            let delay = retry_time(base, 1);
            assert!(delay <= base);
            assert!(delay > base.mul_f64(0.8) - Duration::from_millis(1));
        }
        for _ in 0..100 {
            let delay = retry_time(base, 10);
            assert!(delay <= base * 2);
            assert!(delay >= base.mul_f64(1.6) - Duration::from_millis(1));
        }
    }
}
