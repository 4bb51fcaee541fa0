use rand::Rng;
use std::time::Duration;

/// Generates a random pre-election delay, uniform in `[0, max_ms)`.
pub fn random_election_jitter(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let mut rng = rand::thread_rng();
    let jitter_ms = rng.gen_range(0..max_ms);
    Duration::from_millis(jitter_ms)
}

/// Generates a random delay within `[min_ms, max_ms]`.
pub fn random_delay(min_ms: u64, max_ms: u64) -> Duration {
    if max_ms <= min_ms {
        return Duration::from_millis(min_ms);
    }
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(min_ms..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_below_bound() {
        for _ in 0..200 {
            assert!(random_election_jitter(50) < Duration::from_millis(50));
        }
    }

    #[test]
    fn zero_jitter_bound() {
        assert_eq!(random_election_jitter(0), Duration::ZERO);
    }

    #[test]
    fn delay_within_range() {
        for _ in 0..200 {
            let d = random_delay(10, 20);
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
        assert_eq!(random_delay(7, 7), Duration::from_millis(7));
    }
}
