//! Randomized inter-request delay.

use std::time::Duration;

use changewatch_shared::TimingProfile;
use rand::Rng;

/// Draw a delay uniformly from `[min_delay_ms, max_delay_ms]`.
pub fn jitter_delay(profile: &TimingProfile) -> Duration {
    let (lo, hi) = if profile.min_delay_ms <= profile.max_delay_ms {
        (profile.min_delay_ms, profile.max_delay_ms)
    } else {
        (profile.max_delay_ms, profile.min_delay_ms)
    };
    let ms = rand::thread_rng().gen_range(lo..=hi);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_within_profile() {
        let profile = TimingProfile {
            min_delay_ms: 100,
            max_delay_ms: 300,
            request_timeout_secs: 5,
        };
        for _ in 0..100 {
            let d = jitter_delay(&profile);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(300));
        }
    }

    #[test]
    fn zero_profile_means_no_delay() {
        let profile = TimingProfile {
            min_delay_ms: 0,
            max_delay_ms: 0,
            request_timeout_secs: 5,
        };
        assert_eq!(jitter_delay(&profile), Duration::ZERO);
    }
}
