//! Size-targeting retry state
//!
//! The first attempt encodes at constant quality. When it overflows the
//! limit the encode switches to a bitrate derived from the limit and the
//! duration; every further overflow shaves the bitrate by the measured
//! overshoot.

use super::command::RateControl;

/// Smallest reduction applied on a repeated overflow, in percent
pub const MIN_REDUCTION_PERCENT: f64 = 0.02;

/// Error raised when no smaller bitrate is left to try
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BitrateExhausted {
    pub tries: u32,
}

/// Per-encode retry state
#[derive(Debug, Clone, PartialEq)]
pub struct RetryState {
    tries: u32,
    /// 0 while encoding in quality mode
    bitrate: u64,
    failed: bool,
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            tries: 1,
            bitrate: 0,
            failed: false,
        }
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    pub fn bitrate(&self) -> u64 {
        self.bitrate
    }

    /// Whether the current attempt has overflowed
    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn rate_control(&self) -> RateControl {
        if self.bitrate == 0 {
            RateControl::Quality
        } else {
            RateControl::Bitrate(self.bitrate)
        }
    }

    /// Mark the current attempt as overflowed
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// Move to the next attempt after an overflow
    ///
    /// `overflow_percent` is how far over the limit the attempt went. The
    /// returned bitrate is strictly below the previous one once in bitrate
    /// mode; when it would reach zero the limit cannot be met.
    pub fn next_attempt(
        &mut self,
        limit_bytes: u64,
        duration_secs: f64,
        overflow_percent: f64,
    ) -> Result<u64, BitrateExhausted> {
        let next = if self.bitrate == 0 {
            initial_bitrate(limit_bytes, duration_secs)
        } else {
            reduce_bitrate(self.bitrate, overflow_percent)
        };

        if next == 0 {
            return Err(BitrateExhausted { tries: self.tries });
        }

        self.bitrate = next;
        self.tries += 1;
        self.failed = false;
        Ok(next)
    }
}

/// Average bitrate (bits/second) that fits `limit_bytes` into `duration_secs`
pub fn initial_bitrate(limit_bytes: u64, duration_secs: f64) -> u64 {
    if !(duration_secs.is_finite() && duration_secs > 0.0) {
        return 0;
    }
    (limit_bytes as f64 / duration_secs * 8.0).floor() as u64
}

/// Lower `bitrate` by `max(overflow_percent, MIN_REDUCTION_PERCENT)` percent,
/// always by at least one bit/second
pub fn reduce_bitrate(bitrate: u64, overflow_percent: f64) -> u64 {
    let percent = if overflow_percent.is_finite() {
        overflow_percent.max(MIN_REDUCTION_PERCENT)
    } else {
        MIN_REDUCTION_PERCENT
    };

    let reduced = (bitrate as f64 * (1.0 - percent / 100.0)).floor();
    let reduced = if reduced > 0.0 { reduced as u64 } else { 0 };
    reduced.min(bitrate.saturating_sub(1))
}

/// How far `size` is over `limit`, in percent of the limit
pub fn overflow_percent(size: u64, limit: u64) -> f64 {
    if limit == 0 || size <= limit {
        return 0.0;
    }
    (size - limit) as f64 / limit as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_starts_in_quality_mode() {
        let state = RetryState::new();
        assert_eq!(state.tries(), 1);
        assert_eq!(state.bitrate(), 0);
        assert!(!state.failed());
        assert_eq!(state.rate_control(), RateControl::Quality);
    }

    #[test]
    fn test_first_overflow_switches_to_bitrate_mode() {
        let mut state = RetryState::new();
        state.mark_failed();

        let bitrate = state.next_attempt(4 * MIB, 60.0, 25.0).unwrap();

        // floor(4 MiB / 60 s * 8)
        assert_eq!(bitrate, 559_240);
        assert_eq!(state.tries(), 2);
        assert!(!state.failed());
        assert_eq!(state.rate_control(), RateControl::Bitrate(559_240));
    }

    #[test]
    fn test_later_overflows_reduce_by_overshoot() {
        let mut state = RetryState::new();
        state.next_attempt(4 * MIB, 60.0, 25.0).unwrap();

        let bitrate = state.next_attempt(4 * MIB, 60.0, 10.0).unwrap();
        assert_eq!(bitrate, (559_240.0f64 * 0.9).floor() as u64);
        assert_eq!(state.tries(), 3);
    }

    #[test]
    fn test_near_zero_overshoot_uses_floor() {
        assert_eq!(reduce_bitrate(1_000_000, 0.0), 999_800);
        assert_eq!(reduce_bitrate(1_000_000, 0.001), 999_800);
        assert_eq!(reduce_bitrate(1_000_000, f64::NAN), 999_800);
        // tiny bitrates still move
        assert_eq!(reduce_bitrate(10, 0.0), 9);
        assert_eq!(reduce_bitrate(1, 0.0), 0);
    }

    #[test]
    fn test_exhausted_bitrate_is_an_error() {
        let mut state = RetryState::new();
        assert_eq!(
            state.next_attempt(4 * MIB, 0.0, 10.0),
            Err(BitrateExhausted { tries: 1 })
        );

        let mut state = RetryState::new();
        state.next_attempt(1, 8.0, 0.0).unwrap();
        assert_eq!(state.bitrate(), 1);
        assert_eq!(
            state.next_attempt(1, 8.0, 0.0),
            Err(BitrateExhausted { tries: 2 })
        );
    }

    #[test]
    fn test_overflow_percent() {
        assert_eq!(overflow_percent(5 * MIB, 4 * MIB), 25.0);
        assert_eq!(overflow_percent(4 * MIB, 4 * MIB), 0.0);
        assert_eq!(overflow_percent(10, 0), 0.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_bitrate_strictly_decreases(
            limit_mib in 1u64..64,
            duration in 1.0f64..7200.0,
            overshoots in prop::collection::vec(0.0f64..80.0, 1..20),
        ) {
            let mut state = RetryState::new();
            let mut previous = state.next_attempt(limit_mib * MIB, duration, 0.0).unwrap();

            for overshoot in overshoots {
                match state.next_attempt(limit_mib * MIB, duration, overshoot) {
                    Ok(bitrate) => {
                        prop_assert!(bitrate < previous);
                        previous = bitrate;
                    }
                    Err(_) => {
                        prop_assert!(previous <= 1 || overshoot >= 99.0);
                        break;
                    }
                }
            }
        }
    }
}
