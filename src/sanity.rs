//! Clock Sanity Check: a monotonicity and frequency-bounds guard that can
//! force a servo reset when a clock appears to have been stepped by
//! something other than us.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanityVerdict {
    Ok,
    /// The clock jumped or drifted further than `freq_limit_ppb` allows;
    /// caller should reset the servo.
    Violation,
}

pub struct SanityCheck {
    freq_limit_ppb: i64,
    last_ts_ns: Option<i128>,
    /// Set by `notify_step` so the next `check` call doesn't misread our own
    /// deliberate step as an external violation.
    expected_step_ns: Option<i64>,
}

impl SanityCheck {
    pub fn new(freq_limit_ppb: i64) -> Self {
        Self {
            freq_limit_ppb,
            last_ts_ns: None,
            expected_step_ns: None,
        }
    }

    /// Tell the sanity check that the caller is about to (or just did) apply
    /// a deliberate step of this size, so it isn't double-counted as a
    /// violation on the next `check`.
    pub fn notify_step(&mut self, step_ns: i64) {
        self.expected_step_ns = Some(step_ns);
    }

    /// `ts_ns` is the latest reading on the clock under guard; `elapsed_ns`
    /// is the wall-clock time elapsed since the previous call (used to
    /// compute an implied ppb). Returns whether the reading is sane.
    pub fn check(&mut self, ts_ns: i128, elapsed_ns: i64) -> SanityVerdict {
        let verdict = match self.last_ts_ns {
            None => SanityVerdict::Ok,
            Some(prev) if elapsed_ns <= 0 => {
                // No time elapsed on the reference clock; can't evaluate rate.
                let _ = prev;
                SanityVerdict::Ok
            }
            Some(prev) => {
                let mut delta_ns = (ts_ns - prev) as i64;
                if let Some(step) = self.expected_step_ns.take() {
                    delta_ns -= step;
                }
                let implied_ppb = (delta_ns as f64 / elapsed_ns as f64) * 1.0e9;
                if implied_ppb.abs() > self.freq_limit_ppb as f64 {
                    SanityVerdict::Violation
                } else {
                    SanityVerdict::Ok
                }
            }
        };
        self.expected_step_ns = None;
        self.last_ts_ns = Some(ts_ns);
        verdict
    }

    pub fn reset(&mut self) {
        self.last_ts_ns = None;
        self.expected_step_ns = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reading_is_always_ok() {
        let mut sanity = SanityCheck::new(200_000_000);
        assert_eq!(sanity.check(0, 1_000_000_000), SanityVerdict::Ok);
    }

    #[test]
    fn steady_drift_within_limit_passes() {
        let mut sanity = SanityCheck::new(200_000_000);
        sanity.check(0, 1_000_000_000);
        // 100ppb drift over 1s = 100ns.
        assert_eq!(sanity.check(100, 1_000_000_000), SanityVerdict::Ok);
    }

    #[test]
    fn large_unexplained_jump_is_flagged() {
        let mut sanity = SanityCheck::new(200_000_000);
        sanity.check(0, 1_000_000_000);
        // Implied rate far exceeds 200_000_000 ppb (20%).
        assert_eq!(
            sanity.check(500_000_000, 1_000_000_000),
            SanityVerdict::Violation
        );
    }

    #[test]
    fn notified_step_is_not_counted_as_a_violation() {
        let mut sanity = SanityCheck::new(200_000_000);
        sanity.check(0, 1_000_000_000);
        sanity.notify_step(500_000_000);
        assert_eq!(
            sanity.check(500_000_000, 1_000_000_000),
            SanityVerdict::Ok
        );
    }
}
