//! Statistics Reporter: a bounded window of offset/freq/delay samples that
//! emits one summary line per fill, or — when disabled (window size 0) — a
//! raw per-sample trace line, matching the two stable log formats in the
//! external interface contract.

use crate::servo::ServoState;

pub struct StatsReporter {
    window: usize,
    offsets: Vec<i64>,
    freqs: Vec<f64>,
    delays: Vec<i64>,
}

fn state_char(state: ServoState) -> char {
    match state {
        ServoState::Unlocked => 'x',
        ServoState::Jump => 'f',
        ServoState::Locked => 's',
    }
}

impl StatsReporter {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            offsets: Vec::with_capacity(window),
            freqs: Vec::with_capacity(window),
            delays: Vec::with_capacity(window),
        }
    }

    /// Records one sample. `delay_ns` is `None` in PPS mode, where there is
    /// no round-trip delay to report. `label` is the slave clock's log
    /// label. Returns `true` if a summary was emitted (window just filled).
    pub fn record(
        &mut self,
        label: &str,
        offset_ns: i64,
        freq_ppb: f64,
        state: ServoState,
        delay_ns: Option<i64>,
    ) -> bool {
        if self.window == 0 {
            log_raw(label, offset_ns, state, freq_ppb, delay_ns);
            return false;
        }

        self.offsets.push(offset_ns);
        self.freqs.push(freq_ppb);
        if let Some(d) = delay_ns {
            self.delays.push(d);
        }

        if self.offsets.len() >= self.window {
            self.emit_summary(label);
            self.offsets.clear();
            self.freqs.clear();
            self.delays.clear();
            true
        } else {
            false
        }
    }

    fn emit_summary(&self, label: &str) {
        let rms = rms(&self.offsets);
        let max_abs = self.offsets.iter().map(|o| o.unsigned_abs()).max().unwrap_or(0) as f64;
        let (freq_mean, freq_std) = mean_std(&self.freqs);

        if self.delays.is_empty() {
            log::info!(
                "{label} rms {rms:4.0} max {max_abs:4.0} freq {freq_mean:+6.0} +/- {freq_std:3.0}"
            );
        } else {
            let delays: Vec<f64> = self.delays.iter().map(|d| *d as f64).collect();
            let (delay_mean, delay_std) = mean_std(&delays);
            log::info!(
                "{label} rms {rms:4.0} max {max_abs:4.0} freq {freq_mean:+6.0} +/- {freq_std:3.0} delay {delay_mean:5.0} +/- {delay_std:3.0}"
            );
        }
    }
}

fn log_raw(label: &str, offset_ns: i64, state: ServoState, freq_ppb: f64, delay_ns: Option<i64>) {
    match delay_ns {
        Some(d) => log::info!(
            "{label} offset {offset_ns:9} s{} freq {freq_ppb:+7.0} delay {d:6}",
            state_char(state)
        ),
        None => log::info!(
            "{label} offset {offset_ns:9} s{} freq {freq_ppb:+7.0}",
            state_char(state)
        ),
    }
}

fn rms(values: &[i64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = values.iter().map(|v| (*v as f64) * (*v as f64)).sum();
    (sum_sq / values.len() as f64).sqrt()
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_emitted_exactly_once_per_window_fill() {
        let mut stats = StatsReporter::new(3);
        assert!(!stats.record("phc0", 10, 1.0, ServoState::Locked, None));
        assert!(!stats.record("phc0", -10, -1.0, ServoState::Locked, None));
        assert!(stats.record("phc0", 0, 0.0, ServoState::Locked, None));
        assert!(stats.offsets.is_empty());
    }

    #[test]
    fn disabled_window_never_summarizes() {
        let mut stats = StatsReporter::new(0);
        for _ in 0..10 {
            assert!(!stats.record("phc0", 5, 1.0, ServoState::Locked, Some(100)));
        }
    }

    #[test]
    fn rms_of_symmetric_values_matches_expected() {
        assert_eq!(rms(&[3, -4]), 3.5355339059327378);
    }

    #[test]
    fn mean_std_of_constant_series_has_zero_stddev() {
        let (mean, std) = mean_std(&[5.0, 5.0, 5.0]);
        assert_eq!(mean, 5.0);
        assert_eq!(std, 0.0);
    }
}
