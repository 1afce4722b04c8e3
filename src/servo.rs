//! Servo Adapter: turns an offset sample into a frequency correction plus a
//! lock-state transition. Two implementations, PI and linear-regression,
//! selected by `-E`.
//!
//! The PI gain/clamp/integral shape is carried over from the teacher's
//! `PiServo` (kp/ki, clamped integral, clamped output), generalized here to
//! report [`ServoState`] transitions and step thresholds instead of a bare
//! ppm correction.

use std::collections::VecDeque;

/// Lock state a servo reports alongside its frequency correction.
///
/// Interpretation by the main loop:
/// - `Unlocked`: do not apply a frequency correction this tick.
/// - `Jump`: step the clock by `-offset` now, then apply the returned ppb,
///   then the servo is considered locked from the next sample on.
/// - `Locked`: apply the returned ppb only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServoState {
    Unlocked,
    Jump,
    Locked,
}

pub trait Servo: Send {
    /// Feed one (offset_ns, ts_ns) sample, get back a frequency correction
    /// in ppb and the resulting lock state.
    fn sample(&mut self, offset_ns: i64, ts_ns: i128) -> (f64, ServoState);

    /// Discard accumulated state (integral, history) and return to
    /// `Unlocked`, e.g. after a sanity-check violation.
    fn reset(&mut self);

    /// Informs the servo that the caller already applied a deliberate step
    /// of this magnitude, so the servo's next sample shouldn't be
    /// interpreted as a fresh offset relative to the pre-step clock.
    fn notify_step(&mut self, _step_ns: i64) {}
}

const MAX_FREQ_PPB: f64 = 2_000_000_000.0;
const REQUIRED_UNLOCKED_SAMPLES: u32 = 2;

pub struct PiServo {
    kp: f64,
    ki: f64,
    integral: f64,
    max_integral: f64,
    /// Step threshold applied on every sample once past the first one.
    step_threshold_ns: i64,
    /// Step threshold applied only to the very first sample.
    first_step_threshold_ns: i64,
    state: ServoState,
    samples_seen: u32,
}

impl PiServo {
    pub fn new(kp: f64, ki: f64, step_threshold_ns: i64, first_step_threshold_ns: i64) -> Self {
        PiServo {
            kp,
            ki,
            integral: 0.0,
            max_integral: 200.0,
            step_threshold_ns,
            first_step_threshold_ns,
            state: ServoState::Unlocked,
            samples_seen: 0,
        }
    }
}

impl Servo for PiServo {
    fn sample(&mut self, offset_ns: i64, _ts_ns: i128) -> (f64, ServoState) {
        let threshold = if self.samples_seen == 0 {
            self.first_step_threshold_ns
        } else {
            self.step_threshold_ns
        };

        if threshold > 0 && offset_ns.unsigned_abs() as i64 > threshold {
            self.integral = 0.0;
            self.samples_seen += 1;
            self.state = ServoState::Jump;
            return (0.0, ServoState::Jump);
        }

        let error = -offset_ns as f64;
        self.integral = (self.integral + error * self.ki).clamp(-self.max_integral, self.max_integral);
        let proportional = error * self.kp;
        let adjustment = (proportional + self.integral).clamp(-MAX_FREQ_PPB, MAX_FREQ_PPB);

        self.samples_seen += 1;
        self.state = match self.state {
            ServoState::Jump | ServoState::Locked => ServoState::Locked,
            ServoState::Unlocked if self.samples_seen >= REQUIRED_UNLOCKED_SAMPLES => ServoState::Locked,
            ServoState::Unlocked => ServoState::Unlocked,
        };

        log::debug!(
            "pi servo: offset={offset_ns} error={error:.1} integral={:.1} adj={adjustment:.1} state={:?}",
            self.integral,
            self.state
        );

        (adjustment, self.state)
    }

    fn reset(&mut self) {
        self.integral = 0.0;
        self.samples_seen = 0;
        self.state = ServoState::Unlocked;
    }

    fn notify_step(&mut self, _step_ns: i64) {
        self.integral = 0.0;
    }
}

/// Fits a line to a short rolling window of (ts, offset) samples and reports
/// the fitted slope as a frequency correction. Falls back to `Unlocked`
/// until the window has enough points for a stable fit.
pub struct LinregServo {
    window: VecDeque<(f64, f64)>,
    window_size: usize,
    step_threshold_ns: i64,
    state: ServoState,
}

impl LinregServo {
    pub fn new(window_size: usize, step_threshold_ns: i64) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(2),
            step_threshold_ns,
            state: ServoState::Unlocked,
        }
    }

    fn fit_slope_ppb(&self) -> Option<f64> {
        let n = self.window.len() as f64;
        if n < 2.0 {
            return None;
        }
        let (sum_t, sum_o, sum_tt, sum_to) = self.window.iter().fold(
            (0.0, 0.0, 0.0, 0.0),
            |(st, so, stt, sto), &(t, o)| (st + t, so + o, stt + t * t, sto + t * o),
        );
        let denom = n * sum_tt - sum_t * sum_t;
        if denom.abs() < f64::EPSILON {
            return None;
        }
        let slope = (n * sum_to - sum_t * sum_o) / denom;
        // slope is ns/ns == dimensionless drift; convert to ppb.
        Some(slope * 1.0e9)
    }
}

impl Servo for LinregServo {
    fn sample(&mut self, offset_ns: i64, ts_ns: i128) -> (f64, ServoState) {
        if self.step_threshold_ns > 0 && offset_ns.unsigned_abs() as i64 > self.step_threshold_ns {
            self.window.clear();
            self.state = ServoState::Jump;
            return (0.0, ServoState::Jump);
        }

        let t = ts_ns as f64 / 1.0e9;
        let o = offset_ns as f64;
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back((t, o));

        match self.fit_slope_ppb() {
            Some(ppb) => {
                self.state = ServoState::Locked;
                (-ppb, ServoState::Locked)
            }
            None => {
                self.state = ServoState::Unlocked;
                (0.0, ServoState::Unlocked)
            }
        }
    }

    fn reset(&mut self) {
        self.window.clear();
        self.state = ServoState::Unlocked;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pi_servo_proportional_response() {
        let mut servo = PiServo::new(0.7, 0.0, 0, 0);
        let (adj, state) = servo.sample(1000, 0);
        assert_eq!(adj, -700.0);
        assert_eq!(state, ServoState::Unlocked);
    }

    #[test]
    fn pi_servo_locks_after_required_samples() {
        let mut servo = PiServo::new(0.7, 0.3, 0, 0);
        servo.sample(100, 0);
        let (_, state) = servo.sample(100, 1);
        assert_eq!(state, ServoState::Locked);
    }

    #[test]
    fn pi_servo_first_sample_jump_threshold() {
        let mut servo = PiServo::new(0.7, 0.3, 1_000_000, 500_000_000);
        // within first-sample threshold, but would exceed continuous one
        let (_, state) = servo.sample(10_000_000, 0);
        assert_eq!(state, ServoState::Jump);
    }

    #[test]
    fn pi_servo_integral_clamped() {
        let mut servo = PiServo::new(0.0, 1.0, 0, 0);
        for _ in 0..1000 {
            servo.sample(1000, 0);
        }
        assert!(servo.integral.abs() <= servo.max_integral);
    }

    #[test]
    fn pi_servo_reset_clears_state() {
        let mut servo = PiServo::new(0.7, 0.3, 0, 0);
        servo.sample(1000, 0);
        servo.reset();
        assert_eq!(servo.state, ServoState::Unlocked);
        assert_eq!(servo.integral, 0.0);
    }

    #[test]
    fn linreg_servo_needs_two_samples_before_locking() {
        let mut servo = LinregServo::new(5, 0);
        let (_, state) = servo.sample(1000, 0);
        assert_eq!(state, ServoState::Unlocked);
        let (_, state) = servo.sample(900, 1_000_000_000);
        assert_eq!(state, ServoState::Locked);
    }

    #[test]
    fn linreg_servo_reports_jump_above_threshold() {
        let mut servo = LinregServo::new(5, 1000);
        let (_, state) = servo.sample(5000, 0);
        assert_eq!(state, ServoState::Jump);
    }
}
