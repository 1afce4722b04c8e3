//! End-to-end convergence tests against a simulated clock pair.
//!
//! Unlike the unit tests, which drive individual modules through
//! `MockClockHandle`, these tests run the real `tick_phc_mode` control loop
//! against a small physics engine: a shared offset/drift state that the
//! simulated master and slave clocks both read from and the slave writes
//! frequency corrections into, the same style the teacher's own
//! `simulation_e2e.rs` used for its rate-based servo. `MockClockHandle` only
//! exists when the library itself is built with `cfg(test)`, so an external
//! integration test has to hand-roll its `ClockHandle` impls instead.

use clocksyncd::clock::ClockHandle;
use clocksyncd::error::{ClockError, TickOutcome};
use clocksyncd::leap::LeapCoordinator;
use clocksyncd::node::{tick_phc_mode, Clock};
use clocksyncd::servo::PiServo;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};

const NS_PER_SEC: i64 = 1_000_000_000;

/// Shared simulated time base: `time_ns` is the reference (master) clock,
/// `offset_ns` is the slave's deviation from it. `current_adj_ppb` is the
/// frequency correction the servo currently has applied.
struct PhysicsEngine {
    time_ns: i128,
    offset_ns: f64,
    natural_drift_ppb: f64,
    current_adj_ppb: f64,
}

impl PhysicsEngine {
    fn new(initial_offset_ns: f64, natural_drift_ppb: f64) -> Self {
        Self {
            time_ns: 0,
            offset_ns: initial_offset_ns,
            natural_drift_ppb,
            current_adj_ppb: 0.0,
        }
    }

    fn advance(&mut self, dt_ns: i64) {
        self.time_ns += dt_ns as i128;
        let rate_ppb = self.natural_drift_ppb + self.current_adj_ppb;
        self.offset_ns += rate_ppb * 1.0e-9 * dt_ns as f64;
    }
}

struct SimMasterClock {
    physics: Arc<Mutex<PhysicsEngine>>,
}

impl ClockHandle for SimMasterClock {
    fn label(&self) -> &str {
        "sim-master"
    }
    fn is_utc(&self) -> bool {
        false
    }
    fn read(&self) -> Result<i128, ClockError> {
        Ok(self.physics.lock().unwrap().time_ns)
    }
    fn step(&mut self, _delta_ns: i64) -> Result<(), ClockError> {
        Ok(())
    }
    fn set_freq(&mut self, _ppb: f64) -> Result<(), ClockError> {
        Ok(())
    }
    fn get_freq(&self) -> Result<f64, ClockError> {
        Ok(0.0)
    }
    fn max_adjust_ppb(&self) -> i64 {
        100_000_000
    }
    fn has_pps_output(&self) -> bool {
        true
    }
    fn set_synced(&mut self, _synced: bool) -> Result<(), ClockError> {
        Ok(())
    }
    fn set_pending_leap(&mut self, _leap: i8) -> Result<(), ClockError> {
        Ok(())
    }
}

struct SimSlaveClock {
    physics: Arc<Mutex<PhysicsEngine>>,
    jitter_sigma_ns: f64,
}

impl ClockHandle for SimSlaveClock {
    fn label(&self) -> &str {
        "sim-slave"
    }
    fn is_utc(&self) -> bool {
        true
    }
    fn read(&self) -> Result<i128, ClockError> {
        let p = self.physics.lock().unwrap();
        let noise = gaussian_noise(self.jitter_sigma_ns);
        Ok(p.time_ns + (p.offset_ns + noise) as i128)
    }
    fn step(&mut self, delta_ns: i64) -> Result<(), ClockError> {
        self.physics.lock().unwrap().offset_ns += delta_ns as f64;
        Ok(())
    }
    fn set_freq(&mut self, ppb: f64) -> Result<(), ClockError> {
        self.physics.lock().unwrap().current_adj_ppb = ppb;
        Ok(())
    }
    fn get_freq(&self) -> Result<f64, ClockError> {
        Ok(self.physics.lock().unwrap().current_adj_ppb)
    }
    fn max_adjust_ppb(&self) -> i64 {
        500_000_000
    }
    fn has_pps_output(&self) -> bool {
        false
    }
    fn set_synced(&mut self, _synced: bool) -> Result<(), ClockError> {
        Ok(())
    }
    fn set_pending_leap(&mut self, _leap: i8) -> Result<(), ClockError> {
        Ok(())
    }
}

/// Box-Muller noise generator, zero unless `sigma_ns` is positive.
fn gaussian_noise(sigma_ns: f64) -> f64 {
    if sigma_ns <= 0.0 {
        return 0.0;
    }
    let u1: f64 = rand::random::<f64>().max(f64::EPSILON);
    let u2: f64 = rand::random();
    let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
    z0 * sigma_ns
}

fn run_ticks(
    physics: &Arc<Mutex<PhysicsEngine>>,
    master: &SimMasterClock,
    clock: &mut Clock,
    leap: &mut LeapCoordinator,
    n_readings: usize,
    tick_interval_ns: i64,
    n_ticks: usize,
) {
    for _ in 0..n_ticks {
        physics.lock().unwrap().advance(tick_interval_ns);
        let outcome = tick_phc_mode(master, clock, leap, n_readings, tick_interval_ns, false);
        assert!(
            matches!(outcome, TickOutcome::Applied | TickOutcome::Reset),
            "unexpected tick outcome: {outcome:?}"
        );
    }
}

#[test]
fn converges_within_100ns_of_a_1000ns_step_in_ten_ticks() {
    let physics = Arc::new(Mutex::new(PhysicsEngine::new(1000.0, 0.0)));
    let master = SimMasterClock {
        physics: physics.clone(),
    };
    let slave = SimSlaveClock {
        physics: physics.clone(),
        jitter_sigma_ns: 0.0,
    };
    let mut clock = Clock::new(Box::new(slave), Box::new(PiServo::new(0.7, 0.3, 0, 0)), 200_000_000, 0);
    let mut leap = LeapCoordinator::new(Some(0));

    run_ticks(&physics, &master, &mut clock, &mut leap, 1, NS_PER_SEC, 10);

    let final_offset = physics.lock().unwrap().offset_ns;
    assert!(
        final_offset.abs() < 100.0,
        "offset did not converge within 100ns: {final_offset}"
    );
}

#[test]
fn holds_lock_against_steady_frequency_drift() {
    // 50ppm of uncorrected drift, roughly what a free-running crystal
    // oscillator might show without discipline.
    let physics = Arc::new(Mutex::new(PhysicsEngine::new(0.0, 50_000.0)));
    let master = SimMasterClock {
        physics: physics.clone(),
    };
    let slave = SimSlaveClock {
        physics: physics.clone(),
        jitter_sigma_ns: 0.0,
    };
    let mut clock = Clock::new(Box::new(slave), Box::new(PiServo::new(0.7, 0.3, 0, 0)), 200_000_000, 0);
    let mut leap = LeapCoordinator::new(Some(0));

    run_ticks(&physics, &master, &mut clock, &mut leap, 1, NS_PER_SEC, 30);

    let final_offset = physics.lock().unwrap().offset_ns;
    assert!(
        final_offset.abs() < 2000.0,
        "servo failed to hold lock against steady drift: final offset {final_offset}ns"
    );
}

#[test]
fn tolerates_measurement_jitter_without_diverging() {
    let physics = Arc::new(Mutex::new(PhysicsEngine::new(2000.0, 0.0)));
    let master = SimMasterClock {
        physics: physics.clone(),
    };
    let slave = SimSlaveClock {
        physics: physics.clone(),
        jitter_sigma_ns: 50.0,
    };
    let mut clock = Clock::new(Box::new(slave), Box::new(PiServo::new(0.5, 0.2, 0, 0)), 200_000_000, 0);
    let mut leap = LeapCoordinator::new(Some(0));

    run_ticks(&physics, &master, &mut clock, &mut leap, 5, NS_PER_SEC, 25);

    let final_offset = physics.lock().unwrap().offset_ns;
    assert!(
        final_offset.abs() < 500.0,
        "servo diverged under jitter: final offset {final_offset}ns"
    );
}
