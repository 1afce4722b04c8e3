//! Node/Clock data model and the per-tick orchestration that the PHC-mode
//! and PPS-mode main loops share: estimate -> leap gate -> sync_offset ->
//! servo -> apply -> stats -> sanity.

use crate::clock::ClockHandle;
use crate::error::TickOutcome;
use crate::estimator::{estimate_phc_offset, Estimate};
use crate::leap::{leap_gate, GateDecision, LeapCoordinator};
use crate::sanity::{SanityCheck, SanityVerdict};
use crate::servo::{Servo, ServoState};
use crate::stats::StatsReporter;

const NS_PER_SEC: i64 = 1_000_000_000;

/// One disciplined (non-master) clock and everything needed to drive it.
pub struct Clock {
    pub handle: Box<dyn ClockHandle>,
    pub servo: Box<dyn Servo>,
    pub sanity: SanityCheck,
    pub stats: StatsReporter,
    pub label: String,
}

impl Clock {
    pub fn new(handle: Box<dyn ClockHandle>, servo: Box<dyn Servo>, freq_limit_ppb: i64, stats_window: usize) -> Self {
        let label = handle.label().to_string();
        Self {
            handle,
            servo,
            sanity: SanityCheck::new(freq_limit_ppb),
            stats: StatsReporter::new(stats_window),
            label,
        }
    }
}

/// Process-wide control context: the master clock plus every slave being
/// disciplined against it, the shared leap-second state, and the per-tick
/// cadence. Constructed once at startup and passed by reference/ownership —
/// never a global, per the design notes.
pub struct Node {
    pub master: Box<dyn ClockHandle>,
    pub slaves: Vec<Clock>,
    pub n_readings: usize,
    pub tick_interval_ns: i64,
    pub leap: LeapCoordinator,
    pub kernel_leap: bool,
}

/// Runs one control tick for a single slave clock against `master`.
/// Shared by PHC-mode (called once per slave per tick) and PPS-mode (called
/// for the single wall-clock slave using an already-computed estimate).
pub fn apply_estimate(
    master: &dyn ClockHandle,
    slave: &mut Clock,
    leap: &mut LeapCoordinator,
    estimate: Estimate,
    tick_interval_ns: i64,
    servo_leap: bool,
) -> TickOutcome {
    let leap_due = leap.evaluate(estimate.ts_ns);
    let decision = leap_gate(
        master.is_utc(),
        slave.handle.is_utc(),
        estimate.ts_ns,
        leap.leap,
        leap_due,
        !servo_leap,
    );
    match decision {
        GateDecision::Suspend => {
            log::debug!("{}: suspended for ambiguous leap second", slave.label);
            return TickOutcome::Skip;
        }
        GateDecision::ApplyKernelLeap(l) => {
            if let Err(e) = slave.handle.set_pending_leap(l) {
                log::warn!("{}: failed to set pending leap: {e}", slave.label);
            }
        }
        GateDecision::PassThrough => {}
    }

    let direction = slave.handle.is_utc() as i64 - master.is_utc() as i64;
    let adjusted_offset = estimate.offset_ns + leap.sync_offset as i64 * direction * NS_PER_SEC;

    let (ppb, state) = slave.servo.sample(adjusted_offset, estimate.ts_ns);

    let result = match state {
        ServoState::Unlocked => Ok(()),
        ServoState::Jump => {
            let step = -adjusted_offset;
            slave
                .handle
                .step(step)
                .and_then(|_| {
                    slave.sanity.notify_step(step);
                    slave.servo.notify_step(step);
                    slave.handle.set_freq(ppb)
                })
        }
        ServoState::Locked => slave.handle.set_freq(ppb).map(|_| {
            if slave.handle.is_utc() {
                let _ = slave.handle.set_synced(true);
            }
        }),
    };

    if let Err(e) = result {
        log::warn!("{}: failed to apply servo correction: {e}", slave.label);
        return TickOutcome::Fatal(anyhow::anyhow!("{}: {e}", slave.label));
    }

    slave
        .stats
        .record(&slave.label, adjusted_offset, ppb, state, Some(estimate.delay_ns));

    match slave.sanity.check(estimate.ts_ns, tick_interval_ns) {
        SanityVerdict::Violation => {
            log::warn!("{}: sanity check violation, resetting servo", slave.label);
            slave.servo.reset();
            TickOutcome::Reset
        }
        SanityVerdict::Ok => TickOutcome::Applied,
    }
}

/// One PHC-mode tick: estimate offset for `slave` against `master` (prefer
/// the single-ioctl sysoff path when available), then hand off to
/// [`apply_estimate`].
pub fn tick_phc_mode(
    master: &dyn ClockHandle,
    slave: &mut Clock,
    leap: &mut LeapCoordinator,
    n_readings: usize,
    tick_interval_ns: i64,
    servo_leap: bool,
) -> TickOutcome {
    let estimate = if slave.handle.is_utc() {
        match master.sys_offset(n_readings) {
            Some(Ok((offset_ns, ts_ns, delay_ns))) => Estimate {
                offset_ns,
                ts_ns,
                delay_ns,
            },
            Some(Err(e)) => {
                log::warn!("{}: sysoff read failed: {e}", slave.label);
                return TickOutcome::Skip;
            }
            None => match estimate_phc_offset(master, slave.handle.as_ref(), n_readings) {
                Ok(e) => e,
                Err(e) => {
                    log::warn!("{}: offset estimate failed: {e}", slave.label);
                    return TickOutcome::Skip;
                }
            },
        }
    } else {
        match estimate_phc_offset(master, slave.handle.as_ref(), n_readings) {
            Ok(e) => e,
            Err(e) => {
                log::warn!("{}: offset estimate failed: {e}", slave.label);
                return TickOutcome::Skip;
            }
        }
    };

    apply_estimate(master, slave, leap, estimate, tick_interval_ns, servo_leap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClockHandle;
    use crate::servo::PiServo;

    fn utc_clock(label: &str) -> MockClockHandle {
        let mut m = MockClockHandle::new();
        m.expect_label().return_const(label.to_string());
        m.expect_is_utc().return_const(true);
        m.expect_sys_offset().returning(|_| None);
        m
    }

    fn tai_clock(label: &str) -> MockClockHandle {
        let mut m = MockClockHandle::new();
        m.expect_label().return_const(label.to_string());
        m.expect_is_utc().return_const(false);
        m.expect_sys_offset().returning(|_| None);
        m
    }

    #[test]
    fn converges_toward_zero_offset_over_several_ticks() {
        let mut master = tai_clock("phc0");
        master.expect_read().returning(|| Ok(1_000_000_000_000));

        let mut slave_handle = utc_clock("wall");
        // Slave starts 1000ns ahead; each call returns the same static
        // reading since the servo/estimator math is what's under test here,
        // not a live clock.
        slave_handle
            .expect_read()
            .returning(|| Ok(1_000_000_001_000));

        let mut leap = LeapCoordinator::new(Some(0));
        let mut clock = Clock::new(
            Box::new(slave_handle),
            Box::new(PiServo::new(0.7, 0.3, 0, 0)),
            200_000_000,
            0,
        );

        let outcome = tick_phc_mode(&master, &mut clock, &mut leap, 1, 1_000_000_000, false);
        assert!(matches!(outcome, TickOutcome::Applied | TickOutcome::Reset));
    }
}
