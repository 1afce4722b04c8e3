//! Leap-second accounting: periodic refresh of the UTC-TAI offset and the
//! pending leap indicator from the management channel, a pure function
//! deciding whether a leap has now taken effect, and a per-clock gate that
//! suspends updates during the ambiguous second and picks kernel-vs-servo
//! leap application.

const NS_PER_SEC: i64 = 1_000_000_000;
const SEC_PER_DAY: i64 = 86_400;

/// Minimum time between management-channel refreshes of sync_offset/leap.
pub const REFRESH_INTERVAL_NS: i64 = 60 * NS_PER_SEC as i64;

fn day_index(ts_now_ns: i128) -> i64 {
    (ts_now_ns / (SEC_PER_DAY as i128 * NS_PER_SEC as i128)) as i64
}

fn secs_of_day(ts_now_ns: i128) -> i64 {
    ((ts_now_ns / NS_PER_SEC as i128).rem_euclid(SEC_PER_DAY as i128)) as i64
}

/// True during the single UTC second before midnight, where a scheduled
/// leap second is ambiguous (23:59:59 may be followed by a repeated/extra
/// second rather than 00:00:00).
pub fn is_ambiguous_second(ts_now_ns: i128) -> bool {
    secs_of_day(ts_now_ns) == SEC_PER_DAY - 1
}

/// Outcome of evaluating whether a previously-announced leap has now
/// crossed midnight and taken effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeapStatus {
    /// The leap value still pending relative to `ts_now_ns` (0 if none, or
    /// if it has already applied).
    pub clock_leap: i8,
    /// Whether a previously pending leap applied this call (midnight
    /// crossed since the last evaluation).
    pub applied: bool,
}

/// Pure function deciding whether `leap_set` (the leap announced by the
/// management channel) has crossed midnight since `prev_day_index` and so
/// should now be folded into `sync_offset`.
///
/// Takes and returns explicit state rather than mutating through `&mut`
/// parameters, so it is trivially testable without constructing a
/// [`LeapCoordinator`].
pub fn leap_second_status(ts_now_ns: i128, leap_set: i8, prev_day_index: i64) -> (LeapStatus, i64) {
    let today = day_index(ts_now_ns);
    if leap_set != 0 && today > prev_day_index {
        (
            LeapStatus {
                clock_leap: 0,
                applied: true,
            },
            today,
        )
    } else {
        (
            LeapStatus {
                clock_leap: leap_set,
                applied: false,
            },
            today,
        )
    }
}

/// What the main loop should do with a slave clock's update this tick, as
/// decided by the per-clock leap gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    PassThrough,
    Suspend,
    ApplyKernelLeap(i8),
}

/// Per-clock leap gate (§4.8). Evaluated before every slave update.
#[allow(clippy::too_many_arguments)]
pub fn leap_gate(
    master_is_utc: bool,
    slave_is_utc: bool,
    eval_ts_ns: i128,
    leap_pending: i8,
    leap_due_this_tick: bool,
    kernel_applies_leap: bool,
) -> GateDecision {
    if leap_pending == 0 && !leap_due_this_tick {
        return GateDecision::PassThrough;
    }
    if master_is_utc == slave_is_utc {
        // Leap is invisible to a same-timescale pair.
        return GateDecision::PassThrough;
    }
    if is_ambiguous_second(eval_ts_ns) {
        return GateDecision::Suspend;
    }
    if leap_due_this_tick && slave_is_utc && kernel_applies_leap {
        return GateDecision::ApplyKernelLeap(leap_pending);
    }
    GateDecision::PassThrough
}

/// Owns the refresh cadence and accumulated leap/sync_offset state; the
/// management-channel polling itself lives in [`crate::management`].
pub struct LeapCoordinator {
    pub sync_offset: i32,
    pub leap: i8,
    last_refresh_ns: Option<i128>,
    prev_day_index: i64,
    forced: bool,
}

impl LeapCoordinator {
    pub fn new(forced_offset: Option<i32>) -> Self {
        Self {
            sync_offset: forced_offset.unwrap_or(0),
            leap: 0,
            last_refresh_ns: None,
            prev_day_index: 0,
            forced: forced_offset.is_some(),
        }
    }

    /// Whether it is time to issue another management-channel request.
    pub fn needs_refresh(&self, ts_now_ns: i128) -> bool {
        if self.forced {
            return false;
        }
        match self.last_refresh_ns {
            None => true,
            Some(last) => (ts_now_ns - last) as i64 >= REFRESH_INTERVAL_NS,
        }
    }

    /// Applies a fresh `(currentUtcOffset, ptp_timescale, leap61, leap59)`
    /// reading from a TIME_PROPERTIES_DATA_SET response.
    pub fn apply_time_properties(
        &mut self,
        ts_now_ns: i128,
        utc_offset: i32,
        ptp_timescale: bool,
        leap61: bool,
        leap59: bool,
    ) {
        if self.forced {
            return;
        }
        self.sync_offset = utc_offset;
        self.leap = if ptp_timescale {
            if leap61 {
                1
            } else if leap59 {
                -1
            } else {
                0
            }
        } else {
            0
        };
        self.last_refresh_ns = Some(ts_now_ns);
    }

    /// Evaluates whether a previously pending leap has now crossed
    /// midnight; folds it into `sync_offset` if so. Returns true if a leap
    /// is due to be applied this tick.
    pub fn evaluate(&mut self, ts_now_ns: i128) -> bool {
        let (status, day) = leap_second_status(ts_now_ns, self.leap, self.prev_day_index);
        self.prev_day_index = day;
        if status.applied {
            self.sync_offset += self.leap as i32;
            self.leap = 0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_second_is_last_second_of_day() {
        let ts = (SEC_PER_DAY as i128 - 1) * NS_PER_SEC as i128;
        assert!(is_ambiguous_second(ts));
        assert!(!is_ambiguous_second(ts - NS_PER_SEC as i128));
    }

    #[test]
    fn leap_applies_once_midnight_is_crossed() {
        let before_midnight = (SEC_PER_DAY as i128 - 2) * NS_PER_SEC as i128;
        let (status, day0) = leap_second_status(before_midnight, 1, 0);
        assert_eq!(status.clock_leap, 1);
        assert!(!status.applied);

        let after_midnight = (SEC_PER_DAY as i128 + 1) * NS_PER_SEC as i128;
        let (status, _) = leap_second_status(after_midnight, 1, day0);
        assert_eq!(status.clock_leap, 0);
        assert!(status.applied);
    }

    #[test]
    fn gate_passes_through_same_timescale_pair() {
        let decision = leap_gate(false, false, 0, 1, false, true);
        assert_eq!(decision, GateDecision::PassThrough);
    }

    #[test]
    fn gate_suspends_in_ambiguous_second() {
        let ts = (SEC_PER_DAY as i128 - 1) * NS_PER_SEC as i128;
        let decision = leap_gate(false, true, ts, 1, false, true);
        assert_eq!(decision, GateDecision::Suspend);
    }

    #[test]
    fn gate_applies_kernel_leap_when_due_and_policy_allows() {
        let decision = leap_gate(false, true, 0, 1, true, true);
        assert_eq!(decision, GateDecision::ApplyKernelLeap(1));
    }

    #[test]
    fn coordinator_folds_leap_into_sync_offset_after_midnight() {
        let mut coord = LeapCoordinator::new(None);
        coord.apply_time_properties(0, 37, true, true, false);
        assert_eq!(coord.leap, 1);
        assert_eq!(coord.sync_offset, 37);

        let after_midnight = (SEC_PER_DAY as i128 + 1) * NS_PER_SEC as i128;
        assert!(coord.evaluate(after_midnight));
        assert_eq!(coord.sync_offset, 38);
        assert_eq!(coord.leap, 0);
    }

    #[test]
    fn forced_offset_never_refreshes() {
        let coord = LeapCoordinator::new(Some(37));
        assert!(!coord.needs_refresh(0));
        assert_eq!(coord.sync_offset, 37);
    }
}
