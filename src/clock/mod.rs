//! Clock Handle abstraction: a time source that can be read, stepped, and
//! have its frequency adjusted. Two implementations exist: the host wall
//! clock (`CLOCK_REALTIME`) and a PTP Hardware Clock character device.

mod phc;
mod system;

pub use phc::PhcClock;
pub use system::SystemClock;

use crate::error::ClockError;

/// Nanoseconds-since-epoch timestamp, as read from a [`ClockHandle`].
pub type TimestampNs = i128;

/// Common contract for anything this daemon disciplines or reads from.
///
/// `#[cfg_attr(test, mockall::automock)]` lets the estimator, servo, and main
/// loop be exercised against synthetic clocks in unit tests without any
/// hardware or root privileges, the same seam the teacher used for its
/// network traits.
#[cfg_attr(test, mockall::automock)]
pub trait ClockHandle: Send {
    /// A short label for log lines (device path or "CLOCK_REALTIME").
    fn label(&self) -> &str;

    /// True for the wall clock (UTC, leap-second aware); false for a PHC
    /// (TAI, no leap seconds).
    fn is_utc(&self) -> bool;

    /// Current time as nanoseconds since the Unix epoch.
    fn read(&self) -> Result<TimestampNs, ClockError>;

    /// Apply a one-shot offset: new_time = old_time + delta_ns.
    fn step(&mut self, delta_ns: i64) -> Result<(), ClockError>;

    /// Set the clock's frequency offset in parts-per-billion.
    fn set_freq(&mut self, ppb: f64) -> Result<(), ClockError>;

    /// Read back the clock's current frequency offset in parts-per-billion.
    fn get_freq(&self) -> Result<f64, ClockError>;

    /// Maximum frequency adjustment this clock supports, in ppb.
    fn max_adjust_ppb(&self) -> i64;

    /// Whether this clock can drive a PPS output signal.
    fn has_pps_output(&self) -> bool;

    /// Mark (or clear) the kernel "clock synchronized" status bit. Only
    /// meaningful for the wall clock; a no-op on PHC devices.
    fn set_synced(&mut self, synced: bool) -> Result<(), ClockError>;

    /// Tell the kernel a leap second is pending (+1 insert, -1 delete, 0
    /// clear). Only meaningful for the wall clock.
    fn set_pending_leap(&mut self, leap: i8) -> Result<(), ClockError>;

    /// Single-ioctl offset/delay estimate against the wall clock, when this
    /// clock is a PHC that advertised `PTP_SYS_OFFSET` support at open time.
    /// `None` for clocks that don't support it (including the wall clock
    /// itself, which has no "offset against itself" to report).
    fn sys_offset(&self, _n_samples: usize) -> Option<Result<(i64, TimestampNs, i64), ClockError>> {
        None
    }
}

/// Establishes the "known frequency state" invariant documented in the
/// design notes: a freshly opened clock's frequency reading of 0 is
/// indistinguishable from "never set", so every open immediately reads back
/// whatever frequency is active and rewrites it, forcing the clock into a
/// known state before the servo ever touches it.
pub fn establish_frequency_ground_truth(clock: &mut dyn ClockHandle) -> Result<(), ClockError> {
    let freq = clock.get_freq()?;
    clock.set_freq(freq)
}

/// Opens a clock from a CLI-supplied device spec: the literal
/// `CLOCK_REALTIME` resolves to the wall clock; otherwise the string is
/// tried first as a PHC device path, then as a network interface name
/// resolved to its PHC via ethtool.
pub fn open_clock(spec: &str) -> Result<Box<dyn ClockHandle>, ClockError> {
    if spec == "CLOCK_REALTIME" {
        return Ok(Box::new(SystemClock::open()?));
    }
    match PhcClock::open(spec) {
        Ok(phc) => Ok(Box::new(phc)),
        Err(_) => Ok(Box::new(PhcClock::open_for_interface(spec)?)),
    }
}
