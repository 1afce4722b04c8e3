use thiserror::Error;

/// Errors from the low-level clock interfaces (wall clock, PHC character devices).
///
/// Kept distinct from `anyhow::Error` because callers on the hot path (the main
/// loop) want to match on specific variants rather than just log-and-bail.
#[derive(Debug, Error)]
pub enum ClockError {
    #[error("failed to open clock device {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("clock read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("clock step failed: {0}")]
    Step(#[source] std::io::Error),
    #[error("clock frequency adjustment failed: {0}")]
    SetFreq(#[source] std::io::Error),
    #[error("PHC reports max adjustment of 0 ppb, device is not adjustable")]
    NotAdjustable,
    #[error("ioctl {name} failed: {source}")]
    Ioctl {
        name: &'static str,
        #[source]
        source: nix::Error,
    },
    #[error("could not resolve network interface {iface} to a PTP hardware clock")]
    NoPhcForInterface { iface: String },
}

/// Outcome of a single control-loop tick for one slave clock.
///
/// Deliberately not `Result<(), anyhow::Error>`: most ticks end in `Skip`, and
/// allocating/formatting an error just to throw it away every second would be
/// wasteful. Only `Fatal` carries a heap-allocated error.
#[derive(Debug)]
pub enum TickOutcome {
    /// Update applied normally.
    Applied,
    /// Recoverable condition (failed read, management timeout, misaligned PPS
    /// sample, ambiguous leap second). Logged by the caller; no servo update.
    Skip,
    /// The clock sanity check asked for a servo reset; this does not abort
    /// the loop or the process, only the affected clock's servo state.
    Reset,
    /// Unrecoverable for this tick: a wall-clock read failed, for example.
    /// The loop continues to the next clock/tick, but this one is lost.
    Fatal(anyhow::Error),
}
