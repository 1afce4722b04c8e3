//! PPS (pulse-per-second) reader: blocks for the next edge via `PPS_FETCH`,
//! optionally refining the sub-second residual with a PHC.

use crate::clock::{ClockHandle, TimestampNs};
use crate::error::ClockError;
use crate::estimator::estimate_phc_offset;
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::time::Duration;

const NS_PER_SEC: i64 = 1_000_000_000;
/// Reject a PPS+PHC combined sample if the PHC disagrees with the nearest
/// second boundary by more than this many nanoseconds.
pub const PHC_PPS_OFFSET_LIMIT: i64 = 10_000_000;
const PPS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct PpsKtime {
    sec: i64,
    nsec: i32,
    flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct PpsInfo {
    assert_sequence: u32,
    clear_sequence: u32,
    assert_tu: PpsKtime,
    clear_tu: PpsKtime,
    current_mode: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct PpsFdata {
    info: PpsInfo,
    timeout: PpsKtime,
}

const PPS_MAGIC: u8 = b'p';
// PPS_FETCH per linux/pps.h is _IOWR('p', 0x05, struct pps_fdata).
nix::ioctl_readwrite!(pps_fetch, PPS_MAGIC, 0x05, PpsFdata);

pub struct PpsReader {
    file: File,
}

impl PpsReader {
    pub fn open(path: &str) -> Result<Self, ClockError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .open(Path::new(path))
            .map_err(|e| ClockError::Open {
                path: path.to_string(),
                source: e,
            })?;
        Ok(Self { file })
    }

    /// Raw descriptor for multiplexing via `select()`; becomes readable once
    /// the kernel has latched the next PPS edge.
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Blocks for the next PPS assert edge (10s device-side timeout),
    /// returning the edge's nanoseconds-since-epoch and the residual offset
    /// folded into `[-5e8, 5e8)`.
    pub fn fetch(&self) -> Result<(TimestampNs, i64), ClockError> {
        let mut req = PpsFdata {
            timeout: PpsKtime {
                sec: PPS_FETCH_TIMEOUT.as_secs() as i64,
                nsec: 0,
                flags: 1, // PPS_TIME_INVALID cleared, relative timeout
            },
            ..Default::default()
        };
        unsafe {
            pps_fetch(self.file.as_raw_fd(), &mut req).map_err(|e| ClockError::Ioctl {
                name: "PPS_FETCH",
                source: e,
            })?;
        }
        let edge = &req.info.assert_tu;
        let ts_ns: TimestampNs = edge.sec as i128 * NS_PER_SEC as i128 + edge.nsec as i128;
        let residual = fold_residual(edge.nsec as i64);
        Ok((ts_ns, residual))
    }
}

/// Folds a nanosecond-of-second value into `[-5e8, 5e8)`, matching
/// `do_pps_loop`'s residual computation in the original implementation.
fn fold_residual(nsec: i64) -> i64 {
    if nsec >= NS_PER_SEC / 2 {
        nsec - NS_PER_SEC
    } else {
        nsec
    }
}

/// Refines a PPS edge with the master PHC's whole second, matching
/// `do_pps_loop`'s `read_phc`-then-truncate sequence in the original
/// implementation: bracket the PHC against the disciplined clock (`slave`)
/// the same way [`estimate_phc_offset`] does, convert that bracket's
/// timestamp onto the PHC's own timescale, reject the sample if the PHC
/// isn't close to its own second boundary, then report the offset as the
/// PPS edge minus the PHC's whole second (the PPS timestamp itself is kept
/// as the sample's timescale — it already carries the true edge instant).
pub fn refine_with_phc(
    pps_ts_ns: TimestampNs,
    master: &dyn ClockHandle,
    slave: &dyn ClockHandle,
) -> anyhow::Result<Option<(TimestampNs, i64)>> {
    let bracket = estimate_phc_offset(master, slave, 1)?;
    // bracket.offset_ns is slave-minus-master; subtracting it converts the
    // slave-timescale bracket timestamp back onto the master's timescale.
    let phc_ts = bracket.ts_ns - bracket.offset_ns as i128;
    let phc_mod = phc_ts.rem_euclid(NS_PER_SEC as i128) as i64;
    if phc_mod > PHC_PPS_OFFSET_LIMIT {
        return Ok(None);
    }
    let phc_whole_second = phc_ts.div_euclid(NS_PER_SEC as i128) * NS_PER_SEC as i128;
    let offset_ns = (pps_ts_ns - phc_whole_second) as i64;
    Ok(Some((pps_ts_ns, offset_ns)))
}
