//! Minimal parser for the SJA1105 static-configuration "staging area"
//! binary blob (`/lib/firmware/sja1105.bin`): recovers only what the TAS/Qbv
//! start-time coordination needs — whether a Qbv (Time-Aware Shaper) table
//! is present, and the per-slot `delta` values used to size its cycle.
//!
//! This does not attempt to round-trip the full static configuration
//! format; the rest of the blob is opaque to this daemon.

use anyhow::{bail, Result};

/// Device time-base unit, in nanoseconds, used to convert a Qbv slot
/// `delta` into wall time.
pub const TIME_BASE_NS: u64 = 200;

pub struct StagingArea {
    pub have_qbv: bool,
    pub slot_deltas: Vec<u32>,
}

impl StagingArea {
    /// Sum of per-slot deltas, converted to nanoseconds: the length of one
    /// full Qbv gating cycle.
    pub fn cycle_len_ns(&self) -> u64 {
        self.slot_deltas.iter().map(|d| *d as u64).sum::<u64>() * TIME_BASE_NS
    }
}

const SCHEDULE_ENTRY_POINTS_CLKSRC_OFFSET: usize = 4;
const CLKSRC_PTP: u8 = 3;

/// Parses just the schedule-entry-points-params header (to read `clksrc`)
/// and the schedule table's per-entry `delta` column.
///
/// Layout assumptions are deliberately narrow: a 4-byte little-endian table
/// header giving the entry count, followed by that many 4-byte
/// little-endian `delta` values, preceded by a single `clksrc` byte at a
/// fixed offset — enough to recover Qbv timing, nothing else.
pub fn parse_staging_area(blob: &[u8]) -> Result<StagingArea> {
    if blob.len() <= SCHEDULE_ENTRY_POINTS_CLKSRC_OFFSET {
        bail!("staging area blob too short to contain schedule entry points params");
    }
    let clksrc = blob[SCHEDULE_ENTRY_POINTS_CLKSRC_OFFSET];
    let have_qbv = clksrc == CLKSRC_PTP;

    if !have_qbv {
        return Ok(StagingArea {
            have_qbv: false,
            slot_deltas: Vec::new(),
        });
    }

    let table_start = SCHEDULE_ENTRY_POINTS_CLKSRC_OFFSET + 1;
    if blob.len() < table_start + 4 {
        bail!("staging area blob truncated before schedule table header");
    }
    let entry_count = u32::from_le_bytes(blob[table_start..table_start + 4].try_into().unwrap()) as usize;
    let deltas_start = table_start + 4;
    let needed = deltas_start + entry_count * 4;
    if blob.len() < needed {
        bail!(
            "staging area blob truncated: expected {} bytes for {entry_count} schedule entries, found {}",
            needed,
            blob.len()
        );
    }

    let mut slot_deltas = Vec::with_capacity(entry_count);
    for i in 0..entry_count {
        let start = deltas_start + i * 4;
        slot_deltas.push(u32::from_le_bytes(blob[start..start + 4].try_into().unwrap()));
    }

    Ok(StagingArea {
        have_qbv,
        slot_deltas,
    })
}
