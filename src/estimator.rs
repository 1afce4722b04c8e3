//! Best-of-N three-timestamp offset estimation between two clocks.
//!
//! Grounded on `phc2sys.c`'s `read_phc`: take `(t_dst1, t_src, t_dst2)` in
//! strict order, keep the reading with the smallest `t_dst2 - t_dst1`
//! bracket on the theory that the tightest bracket saw the least scheduling
//! noise, then report offset at the bracket's midpoint.

use crate::clock::{ClockHandle, TimestampNs};

/// Result of a single offset estimate: slave-relative-to-master offset in
/// nanoseconds, the midpoint timestamp on the slave's timescale, and the
/// round-trip delay (bracket width) observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Estimate {
    pub offset_ns: i64,
    pub ts_ns: TimestampNs,
    pub delay_ns: i64,
}

/// Takes `n` three-timestamp brackets between `src` (master) and `dst`
/// (slave), returning the tightest one. `n` of 0 is treated as 1.
pub fn estimate_phc_offset(
    src: &dyn ClockHandle,
    dst: &dyn ClockHandle,
    n: usize,
) -> anyhow::Result<Estimate> {
    let n = n.max(1);
    let mut best: Option<Estimate> = None;

    for _ in 0..n {
        let t_dst1 = dst.read()?;
        let t_src = src.read()?;
        let t_dst2 = dst.read()?;

        let interval = (t_dst2 - t_dst1) as i64;
        let midpoint = t_dst1 + (t_dst2 - t_dst1) / 2;
        let offset = (midpoint - t_src) as i64;

        let candidate = Estimate {
            offset_ns: offset,
            ts_ns: t_dst2,
            delay_ns: interval,
        };

        best = Some(match best {
            Some(prev) if prev.delay_ns <= candidate.delay_ns => prev,
            _ => candidate,
        });
    }

    best.ok_or_else(|| anyhow::anyhow!("no offset samples collected"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClockHandle;

    #[test]
    fn keeps_tightest_bracket_across_n_iterations() {
        let mut src = MockClockHandle::new();
        let mut dst = MockClockHandle::new();

        // First iteration: wide bracket (100ns). Second: tight (10ns).
        let mut dst_seq = vec![1_000i128, 1_200, 2_000, 2_010].into_iter();
        dst.expect_read()
            .times(4)
            .returning(move || Ok(dst_seq.next().unwrap()));

        let mut src_seq = vec![1_050i128, 2_004].into_iter();
        src.expect_read()
            .times(2)
            .returning(move || Ok(src_seq.next().unwrap()));

        let est = estimate_phc_offset(&src, &dst, 2).unwrap();
        assert_eq!(est.delay_ns, 10);
        assert_eq!(est.ts_ns, 2_010);
    }

    #[test]
    fn single_reading_computes_midpoint_offset() {
        let mut src = MockClockHandle::new();
        let mut dst = MockClockHandle::new();

        dst.expect_read().times(1).return_once(|| Ok(1_000));
        src.expect_read().times(1).return_once(|| Ok(1_040));
        dst.expect_read().times(1).return_once(|| Ok(1_100));

        let est = estimate_phc_offset(&src, &dst, 1).unwrap();
        // midpoint = 1050, offset = 1050 - 1040 = 10
        assert_eq!(est.offset_ns, 10);
        assert_eq!(est.delay_ns, 100);
    }
}
