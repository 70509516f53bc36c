//! Small-block sizing: the I/O-ratio-derived legal sub-midplane sizes and a
//! cache of valid ionode ranges for each one (spec.md §4.1).

use crate::block::IonodeBitmap;
use crate::common::constants::{LEGACY_SMALL_BLOCK_SIZES, SMALL_BLOCK_SIZES};

/// A cached, legal ionode range for one small-block size.
#[derive(Clone, Debug)]
pub struct IonodeRange {
    pub size: u32,
    pub io_start: u32,
    pub io_count: u32,
}

/// Pre-computed valid-ionode-range tables, one list per legal small-block size.
#[derive(Clone, Debug, Default)]
pub struct ValidSmallRanges {
    ranges: Vec<IonodeRange>,
    ni_per_midplane: u32,
}

impl ValidSmallRanges {
    /// Builds the cache for a midplane of `midplane_size` compute nodes and
    /// `ni_per_midplane` ionodes: each legal small-block `size` is assigned
    /// a proportional share of ionodes, `size / midplane_size` of the total.
    pub fn build(
        smallest_block: u32,
        midplane_size: u32,
        ni_per_midplane: u32,
        legacy: bool,
    ) -> Self {
        let sizes: &[u32] = if legacy { &LEGACY_SMALL_BLOCK_SIZES } else { &SMALL_BLOCK_SIZES };
        let mut ranges = Vec::new();
        for &size in sizes {
            if size < smallest_block || ni_per_midplane == 0 || midplane_size == 0 {
                continue;
            }
            let stride = ((u64::from(size) * u64::from(ni_per_midplane))
                / u64::from(midplane_size))
            .max(1)
            .min(u64::from(ni_per_midplane)) as u32;
            let mut start = 0;
            while start + stride <= ni_per_midplane {
                ranges.push(IonodeRange { size, io_start: start, io_count: stride });
                start += stride;
            }
        }
        Self { ranges, ni_per_midplane }
    }

    /// Smallest legal size per spec.md §4.1:
    /// `max(1, round(midplane_size * io_ratio / numpsets)) * nodecard_size`.
    pub fn smallest_block_size(midplane_size: u32, io_ratio: f64, numpsets: u32, nodecard_size: u32) -> u32 {
        let numpsets = numpsets.max(1);
        let factor = ((f64::from(midplane_size) * io_ratio / f64::from(numpsets)).round() as u32).max(1);
        factor * nodecard_size
    }

    /// Ranges whose size is at least `min_size`, ascending by size then offset.
    pub fn ranges_at_least(&self, min_size: u32) -> Vec<&IonodeRange> {
        let mut out: Vec<&IonodeRange> =
            self.ranges.iter().filter(|r| r.size >= min_size).collect();
        out.sort_by_key(|r| (r.size, r.io_start));
        out
    }

    pub fn bitmap_for(&self, range: &IonodeRange) -> IonodeBitmap {
        IonodeBitmap::with_range(self.ni_per_midplane, range.io_start, range.io_count)
    }
}
