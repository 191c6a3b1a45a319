//! bcm2835-isp statistics block (`struct bcm2835_isp_stats`).
//!
//! The block is a fixed little-endian record; offsets below match the driver
//! header and must not drift.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub const HISTOGRAM_BINS: usize = 128;
pub const NUM_HISTOGRAMS: usize = 2;
pub const AWB_REGIONS: usize = 192;
pub const FLOATING_REGIONS: usize = 16;
pub const AGC_REGIONS: usize = 16;
pub const FOCUS_REGIONS: usize = 12;

const HEADER_SIZE: usize = 8;
const HISTOGRAM_SIZE: usize = 3 * HISTOGRAM_BINS * 4;
const REGION_SIZE: usize = 32;
const FOCUS_REGION_SIZE: usize = 48;

pub const AWB_OFFSET: usize = HEADER_SIZE + NUM_HISTOGRAMS * HISTOGRAM_SIZE;
pub const FLOATING_OFFSET: usize = AWB_OFFSET + AWB_REGIONS * REGION_SIZE;
pub const AGC_OFFSET: usize = FLOATING_OFFSET + FLOATING_REGIONS * REGION_SIZE;
pub const FOCUS_OFFSET: usize = AGC_OFFSET + AGC_REGIONS * REGION_SIZE;
pub const STATS_SIZE: usize = FOCUS_OFFSET + FOCUS_REGIONS * FOCUS_REGION_SIZE;

/// One RGB accumulation region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Region {
    pub counted: u32,
    pub notcounted: u32,
    pub r_sum: u64,
    pub g_sum: u64,
    pub b_sum: u64,
}

impl Region {
    fn read(buf: &mut &[u8]) -> Self {
        Self {
            counted: buf.get_u32_le(),
            notcounted: buf.get_u32_le(),
            r_sum: buf.get_u64_le(),
            g_sum: buf.get_u64_le(),
            b_sum: buf.get_u64_le(),
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.counted);
        buf.put_u32_le(self.notcounted);
        buf.put_u64_le(self.r_sum);
        buf.put_u64_le(self.g_sum);
        buf.put_u64_le(self.b_sum);
    }
}

/// Focus figure of merit for one region, per filter and phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FocusRegion {
    pub contrast_val: [[u64; 2]; 2],
    pub contrast_num: [[u32; 2]; 2],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Histogram {
    pub r: [u32; HISTOGRAM_BINS],
    pub g: [u32; HISTOGRAM_BINS],
    pub b: [u32; HISTOGRAM_BINS],
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            r: [0; HISTOGRAM_BINS],
            g: [0; HISTOGRAM_BINS],
            b: [0; HISTOGRAM_BINS],
        }
    }
}

/// Decoded statistics for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statistics {
    pub version: u32,
    pub histograms: [Histogram; NUM_HISTOGRAMS],
    pub awb: Vec<Region>,
    pub floating: Vec<Region>,
    pub agc: Vec<Region>,
    pub focus: Vec<FocusRegion>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            version: 1,
            histograms: [Histogram::default(), Histogram::default()],
            awb: vec![Region::default(); AWB_REGIONS],
            floating: vec![Region::default(); FLOATING_REGIONS],
            agc: vec![Region::default(); AGC_REGIONS],
            focus: vec![FocusRegion::default(); FOCUS_REGIONS],
        }
    }
}

impl Statistics {
    /// Decode a statistics buffer. Anything shorter than the full record
    /// means the driver and this layout disagree, so it is fatal.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < STATS_SIZE {
            return Err(Error::TruncatedStatistics {
                expected: STATS_SIZE,
                actual: data.len(),
            });
        }

        let mut buf = &data[..STATS_SIZE];
        let version = buf.get_u32_le();
        let _size = buf.get_u32_le();

        let mut histograms = [Histogram::default(), Histogram::default()];
        for hist in &mut histograms {
            for channel in [&mut hist.r, &mut hist.g, &mut hist.b] {
                for bin in channel.iter_mut() {
                    *bin = buf.get_u32_le();
                }
            }
        }

        let awb = (0..AWB_REGIONS).map(|_| Region::read(&mut buf)).collect();
        let floating = (0..FLOATING_REGIONS)
            .map(|_| Region::read(&mut buf))
            .collect();
        let agc = (0..AGC_REGIONS).map(|_| Region::read(&mut buf)).collect();

        let mut focus = Vec::with_capacity(FOCUS_REGIONS);
        for _ in 0..FOCUS_REGIONS {
            let mut region = FocusRegion::default();
            for row in region.contrast_val.iter_mut() {
                for v in row.iter_mut() {
                    *v = buf.get_u64_le();
                }
            }
            for row in region.contrast_num.iter_mut() {
                for v in row.iter_mut() {
                    *v = buf.get_u32_le();
                }
            }
            focus.push(region);
        }

        Ok(Self {
            version,
            histograms,
            awb,
            floating,
            agc,
            focus,
        })
    }

    /// Encode in the driver layout. Used to feed simulated statistics queues.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(STATS_SIZE);
        buf.put_u32_le(self.version);
        buf.put_u32_le(STATS_SIZE as u32);
        for hist in &self.histograms {
            for channel in [&hist.r, &hist.g, &hist.b] {
                for bin in channel {
                    buf.put_u32_le(*bin);
                }
            }
        }
        let pad = Region::default();
        for (regions, count) in [
            (&self.awb, AWB_REGIONS),
            (&self.floating, FLOATING_REGIONS),
            (&self.agc, AGC_REGIONS),
        ] {
            for i in 0..count {
                regions.get(i).unwrap_or(&pad).write(&mut buf);
            }
        }
        let pad = FocusRegion::default();
        for i in 0..FOCUS_REGIONS {
            let region = self.focus.get(i).unwrap_or(&pad);
            for row in &region.contrast_val {
                for v in row {
                    buf.put_u64_le(*v);
                }
            }
            for row in &region.contrast_num {
                for v in row {
                    buf.put_u32_le(*v);
                }
            }
        }
        buf.freeze()
    }

    /// Green histogram of the first (full-image) histogram set.
    pub fn green_histogram(&self) -> &[u32] {
        &self.histograms[0].g
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_offsets() {
        assert_eq!(AWB_OFFSET, 3080);
        assert_eq!(FLOATING_OFFSET, 9224);
        assert_eq!(AGC_OFFSET, 9736);
        assert_eq!(FOCUS_OFFSET, 10248);
        assert_eq!(STATS_SIZE, 10824);
    }

    #[test]
    fn test_short_block_is_fatal() {
        let err = Statistics::parse(&[0u8; STATS_SIZE - 1]).unwrap_err();
        assert!(matches!(
            err,
            Error::TruncatedStatistics {
                expected: STATS_SIZE,
                actual
            } if actual == STATS_SIZE - 1
        ));
    }

    #[test]
    fn test_fields_land_at_driver_offsets() {
        let mut stats = Statistics::default();
        stats.histograms[0].g[64] = 0xdead_beef;
        stats.agc[3].g_sum = 0x0102_0304_0506_0708;
        stats.focus[11].contrast_val[1][1] = 42_000;

        let bytes = stats.to_bytes();
        assert_eq!(bytes.len(), STATS_SIZE);

        let g64 = HEADER_SIZE + (HISTOGRAM_BINS + 64) * 4;
        assert_eq!(&bytes[g64..g64 + 4], &0xdead_beefu32.to_le_bytes());
        let agc3 = AGC_OFFSET + 3 * REGION_SIZE + 16;
        assert_eq!(&bytes[agc3..agc3 + 8], &0x0102_0304_0506_0708u64.to_le_bytes());
        let focus11 = FOCUS_OFFSET + 11 * FOCUS_REGION_SIZE + 24;
        assert_eq!(&bytes[focus11..focus11 + 8], &42_000u64.to_le_bytes());

        assert_eq!(Statistics::parse(&bytes).unwrap(), stats);
    }
}
