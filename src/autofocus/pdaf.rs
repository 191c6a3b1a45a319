//! Phase-detect statistics from IMX708 embedded data.

use crate::error::{Error, Result};

pub const PDAF_ROWS: usize = 12;
pub const PDAF_COLS: usize = 16;

/// Embedded data lines are RAW10 packed like the image.
const BITS_PER_PIXEL: usize = 10;
/// Line of the embedded data carrying the PDAF grid.
const PDAF_LINE: usize = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PdafData {
    pub conf: u16,
    pub phase: i16,
}

/// One frame's phase/confidence grid, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdafRegions {
    pub rows: usize,
    pub cols: usize,
    pub cells: Vec<PdafData>,
}

impl PdafRegions {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            cells: vec![PdafData::default(); rows * cols],
        }
    }

    pub fn uniform(conf: u16, phase: i16) -> Self {
        let mut regions = Self::new(PDAF_ROWS, PDAF_COLS);
        regions.cells.fill(PdafData { conf, phase });
        regions
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Bytes per embedded data line for a sensor line of `width` pixels.
pub fn bytes_per_line(width: u32) -> usize {
    (width as usize * BITS_PER_PIXEL) >> 3
}

/// Decode the 12x16 grid from the third embedded data line. Each cell is a
/// RAW10 pixel group: 11-bit confidence then, if non-zero, a signed 10-bit
/// phase.
pub fn parse(data: &[u8], bytes_per_line: usize) -> Result<PdafRegions> {
    let step = BITS_PER_PIXEL >> 1;
    if data.len() < bytes_per_line * (PDAF_LINE + 1) || bytes_per_line < 194 * step {
        return Err(Error::TruncatedMetadata);
    }
    let line = &data[PDAF_LINE * bytes_per_line..(PDAF_LINE + 1) * bytes_per_line];
    if line[0] != 0 || line[1] >= 0x40 {
        return Err(Error::TruncatedMetadata);
    }

    let mut regions = PdafRegions::new(PDAF_ROWS, PDAF_COLS);
    let mut offset = 2 * step;
    for cell in regions.cells.iter_mut() {
        let (b0, b1, b2) = (line[offset], line[offset + 1], line[offset + 2]);
        let conf = (u16::from(b0) << 3) | u16::from(b1 >> 5);
        let phase = if conf != 0 {
            let high = i16::from(b1 & 0x0f) - i16::from(b1 & 0x10);
            (high << 6) | i16::from(b2 >> 2)
        } else {
            0
        };
        *cell = PdafData { conf, phase };
        offset += step;
    }
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(conf: u16, phase: i16) -> [u8; 5] {
        let b0 = (conf >> 3) as u8;
        let high = ((phase >> 6) & 0x1f) as u8;
        let b1 = (((conf & 0x7) as u8) << 5) | high;
        let b2 = ((phase & 0x3f) as u8) << 2;
        [b0, b1, b2, 0, 0]
    }

    fn metadata(width: u32, cells: &[(u16, i16)]) -> Vec<u8> {
        let bpl = bytes_per_line(width);
        let mut data = vec![0u8; bpl * 3];
        let line = &mut data[2 * bpl..];
        line[1] = 0x10;
        for (i, &(conf, phase)) in cells.iter().enumerate() {
            let at = 10 + i * 5;
            line[at..at + 5].copy_from_slice(&encode(conf, phase));
        }
        data
    }

    #[test]
    fn test_parse_grid() {
        let data = metadata(1536, &[(300, -37), (1, 100), (0, 55)]);
        let regions = parse(&data, bytes_per_line(1536)).unwrap();
        assert_eq!(regions.len(), PDAF_ROWS * PDAF_COLS);
        assert_eq!(regions.cells[0], PdafData { conf: 300, phase: -37 });
        assert_eq!(regions.cells[1], PdafData { conf: 1, phase: 100 });
        // Zero confidence never carries a phase.
        assert_eq!(regions.cells[2], PdafData { conf: 0, phase: 0 });
    }

    #[test]
    fn test_short_metadata_rejected() {
        let bpl = bytes_per_line(1536);
        let data = vec![0u8; bpl * 2];
        assert!(matches!(parse(&data, bpl), Err(Error::TruncatedMetadata)));
    }

    #[test]
    fn test_unknown_layout_rejected() {
        let mut data = metadata(1536, &[]);
        let bpl = bytes_per_line(1536);
        data[2 * bpl] = 0x0a;
        assert!(parse(&data, bpl).is_err());
        // Lines too narrow to hold the grid.
        assert!(parse(&vec![0u8; 300], 100).is_err());
    }
}
