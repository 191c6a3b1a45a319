//! Lens shading correction tables.
//!
//! Calibration tables live on a 16x12 grid over the full pixel array. They
//! are interpolated by colour temperature, combined with the luminance
//! fall-off, resampled onto the active camera mode and finally resampled
//! into the ISP's corner-sampled lens shading grid.

use std::os::fd::RawFd;

use serde::Deserialize;

use crate::capture::mode::CameraMode;
use crate::error::SetupError;
use crate::v4l2::sys::{bcm2835_isp_lens_shading, GAIN_FORMAT_U4P10};

pub const TABLE_W: usize = 16;
pub const TABLE_H: usize = 12;
pub const TABLE_SIZE: usize = TABLE_W * TABLE_H;

/// Largest lens shading buffer the ISP accepts, in bytes.
pub const MAX_GRID_BYTES: usize = 0x8000;
const CELL_SIZES: [u32; 5] = [16, 32, 64, 128, 256];
/// u4.10 fixed point ceiling.
const MAX_GAIN_CODE: i64 = 16383;

#[derive(Debug, Clone, Deserialize)]
pub struct Calibration {
    pub ct: f64,
    pub table: Vec<f64>,
}

fn default_strength() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlscParams {
    #[serde(default = "default_strength")]
    pub luminance_strength: f64,
    #[serde(rename = "calibrations_Cr", default)]
    pub calibrations_cr: Vec<Calibration>,
    #[serde(rename = "calibrations_Cb", default)]
    pub calibrations_cb: Vec<Calibration>,
    #[serde(default)]
    pub luminance_lut: Vec<f64>,
}

impl Default for AlscParams {
    fn default() -> Self {
        Self {
            luminance_strength: 1.0,
            calibrations_cr: Vec::new(),
            calibrations_cb: Vec::new(),
            luminance_lut: Vec::new(),
        }
    }
}

impl AlscParams {
    pub fn validate(&self) -> Result<(), SetupError> {
        let check = |name: &str, t: &[f64]| {
            if t.is_empty() || t.len() == TABLE_SIZE {
                Ok(())
            } else {
                Err(SetupError::Tuning(format!(
                    "rpi.alsc {name} has {} entries, expected {TABLE_SIZE}",
                    t.len()
                )))
            }
        };
        check("luminance_lut", &self.luminance_lut)?;
        for cal in self.calibrations_cr.iter().chain(&self.calibrations_cb) {
            if cal.table.len() != TABLE_SIZE {
                return Err(SetupError::Tuning(format!(
                    "rpi.alsc calibration at {}K has {} entries, expected {TABLE_SIZE}",
                    cal.ct,
                    cal.table.len()
                )));
            }
        }
        let sorted = |c: &[Calibration]| c.windows(2).all(|w| w[0].ct < w[1].ct);
        if !sorted(&self.calibrations_cr) || !sorted(&self.calibrations_cb) {
            return Err(SetupError::Tuning(
                "rpi.alsc calibrations must be in increasing colour temperature".into(),
            ));
        }
        Ok(())
    }
}

/// Calibration for colour temperature `ct`: clamped at the ends of the
/// list, linear in between, all ones if there are no calibrations.
pub fn cal_table(ct: f64, calibrations: &[Calibration]) -> Vec<f64> {
    match calibrations {
        [] => vec![1.0; TABLE_SIZE],
        [first, ..] if ct <= first.ct => first.table.clone(),
        [.., last] if ct >= last.ct => last.table.clone(),
        _ => {
            let idx = calibrations
                .windows(2)
                .position(|w| ct <= w[1].ct)
                .unwrap_or(0);
            let (lo, hi) = (&calibrations[idx], &calibrations[idx + 1]);
            let t = (ct - lo.ct) / (hi.ct - lo.ct);
            lo.table
                .iter()
                .zip(&hi.table)
                .map(|(a, b)| a + t * (b - a))
                .collect()
        }
    }
}

/// Scale so the smallest entry is exactly 1.
fn normalise(table: &mut [f64]) {
    let min = table.iter().copied().fold(f64::INFINITY, f64::min);
    if min > 0.0 && min.is_finite() {
        for v in table.iter_mut() {
            *v /= min;
        }
    }
}

/// Per-channel gain tables `[r, g, b]` on the calibration grid.
pub fn compute_tables(params: &AlscParams, ct: f64) -> [Vec<f64>; 3] {
    let cr = cal_table(ct, &params.calibrations_cr);
    let cb = cal_table(ct, &params.calibrations_cb);
    let lum: Vec<f64> = if params.luminance_lut.len() == TABLE_SIZE {
        params
            .luminance_lut
            .iter()
            .map(|l| 1.0 + (l - 1.0) * params.luminance_strength)
            .collect()
    } else {
        vec![1.0; TABLE_SIZE]
    };

    let mut r: Vec<f64> = cr.iter().zip(&lum).map(|(c, l)| c * l).collect();
    let mut g = lum.clone();
    let mut b: Vec<f64> = cb.iter().zip(&lum).map(|(c, l)| c * l).collect();
    normalise(&mut r);
    normalise(&mut g);
    normalise(&mut b);
    [r, g, b]
}

/// Bilinear sample positions along one axis of a `src_len` source:
/// `(lo, hi, frac)` per output.
fn sample_axis(
    n: usize,
    src_len: usize,
    start: f64,
    inc: f64,
    flip: bool,
) -> Vec<(usize, usize, f64)> {
    let last = src_len as i64 - 1;
    (0..n)
        .map(|i| {
            let x = start + inc * i as f64;
            let lo = x.floor() as i64;
            let frac = x - lo as f64;
            let hi = (lo + 1).clamp(0, last);
            let lo = lo.clamp(0, last);
            let (lo, hi) = if flip { (last - lo, last - hi) } else { (lo, hi) };
            (lo as usize, hi as usize, frac)
        })
        .collect()
}

/// Resample a full-array calibration table onto the area `mode` reads out,
/// keeping the 16x12 size. Samples outside the table clamp to its edge.
pub fn resample_cal_table(table: &[f64], mode: &CameraMode, hflip: bool, vflip: bool) -> Vec<f64> {
    let scale_x = f64::from(mode.sensor_width) / (f64::from(mode.width) * mode.scale_x);
    let x_off = f64::from(mode.crop_x) / f64::from(mode.sensor_width);
    let xs = sample_axis(
        TABLE_W,
        TABLE_W,
        0.5 / scale_x + x_off * TABLE_W as f64 - 0.5,
        1.0 / scale_x,
        hflip,
    );

    let scale_y = f64::from(mode.sensor_height) / (f64::from(mode.height) * mode.scale_y);
    let y_off = f64::from(mode.crop_y) / f64::from(mode.sensor_height);
    let ys = sample_axis(
        TABLE_H,
        TABLE_H,
        0.5 / scale_y + y_off * TABLE_H as f64 - 0.5,
        1.0 / scale_y,
        vflip,
    );

    bilinear(table, TABLE_W, &xs, &ys)
}

fn bilinear(
    src: &[f64],
    src_w: usize,
    xs: &[(usize, usize, f64)],
    ys: &[(usize, usize, f64)],
) -> Vec<f64> {
    let mut out = Vec::with_capacity(xs.len() * ys.len());
    for &(y_lo, y_hi, yf) in ys {
        let above = &src[y_lo * src_w..(y_lo + 1) * src_w];
        let below = &src[y_hi * src_w..(y_hi + 1) * src_w];
        for &(x_lo, x_hi, xf) in xs {
            let a = above[x_lo] * (1.0 - xf) + above[x_hi] * xf;
            let b = below[x_lo] * (1.0 - xf) + below[x_hi] * xf;
            out.push(a * (1.0 - yf) + b * yf);
        }
    }
    out
}

/// Geometry of the ISP lens shading grid for an input of `width`x`height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridGeometry {
    pub cell_size: u32,
    /// Corner-sampled: one more than the number of cells.
    pub width: u32,
    pub height: u32,
}

impl GridGeometry {
    /// Smallest cell size that keeps the grid under 64x48 cells.
    pub fn for_input(width: u32, height: u32) -> Option<Self> {
        CELL_SIZES.iter().find_map(|&cell| {
            let w = width.div_ceil(cell);
            let h = height.div_ceil(cell);
            (w < 64 && h <= 48).then_some(Self {
                cell_size: cell,
                width: w + 1,
                height: h + 1,
            })
        })
    }

    pub fn plane_len(&self) -> usize {
        (self.width * self.height) as usize
    }

    /// Bytes for the four u16 planes.
    pub fn byte_len(&self) -> usize {
        self.plane_len() * 4 * 2
    }

    /// ISP control describing a u4.10 table of this geometry held in `dmabuf`.
    pub fn control(&self, dmabuf: RawFd) -> bcm2835_isp_lens_shading {
        bcm2835_isp_lens_shading {
            enabled: 1,
            grid_cell_size: self.cell_size,
            grid_width: self.width,
            grid_stride: self.width,
            grid_height: self.height,
            dmabuf,
            ref_transform: 0,
            corner_sampled: 1,
            gain_format: GAIN_FORMAT_U4P10,
        }
    }
}

/// Resample a 16x12 table into a `w`x`h` corner-sampled grid as u4.10.
pub fn resample_to_grid(src: &[f64], w: u32, h: u32) -> Vec<u16> {
    let (w, h) = (w.max(2) as usize, h.max(2) as usize);
    let xs = sample_axis(w, TABLE_W, -0.5, TABLE_W as f64 / (w - 1) as f64, false);
    let ys = sample_axis(h, TABLE_H, -0.5, TABLE_H as f64 / (h - 1) as f64, false);
    bilinear(src, TABLE_W, &xs, &ys)
        .into_iter()
        .map(|v| ((1024.0 * v + 0.5).floor() as i64).clamp(0, MAX_GAIN_CODE) as u16)
        .collect()
}

/// Packed lens shading table ready for the ISP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LensShading {
    pub geometry: GridGeometry,
    /// R, Gr, Gb, B planes back to back.
    pub data: Vec<u16>,
}

/// Full pipeline from tuning data to the ISP grid for one camera mode.
pub fn build_lens_shading(
    params: &AlscParams,
    ct: f64,
    mode: &CameraMode,
    isp_width: u32,
    isp_height: u32,
    hflip: bool,
    vflip: bool,
) -> Result<LensShading, SetupError> {
    let geometry = GridGeometry::for_input(isp_width, isp_height).ok_or_else(|| {
        SetupError::Tuning(format!("no lens shading cell size fits {isp_width}x{isp_height}"))
    })?;
    if geometry.byte_len() > MAX_GRID_BYTES {
        return Err(SetupError::Tuning(format!(
            "lens shading grid {}x{} exceeds {MAX_GRID_BYTES} bytes",
            geometry.width, geometry.height
        )));
    }

    let [r, g, b] = compute_tables(params, ct);
    let mut data = Vec::with_capacity(geometry.plane_len() * 4);
    let grid = |t: &[f64]| {
        resample_to_grid(
            &resample_cal_table(t, mode, hflip, vflip),
            geometry.width,
            geometry.height,
        )
    };
    let green = grid(&g);
    data.extend(grid(&r));
    data.extend_from_slice(&green);
    data.extend_from_slice(&green);
    data.extend(grid(&b));

    Ok(LensShading { geometry, data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::sensor::SensorModel;

    fn cal(ct: f64, v: f64) -> Calibration {
        Calibration {
            ct,
            table: vec![v; TABLE_SIZE],
        }
    }

    #[test]
    fn test_cal_table_interpolates_and_clamps() {
        let cals = [cal(3000.0, 1.0), cal(5000.0, 2.0)];
        assert_eq!(cal_table(2000.0, &cals)[0], 1.0);
        assert_eq!(cal_table(9000.0, &cals)[0], 2.0);
        assert!((cal_table(4000.0, &cals)[7] - 1.5).abs() < 1e-12);
        assert_eq!(cal_table(4000.0, &[]), vec![1.0; TABLE_SIZE]);
    }

    #[test]
    fn test_tables_normalised_to_unit_minimum() {
        let mut lut = vec![2.0; TABLE_SIZE];
        lut[0] = 1.0;
        let params = AlscParams {
            luminance_strength: 0.5,
            calibrations_cr: vec![cal(4000.0, 3.0)],
            calibrations_cb: vec![],
            luminance_lut: lut,
        };
        let [r, g, b] = compute_tables(&params, 4000.0);
        for t in [&r, &g, &b] {
            let min = t.iter().copied().fold(f64::INFINITY, f64::min);
            assert!((min - 1.0).abs() < 1e-12);
        }
        // Half-strength fall-off: 1 + (2 - 1) * 0.5.
        assert!((g[5] - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_uniform_table_resamples_uniform() {
        let ones = vec![1.0; TABLE_SIZE];
        for sensor in [SensorModel::Imx708, SensorModel::Imx219] {
            for mode in sensor.modes() {
                for (hflip, vflip) in [(false, false), (true, true)] {
                    let out = resample_cal_table(&ones, mode, hflip, vflip);
                    assert_eq!(out.len(), TABLE_SIZE);
                    assert!(out.iter().all(|v| (v - 1.0).abs() < 1e-12));

                    let geo = GridGeometry::for_input(mode.width, mode.height).unwrap();
                    let grid = resample_to_grid(&out, geo.width, geo.height);
                    assert_eq!(grid.len(), geo.plane_len());
                    assert!(grid.iter().all(|v| *v == 1024));
                }
            }
        }
    }

    #[test]
    fn test_grid_geometry() {
        let geo = GridGeometry::for_input(1536, 864).unwrap();
        assert_eq!(geo, GridGeometry { cell_size: 32, width: 49, height: 28 });
        let geo = GridGeometry::for_input(4608, 2592).unwrap();
        assert_eq!(geo.cell_size, 128);
        assert!(geo.byte_len() <= MAX_GRID_BYTES);
        assert_eq!(GridGeometry::for_input(100_000, 100_000), None);
    }

    #[test]
    fn test_control_describes_corner_sampled_grid() {
        let geo = GridGeometry::for_input(1536, 864).unwrap();
        let ls = geo.control(7);
        assert_eq!(ls.enabled, 1);
        assert_eq!(ls.corner_sampled, 1);
        assert_eq!(ls.gain_format, GAIN_FORMAT_U4P10);
        assert_eq!(ls.dmabuf, 7);
        assert_eq!((ls.grid_cell_size, ls.grid_width, ls.grid_stride, ls.grid_height), (32, 49, 49, 28));
        // One sample per cell corner, so one more than the cells covering the input.
        assert_eq!(ls.grid_width, 1536u32.div_ceil(ls.grid_cell_size) + 1);
        assert_eq!(ls.grid_height, 864u32.div_ceil(ls.grid_cell_size) + 1);
    }

    #[test]
    fn test_full_array_mode_is_identity_resample() {
        let table: Vec<f64> = (0..TABLE_SIZE).map(|i| 1.0 + i as f64 / 100.0).collect();
        let mode = &SensorModel::Imx708.modes()[0];
        let out = resample_cal_table(&table, mode, false, false);
        for (a, b) in table.iter().zip(&out) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_gain_codes_saturate() {
        let big = vec![40.0; TABLE_SIZE];
        let grid = resample_to_grid(&big, 4, 4);
        assert!(grid.iter().all(|v| *v == 16383));
    }

    #[test]
    fn test_wrong_table_size_rejected() {
        let params = AlscParams {
            calibrations_cr: vec![Calibration {
                ct: 3000.0,
                table: vec![1.0; 10],
            }],
            ..AlscParams::default()
        };
        assert!(params.validate().is_err());
    }
}
