//! Gamma curve, adaptive contrast stretch and manual brightness/contrast.

use serde::Deserialize;

use super::histogram::Histogram;
use super::pwl::Pwl;
use crate::v4l2::sys::{bcm2835_isp_gamma, GAMMA_POINTS};

fn default_lo_histogram() -> f64 {
    0.01
}
fn default_lo_level() -> f64 {
    0.015
}
fn default_lo_max() -> f64 {
    500.0
}
fn default_hi_histogram() -> f64 {
    0.95
}
fn default_hi_level() -> f64 {
    0.95
}
fn default_hi_max() -> f64 {
    2000.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContrastParams {
    #[serde(default)]
    pub ce_enable: u32,
    #[serde(default = "default_lo_histogram")]
    pub lo_histogram: f64,
    #[serde(default = "default_lo_level")]
    pub lo_level: f64,
    #[serde(default = "default_lo_max")]
    pub lo_max: f64,
    #[serde(default = "default_hi_histogram")]
    pub hi_histogram: f64,
    #[serde(default = "default_hi_level")]
    pub hi_level: f64,
    #[serde(default = "default_hi_max")]
    pub hi_max: f64,
    pub gamma_curve: Pwl,
}

/// Stretch curve from histogram quantiles: lift a sparse low end, pull down
/// a sparse high end, keep the median in place.
pub fn compute_stretch_curve(hist: &Histogram, params: &ContrastParams) -> Pwl {
    let scale = 65536.0 / hist.bins() as f64;
    let mut enhance = Pwl::new();
    enhance.append(0.0, 0.0);

    let level_lo = params.lo_level * 65536.0;
    let hist_lo = (hist.quantile(params.lo_histogram) * scale)
        .min(level_lo + params.lo_max)
        .min(65535.0)
        .max(level_lo);
    enhance.append(hist_lo, level_lo);

    let mid = hist.quantile(0.5) * scale;
    enhance.append(mid, mid);

    let level_hi = params.hi_level * 65536.0;
    let hist_hi = (hist.quantile(params.hi_histogram) * scale)
        .max(level_hi - params.hi_max)
        .max(0.0)
        .min(level_hi);
    enhance.append(hist_hi, level_hi);

    enhance.append(65535.0, 65535.0);
    enhance
}

/// `y' = (y - 32768) * contrast + 32768 + brightness`, clamped to 16 bits.
pub fn apply_manual_contrast(curve: &Pwl, brightness: f64, contrast: f64) -> Pwl {
    let mut out = Pwl::new();
    curve.map(|x, y| {
        out.append(
            x,
            ((y - 32768.0) * contrast + 32768.0 + brightness).clamp(0.0, 65535.0),
        );
    });
    out
}

pub struct Contrast {
    params: ContrastParams,
    ce_enable: bool,
    brightness: f64,
    contrast: f64,
}

impl Contrast {
    pub fn new(params: ContrastParams, ce_enable: bool, brightness: f64, contrast: f64) -> Self {
        let ce_enable = ce_enable && params.ce_enable != 0;
        Self {
            params,
            ce_enable,
            brightness,
            contrast,
        }
    }

    /// Gamma curve for this frame's histogram.
    pub fn process(&self, hist: &Histogram) -> Pwl {
        let mut curve = self.params.gamma_curve.clone();
        if self.ce_enable
            && hist.total() > 0
            && (self.params.lo_max != 0.0 || self.params.hi_max != 0.0)
        {
            curve = compute_stretch_curve(hist, &self.params).compose(&curve);
        }
        if self.brightness != 0.0 || self.contrast != 1.0 {
            curve = apply_manual_contrast(&curve, self.brightness, self.contrast);
        }
        curve
    }
}

/// Sample `curve` at the ISP's fixed gamma knots: dense in the shadows,
/// sparse in the highlights, with the last knot pinned to full scale.
pub fn gamma_table(curve: &Pwl) -> bcm2835_isp_gamma {
    let mut gamma = bcm2835_isp_gamma {
        enabled: 1,
        x: [0; GAMMA_POINTS],
        y: [0; GAMMA_POINTS],
    };
    for i in 0..GAMMA_POINTS - 1 {
        let x = if i < 16 {
            i * 1024
        } else if i < 24 {
            (i - 16) * 2048 + 16384
        } else {
            (i - 24) * 4096 + 32768
        };
        gamma.x[i] = x as u16;
        gamma.y[i] = curve.eval(x as f64).clamp(0.0, 65535.0) as u16;
    }
    gamma.x[GAMMA_POINTS - 1] = 65535;
    gamma.y[GAMMA_POINTS - 1] = 65535;
    gamma
}
