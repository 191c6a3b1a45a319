//! Automatic exposure and gain.
//!
//! Each cycle estimates scene luma from the AGC regions, works out the
//! exposure change that puts it on target, applies histogram constraints and
//! splits the resulting exposure into shutter time and analogue gain by
//! walking the exposure mode's stage table.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::debug;

use super::histogram::Histogram;
use super::pwl::Pwl;
use super::sensor::SensorTiming;
use super::DeviceStatus;
use crate::capture::stats::{Region, Statistics};
use crate::error::SetupError;
use crate::ControlConfig;

/// Bit depth of the statistics pipeline; region sums saturate here.
pub const PIPELINE_BITS: u32 = 13;
const MAX_ITERATIONS: usize = 8;
const MAX_CORRECTION: f64 = 10.0;
/// Corrections within this fraction of unity count as converged.
const TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Deserialize)]
pub struct MeteringMode {
    pub weights: Vec<f64>,
}

/// Shutter times (microseconds) and analogue gains for each stage.
#[derive(Debug, Clone, Deserialize)]
pub struct ExposureMode {
    pub shutter: Vec<f64>,
    pub gain: Vec<f64>,
}

impl ExposureMode {
    /// Stages must pair up and never step backwards in either dimension.
    pub fn validate(&self, name: &str) -> Result<(), SetupError> {
        if self.shutter.is_empty() || self.shutter.len() != self.gain.len() {
            return Err(SetupError::Tuning(format!(
                "exposure mode {name}: {} shutter stages vs {} gain stages",
                self.shutter.len(),
                self.gain.len()
            )));
        }
        let monotone = |v: &[f64]| v.windows(2).all(|w| w[0] <= w[1]);
        if !monotone(&self.shutter) || !monotone(&self.gain) {
            return Err(SetupError::Tuning(format!(
                "exposure mode {name}: stage table is not monotone"
            )));
        }
        if self.shutter[0] <= 0.0 || self.gain[0] <= 0.0 {
            return Err(SetupError::Tuning(format!(
                "exposure mode {name}: first stage must be positive"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Bound {
    Lower,
    Upper,
}

/// Histogram constraint: the mean of the `q_lo..q_hi` quantile band must
/// sit above (LOWER) or below (UPPER) `y_target`.
#[derive(Debug, Clone, Deserialize)]
pub struct Constraint {
    pub bound: Bound,
    pub q_lo: f64,
    pub q_hi: f64,
    pub y_target: Pwl,
}

impl Constraint {
    /// Quantiles must form a non-empty band inside `0..=1`.
    pub fn validate(&self, mode: &str) -> Result<(), SetupError> {
        if !(0.0 <= self.q_lo && self.q_lo < self.q_hi && self.q_hi <= 1.0) {
            return Err(SetupError::Tuning(format!(
                "constraint mode {mode}: quantiles {}..{} out of order or outside 0..1",
                self.q_lo, self.q_hi
            )));
        }
        if self.y_target.is_empty() {
            return Err(SetupError::Tuning(format!("constraint mode {mode}: y_target is empty")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgcParams {
    pub metering_modes: BTreeMap<String, MeteringMode>,
    pub exposure_modes: BTreeMap<String, ExposureMode>,
    #[serde(default)]
    pub constraint_modes: BTreeMap<String, Vec<Constraint>>,
    pub y_target: Pwl,
}

impl AgcParams {
    pub fn validate(&self) -> Result<(), SetupError> {
        if self.exposure_modes.is_empty() {
            return Err(SetupError::Tuning("rpi.agc has no exposure modes".into()));
        }
        for (name, mode) in &self.exposure_modes {
            mode.validate(name)?;
        }
        for (name, constraints) in &self.constraint_modes {
            for c in constraints {
                c.validate(name)?;
            }
        }
        if self.y_target.is_empty() {
            return Err(SetupError::Tuning("rpi.agc y_target is empty".into()));
        }
        Ok(())
    }
}

/// Shutter and analogue gain the AGC wants applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureTarget {
    pub shutter_us: f64,
    pub analogue_gain: f64,
}

impl ExposureTarget {
    pub fn exposure(&self) -> f64 {
        self.shutter_us * self.analogue_gain
    }
}

/// Sensor limits the stage walk must respect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureLimits {
    pub min_shutter_us: f64,
    pub max_shutter_us: f64,
    pub min_gain: f64,
    pub max_gain: f64,
}

impl From<&SensorTiming> for ExposureLimits {
    fn from(t: &SensorTiming) -> Self {
        Self {
            min_shutter_us: t.min_shutter_us(),
            max_shutter_us: t.max_shutter_us(),
            min_gain: t.min_gain(),
            max_gain: t.max_gain(),
        }
    }
}

pub struct Agc {
    weights: Vec<f64>,
    mode: ExposureMode,
    constraints: Vec<Constraint>,
    y_target: f64,
    limits: ExposureLimits,
}

impl Agc {
    pub fn new(
        params: &AgcParams,
        config: &ControlConfig,
        limits: ExposureLimits,
    ) -> Result<Self, SetupError> {
        let metering = params
            .metering_modes
            .get(&config.metering_mode)
            .ok_or_else(|| SetupError::Tuning(format!("no metering mode {}", config.metering_mode)))?;
        let mode = params
            .exposure_modes
            .get(&config.exposure_mode)
            .ok_or_else(|| SetupError::Tuning(format!("no exposure mode {}", config.exposure_mode)))?;
        mode.validate(&config.exposure_mode)?;
        let constraints = params
            .constraint_modes
            .get(&config.constraint_mode)
            .cloned()
            .unwrap_or_default();
        for c in &constraints {
            c.validate(&config.constraint_mode)?;
        }

        // Lux is not fed back, so the target is taken at the darkest
        // breakpoint of the curve.
        let (lux_lo, _) = params.y_target.domain();
        let y_target = params.y_target.eval(lux_lo);

        Ok(Self {
            weights: metering.weights.clone(),
            mode: mode.clone(),
            constraints,
            y_target,
            limits,
        })
    }

    pub fn y_target(&self) -> f64 {
        self.y_target
    }

    pub fn limits(&self) -> ExposureLimits {
        self.limits
    }

    /// Run one cycle. `None` means the current exposure is already on
    /// target and should be left untouched.
    pub fn process(&self, stats: &Statistics, status: &DeviceStatus) -> Option<ExposureTarget> {
        let gain = self.compute_gain(stats, status);
        if (gain - 1.0).abs() <= TOLERANCE {
            return None;
        }

        let current = status.shutter_us * status.analogue_gain;
        let max_exposure = self.limits.max_shutter_us * self.limits.max_gain;
        let exposure = (current * gain).min(max_exposure);
        let target = self.divide_up(exposure);
        debug!(
            gain,
            current,
            exposure,
            shutter_us = target.shutter_us,
            analogue_gain = target.analogue_gain,
            "AGC target"
        );
        Some(target)
    }

    /// Multiplicative exposure change that brings luma to target.
    pub fn compute_gain(&self, stats: &Statistics, status: &DeviceStatus) -> f64 {
        let mut gain = 1.0;
        for _ in 0..MAX_ITERATIONS {
            let y = initial_y(&stats.agc, &self.weights, status, gain);
            let correction = (self.y_target / (y + 0.001)).min(MAX_CORRECTION);
            gain *= correction;
            if (correction - 1.0).abs() <= TOLERANCE {
                break;
            }
        }

        let hist = Histogram::new(stats.green_histogram());
        if hist.total() == 0 {
            return gain;
        }
        for c in &self.constraints {
            let (lux_lo, _) = c.y_target.domain();
            let target = c.y_target.eval(lux_lo);
            let iqm = hist.inter_quantile_mean(c.q_lo, c.q_hi);
            let new_gain = target * hist.bins() as f64 / iqm;
            match c.bound {
                Bound::Lower if new_gain > gain => gain = new_gain,
                Bound::Upper if new_gain < gain => gain = new_gain,
                _ => {}
            }
        }
        gain
    }

    /// Split a total exposure into shutter and gain. Shutter grows first
    /// within each stage, then gain.
    pub fn divide_up(&self, exposure: f64) -> ExposureTarget {
        let limit_shutter = |s: f64| s.clamp(self.limits.min_shutter_us, self.limits.max_shutter_us);
        let limit_gain = |g: f64| g.clamp(self.limits.min_gain, self.limits.max_gain);

        let mut shutter = limit_shutter(self.mode.shutter[0]);
        let mut gain = limit_gain(self.mode.gain[0]);

        if shutter * gain < exposure {
            for stage in 1..self.mode.gain.len() {
                let stage_shutter = limit_shutter(self.mode.shutter[stage]);
                if stage_shutter * gain >= exposure {
                    shutter = limit_shutter(exposure / gain);
                    break;
                }
                shutter = stage_shutter;

                if self.mode.gain[stage] * shutter >= exposure {
                    gain = limit_gain(exposure / shutter);
                    break;
                }
                gain = limit_gain(self.mode.gain[stage]);
            }
        } else {
            shutter = limit_shutter(exposure / gain);
        }

        ExposureTarget {
            shutter_us: shutter,
            analogue_gain: gain,
        }
    }
}

/// Weighted mean luma in `[0, 1]` of the AGC regions after colour gains and
/// an extra trial `gain`, saturating each channel at the pipeline depth.
pub fn initial_y(regions: &[Region], weights: &[f64], status: &DeviceStatus, gain: f64) -> f64 {
    let max_val = f64::from((1u32 << PIPELINE_BITS) - 1);
    let (mut r, mut g, mut b, mut pixels) = (0.0, 0.0, 0.0, 0.0);
    for (region, &w) in regions.iter().zip(weights) {
        if w == 0.0 {
            continue;
        }
        let counted = f64::from(region.counted);
        let cap = max_val * counted;
        r += (region.r_sum as f64 * status.red_gain * gain).min(cap) * w;
        g += (region.g_sum as f64 * gain).min(cap) * w;
        b += (region.b_sum as f64 * status.blue_gain * gain).min(cap) * w;
        pixels += counted * w;
    }
    if pixels == 0.0 {
        return 0.0;
    }
    let y = r * 0.299 + g * 0.587 + b * 0.114;
    y / pixels / f64::from(1u32 << PIPELINE_BITS)
}
