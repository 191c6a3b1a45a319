//! Closed-loop control of the sensor and ISP from per-frame statistics.

pub mod agc;
pub mod alsc;
pub mod awb;
pub mod contrast;
pub mod histogram;
pub mod lux;
pub mod pwl;
pub mod sensor;

use metrics::counter;
use tracing::{debug, warn};

use self::agc::{Agc, ExposureLimits};
use self::awb::ColourGains;
use self::contrast::{gamma_table, Contrast};
use self::histogram::Histogram;
use self::lux::LuxParams;
use self::sensor::SensorTiming;
use crate::capture::stats::Statistics;
use crate::error::{Result, SetupError};
use crate::tuning::Tuning;
use crate::v4l2::sys::bcm2835_isp_gamma;
use crate::ControlConfig;

/// Actuator values currently in effect on the hardware.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceStatus {
    pub shutter_us: f64,
    pub analogue_gain: f64,
    pub exposure_lines: i32,
    pub gain_code: i32,
    pub red_gain: f64,
    pub blue_gain: f64,
    pub vblank: i32,
    pub hflip: bool,
    pub vflip: bool,
    pub lux: f64,
    pub lens_position: Option<i32>,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            shutter_us: 0.0,
            analogue_gain: 1.0,
            exposure_lines: 0,
            gain_code: 0,
            red_gain: 1.0,
            blue_gain: 1.0,
            vblank: 0,
            hflip: false,
            vflip: false,
            lux: 0.0,
            lens_position: None,
        }
    }
}

impl DeviceStatus {
    /// Exposure and gain at the middle of the sensor's control ranges.
    pub fn midpoint(timing: &SensorTiming) -> Self {
        let exposure_lines = timing.exposure.midpoint();
        let gain_code = timing.gain.midpoint();
        Self {
            shutter_us: timing.shutter_us(exposure_lines),
            analogue_gain: timing.model.gain(gain_code),
            exposure_lines,
            gain_code,
            ..Self::default()
        }
    }
}

/// Where control decisions land. The capture session writes these as V4L2
/// controls; tests record them.
pub trait Actuators {
    fn set_exposure(&mut self, lines: i32, gain_code: i32) -> Result<()>;
    fn set_colour_gains(&mut self, gains: ColourGains) -> Result<()>;
    fn set_gamma(&mut self, gamma: &mut bcm2835_isp_gamma) -> Result<()>;
    fn set_lens(&mut self, position: i32) -> Result<()>;
}

/// Runs lux, AWB, AGC and contrast on each statistics block, each at its
/// own cadence.
pub struct Controller {
    timing: SensorTiming,
    agc: Option<Agc>,
    awb_enabled: bool,
    contrast: Option<Contrast>,
    lux: LuxParams,
    agc_period: u64,
    awb_period: u64,
    contrast_period: u64,
    cycle: u64,
    status: DeviceStatus,
}

impl Controller {
    pub fn new(
        timing: SensorTiming,
        tuning: &Tuning,
        config: &ControlConfig,
        status: DeviceStatus,
    ) -> std::result::Result<Self, SetupError> {
        let agc = match (&tuning.agc, config.agc_enabled) {
            (Some(params), true) => Some(Agc::new(params, config, ExposureLimits::from(&timing))?),
            (None, true) => {
                return Err(SetupError::Tuning("AGC enabled but rpi.agc is missing".into()))
            }
            (_, false) => None,
        };
        let contrast = match (&tuning.contrast, config.contrast_enabled) {
            (Some(params), true) => Some(Contrast::new(
                params.clone(),
                config.ce_enable,
                config.brightness,
                config.contrast,
            )),
            (None, true) => {
                debug!("no rpi.contrast section, gamma left at driver default");
                None
            }
            (_, false) => None,
        };

        Ok(Self {
            timing,
            agc,
            awb_enabled: config.awb_enabled,
            contrast,
            lux: tuning.lux.clone(),
            agc_period: u64::from(config.agc_period.max(1)),
            awb_period: u64::from(config.awb_period.max(1)),
            contrast_period: u64::from(config.contrast_period.max(1)),
            cycle: 0,
            status,
        })
    }

    pub fn status(&self) -> &DeviceStatus {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut DeviceStatus {
        &mut self.status
    }

    pub fn timing(&self) -> &SensorTiming {
        &self.timing
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// One control cycle. Rejected control writes keep the previous
    /// actuator values; any other failure is returned.
    pub fn process<A: Actuators>(&mut self, stats: &Statistics, actuators: &mut A) -> Result<()> {
        let cycle = self.cycle;
        self.cycle += 1;
        counter!("control_cycles").increment(1);

        let hist = Histogram::new(stats.green_histogram());
        self.status.lux = lux::estimate(&self.lux, &hist, &self.status, 1.0);

        if self.awb_enabled && cycle % self.awb_period == 0 {
            if let Some(gains) = awb::process(&stats.awb) {
                if applied(actuators.set_colour_gains(gains))? {
                    self.status.red_gain = gains.red;
                    self.status.blue_gain = gains.blue;
                }
            }
        }

        if cycle % self.agc_period == 0 {
            let target = self.agc.as_ref().and_then(|agc| agc.process(stats, &self.status));
            if let Some(target) = target {
                let lines = self.timing.exposure_lines(target.shutter_us);
                let code = self.timing.gain_code(target.analogue_gain);
                if applied(actuators.set_exposure(lines, code))? {
                    self.status.exposure_lines = lines;
                    self.status.gain_code = code;
                    self.status.shutter_us = self.timing.shutter_us(lines);
                    self.status.analogue_gain = self.timing.model.gain(code);
                }
            }
        }

        if let Some(contrast) = &self.contrast {
            if cycle % self.contrast_period == 0 {
                let mut table = gamma_table(&contrast.process(&hist));
                applied(actuators.set_gamma(&mut table))?;
            }
        }

        debug!(
            cycle,
            shutter_us = self.status.shutter_us,
            gain = self.status.analogue_gain,
            red = self.status.red_gain,
            blue = self.status.blue_gain,
            lux = self.status.lux,
            "control cycle"
        );
        Ok(())
    }
}

/// `Ok(false)` for a write the driver rejected but the loop can skip.
pub(crate) fn applied(result: Result<()>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_recoverable() => {
            warn!(error = %e, "control write rejected, keeping previous values");
            counter!("control_write_failures").increment(1);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use nix::errno::Errno;

    use super::*;
    use crate::capture::stats::Region;
    use crate::control::sensor::SensorModel;
    use crate::error::Error;
    use crate::v4l2::ControlRange;

    #[derive(Default)]
    struct Recorder {
        exposures: Vec<(i32, i32)>,
        gains: Vec<ColourGains>,
        gammas: usize,
        reject: bool,
    }

    impl Recorder {
        fn check(&self) -> Result<()> {
            if self.reject {
                Err(Error::HardwareControl {
                    node: "isp".into(),
                    id: 0,
                    source: Errno::EINVAL,
                })
            } else {
                Ok(())
            }
        }
    }

    impl Actuators for Recorder {
        fn set_exposure(&mut self, lines: i32, gain_code: i32) -> Result<()> {
            self.check()?;
            self.exposures.push((lines, gain_code));
            Ok(())
        }
        fn set_colour_gains(&mut self, gains: ColourGains) -> Result<()> {
            self.check()?;
            self.gains.push(gains);
            Ok(())
        }
        fn set_gamma(&mut self, _gamma: &mut bcm2835_isp_gamma) -> Result<()> {
            self.check()?;
            self.gammas += 1;
            Ok(())
        }
        fn set_lens(&mut self, _position: i32) -> Result<()> {
            self.check()
        }
    }

    fn timing() -> SensorTiming {
        let range = |minimum, maximum| ControlRange {
            minimum,
            maximum,
            step: 1,
            default: minimum,
        };
        SensorTiming::new(
            SensorModel::Imx708,
            1536,
            7000,
            853_333_333,
            range(8, 4000),
            range(112, 960),
        )
    }

    fn tuning() -> Tuning {
        Tuning::from_str(
            r#"{"version": 2.0, "algorithms": [
                {"rpi.agc": {
                    "metering_modes": {"centre-weighted": {"weights": [1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1]}},
                    "exposure_modes": {"normal": {"shutter": [100, 10000, 30000], "gain": [1.0, 2.0, 4.0]}},
                    "y_target": [0, 0.16, 1000, 0.16]
                }}
            ]}"#,
        )
        .unwrap()
    }

    fn dark_stats() -> Statistics {
        let mut stats = Statistics::default();
        let region = Region {
            counted: 1000,
            notcounted: 0,
            r_sum: 400_000,
            g_sum: 800_000,
            b_sum: 200_000,
        };
        stats.agc.fill(region);
        stats.awb.fill(region);
        stats
    }

    #[test]
    fn test_midpoint_status() {
        let t = timing();
        let status = DeviceStatus::midpoint(&t);
        assert_eq!(status.exposure_lines, (8 + 4000) / 2);
        assert_eq!(status.gain_code, (112 + 960) / 2);
        assert_eq!(status.red_gain, 1.0);
    }

    #[test]
    fn test_cycle_writes_quantised_actuators() {
        let t = timing();
        let config = ControlConfig::default();
        let mut ctrl = Controller::new(t, &tuning(), &config, DeviceStatus::midpoint(&t)).unwrap();
        let mut rec = Recorder::default();
        ctrl.process(&dark_stats(), &mut rec).unwrap();

        assert_eq!(rec.gains.len(), 1);
        assert!((rec.gains[0].red - 2.0).abs() < 0.01);
        assert_eq!(rec.exposures.len(), 1);
        let (lines, code) = rec.exposures[0];
        let status = ctrl.status();
        assert_eq!(status.exposure_lines, lines);
        assert_eq!(status.gain_code, code);
        assert_eq!(status.shutter_us, t.shutter_us(lines));
        assert_eq!(status.red_gain, rec.gains[0].red);
    }

    #[test]
    fn test_rejected_write_keeps_previous_values() {
        let t = timing();
        let initial = DeviceStatus::midpoint(&t);
        let mut ctrl = Controller::new(t, &tuning(), &ControlConfig::default(), initial).unwrap();
        let mut rec = Recorder {
            reject: true,
            ..Recorder::default()
        };
        ctrl.process(&dark_stats(), &mut rec).unwrap();
        assert_eq!(ctrl.status().exposure_lines, initial.exposure_lines);
        assert_eq!(ctrl.status().red_gain, 1.0);
        assert_eq!(ctrl.cycle(), 1);
    }

    #[test]
    fn test_periods_skip_cycles() {
        let t = timing();
        let config = ControlConfig {
            awb_period: 3,
            ..ControlConfig::default()
        };
        let mut ctrl = Controller::new(t, &tuning(), &config, DeviceStatus::midpoint(&t)).unwrap();
        let mut rec = Recorder::default();
        for _ in 0..6 {
            ctrl.process(&dark_stats(), &mut rec).unwrap();
        }
        assert_eq!(rec.gains.len(), 2);
    }

    #[test]
    fn test_agc_without_tuning_fails_setup() {
        let t = timing();
        let err = Controller::new(t, &Tuning::default(), &ControlConfig::default(), DeviceStatus::default());
        assert!(err.is_err());
        let config = ControlConfig {
            agc_enabled: false,
            ..ControlConfig::default()
        };
        assert!(Controller::new(t, &Tuning::default(), &config, DeviceStatus::default()).is_ok());
    }
}
