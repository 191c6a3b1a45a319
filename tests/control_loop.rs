//! Control loop driven end to end with synthetic statistics and a simulated
//! scene whose brightness follows the applied exposure.

use isp_capture::capture::stats::{Region, Statistics};
use isp_capture::control::awb::ColourGains;
use isp_capture::control::sensor::{SensorModel, SensorTiming};
use isp_capture::control::{Actuators, Controller, DeviceStatus};
use isp_capture::error::Result;
use isp_capture::tuning::Tuning;
use isp_capture::v4l2::sys::bcm2835_isp_gamma;
use isp_capture::v4l2::ControlRange;
use isp_capture::ControlConfig;

const PIPELINE_SCALE: f64 = 8192.0;
const PIXELS: u32 = 1000;

#[derive(Default)]
struct Recorder {
    exposures: Vec<(i32, i32)>,
    gains: Vec<ColourGains>,
}

impl Actuators for Recorder {
    fn set_exposure(&mut self, lines: i32, gain_code: i32) -> Result<()> {
        self.exposures.push((lines, gain_code));
        Ok(())
    }
    fn set_colour_gains(&mut self, gains: ColourGains) -> Result<()> {
        self.gains.push(gains);
        Ok(())
    }
    fn set_gamma(&mut self, _gamma: &mut bcm2835_isp_gamma) -> Result<()> {
        Ok(())
    }
    fn set_lens(&mut self, _position: i32) -> Result<()> {
        Ok(())
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

fn tuning(y_target: f64) -> Tuning {
    tuning_with_constraints(y_target, "")
}

fn tuning_with_constraints(y_target: f64, constraints: &str) -> Tuning {
    Tuning::from_str(&format!(
        r#"{{"version": 2.0, "algorithms": [
            {{"rpi.black_level": {{"black_level": 4096}}}},
            {{"rpi.agc": {{
                "metering_modes": {{"centre-weighted": {{"weights": [1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1]}}}},
                "exposure_modes": {{"normal": {{"shutter": [100, 10000, 30000], "gain": [1.0, 2.0, 4.0]}}}},
                "constraint_modes": {{"normal": [{constraints}]}},
                "y_target": [0, {y_target}, 1000, {y_target}]
            }}}}
        ]}}"#
    ))
    .unwrap()
}

/// Uniform grey statistics at luma `y`, with `rb` scaling red against blue.
fn scene(y: f64, red: f64, blue: f64) -> Statistics {
    let sum = |scale: f64| (y * scale * PIPELINE_SCALE * f64::from(PIXELS)) as u64;
    let region = Region {
        counted: PIXELS,
        notcounted: 0,
        r_sum: sum(red),
        g_sum: sum(1.0),
        b_sum: sum(blue),
    };
    let mut stats = Statistics::default();
    stats.agc.fill(region);
    stats.awb.fill(region);
    stats
}

fn controller(y_target: f64) -> Controller {
    controller_for(&tuning(y_target))
}

fn controller_for(tuning: &Tuning) -> Controller {
    let t = timing();
    Controller::new(t, tuning, &ControlConfig::default(), DeviceStatus::midpoint(&t)).unwrap()
}

#[test]
fn test_steady_scene_holds_actuators() {
    let mut ctrl = controller(0.5);
    let initial = *ctrl.status();
    let mut rec = Recorder::default();
    for _ in 0..20 {
        ctrl.process(&scene(0.5, 1.0, 1.0), &mut rec).unwrap();
    }
    assert!(rec.exposures.is_empty());
    assert_eq!(ctrl.status().exposure_lines, initial.exposure_lines);
    assert_eq!(ctrl.status().gain_code, initial.gain_code);
    assert!((ctrl.status().red_gain - 1.0).abs() < 1e-6);
    assert!((ctrl.status().blue_gain - 1.0).abs() < 1e-6);
    assert_eq!(ctrl.cycle(), 20);
}

#[test]
fn test_histogram_on_target_holds_from_second_cycle() {
    // Highlights sit at bin 64 of 128, so a LOWER bound at half scale is met.
    let lower = r#"{"bound": "LOWER", "q_lo": 0.98, "q_hi": 1.0, "y_target": [0, 0.5, 1000, 0.5]}"#;
    let mut ctrl = controller_for(&tuning_with_constraints(0.5, lower));
    let mut rec = Recorder::default();
    let exposure = |s: &DeviceStatus| s.shutter_us * s.analogue_gain;
    // Scene luma follows the applied exposure and starts a little under target.
    let scale = exposure(ctrl.status()) / 0.4;
    let step = |ctrl: &mut Controller, rec: &mut Recorder| {
        let mut stats = scene((exposure(ctrl.status()) / scale).min(1.0), 1.0, 1.0);
        stats.histograms[0].g[64] = PIXELS;
        ctrl.process(&stats, rec).unwrap();
    };

    step(&mut ctrl, &mut rec);
    assert_eq!(rec.exposures.len(), 1);
    let settled = (ctrl.status().exposure_lines, ctrl.status().gain_code);
    assert_eq!(rec.exposures[0], settled);

    for _ in 2..=20 {
        step(&mut ctrl, &mut rec);
        assert_eq!((ctrl.status().exposure_lines, ctrl.status().gain_code), settled);
    }
    assert!(rec.exposures.iter().all(|&e| e == settled));
    assert_eq!(ctrl.cycle(), 20);
}

#[test]
fn test_dark_scene_converges_and_settles() {
    let mut ctrl = controller(0.16);
    let mut rec = Recorder::default();
    let brightness = |s: &DeviceStatus| (s.shutter_us * s.analogue_gain / 400_000.0).min(1.0);

    let start = brightness(ctrl.status());
    assert!(start < 0.12);
    for _ in 0..10 {
        let y = brightness(ctrl.status());
        ctrl.process(&scene(y, 1.0, 1.0), &mut rec).unwrap();
    }
    let y = brightness(ctrl.status());
    assert!((y - 0.16).abs() < 0.005, "luma {y}");

    let writes = rec.exposures.len();
    for _ in 0..10 {
        let y = brightness(ctrl.status());
        ctrl.process(&scene(y, 1.0, 1.0), &mut rec).unwrap();
    }
    assert_eq!(rec.exposures.len(), writes);
    // Every write is what the status reports afterwards.
    let (lines, code) = *rec.exposures.last().unwrap();
    assert_eq!(ctrl.status().exposure_lines, lines);
    assert_eq!(ctrl.status().gain_code, code);
}

#[test]
fn test_brighter_scene_never_raises_exposure() {
    let mut last = f64::MAX;
    for y in [0.05, 0.1, 0.2, 0.4, 0.8] {
        let mut ctrl = controller(0.16);
        let mut rec = Recorder::default();
        ctrl.process(&scene(y, 1.0, 1.0), &mut rec).unwrap();
        let s = ctrl.status();
        let exposure = s.shutter_us * s.analogue_gain;
        assert!(exposure <= last, "exposure rose at y={y}");
        last = exposure;
    }
}

#[test]
fn test_colour_cast_swaps_with_channels() {
    let mut warm = controller(0.5);
    let mut cool = controller(0.5);
    let mut rec = Recorder::default();
    warm.process(&scene(0.4, 1.6, 0.7), &mut rec).unwrap();
    cool.process(&scene(0.4, 0.7, 1.6), &mut rec).unwrap();

    let (w, c) = (warm.status(), cool.status());
    assert!(w.red_gain < 1.0 && w.blue_gain > 1.0);
    assert!((w.red_gain - c.blue_gain).abs() < 1e-6);
    assert!((w.blue_gain - c.red_gain).abs() < 1e-6);
}
