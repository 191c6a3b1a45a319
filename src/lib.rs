pub mod autofocus;
pub mod capture;
pub mod control;
pub mod error;
pub mod pipeline;
pub mod tuning;
pub mod utils;
pub mod v4l2;

use std::path::{Path, PathBuf};

use capture::frame::PixelFormat;
use config::{Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::autofocus::{AfMode, AfRange, AfSpeed};
use crate::control::sensor::SensorModel;
use crate::error::Result;

/// Session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sensor: SensorModel,
    /// libcamera-style JSON tuning for the sensor
    pub tuning_file: Option<PathBuf>,
    pub capture: CaptureConfig,
    pub control: ControlConfig,
    pub autofocus: AutofocusConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub unicam: String,
    /// Sensor embedded data, only read for PDAF sensors
    pub unicam_meta: Option<String>,
    pub sensor_subdev: String,
    pub lens_subdev: Option<String>,
    pub isp_in: String,
    pub isp_out: String,
    pub isp_stats: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub raw_buffers: u32,
    pub output_buffers: u32,
    pub stats_buffers: u32,
    pub hflip: bool,
    pub vflip: bool,
    /// Longest wait for any node to become ready before giving up
    pub timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            unicam: "/dev/video0".into(),
            unicam_meta: None,
            sensor_subdev: "/dev/v4l-subdev0".into(),
            lens_subdev: None,
            isp_in: "/dev/video13".into(),
            isp_out: "/dev/video14".into(),
            isp_stats: "/dev/video16".into(),
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Yuv420,
            raw_buffers: 4,
            output_buffers: 4,
            stats_buffers: 2,
            hflip: false,
            vflip: false,
            timeout_ms: 1000,
        }
    }
}

/// Which algorithms run, how often, and their manual inputs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub agc_enabled: bool,
    pub awb_enabled: bool,
    pub contrast_enabled: bool,
    /// Run every Nth statistics block
    pub agc_period: u32,
    pub awb_period: u32,
    pub contrast_period: u32,
    /// Kelvin used to pick the lens shading tables
    pub colour_temperature: f64,
    pub brightness: f64,
    pub contrast: f64,
    pub ce_enable: bool,
    pub exposure_mode: String,
    pub metering_mode: String,
    pub constraint_mode: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            agc_enabled: true,
            awb_enabled: true,
            contrast_enabled: true,
            agc_period: 1,
            awb_period: 1,
            contrast_period: 1,
            colour_temperature: 4500.0,
            brightness: 0.0,
            contrast: 1.0,
            ce_enable: true,
            exposure_mode: "normal".into(),
            metering_mode: "centre-weighted".into(),
            constraint_mode: "normal".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutofocusConfig {
    pub enabled: bool,
    pub mode: AfMode,
    pub range: AfRange,
    pub speed: AfSpeed,
    /// `[x1, y1, x2, y2]` in output pixels
    pub windows: Vec<[f64; 4]>,
}

impl Default for AutofocusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: AfMode::default(),
            range: AfRange::default(),
            speed: AfSpeed::default(),
            windows: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_size: usize,
    pub handoff_timeout_ms: u64,
    /// Timed send attempts before the oldest queued frame is discarded
    pub handoff_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_size: 4,
            handoff_timeout_ms: 10,
            handoff_retries: 3,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file if given, then `ISP_CAPTURE__*` variables.
    #[instrument]
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config: Config = builder
            .add_source(
                Environment::with_prefix("ISP_CAPTURE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        debug!(?config, "Configuration loaded");
        Ok(config)
    }
}
