//! Sensor-specific control encodings.

use serde::{Deserialize, Serialize};
use v4l::FourCC;

use crate::v4l2::sys::{
    MEDIA_BUS_FMT_SBGGR10_1X10, MEDIA_BUS_FMT_SGBRG10_1X10, MEDIA_BUS_FMT_SGRBG10_1X10,
    MEDIA_BUS_FMT_SRGGB10_1X10,
};
use crate::v4l2::ControlRange;

/// Supported sensor models.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorModel {
    #[default]
    Imx708,
    Imx219,
}

impl SensorModel {
    /// Analogue gain multiplier to the register code the driver expects.
    pub fn gain_code(self, gain: f64) -> i32 {
        let base = self.gain_base();
        (base - base / gain.max(1.0)).round() as i32
    }

    /// Register code back to a gain multiplier.
    pub fn gain(self, code: i32) -> f64 {
        let base = self.gain_base();
        base / (base - f64::from(code)).max(1.0)
    }

    fn gain_base(self) -> f64 {
        match self {
            Self::Imx708 => 1024.0,
            Self::Imx219 => 256.0,
        }
    }

    /// Lines between frame length and the longest allowed exposure.
    pub fn frame_integration_diff(self) -> u32 {
        match self {
            Self::Imx708 => 22,
            Self::Imx219 => 4,
        }
    }

    /// Whether the sensor reports a phase-detect grid in its embedded data.
    pub fn has_pdaf(self) -> bool {
        matches!(self, Self::Imx708)
    }
}

/// Unicam packed pixel format for a 10-bit media-bus code.
pub fn packed_fourcc(mbus_code: u32) -> Option<FourCC> {
    match mbus_code {
        MEDIA_BUS_FMT_SBGGR10_1X10 => Some(FourCC::new(b"pBAA")),
        MEDIA_BUS_FMT_SGBRG10_1X10 => Some(FourCC::new(b"pGAA")),
        MEDIA_BUS_FMT_SGRBG10_1X10 => Some(FourCC::new(b"pgAA")),
        MEDIA_BUS_FMT_SRGGB10_1X10 => Some(FourCC::new(b"pRAA")),
        _ => None,
    }
}

/// Line timing and control ranges read back from the sensor after the mode
/// and blanking are set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorTiming {
    pub model: SensorModel,
    /// Duration of one line in microseconds.
    pub line_us: f64,
    pub exposure: ControlRange,
    pub gain: ControlRange,
}

impl SensorTiming {
    /// Line length from the active width, horizontal blanking and pixel rate.
    pub fn new(
        model: SensorModel,
        width: u32,
        hblank: i32,
        pixel_rate: i64,
        exposure: ControlRange,
        gain: ControlRange,
    ) -> Self {
        let line_pixels = f64::from(width) + f64::from(hblank.max(0));
        let line_us = if pixel_rate > 0 {
            line_pixels * 1e6 / pixel_rate as f64
        } else {
            0.0
        };
        Self {
            model,
            line_us,
            exposure,
            gain,
        }
    }

    pub fn exposure_lines(&self, shutter_us: f64) -> i32 {
        if self.line_us <= 0.0 {
            return self.exposure.minimum;
        }
        self.exposure.clamp((shutter_us / self.line_us).round() as i32)
    }

    pub fn shutter_us(&self, lines: i32) -> f64 {
        f64::from(lines) * self.line_us
    }

    pub fn gain_code(&self, gain: f64) -> i32 {
        self.gain.clamp(self.model.gain_code(gain))
    }

    pub fn min_shutter_us(&self) -> f64 {
        self.shutter_us(self.exposure.minimum)
    }

    pub fn max_shutter_us(&self) -> f64 {
        self.shutter_us(self.exposure.maximum)
    }

    pub fn min_gain(&self) -> f64 {
        self.model.gain(self.gain.minimum)
    }

    pub fn max_gain(&self) -> f64 {
        self.model.gain(self.gain.maximum)
    }
}

/// Vertical blanking that yields `fps` for a mode of `height` lines, given
/// the line length in pixels and the pixel rate.
pub fn vblank_for_fps(pixel_rate: i64, fps: u32, width: u32, hblank: i32, height: u32) -> i32 {
    let line_pixels = i64::from(width) + i64::from(hblank.max(0));
    if fps == 0 || line_pixels == 0 {
        return 0;
    }
    let lines = pixel_rate / i64::from(fps) / line_pixels;
    (lines - i64::from(height)).max(0) as i32
}
