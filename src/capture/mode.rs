//! Sensor readout modes and how they map onto the physical pixel array.

use crate::control::sensor::SensorModel;
use crate::error::SetupError;
use crate::v4l2::sys::v4l2_rect;

/// One readout mode. Geometry is fixed once a mode is chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraMode {
    pub width: u32,
    pub height: u32,
    /// Full pixel array.
    pub sensor_width: u32,
    pub sensor_height: u32,
    /// Top-left of the read-out area on the pixel array.
    pub crop_x: u32,
    pub crop_y: u32,
    /// Sensor pixels per output pixel (binning).
    pub scale_x: f64,
    pub scale_y: f64,
    pub max_fps: f64,
}

const fn mode(
    width: u32,
    height: u32,
    sensor: (u32, u32),
    crop: (u32, u32),
    scale: f64,
    max_fps: f64,
) -> CameraMode {
    CameraMode {
        width,
        height,
        sensor_width: sensor.0,
        sensor_height: sensor.1,
        crop_x: crop.0,
        crop_y: crop.1,
        scale_x: scale,
        scale_y: scale,
        max_fps,
    }
}

const IMX708_ARRAY: (u32, u32) = (4608, 2592);
const IMX219_ARRAY: (u32, u32) = (3280, 2464);

static IMX708_MODES: [CameraMode; 3] = [
    mode(4608, 2592, IMX708_ARRAY, (0, 0), 1.0, 14.35),
    mode(2304, 1296, IMX708_ARRAY, (0, 0), 2.0, 56.03),
    mode(1536, 864, IMX708_ARRAY, (768, 432), 2.0, 120.13),
];

static IMX219_MODES: [CameraMode; 4] = [
    mode(3280, 2464, IMX219_ARRAY, (0, 0), 1.0, 21.19),
    mode(1920, 1080, IMX219_ARRAY, (680, 692), 1.0, 47.57),
    mode(1640, 1232, IMX219_ARRAY, (0, 0), 2.0, 41.85),
    mode(640, 480, IMX219_ARRAY, (1000, 752), 2.0, 206.65),
];

impl SensorModel {
    pub fn modes(self) -> &'static [CameraMode] {
        match self {
            Self::Imx708 => &IMX708_MODES,
            Self::Imx219 => &IMX219_MODES,
        }
    }
}

impl CameraMode {
    /// Smallest mode that covers `width`x`height` and can run at `fps`.
    pub fn select(
        sensor: SensorModel,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<CameraMode, SetupError> {
        sensor
            .modes()
            .iter()
            .filter(|m| m.width >= width && m.height >= height && m.max_fps >= f64::from(fps))
            .min_by(|a, b| {
                let area = |m: &CameraMode| u64::from(m.width) * u64::from(m.height);
                area(a)
                    .cmp(&area(b))
                    .then(b.max_fps.total_cmp(&a.max_fps))
            })
            .copied()
            .ok_or(SetupError::NoCameraMode { width, height, fps })
    }

    /// Centered crop of the mode that has the aspect ratio of the output.
    /// Offsets and sizes stay even to keep the Bayer phase.
    pub fn aspect_crop(&self, out_width: u32, out_height: u32) -> v4l2_rect {
        let (w, h) = (u64::from(self.width), u64::from(self.height));
        let (ow, oh) = (u64::from(out_width.max(1)), u64::from(out_height.max(1)));
        let (cw, ch) = if w * oh > h * ow {
            ((h * ow / oh) & !1, h)
        } else {
            (w, (w * oh / ow) & !1)
        };
        v4l2_rect {
            left: (((w - cw) / 2) & !1) as i32,
            top: (((h - ch) / 2) & !1) as i32,
            width: cw as u32,
            height: ch as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_mode_selects_something_at_least_as_large() {
        for sensor in [SensorModel::Imx708, SensorModel::Imx219] {
            for m in sensor.modes() {
                let fps = m.max_fps.floor() as u32;
                let chosen = CameraMode::select(sensor, m.width, m.height, fps).unwrap();
                assert!(chosen.width >= m.width && chosen.height >= m.height);
                assert!(chosen.max_fps >= f64::from(fps));
            }
        }
    }

    #[test]
    fn test_select_prefers_smallest_covering_mode() {
        let m = CameraMode::select(SensorModel::Imx708, 640, 480, 30).unwrap();
        assert_eq!((m.width, m.height), (1536, 864));
        let m = CameraMode::select(SensorModel::Imx219, 640, 480, 30).unwrap();
        assert_eq!((m.width, m.height), (640, 480));
    }

    #[test]
    fn test_select_rejects_impossible_requests() {
        let err = CameraMode::select(SensorModel::Imx708, 4608, 2592, 60).unwrap_err();
        assert!(matches!(err, SetupError::NoCameraMode { fps: 60, .. }));
        assert!(CameraMode::select(SensorModel::Imx219, 8000, 6000, 1).is_err());
    }

    #[test]
    fn test_aspect_crop() {
        let m = CameraMode::select(SensorModel::Imx708, 1536, 864, 30).unwrap();
        let crop = m.aspect_crop(640, 480);
        assert_eq!((crop.width, crop.height), (1152, 864));
        assert_eq!((crop.left, crop.top), (192, 0));
        let same = m.aspect_crop(1536, 864);
        assert_eq!((same.left, same.top, same.width, same.height), (0, 0, 1536, 864));
    }
}
