use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use v4l::FourCC;

/// Converted frame handed downstream. Cloning shares the pixel data.
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel data in the layout named by `meta.format`
    pub data: Bytes,

    pub meta: Arc<FrameMetadata>,

    /// When the frame left the capture stage, for latency tracking
    pub timestamp: Instant,
}

#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    /// Driver timestamp of the ISP output buffer
    pub device_timestamp: Option<Duration>,
}

/// Output layouts the capture stage can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Planar YUV 4:2:0, Y then U then V
    Yuv420,
    Yuyv,
    Rgb24,
    Bgr24,
}

impl PixelFormat {
    pub fn fourcc(self) -> FourCC {
        match self {
            Self::Yuv420 => FourCC::new(b"YU12"),
            Self::Yuyv => FourCC::new(b"YUYV"),
            Self::Rgb24 => FourCC::new(b"RGB3"),
            Self::Bgr24 => FourCC::new(b"BGR3"),
        }
    }

    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        [Self::Yuv420, Self::Yuyv, Self::Rgb24, Self::Bgr24]
            .into_iter()
            .find(|f| f.fourcc() == fourcc)
    }

    /// Tightly packed line length in bytes (luma plane for planar formats).
    pub fn stride(self, width: u32) -> u32 {
        match self {
            Self::Yuv420 => width,
            Self::Yuyv => width * 2,
            Self::Rgb24 | Self::Bgr24 => width * 3,
        }
    }

    /// Tightly packed frame size in bytes.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            Self::Yuv420 => w * h + 2 * (w / 2) * (h / 2),
            Self::Yuyv => w * h * 2,
            Self::Rgb24 | Self::Bgr24 => w * h * 3,
        }
    }
}
