//! ISP output to the layout the pipeline asked for.
//!
//! The ISP already scales; what remains is a centre crop when the driver
//! rounded the output up, and YUV to packed RGB when the consumer wants RGB.

use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use metrics::histogram;

use super::frame::PixelFormat;
use crate::error::{Error, Result, SetupError};
use crate::v4l2::Format;

/// A conversion probed once at setup and then applied to every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Converter {
    source: Format,
    layout: PixelFormat,
    target: PixelFormat,
    width: u32,
    height: u32,
    left: u32,
    top: u32,
}

impl Converter {
    /// Check that `source` can become `width`x`height` in `target`.
    pub fn try_convert(
        source: &Format,
        width: u32,
        height: u32,
        target: PixelFormat,
    ) -> std::result::Result<Self, SetupError> {
        let unsupported = || SetupError::UnsupportedConversion {
            from: source.to_string(),
            to: Format::new(width, height, target.fourcc()).to_string(),
        };
        let layout = PixelFormat::from_fourcc(source.fourcc).ok_or_else(unsupported)?;
        let rgb_out = matches!(target, PixelFormat::Rgb24 | PixelFormat::Bgr24);
        if target != layout && !rgb_out {
            return Err(unsupported());
        }
        if width == 0 || height == 0 || width > source.width || height > source.height {
            return Err(unsupported());
        }
        // Chroma planes are laid out for even source dimensions.
        let odd_source = match layout {
            PixelFormat::Yuv420 => source.width % 2 != 0 || source.height % 2 != 0,
            PixelFormat::Yuyv => source.width % 2 != 0,
            _ => false,
        };
        if odd_source {
            return Err(unsupported());
        }
        let subsampled = matches!(layout, PixelFormat::Yuv420 | PixelFormat::Yuyv);
        if subsampled && target == layout && (width % 2 != 0 || height % 2 != 0) {
            return Err(unsupported());
        }

        let mut source = *source;
        if source.bytes_per_line == 0 {
            source.bytes_per_line = layout.stride(source.width);
        }
        Ok(Self {
            source,
            layout,
            target,
            width,
            height,
            left: ((source.width - width) / 2) & !1,
            top: ((source.height - height) / 2) & !1,
        })
    }

    pub fn output(&self) -> Format {
        Format {
            width: self.width,
            height: self.height,
            fourcc: self.target.fourcc(),
            bytes_per_line: self.target.stride(self.width),
            size_image: self.target.frame_size(self.width, self.height) as u32,
        }
    }

    pub fn target(&self) -> PixelFormat {
        self.target
    }

    fn source_len(&self) -> usize {
        let bpl = self.source.bytes_per_line as usize;
        let h = self.source.height as usize;
        match self.layout {
            PixelFormat::Yuv420 => bpl * h + 2 * (bpl / 2) * (h / 2),
            _ => bpl * h,
        }
    }

    /// Convert one frame into a newly allocated buffer.
    pub fn convert(&self, data: &[u8]) -> Result<Bytes> {
        let start = Instant::now();
        let expected = self.source_len();
        if data.len() < expected {
            return Err(Error::ShortFrame {
                expected,
                actual: data.len(),
            });
        }

        let mut out = BytesMut::with_capacity(self.target.frame_size(self.width, self.height));
        if self.target == self.layout {
            self.crop(data, &mut out);
        } else {
            self.to_rgb(data, &mut out);
        }

        histogram!("convert_time_us").record(start.elapsed().as_micros() as f64);
        Ok(out.freeze())
    }

    fn crop(&self, data: &[u8], out: &mut BytesMut) {
        let bpl = self.source.bytes_per_line as usize;
        let (w, h) = (self.width as usize, self.height as usize);
        let (left, top) = (self.left as usize, self.top as usize);
        let bytes_pp = match self.layout {
            PixelFormat::Yuv420 => 1,
            PixelFormat::Yuyv => 2,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
        };
        copy_plane(out, data, bpl, left * bytes_pp, top, w * bytes_pp, h);

        if self.layout == PixelFormat::Yuv420 {
            let luma = bpl * self.source.height as usize;
            let chroma_bpl = bpl / 2;
            let chroma = chroma_bpl * (self.source.height as usize / 2);
            for plane in [&data[luma..luma + chroma], &data[luma + chroma..luma + 2 * chroma]] {
                copy_plane(out, plane, chroma_bpl, left / 2, top / 2, w / 2, h / 2);
            }
        }
    }

    fn to_rgb(&self, data: &[u8], out: &mut BytesMut) {
        let bpl = self.source.bytes_per_line as usize;
        let luma = bpl * self.source.height as usize;
        let chroma = (bpl / 2) * (self.source.height as usize / 2);
        let swap = self.target == PixelFormat::Bgr24;

        for row in 0..self.height as usize {
            let y = row + self.top as usize;
            for col in 0..self.width as usize {
                let x = col + self.left as usize;
                let (r, g, b) = match self.layout {
                    PixelFormat::Yuv420 => {
                        let c = (y / 2) * (bpl / 2) + x / 2;
                        yuv_to_rgb(data[y * bpl + x], data[luma + c], data[luma + chroma + c])
                    }
                    PixelFormat::Yuyv => {
                        let pair = y * bpl + (x / 2) * 4;
                        let luma = data[pair + (x % 2) * 2];
                        yuv_to_rgb(luma, data[pair + 1], data[pair + 3])
                    }
                    PixelFormat::Rgb24 => {
                        let p = y * bpl + x * 3;
                        (data[p], data[p + 1], data[p + 2])
                    }
                    PixelFormat::Bgr24 => {
                        let p = y * bpl + x * 3;
                        (data[p + 2], data[p + 1], data[p])
                    }
                };
                if swap {
                    out.put_slice(&[b, g, r]);
                } else {
                    out.put_slice(&[r, g, b]);
                }
            }
        }
    }
}

fn copy_plane(
    out: &mut BytesMut,
    plane: &[u8],
    stride: usize,
    left: usize,
    top: usize,
    width: usize,
    height: usize,
) {
    for row in top..top + height {
        let start = row * stride + left;
        out.put_slice(&plane[start..start + width]);
    }
}

/// Full-range BT.601, 16.16 fixed point.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y = i32::from(y);
    let u = i32::from(u) - 128;
    let v = i32::from(v) - 128;
    let r = y + ((91_881 * v) >> 16);
    let g = y - ((22_554 * u + 46_802 * v) >> 16);
    let b = y + ((116_130 * u) >> 16);
    (clamp_u8(r), clamp_u8(g), clamp_u8(b))
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}
