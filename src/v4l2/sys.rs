//! Raw V4L2 and bcm2835-isp kernel ABI.
//!
//! Every structure here is passed straight to `ioctl(2)`; field order, padding
//! and union layout must match `videodev2.h`, `v4l2-subdev.h` and
//! `bcm2835-isp.h` exactly.

#![allow(non_camel_case_types)]

use libc::{c_int, c_ulong, c_void, timeval};

// ===== Buffer types =====
pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_BUF_TYPE_VIDEO_OUTPUT: u32 = 2;
pub const V4L2_BUF_TYPE_META_CAPTURE: u32 = 13;

// ===== Memory types =====
pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_MEMORY_DMABUF: u32 = 4;

pub const V4L2_FIELD_NONE: u32 = 1;

pub const V4L2_SUBDEV_FORMAT_ACTIVE: u32 = 1;
pub const V4L2_SEL_TGT_CROP: u32 = 0x0000;
pub const V4L2_CTRL_WHICH_CUR_VAL: u32 = 0;

// ===== Media bus codes =====
pub const MEDIA_BUS_FMT_SBGGR10_1X10: u32 = 0x3007;
pub const MEDIA_BUS_FMT_SGBRG10_1X10: u32 = 0x300e;
pub const MEDIA_BUS_FMT_SGRBG10_1X10: u32 = 0x300a;
pub const MEDIA_BUS_FMT_SRGGB10_1X10: u32 = 0x300f;

// ===== Control classes =====
const V4L2_CID_BASE: u32 = 0x0098_0900;
const V4L2_CID_CAMERA_CLASS_BASE: u32 = 0x009a_0900;
const V4L2_CID_IMAGE_SOURCE_CLASS_BASE: u32 = 0x009e_0900;
const V4L2_CID_IMAGE_PROC_CLASS_BASE: u32 = 0x009f_0900;
const V4L2_CID_USER_BCM2835_ISP_BASE: u32 = V4L2_CID_BASE + 0x10e0;

// ===== Control IDs =====
pub const V4L2_CID_RED_BALANCE: u32 = V4L2_CID_BASE + 14;
pub const V4L2_CID_BLUE_BALANCE: u32 = V4L2_CID_BASE + 15;
pub const V4L2_CID_EXPOSURE: u32 = V4L2_CID_BASE + 17;
pub const V4L2_CID_HFLIP: u32 = V4L2_CID_BASE + 20;
pub const V4L2_CID_VFLIP: u32 = V4L2_CID_BASE + 21;
pub const V4L2_CID_FOCUS_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 10;
pub const V4L2_CID_VBLANK: u32 = V4L2_CID_IMAGE_SOURCE_CLASS_BASE + 1;
pub const V4L2_CID_HBLANK: u32 = V4L2_CID_IMAGE_SOURCE_CLASS_BASE + 2;
pub const V4L2_CID_ANALOGUE_GAIN: u32 = V4L2_CID_IMAGE_SOURCE_CLASS_BASE + 3;
pub const V4L2_CID_PIXEL_RATE: u32 = V4L2_CID_IMAGE_PROC_CLASS_BASE + 2;

pub const V4L2_CID_USER_BCM2835_ISP_LENS_SHADING: u32 = V4L2_CID_USER_BCM2835_ISP_BASE + 2;
pub const V4L2_CID_USER_BCM2835_ISP_BLACK_LEVEL: u32 = V4L2_CID_USER_BCM2835_ISP_BASE + 3;
pub const V4L2_CID_USER_BCM2835_ISP_GAMMA: u32 = V4L2_CID_USER_BCM2835_ISP_BASE + 5;

// ===== Capability / format structures =====

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_pix_format {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub priv_: u32,
    pub flags: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_meta_format {
    pub dataformat: u32,
    pub buffersize: u32,
}

/// `fmt` union of `struct v4l2_format`. The window variant carries pointers,
/// so the union is 8-byte aligned on 64-bit targets.
#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_format_union {
    pub pix: v4l2_pix_format,
    pub meta: v4l2_meta_format,
    pub raw_data: [u8; 200],
    _align: [*mut c_void; 200 / std::mem::size_of::<*mut c_void>()],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_format {
    pub type_: u32,
    pub fmt: v4l2_format_union,
}

impl v4l2_format {
    pub fn zeroed(type_: u32) -> Self {
        Self {
            type_,
            fmt: v4l2_format_union { raw_data: [0; 200] },
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_mbus_framefmt {
    pub width: u32,
    pub height: u32,
    pub code: u32,
    pub field: u32,
    pub colorspace: u32,
    pub ycbcr_enc: u16,
    pub quantization: u16,
    pub xfer_func: u16,
    pub flags: u16,
    pub reserved: [u16; 10],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_subdev_format {
    pub which: u32,
    pub pad: u32,
    pub format: v4l2_mbus_framefmt,
    pub stream: u32,
    pub reserved: [u32; 7],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct v4l2_rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_selection {
    pub type_: u32,
    pub target: u32,
    pub flags: u32,
    pub r: v4l2_rect,
    pub reserved: [u32; 9],
}

// ===== Buffer structures =====

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_requestbuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub reserved: [u32; 1],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_buffer_m {
    pub offset: u32,
    pub userptr: c_ulong,
    pub planes: *mut c_void,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: timeval,
    pub timecode: v4l2_timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: v4l2_buffer_m,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

impl v4l2_buffer {
    pub fn new(type_: u32, memory: u32, index: u32) -> Self {
        Self {
            index,
            type_,
            bytesused: 0,
            flags: 0,
            field: 0,
            timestamp: timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
            timecode: v4l2_timecode::default(),
            sequence: 0,
            memory,
            m: v4l2_buffer_m { userptr: 0 },
            length: 0,
            reserved2: 0,
            request_fd: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_exportbuffer {
    pub type_: u32,
    pub index: u32,
    pub plane: u32,
    pub flags: u32,
    pub fd: i32,
    pub reserved: [u32; 11],
}

// ===== Control structures =====

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct v4l2_queryctrl {
    pub id: u32,
    pub type_: u32,
    pub name: [u8; 32],
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default_value: i32,
    pub flags: u32,
    pub reserved: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_ext_control_value {
    pub value: i32,
    pub value64: i64,
    pub ptr: *mut c_void,
}

/// `struct v4l2_ext_control` is declared `__attribute__((packed))`: 20 bytes
/// with the payload union starting at offset 12.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct v4l2_ext_control {
    pub id: u32,
    pub size: u32,
    pub reserved2: [u32; 1],
    pub u: v4l2_ext_control_value,
}

impl v4l2_ext_control {
    pub fn with_value(id: u32, value: i32) -> Self {
        let mut u = v4l2_ext_control_value { value64: 0 };
        u.value = value;
        Self {
            id,
            size: 0,
            reserved2: [0],
            u,
        }
    }

    pub fn with_ptr(id: u32, ptr: *mut c_void, size: u32) -> Self {
        Self {
            id,
            size,
            reserved2: [0],
            u: v4l2_ext_control_value { ptr },
        }
    }

    pub fn query(id: u32) -> Self {
        Self::with_value(id, 0)
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_ext_controls {
    pub which: u32,
    pub count: u32,
    pub error_idx: u32,
    pub request_fd: i32,
    pub reserved: [u32; 1],
    pub controls: *mut v4l2_ext_control,
}

// ===== bcm2835-isp compound controls =====

pub const GAIN_FORMAT_U4P10: u32 = 2;
pub const GAMMA_POINTS: usize = 33;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct bcm2835_isp_lens_shading {
    pub enabled: u32,
    pub grid_cell_size: u32,
    pub grid_width: u32,
    pub grid_stride: u32,
    pub grid_height: u32,
    pub dmabuf: i32,
    pub ref_transform: u32,
    pub corner_sampled: u32,
    pub gain_format: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct bcm2835_isp_gamma {
    pub enabled: u32,
    pub x: [u16; GAMMA_POINTS],
    pub y: [u16; GAMMA_POINTS],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct bcm2835_isp_black_level {
    pub enabled: u32,
    pub black_level_r: u16,
    pub black_level_g: u16,
    pub black_level_b: u16,
    pub padding: [u8; 2],
}

// ===== ioctls =====

nix::ioctl_readwrite!(vidioc_s_fmt, b'V', 5, v4l2_format);
nix::ioctl_readwrite!(vidioc_subdev_s_fmt, b'V', 5, v4l2_subdev_format);
nix::ioctl_readwrite!(vidioc_reqbufs, b'V', 8, v4l2_requestbuffers);
nix::ioctl_readwrite!(vidioc_querybuf, b'V', 9, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_qbuf, b'V', 15, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_expbuf, b'V', 16, v4l2_exportbuffer);
nix::ioctl_readwrite!(vidioc_dqbuf, b'V', 17, v4l2_buffer);
nix::ioctl_write_ptr!(vidioc_streamon, b'V', 18, c_int);
nix::ioctl_write_ptr!(vidioc_streamoff, b'V', 19, c_int);
nix::ioctl_readwrite!(vidioc_queryctrl, b'V', 36, v4l2_queryctrl);
nix::ioctl_readwrite!(vidioc_g_ext_ctrls, b'V', 71, v4l2_ext_controls);
nix::ioctl_readwrite!(vidioc_s_ext_ctrls, b'V', 72, v4l2_ext_controls);
nix::ioctl_readwrite!(vidioc_s_selection, b'V', 95, v4l2_selection);

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    #[test]
    fn test_control_id_values() {
        assert_eq!(V4L2_CID_EXPOSURE, 0x0098_0911);
        assert_eq!(V4L2_CID_ANALOGUE_GAIN, 0x009e_0903);
        assert_eq!(V4L2_CID_FOCUS_ABSOLUTE, 0x009a_090a);
        assert_eq!(V4L2_CID_PIXEL_RATE, 0x009f_0902);
        assert_eq!(V4L2_CID_USER_BCM2835_ISP_LENS_SHADING, 0x0098_19e2);
        assert_eq!(V4L2_CID_USER_BCM2835_ISP_GAMMA, 0x0098_19e5);
    }

    #[test]
    fn test_ext_control_layout() {
        assert_eq!(size_of::<v4l2_ext_control>(), 20);
        assert_eq!(align_of::<v4l2_ext_control>(), 1);
        assert_eq!(std::mem::offset_of!(v4l2_ext_control, u), 12);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_struct_sizes_64bit() {
        assert_eq!(size_of::<v4l2_format>(), 208);
        assert_eq!(size_of::<v4l2_buffer>(), 88);
        assert_eq!(size_of::<v4l2_ext_controls>(), 32);
    }

    #[test]
    fn test_struct_sizes() {
        assert_eq!(size_of::<v4l2_pix_format>(), 48);
        assert_eq!(size_of::<v4l2_subdev_format>(), 88);
        assert_eq!(size_of::<v4l2_requestbuffers>(), 20);
        assert_eq!(size_of::<v4l2_exportbuffer>(), 64);
        assert_eq!(size_of::<v4l2_selection>(), 64);
        assert_eq!(size_of::<v4l2_queryctrl>(), 68);
        assert_eq!(size_of::<bcm2835_isp_lens_shading>(), 36);
        assert_eq!(size_of::<bcm2835_isp_gamma>(), 136);
        assert_eq!(size_of::<bcm2835_isp_black_level>(), 12);
    }
}
