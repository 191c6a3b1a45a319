//! Device nodes driven through raw ioctls.

use std::fmt;
use std::fs::OpenOptions;
use std::mem::size_of;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::time::Duration;

use libc::c_int;
use memmap2::MmapOptions;
use nix::errno::Errno;
use tracing::{debug, info, instrument, warn};
use v4l::FourCC;

use super::buffer::{Buffer, BufferQueue, BufferState, Dequeued, Ledger, SharedPool};
use super::sys::*;
use crate::error::{Error, Result, SetupError};

/// Negotiated image format of a video node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
    pub bytes_per_line: u32,
    pub size_image: u32,
}

impl Format {
    pub fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        Self {
            width,
            height,
            fourcc,
            bytes_per_line: 0,
            size_image: 0,
        }
    }

    /// Whether this format can stand in for `requested`: same layout and at
    /// least as large in both dimensions.
    pub fn covers(&self, requested: &Format) -> bool {
        self.fourcc == requested.fourcc
            && self.width >= requested.width
            && self.height >= requested.height
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.fourcc)
    }
}

/// Range reported by `VIDIOC_QUERYCTRL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRange {
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default: i32,
}

impl ControlRange {
    pub fn clamp(&self, value: i32) -> i32 {
        value.clamp(self.minimum, self.maximum)
    }

    pub fn midpoint(&self) -> i32 {
        self.minimum + (self.maximum - self.minimum) / 2
    }
}

/// One open V4L2 video or sub-device node.
pub struct DeviceHandle {
    path: String,
    fd: OwnedFd,
    buf_type: u32,
    memory: u32,
    format: Option<Format>,
    buffers: Vec<Buffer>,
    ledger: Ledger,
    streaming: bool,
}

impl DeviceHandle {
    /// Open a node read/write and non-blocking.
    pub fn open(path: &str, buf_type: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        debug!(path, buf_type, "Opened device node");

        Ok(Self {
            path: path.to_owned(),
            fd: file.into(),
            buf_type,
            memory: V4L2_MEMORY_MMAP,
            format: None,
            buffers: Vec::new(),
            ledger: Ledger::default(),
            streaming: false,
        })
    }

    /// Open a sub-device; these carry controls and pad formats only.
    pub fn open_subdev(path: &str) -> Result<Self> {
        Self::open(path, 0)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn format(&self) -> Option<Format> {
        self.format
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn buffer_state(&self, index: u32) -> Option<BufferState> {
        self.ledger.state(index)
    }

    fn kernel(&self, op: &'static str, errno: Errno) -> Error {
        Error::kernel(&self.path, op, errno)
    }

    /// Issue an ioctl, retrying while interrupted by a signal.
    fn xioctl<F>(&self, op: &'static str, mut call: F) -> Result<()>
    where
        F: FnMut(RawFd) -> nix::Result<c_int>,
    {
        loop {
            match call(self.fd.as_raw_fd()) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(self.kernel(op, e)),
            }
        }
    }

    /// Like `xioctl` but hands the errno back for the caller to interpret.
    fn xioctl_raw<F>(&self, mut call: F) -> nix::Result<()>
    where
        F: FnMut(RawFd) -> nix::Result<c_int>,
    {
        loop {
            match call(self.fd.as_raw_fd()) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    // ===== Formats =====

    /// `VIDIOC_S_FMT` on a single-planar node. Returns what the driver
    /// actually chose; the caller decides whether that is acceptable.
    pub fn set_format(&mut self, width: u32, height: u32, fourcc: FourCC) -> Result<Format> {
        let mut fmt = v4l2_format::zeroed(self.buf_type);
        fmt.fmt.pix = v4l2_pix_format {
            width,
            height,
            pixelformat: fourcc.into(),
            field: V4L2_FIELD_NONE,
            ..Default::default()
        };
        self.xioctl("VIDIOC_S_FMT", |fd| unsafe { vidioc_s_fmt(fd, &mut fmt) })?;

        // SAFETY: the driver filled the `pix` member for image buffer types.
        let pix = unsafe { fmt.fmt.pix };
        let actual = Format {
            width: pix.width,
            height: pix.height,
            fourcc: FourCC::from(pix.pixelformat),
            bytes_per_line: pix.bytesperline,
            size_image: pix.sizeimage,
        };
        debug!(node = %self.path, %actual, "Format set");
        self.format = Some(actual);
        Ok(actual)
    }

    /// Set a format and require the driver to keep it exactly.
    pub fn negotiate_exact(&mut self, width: u32, height: u32, fourcc: FourCC) -> Result<Format> {
        let requested = Format::new(width, height, fourcc);
        let actual = self.set_format(width, height, fourcc)?;
        if actual.width != width || actual.height != height || actual.fourcc != fourcc {
            return Err(SetupError::FormatRejected {
                node: self.path.clone(),
                requested: requested.to_string(),
                actual: actual.to_string(),
            }
            .into());
        }
        Ok(actual)
    }

    /// Set a format and accept any adjustment that is at least as large.
    pub fn negotiate_at_least(
        &mut self,
        width: u32,
        height: u32,
        fourcc: FourCC,
    ) -> Result<Format> {
        let requested = Format::new(width, height, fourcc);
        let actual = self.set_format(width, height, fourcc)?;
        if actual.fourcc != fourcc {
            return Err(SetupError::FormatRejected {
                node: self.path.clone(),
                requested: requested.to_string(),
                actual: actual.to_string(),
            }
            .into());
        }
        if !actual.covers(&requested) {
            return Err(SetupError::Undersized {
                node: self.path.clone(),
                requested: requested.to_string(),
                actual: actual.to_string(),
            }
            .into());
        }
        Ok(actual)
    }

    /// `VIDIOC_S_FMT` on a metadata node. Returns the data format and the
    /// buffer size the driver will use.
    pub fn set_meta_format(&mut self, dataformat: FourCC, buffersize: u32) -> Result<(FourCC, u32)> {
        let mut fmt = v4l2_format::zeroed(self.buf_type);
        fmt.fmt.meta = v4l2_meta_format {
            dataformat: dataformat.into(),
            buffersize,
        };
        self.xioctl("VIDIOC_S_FMT", |fd| unsafe { vidioc_s_fmt(fd, &mut fmt) })?;

        // SAFETY: metadata buffer types use the `meta` member.
        let meta = unsafe { fmt.fmt.meta };
        let actual = FourCC::from(meta.dataformat);
        let size = meta.buffersize;
        if actual != dataformat {
            return Err(SetupError::FormatRejected {
                node: self.path.clone(),
                requested: dataformat.to_string(),
                actual: actual.to_string(),
            }
            .into());
        }
        debug!(node = %self.path, format = %actual, size, "Metadata format set");
        Ok((actual, size))
    }

    /// `VIDIOC_SUBDEV_S_FMT` on pad `pad`.
    pub fn set_subdev_format(
        &mut self,
        pad: u32,
        width: u32,
        height: u32,
        code: u32,
    ) -> Result<v4l2_mbus_framefmt> {
        let mut fmt = v4l2_subdev_format {
            which: V4L2_SUBDEV_FORMAT_ACTIVE,
            pad,
            format: v4l2_mbus_framefmt {
                width,
                height,
                code,
                field: V4L2_FIELD_NONE,
                ..Default::default()
            },
            ..Default::default()
        };
        self.xioctl("VIDIOC_SUBDEV_S_FMT", |fd| unsafe {
            vidioc_subdev_s_fmt(fd, &mut fmt)
        })?;
        debug!(
            node = %self.path,
            width = fmt.format.width,
            height = fmt.format.height,
            code = fmt.format.code,
            "Sub-device format set"
        );
        Ok(fmt.format)
    }

    /// `VIDIOC_S_SELECTION` crop target. Returns the rectangle the driver kept.
    pub fn set_crop(&mut self, rect: v4l2_rect) -> Result<v4l2_rect> {
        let mut sel = v4l2_selection {
            type_: self.buf_type,
            target: V4L2_SEL_TGT_CROP,
            r: rect,
            ..Default::default()
        };
        self.xioctl("VIDIOC_S_SELECTION", |fd| unsafe {
            vidioc_s_selection(fd, &mut sel)
        })?;
        Ok(sel.r)
    }

    // ===== Controls =====

    pub fn query_control(&self, id: u32) -> Result<ControlRange> {
        let mut query = v4l2_queryctrl {
            id,
            ..Default::default()
        };
        self.xioctl("VIDIOC_QUERYCTRL", |fd| unsafe {
            vidioc_queryctrl(fd, &mut query)
        })?;
        Ok(ControlRange {
            minimum: query.minimum,
            maximum: query.maximum,
            step: query.step,
            default: query.default_value,
        })
    }

    /// `VIDIOC_G_EXT_CTRLS` for a batch of ids.
    pub fn get_controls(&self, ids: &[u32]) -> Result<Vec<v4l2_ext_control>> {
        let mut ctrls: Vec<v4l2_ext_control> =
            ids.iter().map(|id| v4l2_ext_control::query(*id)).collect();
        let mut req = v4l2_ext_controls {
            which: V4L2_CTRL_WHICH_CUR_VAL,
            count: ctrls.len() as u32,
            error_idx: 0,
            request_fd: 0,
            reserved: [0],
            controls: ctrls.as_mut_ptr(),
        };
        self.xioctl("VIDIOC_G_EXT_CTRLS", |fd| unsafe {
            vidioc_g_ext_ctrls(fd, &mut req)
        })?;
        Ok(ctrls)
    }

    pub fn get_control(&self, id: u32) -> Result<i32> {
        let ctrls = self.get_controls(&[id])?;
        // SAFETY: integer controls report through `value`.
        Ok(ctrls.first().map(|c| unsafe { c.u.value }).unwrap_or_default())
    }

    pub fn get_control64(&self, id: u32) -> Result<i64> {
        let ctrls = self.get_controls(&[id])?;
        // SAFETY: 64-bit controls report through `value64`.
        Ok(ctrls.first().map(|c| unsafe { c.u.value64 }).unwrap_or_default())
    }

    /// `VIDIOC_S_EXT_CTRLS`. A rejection is reported as a hardware control
    /// error naming the offending id so callers can treat it as non-fatal.
    pub fn set_controls(&self, ctrls: &mut [v4l2_ext_control]) -> Result<()> {
        if ctrls.is_empty() {
            return Ok(());
        }
        let mut req = v4l2_ext_controls {
            which: V4L2_CTRL_WHICH_CUR_VAL,
            count: ctrls.len() as u32,
            error_idx: 0,
            request_fd: 0,
            reserved: [0],
            controls: ctrls.as_mut_ptr(),
        };
        match self.xioctl_raw(|fd| unsafe { vidioc_s_ext_ctrls(fd, &mut req) }) {
            Ok(()) => Ok(()),
            Err(source) => {
                let idx = (req.error_idx as usize).min(ctrls.len() - 1);
                Err(Error::HardwareControl {
                    node: self.path.clone(),
                    id: ctrls[idx].id,
                    source,
                })
            }
        }
    }

    pub fn set_control(&self, id: u32, value: i32) -> Result<()> {
        self.set_controls(&mut [v4l2_ext_control::with_value(id, value)])
    }

    /// Write a compound control whose payload is a plain C struct.
    pub fn set_compound<T>(&self, id: u32, payload: &mut T) -> Result<()> {
        let ptr = (payload as *mut T).cast();
        self.set_controls(&mut [v4l2_ext_control::with_ptr(id, ptr, size_of::<T>() as u32)])
    }

    // ===== Buffers =====

    /// Allocate kernel buffers and map them into the process. Returns the
    /// count the driver granted, which is authoritative.
    #[instrument(skip(self), fields(node = %self.path))]
    pub fn request_mapped(&mut self, count: u32) -> Result<u32> {
        let granted = self.reqbufs(count, V4L2_MEMORY_MMAP)?;

        let mut buffers = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            let mut buf = v4l2_buffer::new(self.buf_type, V4L2_MEMORY_MMAP, index);
            self.xioctl("VIDIOC_QUERYBUF", |fd| unsafe {
                vidioc_querybuf(fd, &mut buf)
            })?;
            // SAFETY: MMAP buffers report their mapping offset in `m.offset`.
            let offset = unsafe { buf.m.offset };
            // SAFETY: the kernel guarantees `length` bytes at `offset` stay
            // valid until the buffers are released with REQBUFS(0) or close.
            let map = unsafe {
                MmapOptions::new()
                    .len(buf.length as usize)
                    .offset(offset as u64)
                    .map(&self.fd)?
            };
            buffers.push(Buffer::mapped(map));
        }

        self.memory = V4L2_MEMORY_MMAP;
        self.buffers = buffers;
        self.ledger = Ledger::new(granted as usize);
        info!(count = granted, "Mapped buffers");
        Ok(granted)
    }

    /// Allocate kernel buffers without mapping them, for export.
    pub fn request_exportable(&mut self, count: u32) -> Result<u32> {
        let granted = self.reqbufs(count, V4L2_MEMORY_MMAP)?;
        self.memory = V4L2_MEMORY_MMAP;
        self.buffers.clear();
        self.ledger = Ledger::new(granted as usize);
        Ok(granted)
    }

    /// Export every allocated buffer as a DMABUF descriptor. The returned
    /// pool owns the memory from here on.
    #[instrument(skip(self), fields(node = %self.path))]
    pub fn export_buffers(&mut self) -> Result<SharedPool> {
        let count = self.ledger.len() as u32;
        let length = self.format.map(|f| f.size_image as usize).unwrap_or_default();

        let mut fds = Vec::with_capacity(count as usize);
        for index in 0..count {
            let mut exp = v4l2_exportbuffer {
                type_: self.buf_type,
                index,
                flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
                ..Default::default()
            };
            self.xioctl("VIDIOC_EXPBUF", |fd| unsafe { vidioc_expbuf(fd, &mut exp) })?;
            // SAFETY: EXPBUF returns a fresh descriptor owned by the caller.
            fds.push(unsafe { OwnedFd::from_raw_fd(exp.fd) });
        }
        info!(count, "Exported buffers");
        Ok(SharedPool::new(fds, length))
    }

    /// Re-request the queue as DMABUF slots backed by `pool`. The pool size
    /// must match exactly since both sides address buffers by index.
    #[instrument(skip(self, pool), fields(node = %self.path))]
    pub fn import_buffers(&mut self, pool: &SharedPool) -> Result<u32> {
        let expected = pool.len() as u32;
        let granted = self.reqbufs(expected, V4L2_MEMORY_DMABUF)?;
        if granted != expected {
            return Err(SetupError::BufferCountMismatch {
                node: self.path.clone(),
                expected,
                actual: granted,
            }
            .into());
        }

        self.memory = V4L2_MEMORY_DMABUF;
        self.buffers = pool
            .raw_fds()
            .into_iter()
            .map(|fd| Buffer::shared(fd, pool.buffer_len()))
            .collect();
        self.ledger = Ledger::new(granted as usize);
        info!(count = granted, "Imported shared buffers");
        Ok(granted)
    }

    fn reqbufs(&mut self, count: u32, memory: u32) -> Result<u32> {
        let mut req = v4l2_requestbuffers {
            count,
            type_: self.buf_type,
            memory,
            ..Default::default()
        };
        self.xioctl("VIDIOC_REQBUFS", |fd| unsafe { vidioc_reqbufs(fd, &mut req) })?;
        if req.count == 0 {
            return Err(SetupError::BufferCountMismatch {
                node: self.path.clone(),
                expected: count,
                actual: 0,
            }
            .into());
        }
        if req.count != count {
            warn!(node = %self.path, requested = count, granted = req.count, "Driver adjusted buffer count");
        }
        Ok(req.count)
    }

    /// Queue every buffer that the process currently owns.
    pub fn enqueue_all(&mut self) -> Result<()> {
        for index in 0..self.ledger.len() as u32 {
            if self.ledger.state(index) == Some(BufferState::Dequeued) {
                self.enqueue(index)?;
            }
        }
        Ok(())
    }

    /// Payload of a dequeued mapped buffer.
    pub fn buffer_bytes(&self, index: u32) -> Option<&[u8]> {
        self.buffers.get(index as usize).and_then(|b| b.bytes())
    }

    // ===== Streaming =====

    pub fn stream_on(&mut self) -> Result<()> {
        let ty = self.buf_type as c_int;
        self.xioctl("VIDIOC_STREAMON", |fd| unsafe { vidioc_streamon(fd, &ty) })?;
        self.streaming = true;
        info!(node = %self.path, "Streaming started");
        Ok(())
    }

    /// Stop streaming. All queued buffers return to the process.
    pub fn stream_off(&mut self) -> Result<()> {
        if !self.streaming {
            return Ok(());
        }
        let ty = self.buf_type as c_int;
        self.xioctl("VIDIOC_STREAMOFF", |fd| unsafe { vidioc_streamoff(fd, &ty) })?;
        self.streaming = false;
        self.ledger = Ledger::new(self.ledger.len());
        for buf in &mut self.buffers {
            buf.state = BufferState::Dequeued;
        }
        info!(node = %self.path, "Streaming stopped");
        Ok(())
    }
}

impl BufferQueue for DeviceHandle {
    fn name(&self) -> &str {
        &self.path
    }

    fn enqueue(&mut self, index: u32) -> Result<()> {
        self.ledger.queue(&self.path, index)?;

        let mut buf = v4l2_buffer::new(self.buf_type, self.memory, index);
        if let Some(slot) = self.buffers.get(index as usize) {
            buf.length = slot.len() as u32;
            if let Some(fd) = slot.dmabuf_fd() {
                buf.m.fd = fd;
            }
        }
        let res = self.xioctl("VIDIOC_QBUF", |fd| unsafe { vidioc_qbuf(fd, &mut buf) });
        if res.is_err() {
            // The kernel never took it, so ownership stays here.
            self.ledger.dequeue(&self.path, index)?;
            return res;
        }
        if let Some(slot) = self.buffers.get_mut(index as usize) {
            slot.state = BufferState::Queued;
        }
        Ok(())
    }

    fn dequeue(&mut self) -> Result<Option<Dequeued>> {
        let mut buf = v4l2_buffer::new(self.buf_type, self.memory, 0);
        match self.xioctl_raw(|fd| unsafe { vidioc_dqbuf(fd, &mut buf) }) {
            Ok(()) => {}
            Err(Errno::EAGAIN) => return Ok(None),
            Err(e) => return Err(self.kernel("VIDIOC_DQBUF", e)),
        }

        self.ledger.dequeue(&self.path, buf.index)?;
        if let Some(slot) = self.buffers.get_mut(buf.index as usize) {
            slot.state = BufferState::Dequeued;
            slot.bytesused = buf.bytesused as usize;
        }
        Ok(Some(Dequeued {
            index: buf.index,
            bytesused: buf.bytesused,
            sequence: buf.sequence,
            timestamp: Duration::from_secs(buf.timestamp.tv_sec as u64)
                + Duration::from_micros(buf.timestamp.tv_usec as u64),
        }))
    }
}

impl AsFd for DeviceHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stream_off() {
            warn!(node = %self.path, "Stream off during teardown failed: {e}");
        }
        // Unmap before the descriptor closes.
        self.buffers.clear();
    }
}
