//! Unicam to bcm2835-isp capture session.
//!
//! Raw Bayer frames land in a pool of buffers exported by Unicam and imported
//! by the ISP input, so a frame moves between the two by index only. The ISP
//! writes the processed image to its output node and a statistics block to its
//! stats node; each statistics block drives one control cycle.

use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, instrument, trace, warn};
use v4l::capability::Flags;
use v4l::FourCC;

use super::convert::Converter;
use super::frame::{Frame, FrameMetadata, PixelFormat};
use super::mode::CameraMode;
use super::stats::{Statistics, STATS_SIZE};
use crate::autofocus::pdaf::{self, PdafRegions};
use crate::autofocus::{Autofocus, WindowTransform};
use crate::control::alsc::build_lens_shading;
use crate::control::awb::ColourGains;
use crate::control::sensor::{packed_fourcc, vblank_for_fps, SensorTiming};
use crate::control::{applied, Actuators, Controller, DeviceStatus};
use crate::error::{Error, Result, SetupError};
use crate::pipeline::Producer;
use crate::tuning::Tuning;
use crate::utils::probe_node;
use crate::v4l2::sys::*;
use crate::v4l2::{hand_off, BufferQueue, DeviceHandle, DmaBuffer, SharedPool};
use crate::Config;

const STATS_FOURCC: &[u8; 4] = b"BSTA";
const EMBEDDED_FOURCC: &[u8; 4] = b"SENS";
/// Embedded data lines needed to reach the PDAF grid.
const EMBEDDED_LINES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Configuring,
    Streaming,
    Stopped,
}

/// Nodes that reported ready in one wait.
#[derive(Debug, Clone, Copy, Default)]
struct Ready {
    raw: bool,
    isp_in: bool,
    output: bool,
    stats: bool,
    meta: bool,
}

/// A configured capture session. Dropping it stops every node.
pub struct UnicamIsp {
    state: SessionState,
    unicam: DeviceHandle,
    unicam_meta: Option<DeviceHandle>,
    sensor: DeviceHandle,
    lens: Option<DeviceHandle>,
    isp_in: DeviceHandle,
    isp_out: DeviceHandle,
    isp_stats: DeviceHandle,
    // Declared after the nodes so the descriptors outlive the queues using them.
    _pool: SharedPool,
    _lens_shading: Option<DmaBuffer>,
    mode: CameraMode,
    converter: Converter,
    controller: Controller,
    autofocus: Option<Autofocus>,
    pdaf_bytes_per_line: usize,
    timeout: Duration,
    sequence: u64,
}

impl UnicamIsp {
    /// Configure every node for `config` without streaming yet.
    #[instrument(skip_all, fields(sensor = ?config.sensor))]
    pub fn open(config: &Config, tuning: &Tuning) -> Result<Self> {
        let cap = &config.capture;
        let mode = CameraMode::select(config.sensor, cap.width, cap.height, cap.fps)?;
        info!(
            width = mode.width,
            height = mode.height,
            max_fps = mode.max_fps,
            "Selected camera mode"
        );

        probe_node(&cap.unicam, Some((Flags::VIDEO_CAPTURE, "video capture")))?;
        probe_node(&cap.isp_in, Some((Flags::VIDEO_OUTPUT, "video output")))?;
        probe_node(&cap.isp_out, Some((Flags::VIDEO_CAPTURE, "video capture")))?;
        probe_node(&cap.isp_stats, Some((Flags::META_CAPTURE, "metadata capture")))?;

        // Sensor: flips change the Bayer order, so they go before the format.
        let mut sensor = DeviceHandle::open_subdev(&cap.sensor_subdev)?;
        sensor.set_controls(&mut [
            v4l2_ext_control::with_value(V4L2_CID_HFLIP, i32::from(cap.hflip)),
            v4l2_ext_control::with_value(V4L2_CID_VFLIP, i32::from(cap.vflip)),
        ])?;
        let bus = sensor.set_subdev_format(0, mode.width, mode.height, MEDIA_BUS_FMT_SBGGR10_1X10)?;
        let raw_fourcc = packed_fourcc(bus.code).ok_or_else(|| SetupError::FormatRejected {
            node: cap.sensor_subdev.clone(),
            requested: format!("{}x{} {:#06x}", mode.width, mode.height, MEDIA_BUS_FMT_SBGGR10_1X10),
            actual: format!("{}x{} {:#06x}", bus.width, bus.height, bus.code),
        })?;
        if bus.width != mode.width || bus.height != mode.height {
            return Err(SetupError::FormatRejected {
                node: cap.sensor_subdev.clone(),
                requested: format!("{}x{}", mode.width, mode.height),
                actual: format!("{}x{}", bus.width, bus.height),
            }
            .into());
        }

        let hblank = sensor.get_control(V4L2_CID_HBLANK)?;
        let pixel_rate = sensor.get_control64(V4L2_CID_PIXEL_RATE)?;
        let vblank_range = sensor.query_control(V4L2_CID_VBLANK)?;
        let vblank = vblank_range.clamp(vblank_for_fps(pixel_rate, cap.fps, mode.width, hblank, mode.height));
        sensor.set_control(V4L2_CID_VBLANK, vblank)?;
        // Exposure limits follow the frame length, so read them after VBLANK.
        let timing = SensorTiming::new(
            config.sensor,
            mode.width,
            hblank,
            pixel_rate,
            sensor.query_control(V4L2_CID_EXPOSURE)?,
            sensor.query_control(V4L2_CID_ANALOGUE_GAIN)?,
        );
        debug!(hblank, vblank, pixel_rate, line_us = timing.line_us, "Sensor timing");

        // Unicam and the ISP input must agree exactly on the raw format.
        let mut unicam = DeviceHandle::open(&cap.unicam, V4L2_BUF_TYPE_VIDEO_CAPTURE)?;
        let raw = unicam.negotiate_exact(mode.width, mode.height, raw_fourcc)?;
        let mut isp_in = DeviceHandle::open(&cap.isp_in, V4L2_BUF_TYPE_VIDEO_OUTPUT)?;
        isp_in.negotiate_exact(raw.width, raw.height, raw.fourcc)?;
        let crop = isp_in.set_crop(mode.aspect_crop(cap.width, cap.height))?;
        debug!(left = crop.left, top = crop.top, width = crop.width, height = crop.height, "ISP input crop");

        let mut isp_out = DeviceHandle::open(&cap.isp_out, V4L2_BUF_TYPE_VIDEO_CAPTURE)?;
        let out = match isp_out.negotiate_at_least(cap.width, cap.height, cap.format.fourcc()) {
            Ok(out) => out,
            Err(Error::Setup(SetupError::FormatRejected { .. })) if cap.format != PixelFormat::Yuv420 => {
                debug!(format = ?cap.format, "ISP cannot output directly, converting from YUV420");
                isp_out.negotiate_at_least(cap.width, cap.height, PixelFormat::Yuv420.fourcc())?
            }
            Err(e) => return Err(e),
        };
        let converter = Converter::try_convert(&out, cap.width, cap.height, cap.format)?;

        let mut isp_stats = DeviceHandle::open(&cap.isp_stats, V4L2_BUF_TYPE_META_CAPTURE)?;
        let (_, stats_size) = isp_stats.set_meta_format(FourCC::new(STATS_FOURCC), STATS_SIZE as u32)?;
        if (stats_size as usize) < STATS_SIZE {
            return Err(SetupError::Undersized {
                node: cap.isp_stats.clone(),
                requested: format!("{STATS_SIZE} bytes"),
                actual: format!("{stats_size} bytes"),
            }
            .into());
        }

        // Shared raw pool: Unicam allocates, both sides import by index.
        unicam.request_exportable(cap.raw_buffers)?;
        let pool = unicam.export_buffers()?;
        unicam.import_buffers(&pool)?;
        isp_in.import_buffers(&pool)?;
        isp_out.request_mapped(cap.output_buffers)?;
        isp_stats.request_mapped(cap.stats_buffers)?;

        let lens_shading = if tuning.alsc.calibrations_cr.is_empty() && tuning.alsc.luminance_lut.is_empty() {
            debug!("no lens shading tables, ISP shading left disabled");
            None
        } else {
            let table = build_lens_shading(
                &tuning.alsc,
                config.control.colour_temperature,
                &mode,
                raw.width,
                raw.height,
                cap.hflip,
                cap.vflip,
            )?;
            let mut buffer = DmaBuffer::allocate(table.geometry.byte_len())?;
            buffer.write_u16(&table.data);
            let mut ls = table.geometry.control(buffer.raw_fd());
            isp_in.set_compound(V4L2_CID_USER_BCM2835_ISP_LENS_SHADING, &mut ls)?;
            info!(cell = table.geometry.cell_size, width = table.geometry.width, height = table.geometry.height, "Lens shading programmed");
            Some(buffer)
        };

        let mut black = bcm2835_isp_black_level {
            enabled: 1,
            black_level_r: tuning.black_level,
            black_level_g: tuning.black_level,
            black_level_b: tuning.black_level,
            ..Default::default()
        };
        isp_in.set_compound(V4L2_CID_USER_BCM2835_ISP_BLACK_LEVEL, &mut black)?;

        let status = DeviceStatus {
            vblank,
            hflip: cap.hflip,
            vflip: cap.vflip,
            ..DeviceStatus::midpoint(&timing)
        };
        sensor.set_controls(&mut [
            v4l2_ext_control::with_value(V4L2_CID_EXPOSURE, status.exposure_lines),
            v4l2_ext_control::with_value(V4L2_CID_ANALOGUE_GAIN, status.gain_code),
        ])?;
        let (red, blue) = ColourGains::default().to_controls();
        isp_in.set_controls(&mut [
            v4l2_ext_control::with_value(V4L2_CID_RED_BALANCE, red),
            v4l2_ext_control::with_value(V4L2_CID_BLUE_BALANCE, blue),
        ])?;
        let controller = Controller::new(timing, tuning, &config.control, status)?;

        let lens = cap.lens_subdev.as_deref().map(DeviceHandle::open_subdev).transpose()?;
        let autofocus = match (&tuning.af, config.autofocus.enabled, &lens) {
            (Some(params), true, Some(_)) => {
                let mut af = Autofocus::new(params.clone(), &config.autofocus);
                af.set_geometry(WindowTransform {
                    mode,
                    crop,
                    output_width: cap.width,
                    output_height: cap.height,
                });
                af.set_focus_windows(&config.autofocus.windows);
                Some(af)
            }
            (None, true, Some(_)) => {
                warn!("no rpi.af in tuning, autofocus disabled");
                None
            }
            _ => None,
        };

        let pdaf_bytes_per_line = pdaf::bytes_per_line(mode.width);
        let unicam_meta = match (&cap.unicam_meta, &autofocus) {
            (Some(path), Some(_)) if config.sensor.has_pdaf() => {
                let mut meta = DeviceHandle::open(path, V4L2_BUF_TYPE_META_CAPTURE)?;
                let wanted = pdaf_bytes_per_line * EMBEDDED_LINES;
                let (_, size) = meta.set_meta_format(FourCC::new(EMBEDDED_FOURCC), wanted as u32)?;
                if (size as usize) < wanted {
                    return Err(SetupError::Undersized {
                        node: path.clone(),
                        requested: format!("{wanted} bytes"),
                        actual: format!("{size} bytes"),
                    }
                    .into());
                }
                meta.request_mapped(cap.raw_buffers)?;
                Some(meta)
            }
            _ => None,
        };

        info!(
            output = %converter.output(),
            pdaf = unicam_meta.is_some(),
            autofocus = autofocus.is_some(),
            "Capture session configured"
        );
        Ok(Self {
            state: SessionState::Configuring,
            unicam,
            unicam_meta,
            sensor,
            lens,
            isp_in,
            isp_out,
            isp_stats,
            _pool: pool,
            _lens_shading: lens_shading,
            mode,
            converter,
            controller,
            autofocus,
            pdaf_bytes_per_line,
            timeout: Duration::from_millis(cap.timeout_ms),
            sequence: 0,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mode(&self) -> &CameraMode {
        &self.mode
    }

    pub fn status(&self) -> &DeviceStatus {
        self.controller.status()
    }

    pub fn autofocus(&self) -> Option<&Autofocus> {
        self.autofocus.as_ref()
    }

    pub fn autofocus_mut(&mut self) -> Option<&mut Autofocus> {
        self.autofocus.as_mut()
    }

    /// Queue the initial buffers and stream on every node. Any failure
    /// stops the nodes already started.
    #[instrument(skip(self))]
    pub fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Configuring {
            return Ok(());
        }
        if let Err(e) = self.stream_on_all() {
            self.stop();
            return Err(e);
        }
        self.state = SessionState::Streaming;
        info!("Capture session streaming");
        Ok(())
    }

    fn stream_on_all(&mut self) -> Result<()> {
        // The ISP input starts empty; raw buffers reach it only from Unicam.
        self.unicam.enqueue_all()?;
        self.isp_out.enqueue_all()?;
        self.isp_stats.enqueue_all()?;
        if let Some(meta) = &mut self.unicam_meta {
            meta.enqueue_all()?;
        }

        self.unicam.stream_on()?;
        self.isp_in.stream_on()?;
        self.isp_out.stream_on()?;
        self.isp_stats.stream_on()?;
        if let Some(meta) = &mut self.unicam_meta {
            meta.stream_on()?;
        }
        Ok(())
    }

    /// Stream off every node. Safe to call more than once.
    pub fn stop(&mut self) {
        let nodes = [
            Some(&mut self.unicam),
            self.unicam_meta.as_mut(),
            Some(&mut self.isp_in),
            Some(&mut self.isp_out),
            Some(&mut self.isp_stats),
        ];
        for node in nodes.into_iter().flatten() {
            if let Err(e) = node.stream_off() {
                warn!(node = node.path(), error = %e, "Stream off failed");
            }
        }
        if self.state != SessionState::Stopped {
            info!(frames = self.sequence, "Capture session stopped");
        }
        self.state = SessionState::Stopped;
    }

    /// Block until at least one node is ready.
    fn wait(&self) -> Result<Ready> {
        let mut fds = vec![
            PollFd::new(self.unicam.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.isp_in.as_fd(), PollFlags::POLLOUT),
            PollFd::new(self.isp_out.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.isp_stats.as_fd(), PollFlags::POLLIN),
        ];
        if let Some(meta) = &self.unicam_meta {
            fds.push(PollFd::new(meta.as_fd(), PollFlags::POLLIN));
        }
        let timeout = u16::try_from(self.timeout.as_millis())
            .map(PollTimeout::from)
            .unwrap_or(PollTimeout::MAX);

        let count = loop {
            match poll(&mut fds, timeout) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::kernel(self.unicam.path(), "poll", e)),
            }
        };
        if count == 0 {
            return Err(Error::CaptureTimeout(self.timeout));
        }

        let hit = |i: usize| {
            fds.get(i)
                .and_then(PollFd::revents)
                .is_some_and(|r| !r.is_empty())
        };
        Ok(Ready {
            raw: hit(0),
            isp_in: hit(1),
            output: hit(2),
            stats: hit(3),
            meta: hit(4),
        })
    }

    /// One reactor pass: route raw buffers, run control, emit at most one frame.
    fn step(&mut self) -> Result<Option<Frame>> {
        let ready = self.wait()?;
        trace!(?ready, "Nodes ready");

        if ready.raw {
            hand_off(&mut self.unicam, &mut self.isp_in)?;
        }
        if ready.isp_in {
            hand_off(&mut self.isp_in, &mut self.unicam)?;
        }
        if ready.meta {
            self.embedded_data()?;
        }
        if ready.stats {
            self.statistics()?;
        }
        if ready.output {
            return self.output();
        }
        Ok(None)
    }

    fn output(&mut self) -> Result<Option<Frame>> {
        let Some(buf) = self.isp_out.dequeue()? else {
            return Ok(None);
        };
        let converted = {
            let data = self.isp_out.buffer_bytes(buf.index).unwrap_or_default();
            let used = (buf.bytesused as usize).min(data.len());
            self.converter.convert(&data[..used])
        };
        self.isp_out.enqueue(buf.index)?;
        let data = converted?;

        self.sequence += 1;
        let out = self.converter.output();
        Ok(Some(Frame {
            data,
            meta: Arc::new(FrameMetadata {
                sequence: self.sequence,
                width: out.width,
                height: out.height,
                stride: out.bytes_per_line,
                format: self.converter.target(),
                device_timestamp: Some(buf.timestamp),
            }),
            timestamp: Instant::now(),
        }))
    }

    fn statistics(&mut self) -> Result<()> {
        let Some(buf) = self.isp_stats.dequeue()? else {
            return Ok(());
        };
        let stats = {
            let data = self.isp_stats.buffer_bytes(buf.index).unwrap_or_default();
            let used = (buf.bytesused as usize).min(data.len());
            Statistics::parse(&data[..used])?
        };
        self.isp_stats.enqueue(buf.index)?;

        let mut actuators = HardwareActuators {
            sensor: &self.sensor,
            isp: &self.isp_in,
            lens: self.lens.as_ref(),
        };
        self.controller.process(&stats, &mut actuators)?;

        if let Some(af) = &mut self.autofocus {
            af.process_contrast(&stats);
            // Without embedded data the focus loop runs on the stats cadence.
            if self.unicam_meta.is_none() {
                if let Some(position) = af.prepare(None) {
                    if applied(actuators.set_lens(position))? {
                        self.controller.status_mut().lens_position = Some(position);
                    }
                }
            }
        }
        Ok(())
    }

    fn embedded_data(&mut self) -> Result<()> {
        let Some(meta) = &mut self.unicam_meta else {
            return Ok(());
        };
        let Some(buf) = meta.dequeue()? else {
            return Ok(());
        };
        let regions: Result<PdafRegions> = {
            let data = meta.buffer_bytes(buf.index).unwrap_or_default();
            let used = (buf.bytesused as usize).min(data.len());
            pdaf::parse(&data[..used], self.pdaf_bytes_per_line)
        };
        meta.enqueue(buf.index)?;
        let regions = regions?;

        if let Some(af) = &mut self.autofocus {
            if let Some(position) = af.prepare(Some(&regions)) {
                let mut actuators = HardwareActuators {
                    sensor: &self.sensor,
                    isp: &self.isp_in,
                    lens: self.lens.as_ref(),
                };
                if applied(actuators.set_lens(position))? {
                    self.controller.status_mut().lens_position = Some(position);
                }
            }
        }
        Ok(())
    }
}

impl Producer for UnicamIsp {
    type Output = Frame;

    fn produce(&mut self) -> Result<Option<Frame>> {
        match self.state {
            SessionState::Configuring => self.start()?,
            SessionState::Stopped => return Ok(None),
            SessionState::Streaming => {}
        }
        match self.step() {
            Ok(frame) => {
                if frame.is_some() {
                    counter!("frames_captured").increment(1);
                }
                Ok(frame)
            }
            Err(e) => {
                self.stop();
                Err(e)
            }
        }
    }
}

impl Drop for UnicamIsp {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Writes control decisions to the sensor, ISP and lens nodes.
struct HardwareActuators<'a> {
    sensor: &'a DeviceHandle,
    isp: &'a DeviceHandle,
    lens: Option<&'a DeviceHandle>,
}

impl Actuators for HardwareActuators<'_> {
    fn set_exposure(&mut self, lines: i32, gain_code: i32) -> Result<()> {
        self.sensor.set_controls(&mut [
            v4l2_ext_control::with_value(V4L2_CID_EXPOSURE, lines),
            v4l2_ext_control::with_value(V4L2_CID_ANALOGUE_GAIN, gain_code),
        ])
    }

    fn set_colour_gains(&mut self, gains: ColourGains) -> Result<()> {
        let (red, blue) = gains.to_controls();
        self.isp.set_controls(&mut [
            v4l2_ext_control::with_value(V4L2_CID_RED_BALANCE, red),
            v4l2_ext_control::with_value(V4L2_CID_BLUE_BALANCE, blue),
        ])
    }

    fn set_gamma(&mut self, gamma: &mut bcm2835_isp_gamma) -> Result<()> {
        self.isp.set_compound(V4L2_CID_USER_BCM2835_ISP_GAMMA, gamma)
    }

    fn set_lens(&mut self, position: i32) -> Result<()> {
        match self.lens {
            Some(lens) => lens.set_control(V4L2_CID_FOCUS_ABSOLUTE, position),
            None => Ok(()),
        }
    }
}
