//! Lens control from phase-detect data and contrast scans.
//!
//! In continuous mode the lens follows the PDAF phase every frame. When the
//! phase confidence drops out for too long, or the sensor has no PDAF, a
//! programmed scan steps the lens through the focus range coarsely then
//! finely, estimates the contrast peak and settles there.
//!
//! Lens positions are in dioptres internally and mapped to the driver's
//! focus control through a piecewise-linear curve.

pub mod pdaf;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use self::pdaf::PdafRegions;
use crate::capture::mode::CameraMode;
use crate::capture::stats::Statistics;
use crate::control::pwl::Pwl;
use crate::v4l2::sys::v4l2_rect;
use crate::AutofocusConfig;

pub const CONTRAST_ROWS: usize = 3;
pub const CONTRAST_COLS: usize = 4;
pub const MAX_WINDOWS: usize = 10;
/// Total weight shared by all cells of all windows.
const WEIGHT_BUDGET: f64 = 46080.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AfRange {
    #[default]
    Normal,
    Macro,
    Full,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AfSpeed {
    #[default]
    Normal,
    Fast,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AfMode {
    Manual,
    Auto,
    #[default]
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfPause {
    Immediate,
    Deferred,
    Resume,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AfState {
    #[default]
    Idle,
    Scanning,
    Focused,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PauseState {
    #[default]
    Running,
    Pausing,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScanState {
    Idle,
    Trigger,
    Pdaf,
    Coarse,
    Fine,
    Settle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AfStatus {
    pub state: AfState,
    pub pause_state: PauseState,
    /// Last value written to the lens, if any.
    pub lens_setting: Option<i32>,
}

/// Focus limits in dioptres.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RangeParams {
    pub min: f64,
    pub max: f64,
    pub default: f64,
}

impl Default for RangeParams {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 12.0,
            default: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct RangeOverride {
    min: Option<f64>,
    max: Option<f64>,
    default: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SpeedParams {
    pub step_coarse: f64,
    pub step_fine: f64,
    pub contrast_ratio: f64,
    pub pdaf_gain: f64,
    pub pdaf_squelch: f64,
    pub max_slew: f64,
    pub pdaf_frames: u32,
    pub dropout_frames: u32,
    pub step_frames: u32,
}

impl Default for SpeedParams {
    fn default() -> Self {
        Self {
            step_coarse: 1.0,
            step_fine: 0.25,
            contrast_ratio: 0.75,
            pdaf_gain: -0.02,
            pdaf_squelch: 0.125,
            max_slew: 2.0,
            pdaf_frames: 20,
            dropout_frames: 6,
            step_frames: 4,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawRanges {
    #[serde(default)]
    normal: Option<RangeParams>,
    #[serde(default, rename = "macro")]
    macro_range: Option<RangeParams>,
    #[serde(default)]
    full: Option<RangeOverride>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawSpeeds {
    #[serde(default)]
    normal: Option<SpeedParams>,
    #[serde(default)]
    fast: Option<SpeedParams>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawAfParams {
    ranges: Option<RawRanges>,
    speeds: Option<RawSpeeds>,
    conf_epsilon: Option<u32>,
    conf_thresh: Option<u32>,
    conf_clip: Option<u32>,
    skip_frames: Option<u32>,
    map: Option<Pwl>,
}

/// `rpi.af` tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "RawAfParams")]
pub struct AfParams {
    pub normal: RangeParams,
    pub macro_range: RangeParams,
    pub full: RangeParams,
    pub speed_normal: SpeedParams,
    pub speed_fast: SpeedParams,
    pub conf_epsilon: u32,
    pub conf_thresh: u32,
    pub conf_clip: u32,
    pub skip_frames: u32,
    /// Dioptres to lens control value.
    pub map: Pwl,
}

impl Default for AfParams {
    fn default() -> Self {
        Self::from(RawAfParams::default())
    }
}

impl From<RawAfParams> for AfParams {
    fn from(raw: RawAfParams) -> Self {
        let ranges = raw.ranges.unwrap_or_default();
        let normal = ranges.normal.unwrap_or_default();
        let macro_range = ranges.macro_range.unwrap_or_default();
        // Full spans both unless the tuning says otherwise.
        let over = ranges.full.unwrap_or_default();
        let full = RangeParams {
            min: over.min.unwrap_or(normal.min.min(macro_range.min)),
            max: over.max.unwrap_or(normal.max.max(macro_range.max)),
            default: over.default.unwrap_or(normal.default),
        };
        let speeds = raw.speeds.unwrap_or_default();

        Self {
            normal,
            macro_range,
            full,
            speed_normal: speeds.normal.unwrap_or_default(),
            speed_fast: speeds.fast.unwrap_or_default(),
            conf_epsilon: raw.conf_epsilon.unwrap_or(8),
            conf_thresh: raw.conf_thresh.unwrap_or(16),
            conf_clip: raw.conf_clip.unwrap_or(512),
            skip_frames: raw.skip_frames.unwrap_or(5),
            map: raw
                .map
                .unwrap_or_else(|| Pwl::from_points(&[(0.0, 445.0), (15.0, 925.0)])),
        }
    }
}

impl AfParams {
    pub fn range(&self, range: AfRange) -> &RangeParams {
        match range {
            AfRange::Normal => &self.normal,
            AfRange::Macro => &self.macro_range,
            AfRange::Full => &self.full,
        }
    }

    pub fn speed(&self, speed: AfSpeed) -> &SpeedParams {
        match speed {
            AfSpeed::Normal => &self.speed_normal,
            AfSpeed::Fast => &self.speed_fast,
        }
    }
}

/// Rectangle in full pixel array coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Maps output image coordinates back to the pixel array: undo the output
/// scaling and ISP input crop, then the mode's binning and crop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowTransform {
    pub mode: CameraMode,
    pub crop: v4l2_rect,
    pub output_width: u32,
    pub output_height: u32,
}

impl WindowTransform {
    /// Area of the pixel array covered by the ISP statistics.
    pub fn stats_region(&self) -> Rect {
        let m = &self.mode;
        Rect {
            x: m.crop_x as i32,
            y: m.crop_y as i32,
            width: m.sensor_width as i32 - 2 * m.crop_x as i32,
            height: m.sensor_height as i32 - 2 * m.crop_y as i32,
        }
    }

    /// `[x1, y1, x2, y2]` in output pixels to a pixel array rectangle.
    pub fn to_sensor(&self, bbox: [f64; 4]) -> Rect {
        let [x1, y1, x2, y2] = bbox;
        let sx = f64::from(self.crop.width) / f64::from(self.output_width.max(1));
        let sy = f64::from(self.crop.height) / f64::from(self.output_height.max(1));
        let m = &self.mode;
        let x = (x1 * sx + f64::from(self.crop.left)) * m.scale_x + f64::from(m.crop_x);
        let y = (y1 * sy + f64::from(self.crop.top)) * m.scale_y + f64::from(m.crop_y);
        Rect {
            x: x.round() as i32,
            y: y.round() as i32,
            width: ((x2 - x1) * sx * m.scale_x).round() as i32,
            height: ((y2 - y1) * sy * m.scale_y).round() as i32,
        }
    }
}

/// One sample taken during a programmed scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanRecord {
    pub focus: f64,
    pub contrast: f64,
    pub phase: f64,
    pub conf: f64,
}

#[derive(Debug, Clone, Default)]
struct RegionWeights {
    rows: usize,
    cols: usize,
    sum: f64,
    w: Vec<f64>,
}

pub struct Autofocus {
    params: AfParams,
    range: AfRange,
    speed: AfSpeed,
    mode: AfMode,
    pause_flag: bool,
    stats_region: Rect,
    transform: Option<WindowTransform>,
    windows: Vec<Rect>,
    phase_weights: RegionWeights,
    contrast_weights: RegionWeights,
    scan_state: ScanState,
    initted: bool,
    ftarget: f64,
    fsmooth: f64,
    prev_contrast: f64,
    skip_count: u32,
    step_count: u32,
    drop_count: u32,
    scan_max_contrast: f64,
    scan_min_contrast: f64,
    scan_max_index: usize,
    scan_data: Vec<ScanRecord>,
    report_state: AfState,
    status: AfStatus,
}

impl Autofocus {
    pub fn new(params: AfParams, config: &AutofocusConfig) -> Self {
        let scan_state = match config.mode {
            AfMode::Continuous => ScanState::Trigger,
            _ => ScanState::Idle,
        };
        Self {
            params,
            range: config.range,
            speed: config.speed,
            mode: config.mode,
            pause_flag: false,
            stats_region: Rect::default(),
            transform: None,
            windows: Vec::new(),
            phase_weights: RegionWeights::default(),
            contrast_weights: RegionWeights::default(),
            scan_state,
            initted: false,
            ftarget: -1.0,
            fsmooth: -1.0,
            prev_contrast: 0.0,
            skip_count: 0,
            step_count: 0,
            drop_count: 0,
            scan_max_contrast: 0.0,
            scan_min_contrast: 1e9,
            scan_max_index: 0,
            scan_data: Vec::new(),
            report_state: AfState::Idle,
            status: AfStatus::default(),
        }
    }

    /// Geometry needed to place focus windows on the pixel array.
    pub fn set_geometry(&mut self, transform: WindowTransform) {
        self.stats_region = transform.stats_region();
        self.transform = Some(transform);
        self.invalidate_weights();
    }

    pub fn status(&self) -> AfStatus {
        self.status
    }

    pub fn scan_state(&self) -> ScanState {
        self.scan_state
    }

    /// Target lens position in dioptres.
    pub fn lens_target(&self) -> f64 {
        self.ftarget
    }

    /// Slew-limited lens position in dioptres.
    pub fn lens_position(&self) -> f64 {
        self.fsmooth
    }

    pub fn focus_value(&self) -> Option<i32> {
        self.status.lens_setting
    }

    /// Focus windows as `[x1, y1, x2, y2]` in output image pixels. Only the
    /// first few are kept.
    pub fn set_focus_windows(&mut self, bboxes: &[[f64; 4]]) {
        self.windows.clear();
        if let Some(t) = &self.transform {
            self.windows
                .extend(bboxes.iter().take(MAX_WINDOWS).map(|b| t.to_sensor(*b)));
        }
        debug!(windows = self.windows.len(), "focus windows set");
        self.invalidate_weights();
    }

    /// Start a one-shot scan. Only meaningful in auto mode when idle.
    pub fn trigger_scan(&mut self) {
        if self.mode == AfMode::Auto && self.scan_state == ScanState::Idle {
            self.scan_state = ScanState::Trigger;
        }
    }

    pub fn pause(&mut self, pause: AfPause) {
        if self.mode != AfMode::Continuous {
            return;
        }
        if pause == AfPause::Resume && self.pause_flag {
            self.pause_flag = false;
            if self.scan_state < ScanState::Coarse {
                self.scan_state = ScanState::Trigger;
            }
        } else if pause != AfPause::Resume && !self.pause_flag {
            self.pause_flag = true;
            if pause == AfPause::Immediate || self.scan_state < ScanState::Coarse {
                self.go_idle();
            }
        }
    }

    /// Manual lens setting in driver units. Returns the value to write, or
    /// `None` outside manual mode or off the end of the map.
    pub fn set_focus_value(&mut self, value: i32) -> Option<i32> {
        if self.mode != AfMode::Manual {
            return None;
        }
        let target = self.params.map.inverse_eval(f64::from(value))?;
        self.status.lens_setting = Some(value);
        self.ftarget = target;
        self.update_lens_position();
        Some(value)
    }

    /// Record the focus contrast of a statistics block for the next step.
    pub fn process_contrast(&mut self, stats: &Statistics) {
        self.prev_contrast = self.contrast(stats);
    }

    /// Advance one frame. Returns the lens setting to write, if the lens
    /// position is known.
    pub fn prepare(&mut self, regions: Option<&PdafRegions>) -> Option<i32> {
        if self.scan_state == ScanState::Trigger {
            self.start_af();
        }

        if self.initted {
            let (phase, conf) = regions.and_then(|r| self.phase(r)).unwrap_or((0.0, 0.0));
            self.do_af(self.prev_contrast, phase, conf);
            self.update_lens_position();
        }

        self.status.pause_state = match (self.pause_flag, self.scan_state) {
            (false, _) => PauseState::Running,
            (true, ScanState::Idle) => PauseState::Paused,
            (true, _) => PauseState::Pausing,
        };
        self.status.state = if self.mode == AfMode::Auto && self.scan_state != ScanState::Idle {
            AfState::Scanning
        } else {
            self.report_state
        };

        self.status.lens_setting = if self.initted {
            Some(self.params.map.eval(self.fsmooth) as i32)
        } else {
            None
        };
        trace!(
            state = ?self.scan_state,
            target = self.ftarget,
            smooth = self.fsmooth,
            lens = ?self.status.lens_setting,
            "af step"
        );
        self.status.lens_setting
    }

    fn go_idle(&mut self) {
        self.scan_state = ScanState::Idle;
        self.report_state = AfState::Idle;
        self.scan_data.clear();
    }

    fn update_lens_position(&mut self) {
        if self.scan_state >= ScanState::Pdaf {
            let r = self.params.range(self.range);
            self.ftarget = self.ftarget.clamp(r.min, r.max);
        }
        if self.initted {
            let slew = self.params.speed(self.speed).max_slew;
            self.fsmooth = self.ftarget.clamp(self.fsmooth - slew, self.fsmooth + slew);
        } else {
            self.fsmooth = self.ftarget;
            self.initted = true;
            self.skip_count = self.params.skip_frames;
        }
    }

    fn start_af(&mut self) {
        let speed = *self.params.speed(self.speed);
        if speed.dropout_frames > 0 && (self.mode == AfMode::Continuous || speed.pdaf_frames > 0) {
            if !self.initted {
                self.ftarget = self.params.range(self.range).default;
                self.update_lens_position();
            }
            self.step_count = if self.mode == AfMode::Continuous {
                0
            } else {
                speed.pdaf_frames
            };
            self.scan_state = ScanState::Pdaf;
            self.scan_data.clear();
            self.drop_count = 0;
            self.report_state = AfState::Scanning;
        } else {
            self.start_programmed_scan();
        }
    }

    fn start_programmed_scan(&mut self) {
        self.ftarget = self.params.range(self.range).min;
        self.update_lens_position();
        self.scan_state = ScanState::Coarse;
        self.scan_max_contrast = 0.0;
        self.scan_min_contrast = 1e9;
        self.scan_max_index = 0;
        self.scan_data.clear();
        self.step_count = self.params.speed(self.speed).step_frames;
        self.report_state = AfState::Scanning;
    }

    fn do_pdaf(&mut self, mut phase: f64, conf: f64) {
        let speed = *self.params.speed(self.speed);
        let range = *self.params.range(self.range);
        phase *= speed.pdaf_gain;

        if self.mode == AfMode::Continuous {
            // Soften small moves to damp hunting around focus.
            phase *= conf / (conf + f64::from(self.params.conf_epsilon));
            if phase.abs() < speed.pdaf_squelch {
                let a = phase / speed.pdaf_squelch;
                phase *= a * a;
            }
        } else if self.step_count >= speed.step_frames {
            if phase.abs() < speed.pdaf_squelch {
                self.step_count = speed.step_frames;
            }
        } else {
            phase *= f64::from(self.step_count) / f64::from(speed.step_frames);
        }

        if phase < -speed.max_slew {
            phase = -speed.max_slew;
            self.report_state = if self.ftarget <= range.min {
                AfState::Failed
            } else {
                AfState::Scanning
            };
        } else if phase > speed.max_slew {
            phase = speed.max_slew;
            self.report_state = if self.ftarget >= range.max {
                AfState::Failed
            } else {
                AfState::Scanning
            };
        } else {
            self.report_state = AfState::Focused;
        }
        self.ftarget = self.fsmooth + phase;
    }

    /// Jump straight to where the phase crosses zero if the last two
    /// samples straddle it.
    fn early_termination_by_phase(&mut self, phase: f64) -> bool {
        let Some(last) = self.scan_data.last() else {
            return false;
        };
        if last.conf < f64::from(self.params.conf_epsilon) {
            return false;
        }
        if (self.ftarget - last.focus) * (phase - last.phase) > 0.0 {
            let param = phase / (phase - last.phase);
            if (-3.0..=3.5).contains(&param) {
                self.ftarget += param * (last.focus - self.ftarget);
                return true;
            }
        }
        false
    }

    fn do_scan(&mut self, contrast: f64, phase: f64, conf: f64) {
        let speed = *self.params.speed(self.speed);
        let range = *self.params.range(self.range);
        if self.scan_data.is_empty() || contrast > self.scan_max_contrast {
            self.scan_max_contrast = contrast;
            self.scan_max_index = self.scan_data.len();
        }
        self.scan_min_contrast = self.scan_min_contrast.min(contrast);
        self.scan_data.push(ScanRecord {
            focus: self.ftarget,
            contrast,
            phase,
            conf,
        });

        let dropped = contrast < speed.contrast_ratio * self.scan_max_contrast;
        if self.scan_state == ScanState::Coarse {
            if self.ftarget >= range.max || dropped {
                // Fine scan walks back down from just above the peak.
                let peak = find_peak(&self.scan_data, self.scan_max_index);
                self.ftarget = self.ftarget.min(peak + 2.0 * speed.step_fine);
                self.scan_state = ScanState::Fine;
                self.scan_data.clear();
            } else {
                self.ftarget += speed.step_coarse;
            }
        } else if self.ftarget <= range.min || self.scan_data.len() >= 5 || dropped {
            self.ftarget = find_peak(&self.scan_data, self.scan_max_index);
            self.scan_state = ScanState::Settle;
        } else {
            self.ftarget -= speed.step_fine;
        }

        self.step_count = if self.ftarget == self.fsmooth {
            0
        } else {
            speed.step_frames
        };
    }

    fn do_af(&mut self, contrast: f64, phase: f64, conf: f64) {
        if self.skip_count > 0 {
            self.skip_count -= 1;
            return;
        }
        let speed = *self.params.speed(self.speed);
        let epsilon = f64::from(self.params.conf_epsilon);

        if self.scan_state == ScanState::Pdaf {
            let floor = if self.drop_count != 0 { 1.0 } else { 0.25 };
            if conf > floor * epsilon {
                self.do_pdaf(phase, conf);
                if self.step_count > 0 {
                    self.step_count -= 1;
                } else if self.mode != AfMode::Continuous {
                    self.scan_state = ScanState::Idle;
                }
                self.drop_count = 0;
            } else {
                self.drop_count += 1;
                if self.drop_count == speed.dropout_frames {
                    debug!(frames = self.drop_count, "PDAF dropout, starting scan");
                    self.start_programmed_scan();
                }
            }
        } else if self.scan_state >= ScanState::Coarse && self.fsmooth == self.ftarget {
            if self.step_count > 0 {
                self.step_count -= 1;
            } else if self.scan_state == ScanState::Settle {
                let threshold = speed.contrast_ratio * self.scan_max_contrast;
                self.report_state =
                    if self.prev_contrast >= threshold && self.scan_min_contrast <= threshold {
                        AfState::Focused
                    } else {
                        AfState::Failed
                    };
                debug!(state = ?self.report_state, position = self.fsmooth, "scan settled");
                self.scan_state = if self.mode == AfMode::Continuous
                    && !self.pause_flag
                    && speed.dropout_frames > 0
                {
                    ScanState::Pdaf
                } else {
                    ScanState::Idle
                };
                self.scan_data.clear();
            } else if conf >= epsilon && self.early_termination_by_phase(phase) {
                self.scan_state = ScanState::Settle;
                self.step_count = if self.mode == AfMode::Continuous {
                    0
                } else {
                    speed.step_frames
                };
            } else {
                self.do_scan(contrast, phase, conf);
            }
        }
    }

    fn invalidate_weights(&mut self) {
        self.phase_weights.sum = 0.0;
        self.contrast_weights.sum = 0.0;
    }

    /// Weighted phase and confidence over the grid, or `None` if too little
    /// of it is confident.
    fn phase(&mut self, regions: &PdafRegions) -> Option<(f64, f64)> {
        let w = &self.phase_weights;
        if regions.rows != w.rows || regions.cols != w.cols || w.sum == 0.0 {
            self.phase_weights =
                compute_weights(&self.windows, self.stats_region, regions.rows, regions.cols);
        }

        let thresh = self.params.conf_thresh;
        let (mut sum_wc, mut sum_wcp) = (0i64, 0i64);
        for (data, &w) in regions.cells.iter().zip(&self.phase_weights.w) {
            if w == 0.0 || u32::from(data.conf) < thresh {
                continue;
            }
            let mut c = u32::from(data.conf).min(self.params.conf_clip) as i64;
            c -= i64::from(thresh >> 2);
            sum_wc += (w * c as f64) as i64;
            c -= i64::from(thresh >> 2);
            sum_wcp += (w * c as f64) as i64 * i64::from(data.phase);
        }

        let total = self.phase_weights.sum;
        if total > 0.0 && total <= sum_wc as f64 {
            Some((sum_wcp as f64 / sum_wc as f64, sum_wc as f64 / total))
        } else {
            None
        }
    }

    fn contrast(&mut self, stats: &Statistics) -> f64 {
        if self.contrast_weights.sum == 0.0 {
            self.contrast_weights =
                compute_weights(&self.windows, self.stats_region, CONTRAST_ROWS, CONTRAST_COLS);
        }
        let w = &self.contrast_weights;
        if w.sum <= 0.0 {
            return 0.0;
        }
        let sum: f64 = stats
            .focus
            .iter()
            .zip(&w.w)
            .map(|(region, w)| w * region.contrast_val[1][1] as f64 / 1000.0)
            .sum();
        sum / w.sum
    }
}

/// Peak position from the best sample, nudged toward the neighbour whose
/// contrast drop is smaller.
pub fn find_peak(scan: &[ScanRecord], i: usize) -> f64 {
    let Some(best) = scan.get(i) else {
        return 0.0;
    };
    let mut f = best.focus;
    if i > 0 && i + 1 < scan.len() {
        let drop_lo = best.contrast - scan[i - 1].contrast;
        let drop_hi = best.contrast - scan[i + 1].contrast;
        if 0.0 <= drop_lo && drop_lo < drop_hi {
            let r = drop_lo / drop_hi;
            let param = 0.3125 * (1.0 - r) * (1.6 - r);
            f += param * (scan[i - 1].focus - f);
        } else if 0.0 <= drop_hi && drop_hi < drop_lo {
            let r = drop_hi / drop_lo;
            let param = 0.3125 * (1.0 - r) * (1.6 - r);
            f += param * (scan[i + 1].focus - f);
        }
    }
    f
}

/// Spread each window's area over the `rows`x`cols` grid covering
/// `region`. With no usable window the middle third by half of the grid
/// gets unit weight.
fn compute_weights(windows: &[Rect], region: Rect, rows: usize, cols: usize) -> RegionWeights {
    let mut weights = RegionWeights {
        rows,
        cols,
        sum: 0.0,
        w: vec![0.0; rows * cols],
    };

    if rows > 0
        && cols > 0
        && !windows.is_empty()
        && region.height >= rows as i32
        && region.width >= cols as i32
    {
        let max_cell_weight = (WEIGHT_BUDGET as usize / (MAX_WINDOWS * rows * cols)) as f64;
        let cell_h = region.height / rows as i32;
        let cell_w = region.width / cols as i32;
        let cell_a = f64::from(cell_h * cell_w);
        for win in windows {
            for r in 0..rows as i32 {
                let y0 = (region.y + cell_h * r).max(win.y);
                let y1 = (region.y + cell_h * (r + 1)).min(win.y + win.height);
                if y0 >= y1 {
                    continue;
                }
                for c in 0..cols as i32 {
                    let x0 = (region.x + cell_w * c).max(win.x);
                    let x1 = (region.x + cell_w * (c + 1)).min(win.x + win.width);
                    if x0 >= x1 {
                        continue;
                    }
                    let area = f64::from(y1 - y0) * f64::from(x1 - x0);
                    let a = (max_cell_weight * area + cell_a - 1.0) / cell_a;
                    weights.w[r as usize * cols + c as usize] += a;
                    weights.sum += a;
                }
            }
        }
    }

    if weights.sum == 0.0 {
        for r in rows / 3..rows - rows / 3 {
            for c in cols / 4..cols - cols / 4 {
                weights.w[r * cols + c] = 1.0;
                weights.sum += 1.0;
            }
        }
    }
    weights
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::sensor::SensorModel;

    fn record(focus: f64, contrast: f64) -> ScanRecord {
        ScanRecord {
            focus,
            contrast,
            phase: 0.0,
            conf: 0.0,
        }
    }

    fn config(mode: AfMode) -> AutofocusConfig {
        AutofocusConfig {
            mode,
            ..AutofocusConfig::default()
        }
    }

    fn no_pdaf() -> AfParams {
        let mut params = AfParams::default();
        params.speed_normal.dropout_frames = 0;
        params
    }

    fn stats_with_contrast(value: f64) -> Statistics {
        let mut stats = Statistics::default();
        for region in stats.focus.iter_mut() {
            region.contrast_val[1][1] = (value * 1000.0).round() as u64;
        }
        stats
    }

    fn scene(f: f64) -> f64 {
        100.0 - 10.0 * (f - 5.0).abs()
    }

    #[test]
    fn test_triangular_peak_is_middle_sample() {
        let scan = [record(1.0, 10.0), record(2.0, 20.0), record(3.0, 10.0)];
        assert_eq!(find_peak(&scan, 1), 2.0);
    }

    #[test]
    fn test_asymmetric_peak_leans_to_smaller_drop() {
        let scan = [record(1.0, 18.0), record(2.0, 20.0), record(3.0, 10.0)];
        let f = find_peak(&scan, 1);
        assert!(f < 2.0 && f > 1.0);
        // No neighbours: the sample itself.
        assert_eq!(find_peak(&scan[..1], 0), 1.0);
    }

    #[test]
    fn test_full_range_spans_normal_and_macro() {
        let params: AfParams = serde_json::from_str(
            r#"{"ranges": {"normal": {"min": 0.0, "max": 12.0, "default": 1.0},
                           "macro": {"min": 3.0, "max": 15.0, "default": 4.0}},
                "speeds": {"fast": {"step_coarse": 2.0}},
                "map": [0.0, 420, 15.0, 920]}"#,
        )
        .unwrap();
        assert_eq!(params.full, RangeParams { min: 0.0, max: 15.0, default: 1.0 });
        assert_eq!(params.speed_fast.step_coarse, 2.0);
        assert_eq!(params.speed_fast.step_fine, 0.25);
        assert_eq!(params.map.eval(15.0), 920.0);
    }

    #[test]
    fn test_programmed_scan_finds_peak() {
        let mut af = Autofocus::new(no_pdaf(), &config(AfMode::Auto));
        af.trigger_scan();

        let mut coarse = Vec::new();
        for _ in 0..400 {
            af.process_contrast(&stats_with_contrast(scene(af.lens_position())));
            af.prepare(None);
            if af.scan_state() == ScanState::Coarse {
                coarse.push(af.lens_target());
            }
            if af.scan_state() == ScanState::Idle {
                break;
            }
        }

        assert!(coarse.len() > 3);
        assert!(coarse.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(af.scan_state(), ScanState::Idle);
        assert_eq!(af.status().state, AfState::Focused);
        assert!((af.lens_position() - 5.0).abs() < 0.25);
        assert_eq!(af.focus_value(), Some((445.0 + 5.0 * 32.0) as i32));
    }

    #[test]
    fn test_pdaf_moves_against_phase() {
        let mut af = Autofocus::new(AfParams::default(), &config(AfMode::Continuous));
        let regions = PdafRegions::uniform(200, 40);
        // Skip frames, then one PDAF step.
        for _ in 0..=AfParams::default().skip_frames {
            af.prepare(Some(&regions));
        }
        let start = af.lens_position();
        af.prepare(Some(&regions));
        assert!(af.lens_target() < start);
        assert_eq!(af.scan_state(), ScanState::Pdaf);
    }

    #[test]
    fn test_pdaf_dropout_falls_back_to_scan() {
        let mut af = Autofocus::new(AfParams::default(), &config(AfMode::Continuous));
        let dark = PdafRegions::uniform(0, 0);
        let skip = AfParams::default().skip_frames;
        let dropout = AfParams::default().speed_normal.dropout_frames;
        // The first call both starts the hunt and burns a skip frame.
        for _ in 0..skip {
            af.prepare(Some(&dark));
        }
        for _ in 0..dropout - 1 {
            af.prepare(Some(&dark));
            assert_eq!(af.scan_state(), ScanState::Pdaf);
        }
        af.prepare(Some(&dark));
        assert_eq!(af.scan_state(), ScanState::Coarse);
    }

    #[test]
    fn test_manual_focus_value() {
        let mut af = Autofocus::new(AfParams::default(), &config(AfMode::Manual));
        assert_eq!(af.prepare(None), None);
        assert_eq!(af.set_focus_value(605), Some(605));
        assert!((af.lens_target() - 5.0).abs() < 1e-9);
        assert_eq!(af.prepare(None), Some(605));

        let mut auto = Autofocus::new(AfParams::default(), &config(AfMode::Auto));
        assert_eq!(auto.set_focus_value(605), None);
    }

    #[test]
    fn test_pause_and_resume() {
        let mut af = Autofocus::new(AfParams::default(), &config(AfMode::Continuous));
        af.prepare(None);
        af.pause(AfPause::Immediate);
        af.prepare(None);
        assert_eq!(af.status().pause_state, PauseState::Paused);
        af.pause(AfPause::Resume);
        assert_eq!(af.scan_state(), ScanState::Trigger);
        af.prepare(None);
        assert_eq!(af.status().pause_state, PauseState::Running);
    }

    #[test]
    fn test_windows_map_to_sensor_and_weight_cells() {
        let mode = CameraMode::select(SensorModel::Imx708, 1536, 864, 30).unwrap();
        let crop = mode.aspect_crop(1536, 864);
        let t = WindowTransform {
            mode,
            crop,
            output_width: 1536,
            output_height: 864,
        };
        let region = t.stats_region();
        assert_eq!(region, Rect { x: 768, y: 432, width: 3072, height: 1728 });
        let win = t.to_sensor([0.0, 0.0, 1536.0, 864.0]);
        assert_eq!(win, region);

        // A window over the top-left quarter lands in the top-left cells.
        let quarter = t.to_sensor([0.0, 0.0, 768.0, 432.0]);
        let w = compute_weights(&[quarter], region, 12, 16);
        assert!(w.sum > 0.0);
        assert!(w.w[0] > 0.0);
        assert_eq!(w.w[12 * 16 - 1], 0.0);
    }

    #[test]
    fn test_default_weights_centre() {
        let w = compute_weights(&[], Rect::default(), CONTRAST_ROWS, CONTRAST_COLS);
        assert_eq!(w.sum, 2.0);
        assert_eq!(w.w[5], 1.0);
        assert_eq!(w.w[6], 1.0);
    }
}
