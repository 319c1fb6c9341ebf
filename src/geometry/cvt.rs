//! VESA Coordinated Video Timings mode generation.
//!
//! Produces the same timings as the `cvt` utility (normal blanking,
//! progressive scan), computed in-process.

use std::fmt::{Display, Formatter};

use crate::models::session::ScreenSize;
use crate::{AppError, Result};

use super::ModeGenerator;

const H_GRANULARITY: u32 = 8;
const MIN_V_PORCH: u32 = 3;
const MIN_V_BPORCH: u32 = 6;
const CLOCK_STEP_KHZ: u64 = 250;
const MIN_VSYNC_BP_US: f64 = 550.0;
const HSYNC_PERCENT: u32 = 8;
const M_PRIME: f64 = 300.0;
const C_PRIME: f64 = 30.0;

/// Largest dimension accepted by the generator.
pub const MAX_DIMENSION: u32 = 32_768;

/// A named display timing, as consumed by `xrandr --newmode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modeline {
    /// Mode name, e.g. `1920x1080_60.00`.
    pub name: String,
    /// Pixel clock in kHz.
    pub clock_khz: u64,
    /// Visible width.
    pub hdisplay: u32,
    /// Horizontal sync start.
    pub hsync_start: u32,
    /// Horizontal sync end.
    pub hsync_end: u32,
    /// Total horizontal pixels.
    pub htotal: u32,
    /// Visible height.
    pub vdisplay: u32,
    /// Vertical sync start.
    pub vsync_start: u32,
    /// Vertical sync end.
    pub vsync_end: u32,
    /// Total vertical lines.
    pub vtotal: u32,
}

impl Modeline {
    /// Pixel clock in MHz with two decimals, e.g. `173.00`.
    #[must_use]
    pub fn clock_mhz(&self) -> String {
        format!("{}.{:02}", self.clock_khz / 1000, (self.clock_khz % 1000) / 10)
    }

    /// Arguments following `--newmode`.
    #[must_use]
    pub fn newmode_args(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.clock_mhz(),
            self.hdisplay.to_string(),
            self.hsync_start.to_string(),
            self.hsync_end.to_string(),
            self.htotal.to_string(),
            self.vdisplay.to_string(),
            self.vsync_start.to_string(),
            self.vsync_end.to_string(),
            self.vtotal.to_string(),
            "-hsync".into(),
            "+vsync".into(),
        ]
    }
}

impl Display for Modeline {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Modeline \"{}\"  {}  {} {} {} {}  {} {} {} {} -hsync +vsync",
            self.name,
            self.clock_mhz(),
            self.hdisplay,
            self.hsync_start,
            self.hsync_end,
            self.htotal,
            self.vdisplay,
            self.vsync_start,
            self.vsync_end,
            self.vtotal
        )
    }
}

/// In-process CVT generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct CvtGenerator;

impl ModeGenerator for CvtGenerator {
    fn generate(&self, size: ScreenSize, refresh_hz: f64) -> Result<Modeline> {
        cvt_modeline(size, refresh_hz)
    }
}

/// Vertical sync width derived from the aspect ratio.
fn vsync_width(h: u32, v: u32) -> u32 {
    if v % 3 == 0 && v * 4 / 3 == h {
        4
    } else if v % 9 == 0 && v * 16 / 9 == h {
        5
    } else if v % 10 == 0 && v * 16 / 10 == h {
        6
    } else if (v % 4 == 0 && v * 5 / 4 == h) || (v % 9 == 0 && v * 15 / 9 == h) {
        7
    } else {
        10
    }
}

/// Compute a CVT modeline. Widths are rounded up to a multiple of 8.
///
/// # Errors
///
/// Returns `AppError::Geometry` for zero or oversized dimensions, or a
/// refresh rate the formula cannot satisfy.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)] // Timing math is defined in floating point and truncated by the standard.
pub fn cvt_modeline(size: ScreenSize, refresh_hz: f64) -> Result<Modeline> {
    if size.width == 0 || size.height == 0 {
        return Err(AppError::Geometry(format!("{size} has a zero dimension")));
    }
    if size.width > MAX_DIMENSION || size.height > MAX_DIMENSION {
        return Err(AppError::Geometry(format!(
            "{size} exceeds {MAX_DIMENSION} pixels"
        )));
    }
    if !(refresh_hz.is_finite() && refresh_hz > 0.0) {
        return Err(AppError::Geometry(format!(
            "invalid refresh rate {refresh_hz}"
        )));
    }

    let hdisplay = size.width.div_ceil(H_GRANULARITY) * H_GRANULARITY;
    let vdisplay = size.height;
    let vsync = vsync_width(hdisplay, vdisplay);

    let hperiod_us =
        (1_000_000.0 / refresh_hz - MIN_VSYNC_BP_US) / f64::from(vdisplay + MIN_V_PORCH);
    if hperiod_us <= 0.0 {
        return Err(AppError::Geometry(format!(
            "refresh rate {refresh_hz} too high for {size}"
        )));
    }

    let vsync_bp = ((MIN_VSYNC_BP_US / hperiod_us) as u32 + 1).max(vsync + MIN_V_BPORCH);
    let vtotal = vdisplay + vsync_bp + MIN_V_PORCH;

    let hblank_pct = (C_PRIME - M_PRIME * hperiod_us / 1000.0).max(20.0);
    let mut hblank = (f64::from(hdisplay) * hblank_pct / (100.0 - hblank_pct)) as u32;
    hblank -= hblank % (2 * H_GRANULARITY);
    let htotal = hdisplay + hblank;

    let mut clock_khz = (f64::from(htotal) * 1000.0 / hperiod_us) as u64;
    clock_khz -= clock_khz % CLOCK_STEP_KHZ;

    let hsync_end = hdisplay + hblank / 2;
    let mut hsync = htotal * HSYNC_PERCENT / 100;
    hsync -= hsync % H_GRANULARITY;
    let vsync_start = vdisplay + MIN_V_PORCH;

    Ok(Modeline {
        name: format!("{hdisplay}x{vdisplay}_{refresh_hz:.2}"),
        clock_khz,
        hdisplay,
        hsync_start: hsync_end - hsync,
        hsync_end,
        htotal,
        vdisplay,
        vsync_start,
        vsync_end: vsync_start + vsync,
        vtotal,
    })
}
