use std::{fmt, str::FromStr};

use drm::control::Mode;
use drm_ffi::drm_mode_modeinfo;

use crate::utils::{Physical, Size};

const MODE_TYPE_PREFERRED: u32 = 1 << 3;
const MODE_TYPE_USERDEF: u32 = 1 << 5;

bitflags::bitflags! {
    /// Timing flags of a [`ModeInfo`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ModeFlags: u32 {
        /// Positive horizontal sync
        const PHSYNC = 1 << 0;
        /// Negative horizontal sync
        const NHSYNC = 1 << 1;
        /// Positive vertical sync
        const PVSYNC = 1 << 2;
        /// Negative vertical sync
        const NVSYNC = 1 << 3;
        /// Interlaced scanout
        const INTERLACE = 1 << 4;
        /// Every line is scanned out twice
        const DBLSCAN = 1 << 5;
    }
}

/// Display timings of a connector mode
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModeInfo {
    /// Pixel clock in kHz
    pub clock: u32,
    /// Horizontal active pixels
    pub hdisplay: u16,
    /// Horizontal sync start
    pub hsync_start: u16,
    /// Horizontal sync end
    pub hsync_end: u16,
    /// Horizontal total
    pub htotal: u16,
    /// Horizontal skew
    pub hskew: u16,
    /// Vertical active lines
    pub vdisplay: u16,
    /// Vertical sync start
    pub vsync_start: u16,
    /// Vertical sync end
    pub vsync_end: u16,
    /// Vertical total
    pub vtotal: u16,
    /// Number of times each line is scanned out
    pub vscan: u16,
    /// Timing flags
    pub flags: ModeFlags,
    /// Raw `DRM_MODE_TYPE_*` bits
    pub mode_type: u32,
    /// Human readable name, e.g. `1920x1080`
    pub name: String,
}

impl ModeInfo {
    /// Active area of the mode
    pub fn size(&self) -> Size<i32, Physical> {
        (self.hdisplay as i32, self.vdisplay as i32).into()
    }

    /// Refresh rate in mHz, derived from the timings
    pub fn refresh_mhz(&self) -> u32 {
        if self.htotal == 0 || self.vtotal == 0 {
            return 0;
        }
        let htotal = self.htotal as u64;
        let vtotal = self.vtotal as u64;
        let mut refresh = (self.clock as u64 * 1_000_000 / htotal + vtotal / 2) / vtotal;

        if self.flags.contains(ModeFlags::INTERLACE) {
            refresh *= 2;
        }
        if self.flags.contains(ModeFlags::DBLSCAN) {
            refresh /= 2;
        }
        if self.vscan > 1 {
            refresh /= self.vscan as u64;
        }
        refresh as u32
    }

    /// Whether the connector advertises this mode as its preferred one
    pub fn is_preferred(&self) -> bool {
        self.mode_type & MODE_TYPE_PREFERRED != 0
    }

    /// Kernel representation of this mode
    pub fn to_drm(&self) -> Mode {
        let mut raw = drm_mode_modeinfo {
            clock: self.clock,
            hdisplay: self.hdisplay,
            hsync_start: self.hsync_start,
            hsync_end: self.hsync_end,
            htotal: self.htotal,
            hskew: self.hskew,
            vdisplay: self.vdisplay,
            vsync_start: self.vsync_start,
            vsync_end: self.vsync_end,
            vtotal: self.vtotal,
            vscan: self.vscan,
            vrefresh: (self.refresh_mhz() + 500) / 1000,
            flags: self.flags.bits(),
            type_: self.mode_type,
            name: [0; 32],
        };
        for (dst, src) in raw.name.iter_mut().zip(self.name.bytes().take(31)) {
            *dst = src as _;
        }
        Mode::from(raw)
    }
}

impl From<Mode> for ModeInfo {
    fn from(mode: Mode) -> Self {
        let raw: drm_mode_modeinfo = mode.into();
        let name = raw
            .name
            .iter()
            .take_while(|c| **c != 0)
            .map(|c| *c as u8 as char)
            .collect();
        ModeInfo {
            clock: raw.clock,
            hdisplay: raw.hdisplay,
            hsync_start: raw.hsync_start,
            hsync_end: raw.hsync_end,
            htotal: raw.htotal,
            hskew: raw.hskew,
            vdisplay: raw.vdisplay,
            vsync_start: raw.vsync_start,
            vsync_end: raw.vsync_end,
            vtotal: raw.vtotal,
            vscan: raw.vscan,
            flags: ModeFlags::from_bits_retain(raw.flags),
            mode_type: raw.type_,
            name,
        }
    }
}

impl fmt::Display for ModeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}@{:.1}{}",
            self.hdisplay,
            self.vdisplay,
            self.refresh_mhz() as f64 / 1000.0,
            if self.is_preferred() { ", preferred" } else { "" }
        )
    }
}

/// Error parsing a [`ModeConfig`]
#[derive(Debug, thiserror::Error)]
#[error("Invalid mode `{0}`, expected `preferred`, `current`, `off`, `WxH` or a modeline")]
pub struct ParseModeError(String);

/// How the initial mode of an output is picked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeConfig {
    /// The connector's preferred mode
    Preferred,
    /// The mode the connector is currently driven with
    Current,
    /// Do not light up the connector
    Off,
    /// The first mode of the given size
    Size(Size<i32, Physical>),
    /// A custom modeline
    Modeline(ModeInfo),
}

impl FromStr for ModeConfig {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "preferred" => return Ok(ModeConfig::Preferred),
            "current" => return Ok(ModeConfig::Current),
            "off" => return Ok(ModeConfig::Off),
            _ => {}
        }

        if let Some((w, h)) = s.split_once('x') {
            if let (Ok(w), Ok(h)) = (w.parse::<u16>(), h.parse::<u16>()) {
                return Ok(ModeConfig::Size((w as i32, h as i32).into()));
            }
        }

        parse_modeline(s)
            .map(ModeConfig::Modeline)
            .ok_or_else(|| ParseModeError(s.to_string()))
    }
}

// clock(MHz) hdisp hsync_start hsync_end htotal vdisp vsync_start vsync_end vtotal ±hsync ±vsync
fn parse_modeline(s: &str) -> Option<ModeInfo> {
    let fields = s.split_whitespace().collect::<Vec<_>>();
    if fields.len() != 11 {
        return None;
    }

    let clock = fields[0].parse::<f32>().ok()?;
    let mut timings = [0u16; 8];
    for (timing, field) in timings.iter_mut().zip(&fields[1..9]) {
        *timing = field.parse().ok()?;
    }

    let mut flags = match fields[9] {
        "+hsync" => ModeFlags::PHSYNC,
        "-hsync" => ModeFlags::NHSYNC,
        _ => return None,
    };
    flags |= match fields[10] {
        "+vsync" => ModeFlags::PVSYNC,
        "-vsync" => ModeFlags::NVSYNC,
        _ => return None,
    };

    Some(ModeInfo {
        clock: (clock * 1000.0) as u32,
        hdisplay: timings[0],
        hsync_start: timings[1],
        hsync_end: timings[2],
        htotal: timings[3],
        hskew: 0,
        vdisplay: timings[4],
        vsync_start: timings[5],
        vsync_end: timings[6],
        vtotal: timings[7],
        vscan: 0,
        flags,
        mode_type: MODE_TYPE_USERDEF,
        name: format!("{}x{}@{:.3}", timings[0], timings[4], clock),
    })
}

/// Find the closest match for `size`/`refresh_mhz` amongst `modes`
///
/// The mode at `current` is kept if it matches, avoiding a mode-set. Otherwise the
/// first mode of the right size with the same refresh rate wins, falling back to the
/// first mode of the right size. A `refresh_mhz` of 0 matches any rate.
pub fn choose_mode(
    modes: &[ModeInfo],
    current: usize,
    size: Size<i32, Physical>,
    refresh_mhz: u32,
) -> Option<usize> {
    let matches_refresh = |mode: &ModeInfo| refresh_mhz == 0 || mode.refresh_mhz() == refresh_mhz;

    if let Some(mode) = modes.get(current) {
        if mode.size() == size && matches_refresh(mode) {
            return Some(current);
        }
    }

    let mut fallback = None;
    for (idx, mode) in modes.iter().enumerate() {
        if mode.size() != size {
            continue;
        }
        if matches_refresh(mode) {
            return Some(idx);
        }
        fallback.get_or_insert(idx);
    }
    fallback
}

/// Pick the mode an output starts with
///
/// Configured modelines and a crtc mode missing from the connector's list are
/// appended to `modes`. The order of preference is the configured mode, the crtc's
/// current mode (if requested), the preferred mode, the crtc's current mode and
/// finally the first mode.
pub(crate) fn choose_initial_mode(
    modes: &mut Vec<ModeInfo>,
    config: &ModeConfig,
    crtc_mode: Option<&ModeInfo>,
) -> Option<usize> {
    let mut configured = None;
    if let ModeConfig::Modeline(modeline) = config {
        modes.push(modeline.clone());
        configured = Some(modes.len() - 1);
    }

    let wanted_size = match config {
        ModeConfig::Size(size) => Some(*size),
        _ => None,
    };

    if configured.is_none() {
        configured = wanted_size.and_then(|size| modes.iter().position(|m| m.size() == size));
    }
    let preferred = modes.iter().position(ModeInfo::is_preferred);
    let mut current = crtc_mode.and_then(|crtc_mode| modes.iter().position(|m| m == crtc_mode));

    if current.is_none() {
        if let Some(crtc_mode) = crtc_mode.filter(|m| m.clock != 0) {
            modes.push(crtc_mode.clone());
            current = Some(modes.len() - 1);
        }
    }

    if *config == ModeConfig::Current {
        configured = current;
    }

    configured
        .or(preferred)
        .or(current)
        .or(if modes.is_empty() { None } else { Some(0) })
}
