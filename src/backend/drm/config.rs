use std::collections::HashMap;

use drm_fourcc::DrmFourcc;

use super::mode::ModeConfig;
use crate::utils::Transform;

bitflags::bitflags! {
    /// Runtime switches to narrow down which hardware planes are used
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DebugFlags: u32 {
        /// Never put surfaces on the cursor plane
        const DISABLE_CURSORS = 0b001;
        /// Never put surfaces on overlay planes
        const DISABLE_OVERLAYS = 0b010;
        /// Keep overlay assignments, but commit them without a framebuffer
        const HIDE_OVERLAYS = 0b100;
    }
}

/// The renderer producing the composited primary buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RendererKind {
    /// Hardware accelerated rendering
    #[default]
    Gl,
    /// Software rendering
    Pixman,
}

/// Debug toggle, see [`KmsBackend::toggle`](super::KmsBackend::toggle)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebugToggle {
    /// Flip [`DebugFlags::DISABLE_CURSORS`]
    Cursors,
    /// Flip [`DebugFlags::DISABLE_OVERLAYS`]
    Overlays,
    /// Flip [`DebugFlags::HIDE_OVERLAYS`]
    HideOverlays,
    /// Switch between [`RendererKind::Gl`] and [`RendererKind::Pixman`]
    Renderer,
}

/// Per connector configuration
#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfig {
    /// Initial mode of the output
    pub mode: ModeConfig,
    /// Framebuffer format, falls back to [`BackendConfig::format`]
    pub format: Option<DrmFourcc>,
    /// Integer output scale
    pub scale: i32,
    /// Output transform
    pub transform: Transform,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            mode: ModeConfig::Preferred,
            format: None,
            scale: 1,
            transform: Transform::Normal,
        }
    }
}

/// Configuration of a [`KmsBackend`](super::KmsBackend)
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    /// Plane usage switches
    pub debug: DebugFlags,
    /// Renderer producing the primary buffers
    pub renderer: RendererKind,
    /// Never use atomic commits, even if the device supports them.
    ///
    /// Setting the `KMS_SCANOUT_USE_LEGACY` environment variable has the same effect.
    pub force_legacy: bool,
    /// Default framebuffer format of all outputs
    pub format: DrmFourcc,
    /// Keep the mode the connector is driven with on startup, unless configured otherwise
    pub use_current_mode: bool,
    /// Per connector configuration, keyed by connector name (e.g. `HDMI-A-1`)
    pub outputs: HashMap<String, OutputConfig>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            debug: DebugFlags::empty(),
            renderer: RendererKind::Gl,
            force_legacy: false,
            format: DrmFourcc::Xrgb8888,
            use_current_mode: false,
            outputs: HashMap::new(),
        }
    }
}

impl BackendConfig {
    /// Configuration for the connector called `name`
    pub fn output(&self, name: &str) -> OutputConfig {
        let mut config = self.outputs.get(name).cloned().unwrap_or_default();
        if self.use_current_mode && config.mode == ModeConfig::Preferred {
            config.mode = ModeConfig::Current;
        }
        config
    }

    pub(crate) fn legacy_forced(&self) -> bool {
        self.force_legacy || env_forces_legacy()
    }

    pub(crate) fn apply(&mut self, toggle: DebugToggle) -> bool {
        let flag = match toggle {
            DebugToggle::Cursors => DebugFlags::DISABLE_CURSORS,
            DebugToggle::Overlays => DebugFlags::DISABLE_OVERLAYS,
            DebugToggle::HideOverlays => DebugFlags::HIDE_OVERLAYS,
            DebugToggle::Renderer => {
                self.renderer = match self.renderer {
                    RendererKind::Gl => RendererKind::Pixman,
                    RendererKind::Pixman => RendererKind::Gl,
                };
                return self.renderer == RendererKind::Pixman;
            }
        };
        self.debug.toggle(flag);
        self.debug.contains(flag)
    }
}

fn env_forces_legacy() -> bool {
    std::env::var("KMS_SCANOUT_USE_LEGACY")
        .map(|x| {
            let x = x.to_lowercase();
            x == "1" || x == "true" || x == "yes" || x == "y"
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::{BackendConfig, DebugFlags, DebugToggle, OutputConfig, RendererKind};
    use crate::backend::drm::ModeConfig;

    #[test]
    fn toggles_flip_flags() {
        let mut config = BackendConfig::default();
        assert!(config.apply(DebugToggle::Cursors));
        assert!(config.debug.contains(DebugFlags::DISABLE_CURSORS));
        assert!(!config.apply(DebugToggle::Cursors));
        assert!(config.debug.is_empty());

        assert!(config.apply(DebugToggle::Renderer));
        assert_eq!(config.renderer, RendererKind::Pixman);
        assert!(!config.apply(DebugToggle::Renderer));
        assert_eq!(config.renderer, RendererKind::Gl);
    }

    #[test]
    fn current_mode_overrides_preferred_only() {
        let mut config = BackendConfig {
            use_current_mode: true,
            ..Default::default()
        };
        config.outputs.insert(
            "DP-1".into(),
            OutputConfig {
                mode: ModeConfig::Off,
                ..Default::default()
            },
        );

        assert_eq!(config.output("HDMI-A-1").mode, ModeConfig::Current);
        assert_eq!(config.output("DP-1").mode, ModeConfig::Off);
    }
}
