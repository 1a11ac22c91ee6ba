// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section and field has a default, so an absent file or a partial file
// both work. Values are validated once after loading; an invalid config is a
// fatal init error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::backend::{BackendKind, BackendSettings, PresentMode};
use crate::error::InitError;
use crate::surface::Extent;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub controls: ControlsConfig,
    pub output: OutputConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Canvas Bridge".to_string(),
            width: 800,
            height: 600,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub backend: BackendKind,
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
    pub swapchain_images: u32,
    pub acquire_timeout_ms: u64,
    /// How long a frame slot's fence may stay unsignaled before the device is
    /// considered lost.
    pub fence_timeout_ms: u64,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::ExplicitPresentGpu,
            present_mode: "fifo".to_string(),
            clear_color: [0.1, 0.2, 0.8, 1.0],
            max_frames_in_flight: 2,
            swapchain_images: 2,
            acquire_timeout_ms: 1000,
            fence_timeout_ms: 5000,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "canvas_bridge.log".to_string(),
            show_fps: true,
        }
    }
}

/// Control key bindings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub fullscreen_key: String,
    pub quit_key: String,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            fullscreen_key: "F11".to_string(),
            quit_key: "Escape".to_string(),
        }
    }
}

/// Where finished frames go
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct OutputConfig {
    /// Stop after this many presented frames. 0 runs until closed.
    pub frames: u64,
    /// PNG written from the last CPU frame.
    pub snapshot_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a specific path. A missing file yields defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Reject values no backend can run with.
    pub fn validate(&self) -> Result<(), InitError> {
        let g = &self.graphics;
        if self.window.width == 0 || self.window.height == 0 {
            return Err(InitError::Config(format!(
                "window size must be non-zero, got {}x{}",
                self.window.width, self.window.height
            )));
        }
        if g.max_frames_in_flight == 0 {
            return Err(InitError::Config(
                "graphics.max_frames_in_flight must be at least 1".into(),
            ));
        }
        if g.swapchain_images < 2 {
            return Err(InitError::Config(format!(
                "graphics.swapchain_images must be at least 2, got {}",
                g.swapchain_images
            )));
        }
        if g.acquire_timeout_ms == 0 || g.fence_timeout_ms == 0 {
            return Err(InitError::Config("graphics timeouts must be non-zero".into()));
        }
        if g.clear_color.iter().any(|c| !(0.0..=1.0).contains(c)) {
            return Err(InitError::Config(format!(
                "graphics.clear_color components must be within 0..=1, got {:?}",
                g.clear_color
            )));
        }
        Ok(())
    }

    /// Configured present mode, FIFO if the name is not recognized.
    pub fn present_mode(&self) -> PresentMode {
        self.graphics.present_mode.parse().unwrap_or_else(|e| {
            log::warn!("{}, defaulting to fifo", e);
            PresentMode::Fifo
        })
    }

    pub fn clear_color(&self) -> tiny_skia::Color {
        let [r, g, b, a] = self.graphics.clear_color;
        tiny_skia::Color::from_rgba(r, g, b, a).unwrap_or(tiny_skia::Color::BLACK)
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.window.width, self.window.height)
    }

    pub fn backend_settings(&self) -> BackendSettings {
        BackendSettings {
            app_name: self.window.title.clone(),
            extent: self.extent(),
            present_mode: self.present_mode(),
            frames_in_flight: self.graphics.max_frames_in_flight,
            swapchain_images: self.graphics.swapchain_images,
            acquire_timeout: Duration::from_millis(self.graphics.acquire_timeout_ms),
            fence_timeout: Duration::from_millis(self.graphics.fence_timeout_ms),
            // Validation only in debug builds
            enable_validation: cfg!(debug_assertions) && self.debug.validation_layers,
        }
    }
}
