// =============================================================================
// WINDOWED APPLICATION
// =============================================================================
//
// Owns the window and the presentation loop for the GPU backends. winit
// events map onto the loop:
//
//   Resized          -> notify_resized (invalidates)
//   CloseRequested   -> shutdown (drain, release targets, then the device)
//   RedrawRequested  -> one step of the loop
//   fullscreen key   -> toggle, which changes the surface and invalidates

use std::sync::Arc;
use std::time::Instant;

use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::ActiveEventLoop;
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Fullscreen, Window, WindowAttributes, WindowId};

use crate::backend::{self, BackendKind, RenderBackend, WindowingHandle};
use crate::config::Config;
use crate::error::AppError;
use crate::present_loop::{PresentationLoop, StepOutcome};
use crate::scene;

/// Key names accepted in `[controls]`.
pub fn parse_key(name: &str) -> Option<KeyCode> {
    let key = match name.to_ascii_lowercase().as_str() {
        "escape" | "esc" => KeyCode::Escape,
        "q" => KeyCode::KeyQ,
        "f" => KeyCode::KeyF,
        "space" => KeyCode::Space,
        "enter" | "return" => KeyCode::Enter,
        "f1" => KeyCode::F1,
        "f2" => KeyCode::F2,
        "f3" => KeyCode::F3,
        "f4" => KeyCode::F4,
        "f5" => KeyCode::F5,
        "f6" => KeyCode::F6,
        "f7" => KeyCode::F7,
        "f8" => KeyCode::F8,
        "f9" => KeyCode::F9,
        "f10" => KeyCode::F10,
        "f11" => KeyCode::F11,
        "f12" => KeyCode::F12,
        _ => return None,
    };
    Some(key)
}

fn bound_key(name: &str, fallback: KeyCode) -> KeyCode {
    parse_key(name).unwrap_or_else(|| {
        log::warn!("Unknown key '{}', using {:?}", name, fallback);
        fallback
    })
}

pub struct App {
    config: Config,
    kind: BackendKind,

    // Dropped before the window: surfaces reference it.
    presenter: Option<PresentationLoop<Box<dyn RenderBackend>>>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    quit_key: KeyCode,
    fullscreen_key: KeyCode,

    /// First fatal error; decides the exit status.
    error: Option<AppError>,

    presented: u64,
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    pub fn new(config: Config) -> Self {
        let kind = config.graphics.backend;
        let is_fullscreen = config.window.fullscreen;
        let quit_key = bound_key(&config.controls.quit_key, KeyCode::Escape);
        let fullscreen_key = bound_key(&config.controls.fullscreen_key, KeyCode::F11);
        let now = Instant::now();
        Self {
            config,
            kind,
            presenter: None,
            window: None,
            is_fullscreen,
            quit_key,
            fullscreen_key,
            error: None,
            presented: 0,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    /// Exit status of the run: the first fatal error, if any.
    pub fn finish(mut self) -> Result<(), AppError> {
        self.shutdown();
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut presenter) = self.presenter.take() {
            presenter.shutdown();
        }
        self.window = None;
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: AppError) {
        log::error!("Fatal [{}]: {}", error.category(), error);
        if self.error.is_none() {
            self.error = Some(error);
        }
        self.shutdown();
        event_loop.exit();
    }

    fn render(&mut self, event_loop: &ActiveEventLoop) {
        let Some(presenter) = self.presenter.as_mut() else {
            return;
        };
        let clear = self.config.clear_color();

        match presenter.step(|canvas| scene::draw_demo(canvas, clear)) {
            Ok(StepOutcome::Presented) => {
                self.presented += 1;
                self.update_fps();
                let limit = self.config.output.frames;
                if limit > 0 && self.presented >= limit {
                    log::info!("Presented {} frames, exiting", self.presented);
                    self.shutdown();
                    event_loop.exit();
                }
            }
            Ok(StepOutcome::Skipped) | Ok(StepOutcome::Recreated) => {}
            Ok(StepOutcome::Terminated) => {
                self.shutdown();
                event_loop.exit();
            }
            Err(e) => self.fail(event_loop, e.into()),
        }
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        let Some(window) = self.window.as_ref() else {
            return;
        };
        self.is_fullscreen = !self.is_fullscreen;

        if self.is_fullscreen {
            window.set_fullscreen(Some(Fullscreen::Borderless(None)));
            log::info!("Entered fullscreen mode");
        } else {
            window.set_fullscreen(None);
            log::info!("Exited fullscreen mode");
        }

        let extent = window.inner_size().into();
        if let Some(presenter) = self.presenter.as_mut() {
            presenter.notify_resized(extent);
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(window) = self.window.as_ref() {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    self.kind,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() || self.error.is_some() {
            return;
        }

        let mut attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));
        if self.config.window.fullscreen {
            attributes = attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let handle = WindowingHandle::EventLoop {
            event_loop,
            attributes,
        };
        match backend::initialize(self.kind, handle, &self.config.backend_settings()) {
            Ok(init) => {
                self.presenter = Some(PresentationLoop::new(init.backend));
                self.window = init.window;
                log::info!("{} backend ready", self.kind);
            }
            Err(e) => self.fail(event_loop, e.into()),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                match self.presenter.as_mut() {
                    Some(presenter) => {
                        // Drains and tears down at the frame boundary.
                        presenter.request_close();
                        self.render(event_loop);
                    }
                    None => event_loop.exit(),
                }
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(presenter) = self.presenter.as_mut() {
                    presenter.notify_resized(size.into());
                }
            }

            WindowEvent::RedrawRequested => self.render(event_loop),

            WindowEvent::KeyboardInput { event, .. } => {
                if !event.state.is_pressed() || event.repeat {
                    return;
                }
                if let PhysicalKey::Code(key) = event.physical_key {
                    if key == self.quit_key {
                        log::info!("{:?} pressed, exiting...", key);
                        self.shutdown();
                        event_loop.exit();
                    } else if key == self.fullscreen_key {
                        self.toggle_fullscreen();
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}
