// Immediate-mode GL backend
//
// The window's default framebuffer (id 0) is the only target. The canvas
// records into a CPU pixmap; submit uploads it into a texture and blits that
// onto the default framebuffer, present swaps buffers. Presentation pacing
// is the driver's business: there is no notion of frames in flight.

use std::num::NonZeroU32;
use std::sync::Arc;

use glow::HasContext;
use glutin::config::{ConfigTemplateBuilder, GlConfig};
use glutin::context::{
    ContextApi, ContextAttributesBuilder, NotCurrentGlContext, PossiblyCurrentContext, Version,
};
use glutin::display::{Display, DisplayApiPreference, GlDisplay};
use glutin::error::ErrorKind;
use glutin::surface::{GlSurface, Surface, SurfaceAttributesBuilder, SwapInterval, WindowSurface};
use glutin_winit::GlWindow;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window, WindowAttributes};

use super::hal::{PresentMode, PresentStatus};
use super::{BackendKind, BackendSettings, RenderBackend};
use crate::bridge::{self, DrawableCanvas};
use crate::error::{FrameError, InitError};
use crate::surface::{Backing, ColorType, Extent, Origin, PixelFormat, SurfaceTarget};

/// Texture + read framebuffer the canvas bytes travel through.
struct UploadObjects {
    texture: glow::NativeTexture,
    framebuffer: glow::NativeFramebuffer,
}

pub struct GlBackend {
    target: SurfaceTarget,
    upload: Option<UploadObjects>,
    gl: glow::Context,
    surface: Surface<WindowSurface>,
    context: PossiblyCurrentContext,
}

impl GlBackend {
    /// Create the window together with a current GL 3.3 context on it.
    pub fn create(
        event_loop: &ActiveEventLoop,
        attributes: WindowAttributes,
        settings: &BackendSettings,
    ) -> Result<(Arc<Window>, Self), InitError> {
        let window = Arc::new(
            event_loop
                .create_window(attributes)
                .map_err(|e| InitError::Window(e.to_string()))?,
        );
        let raw_window_handle = window
            .window_handle()
            .map_err(|e| InitError::Window(e.to_string()))?
            .as_raw();
        let raw_display_handle = window
            .display_handle()
            .map_err(|e| InitError::Window(e.to_string()))?
            .as_raw();

        #[cfg(target_os = "macos")]
        let preference = DisplayApiPreference::Cgl;
        #[cfg(target_os = "windows")]
        let preference = DisplayApiPreference::Wgl(Some(raw_window_handle));
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        let preference = DisplayApiPreference::Egl;

        let gl_display = unsafe { Display::new(raw_display_handle, preference) }
            .map_err(|e| InitError::Context(format!("open GL display: {e}")))?;

        let template = ConfigTemplateBuilder::new()
            .with_alpha_size(8)
            .compatible_with_native_window(raw_window_handle)
            .build();
        let configs = unsafe { gl_display.find_configs(template) }
            .map_err(|e| InitError::Context(format!("no usable GL config: {e}")))?;
        let gl_config = fewest_samples(configs, |config| config.num_samples())
            .ok_or_else(|| InitError::Context("no usable GL config".into()))?;

        let context_attributes = ContextAttributesBuilder::new()
            .with_context_api(ContextApi::OpenGl(Some(Version::new(3, 3))))
            .build(Some(raw_window_handle));
        let not_current = unsafe { gl_display.create_context(&gl_config, &context_attributes) }
            .map_err(|e| InitError::Context(format!("create GL context: {e}")))?;

        let surface_attributes = window
            .build_surface_attributes(SurfaceAttributesBuilder::<WindowSurface>::new())
            .map_err(|e| InitError::Surface(e.to_string()))?;
        let surface = unsafe { gl_display.create_window_surface(&gl_config, &surface_attributes) }
            .map_err(|e| InitError::Surface(format!("create GL window surface: {e}")))?;
        let context = not_current
            .make_current(&surface)
            .map_err(|e| InitError::Context(format!("make GL context current: {e}")))?;

        let interval = swap_interval(settings.present_mode);
        if let Err(e) = surface.set_swap_interval(&context, interval) {
            log::warn!("Swap interval {:?} not applied: {}", interval, e);
        }

        let gl = unsafe {
            glow::Context::from_loader_function_cstr(|name| gl_display.get_proc_address(name))
        };
        log::info!("GL version: {:?}", gl.version());

        let extent: Extent = window.inner_size().into();
        let target = Self::default_framebuffer(extent)?;
        let upload = unsafe { Self::create_upload_objects(&gl) }.map_err(InitError::Context)?;

        Ok((
            window,
            Self {
                target,
                upload: Some(upload),
                gl,
                surface,
                context,
            },
        ))
    }

    fn default_framebuffer(extent: Extent) -> Result<SurfaceTarget, InitError> {
        // A minimized window still needs a target; start at one pixel.
        let extent = Extent::new(extent.width.max(1), extent.height.max(1));
        SurfaceTarget::framebuffer(0, extent, PixelFormat::Rgba8Unorm)
            .ok_or_else(|| InitError::Context(format!("cannot allocate a {extent} frame buffer")))
    }

    unsafe fn create_upload_objects(gl: &glow::Context) -> Result<UploadObjects, String> {
        let texture = gl.create_texture()?;
        gl.bind_texture(glow::TEXTURE_2D, Some(texture));
        gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, glow::NEAREST as i32);
        gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, glow::NEAREST as i32);
        gl.bind_texture(glow::TEXTURE_2D, None);

        let framebuffer = match gl.create_framebuffer() {
            Ok(fb) => fb,
            Err(e) => {
                gl.delete_texture(texture);
                return Err(e);
            }
        };
        Ok(UploadObjects {
            texture,
            framebuffer,
        })
    }
}

impl RenderBackend for GlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ImmediateGpu
    }

    fn extent(&self) -> Extent {
        self.target.extent()
    }

    fn acquire_target(&mut self) -> Result<(), FrameError> {
        // The default framebuffer is always available once the context is current.
        if self.upload.is_none() {
            return Err(FrameError::api("acquire", "GL backend has been torn down"));
        }
        Ok(())
    }

    fn canvas(&mut self) -> Result<DrawableCanvas<'_>, FrameError> {
        Ok(bridge::wrap(
            BackendKind::ImmediateGpu,
            &mut self.target,
            Origin::BottomLeft,
            ColorType::Rgba8888,
        )?)
    }

    fn submit(&mut self) -> Result<(), FrameError> {
        let upload = self
            .upload
            .as_ref()
            .ok_or_else(|| FrameError::api("submit", "GL backend has been torn down"))?;
        let Backing::Framebuffer { id } = self.target.backing() else {
            return Err(FrameError::api("submit", "target is not a GL framebuffer"));
        };
        let pixels = bridge::upload_bytes(&self.target)?;
        let Extent { width, height } = self.target.extent();
        let (w, h) = (width as i32, height as i32);
        let gl = &self.gl;

        unsafe {
            gl.bind_texture(glow::TEXTURE_2D, Some(upload.texture));
            gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 4);
            gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGBA8 as i32,
                w,
                h,
                0,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                Some(&pixels[..]),
            );
            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, Some(upload.framebuffer));
            gl.framebuffer_texture_2d(
                glow::READ_FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(upload.texture),
                0,
            );
            gl.bind_framebuffer(
                glow::DRAW_FRAMEBUFFER,
                NonZeroU32::new(id).map(glow::NativeFramebuffer),
            );
            gl.blit_framebuffer(0, 0, w, h, 0, 0, w, h, glow::COLOR_BUFFER_BIT, glow::NEAREST);
            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, None);
            gl.bind_texture(glow::TEXTURE_2D, None);
            gl.flush();

            check_gl_error(gl.get_error())
        }
    }

    fn present_or_swap(&mut self) -> Result<PresentStatus, FrameError> {
        self.surface
            .swap_buffers(&self.context)
            .map_err(|e| swap_error(e.error_kind(), &e))?;
        Ok(PresentStatus::Optimal)
    }

    fn recreate(&mut self, extent: Extent) -> Result<(), FrameError> {
        let (Some(width), Some(height)) = (NonZeroU32::new(extent.width), NonZeroU32::new(extent.height))
        else {
            return Err(FrameError::SurfaceInvalidated);
        };
        self.surface.resize(&self.context, width, height);
        unsafe { self.gl.viewport(0, 0, extent.width as i32, extent.height as i32) };

        self.target = SurfaceTarget::framebuffer(0, extent, PixelFormat::Rgba8Unorm)
            .ok_or(FrameError::SurfaceInvalidated)?;
        log::debug!("GL surface resized to {}", extent);
        Ok(())
    }

    fn drain(&mut self) -> Result<(), FrameError> {
        unsafe { self.gl.finish() };
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(upload) = self.upload.take() {
            log::info!("Releasing GL upload objects");
            unsafe {
                self.gl.delete_framebuffer(upload.framebuffer);
                self.gl.delete_texture(upload.texture);
            }
        }
    }

    fn abandon(&mut self) {
        // Deleting objects on a lost context is pointless; let the context go.
        self.upload = None;
    }
}

/// Config with the fewest samples; the canvas is blitted 1:1, multisampling buys nothing.
fn fewest_samples<C>(configs: impl Iterator<Item = C>, samples: impl Fn(&C) -> u8) -> Option<C> {
    configs.reduce(|best, config| {
        if samples(&config) < samples(&best) {
            config
        } else {
            best
        }
    })
}

fn swap_interval(mode: PresentMode) -> SwapInterval {
    match mode {
        PresentMode::Immediate | PresentMode::Mailbox => SwapInterval::DontWait,
        PresentMode::Fifo | PresentMode::FifoRelaxed => SwapInterval::Wait(NonZeroU32::MIN),
    }
}

fn swap_error(kind: ErrorKind, error: &dyn std::fmt::Display) -> FrameError {
    match kind {
        ErrorKind::ContextLost => FrameError::DeviceLost(error.to_string()),
        ErrorKind::BadSurface | ErrorKind::BadNativeWindow => FrameError::SurfaceInvalidated,
        _ => FrameError::api("swap buffers", error),
    }
}

fn check_gl_error(code: u32) -> Result<(), FrameError> {
    match code {
        glow::NO_ERROR => Ok(()),
        glow::CONTEXT_LOST => Err(FrameError::DeviceLost("GL context lost".into())),
        code => Err(FrameError::api("GL upload", format!("error 0x{code:04x}"))),
    }
}
