// Window surface - platform glue between winit windows and VkSurfaceKHR
//
// Supports Win32, Xlib, Xcb and Wayland windows.

use std::ffi::c_char;

use ash::extensions::khr;
use ash::{vk, Entry};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use winit::window::Window;

use crate::error::InitError;

/// Instance extensions needed to create a surface on `display`.
pub fn required_extensions(display: RawDisplayHandle) -> Result<Vec<*const c_char>, InitError> {
    let platform = match display {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        other => {
            return Err(InitError::Surface(format!(
                "unsupported display server: {other:?}"
            )))
        }
    };
    Ok(vec![khr::Surface::name().as_ptr(), platform.as_ptr()])
}

pub fn display_handle(window: &Window) -> Result<RawDisplayHandle, InitError> {
    window
        .display_handle()
        .map(|h| h.as_raw())
        .map_err(|e| InitError::Surface(format!("display handle unavailable: {e}")))
}

pub struct WindowSurface {
    pub loader: khr::Surface,
    pub surface: vk::SurfaceKHR,
}

impl WindowSurface {
    pub fn create(
        entry: &Entry,
        instance: &ash::Instance,
        window: &Window,
    ) -> Result<Self, InitError> {
        let display = display_handle(window)?;
        let handle = window
            .window_handle()
            .map(|h| h.as_raw())
            .map_err(|e| InitError::Surface(format!("window handle unavailable: {e}")))?;

        let surface = unsafe { Self::create_raw(entry, instance, display, handle) }
            .map_err(|e| InitError::Surface(format!("vkCreate*SurfaceKHR: {e}")))?;

        Ok(Self {
            loader: khr::Surface::new(entry, instance),
            surface,
        })
    }

    unsafe fn create_raw(
        entry: &Entry,
        instance: &ash::Instance,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<vk::SurfaceKHR, vk::Result> {
        match (display, window) {
            (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(h)) => {
                let hinstance = h.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
                let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                    .hinstance(hinstance)
                    .hwnd(h.hwnd.get() as *const std::ffi::c_void);
                khr::Win32Surface::new(entry, instance).create_win32_surface(&create_info, None)
            }
            (RawDisplayHandle::Xlib(d), RawWindowHandle::Xlib(w)) => {
                let dpy = d.display.map_or(std::ptr::null_mut(), |p| p.as_ptr());
                let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                    .dpy(dpy.cast())
                    .window(w.window);
                khr::XlibSurface::new(entry, instance).create_xlib_surface(&create_info, None)
            }
            (RawDisplayHandle::Xcb(d), RawWindowHandle::Xcb(w)) => {
                let connection = d.connection.map_or(std::ptr::null_mut(), |p| p.as_ptr());
                let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                    .connection(connection.cast())
                    .window(w.window.get());
                khr::XcbSurface::new(entry, instance).create_xcb_surface(&create_info, None)
            }
            (RawDisplayHandle::Wayland(d), RawWindowHandle::Wayland(w)) => {
                let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                    .display(d.display.as_ptr().cast())
                    .surface(w.surface.as_ptr().cast());
                khr::WaylandSurface::new(entry, instance).create_wayland_surface(&create_info, None)
            }
            _ => Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT),
        }
    }

    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, family: u32) -> bool {
        match unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, family, self.surface)
        } {
            Ok(supported) => supported,
            Err(e) => {
                log::warn!("Surface support query failed for family {}: {}", family, e);
                false
            }
        }
    }

    /// Must run after every swapchain on this surface is gone.
    pub fn destroy(&self) {
        unsafe { self.loader.destroy_surface(self.surface, None) };
    }
}
