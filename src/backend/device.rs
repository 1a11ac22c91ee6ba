// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation (surface extensions, optional validation layers)
// - Window surface creation
// - Physical device selection (discrete > integrated > other, never software)
// - Logical device + queue creation
// - Command pool and memory allocator for frame uploads

use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ash::extensions::{ext::DebugUtils, khr};
use ash::vk::{self, Handle};
use ash::Entry;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use winit::window::Window;

use super::vulkan::StagingSlot;
use super::window_surface::{self, WindowSurface};
use crate::error::InitError;

/// Coarse device class used for selection priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Discrete,
    Integrated,
    Virtual,
    Software,
    Other,
}

impl DeviceClass {
    pub fn from_vk(device_type: vk::PhysicalDeviceType) -> Self {
        match device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => Self::Discrete,
            vk::PhysicalDeviceType::INTEGRATED_GPU => Self::Integrated,
            vk::PhysicalDeviceType::VIRTUAL_GPU => Self::Virtual,
            vk::PhysicalDeviceType::CPU => Self::Software,
            _ => Self::Other,
        }
    }

    /// Higher wins. Software rasterizers are never eligible.
    fn priority(self) -> Option<u32> {
        match self {
            Self::Discrete => Some(3),
            Self::Integrated => Some(2),
            Self::Virtual => Some(1),
            Self::Other => Some(0),
            Self::Software => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilySupport {
    pub graphics: bool,
    pub present: bool,
}

/// What selection needs to know about one physical device.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub handle: u64,
    pub name: String,
    pub class: DeviceClass,
    pub queue_families: Vec<QueueFamilySupport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSelection {
    pub handle: u64,
    pub name: String,
    pub class: DeviceClass,
    pub queue_family: u32,
}

/// Pick the highest-priority non-software device that has a queue family
/// supporting both graphics and presentation. Ties go to the first listed.
pub fn select_physical_device(
    candidates: &[DeviceCandidate],
) -> Result<DeviceSelection, InitError> {
    if candidates.is_empty() {
        return Err(InitError::NoSuitableDevice(
            "no Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best: Option<(u32, DeviceSelection)> = None;
    let mut saw_hardware = false;

    for candidate in candidates {
        let Some(priority) = candidate.class.priority() else {
            log::info!("Skipping software device: {}", candidate.name);
            continue;
        };
        saw_hardware = true;

        let family = candidate
            .queue_families
            .iter()
            .position(|f| f.graphics && f.present);
        let Some(family) = family else {
            log::info!("Skipping {}: no graphics+present queue family", candidate.name);
            continue;
        };

        if best.as_ref().map_or(true, |(score, _)| priority > *score) {
            best = Some((
                priority,
                DeviceSelection {
                    handle: candidate.handle,
                    name: candidate.name.clone(),
                    class: candidate.class,
                    queue_family: family as u32,
                },
            ));
        }
    }

    match best {
        Some((_, selection)) => Ok(selection),
        None if saw_hardware => Err(InitError::NoSuitableQueueFamily),
        None => {
            let names: Vec<&str> = candidates.iter().map(|c| c.name.as_str()).collect();
            Err(InitError::NoSuitableDevice(format!(
                "only software rasterizers available: {}",
                names.join(", ")
            )))
        }
    }
}

/// Source of device candidates and the means to open the chosen one.
pub trait AdapterSource {
    type Opened;

    fn candidates(&self) -> Result<Vec<DeviceCandidate>, InitError>;
    fn open(&self, selection: &DeviceSelection) -> Result<Self::Opened, InitError>;
}

/// Selection happens entirely before `open`; a failed selection never opens
/// anything.
pub fn open_best_device<P: AdapterSource>(
    adapters: &P,
) -> Result<(DeviceSelection, P::Opened), InitError> {
    let candidates = adapters.candidates()?;
    let selection = select_physical_device(&candidates)?;
    log::info!("Selected GPU: {} ({:?})", selection.name, selection.class);
    let opened = adapters.open(&selection)?;
    Ok((selection, opened))
}

struct VulkanAdapters<'a> {
    instance: &'a ash::Instance,
    surface: &'a WindowSurface,
}

impl AdapterSource for VulkanAdapters<'_> {
    type Opened = ash::Device;

    fn candidates(&self) -> Result<Vec<DeviceCandidate>, InitError> {
        let devices = unsafe { self.instance.enumerate_physical_devices() }
            .map_err(|e| InitError::device("enumerate physical devices", e))?;

        Ok(devices
            .into_iter()
            .map(|device| {
                let props = unsafe { self.instance.get_physical_device_properties(device) };
                let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned();
                let families = unsafe {
                    self.instance
                        .get_physical_device_queue_family_properties(device)
                };
                let queue_families = families
                    .iter()
                    .enumerate()
                    .map(|(i, family)| QueueFamilySupport {
                        graphics: family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
                        present: self.surface.supports_present(device, i as u32),
                    })
                    .collect();

                DeviceCandidate {
                    handle: device.as_raw(),
                    name,
                    class: DeviceClass::from_vk(props.device_type),
                    queue_families,
                }
            })
            .collect())
    }

    fn open(&self, selection: &DeviceSelection) -> Result<ash::Device, InitError> {
        let physical_device = vk::PhysicalDevice::from_raw(selection.handle);
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(selection.queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        // Frames reach the screen through transfer copies; no rendering
        // features are needed beyond the swapchain itself.
        let extensions = [khr::Swapchain::name().as_ptr()];

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions);

        unsafe {
            self.instance
                .create_device(physical_device, &create_info, None)
        }
        .map_err(|e| InitError::device("create logical device", e))
    }
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub(crate) allocator: ManuallyDrop<Mutex<Allocator>>,
    pub(crate) staging: Mutex<Vec<StagingSlot>>,
    pub(crate) command_pool: vk::CommandPool,
    pub(crate) lost: AtomicBool,

    pub device: ash::Device,
    pub swapchain_loader: khr::Swapchain,
    pub physical_device: vk::PhysicalDevice,
    pub graphics_queue: vk::Queue,
    pub surface: WindowSurface,

    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub instance: ash::Instance,
    _entry: Entry,
}

impl VulkanDevice {
    /// Create the Vulkan device context for `window`.
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        window: &Window,
    ) -> Result<Arc<Self>, InitError> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }.map_err(|e| {
            InitError::Context(format!("failed to load Vulkan library ({e}). Is Vulkan installed?"))
        })?;

        // Step 2: Create instance with the window's surface extensions
        let extensions = window_surface::required_extensions(window_surface::display_handle(window)?)?;
        let instance = Self::create_instance(&entry, app_name, enable_validation, extensions)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(debug) => Some(debug),
                Err(e) => {
                    log::warn!("Validation messenger unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        // Steps 4+ own nothing yet if they fail; undo the instance here.
        match Self::build(&entry, &instance, window) {
            Ok(parts) => Ok(Arc::new(Self::assemble(entry, instance, debug_utils, parts))),
            Err(e) => {
                unsafe {
                    if let Some((debug_utils, messenger)) = debug_utils {
                        debug_utils.destroy_debug_utils_messenger(messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                Err(e)
            }
        }
    }

    fn build(entry: &Entry, instance: &ash::Instance, window: &Window) -> Result<DeviceParts, InitError> {
        // Step 4: Window surface
        let surface = WindowSurface::create(entry, instance, window)?;

        match Self::open_device(instance, &surface) {
            Ok((selection, device)) => {
                match Self::create_frame_resources(instance, &device, &selection) {
                    Ok((command_pool, allocator)) => Ok(DeviceParts {
                        surface,
                        selection,
                        device,
                        command_pool,
                        allocator,
                    }),
                    Err(e) => {
                        unsafe { device.destroy_device(None) };
                        surface.destroy();
                        Err(e)
                    }
                }
            }
            Err(e) => {
                surface.destroy();
                Err(e)
            }
        }
    }

    fn open_device(
        instance: &ash::Instance,
        surface: &WindowSurface,
    ) -> Result<(DeviceSelection, ash::Device), InitError> {
        // Step 5: Pick physical device and create the logical device
        open_best_device(&VulkanAdapters { instance, surface })
    }

    fn create_frame_resources(
        instance: &ash::Instance,
        device: &ash::Device,
        selection: &DeviceSelection,
    ) -> Result<(vk::CommandPool, Allocator), InitError> {
        // Step 6: Command pool, buffers are reset and re-recorded every frame
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(selection.queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(|e| InitError::device("create command pool", e))?;

        // Step 7: Memory allocator for staging buffers
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device: vk::PhysicalDevice::from_raw(selection.handle),
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        });
        match allocator {
            Ok(allocator) => Ok((command_pool, allocator)),
            Err(e) => {
                unsafe { device.destroy_command_pool(command_pool, None) };
                Err(InitError::device("create memory allocator", e))
            }
        }
    }

    fn assemble(
        entry: Entry,
        instance: ash::Instance,
        debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
        parts: DeviceParts,
    ) -> Self {
        let physical_device = vk::PhysicalDevice::from_raw(parts.selection.handle);
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let graphics_queue = unsafe { parts.device.get_device_queue(parts.selection.queue_family, 0) };
        let swapchain_loader = khr::Swapchain::new(&instance, &parts.device);

        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        Self {
            allocator: ManuallyDrop::new(Mutex::new(parts.allocator)),
            staging: Mutex::new(Vec::new()),
            command_pool: parts.command_pool,
            lost: AtomicBool::new(false),
            device: parts.device,
            swapchain_loader,
            physical_device,
            graphics_queue,
            surface: parts.surface,
            debug_utils,
            instance,
            _entry: entry,
        }
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        mut extensions: Vec<*const std::ffi::c_char>,
    ) -> Result<ash::Instance, InitError> {
        let app_name_cstr =
            CString::new(app_name).map_err(|e| InitError::Config(format!("app name: {e}")))?;
        let engine_name = c"canvas-bridge";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        // Validation layers
        let layer_names = if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| InitError::Context(format!("failed to create Vulkan instance: {e}")))
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT), vk::Result> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}

struct DeviceParts {
    surface: WindowSurface,
    selection: DeviceSelection,
    device: ash::Device,
    command_pool: vk::CommandPool,
    allocator: Allocator,
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if self.is_lost() {
            log::warn!("Device lost, skipping idle wait");
        } else if let Err(e) = unsafe { self.device.device_wait_idle() } {
            log::warn!("Idle wait before teardown failed: {}", e);
        }

        unsafe {
            {
                let mut allocator = self.allocator.lock();
                for slot in self.staging.get_mut().drain(..) {
                    slot.release(&self.device, &mut allocator);
                }
            }
            // Allocations reference the device; the allocator goes first.
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.surface.destroy();

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn candidate(handle: u64, class: DeviceClass, families: &[(bool, bool)]) -> DeviceCandidate {
        DeviceCandidate {
            handle,
            name: format!("gpu-{handle}"),
            class,
            queue_families: families
                .iter()
                .map(|&(graphics, present)| QueueFamilySupport { graphics, present })
                .collect(),
        }
    }

    struct FakeAdapters {
        candidates: Vec<DeviceCandidate>,
        opened: Cell<usize>,
    }

    impl AdapterSource for FakeAdapters {
        type Opened = u64;

        fn candidates(&self) -> Result<Vec<DeviceCandidate>, InitError> {
            Ok(self.candidates.clone())
        }

        fn open(&self, selection: &DeviceSelection) -> Result<u64, InitError> {
            self.opened.set(self.opened.get() + 1);
            Ok(selection.handle)
        }
    }

    #[test]
    fn prefers_discrete_over_integrated() {
        let candidates = [
            candidate(1, DeviceClass::Integrated, &[(true, true)]),
            candidate(2, DeviceClass::Discrete, &[(true, false), (true, true)]),
        ];
        let selection = select_physical_device(&candidates).unwrap();
        assert_eq!(selection.handle, 2);
        assert_eq!(selection.queue_family, 1);
    }

    #[test]
    fn equal_priority_keeps_first_device() {
        let candidates = [
            candidate(7, DeviceClass::Integrated, &[(true, true)]),
            candidate(8, DeviceClass::Integrated, &[(true, true)]),
        ];
        assert_eq!(select_physical_device(&candidates).unwrap().handle, 7);
    }

    #[test]
    fn graphics_and_present_must_share_a_family() {
        let candidates = [candidate(1, DeviceClass::Discrete, &[(true, false), (false, true)])];
        assert!(matches!(
            select_physical_device(&candidates),
            Err(InitError::NoSuitableQueueFamily)
        ));
    }

    #[test]
    fn skips_devices_without_a_usable_family() {
        let candidates = [
            candidate(1, DeviceClass::Discrete, &[(true, false)]),
            candidate(2, DeviceClass::Virtual, &[(true, true)]),
        ];
        assert_eq!(select_physical_device(&candidates).unwrap().handle, 2);
    }

    #[test]
    fn software_only_fails_without_opening_a_device() {
        let adapters = FakeAdapters {
            candidates: vec![candidate(1, DeviceClass::Software, &[(true, true)])],
            opened: Cell::new(0),
        };
        let err = open_best_device(&adapters).err().unwrap();
        assert!(matches!(err, InitError::NoSuitableDevice(_)));
        assert_eq!(adapters.opened.get(), 0);
    }

    #[test]
    fn no_devices_at_all() {
        assert!(matches!(
            select_physical_device(&[]),
            Err(InitError::NoSuitableDevice(_))
        ));
    }

    #[test]
    fn opens_exactly_the_selected_device() {
        let adapters = FakeAdapters {
            candidates: vec![
                candidate(1, DeviceClass::Software, &[(true, true)]),
                candidate(5, DeviceClass::Integrated, &[(true, true)]),
            ],
            opened: Cell::new(0),
        };
        let (selection, opened) = open_best_device(&adapters).unwrap();
        assert_eq!(opened, 5);
        assert_eq!(selection.class, DeviceClass::Integrated);
        assert_eq!(adapters.opened.get(), 1);
    }
}
