// PresentDevice for real Vulkan hardware
//
// Each frame slot owns a host-visible staging buffer and a command buffer.
// A frame is uploaded by copying the canvas bytes into the slot's buffer and
// recording buffer -> swapchain image copy with the layout transitions the
// presentation engine expects.

use std::sync::atomic::Ordering;
use std::time::Duration;

use ash::vk::{self, Handle};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;

use super::device::VulkanDevice;
use super::hal::{
    AcquiredImage, PresentDevice, PresentMode, PresentStatus, Submission, SurfaceCapabilities,
    SurfaceFormat, SwapchainConfig,
};
use crate::error::FrameError;
use crate::surface::{Extent, PixelFormat};

pub struct StagingSlot {
    command_buffer: vk::CommandBuffer,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    capacity: u64,
}

impl StagingSlot {
    /// # Safety
    /// The GPU must be done with the buffer.
    pub(crate) unsafe fn release(mut self, device: &ash::Device, allocator: &mut Allocator) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = allocator.free(allocation) {
                log::warn!("Failed to free staging allocation: {}", e);
            }
        }
        if self.buffer != vk::Buffer::null() {
            device.destroy_buffer(self.buffer, None);
        }
    }
}

fn pixel_format(format: vk::Format) -> PixelFormat {
    match format {
        vk::Format::R8G8B8A8_UNORM => PixelFormat::Rgba8Unorm,
        vk::Format::B8G8R8A8_UNORM => PixelFormat::Bgra8Unorm,
        vk::Format::R8G8B8A8_SRGB => PixelFormat::Rgba8Srgb,
        vk::Format::B8G8R8A8_SRGB => PixelFormat::Bgra8Srgb,
        other => PixelFormat::Unsupported(other.as_raw()),
    }
}

fn vk_format(format: PixelFormat) -> vk::Format {
    match format {
        PixelFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        PixelFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        PixelFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        PixelFormat::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        PixelFormat::Unsupported(raw) => vk::Format::from_raw(raw),
    }
}

fn present_mode(mode: vk::PresentModeKHR) -> Option<PresentMode> {
    match mode {
        vk::PresentModeKHR::IMMEDIATE => Some(PresentMode::Immediate),
        vk::PresentModeKHR::MAILBOX => Some(PresentMode::Mailbox),
        vk::PresentModeKHR::FIFO => Some(PresentMode::Fifo),
        vk::PresentModeKHR::FIFO_RELAXED => Some(PresentMode::FifoRelaxed),
        _ => None,
    }
}

fn vk_present_mode(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
    }
}

fn extent(e: vk::Extent2D) -> Extent {
    Extent::new(e.width, e.height)
}

fn timeout_ns(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

impl VulkanDevice {
    fn raw_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR, FrameError> {
        unsafe {
            self.surface
                .loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface.surface)
        }
        .map_err(|e| FrameError::from_vk("surface capabilities", e))
    }

    /// Make sure `slots[index]` exists and can hold `size` bytes.
    fn ensure_staging(
        &self,
        slots: &mut Vec<StagingSlot>,
        allocator: &mut Allocator,
        index: usize,
        size: u64,
    ) -> Result<(), FrameError> {
        while slots.len() <= index {
            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(self.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let command_buffer = unsafe { self.device.allocate_command_buffers(&alloc_info) }
                .map_err(|e| FrameError::from_vk("allocate command buffer", e))?[0];
            slots.push(StagingSlot {
                command_buffer,
                buffer: vk::Buffer::null(),
                allocation: None,
                capacity: 0,
            });
        }

        let slot = &mut slots[index];
        if slot.capacity >= size {
            return Ok(());
        }

        // The slot's fence was waited before this submission, so the old
        // buffer is no longer read by the GPU.
        if let Some(allocation) = slot.allocation.take() {
            allocator
                .free(allocation)
                .map_err(|e| FrameError::api("free staging buffer", e))?;
        }
        if slot.buffer != vk::Buffer::null() {
            unsafe { self.device.destroy_buffer(slot.buffer, None) };
            slot.buffer = vk::Buffer::null();
        }
        slot.capacity = 0;

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(|e| FrameError::from_vk("create staging buffer", e))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = allocator.allocate(&AllocationCreateDesc {
            name: "frame staging",
            requirements,
            location: MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(a) => a,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(FrameError::api("allocate staging memory", e));
            }
        };
        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_buffer(buffer, None) };
            allocator.free(allocation).ok();
            return Err(FrameError::from_vk("bind staging memory", e));
        }

        slot.buffer = buffer;
        slot.allocation = Some(allocation);
        slot.capacity = size;
        log::debug!("Staging buffer for slot {}: {} bytes", index, size);
        Ok(())
    }

    fn record_upload(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        image: vk::Image,
        size: Extent,
    ) -> Result<(), vk::Result> {
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device.begin_command_buffer(command_buffer, &begin_info)?;

            // Previous contents are overwritten entirely.
            let to_transfer = vk::ImageMemoryBarrier::builder()
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(COLOR_RANGE)
                .build();
            self.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );

            let region = vk::BufferImageCopy::builder()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_extent(vk::Extent3D {
                    width: size.width,
                    height: size.height,
                    depth: 1,
                })
                .build();
            self.device.cmd_copy_buffer_to_image(
                command_buffer,
                buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            let to_present = vk::ImageMemoryBarrier::builder()
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::empty())
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(COLOR_RANGE)
                .build();
            self.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_present],
            );

            self.device.end_command_buffer(command_buffer)
        }
    }
}

impl PresentDevice for VulkanDevice {
    type Semaphore = vk::Semaphore;
    type Fence = vk::Fence;
    type Swapchain = vk::SwapchainKHR;

    fn create_semaphore(&self) -> Result<vk::Semaphore, FrameError> {
        let info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.create_semaphore(&info, None) }
            .map_err(|e| FrameError::from_vk("create semaphore", e))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence, FrameError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&info, None) }
            .map_err(|e| FrameError::from_vk("create fence", e))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool, FrameError> {
        unsafe { self.device.get_fence_status(fence) }
            .map_err(|e| FrameError::from_vk("fence status", e))
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> Result<bool, FrameError> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns(timeout)) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(FrameError::from_vk("wait for fence", e)),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), FrameError> {
        unsafe { self.device.reset_fences(&[fence]) }
            .map_err(|e| FrameError::from_vk("reset fence", e))
    }

    fn surface_capabilities(&self) -> Result<SurfaceCapabilities, FrameError> {
        let caps = self.raw_capabilities()?;
        let formats = unsafe {
            self.surface
                .loader
                .get_physical_device_surface_formats(self.physical_device, self.surface.surface)
        }
        .map_err(|e| FrameError::from_vk("surface formats", e))?;
        let present_modes = unsafe {
            self.surface.loader.get_physical_device_surface_present_modes(
                self.physical_device,
                self.surface.surface,
            )
        }
        .map_err(|e| FrameError::from_vk("surface present modes", e))?;

        Ok(SurfaceCapabilities {
            min_image_count: caps.min_image_count,
            max_image_count: caps.max_image_count,
            // u32::MAX means the swapchain decides the size.
            current_extent: (caps.current_extent.width != u32::MAX)
                .then(|| extent(caps.current_extent)),
            min_extent: extent(caps.min_image_extent),
            max_extent: extent(caps.max_image_extent),
            formats: formats
                .iter()
                .map(|f| SurfaceFormat {
                    format: pixel_format(f.format),
                    color_space: f.color_space.as_raw(),
                })
                .collect(),
            present_modes: present_modes.into_iter().filter_map(present_mode).collect(),
        })
    }

    fn create_swapchain(
        &self,
        config: &SwapchainConfig,
        old: Option<vk::SwapchainKHR>,
    ) -> Result<(vk::SwapchainKHR, Vec<u64>), FrameError> {
        let caps = self.raw_capabilities()?;
        if !caps
            .supported_usage_flags
            .contains(vk::ImageUsageFlags::TRANSFER_DST)
        {
            return Err(FrameError::api(
                "create swapchain",
                "surface images cannot be transfer destinations",
            ));
        }

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface.surface)
            .min_image_count(config.image_count)
            .image_format(vk_format(config.format.format))
            .image_color_space(vk::ColorSpaceKHR::from_raw(config.format.color_space))
            .image_extent(vk::Extent2D {
                width: config.extent.width,
                height: config.extent.height,
            })
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk_present_mode(config.present_mode))
            .clipped(true)
            .old_swapchain(old.unwrap_or_default());

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(|e| FrameError::from_vk("create swapchain", e))?;

        match unsafe { self.swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => Ok((swapchain, images.iter().map(|i| i.as_raw()).collect())),
            Err(e) => {
                unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
                Err(FrameError::from_vk("get swapchain images", e))
            }
        }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: Duration,
        signal: vk::Semaphore,
    ) -> Result<AcquiredImage, FrameError> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                swapchain,
                timeout_ns(timeout),
                signal,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((index, suboptimal)) => Ok(AcquiredImage { index, suboptimal }),
            Err(e) => Err(FrameError::from_vk("acquire next image", e)),
        }
    }

    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_on: vk::Semaphore,
    ) -> Result<PresentStatus, FrameError> {
        let wait_semaphores = [wait_on];
        let swapchains = [swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.swapchain_loader.queue_present(self.graphics_queue, &present_info) } {
            Ok(false) => Ok(PresentStatus::Optimal),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(e) => Err(FrameError::from_vk("queue present", e)),
        }
    }

    fn submit_async(&self, work: Submission<'_, Self>) -> Result<(), FrameError> {
        let size = work.pixels.len() as u64;
        let mut slots = self.staging.lock();
        let mut allocator = self.allocator.lock();
        self.ensure_staging(&mut slots, &mut allocator, work.slot, size)?;
        drop(allocator);

        let slot = &mut slots[work.slot];
        let mapped = slot
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or_else(|| FrameError::api("submit", "staging buffer is not host visible"))?;
        mapped[..work.pixels.len()].copy_from_slice(work.pixels);

        self.record_upload(
            slot.command_buffer,
            slot.buffer,
            vk::Image::from_raw(work.image),
            work.extent,
        )
        .map_err(|e| FrameError::from_vk("record upload", e))?;

        let wait_semaphores = [work.wait_on];
        let wait_stages = [vk::PipelineStageFlags::TRANSFER];
        let command_buffers = [slot.command_buffer];
        let signal_semaphores = [work.signal];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], work.fence)
        }
        .map_err(|e| FrameError::from_vk("queue submit", e))
    }

    fn submit_and_wait_idle(&self) -> Result<(), FrameError> {
        if self.lost.load(Ordering::Acquire) {
            return Ok(());
        }
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| FrameError::from_vk("device wait idle", e))
    }

    fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }
}
