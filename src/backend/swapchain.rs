// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// The choice of format, present mode, extent and image count is made by
// pure functions over `SurfaceSupport` so it can be checked without a GPU.

use ash::vk;
use std::sync::Arc;

use super::context::SurfaceSupport;
use super::VulkanDevice;
use crate::config::GraphicsConfig;
use crate::error::{RenderError, Result, VkResultExt};

/// What the user asked for; the surface decides what it gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainPreferences {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
}

impl Default for SwapchainPreferences {
    fn default() -> Self {
        Self {
            surface_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            present_mode: vk::PresentModeKHR::MAILBOX,
        }
    }
}

impl SwapchainPreferences {
    pub fn from_config(graphics: &GraphicsConfig) -> Self {
        let defaults = Self::default();
        let surface_format = graphics.preferred_surface_format().unwrap_or_else(|e| {
            log::warn!("{:#}, using {:?}", e, defaults.surface_format.format);
            defaults.surface_format
        });
        let present_mode = graphics.preferred_present_mode().unwrap_or_else(|e| {
            log::warn!("{:#}, using {:?}", e, defaults.present_mode);
            defaults.present_mode
        });
        Self {
            surface_format,
            present_mode,
        }
    }
}

/// Preferred pair if supported, else whatever the surface lists first
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred: vk::SurfaceFormatKHR,
) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
        .or_else(|| formats.first().copied())
}

// MAILBOX: no vsync, no tearing. FIFO: vsync, always supported.
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, drawable: vk::Extent2D) -> vk::Extent2D {
    // u32::MAX means the surface lets the swapchain pick
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: drawable
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: drawable
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

/// Everything needed to create one chain generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainPlan {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainPlan {
    pub fn new(
        support: &SurfaceSupport,
        drawable: vk::Extent2D,
        preferences: SwapchainPreferences,
    ) -> Result<Self> {
        let surface_format = choose_surface_format(&support.formats, preferences.surface_format)
            .ok_or(RenderError::SwapchainCreation(vk::Result::ERROR_FORMAT_NOT_SUPPORTED))?;
        Ok(Self {
            surface_format,
            present_mode: choose_present_mode(&support.present_modes, preferences.present_mode),
            extent: choose_extent(&support.capabilities, drawable),
            image_count: choose_image_count(&support.capabilities),
            transform: support.capabilities.current_transform,
        })
    }
}

/// Result of asking the chain for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

/// Result of presenting; `Stale` asks for recreation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presented {
    Optimal,
    Stale,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub loader: ash::khr::swapchain::Device,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        drawable: vk::Extent2D,
        preferences: SwapchainPreferences,
    ) -> Result<Self> {
        let surface = &device.surface;
        let support = surface.support(device.physical_device)?;
        let plan = SwapchainPlan::new(&support, drawable, preferences)?;

        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}, {:?}",
            plan.extent.width,
            plan.extent.height,
            plan.image_count,
            plan.surface_format.format,
            plan.present_mode
        );

        let loader = ash::khr::swapchain::Device::new(&surface.context.instance, &device.device);

        // Images are shared between two families when they differ
        let families = [device.queue_families.graphics, device.queue_families.present];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.surface)
            .min_image_count(plan.image_count)
            .image_format(plan.surface_format.format)
            .image_color_space(plan.surface_format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(plan.transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(plan.present_mode)
            .clipped(true);
        let create_info = if device.queue_families.is_shared() {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        };

        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(RenderError::SwapchainCreation)?;
        let swapchain = scopeguard::guard(swapchain, |swapchain| unsafe {
            loader.destroy_swapchain(swapchain, None);
        });

        let images = unsafe { loader.get_swapchain_images(*swapchain) }
            .map_err(RenderError::SwapchainCreation)?;

        // Views made so far are released if a later one fails
        let mut image_views = scopeguard::guard(Vec::with_capacity(images.len()), |views| {
            for view in views {
                unsafe { device.device.destroy_image_view(view, None) };
            }
        });
        for &image in &images {
            let view = create_image_view(&device.device, image, plan.surface_format.format)?;
            image_views.push(view);
        }

        let image_views = scopeguard::ScopeGuard::into_inner(image_views);
        let swapchain = scopeguard::ScopeGuard::into_inner(swapchain);

        log::info!("Created swapchain with {} images", images.len());

        Ok(Self {
            swapchain,
            loader,
            images,
            image_views,
            format: plan.surface_format,
            present_mode: plan.present_mode,
            extent: plan.extent,
            device,
        })
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire next image for rendering
    pub fn acquire_next_image(&self, timeout: u64, semaphore: vk::Semaphore) -> Result<Acquired> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, timeout, semaphore, vk::Fence::null())
        };

        match result {
            Ok((index, suboptimal)) => Ok(Acquired::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquired::OutOfDate),
            Err(result) => Err(RenderError::Vulkan {
                op: "vkAcquireNextImageKHR",
                result,
            }),
        }
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<Presented> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(Presented::Optimal),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Presented::Stale),
            Err(result) => Err::<Presented, _>(result).op("vkQueuePresentKHR"),
        }
    }
}

fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
) -> Result<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe { device.create_image_view(&create_info, None) }.map_err(RenderError::SwapchainCreation)
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        log::debug!("Destroying swapchain ({} views)", self.image_views.len());
        unsafe {
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}
