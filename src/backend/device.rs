// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device selection (first adapter that passes every check)
// - Logical device + graphics/present queue creation
// - Memory allocator setup
//
// Suitability is decided through the `AdapterQuery` trait so the selection
// rules can be exercised without a driver.

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use super::context::{SurfaceHandle, SurfaceSupport};
use crate::error::{RenderError, Result, VkResultExt};

/// Queue capabilities of one queue family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilySupport {
    pub graphics: bool,
    pub present: bool,
}

/// Queue family indices found on an adapter; either role may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Prefer one family that does both, else the first of each kind.
    pub fn find(families: &[QueueFamilySupport]) -> Self {
        let shared = families.iter().position(|f| f.graphics && f.present);
        if let Some(index) = shared {
            let index = index as u32;
            return Self {
                graphics: Some(index),
                present: Some(index),
            };
        }
        Self {
            graphics: families.iter().position(|f| f.graphics).map(|i| i as u32),
            present: families.iter().position(|f| f.present).map(|i| i as u32),
        }
    }

    pub fn resolve(self) -> Option<QueueFamilies> {
        Some(QueueFamilies {
            graphics: self.graphics?,
            present: self.present?,
        })
    }
}

/// Resolved queue families. Both roles may share one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// One entry per distinct family, in ascending order
    pub fn unique(&self) -> Vec<u32> {
        BTreeSet::from([self.graphics, self.present]).into_iter().collect()
    }

    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }
}

/// Why an adapter was passed over
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MissingFeature,
    NoGraphicsQueue,
    NoPresentQueue,
    MissingExtension(String),
    NoSurfaceFormatOrPresentMode,
}

/// Capability queries needed to judge an adapter.
pub trait AdapterQuery {
    fn name(&self) -> String;
    fn has_required_features(&self) -> bool;
    fn queue_families(&self) -> Vec<QueueFamilySupport>;
    fn extension_names(&self) -> Vec<CString>;
    fn surface_support(&self) -> SurfaceSupport;
}

/// Check one adapter. The surface is only queried once everything else passed.
pub fn check_adapter(
    adapter: &impl AdapterQuery,
    required_extensions: &[CString],
) -> std::result::Result<QueueFamilies, Rejection> {
    if !adapter.has_required_features() {
        return Err(Rejection::MissingFeature);
    }

    let indices = QueueFamilyIndices::find(&adapter.queue_families());
    let families = match indices {
        QueueFamilyIndices { graphics: None, .. } => return Err(Rejection::NoGraphicsQueue),
        QueueFamilyIndices { present: None, .. } => return Err(Rejection::NoPresentQueue),
        _ => indices.resolve().ok_or(Rejection::NoPresentQueue)?,
    };

    let available: BTreeSet<CString> = adapter.extension_names().into_iter().collect();
    if let Some(missing) = required_extensions.iter().find(|ext| !available.contains(*ext)) {
        return Err(Rejection::MissingExtension(
            missing.to_string_lossy().into_owned(),
        ));
    }

    if !adapter.surface_support().is_adequate() {
        return Err(Rejection::NoSurfaceFormatOrPresentMode);
    }

    Ok(families)
}

/// Pick the first suitable adapter in enumeration order.
pub fn select_adapter<P: AdapterQuery>(
    adapters: &[P],
    required_extensions: &[CString],
) -> Result<(usize, QueueFamilies)> {
    for (index, adapter) in adapters.iter().enumerate() {
        match check_adapter(adapter, required_extensions) {
            Ok(families) => {
                log::info!(
                    "Adapter {} '{}' is suitable (graphics family {}, present family {})",
                    index,
                    adapter.name(),
                    families.graphics,
                    families.present
                );
                return Ok((index, families));
            }
            Err(reason) => {
                log::info!("Skipping adapter {} '{}': {:?}", index, adapter.name(), reason);
            }
        }
    }
    Err(RenderError::NoSuitableDevice {
        checked: adapters.len(),
    })
}

/// `AdapterQuery` backed by real Vulkan queries
struct PhysicalAdapter<'a> {
    surface: &'a SurfaceHandle,
    handle: vk::PhysicalDevice,
}

impl PhysicalAdapter<'_> {
    fn instance(&self) -> &ash::Instance {
        &self.surface.context.instance
    }
}

impl AdapterQuery for PhysicalAdapter<'_> {
    fn name(&self) -> String {
        let props = unsafe { self.instance().get_physical_device_properties(self.handle) };
        props
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unnamed>".to_string())
    }

    fn has_required_features(&self) -> bool {
        let features = unsafe { self.instance().get_physical_device_features(self.handle) };
        features.fill_mode_non_solid == vk::TRUE
    }

    fn queue_families(&self) -> Vec<QueueFamilySupport> {
        let families = unsafe {
            self.instance()
                .get_physical_device_queue_family_properties(self.handle)
        };
        families
            .iter()
            .enumerate()
            .map(|(index, props)| {
                let present = unsafe {
                    self.surface.loader().get_physical_device_surface_support(
                        self.handle,
                        index as u32,
                        self.surface.surface,
                    )
                }
                .unwrap_or_else(|e| {
                    log::warn!("Surface support query failed for family {}: {}", index, e);
                    false
                });
                QueueFamilySupport {
                    graphics: props.queue_flags.contains(vk::QueueFlags::GRAPHICS),
                    present,
                }
            })
            .collect()
    }

    fn extension_names(&self) -> Vec<CString> {
        let extensions = unsafe {
            self.instance()
                .enumerate_device_extension_properties(self.handle)
        }
        .unwrap_or_else(|e| {
            log::warn!("Device extension query failed: {}", e);
            Vec::new()
        });
        extensions
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .map(CStr::to_owned)
            .collect()
    }

    fn surface_support(&self) -> SurfaceSupport {
        self.surface.support(self.handle).unwrap_or_else(|e| {
            log::warn!("Surface capability query failed: {}", e);
            SurfaceSupport::default()
        })
    }
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Dropped by hand before the device
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,

    // Queue handles
    pub queue_families: QueueFamilies,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,

    // Keeps the surface (and through it the instance) alive past the device
    pub surface: Arc<SurfaceHandle>,
}

impl VulkanDevice {
    /// Select an adapter for `surface` and open a logical device on it
    ///
    /// # Arguments
    /// * `surface` - Surface the device must be able to present to
    /// * `required_extensions` - Device extensions every candidate must expose
    pub fn new(
        surface: Arc<SurfaceHandle>,
        required_extensions: &[CString],
    ) -> Result<Arc<Self>> {
        let instance = &surface.context.instance;

        let handles = unsafe { instance.enumerate_physical_devices() }
            .op("vkEnumeratePhysicalDevices")?;
        log::info!("Found {} Vulkan adapter(s)", handles.len());

        let adapters: Vec<_> = handles
            .iter()
            .map(|&handle| PhysicalAdapter {
                surface: &surface,
                handle,
            })
            .collect();
        let (index, queue_families) = select_adapter(&adapters, required_extensions)?;
        let physical_device = handles[index];

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!("Selected GPU: {}", adapters[index].name());
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        drop(adapters);

        let device = Self::create_logical_device(
            &surface,
            physical_device,
            queue_families,
            required_extensions,
        )?;
        // Destroy the device if the allocator can't be created
        let device = scopeguard::guard(device, |device| unsafe { device.destroy_device(None) });

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        let device = scopeguard::ScopeGuard::into_inner(device);
        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            properties,
            queue_families,
            graphics_queue,
            present_queue,
            surface,
        }))
    }

    fn create_logical_device(
        surface: &SurfaceHandle,
        physical_device: vk::PhysicalDevice,
        queue_families: QueueFamilies,
        required_extensions: &[CString],
    ) -> Result<ash::Device> {
        // One queue per distinct family, equal priority
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let extension_ptrs: Vec<_> = required_extensions.iter().map(|e| e.as_ptr()).collect();

        // Device layers are ignored by current loaders but required by old ones
        let layer_ptrs: Vec<_> = surface
            .context
            .enabled_layers
            .iter()
            .map(|l| l.as_ptr())
            .collect();

        let features = vk::PhysicalDeviceFeatures::default().fill_mode_non_solid(true);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs)
            .enabled_features(&features);

        unsafe {
            surface
                .context
                .instance
                .create_device(physical_device, &create_info, None)
        }
        .map_err(RenderError::DeviceCreation)
    }

    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.op("vkDeviceWaitIdle")
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            // The allocator frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphicsConfig;
    use std::cell::Cell;

    const BOTH: QueueFamilySupport = QueueFamilySupport {
        graphics: true,
        present: true,
    };
    const GRAPHICS_ONLY: QueueFamilySupport = QueueFamilySupport {
        graphics: true,
        present: false,
    };
    const PRESENT_ONLY: QueueFamilySupport = QueueFamilySupport {
        graphics: false,
        present: true,
    };

    struct FakeAdapter {
        name: &'static str,
        features: bool,
        families: Vec<QueueFamilySupport>,
        extensions: Vec<&'static CStr>,
        formats: usize,
        present_modes: usize,
        surface_queries: Cell<usize>,
    }

    impl FakeAdapter {
        fn suitable(name: &'static str) -> Self {
            Self {
                name,
                features: true,
                families: vec![BOTH],
                extensions: vec![c"VK_KHR_swapchain"],
                formats: 1,
                present_modes: 1,
                surface_queries: Cell::new(0),
            }
        }
    }

    impl AdapterQuery for FakeAdapter {
        fn name(&self) -> String {
            self.name.to_string()
        }
        fn has_required_features(&self) -> bool {
            self.features
        }
        fn queue_families(&self) -> Vec<QueueFamilySupport> {
            self.families.clone()
        }
        fn extension_names(&self) -> Vec<CString> {
            self.extensions.iter().map(|e| (*e).to_owned()).collect()
        }
        fn surface_support(&self) -> SurfaceSupport {
            self.surface_queries.set(self.surface_queries.get() + 1);
            SurfaceSupport {
                capabilities: vk::SurfaceCapabilitiesKHR::default(),
                formats: vec![vk::SurfaceFormatKHR::default(); self.formats],
                present_modes: vec![vk::PresentModeKHR::FIFO; self.present_modes],
            }
        }
    }

    fn required() -> Vec<CString> {
        GraphicsConfig::default().extension_names().unwrap()
    }

    #[test]
    fn skips_adapter_missing_extension_and_picks_next() {
        let mut first = FakeAdapter::suitable("integrated");
        first.extensions.clear();
        let adapters = [first, FakeAdapter::suitable("discrete")];

        let (index, families) = select_adapter(&adapters, &required()).unwrap();

        assert_eq!(index, 1);
        assert_eq!(
            families,
            QueueFamilies {
                graphics: 0,
                present: 0
            }
        );
        // The surface of an adapter that already failed is never consulted
        assert_eq!(adapters[0].surface_queries.get(), 0);
        assert_eq!(adapters[1].surface_queries.get(), 1);
    }

    #[test]
    fn first_suitable_adapter_wins_without_scoring() {
        let adapters = [FakeAdapter::suitable("a"), FakeAdapter::suitable("b")];
        let (index, _) = select_adapter(&adapters, &required()).unwrap();
        assert_eq!(index, 0);
        assert_eq!(adapters[1].surface_queries.get(), 0);
    }

    #[test]
    fn no_adapters_is_no_suitable_device() {
        let adapters: [FakeAdapter; 0] = [];
        let err = select_adapter(&adapters, &required()).unwrap_err();
        assert!(matches!(err, RenderError::NoSuitableDevice { checked: 0 }));
    }

    #[test]
    fn configured_extensions_are_all_required() {
        let graphics = GraphicsConfig {
            device_extensions: vec![
                "VK_KHR_swapchain".to_string(),
                "VK_KHR_maintenance1".to_string(),
            ],
            ..Default::default()
        };
        let required = graphics.extension_names().unwrap();

        let swapchain_only = FakeAdapter::suitable("a");
        let mut both = FakeAdapter::suitable("b");
        both.extensions.push(c"VK_KHR_maintenance1");

        assert_eq!(
            check_adapter(&swapchain_only, &required),
            Err(Rejection::MissingExtension(
                "VK_KHR_maintenance1".to_string()
            ))
        );
        let (index, _) = select_adapter(&[swapchain_only, both], &required).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn every_check_can_reject() {
        let mut no_feature = FakeAdapter::suitable("a");
        no_feature.features = false;
        assert_eq!(
            check_adapter(&no_feature, &required()),
            Err(Rejection::MissingFeature)
        );

        let mut no_graphics = FakeAdapter::suitable("b");
        no_graphics.families = vec![PRESENT_ONLY];
        assert_eq!(
            check_adapter(&no_graphics, &required()),
            Err(Rejection::NoGraphicsQueue)
        );

        let mut no_present = FakeAdapter::suitable("c");
        no_present.families = vec![GRAPHICS_ONLY];
        assert_eq!(
            check_adapter(&no_present, &required()),
            Err(Rejection::NoPresentQueue)
        );

        let mut no_ext = FakeAdapter::suitable("d");
        no_ext.extensions = vec![c"VK_KHR_maintenance1"];
        assert_eq!(
            check_adapter(&no_ext, &required()),
            Err(Rejection::MissingExtension("VK_KHR_swapchain".to_string()))
        );

        let mut no_modes = FakeAdapter::suitable("e");
        no_modes.present_modes = 0;
        assert_eq!(
            check_adapter(&no_modes, &required()),
            Err(Rejection::NoSurfaceFormatOrPresentMode)
        );

        let mut no_formats = FakeAdapter::suitable("f");
        no_formats.formats = 0;
        assert_eq!(
            check_adapter(&no_formats, &required()),
            Err(Rejection::NoSurfaceFormatOrPresentMode)
        );

        let adapters = [
            no_feature,
            no_graphics,
            no_present,
            no_ext,
            no_modes,
            no_formats,
        ];
        assert!(matches!(
            select_adapter(&adapters, &required()),
            Err(RenderError::NoSuitableDevice { checked: 6 })
        ));
    }

    #[test]
    fn split_queue_families_are_both_created() {
        let resolved = QueueFamilyIndices::find(&[GRAPHICS_ONLY, PRESENT_ONLY])
            .resolve()
            .unwrap();
        assert_eq!(
            resolved,
            QueueFamilies {
                graphics: 0,
                present: 1
            }
        );
        assert!(!resolved.is_shared());
        assert_eq!(resolved.unique(), vec![0, 1]);
    }

    #[test]
    fn shared_family_is_preferred_and_deduplicated() {
        let resolved = QueueFamilyIndices::find(&[GRAPHICS_ONLY, PRESENT_ONLY, BOTH])
            .resolve()
            .unwrap();
        assert_eq!(
            resolved,
            QueueFamilies {
                graphics: 2,
                present: 2
            }
        );
        assert_eq!(resolved.unique(), vec![2]);
    }

    #[test]
    fn missing_role_does_not_resolve() {
        let indices = QueueFamilyIndices::find(&[GRAPHICS_ONLY]);
        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.present, None);
        assert!(indices.resolve().is_none());
    }
}
