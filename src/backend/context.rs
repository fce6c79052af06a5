// Graphics context - Vulkan instance and window surface
//
// Responsibilities:
// - Load the Vulkan library and create the instance
// - Validation layers + debug messenger (debug builds only)
// - Bind a presentation surface to the native window
//
// Both objects are created once and destroyed last. The surface keeps an
// Arc to the context, so the instance cannot go away while a surface exists.

use ash::{vk, Entry};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::{c_void, CStr, CString};
use std::sync::Arc;

use crate::config::DebugConfig;
use crate::error::{RenderError, Result, VkResultExt};

pub struct GraphicsContext {
    pub instance: ash::Instance,
    pub surface_loader: ash::khr::surface::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    /// Layers enabled on the instance, repeated on the device for old loaders
    pub enabled_layers: Vec<CString>,
    pub entry: Entry,
}

impl GraphicsContext {
    /// Create the instance with the extensions the window needs.
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `debug` - Validation settings; layers are checked before use
    /// * `display` - Display the surface will later be created on
    pub fn new(
        app_name: &str,
        debug: &DebugConfig,
        display: &impl HasDisplayHandle,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan instance: {}", app_name);

        let entry = unsafe { Entry::load() }?;

        let display_handle = display
            .display_handle()
            .map_err(|e| RenderError::SurfaceCreation(e.to_string()))?
            .as_raw();

        let enable_validation = debug.validation_enabled();
        let enabled_layers = if enable_validation {
            let layers = debug
                .layer_names()
                .map_err(|e| RenderError::ValidationLayerMissing(format!("{:#}", e)))?;
            check_layer_support(&entry, &layers)?;
            layers
        } else {
            Vec::new()
        };

        let app_name_cstr = CString::new(app_name).unwrap_or_else(|_| c"quad-renderer".to_owned());
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"No Engine")
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        // Surface extensions for this platform
        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .map_err(|e| RenderError::SurfaceCreation(e.to_string()))?
            .to_vec();
        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layer_ptrs: Vec<_> = enabled_layers.iter().map(|l| l.as_ptr()).collect();

        // Chained into the instance info so instance creation/destruction is covered too
        let mut instance_messenger_info = messenger_create_info();

        let mut create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_ptrs);
        if enable_validation {
            create_info = create_info.push_next(&mut instance_messenger_info);
        }

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(RenderError::InstanceCreation)?;

        // Destroy the instance if anything below fails
        let instance = scopeguard::guard(instance, |instance| unsafe {
            instance.destroy_instance(None);
        });

        let debug_utils = if enable_validation {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let create_info = messenger_create_info();
            let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None) }
                .op("vkCreateDebugUtilsMessengerEXT")?;
            log::info!("Validation enabled: {:?}", enabled_layers);
            Some((loader, messenger))
        } else {
            None
        };

        let instance = scopeguard::ScopeGuard::into_inner(instance);
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        Ok(Arc::new(Self {
            instance,
            surface_loader,
            debug_utils,
            enabled_layers,
            entry,
        }))
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");
        unsafe {
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn check_layer_support(entry: &Entry, required: &[CString]) -> Result<()> {
    let available = unsafe { entry.enumerate_instance_layer_properties() }
        .op("vkEnumerateInstanceLayerProperties")?;

    for layer in required {
        let found = available
            .iter()
            .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == layer.as_c_str()));
        if !found {
            return Err(RenderError::ValidationLayerMissing(layer.to_string_lossy().into_owned()));
        }
    }
    Ok(())
}

fn messenger_create_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
}

// Forward validation messages to the log facade
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("[Vulkan] {}", message),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("[Vulkan] {}", message),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::info!("[Vulkan] {}", message),
        _ => log::debug!("[Vulkan] {}", message),
    }

    vk::FALSE
}

/// Presentation surface bound to a native window.
pub struct SurfaceHandle {
    pub surface: vk::SurfaceKHR,
    pub context: Arc<GraphicsContext>,
}

impl SurfaceHandle {
    /// The window must outlive the returned surface.
    pub fn new(
        context: Arc<GraphicsContext>,
        window: &(impl HasDisplayHandle + HasWindowHandle),
    ) -> Result<Arc<Self>> {
        let display_handle = window
            .display_handle()
            .map_err(|e| RenderError::SurfaceCreation(e.to_string()))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|e| RenderError::SurfaceCreation(e.to_string()))?
            .as_raw();

        let surface = unsafe {
            ash_window::create_surface(
                &context.entry,
                &context.instance,
                display_handle,
                window_handle,
                None,
            )
        }
        .map_err(|e| RenderError::SurfaceCreation(e.to_string()))?;

        log::debug!("Created surface {:?}", surface);
        Ok(Arc::new(Self { surface, context }))
    }

    pub fn loader(&self) -> &ash::khr::surface::Instance {
        &self.context.surface_loader
    }

    pub fn support(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        let loader = self.loader();
        unsafe {
            Ok(SurfaceSupport {
                capabilities: loader
                    .get_physical_device_surface_capabilities(physical_device, self.surface)
                    .op("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?,
                formats: loader
                    .get_physical_device_surface_formats(physical_device, self.surface)
                    .op("vkGetPhysicalDeviceSurfaceFormatsKHR")?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(physical_device, self.surface)
                    .op("vkGetPhysicalDeviceSurfacePresentModesKHR")?,
            })
        }
    }
}

impl Drop for SurfaceHandle {
    fn drop(&mut self) {
        log::debug!("Destroying surface {:?}", self.surface);
        unsafe { self.context.surface_loader.destroy_surface(self.surface, None) };
    }
}

/// What a surface supports on one adapter.
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}
