// SPDX-License-Identifier: CEPL-1.0
use crate::error::{VkContext, VkError, VkResult};
use ash::ext::debug_utils;
use ash::khr::surface;
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::{c_void, CStr};
use tracing::{debug, error, info, trace, warn};

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Loader entry, instance, surface and (optionally) the validation messenger.
pub struct InstanceContext {
    pub(crate) entry: Entry,
    pub(crate) instance: Instance,
    pub(crate) surface_loader: surface::Instance,
    pub(crate) surface: vk::SurfaceKHR,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    validation: bool,
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the loader hands us a valid callback struct for the duration of the call.
    let msg = unsafe {
        let p = (*data).p_message;
        if p.is_null() {
            return vk::FALSE;
        }
        CStr::from_ptr(p).to_string_lossy()
    };
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("[vulkan] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[vulkan] {msg}");
    } else {
        trace!("[vulkan] {msg}");
    }
    vk::FALSE
}

impl InstanceContext {
    pub fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        validation: bool,
    ) -> anyhow::Result<Self> {
        // STRICT ORDER:
        // 1) load entry, create instance (WSI exts + optional debug ext/layer)
        // 2) create the surface FROM THIS INSTANCE
        // 3) device selection later queries present support against this surface
        let dh = display
            .display_handle()
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .as_raw();

        // SAFETY: the library stays loaded for as long as `entry` lives, which outlives the instance.
        let entry = unsafe { Entry::load() }.map_err(VkError::from)?;

        unsafe {
            log_instance_support(&entry)?;

            if validation && !has_layer(&entry, VALIDATION_LAYER)? {
                return Err(VkError::MissingLayer(
                    VALIDATION_LAYER.to_string_lossy().into_owned(),
                )
                .into());
            }

            let wsi_exts = ash_window::enumerate_required_extensions(dh)
                .vk_op("enumerate_required_extensions")?;
            let mut exts = wsi_exts.to_vec();
            if validation {
                exts.push(debug_utils::NAME.as_ptr());
            }
            let layers = [VALIDATION_LAYER.as_ptr()];
            let (layer_count, layer_ptr) = if validation {
                (layers.len() as u32, layers.as_ptr())
            } else {
                (0, std::ptr::null())
            };

            let app_info = vk::ApplicationInfo {
                s_type: vk::StructureType::APPLICATION_INFO,
                p_application_name: c"lumen".as_ptr(),
                application_version: vk::make_api_version(0, 0, 1, 0),
                p_engine_name: c"lumen".as_ptr(),
                engine_version: vk::make_api_version(0, 0, 1, 0),
                api_version: vk::API_VERSION_1_2,
                ..Default::default()
            };
            let create_info = vk::InstanceCreateInfo {
                s_type: vk::StructureType::INSTANCE_CREATE_INFO,
                p_application_info: &app_info,
                enabled_extension_count: exts.len() as u32,
                pp_enabled_extension_names: exts.as_ptr(),
                enabled_layer_count: layer_count,
                pp_enabled_layer_names: layer_ptr,
                ..Default::default()
            };
            let instance = entry
                .create_instance(&create_info, None)
                .vk_op("create_instance")?;

            let surface_loader = surface::Instance::new(&entry, &instance);
            let surface = match ash_window::create_surface(&entry, &instance, dh, wh, None) {
                Ok(s) => s,
                Err(e) => {
                    instance.destroy_instance(None);
                    return Err(VkError::Vulkan {
                        op: "create_surface",
                        result: e,
                    }
                    .into());
                }
            };

            let debug = if validation {
                let loader = debug_utils::Instance::new(&entry, &instance);
                let ci = vk::DebugUtilsMessengerCreateInfoEXT {
                    s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
                    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                    message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                    pfn_user_callback: Some(debug_callback),
                    ..Default::default()
                };
                match loader.create_debug_utils_messenger(&ci, None) {
                    Ok(m) => Some((loader, m)),
                    Err(e) => {
                        warn!("debug messenger unavailable: {e}");
                        None
                    }
                }
            } else {
                None
            };

            info!("vk instance created (api 1.2, validation={validation})");
            Ok(Self {
                entry,
                instance,
                surface_loader,
                surface,
                debug,
                validation,
            })
        }
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn surface_loader(&self) -> &surface::Instance {
        &self.surface_loader
    }

    pub fn validation_enabled(&self) -> bool {
        self.validation
    }
}

// STRICT TEARDOWN ORDER: messenger, surface, instance. The device must already be gone.
impl Drop for InstanceContext {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

unsafe fn has_layer(entry: &Entry, name: &CStr) -> VkResult<bool> {
    let layers = unsafe { entry.enumerate_instance_layer_properties() }
        .vk_op("enumerate_instance_layer_properties")?;
    Ok(layers
        .iter()
        .any(|l| l.layer_name_as_c_str().map(|n| n == name).unwrap_or(false)))
}

unsafe fn log_instance_support(entry: &Entry) -> VkResult<()> {
    let exts = unsafe { entry.enumerate_instance_extension_properties(None) }
        .vk_op("enumerate_instance_extension_properties")?;
    debug!("instance extensions:");
    for e in &exts {
        if let Ok(name) = e.extension_name_as_c_str() {
            debug!("\t{}", name.to_string_lossy());
        }
    }
    let layers = unsafe { entry.enumerate_instance_layer_properties() }
        .vk_op("enumerate_instance_layer_properties")?;
    debug!("instance layers:");
    for l in &layers {
        if let Ok(name) = l.layer_name_as_c_str() {
            debug!("\t{}", name.to_string_lossy());
        }
    }
    Ok(())
}
