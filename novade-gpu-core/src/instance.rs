//! Vulkan instance and the debug messenger.
//!
//! Layer messages are emitted as `tracing` events under the `vulkan` target,
//! with the message class in a `kind` field so subscribers can filter
//! validation output separately from performance hints.

use crate::config::CoreConfig;
use crate::error::{Result, VkResultExt};
use ash::vk;
use std::borrow::Cow;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Class of a debug-utils message, most specific first.
pub fn message_kind(types: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    if types.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "validation"
    } else if types.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "performance"
    } else {
        "general"
    }
}

/// # Safety
/// `ptr` is null or points at a NUL-terminated string that outlives the result.
unsafe fn lossy<'a>(ptr: *const c_char) -> Cow<'a, str> {
    if ptr.is_null() {
        Cow::Borrowed("")
    } else {
        CStr::from_ptr(ptr).to_string_lossy()
    }
}

unsafe extern "system" fn debug_messenger(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let Some(data) = data.as_ref() else {
        return vk::FALSE;
    };
    let kind = message_kind(types);
    let id = lossy(data.p_message_id_name);
    let message = lossy(data.p_message);

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", kind, %id, "{}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", kind, %id, "{}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        debug!(target: "vulkan", kind, %id, "{}", message);
    } else {
        trace!(target: "vulkan", kind, %id, "{}", message);
    }
    // Never abort the call that triggered the message.
    vk::FALSE
}

/// Loaded Vulkan entry points plus the `VkInstance`.
///
/// Shared behind an `Arc` by the adapter, the surface and the logical device,
/// so it is destroyed only after all of them.
pub struct Instance {
    entry: ash::Entry,
    raw: ash::Instance,
    surface_loader: ash::extensions::khr::Surface,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl Instance {
    /// Creates the instance with `VK_KHR_surface` plus `extensions`, which
    /// normally come from the windowing layer.
    pub fn new(config: &CoreConfig, extensions: &[&CStr]) -> Result<Arc<Self>> {
        let entry = unsafe { ash::Entry::load()? };

        let app_name = CString::new(config.application_name.as_str())
            .unwrap_or_else(|_| CString::from(c"novade-gpu-core"));
        let eng_name = CString::new(config.engine_name.as_str())
            .unwrap_or_else(|_| CString::from(c"NovaDE"));

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&eng_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let enable_validation =
            config.enable_validation && Self::layer_available(&entry, VALIDATION_LAYER)?;
        if config.enable_validation && !enable_validation {
            warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed; continuing without it.");
        }

        let mut instance_extensions: Vec<*const c_char> =
            vec![ash::extensions::khr::Surface::name().as_ptr()];
        for ext in extensions {
            if !instance_extensions.contains(&ext.as_ptr()) {
                instance_extensions.push(ext.as_ptr());
            }
        }
        if enable_validation {
            instance_extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let mut enabled_layer_names: Vec<*const c_char> = Vec::new();
        if enable_validation {
            enabled_layer_names.push(VALIDATION_LAYER.as_ptr());
        }

        let mut debug_messenger_create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_messenger));

        let mut instance_create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&instance_extensions)
            .enabled_layer_names(&enabled_layer_names);
        if enable_validation {
            instance_create_info = instance_create_info.push_next(&mut debug_messenger_create_info);
        }

        let raw = unsafe { entry.create_instance(&instance_create_info, None) }
            .at("vkCreateInstance")?;
        info!("Vulkan instance created (validation: {}).", enable_validation);

        let debug_utils = if enable_validation {
            let loader = ash::extensions::ext::DebugUtils::new(&entry, &raw);
            let messenger = unsafe { loader.create_debug_utils_messenger(&debug_messenger_create_info, None) }
                .at("vkCreateDebugUtilsMessengerEXT")
                .map_err(|e| {
                    unsafe { raw.destroy_instance(None) };
                    e
                })?;
            info!("Vulkan debug messenger created.");
            Some((loader, messenger))
        } else {
            None
        };

        let surface_loader = ash::extensions::khr::Surface::new(&entry, &raw);

        Ok(Arc::new(Self {
            entry,
            raw,
            surface_loader,
            debug_utils,
        }))
    }

    fn layer_available(entry: &ash::Entry, name: &CStr) -> Result<bool> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .at("vkEnumerateInstanceLayerProperties")?;
        Ok(layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == name))
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn raw(&self) -> &ash::Instance {
        &self.raw
    }

    pub fn surface_loader(&self) -> &ash::extensions::khr::Surface {
        &self.surface_loader
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
                info!("Vulkan debug messenger destroyed.");
            }
            self.raw.destroy_instance(None);
        }
        info!("Vulkan instance destroyed.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION, "validation")]
    #[case(
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        "validation"
    )]
    #[case(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE, "performance")]
    #[case(vk::DebugUtilsMessageTypeFlagsEXT::GENERAL, "general")]
    #[case(vk::DebugUtilsMessageTypeFlagsEXT::empty(), "general")]
    fn messages_are_classified(
        #[case] types: vk::DebugUtilsMessageTypeFlagsEXT,
        #[case] expected: &str,
    ) {
        assert_eq!(message_kind(types), expected);
    }

    #[test]
    fn null_strings_read_as_empty() {
        assert_eq!(unsafe { lossy(std::ptr::null()) }, "");
        let text = c"VUID-vkCmdDraw-None-02700";
        assert_eq!(unsafe { lossy(text.as_ptr()) }, "VUID-vkCmdDraw-None-02700");
    }
}
