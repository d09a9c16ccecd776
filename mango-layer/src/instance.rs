//! `vkCreateInstance` / `vkDestroyInstance` hooks.
//!
//! The instance hook extends the extension list with what the DMA-BUF
//! export path needs later, captures the engine name for display, and loads
//! the next layer's dispatch.

use std::ffi::CStr;
use std::mem;
use std::os::raw::c_char;
use std::sync::Arc;

use ash::vk;

use types::EngineType;

use crate::dispatch::{
    find_instance_chain_info, InstanceDispatch, INSTANCES, PHYSICAL_DEVICES, VK_LAYER_LINK_INFO,
};

/// Instance-level extensions we append when the app did not ask for them.
const INSTANCE_EXTENSIONS: &[&CStr] = &[
    vk::KhrExternalMemoryCapabilitiesFn::name(),
    vk::KhrExternalSemaphoreCapabilitiesFn::name(),
    vk::ExtDebugUtilsFn::name(),
];

/// Merge `wanted` into the application's extension list, skipping
/// duplicates. The returned Vec owns nothing; pointers stay valid for the
/// duration of the call because they point into `existing` and `wanted`.
pub(crate) unsafe fn merge_extension_lists(
    existing: *const *const c_char,
    existing_count: u32,
    wanted: &[&CStr],
) -> Vec<*const c_char> {
    let mut merged: Vec<*const c_char> = Vec::with_capacity(existing_count as usize + wanted.len());
    for i in 0..existing_count as isize {
        merged.push(*existing.offset(i));
    }
    for name in wanted {
        let already = merged.iter().any(|&ptr| {
            !ptr.is_null() && CStr::from_ptr(ptr) == *name
        });
        if !already {
            merged.push(name.as_ptr());
        }
    }
    merged
}

pub unsafe extern "system" fn create_instance(
    p_create_info: *const vk::InstanceCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    crate::bootstrap_logging();

    let create_info = &*p_create_info;

    let Some(chain_info) = find_instance_chain_info(create_info, VK_LAYER_LINK_INFO) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let layer_info = (*chain_info).u.p_layer_info;
    if layer_info.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let gipa = (*layer_info).pfn_next_get_instance_proc_addr;
    // Advance the chain for the next layer.
    (*chain_info).u.p_layer_info = (*layer_info).p_next;

    let next_create_instance: vk::PFN_vkCreateInstance = match gipa(
        vk::Instance::null(),
        b"vkCreateInstance\0".as_ptr() as *const c_char,
    ) {
        Some(f) => mem::transmute(f),
        None => return vk::Result::ERROR_INITIALIZATION_FAILED,
    };

    // Capture the engine for display before we lose the app info.
    let mut engine_name = String::new();
    let mut engine_version = 0;
    if !create_info.p_application_info.is_null() {
        let app_info = &*create_info.p_application_info;
        if !app_info.p_engine_name.is_null() {
            engine_name = CStr::from_ptr(app_info.p_engine_name)
                .to_string_lossy()
                .into_owned();
        }
        engine_version = app_info.engine_version;
    }

    let extensions = merge_extension_lists(
        create_info.pp_enabled_extension_names,
        create_info.enabled_extension_count,
        INSTANCE_EXTENSIONS,
    );

    let mut info = *create_info;
    info.enabled_extension_count = extensions.len() as u32;
    info.pp_enabled_extension_names = extensions.as_ptr();

    let result = next_create_instance(&info, p_allocator, p_instance);
    if result != vk::Result::SUCCESS {
        return result;
    }

    let instance = *p_instance;
    let dispatch = Arc::new(InstanceDispatch::load(
        instance,
        gipa,
        engine_name.clone(),
        engine_version,
    ));
    INSTANCES.insert(instance, Arc::clone(&dispatch));
    map_physical_devices(&dispatch, true);

    if !mango_core::blacklist::is_blacklisted() {
        let engine = EngineType::from_engine_name(&engine_name);
        let version = if matches!(engine, EngineType::Dxvk | EngineType::Vkd3d) {
            format!(
                "{}.{}.{}",
                vk::api_version_major(engine_version),
                vk::api_version_minor(engine_version),
                vk::api_version_patch(engine_version)
            )
        } else {
            String::new()
        };
        mango_core::Overlay::global().set_engine(mango_core::overlay::EngineInfo {
            engine,
            name: engine_name,
            version,
        });
    }

    result
}

unsafe fn map_physical_devices(dispatch: &Arc<InstanceDispatch>, map: bool) {
    let mut count = 0u32;
    (dispatch.fns.enumerate_physical_devices)(
        dispatch.instance,
        &mut count,
        std::ptr::null_mut(),
    );
    let mut devices = vec![vk::PhysicalDevice::null(); count as usize];
    (dispatch.fns.enumerate_physical_devices)(
        dispatch.instance,
        &mut count,
        devices.as_mut_ptr(),
    );
    for physical_device in devices {
        if map {
            PHYSICAL_DEVICES.insert(physical_device, Arc::clone(dispatch));
        } else {
            PHYSICAL_DEVICES.remove(physical_device);
        }
    }
}

pub unsafe extern "system" fn destroy_instance(
    instance: vk::Instance,
    p_allocator: *const vk::AllocationCallbacks,
) {
    let Some(dispatch) = INSTANCES.remove(instance) else {
        return;
    };
    map_physical_devices(&dispatch, false);
    (dispatch.fns.destroy_instance)(instance, p_allocator);
}

/// Keep unused-import warnings honest when compiled without hooks.
#[allow(unused)]
fn _assert_entry_types() {
    let _: vk::PFN_vkCreateInstance = create_instance;
    let _: vk::PFN_vkDestroyInstance = destroy_instance;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_merge_skips_duplicates() {
        let app_ext = vk::ExtDebugUtilsFn::name();
        let existing = [app_ext.as_ptr()];
        let merged = unsafe {
            merge_extension_lists(existing.as_ptr(), existing.len() as u32, INSTANCE_EXTENSIONS)
        };
        // debug_utils was already requested; only the two external-memory
        // capability extensions get appended.
        assert_eq!(merged.len(), 3);
        let names: Vec<&CStr> = merged
            .iter()
            .map(|&ptr| unsafe { CStr::from_ptr(ptr) })
            .collect();
        assert!(names.contains(&vk::KhrExternalMemoryCapabilitiesFn::name()));
        assert!(names.contains(&vk::KhrExternalSemaphoreCapabilitiesFn::name()));
        assert_eq!(
            names
                .iter()
                .filter(|&&name| name == vk::ExtDebugUtilsFn::name())
                .count(),
            1
        );
    }

    #[test]
    fn extension_merge_from_empty_list() {
        let merged =
            unsafe { merge_extension_lists(std::ptr::null(), 0, INSTANCE_EXTENSIONS) };
        assert_eq!(merged.len(), INSTANCE_EXTENSIONS.len());
    }
}
