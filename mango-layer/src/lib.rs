/*! MangoHud's injection surfaces.
 *
 * Two ways into the application's present path live here:
 *
 * - a Vulkan implicit layer (`vkGetInstanceProcAddr` / `vkGetDeviceProcAddr`
 *   exports resolving a fixed hook table, everything else falling through
 *   to the next layer), and
 * - a GL interposer (`dlsym` export short-circuiting the swap-buffer entry
 *   points of GLX and EGL).
 *
 * Both drive the shared overlay runtime in `mango-core` once per present.
 * For a blacklisted process every hook forwards untouched.
 */

pub mod command;
pub mod device;
pub mod dispatch;
pub mod gl;
pub mod instance;
pub mod pacing;
pub mod present;
pub mod swapchain;

use std::ffi::CStr;
use std::mem;
use std::os::raw::c_char;
use std::sync::Once;

use ash::vk;

/// One-time logging init, driven by `MANGOHUD_LOG_LEVEL`.
pub(crate) fn bootstrap_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let env = env_logger::Env::new()
            .filter_or("MANGOHUD_LOG_LEVEL", "warn")
            .write_style("MANGOHUD_LOG_STYLE");
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .try_init();
    });
}

macro_rules! hook {
    ($f:expr) => {
        Some(unsafe { mem::transmute::<_, unsafe extern "system" fn()>($f as *const ()) })
    };
}

/// The fixed table of hooked entry points; anything else falls through.
fn find_hook(name: &CStr) -> Option<vk::PFN_vkVoidFunction> {
    let hook: vk::PFN_vkVoidFunction = match name.to_bytes() {
        b"vkGetInstanceProcAddr" => hook!(vkGetInstanceProcAddr),
        b"vkGetDeviceProcAddr" => hook!(vkGetDeviceProcAddr),
        b"vkCreateInstance" => hook!(instance::create_instance),
        b"vkDestroyInstance" => hook!(instance::destroy_instance),
        b"vkCreateDevice" => hook!(device::create_device),
        b"vkDestroyDevice" => hook!(device::destroy_device),
        b"vkGetDeviceQueue" => hook!(device::get_device_queue),
        b"vkGetDeviceQueue2" => hook!(device::get_device_queue2),
        b"vkCreateSwapchainKHR" => hook!(swapchain::create_swapchain_khr),
        b"vkDestroySwapchainKHR" => hook!(swapchain::destroy_swapchain_khr),
        b"vkQueuePresentKHR" => hook!(present::queue_present_khr),
        b"vkQueueSubmit" => hook!(present::queue_submit),
        b"vkAllocateCommandBuffers" => hook!(command::allocate_command_buffers),
        b"vkFreeCommandBuffers" => hook!(command::free_command_buffers),
        b"vkResetCommandBuffer" => hook!(command::reset_command_buffer),
        b"vkBeginCommandBuffer" => hook!(command::begin_command_buffer),
        b"vkEndCommandBuffer" => hook!(command::end_command_buffer),
        b"vkCmdExecuteCommands" => hook!(command::cmd_execute_commands),
        _ => return None,
    };
    Some(hook)
}

/// Vulkan loader entry point.
///
/// # Safety
/// Called by the loader with loader-owned handles.
#[no_mangle]
pub unsafe extern "system" fn vkGetInstanceProcAddr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }
    let name = CStr::from_ptr(p_name);
    if let Some(hook) = find_hook(name) {
        return hook;
    }
    if instance == vk::Instance::null() {
        return None;
    }
    dispatch::next_instance_proc(instance, p_name)
}

/// Vulkan loader entry point.
///
/// # Safety
/// Called by the loader with loader-owned handles.
#[no_mangle]
pub unsafe extern "system" fn vkGetDeviceProcAddr(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }
    let name = CStr::from_ptr(p_name);
    // Instance-level creation entries never resolve through GDPA.
    if let Some(hook) = find_hook(name) {
        match name.to_bytes() {
            b"vkCreateInstance" | b"vkDestroyInstance" | b"vkCreateDevice"
            | b"vkGetInstanceProcAddr" => {}
            _ => return hook,
        }
    }
    if device == vk::Device::null() {
        return None;
    }
    let data = dispatch::DEVICES.get(device)?;
    (data.dispatch.get_device_proc_addr)(device, p_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_table_covers_the_layer_abi() {
        for name in [
            "vkCreateInstance",
            "vkDestroyInstance",
            "vkCreateDevice",
            "vkDestroyDevice",
            "vkCreateSwapchainKHR",
            "vkDestroySwapchainKHR",
            "vkQueuePresentKHR",
            "vkQueueSubmit",
            "vkGetDeviceQueue",
            "vkGetDeviceQueue2",
            "vkAllocateCommandBuffers",
            "vkFreeCommandBuffers",
            "vkResetCommandBuffer",
            "vkBeginCommandBuffer",
            "vkEndCommandBuffer",
            "vkCmdExecuteCommands",
        ] {
            let c_name = std::ffi::CString::new(name).unwrap();
            assert!(find_hook(&c_name).is_some(), "missing hook for {name}");
        }
    }

    #[test]
    fn unknown_entries_fall_through() {
        let c_name = std::ffi::CString::new("vkCmdDraw").unwrap();
        assert!(find_hook(&c_name).is_none());
    }
}
