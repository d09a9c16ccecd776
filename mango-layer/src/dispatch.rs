//! Dispatch plumbing: loader chain structures, per-object dispatch tables
//! and the handle maps that connect raw Vulkan handles to layer state.
//!
//! The loader hands us the next layer's `GetInstanceProcAddr` /
//! `GetDeviceProcAddr` through `VkLayerInstanceCreateInfo` /
//! `VkLayerDeviceCreateInfo` entries on the create-info `pNext` chain;
//! everything we forward goes through tables loaded from those.

use std::ffi::c_void;
use std::mem;
use std::os::raw::c_char;
use std::sync::Arc;

use ash::vk::{self, Handle};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

pub const VK_LAYER_LINK_INFO: i32 = 0;
pub const VK_LOADER_DATA_CALLBACK: i32 = 1;

pub type PfnSetDeviceLoaderData =
    unsafe extern "system" fn(device: vk::Device, object: *mut c_void) -> vk::Result;

#[repr(C)]
pub struct VkLayerInstanceLink {
    pub p_next: *mut VkLayerInstanceLink,
    pub pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub pfn_next_get_physical_device_proc_addr: Option<unsafe extern "system" fn()>,
}

#[repr(C)]
pub union VkLayerInstanceCreateInfoUnion {
    pub p_layer_info: *mut VkLayerInstanceLink,
    pub pfn_set_instance_loader_data: Option<unsafe extern "system" fn()>,
}

#[repr(C)]
pub struct VkLayerInstanceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: i32,
    pub u: VkLayerInstanceCreateInfoUnion,
}

#[repr(C)]
pub struct VkLayerDeviceLink {
    pub p_next: *mut VkLayerDeviceLink,
    pub pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub pfn_next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
}

#[repr(C)]
pub union VkLayerDeviceCreateInfoUnion {
    pub p_layer_info: *mut VkLayerDeviceLink,
    pub pfn_set_device_loader_data: Option<PfnSetDeviceLoaderData>,
}

#[repr(C)]
pub struct VkLayerDeviceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: i32,
    pub u: VkLayerDeviceCreateInfoUnion,
}

/// Walk a create-info chain for the loader entry with `function`.
///
/// # Safety
/// `p_next` must be a valid Vulkan structure chain.
pub unsafe fn find_instance_chain_info(
    create_info: &vk::InstanceCreateInfo,
    function: i32,
) -> Option<*mut VkLayerInstanceCreateInfo> {
    let mut item = create_info.p_next as *const vk::BaseInStructure;
    while !item.is_null() {
        if (*item).s_type == vk::StructureType::LOADER_INSTANCE_CREATE_INFO {
            let info = item as *mut VkLayerInstanceCreateInfo;
            if (*info).function == function {
                return Some(info);
            }
        }
        item = (*item).p_next;
    }
    None
}

/// # Safety
/// `p_next` must be a valid Vulkan structure chain.
pub unsafe fn find_device_chain_info(
    create_info: &vk::DeviceCreateInfo,
    function: i32,
) -> Option<*mut VkLayerDeviceCreateInfo> {
    let mut item = create_info.p_next as *const vk::BaseInStructure;
    while !item.is_null() {
        if (*item).s_type == vk::StructureType::LOADER_DEVICE_CREATE_INFO {
            let info = item as *mut VkLayerDeviceCreateInfo;
            if (*info).function == function {
                return Some(info);
            }
        }
        item = (*item).p_next;
    }
    None
}

/// Functions we call on the instance, loaded from the next layer.
pub struct InstanceDispatch {
    pub instance: vk::Instance,
    pub get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub fns: vk::InstanceFnV1_0,
    pub gpdp2: vk::KhrGetPhysicalDeviceProperties2Fn,
    /// `pEngineName` captured from the application info.
    pub engine_name: String,
    pub engine_version: u32,
}

// Raw fn tables are immutable after load.
unsafe impl Send for InstanceDispatch {}
unsafe impl Sync for InstanceDispatch {}

impl InstanceDispatch {
    /// # Safety
    /// `instance` must have been created through `gipa`'s chain.
    pub unsafe fn load(
        instance: vk::Instance,
        gipa: vk::PFN_vkGetInstanceProcAddr,
        engine_name: String,
        engine_version: u32,
    ) -> Self {
        let loader = |name: &std::ffi::CStr| {
            mem::transmute::<vk::PFN_vkVoidFunction, *const c_void>(gipa(
                instance,
                name.as_ptr(),
            ))
        };
        Self {
            instance,
            get_instance_proc_addr: gipa,
            fns: vk::InstanceFnV1_0::load(loader),
            gpdp2: vk::KhrGetPhysicalDeviceProperties2Fn::load(loader),
            engine_name,
            engine_version,
        }
    }
}

/// Functions we call on the device, loaded from the next layer.
pub struct DeviceDispatch {
    pub device: vk::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: Arc<InstanceDispatch>,
    pub get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
    pub fns: vk::DeviceFnV1_0,
    pub fns_1_1: vk::DeviceFnV1_1,
    pub swapchain_fns: vk::KhrSwapchainFn,
    pub present_wait_fns: vk::KhrPresentWaitFn,
    pub set_device_loader_data: Option<PfnSetDeviceLoaderData>,
    /// Whether the driver resolved `vkWaitForPresentKHR`; ash substitutes a
    /// panicking stub for missing entry points, so this is checked up front.
    present_wait_available: bool,
    /// Nanoseconds per timestamp tick on this device.
    pub timestamp_period: f32,
}

unsafe impl Send for DeviceDispatch {}
unsafe impl Sync for DeviceDispatch {}

impl DeviceDispatch {
    /// # Safety
    /// `device` must have been created through `gdpa`'s chain.
    pub unsafe fn load(
        device: vk::Device,
        physical_device: vk::PhysicalDevice,
        instance: Arc<InstanceDispatch>,
        gdpa: vk::PFN_vkGetDeviceProcAddr,
        set_device_loader_data: Option<PfnSetDeviceLoaderData>,
    ) -> Self {
        let loader = |name: &std::ffi::CStr| {
            mem::transmute::<vk::PFN_vkVoidFunction, *const c_void>(gdpa(device, name.as_ptr()))
        };
        let mut properties = vk::PhysicalDeviceProperties::default();
        (instance.fns.get_physical_device_properties)(physical_device, &mut properties);

        let present_wait_available = gdpa(
            device,
            b"vkWaitForPresentKHR\0".as_ptr() as *const c_char,
        )
        .is_some();

        Self {
            device,
            physical_device,
            instance,
            get_device_proc_addr: gdpa,
            fns: vk::DeviceFnV1_0::load(loader),
            fns_1_1: vk::DeviceFnV1_1::load(loader),
            swapchain_fns: vk::KhrSwapchainFn::load(loader),
            present_wait_fns: vk::KhrPresentWaitFn::load(loader),
            set_device_loader_data,
            present_wait_available,
            timestamp_period: properties.limits.timestamp_period,
        }
    }

    pub fn has_present_wait(&self) -> bool {
        // ash loads a panicking stub when the entry point is missing, so
        // remember whether the pointer resolved at load time.
        self.present_wait_available
    }
}

/// Generic handle → record map guarded by its own lock. Writes happen only
/// in create/destroy hooks; the hot path takes the read side.
pub struct HandleMap<V> {
    map: RwLock<FxHashMap<u64, Arc<V>>>,
}

impl<V> Default for HandleMap<V> {
    fn default() -> Self {
        Self {
            map: RwLock::new(FxHashMap::default()),
        }
    }
}

impl<V> HandleMap<V> {
    pub fn insert<H: Handle>(&self, handle: H, value: Arc<V>) {
        self.map.write().insert(handle.as_raw(), value);
    }

    pub fn get<H: Handle>(&self, handle: H) -> Option<Arc<V>> {
        self.map.read().get(&handle.as_raw()).cloned()
    }

    pub fn remove<H: Handle>(&self, handle: H) -> Option<Arc<V>> {
        self.map.write().remove(&handle.as_raw())
    }

    /// First `Some` produced over the registered records.
    pub fn find_map<T>(&self, mut f: impl FnMut(&Arc<V>) -> Option<T>) -> Option<T> {
        self.map.read().values().find_map(|value| f(value))
    }
}

pub static INSTANCES: Lazy<HandleMap<InstanceDispatch>> = Lazy::new(HandleMap::default);
/// Physical devices resolve to their owning instance.
pub static PHYSICAL_DEVICES: Lazy<HandleMap<InstanceDispatch>> = Lazy::new(HandleMap::default);
pub static DEVICES: Lazy<HandleMap<crate::device::DeviceData>> = Lazy::new(HandleMap::default);

/// Resolve a name through the next layer's `GetInstanceProcAddr`.
///
/// # Safety
/// Standard Vulkan dispatch rules apply.
pub unsafe fn next_instance_proc(
    instance: vk::Instance,
    name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    let dispatch = INSTANCES.get(instance)?;
    (dispatch.get_instance_proc_addr)(instance, name)
}
