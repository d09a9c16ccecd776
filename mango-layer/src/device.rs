//! `vkCreateDevice` / `vkDestroyDevice` / `vkGetDeviceQueue{,2}` hooks and
//! the per-device layer state.
//!
//! Device creation extends the extension set so the DMA-BUF export channel
//! and the HUD's YCbCr-capable import path can work without the app's
//! cooperation, and captures the loader's `SetDeviceLoaderData` callback
//! needed to dispatch on queues we create work on.

use std::ffi::CStr;
use std::mem;
use std::os::raw::c_char;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::dispatch::{
    find_device_chain_info, DeviceDispatch, DEVICES, PHYSICAL_DEVICES, VK_LAYER_LINK_INFO,
    VK_LOADER_DATA_CALLBACK,
};
use crate::pacing::{DeviceOps, FenceStatus, FpsLimiter, PresentLimiter, PresentWaitOps};
use crate::swapchain::SwapchainData;

/// Device-level extensions appended at create time.
const DEVICE_EXTENSIONS: &[&CStr] = &[
    vk::KhrExternalMemoryFn::name(),
    vk::KhrExternalMemoryFdFn::name(),
    vk::ExtExternalMemoryDmaBufFn::name(),
    vk::KhrExternalSemaphoreFn::name(),
    vk::KhrExternalSemaphoreFdFn::name(),
    vk::ExtImageDrmFormatModifierFn::name(),
    vk::KhrBindMemory2Fn::name(),
    vk::KhrGetMemoryRequirements2Fn::name(),
    vk::KhrSamplerYcbcrConversionFn::name(),
    vk::KhrImageFormatListFn::name(),
    vk::KhrMaintenance1Fn::name(),
];

/// Timestamp query pairs available per device.
const TIMESTAMP_PAIRS: u32 = 512;

/// Per-queue record.
pub struct QueueData {
    pub queue: vk::Queue,
    pub family_index: u32,
    pub flags: vk::QueueFlags,
    /// Valid bits of timestamps written on this family, 0 = unsupported.
    pub timestamp_valid_bits: u32,
    /// Marker fence used to fence GPU query readback.
    pub readback_fence: Mutex<vk::Fence>,
    pub readback_pending: AtomicBool,
    /// Command buffers with timestamp queries submitted on this queue.
    pub pending_timestamps: Mutex<Vec<PendingTimestamp>>,
}

pub struct PendingTimestamp {
    pub command_buffer: vk::CommandBuffer,
    pub query_pair: u32,
}

/// Per-command-buffer record.
pub struct CommandBufferData {
    pub level: vk::CommandBufferLevel,
    /// Index of the query pair, primary command buffers only.
    pub query_pair: Mutex<Option<u32>>,
    pub enqueued: AtomicBool,
    /// Secondary buffers replayed into this one since the last begin.
    pub executed_secondaries: AtomicU32,
}

/// Timestamp query pool plus its free list.
pub struct TimestampPool {
    pub pool: vk::QueryPool,
    free: Vec<u32>,
}

impl TimestampPool {
    pub fn take(&mut self) -> Option<u32> {
        self.free.pop()
    }

    pub fn give_back(&mut self, pair: u32) {
        self.free.push(pair);
    }
}

pub struct DeviceData {
    pub dispatch: Arc<DeviceDispatch>,
    pub queues: Mutex<FxHashMap<u64, Arc<QueueData>>>,
    pub swapchains: Mutex<FxHashMap<u64, Arc<SwapchainData>>>,
    pub command_buffers: Mutex<FxHashMap<u64, Arc<CommandBufferData>>>,
    pub timestamps: Mutex<Option<TimestampPool>>,
    /// Accumulated GPU time of the most recent readback window.
    pub gpu_time_ns: AtomicU64,
    /// DRM render node minor, learned on first present. 0 = not probed yet.
    pub render_minor: AtomicU32,
    pub fps_limiter: FpsLimiter,
    pub present_limiter: PresentLimiter,
    queue_family_props: Vec<vk::QueueFamilyProperties>,
}

// Fence/marker plumbing for the queue limiter.
impl DeviceOps for DeviceData {
    fn create_fence(&self) -> Option<vk::Fence> {
        let info = vk::FenceCreateInfo::builder().build();
        let mut fence = vk::Fence::null();
        let result = unsafe {
            (self.dispatch.fns.create_fence)(
                self.dispatch.device,
                &info,
                std::ptr::null(),
                &mut fence,
            )
        };
        (result == vk::Result::SUCCESS).then_some(fence)
    }

    fn fence_status(&self, fence: vk::Fence) -> FenceStatus {
        match unsafe { (self.dispatch.fns.get_fence_status)(self.dispatch.device, fence) } {
            vk::Result::SUCCESS => FenceStatus::Ready,
            vk::Result::NOT_READY => FenceStatus::NotReady,
            _ => FenceStatus::Error,
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence) {
        profiling::scope!("vkWaitForFences");
        let _ = unsafe {
            (self.dispatch.fns.wait_for_fences)(
                self.dispatch.device,
                1,
                &fence,
                vk::TRUE,
                u64::MAX,
            )
        };
    }

    fn reset_fence(&self, fence: vk::Fence) {
        let _ = unsafe { (self.dispatch.fns.reset_fences)(self.dispatch.device, 1, &fence) };
    }

    fn submit_marker(&self, queue: vk::Queue, fence: vk::Fence) -> vk::Result {
        let info = vk::SubmitInfo::builder().build();
        unsafe { (self.dispatch.fns.queue_submit)(queue, 1, &info, fence) }
    }
}

impl PresentWaitOps for DeviceData {
    fn wait_for_present(
        &self,
        swapchain: vk::SwapchainKHR,
        present_id: u64,
        timeout_ns: u64,
    ) -> vk::Result {
        unsafe {
            (self.dispatch.present_wait_fns.wait_for_present_khr)(
                self.dispatch.device,
                swapchain,
                present_id,
                timeout_ns,
            )
        }
    }
}

impl DeviceData {
    pub fn has_present_wait(&self) -> bool {
        self.dispatch.has_present_wait()
    }

    fn register_queue(&self, queue: vk::Queue, family_index: u32) {
        let mut queues = self.queues.lock();
        if queues.contains_key(&queue.as_raw()) {
            return;
        }
        let props = self.queue_family_props.get(family_index as usize);
        queues.insert(
            queue.as_raw(),
            Arc::new(QueueData {
                queue,
                family_index,
                flags: props.map(|p| p.queue_flags).unwrap_or_default(),
                timestamp_valid_bits: props.map(|p| p.timestamp_valid_bits).unwrap_or(0),
                readback_fence: Mutex::new(vk::Fence::null()),
                readback_pending: AtomicBool::new(false),
                pending_timestamps: Mutex::new(Vec::new()),
            }),
        );
    }

    pub fn queue_data(&self, queue: vk::Queue) -> Option<Arc<QueueData>> {
        self.queues.lock().get(&queue.as_raw()).cloned()
    }

    pub fn command_buffer_data(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Option<Arc<CommandBufferData>> {
        self.command_buffers
            .lock()
            .get(&command_buffer.as_raw())
            .cloned()
    }

    /// Lazily create the timestamp query pool; `None` while unsupported.
    pub fn ensure_timestamp_pool(&self) -> bool {
        let mut guard = self.timestamps.lock();
        if guard.is_some() {
            return true;
        }
        let info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(TIMESTAMP_PAIRS * 2)
            .build();
        let mut pool = vk::QueryPool::null();
        let result = unsafe {
            (self.dispatch.fns.create_query_pool)(
                self.dispatch.device,
                &info,
                std::ptr::null(),
                &mut pool,
            )
        };
        if result != vk::Result::SUCCESS {
            log::info!("timestamp query pool unavailable: {result:?}");
            return false;
        }
        *guard = Some(TimestampPool {
            pool,
            free: (0..TIMESTAMP_PAIRS).rev().collect(),
        });
        true
    }

    /// Poll this queue's fenced readback; accumulate finished GPU spans.
    pub fn collect_timestamps(&self, queue_data: &QueueData) {
        if !queue_data.readback_pending.load(Ordering::Acquire) {
            return;
        }
        let fence = *queue_data.readback_fence.lock();
        if fence == vk::Fence::null() || self.fence_status(fence) != FenceStatus::Ready {
            return;
        }

        let mut pending = queue_data.pending_timestamps.lock();
        let timestamps = self.timestamps.lock();
        let Some(ts) = timestamps.as_ref() else {
            pending.clear();
            return;
        };

        let mut total_ns = 0u64;
        for entry in pending.drain(..) {
            let mut results = [0u64; 2];
            let result = unsafe {
                (self.dispatch.fns.get_query_pool_results)(
                    self.dispatch.device,
                    ts.pool,
                    entry.query_pair * 2,
                    2,
                    mem::size_of_val(&results),
                    results.as_mut_ptr() as *mut std::ffi::c_void,
                    mem::size_of::<u64>() as u64,
                    vk::QueryResultFlags::TYPE_64,
                )
            };
            if result == vk::Result::SUCCESS && results[1] > results[0] {
                let ticks = results[1] - results[0];
                total_ns += (ticks as f64 * self.dispatch.timestamp_period as f64) as u64;
            }
            if let Some(cb) = self.command_buffer_data(entry.command_buffer) {
                cb.enqueued.store(false, Ordering::Release);
            }
        }
        drop(timestamps);

        if total_ns > 0 {
            self.gpu_time_ns.store(total_ns, Ordering::Relaxed);
        }
        self.reset_fence(fence);
        queue_data.readback_pending.store(false, Ordering::Release);
    }

    /// Release a command buffer's query pair back to the pool.
    pub fn release_query_pair(&self, cb: &CommandBufferData) {
        if let Some(pair) = cb.query_pair.lock().take() {
            if let Some(ts) = self.timestamps.lock().as_mut() {
                ts.give_back(pair);
            }
        }
    }
}

pub unsafe extern "system" fn create_device(
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_device: *mut vk::Device,
) -> vk::Result {
    let Some(instance_dispatch) = PHYSICAL_DEVICES.get(physical_device) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let create_info = &*p_create_info;

    let Some(chain_info) = find_device_chain_info(create_info, VK_LAYER_LINK_INFO) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let layer_info = (*chain_info).u.p_layer_info;
    if layer_info.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let gipa = (*layer_info).pfn_next_get_instance_proc_addr;
    let gdpa = (*layer_info).pfn_next_get_device_proc_addr;
    (*chain_info).u.p_layer_info = (*layer_info).p_next;

    let next_create_device: vk::PFN_vkCreateDevice = match gipa(
        vk::Instance::null(),
        b"vkCreateDevice\0".as_ptr() as *const c_char,
    ) {
        Some(f) => mem::transmute(f),
        None => return vk::Result::ERROR_INITIALIZATION_FAILED,
    };

    // The loader's data callback is how we make queues dispatchable when we
    // submit the HUD's own work.
    let mut set_device_loader_data = None;
    if let Some(loader_info) = find_device_chain_info(create_info, VK_LOADER_DATA_CALLBACK) {
        set_device_loader_data = (*loader_info).u.pfn_set_device_loader_data;
    }
    if set_device_loader_data.is_none() {
        log::warn!("loader did not provide SetDeviceLoaderData; queue dispatch may misbehave");
    }

    let extensions = crate::instance::merge_extension_lists(
        create_info.pp_enabled_extension_names,
        create_info.enabled_extension_count,
        DEVICE_EXTENSIONS,
    );

    let mut info = *create_info;
    info.enabled_extension_count = extensions.len() as u32;
    info.pp_enabled_extension_names = extensions.as_ptr();

    let result = next_create_device(physical_device, &info, p_allocator, p_device);
    if result != vk::Result::SUCCESS {
        return result;
    }

    let device = *p_device;
    let dispatch = Arc::new(DeviceDispatch::load(
        device,
        physical_device,
        instance_dispatch.clone(),
        gdpa,
        set_device_loader_data,
    ));

    // Queue family properties drive per-queue timestamp support.
    let mut family_count = 0u32;
    (dispatch.instance.fns.get_physical_device_queue_family_properties)(
        physical_device,
        &mut family_count,
        std::ptr::null_mut(),
    );
    let mut families = vec![vk::QueueFamilyProperties::default(); family_count as usize];
    (dispatch.instance.fns.get_physical_device_queue_family_properties)(
        physical_device,
        &mut family_count,
        families.as_mut_ptr(),
    );

    // A blacklisted process never touches the overlay context; samplers and
    // config loading must not start for it.
    let use_early = if mango_core::blacklist::is_blacklisted() {
        false
    } else {
        mango_core::Overlay::global().fps_limit_method() == types::FpsLimitMethod::Early
    };

    DEVICES.insert(
        device,
        Arc::new(DeviceData {
            dispatch,
            queues: Mutex::new(FxHashMap::default()),
            swapchains: Mutex::new(FxHashMap::default()),
            command_buffers: Mutex::new(FxHashMap::default()),
            timestamps: Mutex::new(None),
            gpu_time_ns: AtomicU64::new(0),
            render_minor: AtomicU32::new(0),
            fps_limiter: FpsLimiter::new(use_early),
            present_limiter: PresentLimiter::new(),
            queue_family_props: families,
        }),
    );

    result
}

pub unsafe extern "system" fn destroy_device(
    device: vk::Device,
    p_allocator: *const vk::AllocationCallbacks,
) {
    let Some(data) = DEVICES.remove(device) else {
        return;
    };
    let _ = (data.dispatch.fns.device_wait_idle)(device);

    if !mango_core::blacklist::is_blacklisted() {
        mango_core::Overlay::global().shutdown();
    }

    if let Some(ts) = data.timestamps.lock().take() {
        (data.dispatch.fns.destroy_query_pool)(device, ts.pool, std::ptr::null());
    }
    for queue in data.queues.lock().values() {
        let fence = *queue.readback_fence.lock();
        if fence != vk::Fence::null() {
            (data.dispatch.fns.destroy_fence)(device, fence, std::ptr::null());
        }
    }

    (data.dispatch.fns.destroy_device)(device, p_allocator);
}

pub unsafe extern "system" fn get_device_queue(
    device: vk::Device,
    queue_family_index: u32,
    queue_index: u32,
    p_queue: *mut vk::Queue,
) {
    let Some(data) = DEVICES.get(device) else {
        return;
    };
    (data.dispatch.fns.get_device_queue)(device, queue_family_index, queue_index, p_queue);
    data.register_queue(*p_queue, queue_family_index);
}

pub unsafe extern "system" fn get_device_queue2(
    device: vk::Device,
    p_queue_info: *const vk::DeviceQueueInfo2,
    p_queue: *mut vk::Queue,
) {
    let Some(data) = DEVICES.get(device) else {
        return;
    };
    (data.dispatch.fns_1_1.get_device_queue2)(device, p_queue_info, p_queue);
    data.register_queue(*p_queue, (*p_queue_info).queue_family_index);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_pool_free_list_round_trips() {
        let mut pool = TimestampPool {
            pool: vk::QueryPool::null(),
            free: (0..4).rev().collect(),
        };
        assert_eq!(pool.take(), Some(0));
        assert_eq!(pool.take(), Some(1));
        pool.give_back(0);
        assert_eq!(pool.take(), Some(0));
        assert_eq!(pool.take(), Some(2));
        assert_eq!(pool.take(), Some(3));
        assert_eq!(pool.take(), None);
    }
}
