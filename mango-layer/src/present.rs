//! `vkQueuePresentKHR` / `vkQueueSubmit` — the per-frame hot path.
//!
//! Present order of operations: learn the render node (once), register the
//! present queue, early sleep, refresh the limiter target, compose the HUD
//! (may append a wait semaphore), forward the present, late sleep, update
//! the stats ring. Every inner result is returned to the application
//! unchanged.

use std::slice;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use ash::vk::{self, Handle};
use once_cell::sync::OnceCell;
use smallvec::SmallVec;

use metrics::clock;
use types::FpsLimitMethod;

use crate::device::DeviceData;
use crate::dispatch::DEVICES;
use crate::swapchain::SwapchainData;

/// The HUD renderer contract (§ overlay compositor).
///
/// The renderer records and submits its own command buffer against the
/// swapchain's render pass and returns the semaphore its submission
/// signals; the layer appends that to the present's wait list so scanout
/// sees the composited image. Returning `None` (or any internal failure)
/// downgrades to "no HUD this frame".
pub trait HudRenderer: Send + Sync {
    fn draw(
        &self,
        device: &DeviceData,
        swapchain: &SwapchainData,
        image_index: u32,
        queue_family: u32,
    ) -> Option<vk::Semaphore>;
}

static HUD_RENDERER: OnceCell<Box<dyn HudRenderer>> = OnceCell::new();

/// Install the out-of-process/GL-agnostic HUD compositor. May be called at
/// most once; later calls lose.
pub fn install_hud_renderer(renderer: Box<dyn HudRenderer>) {
    let _ = HUD_RENDERER.set(renderer);
}

/// Presents the driver allows ahead of scanout when present-wait pacing is
/// active.
const PRESENT_AHEAD: u64 = 1;

/// Probe `VK_EXT_physical_device_drm` once per device for the render node
/// minor so the right sysfs sampler can be started.
unsafe fn probe_render_minor(data: &DeviceData) {
    if data.render_minor.load(Ordering::Relaxed) != 0 {
        return;
    }
    let mut drm_props = vk::PhysicalDeviceDrmPropertiesEXT::default();
    let mut props2 = vk::PhysicalDeviceProperties2::builder()
        .push_next(&mut drm_props)
        .build();
    (data.dispatch.instance.gpdp2.get_physical_device_properties2_khr)(
        data.dispatch.physical_device,
        &mut props2,
    );
    if drm_props.has_render == vk::TRUE {
        let minor = drm_props.render_minor as u32;
        data.render_minor.store(minor, Ordering::Relaxed);
        log::debug!("render node minor: {minor}");
        mango_core::Overlay::global().init_gpu_from_render_minor(minor);
    } else {
        // Mark as probed so we do not query every frame.
        data.render_minor.store(u32::MAX, Ordering::Relaxed);
    }
}

pub unsafe extern "system" fn queue_present_khr(
    queue: vk::Queue,
    p_present_info: *const vk::PresentInfoKHR,
) -> vk::Result {
    profiling::scope!("vkQueuePresentKHR");

    let Some(data) = DEVICES.find_map(|device| {
        device
            .queue_data(queue)
            .is_some()
            .then(|| Arc::clone(device))
    }) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };

    if mango_core::blacklist::is_blacklisted() {
        return (data.dispatch.swapchain_fns.queue_present_khr)(queue, p_present_info);
    }

    let overlay = mango_core::Overlay::global();
    let present_info = &*p_present_info;
    if present_info.swapchain_count == 0 {
        return (data.dispatch.swapchain_fns.queue_present_khr)(queue, p_present_info);
    }
    let swapchains = slice::from_raw_parts(
        present_info.p_swapchains,
        present_info.swapchain_count as usize,
    );

    probe_render_minor(&data);

    let limiter = &data.fps_limiter;
    limiter.queue_limiter.add_present_queue(queue);

    limiter.limit(true);

    // Target and placement refresh from the control channel / params.
    limiter.set_fps_limit(overlay.fps_limit_target());
    limiter.set_use_early(overlay.fps_limit_method() == FpsLimitMethod::Early);

    // Collect finished GPU-time queries for this queue before new work.
    if let Some(queue_data) = data.queue_data(queue) {
        data.collect_timestamps(&queue_data);
    }

    // Compose the HUD; its completion semaphore joins the wait list.
    let mut wait_semaphores: SmallVec<[vk::Semaphore; 4]> =
        if present_info.wait_semaphore_count > 0 {
            SmallVec::from_slice(slice::from_raw_parts(
                present_info.p_wait_semaphores,
                present_info.wait_semaphore_count as usize,
            ))
        } else {
            SmallVec::new()
        };
    let mut patched_info = *present_info;
    if overlay.hud_visible() {
        if let (Some(renderer), Some(queue_data)) =
            (HUD_RENDERER.get(), data.queue_data(queue))
        {
            let image_index = *present_info.p_image_indices;
            let swapchain_data = data
                .swapchains
                .lock()
                .get(&swapchains[0].as_raw())
                .cloned();
            if let Some(swapchain_data) = swapchain_data {
                if let Some(semaphore) = renderer.draw(
                    &data,
                    &swapchain_data,
                    image_index,
                    queue_data.family_index,
                ) {
                    wait_semaphores.push(semaphore);
                    patched_info.wait_semaphore_count = wait_semaphores.len() as u32;
                    patched_info.p_wait_semaphores = wait_semaphores.as_ptr();
                }
            }
        }
    }

    // Present-id bookkeeping for present-wait pacing and the IPC channel.
    let ids = data.present_limiter.on_present(swapchains);

    let result = (data.dispatch.swapchain_fns.queue_present_khr)(queue, &patched_info);

    data.present_limiter
        .on_present_result(swapchains, &ids, result);
    if limiter.is_active() && data.has_present_wait() {
        data.present_limiter
            .throttle(&*data, swapchains[0], PRESENT_AHEAD);
    }

    limiter.limit(false);

    // Stats: per-swapchain ring plus the process-wide tick.
    let now = clock::now_ns();
    let params = overlay.params();
    if let Some(swapchain_data) = data.swapchains.lock().get(&swapchains[0].as_raw()) {
        swapchain_data
            .frame_stats
            .lock()
            .record_present(now, params.fps_sampling_period_ms * 1_000_000);
        swapchain_data.n_frames.fetch_add(1, Ordering::Relaxed);
    }
    overlay.frame_tick(now);

    result
}

pub unsafe extern "system" fn queue_submit(
    queue: vk::Queue,
    submit_count: u32,
    p_submits: *const vk::SubmitInfo,
    fence: vk::Fence,
) -> vk::Result {
    let Some(data) = DEVICES.find_map(|device| {
        device
            .queue_data(queue)
            .is_some()
            .then(|| Arc::clone(device))
    }) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };

    if mango_core::blacklist::is_blacklisted() {
        return (data.dispatch.fns.queue_submit)(queue, submit_count, p_submits, fence);
    }

    let limiter = &data.fps_limiter.queue_limiter;
    let is_present_queue = limiter.is_present_queue(queue);

    if is_present_queue {
        limiter.throttle_before_submit(&*data);
    }

    // Track timestamped command buffers so their queries can be read back.
    let mut timestamped: SmallVec<[vk::CommandBuffer; 8]> = SmallVec::new();
    let submits = if submit_count > 0 {
        slice::from_raw_parts(p_submits, submit_count as usize)
    } else {
        &[]
    };
    for submit in submits {
        if submit.command_buffer_count == 0 {
            continue;
        }
        let command_buffers = slice::from_raw_parts(
            submit.p_command_buffers,
            submit.command_buffer_count as usize,
        );
        for &command_buffer in command_buffers {
            let Some(record) = data.command_buffer_data(command_buffer) else {
                continue;
            };
            if record.enqueued.swap(true, Ordering::AcqRel) {
                // Submitting while already enqueued breaks the readback
                // accounting; the driver will validate the app's usage.
                log::debug!("command buffer submitted while already in flight");
            }
            if record.query_pair.lock().is_some() {
                timestamped.push(command_buffer);
            }
        }
    }

    let result = (data.dispatch.fns.queue_submit)(queue, submit_count, p_submits, fence);
    if result != vk::Result::SUCCESS {
        return result;
    }

    if let Some(queue_data) = data.queue_data(queue) {
        if !timestamped.is_empty()
            && queue_data.timestamp_valid_bits != 0
            && !queue_data.readback_pending.load(Ordering::Acquire)
        {
            use crate::pacing::DeviceOps;
            // Fence the readback with a marker submission behind the work.
            let mut fence_guard = queue_data.readback_fence.lock();
            if *fence_guard == vk::Fence::null() {
                if let Some(created) = data.create_fence() {
                    *fence_guard = created;
                }
            }
            let readback_fence = *fence_guard;
            drop(fence_guard);

            if readback_fence != vk::Fence::null()
                && data.submit_marker(queue, readback_fence) == vk::Result::SUCCESS
            {
                let mut pending = queue_data.pending_timestamps.lock();
                for command_buffer in timestamped {
                    if let Some(record) = data.command_buffer_data(command_buffer) {
                        if let Some(pair) = *record.query_pair.lock() {
                            pending.push(crate::device::PendingTimestamp {
                                command_buffer,
                                query_pair: pair,
                            });
                        }
                    }
                }
                queue_data.readback_pending.store(true, Ordering::Release);
            }
        }
    }

    if is_present_queue {
        // Marking is best-effort; the application only ever sees the inner
        // submit's result.
        let mark = limiter.mark_after_submit(&*data, queue);
        if mark != vk::Result::SUCCESS {
            log::debug!("pacing marker submit failed: {mark:?}");
        }
    }

    result
}
