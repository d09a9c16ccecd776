//! `vkCreateSwapchainKHR` / `vkDestroySwapchainKHR` hooks.
//!
//! Each swapchain gets one image view and framebuffer per image plus the
//! HUD render pass (LOAD, not CLEAR, so the application's frame stays
//! intact). Partial failures roll back through a drop guard instead of the
//! usual `goto cleanup` ladder.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use ash::vk::{self, Handle};
use parking_lot::Mutex;

use mango_core::frame_stats::FrameStats;

use crate::device::DeviceData;
use crate::dispatch::{DeviceDispatch, DEVICES};

/// Per-swapchain layer state.
pub struct SwapchainData {
    pub swapchain: vk::SwapchainKHR,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub color_space: vk::ColorSpaceKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
    /// Rolling frametime window, written by the present thread only.
    pub frame_stats: Mutex<FrameStats>,
    pub n_frames: AtomicU64,
}

impl SwapchainData {
    /// Destroy everything this record owns. The swapchain handle itself
    /// belongs to the application.
    pub unsafe fn destroy_resources(&self, dispatch: &DeviceDispatch) {
        for &framebuffer in &self.framebuffers {
            (dispatch.fns.destroy_framebuffer)(dispatch.device, framebuffer, std::ptr::null());
        }
        if self.render_pass != vk::RenderPass::null() {
            (dispatch.fns.destroy_render_pass)(
                dispatch.device,
                self.render_pass,
                std::ptr::null(),
            );
        }
        for &view in &self.views {
            (dispatch.fns.destroy_image_view)(dispatch.device, view, std::ptr::null());
        }
    }
}

/// Rolls back partially-created swapchain resources unless disarmed.
struct Rollback<'a> {
    dispatch: &'a DeviceDispatch,
    views: Vec<vk::ImageView>,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    armed: bool,
}

impl<'a> Rollback<'a> {
    fn new(dispatch: &'a DeviceDispatch) -> Self {
        Self {
            dispatch,
            views: Vec::new(),
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            armed: true,
        }
    }

    /// Success: hand the resources over to the caller.
    fn disarm(mut self) -> (Vec<vk::ImageView>, vk::RenderPass, Vec<vk::Framebuffer>) {
        self.armed = false;
        (
            std::mem::take(&mut self.views),
            std::mem::replace(&mut self.render_pass, vk::RenderPass::null()),
            std::mem::take(&mut self.framebuffers),
        )
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        unsafe {
            for &framebuffer in &self.framebuffers {
                (self.dispatch.fns.destroy_framebuffer)(
                    self.dispatch.device,
                    framebuffer,
                    std::ptr::null(),
                );
            }
            if self.render_pass != vk::RenderPass::null() {
                (self.dispatch.fns.destroy_render_pass)(
                    self.dispatch.device,
                    self.render_pass,
                    std::ptr::null(),
                );
            }
            for &view in &self.views {
                (self.dispatch.fns.destroy_image_view)(
                    self.dispatch.device,
                    view,
                    std::ptr::null(),
                );
            }
        }
    }
}

/// The HUD render pass: one color attachment, loaded (the app's frame) and
/// stored, kept in COLOR_ATTACHMENT_OPTIMAL on both ends. The external
/// dependency orders our color writes after the application's.
unsafe fn create_hud_render_pass(
    dispatch: &DeviceDispatch,
    format: vk::Format,
) -> Result<vk::RenderPass, vk::Result> {
    let attachment = vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::LOAD)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let color_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(std::slice::from_ref(&color_ref))
        .build();

    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .build();

    let info = vk::RenderPassCreateInfo::builder()
        .attachments(std::slice::from_ref(&attachment))
        .subpasses(std::slice::from_ref(&subpass))
        .dependencies(std::slice::from_ref(&dependency))
        .build();

    let mut render_pass = vk::RenderPass::null();
    let result = (dispatch.fns.create_render_pass)(
        dispatch.device,
        &info,
        std::ptr::null(),
        &mut render_pass,
    );
    if result != vk::Result::SUCCESS {
        return Err(result);
    }
    Ok(render_pass)
}

pub unsafe extern "system" fn create_swapchain_khr(
    device: vk::Device,
    p_create_info: *const vk::SwapchainCreateInfoKHR,
    p_allocator: *const vk::AllocationCallbacks,
    p_swapchain: *mut vk::SwapchainKHR,
) -> vk::Result {
    let Some(data) = DEVICES.get(device) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    let dispatch = &data.dispatch;

    let result = (dispatch.swapchain_fns.create_swapchain_khr)(
        device,
        p_create_info,
        p_allocator,
        p_swapchain,
    );
    if result != vk::Result::SUCCESS {
        return result;
    }
    if mango_core::blacklist::is_blacklisted() {
        return result;
    }

    let create_info = &*p_create_info;
    let swapchain = *p_swapchain;

    match build_swapchain_data(&data, swapchain, create_info) {
        Ok(record) => {
            data.swapchains
                .lock()
                .insert(swapchain.as_raw(), Arc::new(record));
            vk::Result::SUCCESS
        }
        Err(err) => {
            // Unwind fully: without our resources the swapchain is useless
            // to us, and half-created state must not leak.
            (dispatch.swapchain_fns.destroy_swapchain_khr)(device, swapchain, p_allocator);
            err
        }
    }
}

unsafe fn build_swapchain_data(
    data: &DeviceData,
    swapchain: vk::SwapchainKHR,
    create_info: &vk::SwapchainCreateInfoKHR,
) -> Result<SwapchainData, vk::Result> {
    let dispatch = &data.dispatch;

    let mut count = 0u32;
    let result = (dispatch.swapchain_fns.get_swapchain_images_khr)(
        dispatch.device,
        swapchain,
        &mut count,
        std::ptr::null_mut(),
    );
    if result != vk::Result::SUCCESS || count == 0 {
        return Err(if result == vk::Result::SUCCESS {
            vk::Result::ERROR_INITIALIZATION_FAILED
        } else {
            result
        });
    }
    let mut images = vec![vk::Image::null(); count as usize];
    let result = (dispatch.swapchain_fns.get_swapchain_images_khr)(
        dispatch.device,
        swapchain,
        &mut count,
        images.as_mut_ptr(),
    );
    if result != vk::Result::SUCCESS {
        return Err(result);
    }

    let mut rollback = Rollback::new(dispatch);

    for &image in &images {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(create_info.image_format)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1)
                    .build(),
            )
            .build();
        let mut view = vk::ImageView::null();
        let result = (dispatch.fns.create_image_view)(
            dispatch.device,
            &view_info,
            std::ptr::null(),
            &mut view,
        );
        if result != vk::Result::SUCCESS {
            return Err(result);
        }
        rollback.views.push(view);
    }

    // The image-view count always matches the driver's image count.
    debug_assert_eq!(rollback.views.len(), images.len());

    rollback.render_pass = create_hud_render_pass(dispatch, create_info.image_format)?;

    for &view in &rollback.views {
        let fb_info = vk::FramebufferCreateInfo::builder()
            .render_pass(rollback.render_pass)
            .attachments(std::slice::from_ref(&view))
            .width(create_info.image_extent.width)
            .height(create_info.image_extent.height)
            .layers(1)
            .build();
        let mut framebuffer = vk::Framebuffer::null();
        let result = (dispatch.fns.create_framebuffer)(
            dispatch.device,
            &fb_info,
            std::ptr::null(),
            &mut framebuffer,
        );
        if result != vk::Result::SUCCESS {
            return Err(result);
        }
        rollback.framebuffers.push(framebuffer);
    }

    let (views, render_pass, framebuffers) = rollback.disarm();
    Ok(SwapchainData {
        swapchain,
        format: create_info.image_format,
        extent: create_info.image_extent,
        color_space: create_info.image_color_space,
        images,
        views,
        render_pass,
        framebuffers,
        frame_stats: Mutex::new(FrameStats::new()),
        n_frames: AtomicU64::new(0),
    })
}

pub unsafe extern "system" fn destroy_swapchain_khr(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    p_allocator: *const vk::AllocationCallbacks,
) {
    let Some(data) = DEVICES.get(device) else {
        return;
    };
    if let Some(record) = data.swapchains.lock().remove(&swapchain.as_raw()) {
        record.destroy_resources(&data.dispatch);
    }
    data.present_limiter.remove_swapchain(swapchain);
    (data.dispatch.swapchain_fns.destroy_swapchain_khr)(device, swapchain, p_allocator);
}
