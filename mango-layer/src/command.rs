//! Command-buffer tracking hooks.
//!
//! Primary command buffers get a pair of timestamp queries written at begin
//! and end so the HUD can show GPU time per frame. Secondary buffers are
//! tracked only to keep the records consistent when they are replayed with
//! `vkCmdExecuteCommands`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use ash::vk::{self, Handle};
use parking_lot::Mutex;

use crate::device::{CommandBufferData, DeviceData};
use crate::dispatch::DEVICES;

pub unsafe extern "system" fn allocate_command_buffers(
    device: vk::Device,
    p_allocate_info: *const vk::CommandBufferAllocateInfo,
    p_command_buffers: *mut vk::CommandBuffer,
) -> vk::Result {
    let Some(data) = DEVICES.get(device) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    let result = (data.dispatch.fns.allocate_command_buffers)(
        device,
        p_allocate_info,
        p_command_buffers,
    );
    if result != vk::Result::SUCCESS {
        return result;
    }

    let info = &*p_allocate_info;
    let mut records = data.command_buffers.lock();
    for i in 0..info.command_buffer_count as isize {
        let handle = *p_command_buffers.offset(i);
        records.insert(
            handle.as_raw(),
            Arc::new(CommandBufferData {
                level: info.level,
                query_pair: Mutex::new(None),
                enqueued: AtomicBool::new(false),
                executed_secondaries: AtomicU32::new(0),
            }),
        );
    }
    result
}

pub unsafe extern "system" fn free_command_buffers(
    device: vk::Device,
    command_pool: vk::CommandPool,
    command_buffer_count: u32,
    p_command_buffers: *const vk::CommandBuffer,
) {
    let Some(data) = DEVICES.get(device) else {
        return;
    };
    {
        let mut records = data.command_buffers.lock();
        for i in 0..command_buffer_count as isize {
            let handle = *p_command_buffers.offset(i);
            if let Some(record) = records.remove(&handle.as_raw()) {
                data.release_query_pair(&record);
            }
        }
    }
    (data.dispatch.fns.free_command_buffers)(
        device,
        command_pool,
        command_buffer_count,
        p_command_buffers,
    );
}

pub unsafe extern "system" fn reset_command_buffer(
    command_buffer: vk::CommandBuffer,
    flags: vk::CommandBufferResetFlags,
) -> vk::Result {
    let Some((device_data, record)) = find_record(command_buffer) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    device_data.release_query_pair(&record);
    record.enqueued.store(false, Ordering::Release);
    record.executed_secondaries.store(0, Ordering::Relaxed);
    (device_data.dispatch.fns.reset_command_buffer)(command_buffer, flags)
}

pub unsafe extern "system" fn begin_command_buffer(
    command_buffer: vk::CommandBuffer,
    p_begin_info: *const vk::CommandBufferBeginInfo,
) -> vk::Result {
    let Some((device_data, record)) = find_record(command_buffer) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };

    // A begin implicitly resets; release any previous query pair.
    device_data.release_query_pair(&record);
    record.enqueued.store(false, Ordering::Release);
    record.executed_secondaries.store(0, Ordering::Relaxed);

    let result = (device_data.dispatch.fns.begin_command_buffer)(command_buffer, p_begin_info);
    if result != vk::Result::SUCCESS {
        return result;
    }

    // Only primary command buffers carry a timestamp pair.
    if record.level == vk::CommandBufferLevel::PRIMARY
        && !mango_core::blacklist::is_blacklisted()
        && device_data.ensure_timestamp_pool()
    {
        let pair = device_data.timestamps.lock().as_mut().and_then(|ts| ts.take());
        if let Some(pair) = pair {
            let pool = device_data.timestamps.lock().as_ref().unwrap().pool;
            (device_data.dispatch.fns.cmd_reset_query_pool)(
                command_buffer,
                pool,
                pair * 2,
                2,
            );
            (device_data.dispatch.fns.cmd_write_timestamp)(
                command_buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                pool,
                pair * 2,
            );
            *record.query_pair.lock() = Some(pair);
        }
    }
    result
}

pub unsafe extern "system" fn end_command_buffer(
    command_buffer: vk::CommandBuffer,
) -> vk::Result {
    let Some((device_data, record)) = find_record(command_buffer) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };

    if let Some(pair) = *record.query_pair.lock() {
        let pool = device_data
            .timestamps
            .lock()
            .as_ref()
            .map(|ts| ts.pool)
            .unwrap_or(vk::QueryPool::null());
        if pool != vk::QueryPool::null() {
            (device_data.dispatch.fns.cmd_write_timestamp)(
                command_buffer,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                pool,
                pair * 2 + 1,
            );
        }
    }
    (device_data.dispatch.fns.end_command_buffer)(command_buffer)
}

pub unsafe extern "system" fn cmd_execute_commands(
    command_buffer: vk::CommandBuffer,
    command_buffer_count: u32,
    p_command_buffers: *const vk::CommandBuffer,
) {
    if let Some((device_data, record)) = find_record(command_buffer) {
        record
            .executed_secondaries
            .fetch_add(command_buffer_count, Ordering::Relaxed);
        (device_data.dispatch.fns.cmd_execute_commands)(
            command_buffer,
            command_buffer_count,
            p_command_buffers,
        );
    }
}

/// Command buffers do not name their device, so search the (tiny) device
/// map for the record.
fn find_record(
    command_buffer: vk::CommandBuffer,
) -> Option<(Arc<DeviceData>, Arc<CommandBufferData>)> {
    DEVICES.find_map(|device_data| {
        device_data
            .command_buffer_data(command_buffer)
            .map(|record| (Arc::clone(device_data), record))
    })
}
