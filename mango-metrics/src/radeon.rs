//! Pre-GCN Radeon sampler.
//!
//! Those kernels expose no `gpu_metrics`; busy-ness is derived by polling
//! the GRBM_STATUS register through the DRM info ioctl and counting how
//! often the GUI-active bit is set across a fixed number of ticks.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use types::GpuSnapshot;

use crate::{interruptible_sleep, MetricsError, SamplerWorker, Telemetry};

const BYTES_PER_GIB: f32 = 1024.0 * 1024.0 * 1024.0;

const GRBM_STATUS: u32 = 0x8010;
const GRBM_GUI_ACTIVE: u32 = 1 << 31;

const RADEON_INFO_VRAM_USAGE: u32 = 0x1e;
const RADEON_INFO_READ_REG: u32 = 0x24;
const RADEON_INFO_CURRENT_GPU_TEMP: u32 = 0x21;
const RADEON_INFO_CURRENT_GPU_SCLK: u32 = 0x22;
const RADEON_INFO_CURRENT_GPU_MCLK: u32 = 0x23;

/// `struct drm_radeon_info` from the uapi headers.
#[repr(C)]
struct DrmRadeonInfo {
    request: u32,
    pad: u32,
    value: u64,
}

const DRM_COMMAND_BASE: u64 = 0x40;
const DRM_RADEON_INFO: u64 = 0x27;

/// `DRM_IOWR(DRM_COMMAND_BASE + DRM_RADEON_INFO, struct drm_radeon_info)`.
const fn drm_iowr(nr: u64, size: u64) -> u64 {
    const IOC_WRITE: u64 = 1;
    const IOC_READ: u64 = 2;
    ((IOC_READ | IOC_WRITE) << 30) | (size << 16) | ((b'd' as u64) << 8) | nr
}

const DRM_IOCTL_RADEON_INFO: u64 =
    drm_iowr(DRM_COMMAND_BASE + DRM_RADEON_INFO, std::mem::size_of::<DrmRadeonInfo>() as u64);

fn radeon_info(fd: i32, request: u32, out: &mut u64) -> Result<(), MetricsError> {
    let mut info = DrmRadeonInfo {
        request,
        pad: 0,
        value: out as *mut u64 as u64,
    };
    let ret = unsafe { libc::ioctl(fd, DRM_IOCTL_RADEON_INFO as _, &mut info) };
    if ret != 0 {
        return Err(MetricsError::DeviceUnavailable(format!(
            "DRM_IOCTL_RADEON_INFO request {request:#x} failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// GRBM busy counter over a window of register polls.
#[derive(Default)]
pub struct BusyWindow {
    busy_ticks: u32,
    ticks: u32,
}

impl BusyWindow {
    pub fn record(&mut self, status: u32) {
        if status & GRBM_GUI_ACTIVE != 0 {
            self.busy_ticks += 1;
        }
        self.ticks += 1;
    }

    /// Busy percent over the window so far, resetting the counters.
    pub fn reduce(&mut self) -> u32 {
        let percent = if self.ticks == 0 {
            0
        } else {
            self.busy_ticks * 100 / self.ticks
        };
        self.busy_ticks = 0;
        self.ticks = 0;
        percent
    }

    pub fn ticks(&self) -> u32 {
        self.ticks
    }
}

pub struct RadeonSampler {
    file: File,
    /// Register polls per reduction window.
    ticks_per_window: u32,
    poll_interval: Duration,
    /// Shared with [`RadeonSampler::set_sampling_period`] callers.
    period_ns: Arc<AtomicU32>,
}

impl RadeonSampler {
    pub fn open(card_path: &Path) -> Result<Self, MetricsError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(card_path)
            .map_err(|e| MetricsError::io(card_path.display().to_string(), e))?;
        let mut sampler = Self {
            file,
            ticks_per_window: 0,
            poll_interval: Duration::ZERO,
            period_ns: Arc::new(AtomicU32::new(0)),
        };
        sampler.apply_period(500_000_000);
        Ok(sampler)
    }

    /// Handle for changing the sampling period while the worker runs; the
    /// new value is picked up at the next poll tick.
    pub fn period_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.period_ns)
    }

    /// 120 register polls per second regardless of the window length.
    fn apply_period(&mut self, mut period_ns: u64) {
        const TICKS_PER_SEC: u64 = 120;
        if period_ns < 10_000_000 {
            period_ns = 10_000_000;
        }
        let ticks = (TICKS_PER_SEC * period_ns / 1_000_000_000).max(1);
        self.ticks_per_window = ticks as u32;
        self.poll_interval = Duration::from_nanos(period_ns / ticks);
    }

    pub fn start(self, telemetry: Arc<Telemetry>) -> SamplerWorker {
        SamplerWorker::spawn("mangohud-radeon", move |stop| self.run(&telemetry, stop))
    }

    fn run(mut self, telemetry: &Telemetry, stop: &AtomicBool) {
        let mut window = BusyWindow::default();
        while !stop.load(Ordering::Relaxed) {
            let pending = self.period_ns.load(Ordering::Relaxed);
            if pending != 0 {
                self.apply_period(pending as u64);
                self.period_ns.store(0, Ordering::Relaxed);
            }

            let fd = self.file.as_raw_fd();
            let mut reg = GRBM_STATUS as u64;
            if radeon_info(fd, RADEON_INFO_READ_REG, &mut reg).is_err() {
                // Transient read error: drop the window and retry next period.
                window.reduce();
                if !interruptible_sleep(
                    self.poll_interval * self.ticks_per_window,
                    stop,
                ) {
                    return;
                }
                continue;
            }
            window.record(reg as u32);

            if window.ticks() >= self.ticks_per_window {
                let load = window.reduce();
                let mut snapshot = GpuSnapshot {
                    load_percent: load,
                    ..Default::default()
                };
                self.fill_static(fd, &mut snapshot);
                *telemetry.gpu.lock() = snapshot;
            }

            if !interruptible_sleep(self.poll_interval, stop) {
                return;
            }
        }
    }

    fn fill_static(&self, fd: i32, snapshot: &mut GpuSnapshot) {
        let mut value = 0u64;
        if radeon_info(fd, RADEON_INFO_VRAM_USAGE, &mut value).is_ok() {
            snapshot.sys_vram_used_gib = value as f32 / BYTES_PER_GIB;
        }
        if radeon_info(fd, RADEON_INFO_CURRENT_GPU_SCLK, &mut value).is_ok() {
            snapshot.core_clock_mhz = value as u32;
        }
        if radeon_info(fd, RADEON_INFO_CURRENT_GPU_MCLK, &mut value).is_ok() {
            snapshot.memory_clock_mhz = value as u32;
        }
        if radeon_info(fd, RADEON_INFO_CURRENT_GPU_TEMP, &mut value).is_ok() {
            snapshot.core_temp_c = (value as i32) / 1000;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_window_percent() {
        let mut window = BusyWindow::default();
        for i in 0..60 {
            let status = if i < 45 { GRBM_GUI_ACTIVE } else { 0 };
            window.record(status);
        }
        assert_eq!(window.reduce(), 75);
        // Counters reset after a reduction.
        assert_eq!(window.reduce(), 0);
    }

    #[test]
    fn ioctl_number_layout() {
        // dir=RW, type='d', nr=0x67, size=16
        let n = DRM_IOCTL_RADEON_INFO;
        assert_eq!(n & 0xFF, 0x67);
        assert_eq!((n >> 8) & 0xFF, b'd' as u64);
        assert_eq!((n >> 16) & 0x3FFF, 16);
        assert_eq!(n >> 30, 3);
    }
}
