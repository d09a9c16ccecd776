//! NVIDIA sampler backed by NVML, loaded at runtime with `libloading`.
//!
//! The library is resolved lazily on first use; the device is looked up by
//! the PCI bus id we learned from the Vulkan physical device, falling back
//! to index 0 when that lookup fails.

#![allow(non_camel_case_types)]

use std::ffi::CString;
use std::os::raw::{c_char, c_uint, c_ulonglong, c_void};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use types::{GpuSnapshot, ThrottleStatus};

use crate::{
    interruptible_sleep, MetricsError, SamplerWorker, Telemetry, METRICS_UPDATE_PERIOD_MS,
};

const BYTES_PER_GIB: f32 = 1024.0 * 1024.0 * 1024.0;

type nvmlReturn_t = i32;
type nvmlDevice_t = *mut c_void;

const NVML_SUCCESS: nvmlReturn_t = 0;
const NVML_TEMPERATURE_GPU: c_uint = 0;
const NVML_CLOCK_GRAPHICS: c_uint = 0;
const NVML_CLOCK_MEM: c_uint = 2;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct nvmlUtilization_t {
    gpu: c_uint,
    memory: c_uint,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct nvmlMemory_t {
    total: c_ulonglong,
    free: c_ulonglong,
    used: c_ulonglong,
}

/// Clock-event reason bits, per `nvml.h`.
mod reasons {
    /// SwThermalSlowdown | HwThermalSlowdown.
    pub const TEMP: u64 = 0x60;
    /// SwPowerCap | HwPowerBrakeSlowdown | PowerBrake.
    pub const POWER: u64 = 0x8C;
    /// ApplicationsClocksSetting | SyncBoost | DisplayClockSetting.
    pub const OTHER: u64 = 0x112;
}

pub fn throttle_flags(reasons_mask: u64) -> ThrottleStatus {
    let mut flags = ThrottleStatus::empty();
    if reasons_mask & reasons::TEMP != 0 {
        flags |= ThrottleStatus::TEMP;
    }
    if reasons_mask & reasons::POWER != 0 {
        flags |= ThrottleStatus::POWER;
    }
    if reasons_mask & reasons::OTHER != 0 {
        flags |= ThrottleStatus::OTHER;
    }
    flags
}

macro_rules! nvml_fns {
    ($( $field:ident : fn($($arg:ty),*) -> nvmlReturn_t = $sym:literal; )*) => {
        struct NvmlFns {
            $( $field: unsafe extern "C" fn($($arg),*) -> nvmlReturn_t, )*
        }

        impl NvmlFns {
            /// The returned fn pointers stay valid for as long as the
            /// accompanying [`libloading::Library`] is kept alive.
            unsafe fn load(lib: &libloading::Library) -> Result<Self, MetricsError> {
                Ok(Self {
                    $( $field: *lib
                        .get::<unsafe extern "C" fn($($arg),*) -> nvmlReturn_t>($sym)
                        .map_err(|e| MetricsError::LibraryUnavailable(e.to_string()))?, )*
                })
            }
        }
    };
}

nvml_fns! {
    init: fn() -> nvmlReturn_t = b"nvmlInit_v2\0";
    shutdown: fn() -> nvmlReturn_t = b"nvmlShutdown\0";
    device_get_handle_by_pci_bus_id:
        fn(*const c_char, *mut nvmlDevice_t) -> nvmlReturn_t = b"nvmlDeviceGetHandleByPciBusId_v2\0";
    device_get_handle_by_index:
        fn(c_uint, *mut nvmlDevice_t) -> nvmlReturn_t = b"nvmlDeviceGetHandleByIndex_v2\0";
    device_get_utilization_rates:
        fn(nvmlDevice_t, *mut nvmlUtilization_t) -> nvmlReturn_t = b"nvmlDeviceGetUtilizationRates\0";
    device_get_temperature:
        fn(nvmlDevice_t, c_uint, *mut c_uint) -> nvmlReturn_t = b"nvmlDeviceGetTemperature\0";
    device_get_memory_info:
        fn(nvmlDevice_t, *mut nvmlMemory_t) -> nvmlReturn_t = b"nvmlDeviceGetMemoryInfo\0";
    device_get_clock_info:
        fn(nvmlDevice_t, c_uint, *mut c_uint) -> nvmlReturn_t = b"nvmlDeviceGetClockInfo\0";
    device_get_power_usage:
        fn(nvmlDevice_t, *mut c_uint) -> nvmlReturn_t = b"nvmlDeviceGetPowerUsage\0";
    device_get_power_limit:
        fn(nvmlDevice_t, *mut c_uint) -> nvmlReturn_t = b"nvmlDeviceGetPowerManagementLimit\0";
    device_get_fan_speed:
        fn(nvmlDevice_t, *mut c_uint) -> nvmlReturn_t = b"nvmlDeviceGetFanSpeed\0";
    device_get_throttle_reasons:
        fn(nvmlDevice_t, *mut c_ulonglong) -> nvmlReturn_t = b"nvmlDeviceGetCurrentClocksThrottleReasons\0";
}

pub struct NvmlSampler {
    // Field order matters: fns must drop before the library they point into.
    fns: NvmlFns,
    _lib: libloading::Library,
    device: nvmlDevice_t,
}

// The device handle is an opaque token NVML accepts from any thread.
unsafe impl Send for NvmlSampler {}

impl NvmlSampler {
    /// Load `libnvidia-ml.so.1`, initialize it and resolve the device.
    pub fn new(pci_bus_id: Option<&str>) -> Result<Self, MetricsError> {
        let lib = unsafe { libloading::Library::new("libnvidia-ml.so.1") }
            .map_err(|e| MetricsError::LibraryUnavailable(e.to_string()))?;
        let fns = unsafe { NvmlFns::load(&lib)? };

        if unsafe { (fns.init)() } != NVML_SUCCESS {
            return Err(MetricsError::DeviceUnavailable(
                "nvmlInit_v2 failed; nvidia module not loaded?".into(),
            ));
        }

        let mut device: nvmlDevice_t = std::ptr::null_mut();
        let mut resolved = false;
        if let Some(bus_id) = pci_bus_id {
            if let Ok(c_bus_id) = CString::new(bus_id) {
                resolved = unsafe {
                    (fns.device_get_handle_by_pci_bus_id)(c_bus_id.as_ptr(), &mut device)
                } == NVML_SUCCESS;
                if !resolved {
                    log::warn!("nvml: device lookup by pci bus id '{bus_id}' failed, using index 0");
                }
            }
        }
        if !resolved && unsafe { (fns.device_get_handle_by_index)(0, &mut device) } != NVML_SUCCESS
        {
            unsafe { (fns.shutdown)() };
            return Err(MetricsError::DeviceUnavailable(
                "nvml device handle lookup failed".into(),
            ));
        }

        Ok(Self {
            fns,
            _lib: lib,
            device,
        })
    }

    fn sample(&self) -> GpuSnapshot {
        let fns = &self.fns;
        let dev = self.device;
        let mut snapshot = GpuSnapshot::default();

        unsafe {
            let mut util = nvmlUtilization_t::default();
            if (fns.device_get_utilization_rates)(dev, &mut util) == NVML_SUCCESS {
                snapshot.load_percent = util.gpu;
            }

            let mut temp: c_uint = 0;
            if (fns.device_get_temperature)(dev, NVML_TEMPERATURE_GPU, &mut temp) == NVML_SUCCESS {
                snapshot.core_temp_c = temp as i32;
            }

            let mut memory = nvmlMemory_t::default();
            if (fns.device_get_memory_info)(dev, &mut memory) == NVML_SUCCESS {
                snapshot.sys_vram_used_gib = memory.used as f32 / BYTES_PER_GIB;
                snapshot.memory_total_gib = memory.total as f32 / BYTES_PER_GIB;
            }

            let mut clock: c_uint = 0;
            if (fns.device_get_clock_info)(dev, NVML_CLOCK_GRAPHICS, &mut clock) == NVML_SUCCESS {
                snapshot.core_clock_mhz = clock;
            }
            if (fns.device_get_clock_info)(dev, NVML_CLOCK_MEM, &mut clock) == NVML_SUCCESS {
                snapshot.memory_clock_mhz = clock;
            }

            let mut milliwatts: c_uint = 0;
            if (fns.device_get_power_usage)(dev, &mut milliwatts) == NVML_SUCCESS {
                snapshot.power_w = milliwatts as f32 / 1000.0;
            }
            if (fns.device_get_power_limit)(dev, &mut milliwatts) == NVML_SUCCESS {
                snapshot.power_limit_w = milliwatts as f32 / 1000.0;
            }

            let mut fan: c_uint = 0;
            if (fns.device_get_fan_speed)(dev, &mut fan) == NVML_SUCCESS {
                snapshot.fan_speed = fan;
            }

            let mut reasons_mask: c_ulonglong = 0;
            if (fns.device_get_throttle_reasons)(dev, &mut reasons_mask) == NVML_SUCCESS {
                snapshot.throttling = throttle_flags(reasons_mask);
            }
        }

        snapshot
    }

    pub fn start(self, telemetry: Arc<Telemetry>) -> SamplerWorker {
        SamplerWorker::spawn("mangohud-nvml", move |stop| self.run(&telemetry, stop))
    }

    fn run(self, telemetry: &Telemetry, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            let snapshot = self.sample();
            *telemetry.gpu.lock() = snapshot;
            if !interruptible_sleep(Duration::from_millis(METRICS_UPDATE_PERIOD_MS), stop) {
                break;
            }
        }
        unsafe { (self.fns.shutdown)() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_reason_mapping() {
        assert_eq!(throttle_flags(0), ThrottleStatus::empty());
        assert_eq!(throttle_flags(0x20), ThrottleStatus::TEMP);
        assert_eq!(throttle_flags(0x40), ThrottleStatus::TEMP);
        assert_eq!(throttle_flags(0x04), ThrottleStatus::POWER);
        assert_eq!(throttle_flags(0x80), ThrottleStatus::POWER);
        assert_eq!(throttle_flags(0x100), ThrottleStatus::OTHER);
        assert_eq!(throttle_flags(0x02), ThrottleStatus::OTHER);
        assert_eq!(
            throttle_flags(0x60 | 0x8C | 0x112),
            ThrottleStatus::TEMP | ThrottleStatus::POWER | ThrottleStatus::OTHER
        );
        // GpuIdle (bit 0) maps to nothing.
        assert_eq!(throttle_flags(0x1), ThrottleStatus::empty());
    }
}
