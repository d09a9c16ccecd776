/*! Shared plain-data model for the overlay runtime.
 *
 * Everything in here is produced on one thread and read on others, so the
 * types are kept `Clone + Default` value records with no interior mutability.
 * Publication rules live with the producers (`mango-metrics`, `mango-core`).
 */

use std::fmt;

/// Corner of the swapchain the HUD window is anchored to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Position {
    #[default]
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl Position {
    /// Cycling order used by the position keybind.
    pub fn next(self) -> Self {
        match self {
            Self::TopLeft => Self::TopRight,
            Self::TopRight => Self::BottomLeft,
            Self::BottomLeft => Self::BottomRight,
            Self::BottomRight => Self::TopLeft,
        }
    }
}

/// Where the frame limiter parks the CPU relative to the present call.
///
/// `Early` sleeps before the present, trading a little throughput for input
/// latency; `Late` sleeps after the present and lets the CPU idle while the
/// GPU drains, which is the power-friendly default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FpsLimitMethod {
    Early,
    #[default]
    Late,
}

/// Translation layer (or lack thereof) the application renders through,
/// derived from `VkApplicationInfo::pEngineName` or the GL vendor strings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EngineType {
    #[default]
    Unknown,
    OpenGl,
    Vulkan,
    Dxvk,
    Vkd3d,
    Damavand,
    Zink,
    WineD3d,
    Feral3d,
    Togl,
}

impl EngineType {
    pub fn from_engine_name(name: &str) -> Self {
        match name {
            "DXVK" => Self::Dxvk,
            "vkd3d" => Self::Vkd3d,
            "mesa zink" => Self::Zink,
            "Damavand" => Self::Damavand,
            "Feral3D" => Self::Feral3d,
            _ => Self::Vulkan,
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::OpenGl => "OpenGL",
            Self::Vulkan => "Vulkan",
            Self::Dxvk => "DXVK",
            Self::Vkd3d => "vkd3d",
            Self::Damavand => "Damavand",
            Self::Zink => "Zink",
            Self::WineD3d => "WineD3D",
            Self::Feral3d => "Feral3D",
            Self::Togl => "ToGL",
        };
        f.write_str(name)
    }
}

bitflags::bitflags! {
    /// Reduced view of the hardware throttling causes reported by the GPU.
    ///
    /// AMDGPU exposes these as byte lanes of `indep_throttle_status`; NVML as
    /// clock-event reason bits. Both are folded into this set so the HUD and
    /// the exporter only deal with one shape.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ThrottleStatus: u32 {
        const POWER = 1 << 0;
        const CURRENT = 1 << 1;
        const TEMP = 1 << 2;
        const OTHER = 1 << 3;
    }
}

/// Vendor-agnostic GPU telemetry record.
///
/// Single writer (the active sampler worker), many readers. A reader always
/// sees a whole record: the producer swaps it in one store under the
/// snapshot lock.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GpuSnapshot {
    pub load_percent: u32,
    pub core_temp_c: i32,
    pub memory_temp_c: i32,
    pub junction_temp_c: i32,
    /// RPM on sysfs fan inputs, percent on NVML; display decides per vendor.
    pub fan_speed: u32,
    pub core_clock_mhz: u32,
    pub memory_clock_mhz: u32,
    pub power_w: f32,
    pub power_limit_w: f32,
    pub voltage_mv: u32,
    pub sys_vram_used_gib: f32,
    pub proc_vram_used_gib: f32,
    pub memory_total_gib: f32,
    pub gtt_used_gib: f32,
    /// APU-only: CPU package power folded into the same metrics blob.
    pub apu_cpu_power_w: f32,
    pub apu_cpu_temp_c: i32,
    pub throttling: ThrottleStatus,
}

/// Per-logical-CPU jiffy counters from one `/proc/stat` read, plus the
/// derived per-window values.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuCoreSnapshot {
    pub total: u64,
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
    pub guestnice: u64,
    pub percent: f32,
    pub mhz: u32,
}

#[derive(Clone, Debug, Default)]
pub struct CpuSnapshot {
    pub total_percent: f32,
    pub temp_c: i32,
    pub power_w: f32,
    pub cores: Vec<CpuCoreSnapshot>,
}

/// `/proc/meminfo` reduction, GiB units.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemorySnapshot {
    pub ram_used_gib: f32,
    pub ram_total_gib: f32,
    pub swap_used_gib: f32,
}

/// `/proc/self/io` deltas over the sampling window, MiB/s.
#[derive(Clone, Copy, Debug, Default)]
pub struct IoSnapshot {
    pub read_mib_s: f32,
    pub write_mib_s: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_cycles_through_all_corners() {
        let mut p = Position::TopLeft;
        for _ in 0..4 {
            p = p.next();
        }
        assert_eq!(p, Position::TopLeft);
    }

    #[test]
    fn engine_name_mapping() {
        assert_eq!(EngineType::from_engine_name("DXVK"), EngineType::Dxvk);
        assert_eq!(EngineType::from_engine_name("vkd3d"), EngineType::Vkd3d);
        assert_eq!(EngineType::from_engine_name("mesa zink"), EngineType::Zink);
        assert_eq!(
            EngineType::from_engine_name("Unreal Engine"),
            EngineType::Vulkan
        );
    }
}
