//! AMDGPU sampler.
//!
//! Primary source is the `gpu_metrics` binary blob the kernel exposes under
//! the card's sysfs directory. The blob starts with a small header naming the
//! table layout; discrete parts report format revision 1, APUs revision 2.
//! When `gpu_metrics` is absent or unsupported we fall back to the plain
//! sysfs files (`gpu_busy_percent`, hwmon temps, VRAM counters).

use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use types::{GpuSnapshot, ThrottleStatus};

use crate::{
    interruptible_sleep, MetricsError, SamplerWorker, Telemetry, METRICS_POLLING_PERIOD_MS,
    METRICS_SAMPLE_COUNT,
};

const BYTES_PER_GIB: f32 = 1024.0 * 1024.0 * 1024.0;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct MetricsTableHeader {
    pub structure_size: u16,
    pub format_revision: u8,
    pub content_revision: u8,
}

/// Discrete GPU metrics table (v1.x content, laid out as v1_3).
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuMetricsV1_3 {
    pub header: MetricsTableHeader,

    pub temperature_edge: u16,
    pub temperature_hotspot: u16,
    pub temperature_mem: u16,
    pub temperature_vrgfx: u16,
    pub temperature_vrsoc: u16,
    pub temperature_vrmem: u16,

    pub average_gfx_activity: u16,
    pub average_umc_activity: u16,
    pub average_mm_activity: u16,

    pub average_socket_power: u16,
    pub energy_accumulator: u64,

    pub system_clock_counter: u64,

    pub average_gfxclk_frequency: u16,
    pub average_socclk_frequency: u16,
    pub average_uclk_frequency: u16,
    pub average_vclk0_frequency: u16,
    pub average_dclk0_frequency: u16,
    pub average_vclk1_frequency: u16,
    pub average_dclk1_frequency: u16,

    pub current_gfxclk: u16,
    pub current_socclk: u16,
    pub current_uclk: u16,
    pub current_vclk0: u16,
    pub current_dclk0: u16,
    pub current_vclk1: u16,
    pub current_dclk1: u16,

    pub throttle_status: u32,

    pub current_fan_speed: u16,

    pub pcie_link_width: u16,
    pub pcie_link_speed: u16,

    pub padding: u16,

    pub gfx_activity_acc: u32,
    pub mem_activity_acc: u32,

    pub temperature_hbm: [u16; 4],

    pub firmware_timestamp: u64,

    pub voltage_soc: u16,
    pub voltage_gfx: u16,
    pub voltage_mem: u16,

    pub padding1: u16,

    pub indep_throttle_status: u64,
}

/// APU metrics table (v2.x content, laid out as v2_2).
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuMetricsV2_2 {
    pub header: MetricsTableHeader,

    pub temperature_gfx: u16,
    pub temperature_soc: u16,
    pub temperature_core: [u16; 8],
    pub temperature_l3: [u16; 2],

    pub average_gfx_activity: u16,
    pub average_mm_activity: u16,

    pub system_clock_counter: u64,

    pub average_socket_power: u16,
    pub average_cpu_power: u16,
    pub average_soc_power: u16,
    pub average_gfx_power: u16,
    pub average_core_power: [u16; 8],

    pub average_gfxclk_frequency: u16,
    pub average_socclk_frequency: u16,
    pub average_uclk_frequency: u16,
    pub average_fclk_frequency: u16,
    pub average_vclk_frequency: u16,
    pub average_dclk_frequency: u16,

    pub current_gfxclk: u16,
    pub current_socclk: u16,
    pub current_uclk: u16,
    pub current_fclk: u16,
    pub current_vclk: u16,
    pub current_dclk: u16,
    pub current_coreclk: [u16; 8],
    pub current_l3clk: [u16; 2],

    pub throttle_status: u32,

    pub fan_pwm: u16,

    pub padding: [u16; 3],

    pub indep_throttle_status: u64,
}

pub const METRICS_BUF_LEN: usize = mem::size_of::<GpuMetricsV2_2>();

/// Decode the ASIC-independent throttle bitmap. The byte lanes are fixed:
/// byte 0 power, byte 2 current, bytes 4-5 thermal, byte 7 other.
pub fn throttle_flags(indep_throttle_status: u64) -> ThrottleStatus {
    let mut flags = ThrottleStatus::empty();
    if (indep_throttle_status) & 0xFF != 0 {
        flags |= ThrottleStatus::POWER;
    }
    if (indep_throttle_status >> 16) & 0xFF != 0 {
        flags |= ThrottleStatus::CURRENT;
    }
    if (indep_throttle_status >> 32) & 0xFFFF != 0 {
        flags |= ThrottleStatus::TEMP;
    }
    if (indep_throttle_status >> 56) & 0xFF != 0 {
        flags |= ThrottleStatus::OTHER;
    }
    flags
}

/// Validate a `gpu_metrics` header.
///
/// v1_0 (80 bytes) is not naturally aligned and is rejected outright; the
/// known sizes are only accepted for format revisions 1 and 2.
pub fn verify_header(header: &MetricsTableHeader) -> Result<(), MetricsError> {
    let supported_size = matches!(
        header.structure_size as usize,
        96 | 104 // v1_1, v1_2
    ) || header.structure_size as usize == mem::size_of::<GpuMetricsV1_3>()
        || header.structure_size as usize == mem::size_of::<GpuMetricsV2_2>();

    if supported_size && matches!(header.format_revision, 1 | 2) {
        return Ok(());
    }
    Err(MetricsError::UnsupportedMetricsVersion {
        format: header.format_revision,
        content: header.content_revision,
        size: header.structure_size,
    })
}

/// Read and validate the metrics header of `path`.
pub fn verify_metrics(path: &Path) -> Result<(), MetricsError> {
    let buf = fs::read(path).map_err(|e| MetricsError::io(path.display().to_string(), e))?;
    if buf.len() < mem::size_of::<MetricsTableHeader>() {
        return Err(MetricsError::Parse {
            path: path.display().to_string(),
            reason: "truncated metrics header".into(),
        });
    }
    let header: MetricsTableHeader =
        bytemuck::pod_read_unaligned(&buf[..mem::size_of::<MetricsTableHeader>()]);
    verify_header(&header)
}

/// One raw poll of the metrics blob.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct InstantSample {
    pub load_percent: u16,
    pub power_w: f32,
    pub cpu_power_w: f32,
    pub gfxclk_mhz: u16,
    pub uclk_mhz: u16,
    pub gpu_temp_c: u16,
    pub apu_cpu_temp_c: u16,
    pub throttling: ThrottleStatus,
}

/// Decode one sample out of a raw blob.
///
/// `centipercent` is a sticky flag: some firmware reports activity in
/// hundredths of a percent, detected the first time a load above 100 shows
/// up and applied to every later sample.
pub fn read_instant(buf: &[u8], centipercent: &mut bool) -> Result<InstantSample, MetricsError> {
    if buf.len() < mem::size_of::<MetricsTableHeader>() {
        return Err(MetricsError::Parse {
            path: "gpu_metrics".into(),
            reason: "truncated blob".into(),
        });
    }
    let header: MetricsTableHeader =
        bytemuck::pod_read_unaligned(&buf[..mem::size_of::<MetricsTableHeader>()]);
    verify_header(&header)?;

    // Shorter table revisions leave the tail fields zeroed.
    let mut padded = [0u8; METRICS_BUF_LEN];
    let len = buf.len().min(METRICS_BUF_LEN);
    padded[..len].copy_from_slice(&buf[..len]);

    let mut sample = InstantSample::default();
    match header.format_revision {
        1 => {
            let m: GpuMetricsV1_3 =
                bytemuck::pod_read_unaligned(&padded[..mem::size_of::<GpuMetricsV1_3>()]);
            sample.load_percent = m.average_gfx_activity;
            sample.power_w = m.average_socket_power as f32;
            sample.gfxclk_mhz = m.current_gfxclk;
            sample.uclk_mhz = m.current_uclk;
            sample.gpu_temp_c = m.temperature_edge;
            sample.throttling = throttle_flags(m.indep_throttle_status);
        }
        2 => {
            let m: GpuMetricsV2_2 = bytemuck::pod_read_unaligned(&padded);
            sample.load_percent = m.average_gfx_activity;
            sample.power_w = m.average_gfx_power as f32 / 1000.0;
            sample.cpu_power_w = m.average_cpu_power as f32 / 1000.0;
            sample.gfxclk_mhz = m.current_gfxclk;
            sample.uclk_mhz = m.current_uclk;
            sample.gpu_temp_c = m.temperature_gfx / 100;
            sample.apu_cpu_temp_c =
                m.temperature_core.iter().copied().max().unwrap_or(0) / 100;
            sample.throttling = throttle_flags(m.indep_throttle_status);
        }
        _ => unreachable!("verify_header rejects other revisions"),
    }

    if *centipercent || sample.load_percent > 100 {
        *centipercent = true;
        sample.load_percent /= 100;
    }
    Ok(sample)
}

/// Rolling window of raw samples, reduced once per update period.
#[derive(Default)]
pub struct SampleWindow {
    samples: Vec<InstantSample>,
}

impl SampleWindow {
    pub fn push(&mut self, sample: InstantSample) {
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean for the numeric fields, OR for the throttle flags.
    pub fn reduce(&mut self) -> InstantSample {
        if self.samples.is_empty() {
            return InstantSample::default();
        }
        let n = self.samples.len();
        let mut out = InstantSample::default();
        let mut load = 0u32;
        let mut gfxclk = 0u32;
        let mut uclk = 0u32;
        let mut gpu_temp = 0u32;
        let mut cpu_temp = 0u32;
        for s in &self.samples {
            load += s.load_percent as u32;
            gfxclk += s.gfxclk_mhz as u32;
            uclk += s.uclk_mhz as u32;
            gpu_temp += s.gpu_temp_c as u32;
            cpu_temp += s.apu_cpu_temp_c as u32;
            out.power_w += s.power_w;
            out.cpu_power_w += s.cpu_power_w;
            out.throttling |= s.throttling;
        }
        out.load_percent = (load / n as u32) as u16;
        out.gfxclk_mhz = (gfxclk / n as u32) as u16;
        out.uclk_mhz = (uclk / n as u32) as u16;
        out.gpu_temp_c = (gpu_temp / n as u32) as u16;
        out.apu_cpu_temp_c = (cpu_temp / n as u32) as u16;
        out.power_w /= n as f32;
        out.cpu_power_w /= n as f32;
        self.samples.clear();
        out
    }
}

/// sysfs companions of the metrics blob; each one is optional.
#[derive(Default)]
pub struct SysfsFiles {
    pub busy_percent: Option<PathBuf>,
    pub temp_input: Option<PathBuf>,
    pub vram_used: Option<PathBuf>,
    pub vram_total: Option<PathBuf>,
    pub gtt_used: Option<PathBuf>,
    pub power_cap: Option<PathBuf>,
    pub fan_input: Option<PathBuf>,
}

/// Returns `Some(path)` if `path` exists on disk, else `None`.
fn existing(path: PathBuf) -> Option<PathBuf> {
    path.exists().then_some(path)
}

impl SysfsFiles {
    /// Locate the standard files under `<device>/` and `<device>/hwmon/hwmonN/`.
    pub fn discover(device_dir: &Path) -> Self {
        let mut files = Self {
            busy_percent: existing(device_dir.join("gpu_busy_percent")),
            vram_used: existing(device_dir.join("mem_info_vram_used")),
            vram_total: existing(device_dir.join("mem_info_vram_total")),
            gtt_used: existing(device_dir.join("mem_info_gtt_used")),
            ..Default::default()
        };
        if let Ok(entries) = fs::read_dir(device_dir.join("hwmon")) {
            for entry in entries.flatten() {
                let dir = entry.path();
                files.temp_input = files.temp_input.or_else(|| existing(dir.join("temp1_input")));
                files.power_cap = files.power_cap.or_else(|| existing(dir.join("power1_cap")));
                files.fan_input = files.fan_input.or_else(|| existing(dir.join("fan1_input")));
            }
        }
        files
    }

    fn read_u64(path: &Option<PathBuf>) -> Option<u64> {
        let path = path.as_ref()?;
        fs::read_to_string(path)
            .ok()?
            .trim()
            .parse::<u64>()
            .ok()
    }

    /// Fold the sysfs values into a snapshot built from the metrics window.
    pub fn apply(&self, snapshot: &mut GpuSnapshot) {
        if let Some(temp) = Self::read_u64(&self.temp_input) {
            snapshot.core_temp_c = (temp / 1000) as i32;
        }
        if let Some(used) = Self::read_u64(&self.vram_used) {
            snapshot.sys_vram_used_gib = used as f32 / BYTES_PER_GIB;
        }
        if let Some(total) = Self::read_u64(&self.vram_total) {
            snapshot.memory_total_gib = total as f32 / BYTES_PER_GIB;
        }
        if let Some(gtt) = Self::read_u64(&self.gtt_used) {
            snapshot.gtt_used_gib = gtt as f32 / BYTES_PER_GIB;
        }
        if let Some(cap) = Self::read_u64(&self.power_cap) {
            snapshot.power_limit_w = cap as f32 / 1_000_000.0;
        }
        if let Some(fan) = Self::read_u64(&self.fan_input) {
            snapshot.fan_speed = fan as u32;
        }
        // No metrics blob at all: gpu_busy_percent is the load source.
        if let Some(busy) = Self::read_u64(&self.busy_percent) {
            if snapshot.load_percent == 0 {
                snapshot.load_percent = busy as u32;
            }
        }
    }
}

pub struct AmdgpuSampler {
    metrics_path: Option<PathBuf>,
    sysfs: SysfsFiles,
}

impl AmdgpuSampler {
    /// `device_dir` is `/sys/class/drm/renderD<minor>/device`.
    pub fn new(device_dir: &Path) -> Result<Self, MetricsError> {
        let metrics_path = device_dir.join("gpu_metrics");
        let metrics_path = match verify_metrics(&metrics_path) {
            Ok(()) => Some(metrics_path),
            Err(err) => {
                log::info!("amdgpu: no usable gpu_metrics table: {err}");
                None
            }
        };
        let sysfs = SysfsFiles::discover(device_dir);
        if metrics_path.is_none() && sysfs.busy_percent.is_none() {
            return Err(MetricsError::DeviceUnavailable(format!(
                "{}: neither gpu_metrics nor gpu_busy_percent is readable",
                device_dir.display()
            )));
        }
        Ok(Self {
            metrics_path,
            sysfs,
        })
    }

    /// Spawn the polling worker publishing into `telemetry.gpu`.
    pub fn start(self, telemetry: Arc<Telemetry>) -> SamplerWorker {
        SamplerWorker::spawn("mangohud-amdgpu", move |stop| self.run(&telemetry, stop))
    }

    fn run(self, telemetry: &Telemetry, stop: &AtomicBool) {
        let mut window = SampleWindow::default();
        let mut centipercent = false;
        while !stop.load(Ordering::Relaxed) {
            for _ in 0..METRICS_SAMPLE_COUNT {
                if stop.load(Ordering::Relaxed) {
                    return;
                }
                if let Some(path) = &self.metrics_path {
                    match fs::read(path) {
                        Ok(buf) => match read_instant(&buf, &mut centipercent) {
                            Ok(sample) => window.push(sample),
                            Err(err) => log::debug!("amdgpu: bad metrics sample: {err}"),
                        },
                        Err(err) => log::debug!("amdgpu: metrics read failed: {err}"),
                    }
                }
                if !interruptible_sleep(Duration::from_millis(METRICS_POLLING_PERIOD_MS), stop) {
                    return;
                }
            }

            let reduced = window.reduce();
            let mut snapshot = GpuSnapshot {
                load_percent: reduced.load_percent as u32,
                core_temp_c: reduced.gpu_temp_c as i32,
                core_clock_mhz: reduced.gfxclk_mhz as u32,
                memory_clock_mhz: reduced.uclk_mhz as u32,
                power_w: reduced.power_w,
                apu_cpu_power_w: reduced.cpu_power_w,
                apu_cpu_temp_c: reduced.apu_cpu_temp_c as i32,
                throttling: reduced.throttling,
                ..Default::default()
            };
            self.sysfs.apply(&mut snapshot);
            *telemetry.gpu.lock() = snapshot;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v1_3_blob(
        activity: u16,
        power: u16,
        gfxclk: u16,
        uclk: u16,
        edge: u16,
        throttle: u64,
    ) -> Vec<u8> {
        let m = GpuMetricsV1_3 {
            header: MetricsTableHeader {
                structure_size: mem::size_of::<GpuMetricsV1_3>() as u16,
                format_revision: 1,
                content_revision: 3,
            },
            average_gfx_activity: activity,
            average_socket_power: power,
            current_gfxclk: gfxclk,
            current_uclk: uclk,
            temperature_edge: edge,
            indep_throttle_status: throttle,
            ..Zeroable::zeroed()
        };
        bytemuck::bytes_of(&m).to_vec()
    }

    #[test]
    fn struct_sizes_match_the_kernel_tables() {
        assert_eq!(mem::size_of::<MetricsTableHeader>(), 4);
        assert_eq!(mem::size_of::<GpuMetricsV1_3>(), 120);
        assert_eq!(mem::size_of::<GpuMetricsV2_2>(), 128);
    }

    #[test]
    fn version_gate() {
        let accept = |size: u16, rev: u8| {
            verify_header(&MetricsTableHeader {
                structure_size: size,
                format_revision: rev,
                content_revision: 0,
            })
            .is_ok()
        };
        // v1_0 is unaligned and always rejected.
        assert!(!accept(80, 1));
        assert!(accept(96, 1));
        assert!(accept(104, 1));
        assert!(accept(mem::size_of::<GpuMetricsV1_3>() as u16, 1));
        assert!(accept(mem::size_of::<GpuMetricsV2_2>() as u16, 2));
        assert!(accept(96, 2));
        // Unknown format revisions and sizes are rejected.
        assert!(!accept(96, 3));
        assert!(!accept(100, 1));
        assert!(!accept(0, 1));
    }

    #[test]
    fn v1_3_sample_decodes_discrete_fields() {
        let blob = v1_3_blob(6400, 33, 2165, 1000, 36, 0);
        let mut centi = false;
        let sample = read_instant(&blob, &mut centi).unwrap();
        assert_eq!(sample.load_percent, 64);
        assert_eq!(sample.power_w, 33.0);
        assert_eq!(sample.gfxclk_mhz, 2165);
        assert_eq!(sample.uclk_mhz, 1000);
        assert_eq!(sample.gpu_temp_c, 36);
        assert!(sample.throttling.is_empty());
        assert!(centi, "6400 must latch the centipercent detection");
    }

    #[test]
    fn centipercent_flag_is_sticky() {
        let mut centi = false;
        let blob = v1_3_blob(6400, 0, 0, 0, 0, 0);
        read_instant(&blob, &mut centi).unwrap();
        // A later sample that happens to be <= 100 raw must still divide.
        let blob = v1_3_blob(50, 0, 0, 0, 0, 0);
        let sample = read_instant(&blob, &mut centi).unwrap();
        assert_eq!(sample.load_percent, 0);
    }

    #[test]
    fn throttle_byte_lanes() {
        assert_eq!(throttle_flags(0), ThrottleStatus::empty());
        assert_eq!(throttle_flags(0x01), ThrottleStatus::POWER);
        assert_eq!(throttle_flags(0x01 << 16), ThrottleStatus::CURRENT);
        assert_eq!(throttle_flags(0x0100 << 32), ThrottleStatus::TEMP);
        assert_eq!(throttle_flags(0x01 << 56), ThrottleStatus::OTHER);
        assert_eq!(
            throttle_flags(0x0100_0001_0001_0001),
            ThrottleStatus::POWER
                | ThrottleStatus::CURRENT
                | ThrottleStatus::TEMP
                | ThrottleStatus::OTHER
        );
    }

    #[test]
    fn apu_fields_scale() {
        let m = GpuMetricsV2_2 {
            header: MetricsTableHeader {
                structure_size: mem::size_of::<GpuMetricsV2_2>() as u16,
                format_revision: 2,
                content_revision: 2,
            },
            average_gfx_activity: 42,
            average_gfx_power: 15_000,
            average_cpu_power: 9_000,
            current_gfxclk: 1600,
            current_uclk: 800,
            temperature_gfx: 5600,
            temperature_core: [4000, 4200, 3900, 0, 0, 0, 0, 0],
            ..Zeroable::zeroed()
        };
        let mut centi = false;
        let sample = read_instant(bytemuck::bytes_of(&m), &mut centi).unwrap();
        assert_eq!(sample.load_percent, 42);
        assert_eq!(sample.power_w, 15.0);
        assert_eq!(sample.cpu_power_w, 9.0);
        assert_eq!(sample.gpu_temp_c, 56);
        assert_eq!(sample.apu_cpu_temp_c, 42);
    }

    #[test]
    fn window_reduction_mean_and_or() {
        let mut window = SampleWindow::default();
        for i in 0..4u16 {
            window.push(InstantSample {
                load_percent: 10 * (i + 1), // 10, 20, 30, 40
                power_w: i as f32,          // 0..3
                gfxclk_mhz: 1000,
                throttling: if i == 2 {
                    ThrottleStatus::TEMP
                } else {
                    ThrottleStatus::empty()
                },
                ..Default::default()
            });
        }
        let reduced = window.reduce();
        assert_eq!(reduced.load_percent, 25);
        assert_eq!(reduced.power_w, 1.5);
        assert_eq!(reduced.gfxclk_mhz, 1000);
        assert_eq!(reduced.throttling, ThrottleStatus::TEMP);
        assert!(window.is_empty());
    }

    #[test]
    fn short_table_revisions_read_with_zeroed_tail() {
        // v1_1 table: 96 bytes, indep_throttle_status lives past the end.
        let mut blob = v1_3_blob(50, 10, 500, 400, 30, u64::MAX);
        blob.truncate(96);
        blob[0] = 96; // structure_size low byte
        blob[1] = 0;
        let mut centi = false;
        let sample = read_instant(&blob, &mut centi).unwrap();
        assert_eq!(sample.load_percent, 50);
        assert!(sample.throttling.is_empty());
    }
}
