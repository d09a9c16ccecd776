//! GPU discovery: map a DRM render minor to a sysfs device and pick the
//! sampler variant that can actually read it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::{amdgpu, intel, msm, nvml, radeon, MetricsError, SamplerWorker, Telemetry};

pub const VENDOR_AMD: u32 = 0x1002;
pub const VENDOR_INTEL: u32 = 0x8086;
pub const VENDOR_NVIDIA: u32 = 0x10de;
pub const VENDOR_QUALCOMM: u32 = 0x5143;

/// Which telemetry producer serves this device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpuSamplerKind {
    Amdgpu,
    Radeon,
    Nvml,
    Intel,
    Msm,
}

/// What we learned about the render node from sysfs.
#[derive(Clone, Debug)]
pub struct GpuDevice {
    pub vendor_id: u32,
    pub driver: String,
    pub device_dir: PathBuf,
    pub pci_bus_id: Option<String>,
}

impl GpuDevice {
    /// Inspect `/sys/class/drm/renderD<minor>/device`.
    pub fn from_render_minor(minor: u32) -> Option<Self> {
        Self::from_device_dir(PathBuf::from(format!(
            "/sys/class/drm/renderD{minor}/device"
        )))
    }

    pub fn from_device_dir(device_dir: PathBuf) -> Option<Self> {
        let vendor = fs::read_to_string(device_dir.join("vendor")).ok()?;
        let vendor_id = u32::from_str_radix(vendor.trim().trim_start_matches("0x"), 16).ok()?;

        let driver = fs::read_link(device_dir.join("driver"))
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();

        let pci_bus_id = fs::read_to_string(device_dir.join("uevent"))
            .ok()
            .and_then(|uevent| {
                uevent
                    .lines()
                    .find_map(|line| line.strip_prefix("PCI_SLOT_NAME=").map(str::to_owned))
            });

        Some(Self {
            vendor_id,
            driver,
            device_dir,
            pci_bus_id,
        })
    }
}

/// Decide the sampler variant from vendor id and driver name.
pub fn select_kind(vendor_id: u32, driver: &str) -> Option<GpuSamplerKind> {
    match vendor_id {
        VENDOR_AMD => {
            if driver == "radeon" {
                Some(GpuSamplerKind::Radeon)
            } else {
                Some(GpuSamplerKind::Amdgpu)
            }
        }
        VENDOR_NVIDIA => Some(GpuSamplerKind::Nvml),
        VENDOR_INTEL => Some(GpuSamplerKind::Intel),
        VENDOR_QUALCOMM => Some(GpuSamplerKind::Msm),
        _ if driver == "msm" => Some(GpuSamplerKind::Msm),
        _ => None,
    }
}

/// The running vendor sampler. Only one exists per process.
pub struct ActiveSampler {
    pub kind: GpuSamplerKind,
    pub worker: SamplerWorker,
    /// Flipped by samplers that lose their backend mid-session
    /// (`intel_gpu_top` exiting); readers should stop showing GPU stats.
    pub disabled: Arc<AtomicBool>,
}

impl ActiveSampler {
    pub fn stop(self) {
        self.worker.stop();
    }
}

/// Start the sampler matching `device`, publishing into `telemetry`.
pub fn start_sampler(
    device: &GpuDevice,
    telemetry: Arc<Telemetry>,
) -> Result<ActiveSampler, MetricsError> {
    let kind = select_kind(device.vendor_id, &device.driver).ok_or_else(|| {
        MetricsError::DeviceUnavailable(format!(
            "no sampler for vendor {:#06x} driver '{}'",
            device.vendor_id, device.driver
        ))
    })?;
    let disabled = Arc::new(AtomicBool::new(false));

    let worker = match kind {
        GpuSamplerKind::Amdgpu => amdgpu::AmdgpuSampler::new(&device.device_dir)?.start(telemetry),
        GpuSamplerKind::Radeon => {
            let card = card_node_for(&device.device_dir).ok_or_else(|| {
                MetricsError::DeviceUnavailable("no card node for radeon device".into())
            })?;
            radeon::RadeonSampler::open(&card)?.start(telemetry)
        }
        GpuSamplerKind::Nvml => {
            nvml::NvmlSampler::new(device.pci_bus_id.as_deref())?.start(telemetry)
        }
        GpuSamplerKind::Intel => {
            let runtime = intel::steam_runtime_probe();
            match runtime {
                None => {
                    return Err(MetricsError::DeviceUnavailable(
                        "inside a container without --alongside-steam support".into(),
                    ))
                }
                Some(through_runtime) => {
                    let (worker, child_disabled) =
                        intel::IntelSampler::spawn(through_runtime)?.start(telemetry);
                    return Ok(ActiveSampler {
                        kind,
                        worker,
                        disabled: child_disabled,
                    });
                }
            }
        }
        GpuSamplerKind::Msm => {
            let sampler = msm::MsmSampler::new();
            if !sampler.has_device() {
                return Err(MetricsError::DeviceUnavailable(
                    "no msm fdinfo handles".into(),
                ));
            }
            sampler.start(telemetry)
        }
    };

    Ok(ActiveSampler {
        kind,
        worker,
        disabled,
    })
}

/// `/sys/class/drm/renderD<minor>/device` also owns the primary node.
fn card_node_for(device_dir: &Path) -> Option<PathBuf> {
    let drm_dir = device_dir.join("drm");
    for entry in fs::read_dir(drm_dir).ok()?.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(index) = name.strip_prefix("card") {
            return Some(PathBuf::from(format!("/dev/dri/card{index}")));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_to_sampler_mapping() {
        assert_eq!(
            select_kind(VENDOR_AMD, "amdgpu"),
            Some(GpuSamplerKind::Amdgpu)
        );
        assert_eq!(
            select_kind(VENDOR_AMD, "radeon"),
            Some(GpuSamplerKind::Radeon)
        );
        assert_eq!(select_kind(VENDOR_NVIDIA, ""), Some(GpuSamplerKind::Nvml));
        assert_eq!(select_kind(VENDOR_INTEL, "i915"), Some(GpuSamplerKind::Intel));
        assert_eq!(select_kind(VENDOR_QUALCOMM, "msm"), Some(GpuSamplerKind::Msm));
        assert_eq!(select_kind(0x1234, "msm"), Some(GpuSamplerKind::Msm));
        assert_eq!(select_kind(0x1234, "nouveau"), None);
    }

    #[test]
    fn device_dir_probe() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vendor"), "0x1002\n").unwrap();
        std::fs::write(
            dir.path().join("uevent"),
            "DRIVER=amdgpu\nPCI_SLOT_NAME=0000:0b:00.0\n",
        )
        .unwrap();
        let device = GpuDevice::from_device_dir(dir.path().to_path_buf()).unwrap();
        assert_eq!(device.vendor_id, VENDOR_AMD);
        assert_eq!(device.pci_bus_id.as_deref(), Some("0000:0b:00.0"));
    }
}
