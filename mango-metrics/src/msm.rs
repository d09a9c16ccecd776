//! Qualcomm/MSM sampler.
//!
//! The msm kernel driver publishes per-fd GPU engine time through
//! `/proc/self/fdinfo`. Load is the ratio of GPU-time delta to wall-clock
//! delta between two polls, summed over every retained fd and clamped to
//! 100.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::{clock, interruptible_sleep, SamplerWorker, Telemetry, METRICS_UPDATE_PERIOD_MS};

/// Parse one fdinfo blob: is this an msm GPU handle, and if so how many
/// engine nanoseconds has it accumulated?
pub fn parse_fdinfo(contents: &str) -> Option<u64> {
    let mut is_msm = false;
    let mut gpu_ns = None;
    for line in contents.lines() {
        if let Some(driver) = line.strip_prefix("drm-driver:") {
            is_msm = driver.trim() == "msm";
        } else if let Some(value) = line.strip_prefix("drm-engine-gpu:") {
            gpu_ns = value.trim().strip_suffix("ns").map(str::trim).and_then(|v| v.parse().ok());
        }
    }
    if is_msm {
        gpu_ns
    } else {
        None
    }
}

/// Compute a load percentage from two (gpu_ns, wall_ns) observations.
pub fn load_percent(gpu_delta_ns: u64, wall_delta_ns: u64) -> u32 {
    if wall_delta_ns == 0 {
        return 0;
    }
    let load = (gpu_delta_ns as f64 / wall_delta_ns as f64 * 100.0) as u32;
    load.min(100)
}

pub struct MsmSampler {
    fdinfo_dir: PathBuf,
    fds: Vec<PathBuf>,
}

impl MsmSampler {
    pub fn new() -> Self {
        Self::with_fdinfo_dir(PathBuf::from("/proc/self/fdinfo"))
    }

    pub fn with_fdinfo_dir(fdinfo_dir: PathBuf) -> Self {
        let mut sampler = Self {
            fdinfo_dir,
            fds: Vec::new(),
        };
        sampler.rescan();
        sampler
    }

    /// Retain the fdinfo entries that belong to the msm GPU.
    pub fn rescan(&mut self) {
        self.fds.clear();
        let Ok(entries) = fs::read_dir(&self.fdinfo_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if let Ok(contents) = fs::read_to_string(&path) {
                if parse_fdinfo(&contents).is_some() {
                    self.fds.push(path);
                }
            }
        }
    }

    pub fn has_device(&self) -> bool {
        !self.fds.is_empty()
    }

    fn gpu_time_ns(&self) -> u64 {
        self.fds
            .iter()
            .filter_map(|path| fs::read_to_string(path).ok())
            .filter_map(|contents| parse_fdinfo(&contents))
            .sum()
    }

    pub fn start(self, telemetry: Arc<Telemetry>) -> SamplerWorker {
        SamplerWorker::spawn("mangohud-msm", move |stop| self.run(&telemetry, stop))
    }

    fn run(self, telemetry: &Telemetry, stop: &AtomicBool) {
        let mut prev_gpu_ns = self.gpu_time_ns();
        let mut prev_ns = clock::now_ns();
        while !stop.load(Ordering::Relaxed) {
            if !interruptible_sleep(Duration::from_millis(METRICS_UPDATE_PERIOD_MS), stop) {
                return;
            }
            let gpu_ns = self.gpu_time_ns();
            let now = clock::now_ns();
            if gpu_ns > prev_gpu_ns {
                let load = load_percent(gpu_ns - prev_gpu_ns, now.saturating_sub(prev_ns));
                telemetry.gpu.lock().load_percent = load;
            }
            prev_gpu_ns = gpu_ns;
            prev_ns = now;
        }
    }
}

/// Whether any fd in `fdinfo_dir` belongs to the msm driver.
pub fn probe(fdinfo_dir: &Path) -> bool {
    MsmSampler::with_fdinfo_dir(fdinfo_dir.to_path_buf()).has_device()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fdinfo_parsing_filters_by_driver() {
        let msm = "\
pos: 0
drm-driver:\tmsm
drm-engine-gpu:\t123456789 ns
";
        assert_eq!(parse_fdinfo(msm), Some(123456789));

        let other = "\
drm-driver:\tamdgpu
drm-engine-gfx:\t42 ns
";
        assert_eq!(parse_fdinfo(other), None);

        let msm_without_engine = "drm-driver:\tmsm\n";
        assert_eq!(parse_fdinfo(msm_without_engine), None);
    }

    #[test]
    fn load_is_ratio_of_deltas_clamped() {
        assert_eq!(load_percent(500, 1000), 50);
        assert_eq!(load_percent(2000, 1000), 100);
        assert_eq!(load_percent(0, 1000), 0);
        assert_eq!(load_percent(100, 0), 0);
    }

    #[test]
    fn rescan_picks_up_msm_fds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("7"),
            "drm-driver:\tmsm\ndrm-engine-gpu:\t10 ns\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("8"), "pos: 0\n").unwrap();
        let sampler = MsmSampler::with_fdinfo_dir(dir.path().to_path_buf());
        assert!(sampler.has_device());
        assert_eq!(sampler.gpu_time_ns(), 10);
    }
}
