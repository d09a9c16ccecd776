/*! Telemetry samplers.
 *
 * Each sampler runs on its own worker thread, keeps a rolling window of raw
 * samples and periodically reduces the window into a published snapshot.
 * Snapshots are whole-record stores behind a mutex: a reader sees either the
 * previous window or the next one, never a half-written record.
 *
 * The present path never blocks on a sampler; samplers never block the
 * present path. Worker threads check their stop flag at every polling tick
 * and exit cleanly on shutdown.
 */

pub mod amdgpu;
pub mod clock;
pub mod cpu;
pub mod device;
pub mod intel;
pub mod iostats;
pub mod memory;
pub mod msm;
pub mod nvml;
pub mod radeon;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use types::{CpuSnapshot, GpuSnapshot, IoSnapshot, MemorySnapshot};

/// How long one reduction window lasts.
pub const METRICS_UPDATE_PERIOD_MS: u64 = 500;
/// Raw polling period inside a window.
pub const METRICS_POLLING_PERIOD_MS: u64 = 5;
/// Raw samples per window.
pub const METRICS_SAMPLE_COUNT: usize =
    (METRICS_UPDATE_PERIOD_MS / METRICS_POLLING_PERIOD_MS) as usize;

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("i/o error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported gpu_metrics version {format}.{content} (size {size})")]
    UnsupportedMetricsVersion { format: u8, content: u8, size: u16 },
    #[error("malformed {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("library unavailable: {0}")]
    LibraryUnavailable(String),
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
}

impl MetricsError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Shared snapshot hub. Single writer per field, many readers.
#[derive(Default)]
pub struct Telemetry {
    pub gpu: Mutex<GpuSnapshot>,
    pub cpu: Mutex<CpuSnapshot>,
    pub memory: Mutex<MemorySnapshot>,
    pub io: Mutex<IoSnapshot>,
}

impl Telemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gpu_snapshot(&self) -> GpuSnapshot {
        self.gpu.lock().clone()
    }

    pub fn cpu_snapshot(&self) -> CpuSnapshot {
        self.cpu.lock().clone()
    }

    pub fn memory_snapshot(&self) -> MemorySnapshot {
        *self.memory.lock()
    }

    pub fn io_snapshot(&self) -> IoSnapshot {
        *self.io.lock()
    }
}

/// A sampler worker thread plus its stop flag.
///
/// Dropping the handle without calling [`SamplerWorker::stop`] detaches the
/// thread; it will still exit at its next polling tick once the flag is set
/// by whoever holds a clone of it.
pub struct SamplerWorker {
    name: &'static str,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SamplerWorker {
    /// Spawn `body` on a named thread. `body` is handed the stop flag and is
    /// expected to poll it at every suspension point.
    pub fn spawn<F>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(&AtomicBool) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(&thread_stop))
            .expect("failed to spawn sampler thread");
        Self {
            name,
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                // A panicked sampler leaves its last published snapshot in
                // place; readers keep seeing the stale values.
                log::warn!("sampler thread '{}' panicked", self.name);
            }
        }
    }
}

impl Drop for SamplerWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Sleep in short slices so a stop request is honored promptly.
pub(crate) fn interruptible_sleep(total: Duration, stop: &AtomicBool) -> bool {
    const SLICE: Duration = Duration::from_millis(50);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(SLICE);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !stop.load(Ordering::Relaxed)
}

#[cfg(test)]
pub(crate) fn test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_stops_on_flag() {
        test_logger();
        let worker = SamplerWorker::spawn("test-worker", |stop| {
            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        worker.stop();
    }

    #[test]
    fn telemetry_snapshot_is_whole_record() {
        let telemetry = Telemetry::new();
        {
            let mut gpu = telemetry.gpu.lock();
            gpu.load_percent = 64;
            gpu.power_w = 33.0;
        }
        let snap = telemetry.gpu_snapshot();
        assert_eq!(snap.load_percent, 64);
        assert_eq!(snap.power_w, 33.0);
    }
}
