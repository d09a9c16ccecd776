//! The process-wide overlay context.
//!
//! One `Overlay` exists per process, created lazily on the first present
//! and torn down with the device. The present-path hooks (Vulkan layer, GL
//! interposer) drive it through [`Overlay::frame_tick`]; everything else
//! (samplers, logger worker, exporter) hangs off it as owned workers.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use metrics::clock;
use metrics::cpu::CpuStats;
use metrics::device::{ActiveSampler, GpuDevice};
use metrics::iostats::IoStats;
use metrics::{memory, SamplerWorker, Telemetry};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use types::{EngineType, FpsLimitMethod, Position};

use crate::blacklist;
use crate::config;
use crate::control::{ControlCommand, ControlServer};
use crate::exporter::{ExporterManager, ExporterSample};
use crate::fps_metrics::FpsMetrics;
use crate::frame_stats::{FrameStats, FrameUpdate};
use crate::keybinds::{self, Action, KeySource, KeybindState};
use crate::logger::{self, LogRow, Logger};
use crate::params::{preset_options, Params};
use crate::proc_info;

/// Latest fps/frametime published for readers outside the present thread
/// (exporter, logger worker).
#[derive(Default)]
pub struct Vitals {
    fps_bits: AtomicU64,
    frametime_ns: AtomicU64,
}

impl Vitals {
    fn publish(&self, fps: f64, frametime_ns: u64) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
        self.frametime_ns.store(frametime_ns, Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        f64::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    pub fn frametime_ns(&self) -> u64 {
        self.frametime_ns.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug, Default)]
pub struct EngineInfo {
    pub engine: EngineType,
    pub name: String,
    pub version: String,
}

static OVERLAY: OnceCell<Overlay> = OnceCell::new();

pub struct Overlay {
    params: RwLock<Arc<Params>>,
    pub telemetry: Arc<Telemetry>,
    pub vitals: Arc<Vitals>,

    frame_stats: Mutex<FrameStats>,
    fps_metrics: Mutex<FpsMetrics>,
    pub logger: Mutex<Logger>,

    keybind_state: Mutex<KeybindState>,
    key_source: Option<Box<dyn KeySource + Send + Sync>>,

    control: Mutex<Option<ControlServer>>,
    exporter: Mutex<ExporterManager>,

    /// Target the frame pacer reads every present; 0 disables it.
    fps_limit_target: AtomicU32,
    fps_limit_index: AtomicU32,
    hud_hidden: AtomicBool,
    position: Mutex<Position>,
    current_preset: Mutex<Option<i32>>,

    engine: Mutex<EngineInfo>,
    device_name: Mutex<String>,

    gpu_sampler: Mutex<Option<ActiveSampler>>,
    system_worker: Mutex<Option<SamplerWorker>>,
    logger_worker: Mutex<Option<SamplerWorker>>,
    first_frame: AtomicBool,
}

impl Overlay {
    /// The lazily-created process context. First call parses the config and
    /// starts the system samplers.
    pub fn global() -> &'static Overlay {
        OVERLAY.get_or_init(Overlay::new)
    }

    fn new() -> Self {
        let loaded = config::load();
        let params = Arc::new(Params::from_options(
            loaded.options.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        ));

        for item in &params.blacklist {
            blacklist::add(item);
        }
        blacklist::check(true);

        let telemetry = Telemetry::new();
        let vitals: Arc<Vitals> = Arc::new(Vitals::default());

        let fps_metrics = FpsMetrics::from_percent_labels(&params.benchmark_percentiles);
        let exporter_telemetry = Arc::clone(&telemetry);
        let exporter_vitals = Arc::clone(&vitals);
        let exporter = ExporterManager::new(
            std::process::id(),
            proc_info::program_name(),
            Arc::new(move || {
                let gpu = exporter_telemetry.gpu_snapshot();
                let cpu = exporter_telemetry.cpu_snapshot();
                let mem = exporter_telemetry.memory_snapshot();
                ExporterSample {
                    fps: exporter_vitals.fps(),
                    frametime_ms: exporter_vitals.frametime_ns() as f64 / 1e6,
                    cpu_load: cpu.total_percent,
                    gpu_load: gpu.load_percent,
                    cpu_temp: cpu.temp_c,
                    gpu_temp: gpu.core_temp_c,
                    cpu_power: if cpu.power_w > 0.0 {
                        cpu.power_w
                    } else {
                        gpu.apu_cpu_power_w
                    },
                    gpu_power: gpu.power_w,
                    ram_used_mb: mem.ram_used_gib * 1024.0,
                    vram_used_mb: gpu.sys_vram_used_gib * 1024.0,
                }
            }),
        );

        let key_source: Option<Box<dyn KeySource + Send + Sync>> =
            keybinds::X11KeySource::connect()
                .map(|source| Box::new(source) as Box<dyn KeySource + Send + Sync>);
        if key_source.is_none() {
            log::info!("no keyboard source available, keybinds disabled");
        }

        let fps_limit_target = params.fps_limit.first().copied().unwrap_or(0);
        let overlay = Self {
            hud_hidden: AtomicBool::new(params.no_display),
            position: Mutex::new(params.position),
            fps_limit_target: AtomicU32::new(fps_limit_target),
            fps_limit_index: AtomicU32::new(0),
            current_preset: Mutex::new(params.preset.first().copied()),
            params: RwLock::new(params),
            telemetry,
            vitals,
            frame_stats: Mutex::new(FrameStats::new()),
            fps_metrics: Mutex::new(fps_metrics),
            logger: Mutex::new(Logger::new()),
            keybind_state: Mutex::new(KeybindState::default()),
            key_source,
            control: Mutex::new(None),
            exporter: Mutex::new(exporter),
            engine: Mutex::new(EngineInfo::default()),
            device_name: Mutex::new(String::new()),
            gpu_sampler: Mutex::new(None),
            system_worker: Mutex::new(None),
            logger_worker: Mutex::new(None),
            first_frame: AtomicBool::new(true),
        };
        overlay.start_system_sampler();
        overlay
    }

    pub fn params(&self) -> Arc<Params> {
        Arc::clone(&self.params.read())
    }

    pub fn hud_visible(&self) -> bool {
        !self.hud_hidden.load(Ordering::Relaxed)
    }

    pub fn position(&self) -> Position {
        *self.position.lock()
    }

    pub fn fps_limit_target(&self) -> u32 {
        self.fps_limit_target.load(Ordering::Relaxed)
    }

    pub fn fps_limit_method(&self) -> FpsLimitMethod {
        self.params.read().fps_limit_method
    }

    pub fn set_fps_limit_target(&self, fps: u32) {
        self.fps_limit_target.store(fps, Ordering::Relaxed);
    }

    pub fn set_engine(&self, engine: EngineInfo) {
        *self.engine.lock() = engine;
    }

    pub fn engine(&self) -> EngineInfo {
        self.engine.lock().clone()
    }

    pub fn set_device_name(&self, name: &str) {
        *self.device_name.lock() = name.to_string();
    }

    /// CPU + memory + io poller, one per process.
    fn start_system_sampler(&self) {
        let mut guard = self.system_worker.lock();
        if guard.is_some() {
            return;
        }
        let telemetry = Arc::clone(&self.telemetry);
        *guard = Some(SamplerWorker::spawn("mangohud-system", move |stop| {
            let mut cpu = match CpuStats::new() {
                Ok(cpu) => cpu,
                Err(err) => {
                    log::warn!("cpu sampler unavailable: {err}");
                    return;
                }
            };
            let mut io = IoStats::new();
            while !stop.load(Ordering::Relaxed) {
                if let Ok(snapshot) = cpu.update() {
                    *telemetry.cpu.lock() = snapshot;
                }
                if let Ok(snapshot) = memory::read_system() {
                    *telemetry.memory.lock() = snapshot;
                }
                *telemetry.io.lock() = io.update();
                std::thread::sleep(std::time::Duration::from_millis(500));
            }
        }));
    }

    /// Pick and start the vendor sampler for the render node the Vulkan
    /// layer discovered. A sampler failure leaves the HUD CPU-only.
    pub fn init_gpu_from_render_minor(&self, minor: u32) {
        let mut guard = self.gpu_sampler.lock();
        if guard.is_some() {
            return;
        }
        let Some(device) = GpuDevice::from_render_minor(minor) else {
            log::info!("no sysfs device for render minor {minor}");
            return;
        };
        match metrics::device::start_sampler(&device, Arc::clone(&self.telemetry)) {
            Ok(sampler) => {
                log::info!("gpu sampler started: {:?}", sampler.kind);
                *guard = Some(sampler);
            }
            Err(err) => log::info!("gpu sampler unavailable: {err}"),
        }
    }

    /// One present. Updates frame statistics, drains external inputs and
    /// fires keybinds. Returns the frame update for the HUD.
    pub fn frame_tick(&'static self, now_ns: u64) -> FrameUpdate {
        profiling::scope!("overlay_frame_tick");
        let params = self.params();

        if self.first_frame.swap(false, Ordering::Relaxed) {
            self.maybe_autostart_log();
        }

        let update = {
            let mut stats = self.frame_stats.lock();
            stats.record_present(now_ns, params.fps_sampling_period_ms * 1_000_000)
        };
        self.vitals.publish(update.fps, update.frametime_ns);

        if update.fps_updated {
            let fps_metrics = self.fps_metrics.lock();
            fps_metrics.update(now_ns, update.fps);
            fps_metrics.request_recompute();

            // Inline logging path, used when no periodic worker is running.
            if params.log_interval_ms == 0 && self.log_current_row(now_ns) {
                self.stop_logging(now_ns);
            }
        }

        for command in self.drain_control(&params) {
            match command {
                ControlCommand::Capture(true) => self.start_logging(now_ns),
                ControlCommand::Capture(false) => self.stop_logging(now_ns),
                ControlCommand::FpsLimit(fps) => self.set_fps_limit_target(fps),
            }
        }

        // Keyboard polling happens with no rendering locks held.
        if let Some(source) = &self.key_source {
            let actions = {
                let mut state = self.keybind_state.lock();
                state.poll(&params, source.as_ref())
            };
            for action in actions {
                if keybinds::permitted(action, &params) {
                    self.apply_action(action, now_ns);
                }
            }
        }

        self.exporter.lock().reconfigure(
            params.otel,
            &params.otel_listen,
            params.otel_interval_ms,
            params.otel_startup_delay_s,
            now_ns,
        );

        update
    }

    fn drain_control(&self, params: &Params) -> Vec<ControlCommand> {
        let Some(name) = &params.control else {
            return Vec::new();
        };
        let mut guard = self.control.lock();
        if guard.is_none() {
            let device_name = self.device_name.lock().clone();
            match ControlServer::bind_abstract(name, &device_name) {
                Ok(server) => *guard = Some(server),
                Err(err) => {
                    // Permanent for this process; do not retry every frame.
                    log::warn!("control socket '{name}' unavailable: {err}");
                    drop(guard);
                    let mut params_guard = self.params.write();
                    let mut updated = (**params_guard).clone();
                    updated.control = None;
                    *params_guard = Arc::new(updated);
                    return Vec::new();
                }
            }
        }
        guard.as_mut().map(|server| server.poll()).unwrap_or_default()
    }

    pub fn apply_action(&'static self, action: Action, now_ns: u64) {
        let params = self.params();
        match action {
            Action::ToggleLogging => {
                let active = self.logger.lock().is_active();
                if active {
                    self.stop_logging(now_ns);
                } else {
                    self.start_logging(now_ns);
                }
            }
            Action::CycleFpsLimit => {
                if !params.fps_limit.is_empty() {
                    let next = (self.fps_limit_index.load(Ordering::Relaxed) + 1)
                        % params.fps_limit.len() as u32;
                    self.fps_limit_index.store(next, Ordering::Relaxed);
                    self.set_fps_limit_target(params.fps_limit[next as usize]);
                }
            }
            Action::CyclePreset => {
                if !params.preset.is_empty() {
                    let mut current = self.current_preset.lock();
                    let position = current
                        .and_then(|value| params.preset.iter().position(|p| *p == value))
                        .unwrap_or(params.preset.len() - 1);
                    let next = params.preset[(position + 1) % params.preset.len()];
                    *current = Some(next);
                    drop(current);
                    self.reload_config();
                }
            }
            Action::ToggleHud => {
                self.hud_hidden.fetch_xor(true, Ordering::Relaxed);
            }
            Action::ReloadConfig => self.reload_config(),
            Action::UploadLastLog => {
                let files = self.logger.lock().log_files().to_vec();
                if let Some(last) = files.last() {
                    logger::upload(vec![last.clone()]);
                }
            }
            Action::UploadAllLogs => {
                let files = self.logger.lock().log_files().to_vec();
                logger::upload(files);
            }
            Action::CycleHudPosition => {
                let mut position = self.position.lock();
                *position = position.next();
            }
            Action::ResetFpsMetrics => self.fps_metrics.lock().reset(),
        }
    }

    /// Re-read config files, re-apply the current preset, swap the params.
    pub fn reload_config(&self) {
        let loaded = config::load();
        let mut options = loaded.options;
        if let Some(preset) = *self.current_preset.lock() {
            options.extend(preset_options(preset));
        }
        let mut params = Params::from_options(
            options.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        );
        params.config_file_path = loaded.path;

        for item in &params.blacklist {
            blacklist::add(item);
        }
        blacklist::check(true);

        self.hud_hidden.store(params.no_display, Ordering::Relaxed);
        *self.position.lock() = params.position;
        self.fps_limit_index.store(0, Ordering::Relaxed);
        self.set_fps_limit_target(params.fps_limit.first().copied().unwrap_or(0));
        *self.fps_metrics.lock() = FpsMetrics::from_percent_labels(&params.benchmark_percentiles);
        // A control-name change takes effect by rebinding on the next drain.
        if params.control != self.params.read().control {
            *self.control.lock() = None;
        }

        log::info!(
            "config reloaded from {:?}",
            params.config_file_path.as_deref()
        );
        *self.params.write() = Arc::new(params);
    }

    fn current_row(&self, _now_ns: u64) -> LogRow {
        let gpu = self.telemetry.gpu_snapshot();
        let cpu = self.telemetry.cpu_snapshot();
        let mem = self.telemetry.memory_snapshot();
        LogRow {
            fps: self.vitals.fps(),
            frametime_ns: self.vitals.frametime_ns(),
            cpu_load: cpu.total_percent,
            gpu_load: gpu.load_percent,
            cpu_temp: cpu.temp_c,
            gpu_temp: gpu.core_temp_c,
            gpu_core_clock: gpu.core_clock_mhz,
            gpu_mem_clock: gpu.memory_clock_mhz,
            gpu_vram_used_gib: gpu.sys_vram_used_gib,
            gpu_power_w: gpu.power_w,
            ram_used_gib: mem.ram_used_gib,
            elapsed_ns: 0,
        }
    }

    /// Append one row; returns whether `log_duration` elapsed.
    fn log_current_row(&self, now_ns: u64) -> bool {
        let row = self.current_row(now_ns);
        self.logger.lock().try_log(row, now_ns)
    }

    /// Stop the run and write the CSV files, without touching the periodic
    /// worker (the worker calls this on itself when the duration elapses).
    fn finish_logging(&self, now_ns: u64) {
        let params = self.params();
        let program = proc_info::program_name();
        let result = {
            let mut logger = self.logger.lock();
            logger.stop(now_ns, &program, params.output_folder.as_deref())
        };
        if let Err(err) = result {
            log::warn!("failed to write log files: {err}");
        }
    }

    pub fn start_logging(&'static self, now_ns: u64) {
        let params = self.params();
        {
            let mut logger = self.logger.lock();
            if logger.is_active() {
                return;
            }
            logger.start(now_ns, params.log_duration_s);
        }
        self.fps_metrics.lock().reset();

        // Periodic worker when an interval is configured; inline otherwise.
        if params.log_interval_ms > 0 && params.output_folder.is_some() {
            let interval = std::time::Duration::from_millis(params.log_interval_ms);
            let overlay: &'static Overlay = self;
            *self.logger_worker.lock() = Some(SamplerWorker::spawn(
                "mangohud-logger",
                move |stop| {
                    while !stop.load(Ordering::Relaxed) {
                        std::thread::sleep(interval);
                        if !overlay.logger.lock().is_active() {
                            break;
                        }
                        let now = clock::now_ns();
                        if overlay.log_current_row(now) {
                            // Duration elapsed: flush and bow out; the
                            // handle is joined by the next stop/start.
                            overlay.finish_logging(now);
                            break;
                        }
                    }
                },
            ));
        }
        log::info!("logging started");
    }

    pub fn stop_logging(&'static self, now_ns: u64) {
        self.finish_logging(now_ns);
        if let Some(worker) = self.logger_worker.lock().take() {
            worker.stop();
        }
    }

    /// Delayed log autostart, spawned once at first frame when configured.
    pub fn maybe_autostart_log(&'static self) {
        let params = self.params();
        if params.autostart_log_s == 0 {
            return;
        }
        let delay = std::time::Duration::from_secs(params.autostart_log_s);
        std::thread::Builder::new()
            .name("mangohud-autolog".into())
            .spawn(move || {
                std::thread::sleep(delay);
                self.start_logging(clock::now_ns());
            })
            .ok();
    }

    /// Device teardown: flush an active log run and stop the workers.
    pub fn shutdown(&'static self) {
        self.stop_logging(clock::now_ns());
        if let Some(sampler) = self.gpu_sampler.lock().take() {
            sampler.stop();
        }
        if let Some(worker) = self.system_worker.lock().take() {
            worker.stop();
        }
    }
}
