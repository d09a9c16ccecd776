//! Prometheus exporter.
//!
//! A collector thread snapshots the shared telemetry every
//! `otel_interval_ms` and renders the text exposition payload; a minimal
//! HTTP/1.1 server thread serves it to one connection at a time. Interval
//! changes apply atomically; a listen-address change restarts the server
//! pair.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

/// The values one exposition payload is built from.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ExporterSample {
    pub fps: f64,
    pub frametime_ms: f64,
    pub cpu_load: f32,
    pub gpu_load: u32,
    pub cpu_temp: i32,
    pub gpu_temp: i32,
    pub cpu_power: f32,
    pub gpu_power: f32,
    pub ram_used_mb: f32,
    pub vram_used_mb: f32,
}

/// Render the exposition-format payload with constant `pid`/`exec` labels.
pub fn render_metrics(sample: &ExporterSample, pid: u32, exec: &str) -> String {
    let mut out = String::with_capacity(2048);
    let mut gauge = |name: &str, help: &str, value: f64| {
        out.push_str(&format!(
            "# HELP {name} {help}\n# TYPE {name} gauge\n{name}{{pid=\"{pid}\",exec=\"{exec}\"}} {value}\n"
        ));
    };
    gauge("mangohud_fps", "Current frames per second", sample.fps);
    gauge(
        "mangohud_frametime_ms",
        "Frame time in milliseconds (most recent frame)",
        sample.frametime_ms,
    );
    gauge(
        "mangohud_cpu_load_percent",
        "Average CPU load percent",
        sample.cpu_load as f64,
    );
    gauge(
        "mangohud_gpu_load_percent",
        "Average GPU load percent",
        sample.gpu_load as f64,
    );
    gauge(
        "mangohud_cpu_temp_celsius",
        "CPU temperature in Celsius",
        sample.cpu_temp as f64,
    );
    gauge(
        "mangohud_gpu_temp_celsius",
        "GPU temperature in Celsius",
        sample.gpu_temp as f64,
    );
    gauge(
        "mangohud_cpu_power_watts",
        "CPU package power draw (W)",
        sample.cpu_power as f64,
    );
    gauge(
        "mangohud_gpu_power_watts",
        "GPU power draw (W)",
        sample.gpu_power as f64,
    );
    gauge(
        "mangohud_ram_used_mb",
        "System RAM used (MB)",
        sample.ram_used_mb as f64,
    );
    gauge(
        "mangohud_vram_used_mb",
        "GPU VRAM used (MB)",
        sample.vram_used_mb as f64,
    );
    out
}

type SampleFn = Arc<dyn Fn() -> ExporterSample + Send + Sync>;

struct Inner {
    payload: Mutex<String>,
    interval_ms: AtomicU64,
    running: AtomicBool,
}

/// One running collector + server pair.
pub struct Exporter {
    inner: Arc<Inner>,
    listen: String,
    collector: Option<JoinHandle<()>>,
    server: Option<JoinHandle<()>>,
}

impl Exporter {
    pub fn start(
        listen: &str,
        interval_ms: u64,
        pid: u32,
        exec: String,
        sample_fn: SampleFn,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(listen)?;
        listener.set_nonblocking(true)?;

        let inner = Arc::new(Inner {
            payload: Mutex::new(String::new()),
            interval_ms: AtomicU64::new(interval_ms.max(1)),
            running: AtomicBool::new(true),
        });

        let collector_inner = Arc::clone(&inner);
        let collector = std::thread::Builder::new()
            .name("mangohud-otelc".into())
            .spawn(move || {
                // Render once per configured interval, sleeping in <= 1 s
                // slices so interval changes and shutdown are picked up
                // promptly without over-sampling.
                let mut since_render = None;
                while collector_inner.running.load(Ordering::Relaxed) {
                    let interval =
                        Duration::from_millis(collector_inner.interval_ms.load(Ordering::Relaxed));
                    let due = match since_render {
                        Some(elapsed) => elapsed >= interval,
                        None => true,
                    };
                    if due {
                        let sample = sample_fn();
                        *collector_inner.payload.lock() = render_metrics(&sample, pid, &exec);
                        since_render = Some(Duration::ZERO);
                    }
                    let elapsed = since_render.unwrap_or_default();
                    let slice = interval
                        .saturating_sub(elapsed)
                        .min(Duration::from_millis(1000))
                        .max(Duration::from_millis(1));
                    std::thread::sleep(slice);
                    since_render = Some(elapsed + slice);
                }
            })
            .expect("failed to spawn exporter collector");

        let server_inner = Arc::clone(&inner);
        let server = std::thread::Builder::new()
            .name("mangohud-otels".into())
            .spawn(move || {
                while server_inner.running.load(Ordering::Relaxed) {
                    match listener.accept() {
                        Ok((mut stream, _)) => {
                            let _ = stream.set_nonblocking(false);
                            let _ =
                                stream.set_read_timeout(Some(Duration::from_millis(500)));
                            // Drain whatever request line arrived; any GET
                            // is answered the same way.
                            let mut request = [0u8; 1024];
                            let _ = stream.read(&mut request);

                            let payload = server_inner.payload.lock().clone();
                            let response = format!(
                                "HTTP/1.1 200 OK\r\n\
                                 Content-Type: text/plain; version=0.0.4\r\n\
                                 Content-Length: {}\r\n\
                                 Connection: close\r\n\r\n{payload}",
                                payload.len()
                            );
                            let _ = stream.write_all(response.as_bytes());
                        }
                        Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(50));
                        }
                        Err(err) => {
                            log::warn!("exporter accept failed: {err}");
                            std::thread::sleep(Duration::from_millis(250));
                        }
                    }
                }
            })
            .expect("failed to spawn exporter server");

        log::info!("prometheus exporter listening on {listen} (interval {interval_ms}ms)");
        Ok(Self {
            inner,
            listen: listen.to_string(),
            collector: Some(collector),
            server: Some(server),
        })
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen
    }

    /// Interval changes are picked up without a restart.
    pub fn set_interval_ms(&self, interval_ms: u64) {
        self.inner
            .interval_ms
            .store(interval_ms.max(1), Ordering::Relaxed);
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.inner.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.collector.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.server.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Exporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Lifecycle: startup delay, restart on listen change, atomic interval
/// updates. Driven from the present path via `reconfigure`.
pub struct ExporterManager {
    active: Option<Exporter>,
    first_enable_ns: Option<u64>,
    pid: u32,
    exec: String,
    sample_fn: SampleFn,
}

impl ExporterManager {
    pub fn new(pid: u32, exec: String, sample_fn: SampleFn) -> Self {
        Self {
            active: None,
            first_enable_ns: None,
            pid,
            exec,
            sample_fn,
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Apply the current params at `now_ns`.
    pub fn reconfigure(
        &mut self,
        enabled: bool,
        listen: &str,
        interval_ms: u64,
        startup_delay_s: u64,
        now_ns: u64,
    ) {
        if !enabled {
            self.active = None;
            self.first_enable_ns = None;
            return;
        }

        let first = *self.first_enable_ns.get_or_insert(now_ns);
        if now_ns.saturating_sub(first) < startup_delay_s * 1_000_000_000 {
            return;
        }

        match &self.active {
            Some(exporter) if exporter.listen_addr() == listen => {
                exporter.set_interval_ms(interval_ms);
            }
            _ => {
                // Listen address changed (or first start): replace the pair.
                self.active = None;
                match Exporter::start(
                    listen,
                    interval_ms,
                    self.pid,
                    self.exec.clone(),
                    Arc::clone(&self.sample_fn),
                ) {
                    Ok(exporter) => self.active = Some(exporter),
                    Err(err) => log::warn!("exporter failed to bind {listen}: {err}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_has_all_gauges_with_labels() {
        let sample = ExporterSample {
            fps: 59.9,
            frametime_ms: 16.7,
            cpu_load: 25.0,
            gpu_load: 80,
            cpu_temp: 55,
            gpu_temp: 70,
            cpu_power: 45.0,
            gpu_power: 180.0,
            ram_used_mb: 9000.0,
            vram_used_mb: 4000.0,
        };
        let payload = render_metrics(&sample, 4242, "vkcube");
        for name in [
            "mangohud_fps",
            "mangohud_frametime_ms",
            "mangohud_cpu_load_percent",
            "mangohud_gpu_load_percent",
            "mangohud_cpu_temp_celsius",
            "mangohud_gpu_temp_celsius",
            "mangohud_cpu_power_watts",
            "mangohud_gpu_power_watts",
            "mangohud_ram_used_mb",
            "mangohud_vram_used_mb",
        ] {
            assert!(
                payload.contains(&format!("# TYPE {name} gauge")),
                "missing {name}"
            );
            assert!(payload.contains(&format!("{name}{{pid=\"4242\",exec=\"vkcube\"}}")));
        }
        assert!(payload.contains("mangohud_fps{pid=\"4242\",exec=\"vkcube\"} 59.9"));
    }

    #[test]
    fn end_to_end_scrape() {
        // Pick a free port first; Exporter::start keys restarts off the
        // literal listen string.
        let port = {
            let probe = TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let listen = format!("127.0.0.1:{port}");
        let sample_fn: SampleFn = Arc::new(|| ExporterSample {
            fps: 120.0,
            ..Default::default()
        });
        let exporter = Exporter::start(&listen, 10, 1, "test".into(), sample_fn).unwrap();

        // Give the collector a tick to publish.
        std::thread::sleep(Duration::from_millis(50));

        let mut stream = std::net::TcpStream::connect(&listen).unwrap();
        stream.write_all(b"GET /metrics HTTP/1.1\r\n\r\n").unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("Content-Type: text/plain; version=0.0.4"));
        assert!(response.contains("mangohud_fps"));

        exporter.stop();
    }

    #[test]
    fn manager_honors_startup_delay_and_restarts_on_listen_change() {
        let port_a = {
            let probe = TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let port_b = {
            let probe = TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let listen_a = format!("127.0.0.1:{port_a}");
        let listen_b = format!("127.0.0.1:{port_b}");

        let sample_fn: SampleFn = Arc::new(ExporterSample::default);
        let mut manager = ExporterManager::new(1, "test".into(), sample_fn);

        // 2s startup delay: not yet.
        manager.reconfigure(true, &listen_a, 100, 2, 0);
        assert!(!manager.is_running());
        manager.reconfigure(true, &listen_a, 100, 2, 1_000_000_000);
        assert!(!manager.is_running());
        manager.reconfigure(true, &listen_a, 100, 2, 2_000_000_000);
        assert!(manager.is_running());

        // Listen change restarts onto the new address.
        manager.reconfigure(true, &listen_b, 100, 2, 3_000_000_000);
        assert!(manager.is_running());
        assert_eq!(
            manager.active.as_ref().unwrap().listen_addr(),
            listen_b.as_str()
        );

        // Disable tears it down.
        manager.reconfigure(false, &listen_b, 100, 2, 4_000_000_000);
        assert!(!manager.is_running());
    }
}
