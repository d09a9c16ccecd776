//! Intel sampler.
//!
//! There is no stable sysfs interface that covers load, frequency and power
//! together, so this shells out to `intel_gpu_top -J` and consumes its JSON
//! stream. The tool emits one object per sampling period without a
//! surrounding array, so objects are re-assembled line by line. If the child
//! exits (missing binary, missing permissions) GPU stats stay disabled for
//! the rest of the session.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use types::GpuSnapshot;

use crate::{MetricsError, SamplerWorker, Telemetry};

/// One parsed `intel_gpu_top` period.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct IntelSample {
    pub load_percent: u32,
    pub core_clock_mhz: u32,
    pub gpu_power_w: f32,
    pub package_power_w: f32,
}

/// Extract the fields we publish out of one JSON object.
pub fn parse_period(object: &serde_json::Value) -> IntelSample {
    let mut sample = IntelSample::default();
    if let Some(busy) = object
        .get("engines")
        .and_then(|e| e.get("Render/3D/0"))
        .and_then(|e| e.get("busy"))
        .and_then(|b| b.as_f64())
    {
        sample.load_percent = busy as u32;
    }
    if let Some(freq) = object
        .get("frequency")
        .and_then(|f| f.get("actual"))
        .and_then(|f| f.as_f64())
    {
        sample.core_clock_mhz = freq as u32;
    }
    if let Some(power) = object.get("power") {
        if let Some(gpu) = power.get("GPU").and_then(|p| p.as_f64()) {
            sample.gpu_power_w = gpu as f32;
        }
        if let Some(package) = power.get("Package").and_then(|p| p.as_f64()) {
            sample.package_power_w = package as f32;
        }
    }
    sample
}

/// Incremental re-assembly of the stream into complete JSON objects.
///
/// `intel_gpu_top -J` separates periods with a bare `},` line; tolerate
/// partial output and keep accumulating until a block parses.
#[derive(Default)]
pub struct StreamParser {
    buf: String,
    depth: i32,
}

impl StreamParser {
    /// Feed one line; returns a sample when it completes an object.
    pub fn push_line(&mut self, line: &str) -> Option<IntelSample> {
        for ch in line.chars() {
            match ch {
                '{' => self.depth += 1,
                '}' => self.depth -= 1,
                _ => {}
            }
        }
        self.buf.push_str(line);
        self.buf.push('\n');

        if self.depth <= 0 && self.buf.contains('{') {
            let block = std::mem::take(&mut self.buf);
            self.depth = 0;
            // The stream separates periods with bare commas outside the
            // objects themselves.
            let trimmed = block.trim().trim_start_matches(',').trim_end_matches(',');
            match serde_json::from_str::<serde_json::Value>(trimmed) {
                Ok(object) => return Some(parse_period(&object)),
                Err(err) => log::debug!("intel_gpu_top: unparsable block: {err}"),
            }
        }
        None
    }
}

pub struct IntelSampler {
    child: Child,
}

impl IntelSampler {
    /// Spawn `intel_gpu_top -J`, optionally through the Steam runtime's
    /// container launcher when we are running inside pressure-vessel.
    pub fn spawn(through_steam_runtime: bool) -> Result<Self, MetricsError> {
        let mut command = if through_steam_runtime {
            let mut c = Command::new("steam-runtime-launch-client");
            c.args(["--alongside-steam", "--host", "--", "intel_gpu_top"]);
            c
        } else {
            Command::new("intel_gpu_top")
        };
        let child = command
            .args(["-J", "-s", "500"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            // The child must not get re-injected with the overlay.
            .env_remove("LD_PRELOAD")
            .spawn()
            .map_err(|e| MetricsError::LibraryUnavailable(format!("intel_gpu_top: {e}")))?;
        Ok(Self { child })
    }

    /// Returns the worker plus a flag that flips when the session is over
    /// (child exited), meaning GPU stats should be disabled permanently.
    pub fn start(self, telemetry: Arc<Telemetry>) -> (SamplerWorker, Arc<AtomicBool>) {
        let disabled = Arc::new(AtomicBool::new(false));
        let disabled_out = Arc::clone(&disabled);
        let worker = SamplerWorker::spawn("mangohud-intel", move |stop| {
            self.run(&telemetry, stop, &disabled)
        });
        (worker, disabled_out)
    }

    fn run(mut self, telemetry: &Telemetry, stop: &AtomicBool, disabled: &AtomicBool) {
        let Some(stdout) = self.child.stdout.take() else {
            disabled.store(true, Ordering::Relaxed);
            return;
        };
        let reader = BufReader::new(stdout);
        let mut parser = StreamParser::default();

        for line in reader.lines() {
            if stop.load(Ordering::Relaxed) {
                let _ = self.child.kill();
                break;
            }
            let Ok(line) = line else { break };
            if let Some(sample) = parser.push_line(&line) {
                let mut gpu = telemetry.gpu.lock();
                gpu.load_percent = sample.load_percent;
                gpu.core_clock_mhz = sample.core_clock_mhz;
                gpu.power_w = sample.gpu_power_w;
                gpu.apu_cpu_power_w = sample.package_power_w;
            }
        }

        match self.child.wait() {
            Ok(status) if !status.success() => {
                log::info!("intel_gpu_top exited with {status}; disabling gpu stats");
                disabled.store(true, Ordering::Relaxed);
            }
            Err(err) => {
                log::info!("intel_gpu_top wait failed: {err}; disabling gpu stats");
                disabled.store(true, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

/// Probe whether we are inside the Steam pressure-vessel container.
///
/// Exit code 127 means the launcher is absent (plain host), 0 means the
/// container with `--alongside-steam` support, anything else means a
/// container we cannot escape.
pub fn steam_runtime_probe() -> Option<bool> {
    let status = Command::new("steam-runtime-launch-client")
        .args(["--alongside-steam", "--host"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .env_remove("LD_PRELOAD")
        .status()
        .ok()?;
    match status.code() {
        Some(127) | None => Some(false),
        Some(0) => Some(true),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_render_busy_frequency_and_power() {
        let object: serde_json::Value = serde_json::from_str(
            r#"{
                "frequency": { "requested": 350.0, "actual": 812.5 },
                "power": { "GPU": 7.25, "Package": 14.5 },
                "engines": {
                    "Render/3D/0": { "busy": 42.8, "sema": 0.0, "wait": 0.0 },
                    "Video/0": { "busy": 1.0 }
                }
            }"#,
        )
        .unwrap();
        let sample = parse_period(&object);
        assert_eq!(sample.load_percent, 42);
        assert_eq!(sample.core_clock_mhz, 812);
        assert_eq!(sample.gpu_power_w, 7.25);
        assert_eq!(sample.package_power_w, 14.5);
    }

    #[test]
    fn missing_fields_default_to_zero() {
        let object: serde_json::Value = serde_json::from_str(r#"{"period": {"ms": 500}}"#).unwrap();
        assert_eq!(parse_period(&object), IntelSample::default());
    }

    #[test]
    fn stream_parser_reassembles_blocks() {
        let mut parser = StreamParser::default();
        let lines = [
            "{",
            "  \"frequency\": { \"actual\": 400.0 },",
            "  \"engines\": { \"Render/3D/0\": { \"busy\": 10.0 } }",
            "},",
        ];
        let mut sample = None;
        for line in lines {
            if let Some(s) = parser.push_line(line) {
                sample = Some(s);
            }
        }
        let sample = sample.expect("block should complete");
        assert_eq!(sample.load_percent, 10);
        assert_eq!(sample.core_clock_mhz, 400);
    }

    #[test]
    fn stream_parser_survives_garbage() {
        let mut parser = StreamParser::default();
        assert!(parser.push_line("not json").is_none());
        assert!(parser.push_line("{ \"unterminated\": ").is_none());
    }
}
