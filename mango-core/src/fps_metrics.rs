//! Background FPS percentile engine.
//!
//! The present thread appends `{timestamp, fps}` points and pokes the
//! worker through a condition variable; the worker sorts and reduces on its
//! own time. History is trimmed to the last ten minutes.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

const TEN_MINUTES_NS: u64 = 600_000_000_000;

/// One computed metric, e.g. `AVG` or the 97th percentile.
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    /// `"AVG"` or a fraction in `(0, 1)` as text, e.g. `"0.97"`.
    pub name: String,
    /// Derived presentation label: `"AVG"`, `"97%"`, `"0.1%"`.
    pub display_name: String,
    pub value: f32,
}

/// Label for a fraction: `0.97` becomes `97%`, `0.001` becomes `0.1%`.
fn display_name(fraction: f32) -> String {
    let percent = fraction * 100.0;
    if percent == percent.trunc() {
        format!("{percent:.0}%")
    } else {
        format!("{percent:.1}%")
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
pub fn percentile(sorted: &[f32], fraction: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (fraction * (sorted.len() - 1) as f32).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

struct State {
    history: Vec<(u64, f32)>,
    metrics: Vec<Metric>,
    run: bool,
    terminate: bool,
    resetting: bool,
}

struct Inner {
    state: Mutex<State>,
    cv: Condvar,
}

pub struct FpsMetrics {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
}

impl FpsMetrics {
    /// `names` mixes `"AVG"` with percentile fractions as text. Entries that
    /// do not parse into `(0, 1)` are dropped the first time the worker
    /// touches them.
    pub fn new(names: &[String]) -> Self {
        let metrics = names
            .iter()
            .map(|name| Metric {
                name: name.to_uppercase(),
                display_name: String::new(),
                value: 0.0,
            })
            .collect();

        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                history: Vec::new(),
                metrics,
                run: false,
                terminate: false,
                resetting: false,
            }),
            cv: Condvar::new(),
        });

        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("mangohud-fpsmetrics".into())
            .spawn(move || Self::calculate(&worker_inner))
            .expect("failed to spawn fps metrics thread");

        Self {
            inner,
            worker: Some(worker),
        }
    }

    /// Translate config percentile labels (`"97"`, `"0.1"`, `"AVG"`) into
    /// the fraction names this engine expects.
    pub fn from_percent_labels(labels: &[String]) -> Self {
        let names: Vec<String> = labels
            .iter()
            .map(|label| {
                if label.eq_ignore_ascii_case("AVG") {
                    "AVG".to_string()
                } else {
                    match label.parse::<f32>() {
                        Ok(percent) => format!("{}", percent / 100.0),
                        Err(_) => label.clone(),
                    }
                }
            })
            .collect();
        Self::new(&names)
    }

    /// Append one FPS observation at `now_ns` and trim old history.
    pub fn update(&self, now_ns: u64, fps: f64) {
        let mut state = self.inner.state.lock();
        if state.resetting {
            return;
        }
        state.history.push((now_ns, fps as f32));
        if now_ns >= TEN_MINUTES_NS {
            let cutoff = now_ns - TEN_MINUTES_NS;
            state.history.retain(|(ts, _)| *ts >= cutoff);
        }
    }

    /// Ask the worker for a recompute; returns immediately.
    pub fn request_recompute(&self) {
        let mut state = self.inner.state.lock();
        if state.resetting {
            return;
        }
        state.run = true;
        self.inner.cv.notify_one();
    }

    /// Latest computed metrics.
    pub fn metrics(&self) -> Vec<Metric> {
        self.inner.state.lock().metrics.clone()
    }

    /// Drop the history (keybind action).
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.resetting = true;
        state.history.clear();
        for metric in &mut state.metrics {
            metric.value = 0.0;
        }
        state.resetting = false;
    }

    fn calculate(inner: &Inner) {
        loop {
            let mut state = inner.state.lock();
            inner.cv.wait_while(&mut state, |s| !s.run);
            if state.terminate {
                break;
            }

            let mut sorted: Vec<f32> = state.history.iter().map(|(_, fps)| *fps).collect();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let sum: f32 = sorted.iter().sum();

            let mut kept = Vec::with_capacity(state.metrics.len());
            for mut metric in state.metrics.drain(..) {
                if metric.name == "AVG" {
                    metric.display_name = metric.name.clone();
                    if !sorted.is_empty() {
                        metric.value = sum / sorted.len() as f32;
                    }
                    kept.push(metric);
                    continue;
                }
                match metric.name.parse::<f32>() {
                    Ok(fraction) if fraction > 0.0 && fraction < 1.0 => {
                        metric.display_name = display_name(fraction);
                        metric.value = percentile(&sorted, fraction);
                        kept.push(metric);
                    }
                    _ => {
                        log::debug!("dropping out-of-range fps metric '{}'", metric.name);
                    }
                }
            }
            state.metrics = kept;
            state.run = false;
        }
    }
}

impl Drop for FpsMetrics {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.terminate = true;
            state.run = true;
        }
        self.inner.cv.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settle(metrics: &FpsMetrics) -> Vec<Metric> {
        metrics.request_recompute();
        // The worker owns the recompute; wait for it to clear the run flag.
        for _ in 0..200 {
            {
                let state = metrics.inner.state.lock();
                if !state.run {
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        metrics.metrics()
    }

    #[test]
    fn percentile_law_over_1_to_100() {
        let metrics = FpsMetrics::new(&[
            "AVG".to_string(),
            "0.97".to_string(),
            "0.01".to_string(),
            "0.001".to_string(),
        ]);
        for i in 1..=100u64 {
            metrics.update(i * 1_000_000, i as f64);
        }
        let computed = settle(&metrics);
        let by_name = |name: &str| {
            computed
                .iter()
                .find(|m| m.name == name)
                .unwrap_or_else(|| panic!("missing {name}"))
                .clone()
        };

        let avg = by_name("AVG");
        assert!((avg.value - 50.5).abs() < 0.01);
        assert_eq!(avg.display_name, "AVG");

        let p97 = by_name("0.97");
        assert_eq!(p97.value, 97.0);
        assert_eq!(p97.display_name, "97%");
    }

    #[test]
    fn invalid_percentiles_are_dropped() {
        let metrics = FpsMetrics::new(&[
            "0.97".to_string(),
            "1.5".to_string(),
            "0".to_string(),
            "banana".to_string(),
        ]);
        metrics.update(0, 60.0);
        let computed = settle(&metrics);
        assert_eq!(computed.len(), 1);
        assert_eq!(computed[0].name, "0.97");
    }

    #[test]
    fn display_names() {
        assert_eq!(display_name(0.97), "97%");
        assert_eq!(display_name(0.01), "1%");
        assert_eq!(display_name(0.001), "0.1%");
    }

    #[test]
    fn history_is_trimmed_to_ten_minutes() {
        let metrics = FpsMetrics::new(&["AVG".to_string()]);
        metrics.update(0, 10.0);
        metrics.update(TEN_MINUTES_NS + 1_000_000_000, 20.0);
        let state = metrics.inner.state.lock();
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.history[0].1, 20.0);
    }

    #[test]
    fn percent_label_translation() {
        let metrics = FpsMetrics::from_percent_labels(&[
            "97".to_string(),
            "AVG".to_string(),
            "0.1".to_string(),
        ]);
        let state = metrics.inner.state.lock();
        assert_eq!(state.metrics[0].name, "0.97");
        assert_eq!(state.metrics[1].name, "AVG");
        assert_eq!(state.metrics[2].name, "0.001");
    }
}
