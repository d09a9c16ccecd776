//! Benchmark logger.
//!
//! While a run is active every present (or a periodic worker, when
//! `log_interval` is set) appends a row with the current snapshot. Stopping
//! the run writes two CSV files into the output folder: the full row dump
//! and a one-line summary with the usual benchmark percentiles.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// One sampled row.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LogRow {
    pub fps: f64,
    pub frametime_ns: u64,
    pub cpu_load: f32,
    pub gpu_load: u32,
    pub cpu_temp: i32,
    pub gpu_temp: i32,
    pub gpu_core_clock: u32,
    pub gpu_mem_clock: u32,
    pub gpu_vram_used_gib: f32,
    pub gpu_power_w: f32,
    pub ram_used_gib: f32,
    pub elapsed_ns: u64,
}

/// The six summary columns.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Summary {
    pub min_0_1_fps: f32,
    pub min_1_fps: f32,
    pub p97_fps: f32,
    pub avg_fps: f32,
    pub gpu_load: f32,
    pub cpu_load: f32,
}

/// Mean of the lowest `ceil(n * fraction)` samples of an ascending sort.
fn low_percentile_mean(sorted: &[f32], fraction: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let count = ((sorted.len() as f32 * fraction).ceil() as usize).clamp(1, sorted.len());
    sorted[..count].iter().sum::<f32>() / count as f32
}

/// Compute the summary over a finished run.
pub fn summarize(rows: &[LogRow]) -> Summary {
    if rows.is_empty() {
        return Summary::default();
    }
    let mut sorted: Vec<f32> = rows.iter().map(|row| row.fps as f32).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let n = rows.len() as f32;
    Summary {
        min_0_1_fps: low_percentile_mean(&sorted, 0.001),
        min_1_fps: low_percentile_mean(&sorted, 0.01),
        p97_fps: crate::fps_metrics::percentile(&sorted, 0.97),
        avg_fps: sorted.iter().sum::<f32>() / n,
        gpu_load: rows.iter().map(|row| row.gpu_load as f32).sum::<f32>() / n,
        cpu_load: rows.iter().map(|row| row.cpu_load).sum::<f32>() / n,
    }
}

pub const CSV_HEADER: &str = "fps,frametime,cpu_load,gpu_load,cpu_temp,gpu_temp,\
gpu_core_clock,gpu_mem_clock,gpu_vram_used,gpu_power,ram_used,elapsed";

pub const SUMMARY_HEADER: &str =
    "0.1% Min FPS,1% Min FPS,97% Percentile FPS,Average FPS,GPU Load,CPU Load";

pub fn write_csv<W: Write>(out: &mut W, rows: &[LogRow]) -> io::Result<()> {
    writeln!(out, "{CSV_HEADER}")?;
    for row in rows {
        writeln!(
            out,
            "{:.1},{},{:.1},{},{},{},{},{},{:.3},{:.1},{:.3},{}",
            row.fps,
            row.frametime_ns,
            row.cpu_load,
            row.gpu_load,
            row.cpu_temp,
            row.gpu_temp,
            row.gpu_core_clock,
            row.gpu_mem_clock,
            row.gpu_vram_used_gib,
            row.gpu_power_w,
            row.ram_used_gib,
            row.elapsed_ns,
        )?;
    }
    Ok(())
}

pub fn write_summary<W: Write>(out: &mut W, summary: &Summary) -> io::Result<()> {
    writeln!(out, "{SUMMARY_HEADER}")?;
    writeln!(
        out,
        "{:.1},{:.1},{:.1},{:.1},{:.1},{:.1}",
        summary.min_0_1_fps,
        summary.min_1_fps,
        summary.p97_fps,
        summary.avg_fps,
        summary.gpu_load,
        summary.cpu_load,
    )
}

/// `<program>_<YYYY-MM-DD_HH-MM-SS>` stem for the output files.
fn log_stem(program: &str) -> String {
    // Wall-clock suffix, local time; formatted without chrono to keep the
    // ambient stack small.
    let now = unsafe {
        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        libc::gettimeofday(&mut tv, std::ptr::null_mut());
        let mut tm: libc::tm = std::mem::zeroed();
        libc::localtime_r(&tv.tv_sec, &mut tm);
        tm
    };
    format!(
        "{program}_{:04}-{:02}-{:02}_{:02}-{:02}-{:02}",
        now.tm_year + 1900,
        now.tm_mon + 1,
        now.tm_mday,
        now.tm_hour,
        now.tm_min,
        now.tm_sec,
    )
}

pub struct Logger {
    rows: Vec<LogRow>,
    active: bool,
    start_ns: u64,
    end_ns: u64,
    log_files: Vec<PathBuf>,
    /// Stop automatically once this much time has passed (0 = never).
    log_duration_ns: u64,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            active: false,
            start_ns: 0,
            end_ns: 0,
            log_files: Vec::new(),
            log_duration_ns: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn start_ns(&self) -> u64 {
        self.start_ns
    }

    pub fn rows(&self) -> &[LogRow] {
        &self.rows
    }

    pub fn log_files(&self) -> &[PathBuf] {
        &self.log_files
    }

    /// Begin a run with an empty row buffer.
    pub fn start(&mut self, now_ns: u64, log_duration_s: u64) {
        if self.active {
            return;
        }
        self.rows.clear();
        self.active = true;
        self.start_ns = now_ns;
        self.log_duration_ns = log_duration_s * 1_000_000_000;
    }

    /// Append one row while active. Returns `true` when `log_duration`
    /// elapsed and the caller should stop the run.
    pub fn try_log(&mut self, mut row: LogRow, now_ns: u64) -> bool {
        if !self.active {
            return false;
        }
        row.elapsed_ns = now_ns.saturating_sub(self.start_ns);
        self.rows.push(row);
        self.log_duration_ns != 0 && row.elapsed_ns >= self.log_duration_ns
    }

    /// Stop the run and write both CSV files.
    ///
    /// Returns the full-log path on success; with no output folder the rows
    /// are simply dropped (HUD-only benchmark).
    pub fn stop(
        &mut self,
        now_ns: u64,
        program: &str,
        output_folder: Option<&Path>,
    ) -> io::Result<Option<PathBuf>> {
        if !self.active {
            return Ok(None);
        }
        self.active = false;
        self.end_ns = now_ns;

        let Some(folder) = output_folder else {
            self.rows.clear();
            return Ok(None);
        };

        let stem = log_stem(program);
        let full_path = folder.join(format!("{stem}.csv"));
        let summary_path = folder.join(format!("{stem}_summary.csv"));

        let summary = summarize(&self.rows);
        {
            let mut out = BufWriter::new(File::create(&summary_path)?);
            write_summary(&mut out, &summary)?;
        }
        {
            let mut out = BufWriter::new(File::create(&full_path)?);
            write_csv(&mut out, &self.rows)?;
        }

        log::info!(
            "wrote log file '{}' ({} rows)",
            full_path.display(),
            self.rows.len()
        );
        self.rows.clear();
        self.log_files.push(full_path.clone());
        Ok(Some(full_path))
    }
}

const UPLOAD_ENDPOINT: &str = "https://flightlessmango.com/logs";

/// Upload log files with curl and open the resulting URL.
///
/// Runs on a throwaway thread; `LD_PRELOAD` is removed from the child
/// environment so the helpers do not get re-injected.
pub fn upload(files: Vec<PathBuf>) {
    if files.is_empty() {
        return;
    }
    std::thread::Builder::new()
        .name("mangohud-upload".into())
        .spawn(move || {
            let mut command = Command::new("curl");
            command
                .args([
                    "--include",
                    "--request",
                    "POST",
                    UPLOAD_ENDPOINT,
                    "-F",
                    "log[game_id]=26506",
                    "-F",
                    "log[user_id]=176",
                    "-F",
                    "attachment=true",
                    "-A",
                    "mangohud",
                ])
                .env_remove("LD_PRELOAD")
                .stdout(Stdio::piped())
                .stderr(Stdio::null());
            for file in &files {
                command.arg("-F");
                command.arg(format!("log[uploads][]=@{}", file.display()));
            }

            let output = match command.output() {
                Ok(output) => output,
                Err(err) => {
                    log::warn!("log upload failed to spawn curl: {err}");
                    return;
                }
            };

            let body = String::from_utf8_lossy(&output.stdout);
            let Some(url) = body
                .lines()
                .find_map(|line| line.strip_prefix("Location: "))
                .map(str::trim)
            else {
                log::warn!("log upload got no Location header");
                return;
            };

            let _ = Command::new("xdg-open")
                .arg(url)
                .env_remove("LD_PRELOAD")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();
        })
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fps_rows(fps: &[f64]) -> Vec<LogRow> {
        fps.iter()
            .map(|&fps| LogRow {
                fps,
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn percentile_summary_matches_the_benchmark_rules() {
        // 10 samples: {120, 60, 60, 60, 30, 60, 60, 60, 60, 60}
        let rows = fps_rows(&[120.0, 60.0, 60.0, 60.0, 30.0, 60.0, 60.0, 60.0, 60.0, 60.0]);
        let summary = summarize(&rows);
        assert_eq!(summary.min_0_1_fps, 30.0);
        assert_eq!(summary.min_1_fps, 30.0);
        assert_eq!(summary.p97_fps, 120.0);
        assert!((summary.avg_fps - 63.0).abs() < 0.001);
    }

    #[test]
    fn low_percentile_mean_averages_the_lowest_bucket() {
        let sorted: Vec<f32> = (1..=100).map(|i| i as f32).collect();
        // ceil(100 * 0.001) = 1 sample
        assert_eq!(low_percentile_mean(&sorted, 0.001), 1.0);
        // ceil(100 * 0.01) = 1 sample
        assert_eq!(low_percentile_mean(&sorted, 0.01), 1.0);
        // ceil(100 * 0.05) = 5 samples -> mean(1..=5) = 3
        assert_eq!(low_percentile_mean(&sorted, 0.05), 3.0);
    }

    #[test]
    fn csv_format() {
        let rows = vec![LogRow {
            fps: 59.94,
            frametime_ns: 16_683_000,
            cpu_load: 12.5,
            gpu_load: 88,
            cpu_temp: 55,
            gpu_temp: 71,
            gpu_core_clock: 2165,
            gpu_mem_clock: 1000,
            gpu_vram_used_gib: 3.25,
            gpu_power_w: 180.0,
            ram_used_gib: 10.5,
            elapsed_ns: 1_000_000_000,
        }];
        let mut out = Vec::new();
        write_csv(&mut out, &rows).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), CSV_HEADER);
        assert_eq!(
            lines.next().unwrap(),
            "59.9,16683000,12.5,88,55,71,2165,1000,3.250,180.0,10.500,1000000000"
        );
    }

    #[test]
    fn summary_file_format() {
        let mut out = Vec::new();
        write_summary(
            &mut out,
            &Summary {
                min_0_1_fps: 30.0,
                min_1_fps: 30.0,
                p97_fps: 120.0,
                avg_fps: 63.0,
                gpu_load: 85.5,
                cpu_load: 30.25,
            },
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            format!("{SUMMARY_HEADER}\n30.0,30.0,120.0,63.0,85.5,30.3\n")
        );
    }

    #[test]
    fn run_lifecycle_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = Logger::new();
        logger.start(1_000, 0);
        assert!(logger.is_active());

        for i in 0..5u64 {
            let done = logger.try_log(
                LogRow {
                    fps: 60.0,
                    ..Default::default()
                },
                1_000 + i * 16_000_000,
            );
            assert!(!done);
        }

        let path = logger
            .stop(100_000_000, "vkcube", Some(dir.path()))
            .unwrap()
            .unwrap();
        assert!(!logger.is_active());
        assert!(path.exists());
        let summary_path = path.with_file_name(format!(
            "{}_summary.csv",
            path.file_stem().unwrap().to_string_lossy()
        ));
        assert!(summary_path.exists());
        assert_eq!(logger.log_files(), &[path]);
    }

    #[test]
    fn log_duration_requests_stop() {
        let mut logger = Logger::new();
        logger.start(0, 1); // one second
        assert!(!logger.try_log(LogRow::default(), 500_000_000));
        assert!(logger.try_log(LogRow::default(), 1_000_000_000));
    }

    #[test]
    fn elapsed_is_relative_to_start() {
        let mut logger = Logger::new();
        logger.start(5_000, 0);
        logger.try_log(LogRow::default(), 6_000);
        assert_eq!(logger.rows()[0].elapsed_ns, 1_000);
    }
}
