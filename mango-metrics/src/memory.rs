//! `/proc/meminfo` reduction into RAM/swap usage.

use std::fs;
use std::path::Path;

use types::MemorySnapshot;

use crate::MetricsError;

const KIB_PER_GIB: f32 = 1024.0 * 1024.0;

fn field_kib(contents: &str, key: &str) -> Option<u64> {
    contents
        .lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_ascii_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

pub fn parse_meminfo(contents: &str) -> Result<MemorySnapshot, MetricsError> {
    let total = field_kib(contents, "MemTotal:").ok_or_else(|| MetricsError::Parse {
        path: "/proc/meminfo".into(),
        reason: "missing MemTotal".into(),
    })?;
    // MemAvailable is absent on very old kernels; fall back to MemFree.
    let available =
        field_kib(contents, "MemAvailable:").or_else(|| field_kib(contents, "MemFree:"));
    let swap_total = field_kib(contents, "SwapTotal:").unwrap_or(0);
    let swap_free = field_kib(contents, "SwapFree:").unwrap_or(0);

    let used = total.saturating_sub(available.unwrap_or(0));
    Ok(MemorySnapshot {
        ram_used_gib: used as f32 / KIB_PER_GIB,
        ram_total_gib: total as f32 / KIB_PER_GIB,
        swap_used_gib: swap_total.saturating_sub(swap_free) as f32 / KIB_PER_GIB,
    })
}

pub fn read(path: &Path) -> Result<MemorySnapshot, MetricsError> {
    let contents =
        fs::read_to_string(path).map_err(|e| MetricsError::io(path.display().to_string(), e))?;
    parse_meminfo(&contents)
}

pub fn read_system() -> Result<MemorySnapshot, MetricsError> {
    read(Path::new("/proc/meminfo"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_reduction() {
        let contents = "\
MemTotal:       16384000 kB
MemFree:         2048000 kB
MemAvailable:    8192000 kB
SwapTotal:       4194304 kB
SwapFree:        3145728 kB
";
        let snap = parse_meminfo(contents).unwrap();
        assert!((snap.ram_total_gib - 15.625).abs() < 0.001);
        assert!((snap.ram_used_gib - 7.8125).abs() < 0.001);
        assert!((snap.swap_used_gib - 1.0).abs() < 0.001);
    }

    #[test]
    fn missing_total_is_an_error() {
        assert!(parse_meminfo("MemFree: 1 kB\n").is_err());
    }
}
