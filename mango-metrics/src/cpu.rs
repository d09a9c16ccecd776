//! CPU sampler: `/proc/stat` jiffy deltas, `/proc/cpuinfo` clocks and the
//! package temperature from hwmon.

use std::fs;
use std::path::{Path, PathBuf};

use types::{CpuCoreSnapshot, CpuSnapshot};

use crate::MetricsError;

/// hwmon names that report a usable CPU package temperature.
const CPU_TEMP_SENSORS: &[&str] = &["coretemp", "k10temp", "zenpower"];

/// Raw jiffy counters for one `cpu` line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
    pub guestnice: u64,
}

impl CpuTimes {
    /// Guest time is already accounted in user time.
    fn normalized(mut self) -> Self {
        self.user = self.user.saturating_sub(self.guest);
        self.nice = self.nice.saturating_sub(self.guestnice);
        self
    }

    fn total(&self) -> u64 {
        let system_all = self.system + self.irq + self.softirq;
        let idle_all = self.idle + self.iowait;
        let virt_all = self.guest + self.guestnice;
        self.user + self.nice + system_all + idle_all + self.steal + virt_all
    }
}

/// Busy percentage between two readings of the same CPU line.
///
/// `/proc/stat` counters can be observed going backwards after a subtraction
/// the kernel rounds down, so every delta saturates at zero.
pub fn busy_percent(prev: &CpuTimes, cur: &CpuTimes) -> f32 {
    let prev = prev.normalized();
    let cur = cur.normalized();

    let total = cur.total().saturating_sub(prev.total());
    if total == 0 {
        return 0.0;
    }

    let busy = cur.user.saturating_sub(prev.user)
        + cur.nice.saturating_sub(prev.nice)
        + (cur.system + cur.irq + cur.softirq)
            .saturating_sub(prev.system + prev.irq + prev.softirq)
        + cur.steal.saturating_sub(prev.steal)
        + (cur.guest + cur.guestnice).saturating_sub(prev.guest + prev.guestnice);

    (busy as f32 * 100.0 / total as f32).clamp(0.0, 100.0)
}

fn parse_stat_line(line: &str) -> Option<CpuTimes> {
    let mut fields = line.split_ascii_whitespace().skip(1);
    let mut next = || fields.next().and_then(|f| f.parse::<u64>().ok());
    Some(CpuTimes {
        user: next()?,
        nice: next()?,
        system: next()?,
        idle: next()?,
        iowait: next().unwrap_or(0),
        irq: next().unwrap_or(0),
        softirq: next().unwrap_or(0),
        steal: next().unwrap_or(0),
        guest: next().unwrap_or(0),
        guestnice: next().unwrap_or(0),
    })
}

/// Parse a full `/proc/stat` dump into (aggregate, per-core) counters.
pub fn parse_proc_stat(contents: &str) -> Result<(CpuTimes, Vec<CpuTimes>), MetricsError> {
    let mut aggregate = None;
    let mut cores = Vec::new();
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("cpu") {
            let times = parse_stat_line(line).ok_or_else(|| MetricsError::Parse {
                path: "/proc/stat".into(),
                reason: format!("bad cpu line: {line}"),
            })?;
            if rest.starts_with(' ') {
                aggregate = Some(times);
            } else {
                cores.push(times);
            }
        } else {
            break;
        }
    }
    let aggregate = aggregate.ok_or_else(|| MetricsError::Parse {
        path: "/proc/stat".into(),
        reason: "missing aggregate cpu line".into(),
    })?;
    Ok((aggregate, cores))
}

/// Pull the per-core MHz values out of `/proc/cpuinfo`.
pub fn parse_cpuinfo_mhz(contents: &str) -> Vec<u32> {
    contents
        .lines()
        .filter(|line| line.starts_with("cpu MHz"))
        .filter_map(|line| line.split(':').nth(1))
        .filter_map(|value| value.trim().parse::<f32>().ok())
        .map(|mhz| mhz as u32)
        .collect()
}

/// Find the temp1_input path of the first hwmon with a known CPU sensor name.
pub fn find_cpu_temp_sensor(hwmon_root: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(hwmon_root).ok()?;
    for entry in entries.flatten() {
        let name_path = entry.path().join("name");
        let Ok(name) = fs::read_to_string(&name_path) else {
            continue;
        };
        if CPU_TEMP_SENSORS.contains(&name.trim()) {
            let temp = entry.path().join("temp1_input");
            if temp.exists() {
                return Some(temp);
            }
        }
    }
    None
}

/// Stateful `/proc/stat` poller.
pub struct CpuStats {
    prev_aggregate: CpuTimes,
    prev_cores: Vec<CpuTimes>,
    temp_path: Option<PathBuf>,
    proc_stat: PathBuf,
    proc_cpuinfo: PathBuf,
}

impl CpuStats {
    pub fn new() -> Result<Self, MetricsError> {
        Self::with_paths(
            PathBuf::from("/proc/stat"),
            PathBuf::from("/proc/cpuinfo"),
            Path::new("/sys/class/hwmon"),
        )
    }

    pub fn with_paths(
        proc_stat: PathBuf,
        proc_cpuinfo: PathBuf,
        hwmon_root: &Path,
    ) -> Result<Self, MetricsError> {
        let contents = fs::read_to_string(&proc_stat)
            .map_err(|e| MetricsError::io(proc_stat.display().to_string(), e))?;
        let (aggregate, cores) = parse_proc_stat(&contents)?;
        let temp_path = find_cpu_temp_sensor(hwmon_root);
        if temp_path.is_none() {
            log::info!("could not find a cpu temp sensor under {hwmon_root:?}");
        }
        Ok(Self {
            prev_aggregate: aggregate,
            prev_cores: cores,
            temp_path,
            proc_stat,
            proc_cpuinfo,
        })
    }

    /// One polling tick: re-read the proc files and produce a snapshot.
    pub fn update(&mut self) -> Result<CpuSnapshot, MetricsError> {
        let contents = fs::read_to_string(&self.proc_stat)
            .map_err(|e| MetricsError::io(self.proc_stat.display().to_string(), e))?;
        let (aggregate, cores) = parse_proc_stat(&contents)?;

        let mhz = fs::read_to_string(&self.proc_cpuinfo)
            .map(|s| parse_cpuinfo_mhz(&s))
            .unwrap_or_default();

        let mut snapshot = CpuSnapshot {
            total_percent: busy_percent(&self.prev_aggregate, &aggregate),
            temp_c: self.read_temp(),
            power_w: 0.0,
            cores: Vec::with_capacity(cores.len()),
        };

        for (i, core) in cores.iter().enumerate() {
            let prev = self.prev_cores.get(i).copied().unwrap_or_default();
            snapshot.cores.push(CpuCoreSnapshot {
                total: core.total(),
                user: core.user,
                nice: core.nice,
                system: core.system,
                idle: core.idle,
                iowait: core.iowait,
                irq: core.irq,
                softirq: core.softirq,
                steal: core.steal,
                guest: core.guest,
                guestnice: core.guestnice,
                percent: busy_percent(&prev, core),
                mhz: mhz.get(i).copied().unwrap_or(0),
            });
        }

        self.prev_aggregate = aggregate;
        self.prev_cores = cores;
        Ok(snapshot)
    }

    fn read_temp(&self) -> i32 {
        let Some(path) = &self.temp_path else {
            return 0;
        };
        fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
            .map(|millideg| millideg / 1000)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "\
cpu  100 10 50 800 20 5 5 10 0 0
cpu0 50 5 25 400 10 2 3 5 0 0
cpu1 50 5 25 400 10 3 2 5 0 0
intr 12345
ctxt 6789
";

    #[test]
    fn parses_aggregate_and_cores() {
        let (agg, cores) = parse_proc_stat(STAT).unwrap();
        assert_eq!(agg.user, 100);
        assert_eq!(agg.idle, 800);
        assert_eq!(cores.len(), 2);
        assert_eq!(cores[1].irq, 3);
    }

    #[test]
    fn busy_percent_counts_non_idle_time() {
        let prev = CpuTimes::default();
        let cur = CpuTimes {
            user: 30,
            nice: 0,
            system: 20,
            idle: 50,
            ..Default::default()
        };
        let percent = busy_percent(&prev, &cur);
        assert!((percent - 50.0).abs() < 0.01, "{percent}");
    }

    #[test]
    fn busy_percent_saturates_on_counter_rollback() {
        let prev = CpuTimes {
            user: 100,
            idle: 100,
            ..Default::default()
        };
        let cur = CpuTimes {
            user: 90, // rolled back
            idle: 150,
            ..Default::default()
        };
        let percent = busy_percent(&prev, &cur);
        assert!((0.0..=100.0).contains(&percent));
    }

    #[test]
    fn busy_percent_is_clamped() {
        let prev = CpuTimes::default();
        let cur = CpuTimes {
            user: u64::MAX / 2,
            ..Default::default()
        };
        assert!(busy_percent(&prev, &cur) <= 100.0);
    }

    #[test]
    fn cpuinfo_mhz_extraction() {
        let cpuinfo = "\
processor\t: 0
cpu MHz\t\t: 3393.624
processor\t: 1
cpu MHz\t\t: 1200.000
";
        assert_eq!(parse_cpuinfo_mhz(cpuinfo), vec![3393, 1200]);
    }

    #[test]
    fn hwmon_sensor_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let hwmon0 = dir.path().join("hwmon0");
        std::fs::create_dir(&hwmon0).unwrap();
        std::fs::write(hwmon0.join("name"), "acpitz\n").unwrap();
        let hwmon1 = dir.path().join("hwmon1");
        std::fs::create_dir(&hwmon1).unwrap();
        std::fs::write(hwmon1.join("name"), "k10temp\n").unwrap();
        std::fs::write(hwmon1.join("temp1_input"), "45000\n").unwrap();

        let found = find_cpu_temp_sensor(dir.path()).unwrap();
        assert_eq!(found, hwmon1.join("temp1_input"));
    }
}
