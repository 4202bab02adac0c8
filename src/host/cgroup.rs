//! cgroup CPU quota (v1 `cpu.cfs_*`, v2 `cpu.max`).

use super::{CgroupLoader, CpuController};
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Default CFS period in microseconds.
const DEFAULT_PERIOD_US: u64 = 100_000;

/// Finds a process's cgroup through procfs.
#[derive(Debug, Clone)]
pub struct Cgroups {
    proc_root: PathBuf,
    cgroup_root: PathBuf,
}

impl Cgroups {
    /// Use procfs and the cgroup filesystem at the given mount points.
    pub fn new(proc_root: &Path, cgroup_root: &Path) -> Self {
        Self {
            proc_root: proc_root.to_path_buf(),
            cgroup_root: cgroup_root.to_path_buf(),
        }
    }
}

impl CgroupLoader for Cgroups {
    fn load(&self, pid: u32) -> Result<Box<dyn CpuController>> {
        let path = self.proc_root.join(pid.to_string()).join("cgroup");
        let text = fs::read_to_string(&path).map_err(|e| {
            Error::host(format!("cgroup of pid {}", pid), e.to_string())
        })?;

        let mut unified = None;
        for line in text.lines() {
            let mut fields = line.splitn(3, ':');
            let (Some(_), Some(controllers), Some(group)) = (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let group = group.trim_start_matches('/');
            if controllers.split(',').any(|c| c == "cpu") {
                let dir = self.cgroup_root.join(controllers).join(group);
                tracing::debug!(pid, dir = %dir.display(), "cgroup v1 cpu controller");
                return Ok(Box::new(CgroupCpu::V1(dir)));
            }
            if controllers.is_empty() {
                unified = Some(self.cgroup_root.join(group));
            }
        }

        match unified {
            Some(dir) => {
                tracing::debug!(pid, dir = %dir.display(), "cgroup v2 cpu controller");
                Ok(Box::new(CgroupCpu::V2(dir)))
            }
            None => Err(Error::host(
                format!("cgroup of pid {}", pid),
                "no cpu controller",
            )),
        }
    }
}

/// CPU controller directory of one cgroup.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CgroupCpu {
    V1(PathBuf),
    V2(PathBuf),
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| Error::host(path.display().to_string(), e.to_string()))
}

fn write(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).map_err(|e| Error::host(path.display().to_string(), e.to_string()))
}

fn parse_num(path: &Path, value: &str) -> Result<i64> {
    value
        .parse()
        .map_err(|_| Error::host(path.display().to_string(), format!("unexpected value '{}'", value)))
}

fn to_percent(quota_us: i64, period_us: i64) -> Option<u32> {
    if quota_us < 0 || period_us <= 0 {
        return None;
    }
    Some((quota_us * 100 / period_us) as u32)
}

impl CpuController for CgroupCpu {
    fn cpu_quota(&self) -> Result<Option<u32>> {
        match self {
            CgroupCpu::V1(dir) => {
                let quota_file = dir.join("cpu.cfs_quota_us");
                let period_file = dir.join("cpu.cfs_period_us");
                let quota = parse_num(&quota_file, &read(&quota_file)?)?;
                let period = parse_num(&period_file, &read(&period_file)?)?;
                Ok(to_percent(quota, period))
            }
            CgroupCpu::V2(dir) => {
                let file = dir.join("cpu.max");
                let value = read(&file)?;
                let (quota, period) = value.split_once(' ').unwrap_or((value.as_str(), "100000"));
                if quota == "max" {
                    return Ok(None);
                }
                Ok(to_percent(parse_num(&file, quota)?, parse_num(&file, period)?))
            }
        }
    }

    fn set_cpu_quota(&self, quota: Option<u32>) -> Result<()> {
        match self {
            CgroupCpu::V1(dir) => {
                let period_file = dir.join("cpu.cfs_period_us");
                let period = match read(&period_file) {
                    Ok(v) => parse_num(&period_file, &v)? as u64,
                    Err(_) => DEFAULT_PERIOD_US,
                };
                let value = match quota {
                    Some(q) => (u64::from(q) * period / 100).to_string(),
                    None => "-1".to_string(),
                };
                write(&dir.join("cpu.cfs_quota_us"), &value)
            }
            CgroupCpu::V2(dir) => {
                let file = dir.join("cpu.max");
                let period = read(&file)
                    .ok()
                    .and_then(|v| v.split_once(' ').and_then(|(_, p)| p.parse::<u64>().ok()))
                    .unwrap_or(DEFAULT_PERIOD_US);
                let value = match quota {
                    Some(q) => format!("{} {}", u64::from(q) * period / 100, period),
                    None => format!("max {}", period),
                };
                write(&file, &value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc_cgroup(root: &Path, pid: u32, content: &str) {
        let dir = root.join("proc").join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("cgroup"), content).unwrap();
    }

    #[test]
    fn test_v2_quota_round_trip() {
        let root = tempfile::tempdir().unwrap();
        proc_cgroup(root.path(), 100, "0::/machine/vm1\n");
        let group = root.path().join("cgroup/machine/vm1");
        fs::create_dir_all(&group).unwrap();
        fs::write(group.join("cpu.max"), "max 100000\n").unwrap();

        let cgroups = Cgroups::new(&root.path().join("proc"), &root.path().join("cgroup"));
        let cpu = cgroups.load(100).unwrap();
        assert_eq!(cpu.cpu_quota().unwrap(), None);

        cpu.set_cpu_quota(Some(150)).unwrap();
        assert_eq!(fs::read_to_string(group.join("cpu.max")).unwrap(), "150000 100000");
        assert_eq!(cpu.cpu_quota().unwrap(), Some(150));

        cpu.set_cpu_quota(None).unwrap();
        assert_eq!(cpu.cpu_quota().unwrap(), None);
    }

    #[test]
    fn test_v1_controller_preferred() {
        let root = tempfile::tempdir().unwrap();
        proc_cgroup(
            root.path(),
            200,
            "12:memory:/vm2\n4:cpu,cpuacct:/machine/vm2\n0::/vm2\n",
        );
        let group = root.path().join("cgroup/cpu,cpuacct/machine/vm2");
        fs::create_dir_all(&group).unwrap();
        fs::write(group.join("cpu.cfs_quota_us"), "50000\n").unwrap();
        fs::write(group.join("cpu.cfs_period_us"), "100000\n").unwrap();

        let cgroups = Cgroups::new(&root.path().join("proc"), &root.path().join("cgroup"));
        let cpu = cgroups.load(200).unwrap();
        assert_eq!(cpu.cpu_quota().unwrap(), Some(50));

        cpu.set_cpu_quota(None).unwrap();
        assert_eq!(fs::read_to_string(group.join("cpu.cfs_quota_us")).unwrap(), "-1");
        assert_eq!(cpu.cpu_quota().unwrap(), None);
    }

    #[test]
    fn test_missing_process() {
        let root = tempfile::tempdir().unwrap();
        let cgroups = Cgroups::new(root.path(), root.path());
        assert!(matches!(cgroups.load(1), Err(Error::Host { .. })));
    }
}
