//! cgroup v2 filesystem implementation of [`CGroupPort`].

use super::CGroupPort;
use crate::domain::counters::RawCounters;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Default parent of every gateway-managed cgroup, mirroring the real cgroup
/// v2 mount. Tests substitute a tempdir for `root` so the same logic runs
/// without root or a live kernel mount.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

pub struct LinuxCGroup {
    path: PathBuf,
}

impl LinuxCGroup {
    /// `root` is the cgroup v2 mount point (`/sys/fs/cgroup` in production);
    /// the handle owns `{root}/metric_gateway/{id}`.
    pub fn new(root: impl AsRef<Path>, id: &str) -> Self {
        Self {
            path: root.as_ref().join("metric_gateway").join(id),
        }
    }

    fn parent(&self) -> &Path {
        self.path.parent().expect("cgroup path always has a parent")
    }

    fn read_file(&self, name: &str) -> Result<String> {
        std::fs::read_to_string(self.path.join(name)).map_err(GatewayError::CGroupError)
    }

    fn write_file(&self, name: &str, contents: &str) -> Result<()> {
        std::fs::write(self.path.join(name), contents).map_err(GatewayError::CGroupError)
    }

    /// Parses a cgroup v2 limit file's contents, mapping the `max` sentinel
    /// string to [`u64::MAX`].
    fn parse_limit(value: &str) -> Result<u64> {
        let value = value.trim();
        if value == "max" {
            return Ok(u64::MAX);
        }
        value.parse().map_err(|_| {
            GatewayError::CGroupError(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unparseable cgroup limit value: {value:?}"),
            ))
        })
    }

    fn parse_u64(value: &str) -> Result<u64> {
        value.trim().parse().map_err(|_| {
            GatewayError::CGroupError(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unparseable cgroup counter value: {value:?}"),
            ))
        })
    }

    /// cgroup v2 has no direct per-cgroup kernel-memory counter; this sums
    /// `slab` and `kernel_stack` out of `memory.stat` as the closest native
    /// approximation of kernel-attributed memory.
    fn read_kernel_memory(&self) -> Result<u64> {
        let contents = self.read_file("memory.stat")?;
        let mut slab = 0u64;
        let mut kernel_stack = 0u64;
        for line in contents.lines() {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("slab"), Some(value)) => slab = Self::parse_u64(value)?,
                (Some("kernel_stack"), Some(value)) => kernel_stack = Self::parse_u64(value)?,
                _ => {}
            }
        }
        Ok(slab + kernel_stack)
    }

    fn read_cpu_usage_usec(&self) -> Result<u64> {
        let contents = self.read_file("cpu.stat")?;
        for line in contents.lines() {
            if let Some(value) = line.strip_prefix("usage_usec ") {
                return Self::parse_u64(value);
            }
        }
        Err(GatewayError::CGroupError(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "usage_usec missing from cpu.stat",
        )))
    }
}

#[async_trait]
impl CGroupPort for LinuxCGroup {
    async fn create(&self, _id: &str) -> Result<()> {
        std::fs::create_dir_all(self.parent()).map_err(GatewayError::CGroupError)?;
        match std::fs::create_dir(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(GatewayError::CGroupError(e)),
        }
    }

    async fn attach(&self, pid: u32) -> Result<()> {
        self.write_file("cgroup.procs", &pid.to_string())
    }

    async fn has_process(&self) -> Result<bool> {
        let contents = self.read_file("cgroup.procs")?;
        Ok(!contents.trim().is_empty())
    }

    async fn read_counters(&self) -> Result<RawCounters> {
        let cpu_usage_ns = self.read_cpu_usage_usec()? * 1_000;
        let memory_current = Self::parse_u64(&self.read_file("memory.current")?)?;
        let memory_limit = Self::parse_limit(&self.read_file("memory.max")?)?;
        let swap_current = Self::parse_u64(&self.read_file("memory.swap.current")?)?;
        let swap_limit = Self::parse_limit(&self.read_file("memory.swap.max")?)?;
        let kernel_memory = self.read_kernel_memory()?;
        let pids_current: u32 = Self::parse_u64(&self.read_file("pids.current")?)? as u32;
        let pids_limit = Self::parse_limit(&self.read_file("pids.max")?)?;

        Ok(RawCounters {
            cpu_usage_ns,
            memory_current,
            memory_limit,
            swap_current,
            swap_limit,
            kernel_memory,
            pids_current,
            pids_limit,
        })
    }

    async fn destroy(&self) -> Result<()> {
        match std::fs::remove_dir(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GatewayError::CGroupError(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_fake_cgroup(path: &Path) {
        std::fs::create_dir_all(path).unwrap();
        std::fs::write(path.join("cgroup.procs"), "").unwrap();
        std::fs::write(path.join("cpu.stat"), "usage_usec 12345\nuser_usec 10000\nsystem_usec 2345\n").unwrap();
        std::fs::write(path.join("memory.current"), "1048576\n").unwrap();
        std::fs::write(path.join("memory.max"), "max\n").unwrap();
        std::fs::write(path.join("memory.swap.current"), "0\n").unwrap();
        std::fs::write(path.join("memory.swap.max"), "max\n").unwrap();
        std::fs::write(path.join("memory.stat"), "slab 4096\nkernel_stack 8192\nanon 100\n").unwrap();
        std::fs::write(path.join("pids.current"), "3\n").unwrap();
        std::fs::write(path.join("pids.max"), "64\n").unwrap();
    }

    #[tokio::test]
    async fn create_is_idempotent_and_populates_parent() {
        let root = tempdir().unwrap();
        let handle = LinuxCGroup::new(root.path(), "job_1");
        handle.create("job_1").await.unwrap();
        handle.create("job_1").await.unwrap();
        assert!(root.path().join("metric_gateway/job_1").is_dir());
    }

    #[tokio::test]
    async fn has_process_reflects_cgroup_procs_contents() {
        let root = tempdir().unwrap();
        let handle = LinuxCGroup::new(root.path(), "job_2");
        write_fake_cgroup(&root.path().join("metric_gateway/job_2"));
        assert!(!handle.has_process().await.unwrap());

        handle.attach(42).await.unwrap();
        assert!(handle.has_process().await.unwrap());
    }

    #[tokio::test]
    async fn read_counters_maps_max_sentinel_and_sums_kernel_memory() {
        let root = tempdir().unwrap();
        let handle = LinuxCGroup::new(root.path(), "job_3");
        write_fake_cgroup(&root.path().join("metric_gateway/job_3"));

        let counters = handle.read_counters().await.unwrap();
        assert_eq!(counters.cpu_usage_ns, 12_345_000);
        assert_eq!(counters.memory_limit, u64::MAX);
        assert_eq!(counters.swap_limit, u64::MAX);
        assert_eq!(counters.kernel_memory, 4096 + 8192);
        assert_eq!(counters.pids_current, 3);
        assert_eq!(counters.pids_limit, 64);
    }

    #[tokio::test]
    async fn destroy_is_safe_when_already_removed() {
        let root = tempdir().unwrap();
        let handle = LinuxCGroup::new(root.path(), "job_4");
        handle.create("job_4").await.unwrap();
        handle.destroy().await.unwrap();
        handle.destroy().await.unwrap();
    }
}
