//! Host-level memory totals, used to resolve the cgroup "no limit" sentinel.

use crate::error::{GatewayError, Result};
use std::fs;

/// Total host memory and swap, read once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInfo {
    pub total_memory_bytes: u64,
    pub total_swap_bytes: u64,
}

impl HostInfo {
    /// Reads `MemTotal` and `SwapTotal` out of `/proc/meminfo`.
    pub fn read() -> Result<Self> {
        let contents = fs::read_to_string("/proc/meminfo")
            .map_err(GatewayError::PersistenceError)?;
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Result<Self> {
        let mut total_memory_bytes = None;
        let mut total_swap_bytes = None;

        for line in contents.lines() {
            if let Some(value) = line.strip_prefix("MemTotal:") {
                total_memory_bytes = Some(Self::parse_kb_line(value)?);
            } else if let Some(value) = line.strip_prefix("SwapTotal:") {
                total_swap_bytes = Some(Self::parse_kb_line(value)?);
            }
        }

        let total_memory_bytes = total_memory_bytes.ok_or_else(|| {
            GatewayError::PersistenceError(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "MemTotal not found in /proc/meminfo",
            ))
        })?;
        let total_swap_bytes = total_swap_bytes.ok_or_else(|| {
            GatewayError::PersistenceError(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "SwapTotal not found in /proc/meminfo",
            ))
        })?;

        Ok(Self {
            total_memory_bytes,
            total_swap_bytes,
        })
    }

    fn parse_kb_line(value: &str) -> Result<u64> {
        let kb: u64 = value
            .trim()
            .trim_end_matches("kB")
            .trim()
            .parse()
            .map_err(|_| {
                GatewayError::PersistenceError(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unparseable /proc/meminfo value: {value:?}"),
                ))
            })?;
        Ok(kb * 1024)
    }
}
