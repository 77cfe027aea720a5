//! Replication job sizing
//!
//! Derives CPU and memory for the replication job from how much of the VM
//! disk is actually in use. Larger disks get more sync throughput, within
//! fixed clamps.

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Minimum disk usage considered, in GiB
pub const MIN_USED_GB: f64 = 1.0;
pub const MIN_CPU_CORES: u32 = 1;
pub const MAX_CPU_CORES: u32 = 4;
pub const MIN_MEMORY_GB: u32 = 2;
pub const MAX_MEMORY_GB: u32 = 8;

/// GiB of used disk per CPU core
const GB_PER_CORE: f64 = 5.0;
/// GiB of memory per GiB of used disk
const MEMORY_PER_GB: f64 = 0.3;
/// Requests are this fraction of limits
const REQUEST_RATIO: f64 = 0.7;

/// Assumed utilization of a storage claim when usage cannot be measured
pub const PVC_ASSUMED_UTILIZATION: f64 = 0.25;

/// Assumed utilization of a raw block-size reading
pub const BLOCK_SIZE_UTILIZATION: f64 = 0.3;

/// CPU and memory limits/requests rendered into the replication job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub cpu_limit: String,
    pub cpu_request: String,
    pub memory_limit: String,
    pub memory_request: String,
}

impl Default for ResourceProfile {
    /// Profile for the smallest disk: 1 CPU, 2Gi.
    fn default() -> Self {
        ResourceProfile::from_used_bytes(0)
    }
}

impl ResourceProfile {
    /// Size the job from measured disk usage.
    pub fn from_used_bytes(used_bytes: u64) -> Self {
        let used_gb = (used_bytes as f64 / GIB).max(MIN_USED_GB);

        let cpu_cores = ((used_gb / GB_PER_CORE).ceil() as u32).clamp(MIN_CPU_CORES, MAX_CPU_CORES);
        let memory_gb =
            ((used_gb * MEMORY_PER_GB).ceil() as u32).clamp(MIN_MEMORY_GB, MAX_MEMORY_GB);

        let cpu_request = f64::from(cpu_cores) * REQUEST_RATIO;
        let memory_request = (f64::from(memory_gb) * REQUEST_RATIO).ceil() as u32;

        Self {
            cpu_limit: format!("{:.1}", f64::from(cpu_cores)),
            cpu_request: format!("{:.1}", cpu_request),
            memory_limit: format!("{}Gi", memory_gb),
            memory_request: format!("{}Gi", memory_request),
        }
    }

    /// Size the job from a declared claim capacity such as `50Gi`.
    pub fn from_pvc_capacity(capacity: &str) -> Result<Self> {
        let total = parse_quantity(capacity)?;
        let assumed = (total as f64 * PVC_ASSUMED_UTILIZATION) as u64;
        Ok(Self::from_used_bytes(assumed))
    }
}

/// Parse a Kubernetes storage quantity (`10Gi`, `512M`, `1073741824`).
///
/// Binary and decimal suffixes are both treated as powers of 1024.
pub fn parse_quantity(quantity: &str) -> Result<u64> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return Err(MigrateError::Parse("empty size string".to_string()));
    }

    let split = quantity
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(quantity.len());
    let (digits, unit) = quantity.split_at(split);

    let number: u64 = digits
        .parse()
        .map_err(|_| MigrateError::Parse(format!("invalid size format: {}", quantity)))?;

    let multiplier: u64 = match unit.to_ascii_lowercase().as_str() {
        "" => 1,
        "k" | "ki" => 1 << 10,
        "m" | "mi" => 1 << 20,
        "g" | "gi" => 1 << 30,
        "t" | "ti" => 1 << 40,
        _ => {
            return Err(MigrateError::Parse(format!(
                "unsupported size unit: {}",
                quantity
            )))
        }
    };

    number
        .checked_mul(multiplier)
        .ok_or_else(|| MigrateError::Parse(format!("size overflows: {}", quantity)))
}

/// Parse `du -h` style sizes (`1.6G`, `512K`, `20GiB`, `0`).
pub fn parse_human_size(size: &str) -> Result<u64> {
    let size = size.trim();
    let split = size
        .rfind(|c: char| c.is_ascii_digit() || c == '.')
        .map(|i| i + 1)
        .ok_or_else(|| MigrateError::Parse(format!("invalid size format: {}", size)))?;
    let (number, unit) = size.split_at(split);

    let number: f64 = number
        .parse()
        .map_err(|_| MigrateError::Parse(format!("invalid number in size: {}", number)))?;

    let multiplier: f64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1.0,
        "K" | "KB" | "KIB" => 1024.0,
        "M" | "MB" | "MIB" => 1024.0 * 1024.0,
        "G" | "GB" | "GIB" => GIB,
        "T" | "TB" | "TIB" => GIB * 1024.0,
        "P" | "PB" | "PIB" => GIB * 1024.0 * 1024.0,
        other => {
            return Err(MigrateError::Parse(format!("unknown size unit: {}", other)));
        }
    };

    Ok((number * multiplier) as u64)
}

/// Format a byte count for log output.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB_U: u64 = 1 << 30;

    #[test]
    fn test_floor_for_tiny_disks() {
        let tiny = ResourceProfile::from_used_bytes(GIB_U / 10);
        let one = ResourceProfile::from_used_bytes(GIB_U);
        assert_eq!(tiny, one);
        assert_eq!(ResourceProfile::default(), one);
        assert_eq!(one.cpu_limit, "1.0");
        assert_eq!(one.memory_limit, "2Gi");
    }

    #[test]
    fn test_three_gib() {
        let profile = ResourceProfile::from_used_bytes(3 * GIB_U);
        assert_eq!(profile.cpu_limit, "1.0");
        assert_eq!(profile.cpu_request, "0.7");
        assert_eq!(profile.memory_limit, "2Gi");
        assert_eq!(profile.memory_request, "2Gi");
    }

    #[test]
    fn test_twenty_gib() {
        let profile = ResourceProfile::from_used_bytes(20 * GIB_U);
        assert_eq!(profile.cpu_limit, "4.0");
        assert_eq!(profile.cpu_request, "2.8");
        assert_eq!(profile.memory_limit, "6Gi");
        assert_eq!(profile.memory_request, "5Gi");
    }

    #[test]
    fn test_caps() {
        let profile = ResourceProfile::from_used_bytes(100 * GIB_U);
        assert_eq!(profile.cpu_limit, "4.0");
        assert_eq!(profile.memory_limit, "8Gi");
        assert_eq!(profile.memory_request, "6Gi");
    }

    #[test]
    fn test_monotonic() {
        let mut last_cpu = 0.0;
        let mut last_mem = 0;
        for gb in [0u64, 1, 2, 5, 6, 10, 11, 15, 16, 20, 27, 40, 1000] {
            let p = ResourceProfile::from_used_bytes(gb * GIB_U);
            let cpu: f64 = p.cpu_limit.parse().unwrap();
            let mem: u32 = p.memory_limit.trim_end_matches("Gi").parse().unwrap();
            assert!(cpu >= last_cpu, "cpu decreased at {} GiB", gb);
            assert!(mem >= last_mem, "memory decreased at {} GiB", gb);
            assert!((1.0..=4.0).contains(&cpu));
            assert!((2..=8).contains(&mem));
            last_cpu = cpu;
            last_mem = mem;
        }
    }

    #[test]
    fn test_pvc_fallback_assumes_quarter_usage() {
        // 80Gi claim -> 20GiB assumed used
        let profile = ResourceProfile::from_pvc_capacity("80Gi").unwrap();
        assert_eq!(profile, ResourceProfile::from_used_bytes(20 * GIB_U));
        assert!(ResourceProfile::from_pvc_capacity("lots").is_err());
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("10Gi").unwrap(), 10 * GIB_U);
        assert_eq!(parse_quantity("10G").unwrap(), 10 * GIB_U);
        assert_eq!(parse_quantity("512Mi").unwrap(), 512 << 20);
        assert_eq!(parse_quantity("2Ti").unwrap(), 2 << 40);
        assert_eq!(parse_quantity("4096").unwrap(), 4096);
        assert!(parse_quantity("").is_err());
        assert!(parse_quantity("Gi").is_err());
        assert!(parse_quantity("10Xi").is_err());
    }

    #[test]
    fn test_parse_human_size() {
        assert_eq!(parse_human_size("1.5G").unwrap(), GIB_U + GIB_U / 2);
        assert_eq!(parse_human_size("512K").unwrap(), 512 * 1024);
        assert_eq!(parse_human_size("20GiB").unwrap(), 20 * GIB_U);
        assert_eq!(parse_human_size("0").unwrap(), 0);
        assert_eq!(parse_human_size("100B").unwrap(), 100);
        assert!(parse_human_size("G").is_err());
        assert!(parse_human_size("1.6Q").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(3 * GIB_U), "3.0 GiB");
    }
}
