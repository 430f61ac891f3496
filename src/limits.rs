use serde::{Deserialize, Serialize};

use crate::cgroup::{BLKIO_WEIGHT, CPU_SHARES, MEM_LIMIT};
use crate::error::{Error, Result};

/// Resource limits applied to a job at creation time.
///
/// Every field is optional in spirit: zero means "unlimited / inherit the
/// root group". Weights are percentages in 1-100 that map onto the kernel's
/// 10-1000 share range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Memory cap in megabytes (`memory.limit_in_bytes`).
    pub memory_mb: u32,
    /// Relative CPU weight in 1-100 (`cpu.shares`).
    pub cpu_weight: u32,
    /// Relative block-I/O weight in 1-100 (`blkio.weight`).
    pub io_weight: u32,
}

/// Cgroup parameter names paired with the values to write, in a stable
/// order. The parameter's subsystem is the part before the first `.`.
pub type CgroupLimits = Vec<(&'static str, String)>;

impl Limits {
    /// Whether any limit is actually set.
    pub fn is_limited(&self) -> bool {
        self.memory_mb > 0 || self.cpu_weight > 0 || self.io_weight > 0
    }

    /// Reject weights outside the documented 1-100 range (zero stays
    /// valid as "unlimited").
    pub fn validate(&self) -> Result<()> {
        if self.cpu_weight > 100 {
            return Err(Error::InvalidLimit {
                field: "cpuWeight",
                reason: format!("{} is out of range 0-100", self.cpu_weight),
            });
        }
        if self.io_weight > 100 {
            return Err(Error::InvalidLimit {
                field: "ioWeight",
                reason: format!("{} is out of range 0-100", self.io_weight),
            });
        }
        Ok(())
    }

    /// Format the limits as cgroup v1 parameter values.
    ///
    /// Memory takes the `M` suffix; weights are scaled by 10 onto the
    /// kernel's share range.
    pub fn to_cgroup_limits(&self) -> CgroupLimits {
        let mut formatted = CgroupLimits::new();
        if self.memory_mb > 0 {
            formatted.push((MEM_LIMIT, format!("{}M", self.memory_mb)));
        }
        if self.cpu_weight > 0 {
            formatted.push((CPU_SHARES, (self.cpu_weight * 10).to_string()));
        }
        if self.io_weight > 0 {
            formatted.push((BLKIO_WEIGHT, (self.io_weight * 10).to_string()));
        }
        formatted
    }

    /// Format the limits as trampoline flags for the self-re-exec.
    pub fn to_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if self.memory_mb > 0 {
            flags.push(format!("--memorymb={}", self.memory_mb));
        }
        if self.cpu_weight > 0 {
            flags.push(format!("--cpuweight={}", self.cpu_weight));
        }
        if self.io_weight > 0 {
            flags.push(format!("--ioweight={}", self.io_weight));
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limits_format_to_nothing() {
        let limits = Limits::default();
        assert!(!limits.is_limited());
        assert!(limits.to_cgroup_limits().is_empty());
        assert!(limits.to_flags().is_empty());
    }

    #[test]
    fn cgroup_values_are_scaled() {
        let limits = Limits {
            memory_mb: 16,
            cpu_weight: 50,
            io_weight: 100,
        };
        let formatted = limits.to_cgroup_limits();
        assert_eq!(
            formatted,
            vec![
                (MEM_LIMIT, "16M".to_string()),
                (CPU_SHARES, "500".to_string()),
                (BLKIO_WEIGHT, "1000".to_string()),
            ]
        );
    }

    #[test]
    fn partial_limits_only_emit_set_fields() {
        let limits = Limits {
            memory_mb: 0,
            cpu_weight: 25,
            io_weight: 0,
        };
        assert!(limits.is_limited());
        assert_eq!(limits.to_cgroup_limits(), vec![(CPU_SHARES, "250".to_string())]);
        assert_eq!(limits.to_flags(), vec!["--cpuweight=25".to_string()]);
    }

    #[test]
    fn weights_above_hundred_are_rejected() {
        let limits = Limits {
            memory_mb: 0,
            cpu_weight: 101,
            io_weight: 0,
        };
        assert!(matches!(
            limits.validate(),
            Err(Error::InvalidLimit { field: "cpuWeight", .. })
        ));

        let limits = Limits {
            memory_mb: 0,
            cpu_weight: 0,
            io_weight: 200,
        };
        assert!(matches!(
            limits.validate(),
            Err(Error::InvalidLimit { field: "ioWeight", .. })
        ));
    }

    #[test]
    fn boundary_weights_are_valid() {
        let limits = Limits {
            memory_mb: u32::MAX,
            cpu_weight: 100,
            io_weight: 1,
        };
        assert!(limits.validate().is_ok());
    }
}
