//! Resource-limit policy for the RPC server.

use internode_core::ResourceLimits;

/// Fraction of the memory budget granted to in-flight RPC requests.
const RPC_MEMORY_PERCENT: usize = 8;

/// Floor for the RPC memory ceiling.
const RPC_MEMORY_FLOOR: usize = 1_000_000;

/// Limits handed to every listener this service creates.
///
/// The ceiling scales with the process budget, floored at 1 MB; the bloat
/// factor tolerates serializer overhead on top of the wire size.
pub fn rpc_resource_limits(memory_budget: Option<usize>) -> ResourceLimits {
    let budget = memory_budget.unwrap_or_else(total_system_memory);
    ResourceLimits {
        basic_request_size: 1000,
        bloat_factor: 3,
        max_memory: std::cmp::max(budget / 100 * RPC_MEMORY_PERCENT, RPC_MEMORY_FLOOR),
    }
}

/// Total system memory in bytes, from `/proc/meminfo`.
///
/// Falls back to 1 GiB when the file is unavailable (non-Linux hosts).
fn total_system_memory() -> usize {
    read_meminfo_total().unwrap_or(1 << 30)
}

fn read_meminfo_total() -> Option<usize> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: usize = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_budget() {
        let limits = rpc_resource_limits(Some(1 << 30));
        assert_eq!(limits.basic_request_size, 1000);
        assert_eq!(limits.bloat_factor, 3);
        assert_eq!(limits.max_memory, (1 << 30) / 100 * 8);
    }

    #[test]
    fn test_small_budget_hits_floor() {
        let limits = rpc_resource_limits(Some(4 << 20));
        assert_eq!(limits.max_memory, RPC_MEMORY_FLOOR);
    }

    #[test]
    fn test_default_budget_is_positive() {
        let limits = rpc_resource_limits(None);
        assert!(limits.max_memory >= RPC_MEMORY_FLOOR);
    }
}
