//! CPU and memory sizing within host and platform bounds.

use crate::vm::platform::{GIB, HostCapabilities};

/// Memory requested when the settings leave it unset (zero).
pub const DEFAULT_MEMORY_SIZE: u64 = 4 * GIB;

/// Reserve one core for the host, then clamp into the platform's CPU range.
pub fn compute_cpu_count(host_logical_cores: usize, caps: &HostCapabilities) -> u32 {
    let available = host_logical_cores.saturating_sub(1).max(1);
    let available = u32::try_from(available).unwrap_or(u32::MAX);
    clamp_cpu_count(available, caps)
}

/// CPU count for a configured request: never above what
/// [`compute_cpu_count`] leaves for the guest, never outside platform bounds.
pub fn effective_cpu_count(requested: u32, caps: &HostCapabilities) -> u32 {
    let ceiling = compute_cpu_count(caps.host_logical_cores, caps);
    clamp_cpu_count(requested.max(1).min(ceiling), caps)
}

fn clamp_cpu_count(count: u32, caps: &HostCapabilities) -> u32 {
    // An inverted range resolves to the platform minimum.
    count.min(caps.max_cpu_count).max(caps.min_cpu_count)
}

/// Clamp `requested` bytes into the platform's memory range. Zero means unset.
pub fn compute_memory_size(requested: u64, caps: &HostCapabilities) -> u64 {
    let requested = if requested == 0 {
        DEFAULT_MEMORY_SIZE
    } else {
        requested
    };
    requested
        .min(caps.max_memory_size)
        .max(caps.min_memory_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::platform::{HostVersion, MIB};

    fn caps(min_cpu: u32, max_cpu: u32, min_mem: u64, max_mem: u64) -> HostCapabilities {
        let mut caps = HostCapabilities::for_host_version(HostVersion::new(14, 0));
        caps.host_logical_cores = 8;
        caps.min_cpu_count = min_cpu;
        caps.max_cpu_count = max_cpu;
        caps.min_memory_size = min_mem;
        caps.max_memory_size = max_mem;
        caps
    }

    #[test]
    fn single_core_host_gets_one_cpu() {
        assert_eq!(compute_cpu_count(1, &caps(1, 16, MIB, GIB)), 1);
        assert_eq!(compute_cpu_count(0, &caps(1, 16, MIB, GIB)), 1);
    }

    #[test]
    fn reserves_one_core_for_host() {
        assert_eq!(compute_cpu_count(8, &caps(1, 16, MIB, GIB)), 7);
    }

    #[test]
    fn cpu_count_stays_in_platform_bounds() {
        let c = caps(2, 6, MIB, GIB);
        for n in 0..64 {
            let cpus = compute_cpu_count(n, &c);
            assert!((2..=6).contains(&cpus), "host {n} -> {cpus}");
        }
    }

    #[test]
    fn effective_cpu_count_respects_host_reservation() {
        let c = caps(1, 16, MIB, GIB);
        assert_eq!(effective_cpu_count(4, &c), 4);
        assert_eq!(effective_cpu_count(12, &c), 7);
        assert_eq!(effective_cpu_count(0, &c), 1);
    }

    #[test]
    fn memory_defaults_to_four_gib() {
        let c = caps(1, 16, 128 * MIB, 64 * GIB);
        assert_eq!(compute_memory_size(0, &c), 4 * GIB);
    }

    #[test]
    fn memory_is_clamped() {
        let c = caps(1, 16, 2 * GIB, 8 * GIB);
        for requested in [0, 1, GIB, 2 * GIB, 6 * GIB, 8 * GIB, 9 * GIB, u64::MAX] {
            let size = compute_memory_size(requested, &c);
            assert!(
                (2 * GIB..=8 * GIB).contains(&size),
                "requested {requested} -> {size}"
            );
        }
        assert_eq!(compute_memory_size(u64::MAX, &c), 8 * GIB);
        assert_eq!(compute_memory_size(1, &c), 2 * GIB);
    }
}
