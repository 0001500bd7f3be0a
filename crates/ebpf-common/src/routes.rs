//! Route table shared types.
//!
//! An LPM trie keyed by IPv4 CIDR, written by the control plane and read
//! by the datapath for RPF, locality checks, NAT-outgoing decisions, and
//! VXLAN next-hop resolution.

/// Maximum route entries.
pub const ROUTE_MAX_ENTRIES: u32 = 256 * 1024;

// ── Route flags ──────────────────────────────────────────────────────

pub const ROUTE_FLAG_LOCAL_HOST: u32 = 0x01;
pub const ROUTE_FLAG_LOCAL_WORKLOAD: u32 = 0x02;
pub const ROUTE_FLAG_REMOTE_WORKLOAD: u32 = 0x04;
/// Address belongs to a managed IP pool.
pub const ROUTE_FLAG_IN_POOL: u32 = 0x08;
/// Workloads in this pool get outbound masquerade to off-pool targets.
pub const ROUTE_FLAG_NAT_OUT: u32 = 0x10;

// ── Route value — 12 bytes ───────────────────────────────────────────

/// Value of the route trie. `if_index` is meaningful for local workloads,
/// `next_hop` (node address, network byte order) for remote workloads.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteValue {
    pub flags: u32,
    pub if_index: u32,
    pub next_hop: u32,
}

impl RouteValue {
    #[inline]
    pub const fn is_local_host(&self) -> bool {
        self.flags & ROUTE_FLAG_LOCAL_HOST != 0
    }

    #[inline]
    pub const fn is_local_workload(&self) -> bool {
        self.flags & ROUTE_FLAG_LOCAL_WORKLOAD != 0
    }

    #[inline]
    pub const fn is_remote_workload(&self) -> bool {
        self.flags & ROUTE_FLAG_REMOTE_WORKLOAD != 0
    }

    #[inline]
    pub const fn is_workload(&self) -> bool {
        self.flags & (ROUTE_FLAG_LOCAL_WORKLOAD | ROUTE_FLAG_REMOTE_WORKLOAD) != 0
    }

    #[inline]
    pub const fn is_local(&self) -> bool {
        self.flags & (ROUTE_FLAG_LOCAL_HOST | ROUTE_FLAG_LOCAL_WORKLOAD) != 0
    }

    #[inline]
    pub const fn in_pool(&self) -> bool {
        self.flags & ROUTE_FLAG_IN_POOL != 0
    }

    #[inline]
    pub const fn nat_outgoing(&self) -> bool {
        self.flags & ROUTE_FLAG_NAT_OUT != 0
    }
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for RouteValue {}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem;

    #[test]
    fn route_value_size() {
        assert_eq!(mem::size_of::<RouteValue>(), 12);
        assert_eq!(mem::align_of::<RouteValue>(), 4);
    }

    #[test]
    fn flag_bits_distinct() {
        let flags = [
            ROUTE_FLAG_LOCAL_HOST,
            ROUTE_FLAG_LOCAL_WORKLOAD,
            ROUTE_FLAG_REMOTE_WORKLOAD,
            ROUTE_FLAG_IN_POOL,
            ROUTE_FLAG_NAT_OUT,
        ];
        for (i, &a) in flags.iter().enumerate() {
            for &b in &flags[i + 1..] {
                assert_eq!(a & b, 0, "flags {a:#x} and {b:#x} overlap");
            }
        }
    }

    #[test]
    fn predicates() {
        let local_wl = RouteValue {
            flags: ROUTE_FLAG_LOCAL_WORKLOAD | ROUTE_FLAG_IN_POOL | ROUTE_FLAG_NAT_OUT,
            if_index: 12,
            next_hop: 0,
        };
        assert!(local_wl.is_local_workload());
        assert!(local_wl.is_workload());
        assert!(local_wl.is_local());
        assert!(local_wl.in_pool());
        assert!(local_wl.nat_outgoing());
        assert!(!local_wl.is_local_host());

        let remote = RouteValue {
            flags: ROUTE_FLAG_REMOTE_WORKLOAD,
            if_index: 0,
            next_hop: 0x0a000a01,
        };
        assert!(remote.is_workload());
        assert!(!remote.is_local());
    }
}
