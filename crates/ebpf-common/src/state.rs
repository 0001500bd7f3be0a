//! Per-packet scratch state, tail-call slots, frame marks, and the
//! datapath configuration block.
//!
//! The scratch state lives in a single-entry per-CPU array. It carries the
//! parsed tuple, conntrack result, NAT decision, and policy verdict across
//! the chained program instances; it is overwritten for every packet and
//! never read across packets.

// ── Conntrack lookup result codes ────────────────────────────────────

pub const CT_NEW: u8 = 0;
pub const CT_ESTABLISHED: u8 = 1;
pub const CT_ESTABLISHED_BYPASS: u8 = 2;
pub const CT_ESTABLISHED_DNAT: u8 = 3;
pub const CT_ESTABLISHED_SNAT: u8 = 4;
pub const CT_INVALID: u8 = 5;

// ── Policy verdicts ──────────────────────────────────────────────────

pub const POL_NO_MATCH: u8 = 0;
pub const POL_ALLOW: u8 = 1;
pub const POL_DENY: u8 = 2;

// ── Scratch state flags ──────────────────────────────────────────────

/// Flow requires outbound masquerade (source in a NAT-outgoing pool,
/// destination off-pool).
pub const ST_NAT_OUTGOING: u16 = 0x01;

// ── Tail-call slots ──────────────────────────────────────────────────

pub const JUMP_SLOT_POLICY: u32 = 0;
pub const JUMP_SLOT_ACCEPTED: u32 = 1;
pub const JUMP_SLOTS: u32 = 2;

// ── Frame mark sentinels ─────────────────────────────────────────────
//
// Whole-word writes only: masked read-modify-write stores trip the
// verifier (the compiler narrows them to 16-bit stores).

/// Packet has been seen by a datapath hook.
pub const MARK_SEEN: u32 = 0x3e10_0000;
/// Packet fully approved; later hooks skip conntrack.
pub const MARK_BYPASS: u32 = 0x3e30_0000;
/// Packet approved for forwarding.
pub const MARK_BYPASS_FWD: u32 = 0x3e50_0000;
/// Approved for forwarding; egress hook must rewrite the source to the
/// host address.
pub const MARK_BYPASS_FWD_SRC_FIXUP: u32 = 0x3e70_0000;
/// Flow needs outbound masquerade by the host's NAT rules.
pub const MARK_NAT_OUT: u32 = 0x3e90_0000;

// ── Hook roles ───────────────────────────────────────────────────────

pub const HOOK_FROM_WORKLOAD: u8 = 0;
pub const HOOK_TO_WORKLOAD: u8 = 1;
pub const HOOK_FROM_HOST: u8 = 2;
pub const HOOK_TO_HOST: u8 = 3;
pub const HOOK_FROM_HEP: u8 = 4;
pub const HOOK_TO_HEP: u8 = 5;

/// Traffic at this hook is heading toward the host namespace.
#[inline]
pub const fn hook_to_host(role: u8) -> bool {
    matches!(role, HOOK_FROM_WORKLOAD | HOOK_FROM_HOST | HOOK_FROM_HEP)
}

#[inline]
pub const fn hook_is_workload(role: u8) -> bool {
    matches!(role, HOOK_FROM_WORKLOAD | HOOK_TO_WORKLOAD)
}

#[inline]
pub const fn hook_is_hep(role: u8) -> bool {
    matches!(role, HOOK_FROM_HEP | HOOK_TO_HEP)
}

#[inline]
pub const fn hook_from_workload(role: u8) -> bool {
    role == HOOK_FROM_WORKLOAD
}

#[inline]
pub const fn hook_to_workload_or_hep(role: u8) -> bool {
    matches!(role, HOOK_TO_WORKLOAD | HOOK_TO_HEP)
}

// ── Datapath config flags ────────────────────────────────────────────

pub const CFG_FIB_LOOKUP: u8 = 0x01;
pub const CFG_DROP_WORKLOAD_TO_HOST: u8 = 0x02;
pub const CFG_DSR: u8 = 0x04;
/// VXLAN decap of tunnel packets addressed to the host.
pub const CFG_DNAT_DECAP: u8 = 0x08;
/// VXLAN encap toward remote backends after DNAT.
pub const CFG_DNAT_ENCAP: u8 = 0x10;

// ── Datapath config — 16 bytes ───────────────────────────────────────

/// Single-entry array written by the loader before attach. The
/// control-plane equivalent of compile-time program constants.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatapathConfig {
    /// This node's address (network byte order).
    pub host_ip: u32,
    pub vxlan_vni: u32,
    /// VXLAN UDP port (host byte order).
    pub vxlan_port: u16,
    /// Path MTU used for the encap DF check.
    pub mtu: u16,
    /// HOOK_* role of the attached interface/direction.
    pub hook_role: u8,
    /// CFG_* bits.
    pub flags: u8,
    pub log_level: u8,
    pub _pad: u8,
}

impl DatapathConfig {
    #[inline]
    pub const fn fib_enabled(&self) -> bool {
        self.flags & CFG_FIB_LOOKUP != 0
    }

    #[inline]
    pub const fn dsr_enabled(&self) -> bool {
        self.flags & CFG_DSR != 0
    }

    #[inline]
    pub const fn decap_enabled(&self) -> bool {
        self.flags & CFG_DNAT_DECAP != 0
    }

    #[inline]
    pub const fn encap_enabled(&self) -> bool {
        self.flags & CFG_DNAT_ENCAP != 0
    }

    #[inline]
    pub const fn drop_workload_to_host(&self) -> bool {
        self.flags & CFG_DROP_WORKLOAD_TO_HOST != 0
    }
}

// ── Per-packet scratch state — 56 bytes ──────────────────────────────

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketState {
    /// Source address as parsed (network byte order).
    pub ip_src: u32,
    /// Destination address as parsed (network byte order).
    pub ip_dst: u32,
    /// Destination after any NAT decision.
    pub post_nat_ip_dst: u32,
    /// Outer source of a decapped VXLAN packet (0 if none).
    pub tun_src: u32,
    /// Ports in host byte order.
    pub sport: u16,
    pub dport: u16,
    pub post_nat_dport: u16,
    pub ip_proto: u8,
    /// POL_* result written by the policy tail.
    pub pol_verdict: u8,
    /// CT_* result of the conntrack lookup.
    pub ct_rc: u8,
    /// FLOW_FLAG_* bits observed on the conntrack entry.
    pub ct_flags: u8,
    /// Backend selected by the NAT resolver (0 port = none).
    pub nat_dest_port: u16,
    pub nat_dest_addr: u32,
    /// Translation carried on an established NATed flow.
    pub ct_nat_addr: u32,
    pub ct_nat_port: u16,
    /// ST_* bits.
    pub flags: u16,
    /// Tunnel return address recorded on the conntrack entry.
    pub ct_tun_ret: u32,
    pub _pad: u32,
    /// Program entry timestamp, for latency logging.
    pub prog_start_ns: u64,
}

impl PacketState {
    pub const fn zeroed() -> Self {
        Self {
            ip_src: 0,
            ip_dst: 0,
            post_nat_ip_dst: 0,
            tun_src: 0,
            sport: 0,
            dport: 0,
            post_nat_dport: 0,
            ip_proto: 0,
            pol_verdict: POL_NO_MATCH,
            ct_rc: CT_NEW,
            ct_flags: 0,
            nat_dest_port: 0,
            nat_dest_addr: 0,
            ct_nat_addr: 0,
            ct_nat_port: 0,
            flags: 0,
            ct_tun_ret: 0,
            _pad: 0,
            prog_start_ns: 0,
        }
    }

    /// Whether the NAT resolver selected a backend for this packet.
    #[inline]
    pub const fn has_nat_dest(&self) -> bool {
        self.nat_dest_addr != 0
    }
}

// ── Pod impls ────────────────────────────────────────────────────────

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for PacketState {}
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for DatapathConfig {}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem;

    #[test]
    fn packet_state_size() {
        assert_eq!(mem::size_of::<PacketState>(), 56);
        assert_eq!(mem::align_of::<PacketState>(), 8);
    }

    #[test]
    fn packet_state_field_offsets() {
        assert_eq!(mem::offset_of!(PacketState, ip_src), 0);
        assert_eq!(mem::offset_of!(PacketState, ip_dst), 4);
        assert_eq!(mem::offset_of!(PacketState, post_nat_ip_dst), 8);
        assert_eq!(mem::offset_of!(PacketState, tun_src), 12);
        assert_eq!(mem::offset_of!(PacketState, sport), 16);
        assert_eq!(mem::offset_of!(PacketState, dport), 18);
        assert_eq!(mem::offset_of!(PacketState, post_nat_dport), 20);
        assert_eq!(mem::offset_of!(PacketState, ip_proto), 22);
        assert_eq!(mem::offset_of!(PacketState, pol_verdict), 23);
        assert_eq!(mem::offset_of!(PacketState, ct_rc), 24);
        assert_eq!(mem::offset_of!(PacketState, ct_flags), 25);
        assert_eq!(mem::offset_of!(PacketState, nat_dest_port), 26);
        assert_eq!(mem::offset_of!(PacketState, nat_dest_addr), 28);
        assert_eq!(mem::offset_of!(PacketState, ct_nat_addr), 32);
        assert_eq!(mem::offset_of!(PacketState, ct_nat_port), 36);
        assert_eq!(mem::offset_of!(PacketState, flags), 38);
        assert_eq!(mem::offset_of!(PacketState, ct_tun_ret), 40);
        assert_eq!(mem::offset_of!(PacketState, prog_start_ns), 48);
    }

    #[test]
    fn datapath_config_size() {
        assert_eq!(mem::size_of::<DatapathConfig>(), 16);
        assert_eq!(mem::align_of::<DatapathConfig>(), 4);
    }

    #[test]
    fn mark_sentinels_distinct() {
        let marks = [
            MARK_SEEN,
            MARK_BYPASS,
            MARK_BYPASS_FWD,
            MARK_BYPASS_FWD_SRC_FIXUP,
            MARK_NAT_OUT,
        ];
        for (i, &a) in marks.iter().enumerate() {
            for &b in &marks[i + 1..] {
                assert_ne!(a, b, "marks {a:#x} and {b:#x} collide");
            }
        }
    }

    #[test]
    fn ct_result_codes_distinct() {
        let codes = [
            CT_NEW,
            CT_ESTABLISHED,
            CT_ESTABLISHED_BYPASS,
            CT_ESTABLISHED_DNAT,
            CT_ESTABLISHED_SNAT,
            CT_INVALID,
        ];
        for (i, &a) in codes.iter().enumerate() {
            for &b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn hook_role_predicates() {
        assert!(hook_to_host(HOOK_FROM_WORKLOAD));
        assert!(hook_to_host(HOOK_FROM_HEP));
        assert!(hook_to_host(HOOK_FROM_HOST));
        assert!(!hook_to_host(HOOK_TO_WORKLOAD));
        assert!(!hook_to_host(HOOK_TO_HEP));

        assert!(hook_is_workload(HOOK_FROM_WORKLOAD));
        assert!(hook_is_workload(HOOK_TO_WORKLOAD));
        assert!(!hook_is_workload(HOOK_FROM_HEP));

        assert!(hook_is_hep(HOOK_TO_HEP));
        assert!(hook_to_workload_or_hep(HOOK_TO_WORKLOAD));
        assert!(hook_to_workload_or_hep(HOOK_TO_HEP));
        assert!(!hook_to_workload_or_hep(HOOK_FROM_WORKLOAD));
    }

    #[test]
    fn config_flag_accessors() {
        let cfg = DatapathConfig {
            host_ip: 0,
            vxlan_vni: 4096,
            vxlan_port: 4789,
            mtu: 1450,
            hook_role: HOOK_FROM_WORKLOAD,
            flags: CFG_FIB_LOOKUP | CFG_DNAT_ENCAP,
            log_level: 0,
            _pad: 0,
        };
        assert!(cfg.fib_enabled());
        assert!(cfg.encap_enabled());
        assert!(!cfg.dsr_enabled());
        assert!(!cfg.decap_enabled());
        assert!(!cfg.drop_workload_to_host());
    }

    #[test]
    fn zeroed_state_is_new_no_match() {
        let s = PacketState::zeroed();
        assert_eq!(s.ct_rc, CT_NEW);
        assert_eq!(s.pol_verdict, POL_NO_MATCH);
        assert!(!s.has_nat_dest());
    }
}
