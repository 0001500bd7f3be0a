//! Connection tracking shared types for kernel (eBPF) and userspace.
//!
//! The flow table is keyed by a canonicalized 5-tuple so that both
//! directions of a flow land on the same entry. NATed flows use a pair of
//! entries: the reverse entry (under the post-NAT tuple) carries the
//! book-keeping, the forward entry (under the pre-NAT tuple) is a pointer
//! to it. Used by: tc-datapath (lookup/create/update) and the userspace
//! liveness + stale-NAT sweepers.

/// Maximum flow table entries.
pub const CT_MAX_FLOWS: u32 = 512_000;

// ── Default liveness timeouts (nanoseconds) ──────────────────────────
//
// The userspace sweeper takes its schedule from config; these defaults
// are shared so the kernel-side RST staleness check and the sweeper
// agree out of the box.

pub const DEFAULT_CREATION_GRACE_NS: u64 = 10_000_000_000;
pub const DEFAULT_TCP_PRE_ESTABLISHED_NS: u64 = 20_000_000_000;
pub const DEFAULT_TCP_ESTABLISHED_NS: u64 = 3_600_000_000_000;
pub const DEFAULT_TCP_FINS_SEEN_NS: u64 = 30_000_000_000;
pub const DEFAULT_TCP_RESET_SEEN_NS: u64 = 40_000_000_000;
pub const DEFAULT_UDP_LAST_SEEN_NS: u64 = 60_000_000_000;
pub const DEFAULT_ICMP_LAST_SEEN_NS: u64 = 5_000_000_000;

// ── Entry discriminator ──────────────────────────────────────────────

pub const FLOW_TYPE_NORMAL: u8 = 0;
pub const FLOW_TYPE_NAT_FORWARD: u8 = 1;
pub const FLOW_TYPE_NAT_REVERSE: u8 = 2;

// ── Flow flags ───────────────────────────────────────────────────────

/// Flow needs outbound masquerade (picked up via the NAT_OUT mark).
pub const FLOW_FLAG_NAT_OUT: u8 = 0x01;
/// Direct-server-return forward leg; return traffic skips SNAT.
pub const FLOW_FLAG_DSR_FWD: u8 = 0x02;
/// Later hooks may skip conntrack entirely for this flow.
pub const FLOW_FLAG_BYPASS: u8 = 0x04;

// ── TCP sub-state bits (monotonic over the flow's lifetime) ──────────

pub const TCP_SYN_SEEN: u8 = 0x01;
pub const TCP_ESTABLISHED: u8 = 0x02;
/// FIN seen from the canonical A leg.
pub const TCP_FIN_A: u8 = 0x04;
/// FIN seen from the canonical B leg.
pub const TCP_FIN_B: u8 = 0x08;
pub const TCP_RST_SEEN: u8 = 0x10;

// ── Flow key — 16 bytes ──────────────────────────────────────────────

/// Canonicalized 5-tuple key.
///
/// `(addr_a, port_a) <= (addr_b, port_b)` lexicographically on the stored
/// (network byte order) representation, so a single entry covers both
/// directions. Ports are host byte order; the classifier normalizes on
/// read.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub addr_a: u32,
    pub addr_b: u32,
    pub port_a: u16,
    pub port_b: u16,
    pub protocol: u8,
    pub _pad: [u8; 3],
}

impl FlowKey {
    /// Build the canonical key for a (src, dst) observation.
    #[inline]
    pub const fn new(protocol: u8, src: u32, sport: u16, dst: u32, dport: u16) -> Self {
        if src < dst || (src == dst && sport <= dport) {
            Self {
                addr_a: src,
                addr_b: dst,
                port_a: sport,
                port_b: dport,
                protocol,
                _pad: [0; 3],
            }
        } else {
            Self {
                addr_a: dst,
                addr_b: src,
                port_a: dport,
                port_b: sport,
                protocol,
                _pad: [0; 3],
            }
        }
    }

    /// Whether (src, sport) landed on the A leg of the canonical key.
    #[inline]
    pub const fn src_is_leg_a(&self, src: u32, sport: u16) -> bool {
        self.addr_a == src && self.port_a == sport
    }
}

/// ICMP has no ports; (type, code) is folded into the source port field so
/// the flow key machinery applies unchanged.
#[inline]
pub const fn icmp_ports(icmp_type: u8, icmp_code: u8) -> (u16, u16) {
    (((icmp_type as u16) << 8) | icmp_code as u16, 0)
}

// ── Flow entry — 48 bytes ────────────────────────────────────────────

/// Flow table value: a tagged sum flattened into one struct.
///
/// `entry_type` selects which tail fields are meaningful:
/// - `FLOW_TYPE_NORMAL`: liveness + `tcp_state` only.
/// - `FLOW_TYPE_NAT_REVERSE`: adds `orig_addr`/`orig_port` (the
///   destination clients dialled) and `tun_ret_addr` (tunnel source of
///   the forward path, for return-to-tunnel flows).
/// - `FLOW_TYPE_NAT_FORWARD`: `rev_key` points at the reverse entry;
///   liveness fields on the forward entry are not authoritative.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowEntry {
    /// Creation timestamp (`bpf_ktime_get_ns`).
    pub created_ns: u64,
    /// Timestamp of the most recent packet.
    pub last_seen_ns: u64,
    /// FLOW_TYPE_* discriminator.
    pub entry_type: u8,
    /// FLOW_FLAG_* bits.
    pub flags: u8,
    /// TCP_* sub-state bits, bit-OR monotonic.
    pub tcp_state: u8,
    pub _pad: u8,
    /// Pre-NAT destination address (NAT-Reverse only).
    pub orig_addr: u32,
    /// Pre-NAT destination port (NAT-Reverse only).
    pub orig_port: u16,
    pub _pad2: u16,
    /// Tunnel source of the forward path (NAT-Reverse only, 0 if none).
    pub tun_ret_addr: u32,
    /// Key of the paired NAT-Reverse entry (NAT-Forward only).
    pub rev_key: FlowKey,
}

impl FlowEntry {
    pub const fn normal(now_ns: u64, flags: u8) -> Self {
        Self {
            created_ns: now_ns,
            last_seen_ns: now_ns,
            entry_type: FLOW_TYPE_NORMAL,
            flags,
            tcp_state: 0,
            _pad: 0,
            orig_addr: 0,
            orig_port: 0,
            _pad2: 0,
            tun_ret_addr: 0,
            rev_key: FlowKey::new(0, 0, 0, 0, 0),
        }
    }

    pub const fn nat_reverse(
        now_ns: u64,
        flags: u8,
        orig_addr: u32,
        orig_port: u16,
        tun_ret_addr: u32,
    ) -> Self {
        Self {
            created_ns: now_ns,
            last_seen_ns: now_ns,
            entry_type: FLOW_TYPE_NAT_REVERSE,
            flags,
            tcp_state: 0,
            _pad: 0,
            orig_addr,
            orig_port,
            _pad2: 0,
            tun_ret_addr,
            rev_key: FlowKey::new(0, 0, 0, 0, 0),
        }
    }

    pub const fn nat_forward(now_ns: u64, rev_key: FlowKey) -> Self {
        Self {
            created_ns: now_ns,
            last_seen_ns: now_ns,
            entry_type: FLOW_TYPE_NAT_FORWARD,
            flags: 0,
            tcp_state: 0,
            _pad: 0,
            orig_addr: 0,
            orig_port: 0,
            _pad2: 0,
            tun_ret_addr: 0,
            rev_key,
        }
    }

    #[inline]
    pub const fn established(&self) -> bool {
        self.tcp_state & TCP_ESTABLISHED != 0
    }

    /// Both legs have sent a FIN.
    #[inline]
    pub const fn fins_seen(&self) -> bool {
        self.tcp_state & (TCP_FIN_A | TCP_FIN_B) == (TCP_FIN_A | TCP_FIN_B)
    }

    /// A single FIN suffices on a DSR forward leg (the return leg is
    /// never observed here).
    #[inline]
    pub const fn fins_seen_dsr(&self) -> bool {
        self.tcp_state & (TCP_FIN_A | TCP_FIN_B) != 0
    }

    #[inline]
    pub const fn rst_seen(&self) -> bool {
        self.tcp_state & TCP_RST_SEEN != 0
    }

    #[inline]
    pub const fn is_dsr_forward(&self) -> bool {
        self.flags & FLOW_FLAG_DSR_FWD != 0
    }
}

// ── TCP state transitions ────────────────────────────────────────────

/// Observed TCP flag bits of one packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

/// Fold one packet's TCP flags into the stored sub-state.
///
/// Purely additive (bit-OR), so concurrent per-CPU updates commute and
/// the stored state never regresses.
#[inline]
pub const fn apply_tcp_flags(state: u8, flags: TcpFlags, from_leg_a: bool) -> u8 {
    let mut next = state;
    if flags.syn {
        next |= TCP_SYN_SEEN;
    }
    if flags.ack && !flags.syn {
        next |= TCP_ESTABLISHED;
    }
    if flags.fin {
        next |= if from_leg_a { TCP_FIN_A } else { TCP_FIN_B };
    }
    if flags.rst {
        next |= TCP_RST_SEEN;
    }
    next
}

// ── NAT direction resolution ─────────────────────────────────────────

/// Address/port rewrite produced by a conntrack hit on a NATed flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatRewrite {
    pub addr: u32,
    pub port: u16,
}

/// Which way a packet is traveling through a NATed flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatDirection {
    /// Client-to-service direction: rewrite the destination to the backend.
    Dnat(NatRewrite),
    /// Backend-to-client direction: rewrite the source back to the
    /// original (service) address.
    Snat(NatRewrite),
}

/// Resolve the NAT direction for a packet against a NAT-Reverse entry.
///
/// `rev_key` is the canonical post-NAT tuple {client, backend}. A packet
/// whose destination equals the recorded original destination is on the
/// forward path; the backend is the `rev_key` leg that is not the
/// packet's source. Anything else is return traffic.
#[inline]
pub fn resolve_nat(
    entry: &FlowEntry,
    rev_key: &FlowKey,
    pkt_src: (u32, u16),
    pkt_dst: (u32, u16),
) -> NatDirection {
    if pkt_dst == (entry.orig_addr, entry.orig_port) {
        let backend = if rev_key.src_is_leg_a(pkt_src.0, pkt_src.1) {
            NatRewrite {
                addr: rev_key.addr_b,
                port: rev_key.port_b,
            }
        } else {
            NatRewrite {
                addr: rev_key.addr_a,
                port: rev_key.port_a,
            }
        };
        NatDirection::Dnat(backend)
    } else {
        NatDirection::Snat(NatRewrite {
            addr: entry.orig_addr,
            port: entry.orig_port,
        })
    }
}

// ── Pod impls ────────────────────────────────────────────────────────

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for FlowKey {}
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for FlowEntry {}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem;

    #[test]
    fn flow_key_size() {
        assert_eq!(mem::size_of::<FlowKey>(), 16);
    }

    #[test]
    fn flow_key_alignment() {
        assert_eq!(mem::align_of::<FlowKey>(), 4);
    }

    #[test]
    fn flow_key_field_offsets() {
        assert_eq!(mem::offset_of!(FlowKey, addr_a), 0);
        assert_eq!(mem::offset_of!(FlowKey, addr_b), 4);
        assert_eq!(mem::offset_of!(FlowKey, port_a), 8);
        assert_eq!(mem::offset_of!(FlowKey, port_b), 10);
        assert_eq!(mem::offset_of!(FlowKey, protocol), 12);
    }

    #[test]
    fn flow_entry_size() {
        assert_eq!(mem::size_of::<FlowEntry>(), 48);
    }

    #[test]
    fn flow_entry_alignment() {
        assert_eq!(mem::align_of::<FlowEntry>(), 8);
    }

    #[test]
    fn flow_entry_field_offsets() {
        assert_eq!(mem::offset_of!(FlowEntry, created_ns), 0);
        assert_eq!(mem::offset_of!(FlowEntry, last_seen_ns), 8);
        assert_eq!(mem::offset_of!(FlowEntry, entry_type), 16);
        assert_eq!(mem::offset_of!(FlowEntry, flags), 17);
        assert_eq!(mem::offset_of!(FlowEntry, tcp_state), 18);
        assert_eq!(mem::offset_of!(FlowEntry, orig_addr), 20);
        assert_eq!(mem::offset_of!(FlowEntry, orig_port), 24);
        assert_eq!(mem::offset_of!(FlowEntry, tun_ret_addr), 28);
        assert_eq!(mem::offset_of!(FlowEntry, rev_key), 32);
    }

    #[test]
    fn flow_key_symmetric() {
        let k1 = FlowKey::new(6, 0x0a000005, 40000, 0x0a600001, 80);
        let k2 = FlowKey::new(6, 0x0a600001, 80, 0x0a000005, 40000);
        assert_eq!(k1, k2);
    }

    #[test]
    fn flow_key_lower_endpoint_first() {
        let k = FlowKey::new(17, 9, 300, 2, 100);
        assert_eq!(k.addr_a, 2);
        assert_eq!(k.port_a, 100);
        assert_eq!(k.addr_b, 9);
        assert_eq!(k.port_b, 300);
    }

    #[test]
    fn flow_key_same_addr_orders_by_port() {
        let k = FlowKey::new(6, 7, 500, 7, 80);
        assert_eq!(k.port_a, 80);
        assert_eq!(k.port_b, 500);
    }

    #[test]
    fn src_leg_detection() {
        let k = FlowKey::new(6, 0x0a000005, 40000, 0x0a600001, 80);
        assert!(k.src_is_leg_a(0x0a000005, 40000));
        assert!(!k.src_is_leg_a(0x0a600001, 80));
    }

    #[test]
    fn icmp_ports_fold_type_and_code() {
        let (sport, dport) = icmp_ports(8, 0);
        assert_eq!(sport, 0x0800);
        assert_eq!(dport, 0);
        let (sport, _) = icmp_ports(3, 4);
        assert_eq!(sport, 0x0304);
    }

    #[test]
    fn tcp_bits_are_monotonic() {
        let mut state = 0u8;
        state = apply_tcp_flags(
            state,
            TcpFlags {
                syn: true,
                ..Default::default()
            },
            true,
        );
        assert_eq!(state, TCP_SYN_SEEN);
        state = apply_tcp_flags(
            state,
            TcpFlags {
                ack: true,
                ..Default::default()
            },
            false,
        );
        assert_eq!(state, TCP_SYN_SEEN | TCP_ESTABLISHED);
        // A later bare SYN (retransmit) must not clear anything.
        state = apply_tcp_flags(
            state,
            TcpFlags {
                syn: true,
                ..Default::default()
            },
            true,
        );
        assert_eq!(state, TCP_SYN_SEEN | TCP_ESTABLISHED);
    }

    #[test]
    fn fin_bits_track_legs() {
        let mut state = 0u8;
        let fin = TcpFlags {
            fin: true,
            ack: true,
            ..Default::default()
        };
        state = apply_tcp_flags(state, fin, true);
        assert!(state & TCP_FIN_A != 0);
        assert!(state & TCP_FIN_B == 0);
        state = apply_tcp_flags(state, fin, false);
        let entry = FlowEntry {
            tcp_state: state,
            ..FlowEntry::normal(0, 0)
        };
        assert!(entry.fins_seen());
    }

    #[test]
    fn single_fin_satisfies_dsr() {
        let mut entry = FlowEntry::normal(0, FLOW_FLAG_DSR_FWD);
        entry.tcp_state = TCP_FIN_A;
        assert!(!entry.fins_seen());
        assert!(entry.fins_seen_dsr());
        assert!(entry.is_dsr_forward());
    }

    #[test]
    fn syn_ack_does_not_mark_established() {
        let state = apply_tcp_flags(
            0,
            TcpFlags {
                syn: true,
                ack: true,
                ..Default::default()
            },
            false,
        );
        assert_eq!(state & TCP_ESTABLISHED, 0);
    }

    #[test]
    fn nat_forward_direction_yields_backend() {
        // Client 10.0.0.5:40000 → service 10.96.0.1:80, backend 10.0.0.9:8080.
        let client = (0x0a000005u32, 40000u16);
        let backend = (0x0a000009u32, 8080u16);
        let rev_key = FlowKey::new(6, client.0, client.1, backend.0, backend.1);
        let entry = FlowEntry::nat_reverse(0, 0, 0x0a600001, 80, 0);

        match resolve_nat(&entry, &rev_key, client, (0x0a600001, 80)) {
            NatDirection::Dnat(rw) => {
                assert_eq!(rw.addr, backend.0);
                assert_eq!(rw.port, backend.1);
            }
            NatDirection::Snat(_) => panic!("expected DNAT"),
        }
    }

    #[test]
    fn nat_reverse_direction_restores_original() {
        let client = (0x0a000005u32, 40000u16);
        let backend = (0x0a000009u32, 8080u16);
        let rev_key = FlowKey::new(6, client.0, client.1, backend.0, backend.1);
        let entry = FlowEntry::nat_reverse(0, 0, 0x0a600001, 80, 0);

        // Reply backend → client.
        match resolve_nat(&entry, &rev_key, backend, client) {
            NatDirection::Snat(rw) => {
                assert_eq!(rw.addr, 0x0a600001);
                assert_eq!(rw.port, 80);
            }
            NatDirection::Dnat(_) => panic!("expected SNAT"),
        }
    }

    #[test]
    fn entry_constructors_set_discriminator() {
        assert_eq!(FlowEntry::normal(1, 0).entry_type, FLOW_TYPE_NORMAL);
        assert_eq!(
            FlowEntry::nat_reverse(1, 0, 2, 3, 0).entry_type,
            FLOW_TYPE_NAT_REVERSE
        );
        let fwd = FlowEntry::nat_forward(1, FlowKey::new(6, 1, 2, 3, 4));
        assert_eq!(fwd.entry_type, FLOW_TYPE_NAT_FORWARD);
        assert_eq!(fwd.rev_key, FlowKey::new(6, 1, 2, 3, 4));
    }

    #[test]
    fn last_seen_initialized_to_created() {
        let e = FlowEntry::normal(42, 0);
        assert_eq!(e.created_ns, e.last_seen_ns);
    }

    #[test]
    fn flow_flag_bits_distinct() {
        let flags = [FLOW_FLAG_NAT_OUT, FLOW_FLAG_DSR_FWD, FLOW_FLAG_BYPASS];
        for (i, &a) in flags.iter().enumerate() {
            for &b in &flags[i + 1..] {
                assert_eq!(a & b, 0, "flags 0x{a:02x} and 0x{b:02x} overlap");
            }
        }
    }

    #[test]
    fn tcp_state_bits_distinct() {
        let bits = [
            TCP_SYN_SEEN,
            TCP_ESTABLISHED,
            TCP_FIN_A,
            TCP_FIN_B,
            TCP_RST_SEEN,
        ];
        for (i, &a) in bits.iter().enumerate() {
            for &b in &bits[i + 1..] {
                assert_eq!(a & b, 0, "bits 0x{a:02x} and 0x{b:02x} overlap");
            }
        }
    }
}
