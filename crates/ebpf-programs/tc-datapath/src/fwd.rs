//! Forwarding finisher: NAT application, VXLAN encap/decap, synthesized
//! ICMP errors, FIB short-circuit, and the final TC verdict.

use aya_ebpf::{
    bindings::{TC_ACT_REDIRECT, TC_ACT_SHOT, TC_ACT_UNSPEC},
    cty::c_long,
    helpers::{
        bpf_fib_lookup, bpf_l3_csum_replace, bpf_l4_csum_replace, bpf_redirect,
        bpf_skb_adjust_room, bpf_skb_change_tail, bpf_skb_store_bytes,
    },
    programs::TcContext,
};
use aya_log_ebpf::debug;
use core::mem;
use ebpf_common::{
    conntrack::{FLOW_FLAG_DSR_FWD, FLOW_FLAG_NAT_OUT},
    csum,
    reasons::{
        REASON_CSUM_FAIL, REASON_CT_INVALID, REASON_ENCAP_FAIL, REASON_ICMP_DF,
        REASON_POLICY_DENY, REASON_RT_UNKNOWN, REASON_SHORT, REASON_UNKNOWN,
    },
    state::{
        hook_from_workload, hook_is_workload, hook_to_host, DatapathConfig, PacketState,
        CT_ESTABLISHED, CT_ESTABLISHED_BYPASS, CT_ESTABLISHED_DNAT, CT_ESTABLISHED_SNAT, CT_NEW,
        HOOK_FROM_HOST, MARK_BYPASS, MARK_BYPASS_FWD, MARK_BYPASS_FWD_SRC_FIXUP, MARK_NAT_OUT,
        MARK_SEEN, POL_ALLOW, ST_NAT_OUTGOING,
    },
};
use network_types::{eth::EthHdr, ip::Ipv4Hdr};

use crate::{ct, ptr_at, ptr_at_mut, route_lookup, skb_ifindex, skb_ingress_ifindex, skb_set_mark,
    L3_CSUM_OFF};

const PROTO_ICMP: u8 = 1;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

const ICMP_TIME_EXCEEDED: u8 = 11;
const ICMP_DEST_UNREACH: u8 = 3;
const ICMP_FRAG_NEEDED: u8 = 4;

/// Outer IP + UDP + VXLAN + inner Ethernet.
const VXLAN_OVERHEAD: u32 = 50;

// Raw helper flags not surfaced by the bindings.
const BPF_F_PSEUDO_HDR: u64 = 0x10;
const BPF_F_MARK_MANGLED_0: u64 = 0x20;
const BPF_F_INGRESS: u64 = 1;
const BPF_ADJ_ROOM_MAC: u32 = 1;
const BPF_F_ADJ_ROOM_ENCAP_L3_IPV4: u64 = 0x02;
const BPF_F_ADJ_ROOM_ENCAP_L4_UDP: u64 = 0x10;
const BPF_F_ADJ_ROOM_ENCAP_L2_SHIFT: u64 = 56;
const BPF_FIB_LOOKUP_OUTPUT: u32 = 0x02;

/// Internal result: turn the frame around on its ingress interface.
pub const RES_REDIR_IFINDEX: i32 = -212;
pub const RES_ALLOW: i32 = TC_ACT_UNSPEC;

/// Outcome of the accepted path, consumed by [`forward_or_drop`].
#[derive(Clone, Copy)]
pub struct Fwd {
    pub res: i32,
    pub mark: u32,
    pub reason: u32,
    pub fib: bool,
    pub fib_flags: u32,
}

impl Fwd {
    pub const fn allow(mark: u32, fib: bool) -> Self {
        Self {
            res: RES_ALLOW,
            mark,
            reason: REASON_UNKNOWN,
            fib,
            fib_flags: 0,
        }
    }

    pub const fn deny(reason: u32) -> Self {
        Self {
            res: TC_ACT_SHOT,
            mark: MARK_SEEN,
            reason,
            fib: false,
            fib_flags: 0,
        }
    }
}

/// Network-order u32 → wire bytes.
#[inline(always)]
fn addr_bytes(addr: u32) -> [u8; 4] {
    addr.to_ne_bytes()
}

#[inline(always)]
fn skb_is_gso(ctx: &TcContext) -> bool {
    unsafe { (*ctx.skb.skb).gso_segs > 1 }
}

#[inline(always)]
fn store(ctx: &TcContext, offset: u32, data: &[u8]) -> Result<(), ()> {
    let ret = unsafe {
        bpf_skb_store_bytes(
            ctx.skb.skb as *mut _,
            offset,
            data.as_ptr() as *const _,
            data.len() as u32,
            0,
        )
    };
    if ret != 0 { Err(()) } else { Ok(()) }
}

// ── Accepted path ───────────────────────────────────────────────────

/// Run the post-verdict pipeline: conntrack creation, NAT application,
/// encapsulation, and ICMP error synthesis. Mirrors the conntrack result
/// recorded in `state`.
#[inline(always)]
pub fn finish_accepted(ctx: &TcContext, cfg: &DatapathConfig, state: &mut PacketState) -> Fwd {
    let role = cfg.hook_role;
    let from_hep = hook_to_host(role) && !hook_is_workload(role);

    // Masqueraded flows take the host's NAT path; no FIB short-circuit.
    let (seen_mark, fib) = if hook_from_workload(role) && state.flags & ST_NAT_OUTGOING != 0 {
        (MARK_NAT_OUT, false)
    } else {
        (MARK_SEEN, true)
    };

    let Ok(ip) = (unsafe { ptr_at::<Ipv4Hdr>(ctx, EthHdr::LEN) }) else {
        return Fwd::deny(REASON_SHORT);
    };
    let ttl = unsafe { (*ip).ttl };
    if ttl <= 1 {
        let translating = match state.ct_rc {
            CT_NEW => state.has_nat_dest(),
            CT_ESTABLISHED_DNAT | CT_ESTABLISHED_SNAT => true,
            _ => false,
        };
        // Only act when we would bypass the stack; otherwise the stack
        // generates the error itself.
        if translating {
            return icmp_ttl_exceeded(ctx, cfg, state);
        }
    }

    match state.ct_rc {
        CT_NEW => {
            if state.pol_verdict != POL_ALLOW {
                debug!(ctx, "denied by policy");
                return Fwd::deny(REASON_POLICY_DENY);
            }

            if hook_from_workload(role)
                && cfg.drop_workload_to_host()
                && route_lookup(state.post_nat_ip_dst).is_some_and(|r| r.is_local_host())
            {
                debug!(ctx, "workload-to-host blocked by endpoint action");
                return Fwd::deny(REASON_POLICY_DENY);
            }

            let mut ct_flags = 0u8;
            if state.flags & ST_NAT_OUTGOING != 0 {
                ct_flags |= FLOW_FLAG_NAT_OUT;
            }

            if !state.has_nat_dest() {
                // Insert failure is tolerated: the packet already passed
                // policy, the next one retries the create.
                let _ = ct::create_normal(
                    state.ip_proto,
                    state.ip_src,
                    state.sport,
                    state.post_nat_ip_dst,
                    state.post_nat_dport,
                    ct_flags,
                );
                return Fwd::allow(seen_mark, fib);
            }

            handle_dnat(ctx, cfg, state, seen_mark, fib, true, ct_flags)
        }

        CT_ESTABLISHED_DNAT => {
            if from_hep && state.tun_src != 0 && state.ct_tun_ret == 0 {
                // Came back through the NAT tunnel already translated.
                debug!(ctx, "returned from nat tunnel");
                return Fwd::allow(MARK_BYPASS_FWD, fib);
            }
            state.post_nat_ip_dst = state.ct_nat_addr;
            state.post_nat_dport = state.ct_nat_port;
            handle_dnat(ctx, cfg, state, seen_mark, fib, false, 0)
        }

        CT_ESTABLISHED_SNAT => handle_snat(ctx, cfg, state, seen_mark, fib),

        CT_ESTABLISHED_BYPASS => Fwd::allow(MARK_BYPASS, fib),
        CT_ESTABLISHED => Fwd::allow(seen_mark, fib),

        _ => {
            if from_hep {
                // Host traffic may legitimately miss conntrack here; let
                // the host stack and its rules decide.
                return Fwd::allow(seen_mark, false);
            }
            Fwd::deny(REASON_CT_INVALID)
        }
    }
}

#[inline(always)]
fn handle_dnat(
    ctx: &TcContext,
    cfg: &DatapathConfig,
    state: &mut PacketState,
    seen_mark: u32,
    fib: bool,
    is_new: bool,
    ct_flags: u8,
) -> Fwd {
    let from_hep = hook_to_host(cfg.hook_role) && !hook_is_workload(cfg.hook_role);

    let mut encap = cfg.encap_enabled();
    let mut route = None;
    if encap {
        match route_lookup(state.post_nat_ip_dst) {
            None => return Fwd::deny(REASON_RT_UNKNOWN),
            Some(rt) => {
                encap = !rt.is_local();
                route = Some(rt);
            }
        }
    }

    if is_new {
        let mut flags = ct_flags;
        if cfg.dsr_enabled() && from_hep && encap && state.tun_src == 0 {
            flags |= FLOW_FLAG_DSR_FWD;
        }
        let _ = ct::create_nat_pair(
            state.ip_proto,
            state.ip_src,
            state.sport,
            state.ip_dst,
            state.dport,
            state.post_nat_ip_dst,
            state.post_nat_dport,
            state.tun_src,
            flags,
        );
    }

    if encap {
        let Ok(ip) = (unsafe { ptr_at::<Ipv4Hdr>(ctx, EthHdr::LEN) }) else {
            return Fwd::deny(REASON_SHORT);
        };
        if !(state.ip_proto == PROTO_TCP && skb_is_gso(ctx))
            && dnf_set(ip)
            && encap_oversized(ctx, cfg)
        {
            return icmp_too_big(ctx, cfg, state);
        }
        state.ip_src = cfg.host_ip;
        state.ip_dst = match route {
            Some(rt) if rt.is_workload() => rt.next_hop,
            _ => state.post_nat_ip_dst,
        };
        return do_encap(ctx, cfg, state, MARK_BYPASS_FWD, 0);
    }

    if rewrite_dst(ctx, state).is_err() {
        return Fwd::deny(REASON_CSUM_FAIL);
    }
    state.ip_dst = state.post_nat_ip_dst;
    state.dport = state.post_nat_dport;
    Fwd::allow(seen_mark, fib)
}

#[inline(always)]
fn handle_snat(
    ctx: &TcContext,
    cfg: &DatapathConfig,
    state: &mut PacketState,
    seen_mark: u32,
    fib: bool,
) -> Fwd {
    // Return traffic heading back into the tunnel is re-encapsulated on
    // workload egress.
    let return_encap =
        hook_from_workload(cfg.hook_role) && cfg.encap_enabled() && state.ct_tun_ret != 0;

    if return_encap {
        if cfg.dsr_enabled() {
            // DSR: the backend answers the client directly; SNAT happens
            // after routing, on host-endpoint egress.
            debug!(ctx, "dsr return, skipping snat and encap");
            return Fwd::allow(seen_mark, fib);
        }
        let Ok(ip) = (unsafe { ptr_at::<Ipv4Hdr>(ctx, EthHdr::LEN) }) else {
            return Fwd::deny(REASON_SHORT);
        };
        if !(state.ip_proto == PROTO_TCP && skb_is_gso(ctx))
            && dnf_set(ip)
            && encap_oversized(ctx, cfg)
        {
            return icmp_too_big(ctx, cfg, state);
        }
    }

    if rewrite_src(ctx, state).is_err() {
        return Fwd::deny(REASON_CSUM_FAIL);
    }

    if return_encap {
        // The outer source still carries the workload address; the
        // host-endpoint egress hook fixes it up, steered by the mark.
        state.ip_dst = state.ct_tun_ret;
        return do_encap(ctx, cfg, state, MARK_BYPASS_FWD_SRC_FIXUP, 0);
    }

    state.ip_src = state.ct_nat_addr;
    state.sport = state.ct_nat_port;
    Fwd::allow(seen_mark, fib)
}

// ── NAT rewrites ────────────────────────────────────────────────────

#[inline(always)]
fn l4_csum_off(ihl: usize, proto: u8) -> u32 {
    let l4 = EthHdr::LEN + ihl;
    match proto {
        PROTO_TCP => (l4 + 16) as u32,
        PROTO_UDP => (l4 + 6) as u32,
        _ => 0,
    }
}

/// Rewrite destination address/port with incremental checksum updates.
#[inline(always)]
fn rewrite_dst(ctx: &TcContext, state: &PacketState) -> Result<(), ()> {
    let ip = unsafe { ptr_at_mut::<Ipv4Hdr>(ctx, EthHdr::LEN)? };
    let ihl = (unsafe { (*ip).ihl() } as usize) * 4;
    let old_addr = state.ip_dst;
    let new_addr = state.post_nat_ip_dst;
    unsafe {
        (*ip).dst_addr = addr_bytes(new_addr);
    }

    let csum_off = l4_csum_off(ihl, state.ip_proto);
    if csum_off != 0 {
        let port_off = EthHdr::LEN + ihl + 2;
        let port = unsafe { ptr_at_mut::<u16>(ctx, port_off)? };
        let old_port = state.dport.to_be();
        let new_port = state.post_nat_dport.to_be();
        unsafe {
            *port = new_port;
        }
        nat_l4_csum(ctx, csum_off, old_addr, new_addr, old_port, new_port, state.ip_proto)?;
    }

    let ret = unsafe {
        bpf_l3_csum_replace(
            ctx.skb.skb as *mut _,
            L3_CSUM_OFF,
            old_addr as u64,
            new_addr as u64,
            4,
        )
    };
    if ret != 0 { Err(()) } else { Ok(()) }
}

/// Rewrite source address/port with incremental checksum updates.
#[inline(always)]
fn rewrite_src(ctx: &TcContext, state: &PacketState) -> Result<(), ()> {
    let ip = unsafe { ptr_at_mut::<Ipv4Hdr>(ctx, EthHdr::LEN)? };
    let ihl = (unsafe { (*ip).ihl() } as usize) * 4;
    let old_addr = state.ip_src;
    let new_addr = state.ct_nat_addr;
    unsafe {
        (*ip).src_addr = addr_bytes(new_addr);
    }

    let csum_off = l4_csum_off(ihl, state.ip_proto);
    if csum_off != 0 {
        let port_off = EthHdr::LEN + ihl;
        let port = unsafe { ptr_at_mut::<u16>(ctx, port_off)? };
        let old_port = state.sport.to_be();
        let new_port = state.ct_nat_port.to_be();
        unsafe {
            *port = new_port;
        }
        nat_l4_csum(ctx, csum_off, old_addr, new_addr, old_port, new_port, state.ip_proto)?;
    }

    let ret = unsafe {
        bpf_l3_csum_replace(
            ctx.skb.skb as *mut _,
            L3_CSUM_OFF,
            old_addr as u64,
            new_addr as u64,
            4,
        )
    };
    if ret != 0 { Err(()) } else { Ok(()) }
}

/// Incremental L4 checksum update for an address + port rewrite. The
/// address feeds the pseudo-header; UDP keeps its mangled-zero marker so
/// a zero checksum stays zero.
#[inline(always)]
fn nat_l4_csum(
    ctx: &TcContext,
    csum_off: u32,
    ip_from: u32,
    ip_to: u32,
    port_from: u16,
    port_to: u16,
    proto: u8,
) -> Result<(), ()> {
    let mangled = if proto == PROTO_UDP {
        BPF_F_MARK_MANGLED_0
    } else {
        0
    };

    let mut ret: c_long = 0;
    if ip_from != ip_to {
        ret = unsafe {
            bpf_l4_csum_replace(
                ctx.skb.skb as *mut _,
                csum_off,
                ip_from as u64,
                ip_to as u64,
                mangled | BPF_F_PSEUDO_HDR | 4,
            )
        };
    }
    if port_from != port_to {
        let rc = unsafe {
            bpf_l4_csum_replace(
                ctx.skb.skb as *mut _,
                csum_off,
                port_from as u64,
                port_to as u64,
                mangled | 2,
            )
        };
        ret |= rc;
    }
    if ret != 0 { Err(()) } else { Ok(()) }
}

// ── Fragment / MTU predicates ───────────────────────────────────────

#[inline(always)]
fn dnf_set(ip: *const Ipv4Hdr) -> bool {
    u16::from_be(unsafe { (*ip).frag_off }) & 0x4000 != 0
}

#[inline(always)]
fn is_later_fragment(ip: *const Ipv4Hdr) -> bool {
    u16::from_be(unsafe { (*ip).frag_off }) & 0x1fff != 0
}

#[inline(always)]
fn encap_oversized(ctx: &TcContext, cfg: &DatapathConfig) -> bool {
    ctx.len() - EthHdr::LEN as u32 + VXLAN_OVERHEAD > cfg.mtu as u32
}

// ── Synthesized ICMP errors ─────────────────────────────────────────

#[inline(always)]
fn icmp_ttl_exceeded(ctx: &TcContext, cfg: &DatapathConfig, state: &mut PacketState) -> Fwd {
    let Ok(ip) = (unsafe { ptr_at::<Ipv4Hdr>(ctx, EthHdr::LEN) }) else {
        return Fwd::deny(REASON_SHORT);
    };
    // Only the first fragment earns a reply; the rest die quietly.
    if is_later_fragment(ip) {
        return Fwd::deny(REASON_UNKNOWN);
    }
    if icmp_v4_reply(ctx, cfg, ICMP_TIME_EXCEEDED, 0, 0).is_err() {
        return Fwd::deny(REASON_UNKNOWN);
    }

    // The reply goes back to the original sender through the stack.
    state.ip_dst = state.ip_src;
    state.ip_src = cfg.host_ip;
    state.sport = 0;
    state.dport = 0;
    state.ip_proto = PROTO_ICMP;
    Fwd::allow(MARK_SEEN, false)
}

#[inline(always)]
fn icmp_too_big(ctx: &TcContext, cfg: &DatapathConfig, state: &mut PacketState) -> Fwd {
    let next_hop_mtu = cfg.mtu.saturating_sub(VXLAN_OVERHEAD as u16);
    if icmp_v4_reply(ctx, cfg, ICMP_DEST_UNREACH, ICMP_FRAG_NEEDED, next_hop_mtu as u32).is_err() {
        return Fwd::deny(REASON_ICMP_DF);
    }
    // The original packet dies here even though the reply goes out.
    crate::count_drop(REASON_ICMP_DF);

    state.ip_dst = state.ip_src;
    state.ip_src = cfg.host_ip;
    state.sport = 0;
    state.dport = 0;
    state.ip_proto = PROTO_ICMP;

    let mut fwd = Fwd::allow(MARK_BYPASS_FWD, true);
    fwd.fib_flags |= BPF_FIB_LOOKUP_OUTPUT;
    fwd.reason = REASON_ICMP_DF;
    if hook_from_workload(cfg.hook_role) {
        // Came from a workload: just turn it around on the same veth.
        fwd.res = RES_REDIR_IFINDEX;
    }
    fwd
}

/// Replace the packet in place with an ICMP error carrying the original
/// IP header plus 8 payload bytes, per RFC 792.
#[inline(always)]
fn icmp_v4_reply(
    ctx: &TcContext,
    cfg: &DatapathConfig,
    icmp_type: u8,
    icmp_code: u8,
    extra: u32,
) -> Result<(), ()> {
    let orig: [u8; 28] = ctx.load(EthHdr::LEN).map_err(|_| ())?;

    let mut ip = [0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&56u16.to_be_bytes()); // 20 + 8 + 28
    ip[8] = 64;
    ip[9] = PROTO_ICMP;
    ip[12..16].copy_from_slice(&addr_bytes(cfg.host_ip));
    ip[16..20].copy_from_slice(&orig[12..16]); // reply to the original source
    let check = csum::ipv4_header_checksum(&ip);
    ip[10..12].copy_from_slice(&check.to_be_bytes());

    let mut icmp = [0u8; 8];
    icmp[0] = icmp_type;
    icmp[1] = icmp_code;
    icmp[4..8].copy_from_slice(&extra.to_be_bytes());
    let mut sum = csum::ones_complement_add(&icmp, 0);
    sum = csum::ones_complement_add(&orig, sum);
    let icmp_check = !csum::fold(sum);
    icmp[2..4].copy_from_slice(&icmp_check.to_be_bytes());

    let total = (EthHdr::LEN + 56) as u32;
    let ret = unsafe { bpf_skb_change_tail(ctx.skb.skb as *mut _, total, 0) };
    if ret != 0 {
        return Err(());
    }

    store(ctx, EthHdr::LEN as u32, &ip)?;
    store(ctx, (EthHdr::LEN + 20) as u32, &icmp)?;
    store(ctx, (EthHdr::LEN + 28) as u32, &orig)?;
    Ok(())
}

// ── VXLAN ───────────────────────────────────────────────────────────

/// Strip the outer Ethernet-to-VXLAN envelope, leaving the inner IP
/// packet behind the original Ethernet header.
#[inline(always)]
pub fn vxlan_decap(ctx: &TcContext) -> Result<(), ()> {
    let ret = unsafe {
        bpf_skb_adjust_room(
            ctx.skb.skb as *mut _,
            -(VXLAN_OVERHEAD as i32),
            BPF_ADJ_ROOM_MAC,
            0,
        )
    };
    if ret != 0 { Err(()) } else { Ok(()) }
}

/// Push the VXLAN envelope and finish with the outer tuple in `state`.
#[inline(always)]
fn do_encap(
    ctx: &TcContext,
    cfg: &DatapathConfig,
    state: &mut PacketState,
    mark: u32,
    fib_flags: u32,
) -> Fwd {
    if vxlan_encap(ctx, cfg, state.ip_src, state.ip_dst).is_err() {
        return Fwd::deny(REASON_ENCAP_FAIL);
    }

    state.sport = cfg.vxlan_port;
    state.dport = cfg.vxlan_port;
    state.ip_proto = PROTO_UDP;

    let mut fwd = Fwd::allow(mark, true);
    fwd.fib_flags = fib_flags;
    if hook_to_host(cfg.hook_role) {
        fwd.fib_flags |= BPF_FIB_LOOKUP_OUTPUT;
    }
    fwd
}

#[inline(always)]
fn vxlan_encap(ctx: &TcContext, cfg: &DatapathConfig, outer_src: u32, outer_dst: u32) -> Result<(), ()> {
    let inner_eth: [u8; 14] = ctx.load(0).map_err(|_| ())?;
    let inner_ip_len = ctx.len() - EthHdr::LEN as u32;

    let room_flags = BPF_F_ADJ_ROOM_ENCAP_L3_IPV4
        | BPF_F_ADJ_ROOM_ENCAP_L4_UDP
        | ((EthHdr::LEN as u64) << BPF_F_ADJ_ROOM_ENCAP_L2_SHIFT);
    let ret = unsafe {
        bpf_skb_adjust_room(
            ctx.skb.skb as *mut _,
            VXLAN_OVERHEAD as i32,
            BPF_ADJ_ROOM_MAC,
            room_flags,
        )
    };
    if ret != 0 {
        return Err(());
    }

    // Outer IP + UDP + VXLAN in one buffer.
    let mut hdr = [0u8; 36];
    hdr[0] = 0x45;
    let tot_len = (inner_ip_len + VXLAN_OVERHEAD) as u16;
    hdr[2..4].copy_from_slice(&tot_len.to_be_bytes());
    hdr[8] = 64;
    hdr[9] = PROTO_UDP;
    hdr[12..16].copy_from_slice(&addr_bytes(outer_src));
    hdr[16..20].copy_from_slice(&addr_bytes(outer_dst));
    let check = csum::ipv4_header_checksum(&hdr[..20]);
    hdr[10..12].copy_from_slice(&check.to_be_bytes());

    hdr[20..22].copy_from_slice(&cfg.vxlan_port.to_be_bytes());
    hdr[22..24].copy_from_slice(&cfg.vxlan_port.to_be_bytes());
    let udp_len = (inner_ip_len + VXLAN_OVERHEAD - 20) as u16;
    hdr[24..26].copy_from_slice(&udp_len.to_be_bytes());
    // UDP checksum stays zero for the overlay.

    hdr[28] = 0x08; // VNI present
    hdr[32..36].copy_from_slice(&(cfg.vxlan_vni << 8).to_be_bytes());

    store(ctx, EthHdr::LEN as u32, &hdr)?;
    store(ctx, (EthHdr::LEN + 36) as u32, &inner_eth)?;
    Ok(())
}

// ── Bypass fixup fast path ──────────────────────────────────────────

/// Egress fast path for frames marked "approved, fix the source": the
/// outer source must become the host address.
#[inline(always)]
pub fn bypass_with_src_fixup(
    ctx: &TcContext,
    cfg: &DatapathConfig,
    state: &PacketState,
) -> Result<i32, u32> {
    let ip = unsafe { ptr_at_mut::<Ipv4Hdr>(ctx, EthHdr::LEN).map_err(|_| REASON_SHORT)? };
    let src = u32::from_ne_bytes(unsafe { (*ip).src_addr });
    if src == cfg.host_ip {
        return forward_or_drop(ctx, cfg, state, Fwd::allow(MARK_SEEN, false));
    }

    unsafe {
        (*ip).src_addr = addr_bytes(cfg.host_ip);
    }
    let ret = unsafe {
        bpf_l3_csum_replace(
            ctx.skb.skb as *mut _,
            L3_CSUM_OFF,
            src as u64,
            cfg.host_ip as u64,
            4,
        )
    };
    if ret != 0 {
        return Err(REASON_CSUM_FAIL);
    }
    forward_or_drop(ctx, cfg, state, Fwd::allow(MARK_SEEN, false))
}

// ── FIB and final verdict ───────────────────────────────────────────

/// Kernel `struct bpf_fib_lookup`, flattened (the bindgen type hides the
/// unions behind anonymous fields).
#[repr(C)]
struct FibLookupParams {
    family: u8,
    l4_protocol: u8,
    sport: u16,
    dport: u16,
    tot_len: u16,
    ifindex: u32,
    tos: u32,
    src: [u32; 4],
    dst: [u32; 4],
    h_vlan: u32,
    smac: [u8; 6],
    dmac: [u8; 6],
}

const AF_INET: u8 = 2;

/// Convert the accepted-path outcome into the TC verdict, applying the
/// FIB short-circuit and mark propagation on the way out.
#[inline(always)]
pub fn forward_or_drop(
    ctx: &TcContext,
    cfg: &DatapathConfig,
    state: &PacketState,
    fwd: Fwd,
) -> Result<i32, u32> {
    let mut res = fwd.res;

    if res == TC_ACT_SHOT {
        return Err(fwd.reason);
    }

    if res == RES_REDIR_IFINDEX {
        // Turn the frame around: swap MACs, send it back where it came
        // from.
        let eth = unsafe { ptr_at_mut::<EthHdr>(ctx, 0).map_err(|_| REASON_SHORT)? };
        unsafe {
            let src = (*eth).src_addr;
            (*eth).src_addr = (*eth).dst_addr;
            (*eth).dst_addr = src;
        }
        let redir_flags = if cfg.hook_role == HOOK_FROM_HOST {
            BPF_F_INGRESS
        } else {
            0
        };
        let rc = unsafe { bpf_redirect(skb_ifindex(ctx), redir_flags) };
        if rc == TC_ACT_REDIRECT as c_long {
            if hook_to_host(cfg.hook_role) {
                skb_set_mark(ctx, fwd.mark);
            }
            return Ok(TC_ACT_REDIRECT);
        }
        return Err(fwd.reason);
    }

    if fwd.fib && cfg.fib_enabled() && hook_to_host(cfg.hook_role) {
        res = fib_forward(ctx, state, fwd.fib_flags).unwrap_or(TC_ACT_UNSPEC);
    }

    if hook_to_host(cfg.hook_role) {
        // Downstream hooks must know they are not the first to see this
        // frame. Whole-word write; see the mark constants.
        skb_set_mark(ctx, fwd.mark);
    }

    Ok(res)
}

/// FIB short-circuit: on a hit, rewrite MACs, decrement TTL, and redirect
/// straight to the egress interface. Any failure falls back to the stack.
#[inline(always)]
fn fib_forward(ctx: &TcContext, state: &PacketState, fib_flags: u32) -> Result<i32, u32> {
    let ip = unsafe { ptr_at::<Ipv4Hdr>(ctx, EthHdr::LEN).map_err(|_| REASON_SHORT)? };

    let mut params = FibLookupParams {
        family: AF_INET,
        l4_protocol: state.ip_proto,
        sport: state.sport.to_be(),
        dport: state.dport.to_be(),
        tot_len: u16::from_be(unsafe { (*ip).tot_len }),
        ifindex: skb_ingress_ifindex(ctx),
        tos: 0,
        src: [state.ip_src, 0, 0, 0],
        dst: [state.ip_dst, 0, 0, 0],
        h_vlan: 0,
        smac: [0; 6],
        dmac: [0; 6],
    };

    let rc = unsafe {
        bpf_fib_lookup(
            ctx.skb.skb as *mut _,
            &mut params as *mut _ as *mut _,
            mem::size_of::<FibLookupParams>() as i32,
            fib_flags,
        )
    };
    if rc != 0 {
        // Miss or bad input: the stack can still route it.
        return Ok(TC_ACT_UNSPEC);
    }

    // We are about to bypass the stack; leave expiring packets to it.
    let ip = unsafe { ptr_at_mut::<Ipv4Hdr>(ctx, EthHdr::LEN).map_err(|_| REASON_SHORT)? };
    let ttl = unsafe { (*ip).ttl };
    if ttl <= 1 {
        return Ok(TC_ACT_UNSPEC);
    }

    let eth = unsafe { ptr_at_mut::<EthHdr>(ctx, 0).map_err(|_| REASON_SHORT)? };
    unsafe {
        (*eth).src_addr = params.smac;
        (*eth).dst_addr = params.dmac;
    }

    let rc = unsafe { bpf_redirect(params.ifindex, 0) };
    if rc == TC_ACT_REDIRECT as c_long {
        // Committed to the bypass; account for the skipped routing hop.
        let ip = unsafe { ptr_at_mut::<Ipv4Hdr>(ctx, EthHdr::LEN).map_err(|_| REASON_SHORT)? };
        unsafe {
            let proto = (*ip).proto as u8;
            let old16 = ((ttl as u16) << 8) | proto as u16;
            let new16 = (((ttl - 1) as u16) << 8) | proto as u16;
            let check = u16::from_be((*ip).check);
            (*ip).ttl = ttl - 1;
            (*ip).check = csum::replace_u16(check, old16, new16).to_be();
        }
        return Ok(TC_ACT_REDIRECT);
    }

    Ok(TC_ACT_UNSPEC)
}
