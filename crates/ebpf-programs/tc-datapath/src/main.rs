#![no_std]
#![no_main]

mod ct;
mod fwd;
mod nat;

use aya_ebpf::{
    bindings::{TC_ACT_SHOT, TC_ACT_UNSPEC},
    helpers::bpf_ktime_get_ns,
    macros::{classifier, map},
    maps::{Array, HashMap, LpmTrie, PerCpuArray, ProgramArray},
    programs::TcContext,
};
use aya_log_ebpf::debug;
use core::mem;
use ebpf_common::{
    conntrack::{icmp_ports, FlowEntry, FlowKey, TcpFlags, CT_MAX_FLOWS, FLOW_FLAG_NAT_OUT},
    nat::{
        AffinityKey, AffinityValue, BackendKey, BackendValue, FrontendKey, FrontendValue,
        NAT_AFF_MAX_ENTRIES, NAT_BE_MAX_ENTRIES, NAT_FE_MAX_ENTRIES,
    },
    policy::{evaluate_rules, PacketMatch, PolicyRuleEntry, POLICY_MAX_RULES},
    reasons::{REASON_COUNT, REASON_DECAP_FAIL, REASON_SHORT, REASON_UNKNOWN},
    routes::{RouteValue, ROUTE_MAX_ENTRIES},
    state::{
        hook_from_workload, hook_is_hep, hook_is_workload, hook_to_host,
        hook_to_workload_or_hep, DatapathConfig, HOOK_TO_WORKLOAD,
        PacketState, CT_NEW, JUMP_SLOTS, JUMP_SLOT_ACCEPTED, JUMP_SLOT_POLICY, MARK_BYPASS,
        MARK_BYPASS_FWD, MARK_BYPASS_FWD_SRC_FIXUP, MARK_SEEN, POL_ALLOW, POL_DENY, POL_NO_MATCH,
        ST_NAT_OUTGOING,
    },
};
use network_types::{eth::EthHdr, ip::Ipv4Hdr, tcp::TcpHdr, udp::UdpHdr};

use crate::fwd::Fwd;

// ── Constants ───────────────────────────────────────────────────────

const ETH_P_IP: u32 = 0x0800;
const ETH_P_ARP: u32 = 0x0806;
const ETH_P_IPV6: u32 = 0x86DD;
const PROTO_ICMP: u8 = 1;
const PROTO_IPIP: u8 = 4;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

/// Offset of the L3 checksum field from the start of the frame.
pub const L3_CSUM_OFF: u32 = (EthHdr::LEN + 10) as u32;

// ── Inline header types ─────────────────────────────────────────────

#[repr(C)]
pub struct IcmpTypeCode {
    pub icmp_type: u8,
    pub icmp_code: u8,
}

// ── Maps ────────────────────────────────────────────────────────────

/// Flow table shared by every datapath hook on this node.
#[map]
pub static CT_FLOWS: HashMap<FlowKey, FlowEntry> = HashMap::with_max_entries(CT_MAX_FLOWS, 0);

/// Service frontends: LPM over (dst, port, proto) + client source CIDR.
#[map]
pub static NAT_FRONTENDS: LpmTrie<FrontendKey, FrontendValue> =
    LpmTrie::with_max_entries(NAT_FE_MAX_ENTRIES, 0);

/// Backend pool: (backend id, ordinal) → endpoint.
#[map]
pub static NAT_BACKENDS: HashMap<BackendKey, BackendValue> =
    HashMap::with_max_entries(NAT_BE_MAX_ENTRIES, 0);

/// Client-IP session affinity.
#[map]
pub static NAT_AFFINITY: HashMap<AffinityKey, AffinityValue> =
    HashMap::with_max_entries(NAT_AFF_MAX_ENTRIES, 0);

/// Route table: CIDR → locality flags + ifindex/next hop.
#[map]
static ROUTES: LpmTrie<u32, RouteValue> = LpmTrie::with_max_entries(ROUTE_MAX_ENTRIES, 0);

/// Compiled policy rules, evaluated in order by the policy tail.
#[map]
static POLICY_RULES: Array<PolicyRuleEntry> = Array::with_max_entries(POLICY_MAX_RULES, 0);

/// Number of active policy rules.
#[map]
static POLICY_RULE_COUNT: Array<u32> = Array::with_max_entries(1, 0);

/// Per-CPU scratch slot carrying packet state across tail calls.
#[map]
static SCRATCH_STATE: PerCpuArray<PacketState> = PerCpuArray::with_max_entries(1, 0);

/// Tail-call targets: slot 0 = policy, slot 1 = accepted.
#[map]
static JUMP_TABLE: ProgramArray = ProgramArray::with_max_entries(JUMP_SLOTS, 0);

/// Per-CPU drop counters indexed by reason code.
#[map]
static DROP_COUNTERS: PerCpuArray<u64> = PerCpuArray::with_max_entries(REASON_COUNT, 0);

/// Loader-injected configuration (the compile-time constants of the
/// original design).
#[map]
static DATAPATH_CONFIG: Array<DatapathConfig> = Array::with_max_entries(1, 0);

// ── Shared helpers ──────────────────────────────────────────────────

#[inline(always)]
pub unsafe fn ptr_at<T>(ctx: &TcContext, offset: usize) -> Result<*const T, ()> {
    let start = ctx.data();
    let end = ctx.data_end();
    let len = mem::size_of::<T>();
    if start + offset + len > end {
        return Err(());
    }
    Ok((start + offset) as *const T)
}

#[inline(always)]
pub unsafe fn ptr_at_mut<T>(ctx: &TcContext, offset: usize) -> Result<*mut T, ()> {
    let ptr = ptr_at::<T>(ctx, offset)?;
    Ok(ptr as *mut T)
}

#[inline(always)]
pub fn count_drop(reason: u32) {
    if let Some(counter) = DROP_COUNTERS.get_ptr_mut(reason) {
        unsafe {
            *counter += 1;
        }
    }
}

#[inline(always)]
pub fn skb_mark(ctx: &TcContext) -> u32 {
    unsafe { (*ctx.skb.skb).mark }
}

#[inline(always)]
pub fn skb_set_mark(ctx: &TcContext, mark: u32) {
    unsafe {
        (*ctx.skb.skb).mark = mark;
    }
}

#[inline(always)]
pub fn skb_ifindex(ctx: &TcContext) -> u32 {
    unsafe { (*ctx.skb.skb).ifindex }
}

#[inline(always)]
pub fn skb_ingress_ifindex(ctx: &TcContext) -> u32 {
    unsafe { (*ctx.skb.skb).ingress_ifindex }
}

#[inline(always)]
fn skb_ethertype(ctx: &TcContext) -> u32 {
    u16::from_be(unsafe { (*ctx.skb.skb).protocol } as u16) as u32
}

/// Longest-prefix route lookup for an address in network byte order.
#[inline(always)]
pub fn route_lookup(addr: u32) -> Option<RouteValue> {
    let key = aya_ebpf::maps::lpm_trie::Key::new(32, addr);
    ROUTES.get(&key).copied()
}

#[inline(always)]
pub fn config() -> Option<DatapathConfig> {
    DATAPATH_CONFIG.get(0).copied()
}

// ── Entry point ─────────────────────────────────────────────────────

#[classifier]
pub fn tc_datapath(ctx: TcContext) -> i32 {
    let Some(cfg) = config() else {
        // Not configured yet; let the stack have it.
        return TC_ACT_UNSPEC;
    };
    match try_datapath(&ctx, &cfg) {
        Ok(verdict) => verdict,
        Err(reason) => {
            count_drop(reason);
            TC_ACT_SHOT
        }
    }
}

#[inline(always)]
fn try_datapath(ctx: &TcContext, cfg: &DatapathConfig) -> Result<i32, u32> {
    let mut state = PacketState::zeroed();
    state.prog_start_ns = unsafe { bpf_ktime_get_ns() };

    let role = cfg.hook_role;
    let mark = skb_mark(ctx);

    // Pre-approved by another hook: pass without touching conntrack.
    if !hook_to_host(role) && mark == MARK_BYPASS {
        return fwd::forward_or_drop(ctx, cfg, &state, Fwd::allow(MARK_SEEN, false));
    }

    if hook_to_workload_or_hep(role) {
        if mark == MARK_BYPASS_FWD {
            return fwd::forward_or_drop(ctx, cfg, &state, Fwd::allow(MARK_SEEN, false));
        }
        if mark == MARK_BYPASS_FWD_SRC_FIXUP {
            return fwd::bypass_with_src_fixup(ctx, cfg, &state);
        }
    }

    match skb_ethertype(ctx) {
        ETH_P_IP => {}
        ETH_P_ARP => {
            // The stack answers ARP; no FIB short-circuit for it.
            return fwd::forward_or_drop(ctx, cfg, &state, Fwd::allow(MARK_SEEN, false));
        }
        ETH_P_IPV6 => {
            // IPv6 belongs to an external handler.
            if hook_is_workload(role) {
                return Err(REASON_UNKNOWN);
            }
            return Ok(TC_ACT_UNSPEC);
        }
        _ => {
            if hook_is_workload(role) {
                return Err(REASON_UNKNOWN);
            }
            return Ok(TC_ACT_UNSPEC);
        }
    }

    let mut ip = unsafe { ptr_at::<Ipv4Hdr>(ctx, EthHdr::LEN).map_err(|_| REASON_SHORT)? };

    // VXLAN decap: host ingress only, outer destination must be us.
    if hook_to_host(role)
        && !hook_is_workload(role)
        && cfg.decap_enabled()
        && unsafe { (*ip).proto } as u8 == PROTO_UDP
    {
        let l4 = EthHdr::LEN + ip_header_len(ip);
        if let Ok(udp) = unsafe { ptr_at::<UdpHdr>(ctx, l4) } {
            let dport = u16::from_be(unsafe { (*udp).dst });
            let outer_dst = u32::from_ne_bytes(unsafe { (*ip).dst_addr });
            if dport == cfg.vxlan_port && outer_dst == cfg.host_ip {
                state.tun_src = u32::from_ne_bytes(unsafe { (*ip).src_addr });
                debug!(ctx, "vxlan decap, tunnel src {:i}", u32::from_be(state.tun_src));
                fwd::vxlan_decap(ctx).map_err(|_| REASON_DECAP_FAIL)?;
                ip = unsafe { ptr_at::<Ipv4Hdr>(ctx, EthHdr::LEN).map_err(|_| REASON_SHORT)? };
            }
        }
    }

    let ihl = ip_header_len(ip);
    let l4_off = EthHdr::LEN + ihl;
    state.ip_proto = unsafe { (*ip).proto } as u8;
    state.ip_src = u32::from_ne_bytes(unsafe { (*ip).src_addr });
    state.ip_dst = u32::from_ne_bytes(unsafe { (*ip).dst_addr });

    let mut tcp_flags = TcpFlags::default();
    match state.ip_proto {
        PROTO_TCP => {
            // TCP headers are longer than the minimum we validated above;
            // re-check before reading flags.
            let tcp = unsafe { ptr_at::<TcpHdr>(ctx, l4_off).map_err(|_| REASON_SHORT)? };
            state.sport = u16::from_be(unsafe { (*tcp).source });
            state.dport = u16::from_be(unsafe { (*tcp).dest });
            tcp_flags = ct::tcp_flags_of(tcp);
        }
        PROTO_UDP => {
            let udp = unsafe { ptr_at::<UdpHdr>(ctx, l4_off).map_err(|_| REASON_SHORT)? };
            state.sport = u16::from_be(unsafe { (*udp).src });
            state.dport = u16::from_be(unsafe { (*udp).dst });
        }
        PROTO_ICMP => {
            let icmp = unsafe { ptr_at::<IcmpTypeCode>(ctx, l4_off).map_err(|_| REASON_SHORT)? };
            let (sport, dport) =
                icmp_ports(unsafe { (*icmp).icmp_type }, unsafe { (*icmp).icmp_code });
            state.sport = sport;
            state.dport = dport;
        }
        PROTO_IPIP if hook_is_hep(role) => {
            // Tunnel traffic between nodes; the stack terminates it.
            return fwd::forward_or_drop(ctx, cfg, &state, Fwd::allow(MARK_SEEN, false));
        }
        _ => {
            // Non-port protocol: pass on host hooks, drop on workload hooks.
            if !hook_is_workload(role) {
                return Ok(TC_ACT_UNSPEC);
            }
            return Err(REASON_UNKNOWN);
        }
    }

    // Conntrack before anything else.
    let ct_result = ct::lookup(&state, tcp_flags);
    state.ct_rc = ct_result.rc;
    state.ct_flags = ct_result.flags;
    state.ct_nat_addr = ct_result.nat_addr;
    state.ct_nat_port = ct_result.nat_port;
    state.ct_tun_ret = ct_result.tun_ret;
    if ct_result.flags & FLOW_FLAG_NAT_OUT != 0 {
        state.flags |= ST_NAT_OUTGOING;
    }

    // A conntrack hit skips policy entirely.
    if state.ct_rc != CT_NEW {
        let fwd_res = fwd::finish_accepted(ctx, cfg, &mut state);
        return fwd::forward_or_drop(ctx, cfg, &state, fwd_res);
    }

    // New flow: consult the service NAT tables.
    match nat::frontend_lookup(&state) {
        nat::NatLookup::Blackhole => {
            debug!(ctx, "frontend restricted to source ranges, drop");
            return Err(ebpf_common::reasons::REASON_POLICY_DENY);
        }
        nat::NatLookup::Backend(dest) => {
            state.nat_dest_addr = dest.addr;
            state.nat_dest_port = dest.port;
            state.post_nat_ip_dst = dest.addr;
            state.post_nat_dport = dest.port;
        }
        nat::NatLookup::None => {
            state.post_nat_ip_dst = state.ip_dst;
            state.post_nat_dport = state.dport;
        }
    }

    // Traffic from the local host to a workload is always allowed, unless
    // another hook already saw the frame (then it came from elsewhere).
    if role == HOOK_TO_WORKLOAD
        && mark != MARK_SEEN
        && route_lookup(state.ip_src).is_some_and(|r| r.is_local_host())
    {
        state.pol_verdict = POL_ALLOW;
        let fwd_res = fwd::finish_accepted(ctx, cfg, &mut state);
        return fwd::forward_or_drop(ctx, cfg, &state, fwd_res);
    }

    // RPF: a workload may only source addresses routed to its interface.
    if hook_from_workload(role) {
        let Some(route) = route_lookup(state.ip_src) else {
            debug!(ctx, "workload rpf fail: no route");
            return Err(REASON_UNKNOWN);
        };
        if !route.is_local_workload() {
            debug!(ctx, "workload rpf fail: not a local workload");
            return Err(REASON_UNKNOWN);
        }
        if route.if_index != skb_ifindex(ctx) {
            debug!(ctx, "workload rpf fail: wrong interface");
            return Err(REASON_UNKNOWN);
        }
        // NAT-outgoing: masquerade flows leaving the pool.
        if route.nat_outgoing()
            && !route_lookup(state.post_nat_ip_dst).is_some_and(|r| r.in_pool())
        {
            state.flags |= ST_NAT_OUTGOING;
        }
    }

    // Hand off through the scratch slot and tail-call.
    let Some(slot) = SCRATCH_STATE.get_ptr_mut(0) else {
        return Err(REASON_UNKNOWN);
    };
    state.pol_verdict = POL_NO_MATCH;
    unsafe {
        *slot = state;
    }

    if hook_is_hep(role) {
        // Host-endpoint policy is not supported yet: enter the accepted
        // program with the verdict forced to allow.
        unsafe {
            (*slot).pol_verdict = POL_ALLOW;
            let _ = JUMP_TABLE.tail_call(ctx, JUMP_SLOT_ACCEPTED);
        }
        return Ok(TC_ACT_UNSPEC);
    }

    unsafe {
        let _ = JUMP_TABLE.tail_call(ctx, JUMP_SLOT_POLICY);
    }
    // A failed tail call means the jump table was never wired: drop.
    Err(REASON_UNKNOWN)
}

#[inline(always)]
fn ip_header_len(ip: *const Ipv4Hdr) -> usize {
    (unsafe { (*ip).ihl() } as usize) * 4
}

// ── Policy tail (jump slot 0) ───────────────────────────────────────

#[classifier]
pub fn tc_datapath_policy(ctx: TcContext) -> i32 {
    match try_policy(&ctx) {
        Ok(verdict) => verdict,
        Err(reason) => {
            count_drop(reason);
            TC_ACT_SHOT
        }
    }
}

#[inline(always)]
fn try_policy(ctx: &TcContext) -> Result<i32, u32> {
    let Some(state) = SCRATCH_STATE.get_ptr_mut(0) else {
        return Err(REASON_UNKNOWN);
    };

    let pkt = unsafe {
        PacketMatch {
            protocol: (*state).ip_proto,
            saddr: u32::from_be((*state).ip_src),
            daddr: u32::from_be((*state).ip_dst),
            sport: (*state).sport,
            dport: (*state).dport,
            icmp_type: ((*state).sport >> 8) as u8,
            icmp_code: ((*state).sport & 0xff) as u8,
        }
    };

    let default_verdict = if cfg!(feature = "default-allow") {
        POL_ALLOW
    } else {
        POL_NO_MATCH
    };

    let count = POLICY_RULE_COUNT.get(0).copied().unwrap_or(0);
    let mut verdict = default_verdict;
    let mut i = 0u32;
    while i < POLICY_MAX_RULES {
        if i >= count {
            break;
        }
        if let Some(rule) = POLICY_RULES.get(i) {
            match evaluate_rules(core::slice::from_ref(rule), &pkt, POL_NO_MATCH) {
                POL_ALLOW => {
                    verdict = POL_ALLOW;
                    break;
                }
                POL_DENY => {
                    verdict = POL_DENY;
                    break;
                }
                _ => {}
            }
        }
        i += 1;
    }

    unsafe {
        (*state).pol_verdict = verdict;
        let _ = JUMP_TABLE.tail_call(ctx, JUMP_SLOT_ACCEPTED);
    }
    Err(REASON_UNKNOWN)
}

// ── Accepted tail (jump slot 1) ─────────────────────────────────────

#[classifier]
pub fn tc_datapath_accepted(ctx: TcContext) -> i32 {
    let Some(cfg) = config() else {
        return TC_ACT_UNSPEC;
    };
    match try_accepted(&ctx, &cfg) {
        Ok(verdict) => verdict,
        Err(reason) => {
            count_drop(reason);
            TC_ACT_SHOT
        }
    }
}

#[inline(always)]
fn try_accepted(ctx: &TcContext, cfg: &DatapathConfig) -> Result<i32, u32> {
    let Some(slot) = SCRATCH_STATE.get_ptr_mut(0) else {
        return Err(REASON_UNKNOWN);
    };
    let mut state = unsafe { *slot };

    unsafe { ptr_at::<Ipv4Hdr>(ctx, EthHdr::LEN).map_err(|_| REASON_SHORT)? };

    let fwd_res = fwd::finish_accepted(ctx, cfg, &mut state);
    fwd::forward_or_drop(ctx, cfg, &state, fwd_res)
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
