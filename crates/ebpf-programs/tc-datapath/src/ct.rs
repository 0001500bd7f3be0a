//! In-kernel conntrack: lookup, creation, and per-packet updates.
//!
//! Lookup canonicalizes the observed tuple and resolves NAT twin entries
//! (forward pointer → reverse book-keeping). Updates are strictly
//! monotonic: bit-OR for TCP state, max for `last_seen`, so concurrent
//! CPUs converge.

use aya_ebpf::cty::c_long;
use aya_ebpf::helpers::bpf_ktime_get_ns;
use ebpf_common::conntrack::{
    apply_tcp_flags, resolve_nat, FlowEntry, FlowKey, NatDirection, TcpFlags,
    DEFAULT_TCP_RESET_SEEN_NS, FLOW_TYPE_NAT_FORWARD, FLOW_TYPE_NAT_REVERSE, FLOW_TYPE_NORMAL,
    FLOW_FLAG_BYPASS,
};
use ebpf_common::state::{
    PacketState, CT_ESTABLISHED, CT_ESTABLISHED_BYPASS, CT_ESTABLISHED_DNAT, CT_ESTABLISHED_SNAT,
    CT_INVALID, CT_NEW,
};
use network_types::tcp::TcpHdr;

use crate::CT_FLOWS;

const TCP_FIN: u8 = 0x01;
const TCP_SYN: u8 = 0x02;
const TCP_RST: u8 = 0x04;
const TCP_ACK: u8 = 0x10;

/// Result of the conntrack stage, copied into the scratch state.
#[derive(Clone, Copy)]
pub struct CtResult {
    pub rc: u8,
    pub flags: u8,
    pub nat_addr: u32,
    pub nat_port: u16,
    pub tun_ret: u32,
}

impl CtResult {
    const fn miss() -> Self {
        Self {
            rc: CT_NEW,
            flags: 0,
            nat_addr: 0,
            nat_port: 0,
            tun_ret: 0,
        }
    }
}

/// Extract the flag bits from a TCP header.
#[inline(always)]
pub fn tcp_flags_of(th: *const TcpHdr) -> TcpFlags {
    let bits = unsafe { (*th)._bitfield_1.get(0, 16) };
    let flags = (bits >> 8) as u8;
    TcpFlags {
        syn: flags & TCP_SYN != 0,
        ack: flags & TCP_ACK != 0,
        fin: flags & TCP_FIN != 0,
        rst: flags & TCP_RST != 0,
    }
}

/// Look up the flow for the current packet and fold its TCP flags in.
#[inline(always)]
pub fn lookup(state: &PacketState, tcp: TcpFlags) -> CtResult {
    let now = unsafe { bpf_ktime_get_ns() };
    let src = (state.ip_src, state.sport);
    let dst = (state.ip_dst, state.dport);

    let key = FlowKey::new(state.ip_proto, src.0, src.1, dst.0, dst.1);
    let mut found = CT_FLOWS.get_ptr_mut(&key);
    let mut found_key = key;

    // Return flows that arrived through the tunnel were tracked under the
    // decap origin, not the inner destination.
    if found.is_none() && state.tun_src != 0 {
        let alt = FlowKey::new(state.ip_proto, src.0, src.1, state.tun_src, state.dport);
        found = CT_FLOWS.get_ptr_mut(&alt);
        found_key = alt;
    }

    let Some(entry) = found else {
        return CtResult::miss();
    };

    match unsafe { (*entry).entry_type } {
        FLOW_TYPE_NORMAL => {
            if tcp_reset_stale(entry, state.ip_proto, now) {
                return invalid(entry);
            }
            unsafe { touch(entry, &found_key, src, tcp, now) };
            let flags = unsafe { (*entry).flags };
            CtResult {
                rc: if flags & FLOW_FLAG_BYPASS != 0 {
                    CT_ESTABLISHED_BYPASS
                } else {
                    CT_ESTABLISHED
                },
                flags,
                nat_addr: 0,
                nat_port: 0,
                tun_ret: 0,
            }
        }
        FLOW_TYPE_NAT_REVERSE => {
            if tcp_reset_stale(entry, state.ip_proto, now) {
                return invalid(entry);
            }
            unsafe { touch(entry, &found_key, src, tcp, now) };
            nat_result(entry, &found_key, src, dst)
        }
        FLOW_TYPE_NAT_FORWARD => {
            // Chase the pointer to the reverse entry where the
            // book-keeping lives.
            let rev_key = unsafe { (*entry).rev_key };
            let Some(rev) = CT_FLOWS.get_ptr_mut(&rev_key) else {
                // Dangling forward pointer; the sweeper will collect it.
                return CtResult::miss();
            };
            if tcp_reset_stale(rev, state.ip_proto, now) {
                return invalid(rev);
            }
            unsafe { touch(rev, &rev_key, src, tcp, now) };
            nat_result(rev, &rev_key, src, dst)
        }
        _ => CtResult {
            rc: CT_INVALID,
            flags: 0,
            nat_addr: 0,
            nat_port: 0,
            tun_ret: 0,
        },
    }
}

/// Install a plain (non-NAT) entry for a flow that passed policy.
#[inline(always)]
pub fn create_normal(
    proto: u8,
    src: u32,
    sport: u16,
    dst: u32,
    dport: u16,
    flags: u8,
) -> Result<(), c_long> {
    let now = unsafe { bpf_ktime_get_ns() };
    let key = FlowKey::new(proto, src, sport, dst, dport);
    let entry = FlowEntry::normal(now, flags);
    CT_FLOWS.insert(&key, &entry, 0)
}

/// Install the NAT twin entries: the reverse entry under the post-NAT
/// tuple and the forward pointer under the pre-NAT tuple. Both writes
/// must land; a failed second write rolls back the first.
#[inline(always)]
#[allow(clippy::too_many_arguments)]
pub fn create_nat_pair(
    proto: u8,
    src: u32,
    sport: u16,
    orig_dst: u32,
    orig_dport: u16,
    nat_dst: u32,
    nat_dport: u16,
    tun_src: u32,
    flags: u8,
) -> Result<(), c_long> {
    let now = unsafe { bpf_ktime_get_ns() };
    let post_key = FlowKey::new(proto, src, sport, nat_dst, nat_dport);
    let pre_key = FlowKey::new(proto, src, sport, orig_dst, orig_dport);

    let rev = FlowEntry::nat_reverse(now, flags, orig_dst, orig_dport, tun_src);
    CT_FLOWS.insert(&post_key, &rev, 0)?;

    let fwd = FlowEntry::nat_forward(now, post_key);
    if let Err(e) = CT_FLOWS.insert(&pre_key, &fwd, 0) {
        let _ = CT_FLOWS.remove(&post_key);
        return Err(e);
    }
    Ok(())
}

// ── Internals ───────────────────────────────────────────────────────

/// A flow that saw an RST long ago exists only for the sweeper; treat
/// packets on it as untracked garbage.
#[inline(always)]
fn tcp_reset_stale(entry: *mut FlowEntry, proto: u8, now: u64) -> bool {
    if proto != 6 {
        return false;
    }
    let e = unsafe { &*entry };
    e.rst_seen() && now.saturating_sub(e.last_seen_ns) > DEFAULT_TCP_RESET_SEEN_NS
}

#[inline(always)]
fn invalid(entry: *mut FlowEntry) -> CtResult {
    CtResult {
        rc: CT_INVALID,
        flags: unsafe { (*entry).flags },
        nat_addr: 0,
        nat_port: 0,
        tun_ret: 0,
    }
}

/// Bump liveness and fold TCP flags, monotonically.
#[inline(always)]
unsafe fn touch(entry: *mut FlowEntry, key: &FlowKey, src: (u32, u16), tcp: TcpFlags, now: u64) {
    unsafe {
        if now > (*entry).last_seen_ns {
            (*entry).last_seen_ns = now;
        }
        let from_a = key.src_is_leg_a(src.0, src.1);
        (*entry).tcp_state = apply_tcp_flags((*entry).tcp_state, tcp, from_a);
    }
}

/// Map a reverse-entry hit onto a DNAT or SNAT result.
#[inline(always)]
fn nat_result(rev: *mut FlowEntry, rev_key: &FlowKey, src: (u32, u16), dst: (u32, u16)) -> CtResult {
    let entry = unsafe { *rev };
    match resolve_nat(&entry, rev_key, src, dst) {
        NatDirection::Dnat(rw) => CtResult {
            rc: CT_ESTABLISHED_DNAT,
            flags: entry.flags,
            nat_addr: rw.addr,
            nat_port: rw.port,
            tun_ret: entry.tun_ret_addr,
        },
        NatDirection::Snat(rw) => CtResult {
            rc: CT_ESTABLISHED_SNAT,
            flags: entry.flags,
            nat_addr: rw.addr,
            nat_port: rw.port,
            tun_ret: entry.tun_ret_addr,
        },
    }
}
