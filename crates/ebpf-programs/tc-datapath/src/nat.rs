//! In-kernel service NAT resolution for new flows.
//!
//! One LPM lookup resolves the frontend (longest matching client source
//! CIDR wins, /0 entries catch the rest); the backend is picked by a
//! fixed hash of the 5-tuple, unless a fresh affinity entry overrides it.

use aya_ebpf::helpers::bpf_ktime_get_ns;
use aya_ebpf::maps::lpm_trie::Key;
use ebpf_common::nat::{
    backend_ordinal, AffinityKey, AffinityValue, BackendKey, FrontendKey,
    NAT_FE_FIXED_PREFIX_BITS,
};
use ebpf_common::state::PacketState;

use crate::{NAT_AFFINITY, NAT_BACKENDS, NAT_FRONTENDS};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Selected backend for a new flow.
#[derive(Clone, Copy)]
pub struct NatDest {
    pub addr: u32,
    pub port: u16,
}

pub enum NatLookup {
    /// Destination is not a service frontend.
    None,
    /// Translate to this backend.
    Backend(NatDest),
    /// Source-range-restricted frontend, no qualifying range: drop.
    Blackhole,
}

#[inline(always)]
pub fn frontend_lookup(state: &PacketState) -> NatLookup {
    let fe_key = FrontendKey::new(state.ip_dst, state.dport, state.ip_proto, state.ip_src);
    let key = Key::new(NAT_FE_FIXED_PREFIX_BITS + 32, fe_key);

    let Some(frontend) = NAT_FRONTENDS.get(&key) else {
        return NatLookup::None;
    };
    if frontend.is_blackhole() {
        return NatLookup::Blackhole;
    }
    if frontend.backend_count == 0 {
        // Frontend with no ready endpoints; leave the packet alone.
        return NatLookup::None;
    }

    let now = unsafe { bpf_ktime_get_ns() };

    if frontend.has_affinity() {
        let aff_key = AffinityKey {
            client_addr: state.ip_src,
            frontend_addr: state.ip_dst,
            port: state.dport,
            protocol: state.ip_proto,
            _pad: 0,
        };
        let window_ns = frontend.affinity_timeout_secs as u64 * NANOS_PER_SEC;
        if let Some(aff) = NAT_AFFINITY.get_ptr_mut(&aff_key) {
            let age = now.saturating_sub(unsafe { (*aff).last_hit_ns });
            if age <= window_ns {
                unsafe {
                    (*aff).last_hit_ns = now;
                }
                return NatLookup::Backend(NatDest {
                    addr: unsafe { (*aff).backend_addr },
                    port: unsafe { (*aff).backend_port },
                });
            }
        }

        let Some(dest) = pick_backend(state, frontend.backend_id, frontend.backend_count) else {
            return NatLookup::None;
        };
        let aff_val = AffinityValue {
            backend_addr: dest.addr,
            backend_port: dest.port,
            _pad: 0,
            last_hit_ns: now,
        };
        let _ = NAT_AFFINITY.insert(&aff_key, &aff_val, 0);
        return NatLookup::Backend(dest);
    }

    match pick_backend(state, frontend.backend_id, frontend.backend_count) {
        Some(dest) => NatLookup::Backend(dest),
        None => NatLookup::None,
    }
}

#[inline(always)]
fn pick_backend(state: &PacketState, backend_id: u32, count: u32) -> Option<NatDest> {
    let ordinal = backend_ordinal(
        state.ip_src,
        state.sport,
        state.ip_dst,
        state.dport,
        state.ip_proto,
        count,
    );
    let be_key = BackendKey {
        backend_id,
        ordinal,
    };
    let be = unsafe { NAT_BACKENDS.get(&be_key)? };
    Some(NatDest {
        addr: be.addr,
        port: be.port,
    })
}
