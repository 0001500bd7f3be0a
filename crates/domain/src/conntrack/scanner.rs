//! Flow table scanners: liveness eviction and stale-NAT cleanup.
//!
//! Scanners are pure decision logic. The clock and the
//! frontend-has-backend oracle are injected, so every verdict is
//! deterministic under test. A scanner may only ask for the deletion of
//! the key it is currently examining; a stale companion entry is left
//! for a later pass (or for its own visit) to keep map iteration sound.

use ebpf_common::conntrack::{
    FlowEntry, FlowKey, FLOW_TYPE_NAT_FORWARD, FLOW_TYPE_NAT_REVERSE, FLOW_TYPE_NORMAL,
};

use super::entity::FlowTimeouts;

const PROTO_ICMP: u8 = 1;
const PROTO_TCP: u8 = 6;

/// Verdict for the entry under examination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanVerdict {
    Keep,
    Delete { reason: &'static str },
}

/// Lookup of a companion entry, needed when a forward pointer must be
/// judged by its reverse entry's liveness.
pub type EntryGet<'a> = &'a dyn Fn(&FlowKey) -> Option<FlowEntry>;

/// One scanner pass over the flow table. Implementations are run in
/// order on each entry; the first `Delete` wins.
pub trait EntryScanner {
    fn scan(&mut self, key: &FlowKey, entry: &FlowEntry, get: EntryGet) -> ScanVerdict;
}

// ── Liveness ────────────────────────────────────────────────────────

/// Evicts flows whose protocol-specific idle timers expired.
pub struct LivenessScanner {
    timeouts: FlowTimeouts,
    now_ns: Box<dyn Fn() -> u64 + Send>,
}

impl LivenessScanner {
    /// Wall-clock construction. The agent replaces this with the boot
    /// clock (the clock the datapath stamps entries with) at startup.
    pub fn new(timeouts: FlowTimeouts) -> Self {
        Self::with_clock(timeouts, || {
            use std::time::{SystemTime, UNIX_EPOCH};
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64
        })
    }

    /// Deterministic construction for tests.
    pub fn with_clock(timeouts: FlowTimeouts, now_ns: impl Fn() -> u64 + Send + 'static) -> Self {
        Self {
            timeouts,
            now_ns: Box::new(now_ns),
        }
    }

    /// Why the entry is expired at `now_ns`, if it is.
    pub fn entry_expired(&self, now_ns: u64, proto: u8, entry: &FlowEntry) -> Option<&'static str> {
        let since_creation = now_ns.saturating_sub(entry.created_ns);
        if since_creation < self.timeouts.creation_grace.as_nanos() as u64 {
            return None;
        }

        let age = now_ns.saturating_sub(entry.last_seen_ns);
        match proto {
            PROTO_TCP => {
                let dsr = entry.is_dsr_forward();
                if entry.rst_seen() && age > self.timeouts.tcp_reset_seen.as_nanos() as u64 {
                    return Some("RST seen");
                }
                let fins = (dsr && entry.fins_seen_dsr()) || entry.fins_seen();
                if fins && age > self.timeouts.tcp_fins_seen.as_nanos() as u64 {
                    return Some("FINs seen");
                }
                if entry.established() || dsr {
                    if age > self.timeouts.tcp_established.as_nanos() as u64 {
                        return Some("no traffic on established flow for too long");
                    }
                } else if age > self.timeouts.tcp_pre_established.as_nanos() as u64 {
                    return Some("no traffic on pre-established flow for too long");
                }
                None
            }
            PROTO_ICMP => {
                if age > self.timeouts.icmp_last_seen.as_nanos() as u64 {
                    return Some("no traffic on ICMP flow for too long");
                }
                None
            }
            _ => {
                if age > self.timeouts.udp_last_seen.as_nanos() as u64 {
                    return Some("no traffic on UDP flow for too long");
                }
                None
            }
        }
    }
}

impl EntryScanner for LivenessScanner {
    fn scan(&mut self, key: &FlowKey, entry: &FlowEntry, get: EntryGet) -> ScanVerdict {
        let now = (self.now_ns)();

        match entry.entry_type {
            FLOW_TYPE_NAT_FORWARD => {
                // Liveness lives on the reverse entry.
                let Some(rev) = get(&entry.rev_key) else {
                    // Forward pointer with no reverse entry is useless on
                    // its own; collect it now.
                    return ScanVerdict::Delete {
                        reason: "orphaned forward entry",
                    };
                };
                match self.entry_expired(now, key.protocol, &rev) {
                    // The reverse entry is removed when the iteration
                    // reaches it, never from here.
                    Some(reason) => ScanVerdict::Delete { reason },
                    None => ScanVerdict::Keep,
                }
            }
            FLOW_TYPE_NAT_REVERSE | FLOW_TYPE_NORMAL => {
                match self.entry_expired(now, key.protocol, entry) {
                    Some(reason) => ScanVerdict::Delete { reason },
                    None => ScanVerdict::Keep,
                }
            }
            _ => ScanVerdict::Delete {
                reason: "unknown entry type",
            },
        }
    }
}

// ── Stale NAT ───────────────────────────────────────────────────────

/// Answers whether a (frontend, backend) pairing still exists:
/// `(front_addr, front_port, back_addr, back_port, proto)`, addresses in
/// network byte order.
pub type NatChecker = Box<dyn Fn(u32, u16, u32, u16, u8) -> bool + Send>;

/// Deletes NAT entries whose frontend/backend pairing the control plane
/// no longer programs.
pub struct StaleNatScanner {
    frontend_has_backend: NatChecker,
}

impl StaleNatScanner {
    pub fn new(frontend_has_backend: NatChecker) -> Self {
        Self {
            frontend_has_backend,
        }
    }
}

impl EntryScanner for StaleNatScanner {
    fn scan(&mut self, key: &FlowKey, entry: &FlowEntry, _get: EntryGet) -> ScanVerdict {
        match entry.entry_type {
            FLOW_TYPE_NORMAL => ScanVerdict::Keep,

            FLOW_TYPE_NAT_REVERSE => {
                // We cannot tell which leg is the endpoint and which is
                // the client; if either pairing is alive, keep the entry.
                let svc = (entry.orig_addr, entry.orig_port);
                let alive_a =
                    (self.frontend_has_backend)(svc.0, svc.1, key.addr_a, key.port_a, key.protocol);
                let alive_b =
                    (self.frontend_has_backend)(svc.0, svc.1, key.addr_b, key.port_b, key.protocol);
                if alive_a || alive_b {
                    ScanVerdict::Keep
                } else {
                    ScanVerdict::Delete {
                        reason: "stale reverse NAT entry",
                    }
                }
            }

            FLOW_TYPE_NAT_FORWARD => {
                // The client leg appears in both keys, which pins down
                // the meaning of the remaining legs.
                let rev = &entry.rev_key;
                let (svc, ep) = if (key.addr_a, key.port_a) == (rev.addr_a, rev.port_a) {
                    ((key.addr_b, key.port_b), (rev.addr_b, rev.port_b))
                } else if (key.addr_a, key.port_a) == (rev.addr_b, rev.port_b) {
                    ((key.addr_b, key.port_b), (rev.addr_a, rev.port_a))
                } else if (key.addr_b, key.port_b) == (rev.addr_a, rev.port_a) {
                    ((key.addr_a, key.port_a), (rev.addr_b, rev.port_b))
                } else {
                    ((key.addr_a, key.port_a), (rev.addr_a, rev.port_a))
                };
                if (self.frontend_has_backend)(svc.0, svc.1, ep.0, ep.1, key.protocol) {
                    ScanVerdict::Keep
                } else {
                    ScanVerdict::Delete {
                        reason: "stale forward NAT entry",
                    }
                }
            }

            _ => ScanVerdict::Keep,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
