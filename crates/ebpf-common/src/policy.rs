//! Compiled policy rule entries and their matching logic.
//!
//! The control plane compiles policy into an array of fixed-size rule
//! entries; the policy tail program evaluates them in order,
//! first-match-wins. Each rule is a conjunction of matches: protocol,
//! membership in a source/destination CIDR set, membership in a
//! source/destination port-range set, and ICMP type/code. A field's
//! MATCH_* flag unset means wildcard.

/// Maximum compiled rules.
pub const POLICY_MAX_RULES: u32 = 1024;
/// CIDRs per rule side.
pub const RULE_MAX_CIDRS: usize = 4;
/// Port ranges per rule side.
pub const RULE_MAX_PORT_RANGES: usize = 4;

// ── Rule verdicts ────────────────────────────────────────────────────

pub const RULE_ALLOW: u8 = 0;
pub const RULE_DENY: u8 = 1;
/// Defer to the next tier: evaluation continues past this rule.
pub const RULE_NEXT_TIER: u8 = 2;

// ── Match flags ──────────────────────────────────────────────────────

pub const RULE_MATCH_PROTO: u8 = 0x01;
pub const RULE_MATCH_SRC_CIDR: u8 = 0x02;
pub const RULE_MATCH_DST_CIDR: u8 = 0x04;
pub const RULE_MATCH_SRC_PORT: u8 = 0x08;
pub const RULE_MATCH_DST_PORT: u8 = 0x10;
pub const RULE_MATCH_ICMP_TYPE: u8 = 0x20;
pub const RULE_MATCH_ICMP_CODE: u8 = 0x40;

// ── Match primitives ─────────────────────────────────────────────────

/// Pre-masked CIDR: `addr & mask == addr` holds by construction.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CidrMatch {
    pub addr: u32,
    pub mask: u32,
}

impl CidrMatch {
    #[inline]
    pub const fn contains(&self, addr: u32) -> bool {
        addr & self.mask == self.addr
    }
}

/// Inclusive port range.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    #[inline]
    pub const fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

// ── Rule entry — 108 bytes ───────────────────────────────────────────

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyRuleEntry {
    pub src_cidrs: [CidrMatch; RULE_MAX_CIDRS],
    pub dst_cidrs: [CidrMatch; RULE_MAX_CIDRS],
    pub src_ports: [PortRange; RULE_MAX_PORT_RANGES],
    pub dst_ports: [PortRange; RULE_MAX_PORT_RANGES],
    pub protocol: u8,
    pub icmp_type: u8,
    pub icmp_code: u8,
    /// RULE_MATCH_* bits.
    pub match_flags: u8,
    pub src_cidr_count: u8,
    pub dst_cidr_count: u8,
    pub src_port_count: u8,
    pub dst_port_count: u8,
    /// RULE_* verdict.
    pub verdict: u8,
    pub _pad: [u8; 3],
}

impl PolicyRuleEntry {
    pub const fn wildcard(verdict: u8) -> Self {
        Self {
            src_cidrs: [CidrMatch { addr: 0, mask: 0 }; RULE_MAX_CIDRS],
            dst_cidrs: [CidrMatch { addr: 0, mask: 0 }; RULE_MAX_CIDRS],
            src_ports: [PortRange { start: 0, end: 0 }; RULE_MAX_PORT_RANGES],
            dst_ports: [PortRange { start: 0, end: 0 }; RULE_MAX_PORT_RANGES],
            protocol: 0,
            icmp_type: 0,
            icmp_code: 0,
            match_flags: 0,
            src_cidr_count: 0,
            dst_cidr_count: 0,
            src_port_count: 0,
            dst_port_count: 0,
            verdict,
            _pad: [0; 3],
        }
    }
}

// ── Packet view fed to the matcher ───────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct PacketMatch {
    pub protocol: u8,
    pub saddr: u32,
    pub daddr: u32,
    pub sport: u16,
    pub dport: u16,
    pub icmp_type: u8,
    pub icmp_code: u8,
}

// ── Matching ─────────────────────────────────────────────────────────

#[inline]
fn cidr_set_contains(set: &[CidrMatch; RULE_MAX_CIDRS], count: u8, addr: u32) -> bool {
    let n = if (count as usize) < RULE_MAX_CIDRS {
        count as usize
    } else {
        RULE_MAX_CIDRS
    };
    let mut i = 0usize;
    while i < n {
        if set[i].contains(addr) {
            return true;
        }
        i += 1;
    }
    false
}

#[inline]
fn port_set_contains(set: &[PortRange; RULE_MAX_PORT_RANGES], count: u8, port: u16) -> bool {
    let n = if (count as usize) < RULE_MAX_PORT_RANGES {
        count as usize
    } else {
        RULE_MAX_PORT_RANGES
    };
    let mut i = 0usize;
    while i < n {
        if set[i].contains(port) {
            return true;
        }
        i += 1;
    }
    false
}

/// Whether every active match of `rule` holds for `pkt`.
#[inline]
pub fn rule_matches(rule: &PolicyRuleEntry, pkt: &PacketMatch) -> bool {
    let flags = rule.match_flags;

    if flags & RULE_MATCH_PROTO != 0 && rule.protocol != pkt.protocol {
        return false;
    }
    if flags & RULE_MATCH_SRC_CIDR != 0
        && !cidr_set_contains(&rule.src_cidrs, rule.src_cidr_count, pkt.saddr)
    {
        return false;
    }
    if flags & RULE_MATCH_DST_CIDR != 0
        && !cidr_set_contains(&rule.dst_cidrs, rule.dst_cidr_count, pkt.daddr)
    {
        return false;
    }
    if flags & RULE_MATCH_SRC_PORT != 0
        && !port_set_contains(&rule.src_ports, rule.src_port_count, pkt.sport)
    {
        return false;
    }
    if flags & RULE_MATCH_DST_PORT != 0
        && !port_set_contains(&rule.dst_ports, rule.dst_port_count, pkt.dport)
    {
        return false;
    }
    if flags & RULE_MATCH_ICMP_TYPE != 0 && rule.icmp_type != pkt.icmp_type {
        return false;
    }
    if flags & RULE_MATCH_ICMP_CODE != 0 && rule.icmp_code != pkt.icmp_code {
        return false;
    }

    true
}

/// Evaluate a rule sequence: first matching allow/deny wins; a matching
/// next-tier rule continues evaluation. Returns a POL_* verdict;
/// `default_verdict` applies when nothing matched.
pub fn evaluate_rules(rules: &[PolicyRuleEntry], pkt: &PacketMatch, default_verdict: u8) -> u8 {
    use crate::state::{POL_ALLOW, POL_DENY};

    for rule in rules {
        if !rule_matches(rule, pkt) {
            continue;
        }
        match rule.verdict {
            RULE_ALLOW => return POL_ALLOW,
            RULE_DENY => return POL_DENY,
            _ => {} // next-tier: keep going
        }
    }
    default_verdict
}

// ── Pod impls ────────────────────────────────────────────────────────

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for PolicyRuleEntry {}

// ── Tests ────────────────────────────────────────────────────────────
