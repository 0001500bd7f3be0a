#![no_main]

use libfuzzer_sys::fuzz_target;

use ebpf_common::policy::{
    evaluate_rules, rule_matches, CidrMatch, PacketMatch, PolicyRuleEntry, PortRange,
    RULE_MAX_CIDRS, RULE_MAX_PORT_RANGES,
};
use ebpf_common::state::{POL_ALLOW, POL_DENY, POL_NO_MATCH};

// Fuzz the policy matcher with arbitrary rule entries, including counts
// larger than the fixed arrays (the matcher must clamp, never index out
// of bounds) and arbitrary verdict bytes.
fuzz_target!(|data: &[u8]| {
    if data.len() < 40 {
        return;
    }

    let u32_at = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
    let u16_at = |i: usize| u16::from_le_bytes([data[i], data[i + 1]]);

    let mut rule = PolicyRuleEntry::wildcard(data[0]);
    rule.match_flags = data[1];
    rule.protocol = data[2];
    rule.icmp_type = data[3];
    rule.icmp_code = data[4];
    // Deliberately unclamped counts.
    rule.src_cidr_count = data[5];
    rule.dst_cidr_count = data[6];
    rule.src_port_count = data[7];
    rule.dst_port_count = data[8];

    for i in 0..RULE_MAX_CIDRS {
        rule.src_cidrs[i] = CidrMatch {
            addr: u32_at(9 + i * 4) & u32_at(13 + i * 4),
            mask: u32_at(13 + i * 4),
        };
        rule.dst_cidrs[i] = CidrMatch {
            addr: u32_at(13 + i * 4) & u32_at(9 + i * 4),
            mask: u32_at(9 + i * 4),
        };
    }
    for i in 0..RULE_MAX_PORT_RANGES {
        rule.src_ports[i] = PortRange {
            start: u16_at(9 + i * 2),
            end: u16_at(11 + i * 2),
        };
        rule.dst_ports[i] = PortRange {
            start: u16_at(11 + i * 2),
            end: u16_at(13 + i * 2),
        };
    }

    let pkt = PacketMatch {
        protocol: data[25],
        saddr: u32_at(26),
        daddr: u32_at(30),
        sport: u16_at(34),
        dport: u16_at(36),
        icmp_type: data[38],
        icmp_code: data[39],
    };

    let _ = rule_matches(&rule, &pkt);

    let verdict = evaluate_rules(&[rule], &pkt, POL_NO_MATCH);
    assert!(
        verdict == POL_ALLOW || verdict == POL_DENY || verdict == POL_NO_MATCH,
        "verdict outside the closed set"
    );
});
