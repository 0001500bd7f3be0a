#![no_main]

use libfuzzer_sys::fuzz_target;

use ebpf_common::conntrack::{
    apply_tcp_flags, resolve_nat, FlowEntry, FlowKey, TcpFlags,
};

// Fuzz the conntrack key machinery: canonicalization symmetry, leg
// detection, TCP bit monotonicity, and NAT direction resolution.
//
// Layout:
//   [0]      = selector
//   [1..24]  = two endpoint tuples + protocol + flag bytes
fuzz_target!(|data: &[u8]| {
    if data.len() < 24 {
        return;
    }

    let u32_at = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
    let u16_at = |i: usize| u16::from_le_bytes([data[i], data[i + 1]]);

    let proto = data[1];
    let (a_addr, a_port) = (u32_at(2), u16_at(6));
    let (b_addr, b_port) = (u32_at(8), u16_at(12));

    match data[0] % 3 {
        // Sub-target 0: both observation directions canonicalize to the
        // same key, and exactly one leg matches the source.
        0 => {
            let k1 = FlowKey::new(proto, a_addr, a_port, b_addr, b_port);
            let k2 = FlowKey::new(proto, b_addr, b_port, a_addr, a_port);
            assert_eq!(k1, k2);
            assert!(
                (k1.addr_a, k1.port_a) <= (k1.addr_b, k1.port_b),
                "canonical order violated"
            );
            if (a_addr, a_port) != (b_addr, b_port) {
                assert_ne!(
                    k1.src_is_leg_a(a_addr, a_port),
                    k1.src_is_leg_a(b_addr, b_port)
                );
            }
        }
        // Sub-target 1: TCP state folding never clears bits.
        1 => {
            let mut state = data[14];
            for &byte in &data[15..] {
                let flags = TcpFlags {
                    syn: byte & 0x02 != 0,
                    ack: byte & 0x10 != 0,
                    fin: byte & 0x01 != 0,
                    rst: byte & 0x04 != 0,
                };
                let next = apply_tcp_flags(state, flags, byte & 0x80 != 0);
                assert_eq!(next & state, state, "TCP state bits regressed");
                state = next;
            }
        }
        // Sub-target 2: NAT resolution is total and self-consistent.
        _ => {
            let rev_key = FlowKey::new(proto, a_addr, a_port, b_addr, b_port);
            let entry = FlowEntry::nat_reverse(0, data[14], u32_at(16), u16_at(20), u32_at(2));
            let _ = resolve_nat(
                &entry,
                &rev_key,
                (a_addr, a_port),
                (u32_at(16), u16_at(20)),
            );
            let _ = resolve_nat(&entry, &rev_key, (b_addr, b_port), (a_addr, a_port));
        }
    }
});
