//! Drop reason codes.
//!
//! Every dropped packet increments one slot of the per-CPU reason counter
//! map; the reason is the sole diagnostic the datapath emits for a drop.

pub const REASON_SHORT: u32 = 0;
pub const REASON_CSUM_FAIL: u32 = 1;
pub const REASON_DECAP_FAIL: u32 = 2;
pub const REASON_ENCAP_FAIL: u32 = 3;
pub const REASON_ICMP_DF: u32 = 4;
pub const REASON_RT_UNKNOWN: u32 = 5;
pub const REASON_POLICY_DENY: u32 = 6;
pub const REASON_CT_INVALID: u32 = 7;
pub const REASON_UNKNOWN: u32 = 8;
pub const REASON_COUNT: u32 = 9;

pub fn reason_name(reason: u32) -> &'static str {
    match reason {
        REASON_SHORT => "short",
        REASON_CSUM_FAIL => "csum_fail",
        REASON_DECAP_FAIL => "decap_fail",
        REASON_ENCAP_FAIL => "encap_fail",
        REASON_ICMP_DF => "icmp_df",
        REASON_RT_UNKNOWN => "rt_unknown",
        REASON_POLICY_DENY => "policy_deny",
        REASON_CT_INVALID => "ct_invalid",
        _ => "unknown",
    }
}
