//! Policy rules as configured, and their compilation into the fixed-size
//! entries the policy tail program evaluates.

use ebpf_common::policy::{
    CidrMatch, PolicyRuleEntry, PortRange as RulePortRange, RULE_ALLOW, RULE_DENY,
    RULE_MATCH_DST_CIDR, RULE_MATCH_DST_PORT, RULE_MATCH_ICMP_CODE, RULE_MATCH_ICMP_TYPE,
    RULE_MATCH_PROTO, RULE_MATCH_SRC_CIDR, RULE_MATCH_SRC_PORT, RULE_MAX_CIDRS,
    RULE_MAX_PORT_RANGES, RULE_NEXT_TIER,
};
use serde::{Deserialize, Serialize};

use crate::common::entity::Cidr;
use crate::common::error::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleVerdict {
    Allow,
    Deny,
    NextTier,
}

impl RuleVerdict {
    pub const fn to_entry(self) -> u8 {
        match self {
            Self::Allow => RULE_ALLOW,
            Self::Deny => RULE_DENY,
            Self::NextTier => RULE_NEXT_TIER,
        }
    }
}

/// Matched protocol; `None` is a wildcard. Unlike the NAT tables, policy
/// also matches ICMP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleProtocol {
    Tcp,
    Udp,
    Icmp,
}

impl RuleProtocol {
    pub const fn number(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Icmp => 1,
        }
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

/// One policy rule: a conjunction of matches and a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(default)]
    pub protocol: Option<RuleProtocol>,
    #[serde(default)]
    pub src_cidrs: Vec<Cidr>,
    #[serde(default)]
    pub dst_cidrs: Vec<Cidr>,
    #[serde(default)]
    pub src_ports: Vec<PortRange>,
    #[serde(default)]
    pub dst_ports: Vec<PortRange>,
    #[serde(default)]
    pub icmp_type: Option<u8>,
    #[serde(default)]
    pub icmp_code: Option<u8>,
    pub verdict: RuleVerdict,
}

impl PolicyRule {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.src_cidrs.len() > RULE_MAX_CIDRS || self.dst_cidrs.len() > RULE_MAX_CIDRS {
            return Err(DomainError::InvalidConfig(format!(
                "policy rule: at most {RULE_MAX_CIDRS} CIDRs per side"
            )));
        }
        if self.src_ports.len() > RULE_MAX_PORT_RANGES
            || self.dst_ports.len() > RULE_MAX_PORT_RANGES
        {
            return Err(DomainError::InvalidConfig(format!(
                "policy rule: at most {RULE_MAX_PORT_RANGES} port ranges per side"
            )));
        }
        for range in self.src_ports.iter().chain(&self.dst_ports) {
            if range.start > range.end {
                return Err(DomainError::InvalidConfig(format!(
                    "policy rule: inverted port range {}-{}",
                    range.start, range.end
                )));
            }
        }
        if self.icmp_code.is_some() && self.icmp_type.is_none() {
            return Err(DomainError::InvalidConfig(
                "policy rule: icmp_code without icmp_type".into(),
            ));
        }
        if (self.icmp_type.is_some() || self.icmp_code.is_some())
            && self.protocol != Some(RuleProtocol::Icmp)
        {
            return Err(DomainError::InvalidConfig(
                "policy rule: ICMP matches require protocol icmp".into(),
            ));
        }
        Ok(())
    }

    /// Compile into the datapath's fixed-size entry. Addresses are
    /// pre-masked, host byte order (the policy tail normalizes packets
    /// the same way).
    pub fn to_entry(&self) -> PolicyRuleEntry {
        let mut entry = PolicyRuleEntry::wildcard(self.verdict.to_entry());

        if let Some(proto) = self.protocol {
            entry.match_flags |= RULE_MATCH_PROTO;
            entry.protocol = proto.number();
        }
        if !self.src_cidrs.is_empty() {
            entry.match_flags |= RULE_MATCH_SRC_CIDR;
            entry.src_cidr_count = self.src_cidrs.len() as u8;
            for (i, cidr) in self.src_cidrs.iter().take(RULE_MAX_CIDRS).enumerate() {
                entry.src_cidrs[i] = CidrMatch {
                    addr: cidr.network(),
                    mask: cidr.mask(),
                };
            }
        }
        if !self.dst_cidrs.is_empty() {
            entry.match_flags |= RULE_MATCH_DST_CIDR;
            entry.dst_cidr_count = self.dst_cidrs.len() as u8;
            for (i, cidr) in self.dst_cidrs.iter().take(RULE_MAX_CIDRS).enumerate() {
                entry.dst_cidrs[i] = CidrMatch {
                    addr: cidr.network(),
                    mask: cidr.mask(),
                };
            }
        }
        if !self.src_ports.is_empty() {
            entry.match_flags |= RULE_MATCH_SRC_PORT;
            entry.src_port_count = self.src_ports.len() as u8;
            for (i, range) in self.src_ports.iter().take(RULE_MAX_PORT_RANGES).enumerate() {
                entry.src_ports[i] = RulePortRange {
                    start: range.start,
                    end: range.end,
                };
            }
        }
        if !self.dst_ports.is_empty() {
            entry.match_flags |= RULE_MATCH_DST_PORT;
            entry.dst_port_count = self.dst_ports.len() as u8;
            for (i, range) in self.dst_ports.iter().take(RULE_MAX_PORT_RANGES).enumerate() {
                entry.dst_ports[i] = RulePortRange {
                    start: range.start,
                    end: range.end,
                };
            }
        }
        if let Some(icmp_type) = self.icmp_type {
            entry.match_flags |= RULE_MATCH_ICMP_TYPE;
            entry.icmp_type = icmp_type;
        }
        if let Some(icmp_code) = self.icmp_code {
            entry.match_flags |= RULE_MATCH_ICMP_CODE;
            entry.icmp_code = icmp_code;
        }

        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebpf_common::policy::{evaluate_rules, PacketMatch};
    use ebpf_common::state::{POL_ALLOW, POL_DENY, POL_NO_MATCH};

    fn allow_web_rule() -> PolicyRule {
        PolicyRule {
            protocol: Some(RuleProtocol::Tcp),
            src_cidrs: vec![Cidr {
                addr: 0x0a00_0000,
                prefix_len: 8,
            }],
            dst_cidrs: vec![],
            src_ports: vec![],
            dst_ports: vec![
                PortRange { start: 80, end: 80 },
                PortRange {
                    start: 443,
                    end: 443,
                },
            ],
            icmp_type: None,
            icmp_code: None,
            verdict: RuleVerdict::Allow,
        }
    }

    #[test]
    fn compiled_rule_matches_like_the_domain_rule() {
        let entry = allow_web_rule().to_entry();
        let rules = [entry];

        let http = PacketMatch {
            protocol: 6,
            saddr: 0x0a01_0203,
            daddr: 0x0aff_0001,
            sport: 40000,
            dport: 443,
            icmp_type: 0,
            icmp_code: 0,
        };
        assert_eq!(evaluate_rules(&rules, &http, POL_NO_MATCH), POL_ALLOW);

        let ssh = PacketMatch { dport: 22, ..http };
        assert_eq!(evaluate_rules(&rules, &ssh, POL_NO_MATCH), POL_NO_MATCH);

        let outsider = PacketMatch {
            saddr: 0x0b00_0001,
            ..http
        };
        assert_eq!(evaluate_rules(&rules, &outsider, POL_NO_MATCH), POL_NO_MATCH);
    }

    #[test]
    fn deny_rule_compiles_to_deny() {
        let rule = PolicyRule {
            verdict: RuleVerdict::Deny,
            ..allow_web_rule()
        };
        let rules = [rule.to_entry()];
        let pkt = PacketMatch {
            protocol: 6,
            saddr: 0x0a01_0203,
            daddr: 1,
            sport: 1,
            dport: 80,
            icmp_type: 0,
            icmp_code: 0,
        };
        assert_eq!(evaluate_rules(&rules, &pkt, POL_NO_MATCH), POL_DENY);
    }

    #[test]
    fn icmp_rule_round_trips() {
        let rule = PolicyRule {
            protocol: Some(RuleProtocol::Icmp),
            src_cidrs: vec![],
            dst_cidrs: vec![],
            src_ports: vec![],
            dst_ports: vec![],
            icmp_type: Some(8),
            icmp_code: Some(0),
            verdict: RuleVerdict::Allow,
        };
        assert!(rule.validate().is_ok());
        let rules = [rule.to_entry()];

        let ping = PacketMatch {
            protocol: 1,
            icmp_type: 8,
            ..Default::default()
        };
        assert_eq!(evaluate_rules(&rules, &ping, POL_NO_MATCH), POL_ALLOW);

        let other = PacketMatch {
            protocol: 1,
            icmp_type: 3,
            icmp_code: 1,
            ..Default::default()
        };
        assert_eq!(evaluate_rules(&rules, &other, POL_NO_MATCH), POL_NO_MATCH);
    }

    #[test]
    fn validation_limits() {
        let mut rule = allow_web_rule();
        rule.src_cidrs = vec![
            Cidr {
                addr: 0,
                prefix_len: 8
            };
            5
        ];
        assert!(rule.validate().is_err());

        let mut rule = allow_web_rule();
        rule.dst_ports = vec![PortRange { start: 90, end: 80 }];
        assert!(rule.validate().is_err());

        let mut rule = allow_web_rule();
        rule.icmp_code = Some(0);
        assert!(rule.validate().is_err());

        let rule = PolicyRule {
            protocol: Some(RuleProtocol::Tcp),
            icmp_type: Some(8),
            ..allow_web_rule()
        };
        assert!(rule.validate().is_err());
    }

    #[test]
    fn next_tier_verdict_compiles() {
        let rule = PolicyRule {
            verdict: RuleVerdict::NextTier,
            protocol: None,
            src_cidrs: vec![],
            dst_cidrs: vec![],
            src_ports: vec![],
            dst_ports: vec![],
            icmp_type: None,
            icmp_code: None,
        };
        assert_eq!(rule.to_entry().verdict, RULE_NEXT_TIER);
        assert_eq!(rule.to_entry().match_flags, 0);
    }
}
