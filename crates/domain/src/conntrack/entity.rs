use std::net::Ipv4Addr;
use std::time::Duration;

use ebpf_common::conntrack::{
    FlowEntry, FlowKey, DEFAULT_CREATION_GRACE_NS, DEFAULT_ICMP_LAST_SEEN_NS,
    DEFAULT_TCP_ESTABLISHED_NS, DEFAULT_TCP_FINS_SEEN_NS, DEFAULT_TCP_PRE_ESTABLISHED_NS,
    DEFAULT_TCP_RESET_SEEN_NS, DEFAULT_UDP_LAST_SEEN_NS, FLOW_TYPE_NAT_FORWARD,
    FLOW_TYPE_NAT_REVERSE, FLOW_TYPE_NORMAL,
};
use serde::{Deserialize, Serialize};

use super::error::ConntrackError;

/// Liveness schedule applied by the sweeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTimeouts {
    /// Entries younger than this are never evicted.
    pub creation_grace: Duration,
    pub tcp_pre_established: Duration,
    pub tcp_established: Duration,
    pub tcp_fins_seen: Duration,
    pub tcp_reset_seen: Duration,
    pub udp_last_seen: Duration,
    pub icmp_last_seen: Duration,
}

impl Default for FlowTimeouts {
    fn default() -> Self {
        Self {
            creation_grace: Duration::from_nanos(DEFAULT_CREATION_GRACE_NS),
            tcp_pre_established: Duration::from_nanos(DEFAULT_TCP_PRE_ESTABLISHED_NS),
            tcp_established: Duration::from_nanos(DEFAULT_TCP_ESTABLISHED_NS),
            tcp_fins_seen: Duration::from_nanos(DEFAULT_TCP_FINS_SEEN_NS),
            tcp_reset_seen: Duration::from_nanos(DEFAULT_TCP_RESET_SEEN_NS),
            udp_last_seen: Duration::from_nanos(DEFAULT_UDP_LAST_SEEN_NS),
            icmp_last_seen: Duration::from_nanos(DEFAULT_ICMP_LAST_SEEN_NS),
        }
    }
}

impl FlowTimeouts {
    pub fn validate(&self) -> Result<(), ConntrackError> {
        let fields: [(&'static str, Duration); 6] = [
            ("tcp_pre_established", self.tcp_pre_established),
            ("tcp_established", self.tcp_established),
            ("tcp_fins_seen", self.tcp_fins_seen),
            ("tcp_reset_seen", self.tcp_reset_seen),
            ("udp_last_seen", self.udp_last_seen),
            ("icmp_last_seen", self.icmp_last_seen),
        ];
        for (field, value) in fields {
            if value.is_zero() {
                return Err(ConntrackError::InvalidTimeout { field });
            }
        }
        Ok(())
    }
}

/// Kind of flow table entry, the userspace view of the discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    Normal,
    NatForward,
    NatReverse,
    Unknown,
}

impl FlowKind {
    pub fn from_entry(entry: &FlowEntry) -> Self {
        match entry.entry_type {
            FLOW_TYPE_NORMAL => Self::Normal,
            FLOW_TYPE_NAT_FORWARD => Self::NatForward,
            FLOW_TYPE_NAT_REVERSE => Self::NatReverse,
            _ => Self::Unknown,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::NatForward => "nat_forward",
            Self::NatReverse => "nat_reverse",
            Self::Unknown => "unknown",
        }
    }
}

/// Human-facing flow record, for logs and diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub addr_a: String,
    pub addr_b: String,
    pub port_a: u16,
    pub port_b: u16,
    pub protocol: u8,
    pub kind: FlowKind,
    pub created_ns: u64,
    pub last_seen_ns: u64,
}

impl Flow {
    pub fn from_map(key: &FlowKey, entry: &FlowEntry) -> Self {
        Self {
            addr_a: Ipv4Addr::from(u32::from_be(key.addr_a)).to_string(),
            addr_b: Ipv4Addr::from(u32::from_be(key.addr_b)).to_string(),
            port_a: key.port_a,
            port_b: key.port_b,
            protocol: key.protocol,
            kind: FlowKind::from_entry(entry),
            created_ns: entry.created_ns,
            last_seen_ns: entry.last_seen_ns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeouts_match_schedule() {
        let t = FlowTimeouts::default();
        assert_eq!(t.creation_grace, Duration::from_secs(10));
        assert_eq!(t.tcp_pre_established, Duration::from_secs(20));
        assert_eq!(t.tcp_established, Duration::from_secs(3600));
        assert_eq!(t.tcp_fins_seen, Duration::from_secs(30));
        assert_eq!(t.tcp_reset_seen, Duration::from_secs(40));
        assert_eq!(t.udp_last_seen, Duration::from_secs(60));
        assert_eq!(t.icmp_last_seen, Duration::from_secs(5));
    }

    #[test]
    fn default_timeouts_valid() {
        assert!(FlowTimeouts::default().validate().is_ok());
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut t = FlowTimeouts::default();
        t.udp_last_seen = Duration::ZERO;
        assert!(t.validate().is_err());
    }

    #[test]
    fn flow_kind_from_entry() {
        assert_eq!(
            FlowKind::from_entry(&FlowEntry::normal(0, 0)),
            FlowKind::Normal
        );
        assert_eq!(
            FlowKind::from_entry(&FlowEntry::nat_reverse(0, 0, 1, 2, 0)),
            FlowKind::NatReverse
        );
        let fwd = FlowEntry::nat_forward(0, FlowKey::new(6, 1, 2, 3, 4));
        assert_eq!(FlowKind::from_entry(&fwd), FlowKind::NatForward);
    }

    #[test]
    fn flow_view_renders_addresses() {
        let a = u32::from(Ipv4Addr::new(10, 0, 0, 5)).to_be();
        let b = u32::from(Ipv4Addr::new(10, 0, 0, 9)).to_be();
        let key = FlowKey::new(6, a, 40000, b, 8080);
        let entry = FlowEntry::normal(7, 0);
        let flow = Flow::from_map(&key, &entry);
        assert_eq!(flow.addr_a, "10.0.0.5");
        assert_eq!(flow.addr_b, "10.0.0.9");
        assert_eq!(flow.kind, FlowKind::Normal);
    }
}
