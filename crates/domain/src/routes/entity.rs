//! Route table entries as the control plane programs them.

use std::net::Ipv4Addr;

use ebpf_common::routes::{
    RouteValue, ROUTE_FLAG_IN_POOL, ROUTE_FLAG_LOCAL_HOST, ROUTE_FLAG_LOCAL_WORKLOAD,
    ROUTE_FLAG_NAT_OUT, ROUTE_FLAG_REMOTE_WORKLOAD,
};
use serde::{Deserialize, Serialize};

use crate::common::entity::Cidr;
use crate::common::error::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    LocalHost,
    LocalWorkload,
    RemoteWorkload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub cidr: Cidr,
    pub kind: RouteKind,
    /// Interface index; required for local workloads (the RPF check).
    #[serde(default)]
    pub if_index: u32,
    /// Owning node address; required for remote workloads (VXLAN).
    #[serde(default)]
    pub next_hop: Option<Ipv4Addr>,
    #[serde(default)]
    pub in_pool: bool,
    #[serde(default)]
    pub nat_outgoing: bool,
}

impl RouteEntry {
    pub fn validate(&self) -> Result<(), DomainError> {
        match self.kind {
            RouteKind::LocalWorkload if self.if_index == 0 => Err(DomainError::InvalidConfig(
                format!("route {}: local workload needs if_index", self.cidr),
            )),
            RouteKind::RemoteWorkload if self.next_hop.is_none() => Err(
                DomainError::InvalidConfig(format!("route {}: remote workload needs next_hop", self.cidr)),
            ),
            _ => Ok(()),
        }
    }

    /// LPM key for this route: (prefix length, address in network order).
    pub fn key(&self) -> (u32, u32) {
        (self.cidr.prefix_len as u32, self.cidr.network().to_be())
    }

    pub fn value(&self) -> RouteValue {
        let mut flags = match self.kind {
            RouteKind::LocalHost => ROUTE_FLAG_LOCAL_HOST,
            RouteKind::LocalWorkload => ROUTE_FLAG_LOCAL_WORKLOAD,
            RouteKind::RemoteWorkload => ROUTE_FLAG_REMOTE_WORKLOAD,
        };
        if self.in_pool {
            flags |= ROUTE_FLAG_IN_POOL;
        }
        if self.nat_outgoing {
            flags |= ROUTE_FLAG_NAT_OUT;
        }
        RouteValue {
            flags,
            if_index: self.if_index,
            next_hop: self.next_hop.map(|ip| u32::from(ip).to_be()).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_workload_requires_ifindex() {
        let route = RouteEntry {
            cidr: Cidr {
                addr: 0x0a00_0005,
                prefix_len: 32,
            },
            kind: RouteKind::LocalWorkload,
            if_index: 0,
            next_hop: None,
            in_pool: true,
            nat_outgoing: false,
        };
        assert!(route.validate().is_err());
    }

    #[test]
    fn remote_workload_requires_next_hop() {
        let route = RouteEntry {
            cidr: Cidr {
                addr: 0x0a01_0000,
                prefix_len: 24,
            },
            kind: RouteKind::RemoteWorkload,
            if_index: 0,
            next_hop: None,
            in_pool: true,
            nat_outgoing: false,
        };
        assert!(route.validate().is_err());
    }

    #[test]
    fn value_encodes_flags_and_next_hop() {
        let route = RouteEntry {
            cidr: Cidr {
                addr: 0x0a01_0000,
                prefix_len: 24,
            },
            kind: RouteKind::RemoteWorkload,
            if_index: 0,
            next_hop: Some(Ipv4Addr::new(192, 168, 0, 7)),
            in_pool: true,
            nat_outgoing: true,
        };
        assert!(route.validate().is_ok());
        let value = route.value();
        assert!(value.is_remote_workload());
        assert!(value.in_pool());
        assert!(value.nat_outgoing());
        assert_eq!(value.next_hop, u32::from(Ipv4Addr::new(192, 168, 0, 7)).to_be());

        let (prefix, addr) = route.key();
        assert_eq!(prefix, 24);
        assert_eq!(addr, u32::from(Ipv4Addr::new(10, 1, 0, 0)).to_be());
    }

    #[test]
    fn local_host_value() {
        let route = RouteEntry {
            cidr: Cidr::host(0xc0a8_0001),
            kind: RouteKind::LocalHost,
            if_index: 0,
            next_hop: None,
            in_pool: false,
            nat_outgoing: false,
        };
        assert!(route.validate().is_ok());
        assert!(route.value().is_local_host());
        assert!(!route.value().is_workload());
    }
}
