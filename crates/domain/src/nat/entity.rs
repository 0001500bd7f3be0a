//! Service frontends and backends, and their compilation into NAT map
//! entries.
//!
//! A service publishes its ClusterIP plus any external IPs as frontends.
//! When load-balancer source ranges are configured, external IPs are only
//! reachable through source-qualified entries; their bare keys become
//! blackhole sentinels so unqualified clients are dropped instead of
//! falling through.

use std::net::Ipv4Addr;

use ebpf_common::nat::{
    frontend_prefix_len, AffinityKey, BackendKey, BackendValue, FrontendKey, FrontendValue,
    FRONTEND_FLAG_AFFINITY,
};
use serde::{Deserialize, Serialize};

use crate::common::entity::{Cidr, Protocol};

use super::error::NatError;

/// One endpoint behind a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBackend {
    pub addr: Ipv4Addr,
    pub port: u16,
}

/// A load-balanced service as the control plane sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceFrontend {
    pub name: String,
    pub cluster_ip: Ipv4Addr,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub external_ips: Vec<Ipv4Addr>,
    /// Load-balancer source ranges restricting the external IPs.
    #[serde(default)]
    pub source_ranges: Vec<Cidr>,
    /// Client-IP affinity window in seconds; 0 disables affinity.
    #[serde(default)]
    pub affinity_timeout_secs: u32,
    pub backends: Vec<ServiceBackend>,
}

/// A frontend map entry ready for insertion: LPM prefix + key + value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrontendMapEntry {
    pub prefix_len: u32,
    pub key: FrontendKey,
    pub value: FrontendValue,
}

impl ServiceFrontend {
    pub fn validate(&self) -> Result<(), NatError> {
        if self.port == 0 {
            return Err(NatError::InvalidService {
                name: self.name.clone(),
                message: "port must be non-zero".into(),
            });
        }
        if self.backends.iter().any(|b| b.port == 0) {
            return Err(NatError::InvalidService {
                name: self.name.clone(),
                message: "backend port must be non-zero".into(),
            });
        }
        if !self.source_ranges.is_empty() && self.external_ips.is_empty() {
            return Err(NatError::InvalidService {
                name: self.name.clone(),
                message: "source ranges require at least one external IP".into(),
            });
        }
        Ok(())
    }

    fn value(&self, backend_id: u32) -> FrontendValue {
        let mut value = FrontendValue::new(backend_id, self.backends.len() as u32);
        if self.affinity_timeout_secs > 0 {
            value.flags |= FRONTEND_FLAG_AFFINITY;
            value.affinity_timeout_secs = self.affinity_timeout_secs;
        }
        value
    }

    /// Compile this service into frontend map entries.
    ///
    /// The ClusterIP always gets a bare (source /0) entry. External IPs
    /// get bare entries too unless source ranges are configured, in
    /// which case each range yields a qualified entry and the bare key
    /// turns into the blackhole sentinel.
    pub fn frontend_entries(&self, backend_id: u32) -> Vec<FrontendMapEntry> {
        let proto = self.protocol.number();
        let value = self.value(backend_id);
        let mut entries = Vec::new();

        let bare = |addr: Ipv4Addr, value: FrontendValue| FrontendMapEntry {
            prefix_len: frontend_prefix_len(0),
            key: FrontendKey::new(u32::from(addr).to_be(), self.port, proto, 0),
            value,
        };

        entries.push(bare(self.cluster_ip, value));

        for external in &self.external_ips {
            if self.source_ranges.is_empty() {
                entries.push(bare(*external, value));
                continue;
            }
            for range in &self.source_ranges {
                entries.push(FrontendMapEntry {
                    prefix_len: frontend_prefix_len(range.prefix_len),
                    key: FrontendKey::new(
                        u32::from(*external).to_be(),
                        self.port,
                        proto,
                        range.network().to_be(),
                    ),
                    value,
                });
            }
            entries.push(bare(*external, FrontendValue::blackhole()));
        }

        entries
    }

    /// Compile the backend pool for this service.
    pub fn backend_entries(&self, backend_id: u32) -> Vec<(BackendKey, BackendValue)> {
        self.backends
            .iter()
            .enumerate()
            .map(|(ordinal, be)| {
                (
                    BackendKey {
                        backend_id,
                        ordinal: ordinal as u32,
                    },
                    BackendValue {
                        addr: u32::from(be.addr).to_be(),
                        port: be.port,
                        _pad: 0,
                    },
                )
            })
            .collect()
    }

    /// Whether this service programs the given (frontend, backend)
    /// pairing; addresses in network byte order. Feeds the stale-NAT
    /// sweep.
    pub fn has_pairing(
        &self,
        front_addr: u32,
        front_port: u16,
        back_addr: u32,
        back_port: u16,
        proto: u8,
    ) -> bool {
        if proto != self.protocol.number() || front_port != self.port {
            return false;
        }
        let fronts_match = u32::from(self.cluster_ip).to_be() == front_addr
            || self
                .external_ips
                .iter()
                .any(|ip| u32::from(*ip).to_be() == front_addr);
        if !fronts_match {
            return false;
        }
        self.backends
            .iter()
            .any(|be| u32::from(be.addr).to_be() == back_addr && be.port == back_port)
    }
}

/// Key of the affinity entry a flow would use; exposed for diagnostics.
pub fn affinity_key(client: Ipv4Addr, frontend: Ipv4Addr, port: u16, proto: Protocol) -> AffinityKey {
    AffinityKey {
        client_addr: u32::from(client).to_be(),
        frontend_addr: u32::from(frontend).to_be(),
        port,
        protocol: proto.number(),
        _pad: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ServiceFrontend {
        ServiceFrontend {
            name: "test-service".into(),
            cluster_ip: Ipv4Addr::new(10, 0, 0, 2),
            port: 2222,
            protocol: Protocol::Tcp,
            external_ips: vec![Ipv4Addr::new(35, 0, 0, 2)],
            source_ranges: vec![
                Cidr {
                    addr: u32::from(Ipv4Addr::new(35, 0, 1, 2)),
                    prefix_len: 24,
                },
                Cidr {
                    addr: u32::from(Ipv4Addr::new(33, 0, 1, 2)),
                    prefix_len: 16,
                },
            ],
            affinity_timeout_secs: 0,
            backends: vec![ServiceBackend {
                addr: Ipv4Addr::new(10, 1, 0, 1),
                port: 5555,
            }],
        }
    }

    #[test]
    fn source_ranges_generate_qualified_and_blackhole_entries() {
        let svc = service();
        let entries = svc.frontend_entries(7);
        assert_eq!(entries.len(), 4);

        let ext = u32::from(Ipv4Addr::new(35, 0, 0, 2)).to_be();
        let cluster = u32::from(Ipv4Addr::new(10, 0, 0, 2)).to_be();

        // ClusterIP: bare, real value, never blackholed.
        let cluster_entry = entries
            .iter()
            .find(|e| e.key.dst_addr == cluster)
            .expect("cluster entry");
        assert_eq!(cluster_entry.prefix_len, 64);
        assert!(!cluster_entry.value.is_blackhole());
        assert_eq!(cluster_entry.value.backend_id, 7);
        assert_eq!(cluster_entry.value.backend_count, 1);

        // External IP: two source-qualified entries...
        let qualified: Vec<_> = entries
            .iter()
            .filter(|e| e.key.dst_addr == ext && e.key.src_addr != 0)
            .collect();
        assert_eq!(qualified.len(), 2);
        assert!(qualified.iter().all(|e| !e.value.is_blackhole()));
        let prefixes: Vec<u32> = qualified.iter().map(|e| e.prefix_len).collect();
        assert!(prefixes.contains(&(64 + 24)));
        assert!(prefixes.contains(&(64 + 16)));

        // Source addresses are pre-masked to their prefix.
        let q24 = qualified.iter().find(|e| e.prefix_len == 88).unwrap();
        assert_eq!(
            q24.key.src_addr,
            u32::from(Ipv4Addr::new(35, 0, 1, 0)).to_be()
        );

        // ...and the bare key is the blackhole sentinel.
        let bare = entries
            .iter()
            .find(|e| e.key.dst_addr == ext && e.key.src_addr == 0)
            .expect("bare external entry");
        assert_eq!(bare.prefix_len, 64);
        assert!(bare.value.is_blackhole());
    }

    #[test]
    fn no_source_ranges_means_plain_entries() {
        let mut svc = service();
        svc.source_ranges.clear();
        let entries = svc.frontend_entries(1);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| !e.value.is_blackhole()));
        assert!(entries.iter().all(|e| e.prefix_len == 64));
    }

    #[test]
    fn affinity_sets_flag_and_window() {
        let mut svc = service();
        svc.affinity_timeout_secs = 300;
        let entries = svc.frontend_entries(2);
        let cluster = entries.first().unwrap();
        assert!(cluster.value.has_affinity());
        assert_eq!(cluster.value.affinity_timeout_secs, 300);
    }

    #[test]
    fn backend_entries_are_ordinal_indexed() {
        let mut svc = service();
        svc.backends.push(ServiceBackend {
            addr: Ipv4Addr::new(10, 1, 0, 2),
            port: 5556,
        });
        let entries = svc.backend_entries(3);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, BackendKey { backend_id: 3, ordinal: 0 });
        assert_eq!(entries[1].0, BackendKey { backend_id: 3, ordinal: 1 });
        assert_eq!(entries[1].1.port, 5556);
        assert_eq!(
            entries[0].1.addr,
            u32::from(Ipv4Addr::new(10, 1, 0, 1)).to_be()
        );
    }

    #[test]
    fn pairing_check_covers_cluster_and_external_ips() {
        let svc = service();
        let cluster = u32::from(Ipv4Addr::new(10, 0, 0, 2)).to_be();
        let ext = u32::from(Ipv4Addr::new(35, 0, 0, 2)).to_be();
        let backend = u32::from(Ipv4Addr::new(10, 1, 0, 1)).to_be();

        assert!(svc.has_pairing(cluster, 2222, backend, 5555, 6));
        assert!(svc.has_pairing(ext, 2222, backend, 5555, 6));
        assert!(!svc.has_pairing(cluster, 2222, backend, 5555, 17));
        assert!(!svc.has_pairing(cluster, 80, backend, 5555, 6));
        assert!(!svc.has_pairing(cluster, 2222, backend, 5556, 6));
    }

    #[test]
    fn validation_rejects_degenerate_services() {
        let mut svc = service();
        svc.port = 0;
        assert!(svc.validate().is_err());

        let mut svc = service();
        svc.external_ips.clear();
        assert!(svc.validate().is_err());

        let mut svc = service();
        svc.source_ranges.clear();
        svc.external_ips.clear();
        assert!(svc.validate().is_ok());
    }
}
