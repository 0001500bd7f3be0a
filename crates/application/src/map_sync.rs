//! Pushes the configured services, routes, and policy rules into the
//! datapath maps, and hands the stale-NAT sweep its oracle.

use std::sync::Arc;

use domain::common::error::DomainError;
use domain::conntrack::scanner::NatChecker;
use domain::nat::entity::ServiceFrontend;
use domain::policy::entity::PolicyRule;
use domain::routes::entity::RouteEntry;
use ebpf_common::policy::POLICY_MAX_RULES;
use ports::secondary::metrics_port::MetricsPort;
use ports::secondary::nat_map_port::NatMapPort;
use ports::secondary::policy_map_port::PolicyMapPort;
use ports::secondary::route_map_port::RouteMapPort;
use tracing::info;

pub struct MapSyncService {
    nat: Box<dyn NatMapPort + Send>,
    routes: Box<dyn RouteMapPort + Send>,
    policy: Box<dyn PolicyMapPort + Send>,
    metrics: Arc<dyn MetricsPort>,
}

impl MapSyncService {
    pub fn new(
        nat: Box<dyn NatMapPort + Send>,
        routes: Box<dyn RouteMapPort + Send>,
        policy: Box<dyn PolicyMapPort + Send>,
        metrics: Arc<dyn MetricsPort>,
    ) -> Self {
        Self {
            nat,
            routes,
            policy,
            metrics,
        }
    }

    /// Compile and install the NAT tables. Backend ids are assigned by
    /// position; affinity state is flushed because a resync may have
    /// moved backends.
    pub fn sync_services(&mut self, services: &[ServiceFrontend]) -> Result<(), DomainError> {
        for service in services {
            service.validate()?;
        }

        let mut frontends = Vec::new();
        let mut backends = Vec::new();
        for (id, service) in services.iter().enumerate() {
            let id = id as u32;
            frontends.extend(service.frontend_entries(id));
            backends.extend(service.backend_entries(id));
        }

        self.nat.replace_frontends(&frontends)?;
        self.nat.replace_backends(&backends)?;
        let cleared = self.nat.clear_affinity()?;

        self.metrics
            .set_map_entries("nat_frontends", frontends.len() as u64);
        self.metrics
            .set_map_entries("nat_backends", backends.len() as u64);
        info!(
            services = services.len(),
            frontends = frontends.len(),
            backends = backends.len(),
            affinity_cleared = cleared,
            "service NAT maps synced"
        );
        Ok(())
    }

    pub fn sync_routes(&mut self, routes: &[RouteEntry]) -> Result<(), DomainError> {
        for route in routes {
            route.validate()?;
        }
        self.routes.replace_routes(routes)?;
        self.metrics.set_map_entries("routes", routes.len() as u64);
        info!(routes = routes.len(), "route map synced");
        Ok(())
    }

    pub fn sync_policy(&mut self, rules: &[PolicyRule]) -> Result<(), DomainError> {
        if rules.len() > POLICY_MAX_RULES as usize {
            return Err(DomainError::InvalidConfig(format!(
                "policy has {} rules, maximum is {POLICY_MAX_RULES}",
                rules.len()
            )));
        }
        for rule in rules {
            rule.validate()?;
        }
        let entries: Vec<_> = rules.iter().map(PolicyRule::to_entry).collect();
        self.policy.load_rules(&entries)?;
        self.metrics
            .set_map_entries("policy_rules", entries.len() as u64);
        info!(rules = entries.len(), "policy rules synced");
        Ok(())
    }

    /// Oracle for the stale-NAT sweep: does any configured service still
    /// program this (frontend, backend) pairing?
    pub fn nat_checker(services: &[ServiceFrontend]) -> NatChecker {
        let services = services.to_vec();
        Box::new(move |front_addr, front_port, back_addr, back_port, proto| {
            services
                .iter()
                .any(|svc| svc.has_pairing(front_addr, front_port, back_addr, back_port, proto))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::common::entity::{Cidr, Protocol};
    use domain::nat::entity::{FrontendMapEntry, ServiceBackend};
    use domain::policy::entity::{RuleVerdict, RuleProtocol};
    use ebpf_common::nat::{BackendKey, BackendValue};
    use ebpf_common::policy::PolicyRuleEntry;
    use ports::test_utils::NoopMetrics;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorded {
        frontends: Vec<FrontendMapEntry>,
        backends: Vec<(BackendKey, BackendValue)>,
        affinity_cleared: u64,
        routes: usize,
        rules: Vec<PolicyRuleEntry>,
    }

    #[derive(Default)]
    struct FakePorts(Arc<Mutex<Recorded>>);

    impl NatMapPort for FakePorts {
        fn replace_frontends(&mut self, entries: &[FrontendMapEntry]) -> Result<(), DomainError> {
            self.0.lock().unwrap().frontends = entries.to_vec();
            Ok(())
        }
        fn replace_backends(
            &mut self,
            entries: &[(BackendKey, BackendValue)],
        ) -> Result<(), DomainError> {
            self.0.lock().unwrap().backends = entries.to_vec();
            Ok(())
        }
        fn clear_affinity(&mut self) -> Result<u64, DomainError> {
            let mut state = self.0.lock().unwrap();
            state.affinity_cleared += 1;
            Ok(0)
        }
    }

    impl RouteMapPort for FakePorts {
        fn replace_routes(&mut self, routes: &[RouteEntry]) -> Result<(), DomainError> {
            self.0.lock().unwrap().routes = routes.len();
            Ok(())
        }
    }

    impl PolicyMapPort for FakePorts {
        fn load_rules(&mut self, rules: &[PolicyRuleEntry]) -> Result<(), DomainError> {
            self.0.lock().unwrap().rules = rules.to_vec();
            Ok(())
        }
    }

    fn service(name: &str) -> ServiceFrontend {
        ServiceFrontend {
            name: name.into(),
            cluster_ip: Ipv4Addr::new(10, 96, 0, 1),
            port: 80,
            protocol: Protocol::Tcp,
            external_ips: vec![],
            source_ranges: vec![],
            affinity_timeout_secs: 0,
            backends: vec![ServiceBackend {
                addr: Ipv4Addr::new(10, 0, 0, 9),
                port: 8080,
            }],
        }
    }

    fn sync_service() -> (MapSyncService, Arc<Mutex<Recorded>>) {
        let state = Arc::new(Mutex::new(Recorded::default()));
        let svc = MapSyncService::new(
            Box::new(FakePorts(Arc::clone(&state))),
            Box::new(FakePorts(Arc::clone(&state))),
            Box::new(FakePorts(Arc::clone(&state))),
            Arc::new(NoopMetrics),
        );
        (svc, state)
    }

    #[test]
    fn services_compile_with_positional_backend_ids() {
        let (mut sync, state) = sync_service();
        sync.sync_services(&[service("a"), service("b")]).unwrap();

        let recorded = state.lock().unwrap();
        assert_eq!(recorded.frontends.len(), 2);
        assert_eq!(recorded.frontends[0].value.backend_id, 0);
        assert_eq!(recorded.frontends[1].value.backend_id, 1);
        assert_eq!(recorded.backends.len(), 2);
        assert_eq!(recorded.affinity_cleared, 1);
    }

    #[test]
    fn invalid_service_rejected_before_any_write() {
        let (mut sync, state) = sync_service();
        let mut bad = service("bad");
        bad.port = 0;
        assert!(sync.sync_services(&[bad]).is_err());
        assert!(state.lock().unwrap().frontends.is_empty());
    }

    #[test]
    fn policy_rule_capacity_enforced() {
        let (mut sync, _) = sync_service();
        let rule = PolicyRule {
            protocol: Some(RuleProtocol::Tcp),
            src_cidrs: vec![Cidr {
                addr: 0x0a000000,
                prefix_len: 8,
            }],
            dst_cidrs: vec![],
            src_ports: vec![],
            dst_ports: vec![],
            icmp_type: None,
            icmp_code: None,
            verdict: RuleVerdict::Allow,
        };
        let too_many = vec![rule; POLICY_MAX_RULES as usize + 1];
        assert!(sync.sync_policy(&too_many).is_err());
    }

    #[test]
    fn nat_checker_reflects_configured_pairings() {
        let services = [service("a")];
        let checker = MapSyncService::nat_checker(&services);

        let front = u32::from(Ipv4Addr::new(10, 96, 0, 1)).to_be();
        let back = u32::from(Ipv4Addr::new(10, 0, 0, 9)).to_be();
        assert!(checker(front, 80, back, 8080, 6));
        assert!(!checker(front, 80, back, 8081, 6));
        assert!(!checker(front, 81, back, 8080, 6));
    }
}
