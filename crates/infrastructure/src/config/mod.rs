//! Agent configuration: structs, parsing, and validation.
//!
//! The YAML document mirrors the map surface: interfaces with their hook
//! roles, the VXLAN overlay parameters, the conntrack sweep schedule,
//! and the services/routes/policy the sync services compile into maps.

mod common;

pub use common::{ConfigError, LogFormat, LogLevel, parse_cidr};

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use domain::common::entity::Protocol;
use domain::conntrack::entity::FlowTimeouts;
use domain::nat::entity::{ServiceBackend, ServiceFrontend};
use domain::policy::entity::{PolicyRule, PortRange, RuleProtocol, RuleVerdict};
use domain::routes::entity::{RouteEntry, RouteKind};
use ebpf_common::state::{
    CFG_DNAT_DECAP, CFG_DNAT_ENCAP, CFG_DROP_WORKLOAD_TO_HOST, CFG_DSR, CFG_FIB_LOOKUP,
    DatapathConfig, HOOK_FROM_HEP, HOOK_FROM_HOST, HOOK_FROM_WORKLOAD, HOOK_TO_HEP, HOOK_TO_HOST,
    HOOK_TO_WORKLOAD,
};
use serde::{Deserialize, Serialize};

use common::default_true;

// ── Top-level config ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub agent: AgentSection,

    #[serde(default)]
    pub vxlan: VxlanSection,

    #[serde(default)]
    pub datapath: DatapathSection,

    #[serde(default)]
    pub conntrack: ConntrackSection,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    #[serde(default)]
    pub policy: Vec<PolicyRuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSection {
    /// This node's address, used as the VXLAN/tunnel endpoint and for
    /// source fixups.
    pub host_ip: Ipv4Addr,
    pub interfaces: Vec<InterfaceConfig>,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
    #[serde(default)]
    pub ebpf_program_dir: Option<String>,
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceConfig {
    pub name: String,
    pub role: HookRole,
}

/// Where on the interface the datapath hooks, and which side of the
/// conversation it polices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookRole {
    FromWorkload,
    ToWorkload,
    FromHost,
    ToHost,
    FromHep,
    ToHep,
}

impl HookRole {
    pub const fn to_ebpf(self) -> u8 {
        match self {
            Self::FromWorkload => HOOK_FROM_WORKLOAD,
            Self::ToWorkload => HOOK_TO_WORKLOAD,
            Self::FromHost => HOOK_FROM_HOST,
            Self::ToHost => HOOK_TO_HOST,
            Self::FromHep => HOOK_FROM_HEP,
            Self::ToHep => HOOK_TO_HEP,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VxlanSection {
    /// Enables DNAT encap/decap through the overlay.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_vxlan_port")]
    pub port: u16,
    #[serde(default = "default_vxlan_vni")]
    pub vni: u32,
    /// Path MTU used for the encap DF check.
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

fn default_vxlan_port() -> u16 {
    4789
}

fn default_vxlan_vni() -> u32 {
    4096
}

fn default_mtu() -> u16 {
    1450
}

impl Default for VxlanSection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_vxlan_port(),
            vni: default_vxlan_vni(),
            mtu: default_mtu(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatapathSection {
    #[serde(default = "default_true")]
    pub fib_lookup: bool,
    #[serde(default)]
    pub drop_workload_to_host: bool,
    #[serde(default)]
    pub dsr: bool,
}

impl Default for DatapathSection {
    fn default() -> Self {
        Self {
            fib_lookup: true,
            drop_workload_to_host: false,
            dsr: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConntrackSection {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
}

fn default_sweep_interval() -> u64 {
    10
}

impl Default for ConntrackSection {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            timeouts: TimeoutsSection::default(),
        }
    }
}

/// Sweep schedule in seconds; defaults mirror `FlowTimeouts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutsSection {
    #[serde(default = "d10")]
    pub creation_grace_secs: u64,
    #[serde(default = "d20")]
    pub tcp_pre_established_secs: u64,
    #[serde(default = "d3600")]
    pub tcp_established_secs: u64,
    #[serde(default = "d30")]
    pub tcp_fins_seen_secs: u64,
    #[serde(default = "d40")]
    pub tcp_reset_seen_secs: u64,
    #[serde(default = "d60")]
    pub udp_last_seen_secs: u64,
    #[serde(default = "d5")]
    pub icmp_last_seen_secs: u64,
}

fn d5() -> u64 {
    5
}
fn d10() -> u64 {
    10
}
fn d20() -> u64 {
    20
}
fn d30() -> u64 {
    30
}
fn d40() -> u64 {
    40
}
fn d60() -> u64 {
    60
}
fn d3600() -> u64 {
    3600
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            creation_grace_secs: d10(),
            tcp_pre_established_secs: d20(),
            tcp_established_secs: d3600(),
            tcp_fins_seen_secs: d30(),
            tcp_reset_seen_secs: d40(),
            udp_last_seen_secs: d60(),
            icmp_last_seen_secs: d5(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,
    pub cluster_ip: Ipv4Addr,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub external_ips: Vec<Ipv4Addr>,
    #[serde(default)]
    pub source_ranges: Vec<String>,
    #[serde(default)]
    pub affinity_timeout_secs: u32,
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub addr: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub cidr: String,
    pub kind: RouteKind,
    #[serde(default)]
    pub if_index: u32,
    #[serde(default)]
    pub next_hop: Option<Ipv4Addr>,
    #[serde(default)]
    pub in_pool: bool,
    #[serde(default)]
    pub nat_outgoing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRuleConfig {
    #[serde(default)]
    pub protocol: Option<RuleProtocol>,
    #[serde(default)]
    pub src_cidrs: Vec<String>,
    #[serde(default)]
    pub dst_cidrs: Vec<String>,
    #[serde(default)]
    pub src_ports: Vec<PortRangeConfig>,
    #[serde(default)]
    pub dst_ports: Vec<PortRangeConfig>,
    #[serde(default)]
    pub icmp_type: Option<u8>,
    #[serde(default)]
    pub icmp_code: Option<u8>,
    pub verdict: RuleVerdict,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortRangeConfig {
    pub start: u16,
    #[serde(default)]
    pub end: Option<u16>,
}

// ── Loading and conversion ─────────────────────────────────────────

impl AgentConfig {
    /// Load config from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.interfaces.is_empty() {
            return Err(ConfigError::Validation {
                field: "agent.interfaces".into(),
                message: "at least one interface is required".into(),
            });
        }
        if self.agent.host_ip.is_unspecified() {
            return Err(ConfigError::Validation {
                field: "agent.host_ip".into(),
                message: "host_ip must be set".into(),
            });
        }
        if self.vxlan.enabled && self.vxlan.mtu <= 50 {
            return Err(ConfigError::Validation {
                field: "vxlan.mtu".into(),
                message: "MTU must exceed the 50-byte VXLAN overhead".into(),
            });
        }
        // Domain-level validation happens again at sync time; failing
        // early here gives a better startup error.
        for service in self.services()? {
            service.validate().map_err(|e| ConfigError::Validation {
                field: "services".into(),
                message: e.to_string(),
            })?;
        }
        for route in self.routes()? {
            route.validate().map_err(|e| ConfigError::Validation {
                field: "routes".into(),
                message: e.to_string(),
            })?;
        }
        for rule in self.policy_rules()? {
            rule.validate().map_err(|e| ConfigError::Validation {
                field: "policy".into(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn services(&self) -> Result<Vec<ServiceFrontend>, ConfigError> {
        self.services
            .iter()
            .map(|svc| {
                let source_ranges = svc
                    .source_ranges
                    .iter()
                    .map(|s| parse_cidr(s))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ServiceFrontend {
                    name: svc.name.clone(),
                    cluster_ip: svc.cluster_ip,
                    port: svc.port,
                    protocol: svc.protocol,
                    external_ips: svc.external_ips.clone(),
                    source_ranges,
                    affinity_timeout_secs: svc.affinity_timeout_secs,
                    backends: svc
                        .backends
                        .iter()
                        .map(|b| ServiceBackend {
                            addr: b.addr,
                            port: b.port,
                        })
                        .collect(),
                })
            })
            .collect()
    }

    pub fn routes(&self) -> Result<Vec<RouteEntry>, ConfigError> {
        self.routes
            .iter()
            .map(|route| {
                Ok(RouteEntry {
                    cidr: parse_cidr(&route.cidr)?,
                    kind: route.kind,
                    if_index: route.if_index,
                    next_hop: route.next_hop,
                    in_pool: route.in_pool,
                    nat_outgoing: route.nat_outgoing,
                })
            })
            .collect()
    }

    pub fn policy_rules(&self) -> Result<Vec<PolicyRule>, ConfigError> {
        self.policy
            .iter()
            .map(|rule| {
                let parse_ranges = |ranges: &[PortRangeConfig]| {
                    ranges
                        .iter()
                        .map(|r| PortRange {
                            start: r.start,
                            end: r.end.unwrap_or(r.start),
                        })
                        .collect::<Vec<_>>()
                };
                Ok(PolicyRule {
                    protocol: rule.protocol,
                    src_cidrs: rule
                        .src_cidrs
                        .iter()
                        .map(|s| parse_cidr(s))
                        .collect::<Result<Vec<_>, _>>()?,
                    dst_cidrs: rule
                        .dst_cidrs
                        .iter()
                        .map(|s| parse_cidr(s))
                        .collect::<Result<Vec<_>, _>>()?,
                    src_ports: parse_ranges(&rule.src_ports),
                    dst_ports: parse_ranges(&rule.dst_ports),
                    icmp_type: rule.icmp_type,
                    icmp_code: rule.icmp_code,
                    verdict: rule.verdict,
                })
            })
            .collect()
    }

    pub fn flow_timeouts(&self) -> FlowTimeouts {
        let t = &self.conntrack.timeouts;
        FlowTimeouts {
            creation_grace: Duration::from_secs(t.creation_grace_secs),
            tcp_pre_established: Duration::from_secs(t.tcp_pre_established_secs),
            tcp_established: Duration::from_secs(t.tcp_established_secs),
            tcp_fins_seen: Duration::from_secs(t.tcp_fins_seen_secs),
            tcp_reset_seen: Duration::from_secs(t.tcp_reset_seen_secs),
            udp_last_seen: Duration::from_secs(t.udp_last_seen_secs),
            icmp_last_seen: Duration::from_secs(t.icmp_last_seen_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.conntrack.sweep_interval_secs)
    }

    /// Compile the per-attachment config block for the given hook role.
    pub fn datapath_config(&self, role: HookRole) -> DatapathConfig {
        let mut flags = 0u8;
        if self.datapath.fib_lookup {
            flags |= CFG_FIB_LOOKUP;
        }
        if self.datapath.drop_workload_to_host {
            flags |= CFG_DROP_WORKLOAD_TO_HOST;
        }
        if self.datapath.dsr {
            flags |= CFG_DSR;
        }
        if self.vxlan.enabled {
            flags |= CFG_DNAT_ENCAP | CFG_DNAT_DECAP;
        }
        DatapathConfig {
            host_ip: u32::from(self.agent.host_ip).to_be(),
            vxlan_vni: self.vxlan.vni,
            vxlan_port: self.vxlan.port,
            mtu: self.vxlan.mtu,
            hook_role: role.to_ebpf(),
            flags,
            log_level: match self.agent.log_level {
                LogLevel::Error => 0,
                LogLevel::Warn => 1,
                LogLevel::Info => 2,
                LogLevel::Debug => 3,
                LogLevel::Trace => 4,
            },
            _pad: 0,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
agent:
  host_ip: 192.168.0.1
  interfaces:
    - name: cali01
      role: from-workload
    - name: eth0
      role: from-hep
services:
  - name: web
    cluster_ip: 10.96.0.1
    port: 80
    protocol: tcp
    external_ips: [35.0.0.2]
    source_ranges: ["35.0.1.0/24"]
    backends:
      - addr: 10.0.0.9
        port: 8080
routes:
  - cidr: 10.0.0.5/32
    kind: local_workload
    if_index: 12
    in_pool: true
  - cidr: 10.1.0.0/24
    kind: remote_workload
    next_hop: 192.168.0.7
    in_pool: true
policy:
  - protocol: tcp
    src_cidrs: ["10.0.0.0/8"]
    dst_ports:
      - start: 80
      - start: 8000
        end: 8100
    verdict: allow
"#;

    #[test]
    fn sample_parses_with_defaults() {
        let config = AgentConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.agent.interfaces.len(), 2);
        assert_eq!(config.agent.interfaces[1].role, HookRole::FromHep);
        assert_eq!(config.agent.log_level, LogLevel::Info);
        assert_eq!(config.vxlan.port, 4789);
        assert_eq!(config.vxlan.mtu, 1450);
        assert!(config.datapath.fib_lookup);
        assert_eq!(config.conntrack.sweep_interval_secs, 10);
    }

    #[test]
    fn services_convert_to_domain() {
        let config = AgentConfig::from_yaml(SAMPLE).unwrap();
        let services = config.services().unwrap();
        assert_eq!(services.len(), 1);
        let svc = &services[0];
        assert_eq!(svc.port, 80);
        assert_eq!(svc.source_ranges.len(), 1);
        assert_eq!(svc.source_ranges[0].prefix_len, 24);
        assert_eq!(svc.backends[0].port, 8080);
    }

    #[test]
    fn routes_convert_to_domain() {
        let config = AgentConfig::from_yaml(SAMPLE).unwrap();
        let routes = config.routes().unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].kind, RouteKind::LocalWorkload);
        assert_eq!(routes[0].if_index, 12);
        assert!(routes[1].next_hop.is_some());
    }

    #[test]
    fn policy_rules_convert_with_single_port_shorthand() {
        let config = AgentConfig::from_yaml(SAMPLE).unwrap();
        let rules = config.policy_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].dst_ports[0], PortRange { start: 80, end: 80 });
        assert_eq!(
            rules[0].dst_ports[1],
            PortRange {
                start: 8000,
                end: 8100
            }
        );
    }

    #[test]
    fn timeouts_convert_to_durations() {
        let config = AgentConfig::from_yaml(SAMPLE).unwrap();
        let timeouts = config.flow_timeouts();
        assert_eq!(timeouts.tcp_reset_seen, Duration::from_secs(40));
        assert!(timeouts.validate().is_ok());
    }

    #[test]
    fn datapath_config_flags() {
        let config = AgentConfig::from_yaml(SAMPLE).unwrap();
        let dp = config.datapath_config(HookRole::FromWorkload);
        assert!(dp.fib_enabled());
        assert!(dp.encap_enabled());
        assert!(dp.decap_enabled());
        assert!(!dp.dsr_enabled());
        assert_eq!(dp.hook_role, HOOK_FROM_WORKLOAD);
        assert_eq!(dp.vxlan_port, 4789);
        assert_eq!(
            dp.host_ip,
            u32::from(Ipv4Addr::new(192, 168, 0, 1)).to_be()
        );
    }

    #[test]
    fn missing_interfaces_rejected() {
        let yaml = r#"
agent:
  host_ip: 192.168.0.1
  interfaces: []
"#;
        assert!(AgentConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn unknown_fields_rejected() {
        let yaml = r#"
agent:
  host_ip: 192.168.0.1
  interfaces:
    - name: eth0
      role: from-hep
  surprise: true
"#;
        assert!(AgentConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn bad_cidr_rejected() {
        let yaml = r#"
agent:
  host_ip: 192.168.0.1
  interfaces:
    - name: eth0
      role: from-hep
routes:
  - cidr: 10.0.0.0/40
    kind: local_host
"#;
        assert!(AgentConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn tiny_mtu_rejected() {
        let yaml = r#"
agent:
  host_ip: 192.168.0.1
  interfaces:
    - name: eth0
      role: from-hep
vxlan:
  mtu: 50
"#;
        assert!(AgentConfig::from_yaml(yaml).is_err());
    }
}
