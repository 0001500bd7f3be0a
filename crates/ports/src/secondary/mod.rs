pub mod conntrack_map_port;
pub mod counters_port;
pub mod metrics_port;
pub mod nat_map_port;
pub mod policy_map_port;
pub mod route_map_port;
