use domain::common::error::DomainError;
use domain::nat::entity::FrontendMapEntry;
use ebpf_common::nat::{BackendKey, BackendValue};

/// Secondary port for the service NAT maps (`NAT_FRONTENDS`,
/// `NAT_BACKENDS`, `NAT_AFFINITY`). The control plane is the sole writer.
pub trait NatMapPort: Send + Sync {
    /// Replace the frontend table with the given entries.
    fn replace_frontends(&mut self, entries: &[FrontendMapEntry]) -> Result<(), DomainError>;

    /// Replace the backend pool.
    fn replace_backends(&mut self, entries: &[(BackendKey, BackendValue)])
    -> Result<(), DomainError>;

    /// Drop all affinity state (e.g. after a backend set change).
    /// Returns the number of entries removed.
    fn clear_affinity(&mut self) -> Result<u64, DomainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nat_map_port_is_object_safe() {
        fn _check(port: &mut dyn NatMapPort) {
            let _ = port.clear_affinity();
        }
    }
}
