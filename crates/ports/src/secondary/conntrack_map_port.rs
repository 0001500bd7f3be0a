use domain::common::error::DomainError;
use ebpf_common::conntrack::{FlowEntry, FlowKey};

/// Secondary port for the kernel flow table (`CT_FLOWS`).
///
/// The sweeper is the only deleter; the datapath is the only writer.
/// Implemented by the conntrack map manager in the adapter layer.
pub trait ConntrackMapPort: Send + Sync {
    /// Snapshot of the current keys. Entries may disappear between the
    /// snapshot and later calls; callers must tolerate that.
    fn snapshot_keys(&self) -> Result<Vec<FlowKey>, DomainError>;

    /// Read one entry. `Ok(None)` when the key no longer exists.
    fn get(&self, key: &FlowKey) -> Result<Option<FlowEntry>, DomainError>;

    /// Delete one entry. `Ok(false)` when the kernel already removed it
    /// (concurrent deletion is not an error).
    fn remove(&mut self, key: &FlowKey) -> Result<bool, DomainError>;

    /// Current number of tracked flows.
    fn flow_count(&self) -> Result<u64, DomainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conntrack_map_port_is_object_safe() {
        fn _check(port: &dyn ConntrackMapPort) {
            let _ = port.flow_count();
        }
    }
}
