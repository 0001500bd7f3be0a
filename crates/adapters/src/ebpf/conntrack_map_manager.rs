use aya::Ebpf;
use aya::maps::{HashMap, MapData, MapError};
use domain::common::error::DomainError;
use ebpf_common::conntrack::{FlowEntry, FlowKey};
use ports::secondary::conntrack_map_port::ConntrackMapPort;
use tracing::info;

/// Manages the kernel flow table (`CT_FLOWS`).
pub struct ConntrackMapManager {
    flows: HashMap<MapData, FlowKey, FlowEntry>,
}

impl ConntrackMapManager {
    /// Take ownership of the flow map from the loaded datapath object.
    pub fn new(ebpf: &mut Ebpf) -> Result<Self, anyhow::Error> {
        let flows = HashMap::try_from(
            ebpf.take_map("CT_FLOWS")
                .ok_or_else(|| anyhow::anyhow!("map 'CT_FLOWS' not found"))?,
        )?;
        info!("conntrack map acquired (CT_FLOWS)");
        Ok(Self { flows })
    }
}

impl ConntrackMapPort for ConntrackMapManager {
    fn snapshot_keys(&self) -> Result<Vec<FlowKey>, DomainError> {
        Ok(self.flows.keys().filter_map(Result::ok).collect())
    }

    fn get(&self, key: &FlowKey) -> Result<Option<FlowEntry>, DomainError> {
        match self.flows.get(key, 0) {
            Ok(entry) => Ok(Some(entry)),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(DomainError::MapError(format!("CT_FLOWS get failed: {e}"))),
        }
    }

    fn remove(&mut self, key: &FlowKey) -> Result<bool, DomainError> {
        match self.flows.remove(key) {
            Ok(()) => Ok(true),
            // The kernel deleted it first; that is a success.
            Err(MapError::KeyNotFound) => Ok(false),
            Err(e) => Err(DomainError::MapError(format!(
                "CT_FLOWS remove failed: {e}"
            ))),
        }
    }

    fn flow_count(&self) -> Result<u64, DomainError> {
        Ok(self.flows.keys().filter_map(Result::ok).count() as u64)
    }
}
