use std::collections::HashMap;

use domain::common::error::DomainError;
use ebpf_common::conntrack::{FlowEntry, FlowKey};

use crate::secondary::conntrack_map_port::ConntrackMapPort;
use crate::secondary::metrics_port::{DatapathMetrics, SweepMetrics};

/// No-op implementation of all metrics sub-traits for use in tests.
pub struct NoopMetrics;

impl SweepMetrics for NoopMetrics {}
impl DatapathMetrics for NoopMetrics {}

/// In-memory stand-in for the kernel flow table.
#[derive(Default)]
pub struct InMemoryConntrackMap {
    entries: HashMap<FlowKey, FlowEntry>,
}

impl InMemoryConntrackMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: FlowKey, entry: FlowEntry) {
        self.entries.insert(key, entry);
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ConntrackMapPort for InMemoryConntrackMap {
    fn snapshot_keys(&self) -> Result<Vec<FlowKey>, DomainError> {
        Ok(self.entries.keys().copied().collect())
    }

    fn get(&self, key: &FlowKey) -> Result<Option<FlowEntry>, DomainError> {
        Ok(self.entries.get(key).copied())
    }

    fn remove(&mut self, key: &FlowKey) -> Result<bool, DomainError> {
        Ok(self.entries.remove(key).is_some())
    }

    fn flow_count(&self) -> Result<u64, DomainError> {
        Ok(self.entries.len() as u64)
    }
}
