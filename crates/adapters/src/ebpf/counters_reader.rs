use aya::Ebpf;
use aya::maps::{MapData, PerCpuArray};
use domain::common::error::DomainError;
use ebpf_common::reasons::REASON_COUNT;
use ports::secondary::counters_port::DropCountersPort;
use tracing::info;

/// Reads the per-CPU drop counters (`DROP_COUNTERS`).
pub struct DropCountersReader {
    counters: PerCpuArray<MapData, u64>,
}

impl DropCountersReader {
    pub fn new(ebpf: &mut Ebpf) -> Result<Self, anyhow::Error> {
        let counters = PerCpuArray::try_from(
            ebpf.take_map("DROP_COUNTERS")
                .ok_or_else(|| anyhow::anyhow!("map 'DROP_COUNTERS' not found"))?,
        )?;
        info!("drop counters acquired (DROP_COUNTERS)");
        Ok(Self { counters })
    }
}

impl DropCountersPort for DropCountersReader {
    fn read_totals(&self) -> Result<[u64; REASON_COUNT as usize], DomainError> {
        let mut totals = [0u64; REASON_COUNT as usize];
        for (reason, total) in totals.iter_mut().enumerate() {
            let per_cpu = self
                .counters
                .get(&(reason as u32), 0)
                .map_err(|e| DomainError::MapError(format!("DROP_COUNTERS get failed: {e}")))?;
            *total = per_cpu.iter().sum();
        }
        Ok(totals)
    }
}
