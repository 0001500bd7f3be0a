use domain::common::error::DomainError;
use ebpf_common::reasons::REASON_COUNT;

/// Secondary port for the per-CPU drop counters (`DROP_COUNTERS`).
pub trait DropCountersPort: Send + Sync {
    /// Totals per reason code, summed over CPUs.
    fn read_totals(&self) -> Result<[u64; REASON_COUNT as usize], DomainError>;
}
