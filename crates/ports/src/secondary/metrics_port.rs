// Focused sub-traits for operational metrics, grouped by concern.
//
// Default implementations are no-ops so test mocks only implement what
// they exercise.

// ── Sweep metrics ──────────────────────────────────────────────────

pub trait SweepMetrics: Send + Sync {
    /// Record entries deleted by a sweep pass, per reason.
    fn record_sweep_deleted(&self, _reason: &str, _count: u64) {}

    /// Set the current tracked-flow gauge.
    fn set_flows_tracked(&self, _count: u64) {}

    /// Record the duration of one sweep pass.
    fn observe_sweep_duration(&self, _seconds: f64) {}
}

// ── Datapath metrics ───────────────────────────────────────────────

pub trait DatapathMetrics: Send + Sync {
    /// Set the attach status of a datapath program on an interface.
    fn set_datapath_status(&self, _interface: &str, _attached: bool) {}

    /// Set the cumulative drop counter for a reason.
    fn set_drops_total(&self, _reason: &str, _total: u64) {}

    /// Set the number of entries loaded into a map.
    fn set_map_entries(&self, _map: &str, _count: u64) {}
}

/// Umbrella trait for injection points that need everything.
pub trait MetricsPort: SweepMetrics + DatapathMetrics {}

impl<T: SweepMetrics + DatapathMetrics> MetricsPort for T {}
