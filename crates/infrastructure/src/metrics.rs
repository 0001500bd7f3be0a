//! Log-backed metrics sink.
//!
//! The datapath's counter surface is the per-CPU reason map; exposition
//! to a metrics system is an external consumer's job. This sink keeps the
//! service wiring observable by emitting gauge changes as structured log
//! events.

use ports::secondary::metrics_port::{DatapathMetrics, SweepMetrics};
use tracing::debug;

pub struct LogMetrics;

impl SweepMetrics for LogMetrics {
    fn record_sweep_deleted(&self, reason: &str, count: u64) {
        debug!(reason, count, "sweep evicted entries");
    }

    fn set_flows_tracked(&self, count: u64) {
        debug!(count, "flows tracked");
    }

    fn observe_sweep_duration(&self, seconds: f64) {
        debug!(seconds, "sweep pass finished");
    }
}

impl DatapathMetrics for LogMetrics {
    fn set_datapath_status(&self, interface: &str, attached: bool) {
        debug!(interface, attached, "datapath status");
    }

    fn set_drops_total(&self, reason: &str, total: u64) {
        debug!(reason, total, "drop counter");
    }

    fn set_map_entries(&self, map: &str, count: u64) {
        debug!(map, count, "map entries");
    }
}
