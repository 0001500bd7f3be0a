//! Periodic flow-table sweep.
//!
//! Runs the configured scanners over a snapshot of the flow table and
//! deletes what they condemn. Deletion is restricted to the key under
//! examination; a companion entry discovered stale is picked up when the
//! iteration reaches it (or on the next pass). Concurrent deletion by
//! the kernel is expected and not an error.

use std::collections::HashMap;
use std::sync::Arc;

use domain::common::error::DomainError;
use domain::conntrack::scanner::{EntryScanner, ScanVerdict};
use ebpf_common::conntrack::FlowKey;
use ports::secondary::conntrack_map_port::ConntrackMapPort;
use ports::secondary::metrics_port::MetricsPort;
use tracing::{debug, warn};

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub examined: u64,
    pub deleted: u64,
}

pub struct ConntrackSweeper {
    port: Box<dyn ConntrackMapPort + Send>,
    scanners: Vec<Box<dyn EntryScanner + Send>>,
    metrics: Arc<dyn MetricsPort>,
}

impl ConntrackSweeper {
    pub fn new(
        port: Box<dyn ConntrackMapPort + Send>,
        scanners: Vec<Box<dyn EntryScanner + Send>>,
        metrics: Arc<dyn MetricsPort>,
    ) -> Self {
        Self {
            port,
            scanners,
            metrics,
        }
    }

    /// Run every scanner over the table once. The first `Delete` verdict
    /// wins and ends evaluation for that entry.
    pub fn sweep_once(&mut self) -> Result<SweepStats, DomainError> {
        let keys = self.port.snapshot_keys()?;
        let mut stats = SweepStats::default();
        let mut deleted_by_reason: HashMap<&'static str, u64> = HashMap::new();

        for key in &keys {
            // The entry may be gone by the time we reach it; other map
            // errors must not end the pass.
            let entry = match self.port.get(key) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    warn!(?key, "conntrack read failed: {e}");
                    continue;
                }
            };
            stats.examined += 1;

            let mut condemned = None;
            for scanner in self.scanners.iter_mut() {
                let port: &dyn ConntrackMapPort = self.port.as_ref();
                let get = |k: &FlowKey| port.get(k).ok().flatten();
                match scanner.scan(key, &entry, &get) {
                    ScanVerdict::Delete { reason } => {
                        condemned = Some(reason);
                        break;
                    }
                    ScanVerdict::Keep => {}
                }
            }

            if let Some(reason) = condemned {
                match self.port.remove(key) {
                    // false = the kernel won the race; the entry is gone
                    // either way.
                    Ok(true) => {
                        stats.deleted += 1;
                        *deleted_by_reason.entry(reason).or_default() += 1;
                        debug!(reason, ?key, "evicted conntrack entry");
                    }
                    Ok(false) => {}
                    Err(e) => warn!(?key, "conntrack delete failed: {e}"),
                }
            }
        }

        for (reason, count) in &deleted_by_reason {
            self.metrics.record_sweep_deleted(reason, *count);
        }
        self.metrics.set_flows_tracked(self.port.flow_count()?);

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::conntrack::entity::FlowTimeouts;
    use domain::conntrack::scanner::{LivenessScanner, NatChecker, StaleNatScanner};
    use ebpf_common::conntrack::{FlowEntry, TCP_ESTABLISHED, TCP_RST_SEEN, TCP_SYN_SEEN};
    use ports::test_utils::{InMemoryConntrackMap, NoopMetrics};

    const SEC: u64 = 1_000_000_000;

    fn sweeper_at(now: u64, map: InMemoryConntrackMap) -> ConntrackSweeper {
        let scanner = LivenessScanner::with_clock(FlowTimeouts::default(), move || now);
        ConntrackSweeper::new(Box::new(map), vec![Box::new(scanner)], Arc::new(NoopMetrics))
    }

    /// Client 10.0.0.5:40000 → ClusterIP 10.96.0.1:80, backend
    /// 10.0.0.9:8080, tracked the way the datapath tracks it.
    fn nat_pair(created: u64) -> (InMemoryConntrackMap, FlowKey, FlowKey) {
        let client = (u32::from_be_bytes([10, 0, 0, 5]), 40000u16);
        let service = (u32::from_be_bytes([10, 96, 0, 1]), 80u16);
        let backend = (u32::from_be_bytes([10, 0, 0, 9]), 8080u16);

        let pre_key = FlowKey::new(6, client.0, client.1, service.0, service.1);
        let post_key = FlowKey::new(6, client.0, client.1, backend.0, backend.1);

        let mut map = InMemoryConntrackMap::new();
        map.insert(
            post_key,
            FlowEntry::nat_reverse(created, 0, service.0, service.1, 0),
        );
        map.insert(pre_key, FlowEntry::nat_forward(created, post_key));
        (map, pre_key, post_key)
    }

    #[test]
    fn fresh_flows_survive() {
        let (map, _, _) = nat_pair(0);
        let mut sweeper = sweeper_at(5 * SEC, map);
        let stats = sweeper.sweep_once().unwrap();
        assert_eq!(stats.examined, 2);
        assert_eq!(stats.deleted, 0);
    }

    #[test]
    fn rst_flow_fully_collected() {
        // RST recorded, then the sweep runs 45s later with
        // tcp_reset_seen = 40s: both twin entries go.
        let (mut map, pre_key, post_key) = nat_pair(0);
        let mut rev = map.get(&post_key).unwrap().unwrap();
        rev.tcp_state = TCP_SYN_SEEN | TCP_ESTABLISHED | TCP_RST_SEEN;
        map.insert(post_key, rev);

        let mut sweeper = sweeper_at(45 * SEC, map);
        let stats = sweeper.sweep_once().unwrap();
        assert_eq!(stats.deleted, 2, "{pre_key:?} and {post_key:?} both gone");
    }

    #[test]
    fn rescan_deletes_nothing() {
        let (mut map, _, post_key) = nat_pair(0);
        let mut rev = map.get(&post_key).unwrap().unwrap();
        rev.tcp_state = TCP_SYN_SEEN | TCP_ESTABLISHED | TCP_RST_SEEN;
        map.insert(post_key, rev);

        let mut sweeper = sweeper_at(45 * SEC, map);
        sweeper.sweep_once().unwrap();
        let second = sweeper.sweep_once().unwrap();
        assert_eq!(second.examined, 0);
        assert_eq!(second.deleted, 0);
    }

    #[test]
    fn dangling_forward_deleted_exactly_once() {
        let (_, pre_key, post_key) = nat_pair(0);
        let mut map = InMemoryConntrackMap::new();
        map.insert(pre_key, FlowEntry::nat_forward(0, post_key));

        let mut sweeper = sweeper_at(60 * SEC, map);
        assert_eq!(sweeper.sweep_once().unwrap().deleted, 1);
        assert_eq!(sweeper.sweep_once().unwrap().deleted, 0);
    }

    #[test]
    fn grace_period_blocks_eviction() {
        let (map, _, _) = nat_pair(0);
        let mut sweeper = sweeper_at(9 * SEC, map);
        assert_eq!(sweeper.sweep_once().unwrap().deleted, 0);
    }

    #[test]
    fn stale_nat_scanner_runs_after_liveness() {
        // The control plane no longer programs the pairing: both entries
        // are condemned by the stale-NAT pass even though they are live.
        let (map, pre_key, post_key) = nat_pair(0);

        let checker: NatChecker = Box::new(|_, _, _, _, _| false);
        let liveness = LivenessScanner::with_clock(FlowTimeouts::default(), || 5 * SEC);
        let mut sweeper = ConntrackSweeper::new(
            Box::new(map),
            vec![
                Box::new(liveness),
                Box::new(StaleNatScanner::new(checker)),
            ],
            Arc::new(NoopMetrics),
        );

        let stats = sweeper.sweep_once().unwrap();
        assert_eq!(stats.deleted, 2, "{pre_key:?} and {post_key:?} both stale");
    }

    #[test]
    fn stale_nat_scanner_keeps_programmed_pairings() {
        let (map, _, _) = nat_pair(0);
        let service = u32::from_be_bytes([10, 96, 0, 1]);
        let backend = u32::from_be_bytes([10, 0, 0, 9]);

        let checker: NatChecker = Box::new(move |fa, fp, ba, bp, proto| {
            (fa, fp, ba, bp, proto) == (service, 80, backend, 8080, 6)
        });
        let mut sweeper = ConntrackSweeper::new(
            Box::new(map),
            vec![Box::new(StaleNatScanner::new(checker))],
            Arc::new(NoopMetrics),
        );
        assert_eq!(sweeper.sweep_once().unwrap().deleted, 0);
    }

    #[test]
    fn normal_flows_age_out_on_schedule() {
        let key = FlowKey::new(17, 1, 1000, 2, 53);
        let mut map = InMemoryConntrackMap::new();
        map.insert(key, FlowEntry::normal(0, 0));

        let mut sweeper = sweeper_at(61 * SEC, map);
        assert_eq!(sweeper.sweep_once().unwrap().deleted, 1);
    }
}
