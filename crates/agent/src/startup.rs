use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use adapters::ebpf::{
    ConntrackMapManager, DatapathLoader, DropCountersReader, NatMapManager, PolicyMapManager,
    RouteMapManager,
};
use application::conntrack_sweep::ConntrackSweeper;
use application::map_sync::MapSyncService;
use domain::conntrack::scanner::{EntryScanner, LivenessScanner, StaleNatScanner};
use ebpf_common::reasons::reason_name;
use infrastructure::config::AgentConfig;
use infrastructure::constants::{
    DATAPATH_OBJECT, DEFAULT_EBPF_PROGRAM_DIR, DEFAULT_EBPF_PROGRAM_DIR_DEV,
};
use infrastructure::logging::init_logging;
use infrastructure::metrics::LogMetrics;
use ports::secondary::counters_port::DropCountersPort;
use ports::secondary::metrics_port::MetricsPort;
use tracing::{info, warn};

use crate::cli::Cli;

/// Run the agent startup sequence and block until shutdown.
pub async fn run(cli: &Cli) -> anyhow::Result<()> {
    // ── 1. Load config ──────────────────────────────────────────────
    let config = AgentConfig::load(Path::new(&cli.config))?;

    // ── 2. Initialize logging (CLI flags beat the config file) ──────
    let log_level = cli.log_level.unwrap_or(config.agent.log_level);
    let log_format = cli.log_format.unwrap_or(config.agent.log_format);
    init_logging(log_level, log_format)?;

    info!(
        config_path = %cli.config,
        log_level = log_level.as_str(),
        log_format = log_format.as_str(),
        "flowgate agent starting"
    );

    let metrics: Arc<dyn MetricsPort> = Arc::new(LogMetrics);

    // ── 3. Convert config to domain objects ─────────────────────────
    let services = config.services()?;
    let routes = config.routes()?;
    let policy = config.policy_rules()?;
    let timeouts = config.flow_timeouts();
    timeouts.validate().map_err(domain::common::error::DomainError::from)?;

    // ── 4. Load and attach the datapath per interface ───────────────
    let program_bytes = read_datapath_object(&config)?;

    let mut loaders = Vec::new();
    let mut primary: Option<DatapathLoader> = None;
    for iface in &config.agent.interfaces {
        match try_attach(&program_bytes, &config, iface) {
            Ok(loader) => {
                metrics.set_datapath_status(&iface.name, true);
                info!(interface = %iface.name, role = ?iface.role, "datapath active");
                if primary.is_none() {
                    primary = Some(loader);
                } else {
                    loaders.push(loader);
                }
            }
            Err(e) => {
                metrics.set_datapath_status(&iface.name, false);
                warn!(interface = %iface.name, "datapath attach failed (degraded): {e}");
            }
        }
    }
    let Some(mut primary) = primary else {
        anyhow::bail!("no interface could be attached; refusing to run");
    };

    // ── 5. Sync the control-plane maps ──────────────────────────────
    let nat_mgr = NatMapManager::new(primary.ebpf_mut())?;
    let route_mgr = RouteMapManager::new(primary.ebpf_mut())?;
    let policy_mgr = PolicyMapManager::new(primary.ebpf_mut())?;
    let mut sync = MapSyncService::new(
        Box::new(nat_mgr),
        Box::new(route_mgr),
        Box::new(policy_mgr),
        Arc::clone(&metrics),
    );
    sync.sync_services(&services)?;
    sync.sync_routes(&routes)?;
    sync.sync_policy(&policy)?;

    // ── 6. Build the sweeper ────────────────────────────────────────
    let conntrack_mgr = ConntrackMapManager::new(primary.ebpf_mut())?;
    let counters = DropCountersReader::new(primary.ebpf_mut())?;

    let liveness = LivenessScanner::with_clock(timeouts, boot_time_nanos);
    let stale_nat = StaleNatScanner::new(MapSyncService::nat_checker(&services));
    let scanners: Vec<Box<dyn EntryScanner + Send>> =
        vec![Box::new(liveness), Box::new(stale_nat)];
    let mut sweeper = ConntrackSweeper::new(
        Box::new(conntrack_mgr),
        scanners,
        Arc::clone(&metrics),
    );

    // ── 7. Spawn the sweep loop ─────────────────────────────────────
    let cancel_token = tokio_util::sync::CancellationToken::new();
    spawn_signal_watcher(cancel_token.clone());
    let sweep_cancel = cancel_token.clone();
    let sweep_interval = config.sweep_interval();
    let sweep_metrics = Arc::clone(&metrics);
    let sweep_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = sweep_cancel.cancelled() => break,
            }

            let started = Instant::now();
            match sweeper.sweep_once() {
                Ok(stats) => {
                    sweep_metrics.observe_sweep_duration(started.elapsed().as_secs_f64());
                    if stats.deleted > 0 {
                        info!(
                            examined = stats.examined,
                            deleted = stats.deleted,
                            "conntrack sweep pass"
                        );
                    }
                }
                Err(e) => warn!("conntrack sweep failed: {e}"),
            }

            match counters.read_totals() {
                Ok(totals) => {
                    for (reason, total) in totals.iter().enumerate() {
                        sweep_metrics.set_drops_total(reason_name(reason as u32), *total);
                    }
                }
                Err(e) => warn!("drop counter read failed: {e}"),
            }
        }
    });

    // ── 8. Ready — wait for the shutdown signal ─────────────────────
    info!("agent ready, waiting for shutdown signal");
    cancel_token.cancelled().await;

    info!("shutdown: stopping sweep loop");
    let _ = tokio::time::timeout(
        infrastructure::constants::GRACEFUL_SHUTDOWN_TIMEOUT,
        sweep_handle,
    )
    .await;

    info!("shutdown: detaching datapath");
    drop(loaders);
    drop(primary);

    info!("agent stopped");
    Ok(())
}

/// Cancel `token` once SIGINT or SIGTERM arrives, recording which one so
/// the drain sequence can say why it is running.
fn spawn_signal_watcher(token: tokio_util::sync::CancellationToken) {
    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        info!(signal, "shutdown signal received, draining");
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            // No SIGTERM stream; Ctrl+C still works.
            warn!("SIGTERM handler install failed: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}

/// Load, configure, wire, and attach one datapath instance.
fn try_attach(
    program_bytes: &[u8],
    config: &AgentConfig,
    iface: &infrastructure::config::InterfaceConfig,
) -> anyhow::Result<DatapathLoader> {
    let mut loader = DatapathLoader::load(program_bytes)?;
    loader.set_config(&config.datapath_config(iface.role))?;
    loader.wire_tail_calls()?;
    loader.attach(&iface.name, iface.role.to_ebpf())?;
    Ok(loader)
}

/// Resolve and read the compiled datapath object.
///
/// Precedence: `EBPF_PROGRAM_DIR` env var > `agent.ebpf_program_dir`
/// config > production default > dev fallback.
fn read_datapath_object(config: &AgentConfig) -> anyhow::Result<Vec<u8>> {
    let dir = if let Ok(dir) = std::env::var("EBPF_PROGRAM_DIR") {
        dir
    } else if let Some(ref dir) = config.agent.ebpf_program_dir {
        dir.clone()
    } else if Path::new(DEFAULT_EBPF_PROGRAM_DIR).is_dir() {
        DEFAULT_EBPF_PROGRAM_DIR.to_string()
    } else {
        DEFAULT_EBPF_PROGRAM_DIR_DEV.to_string()
    };

    let path = Path::new(&dir).join(DATAPATH_OBJECT);
    std::fs::read(&path)
        .map_err(|e| anyhow::anyhow!("failed to read datapath object '{}': {e}", path.display()))
}

/// Nanoseconds since boot, the clock the datapath stamps entries with.
fn boot_time_nanos() -> u64 {
    // /proc/uptime tracks CLOCK_BOOTTIME with centisecond precision,
    // plenty for timeouts measured in seconds.
    std::fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|s| {
            s.split_whitespace()
                .next()
                .and_then(|secs| secs.parse::<f64>().ok())
        })
        .map(|secs| (secs * 1e9) as u64)
        .unwrap_or_default()
}
