use std::time::Duration;

/// Production location of the compiled datapath object.
pub const DEFAULT_EBPF_PROGRAM_DIR: &str = "/usr/local/lib/flowgate";

/// Dev fallback, where `cargo xtask build-ebpf` drops the object.
pub const DEFAULT_EBPF_PROGRAM_DIR_DEV: &str = "target/bpfel-unknown-none/release";

/// File name of the datapath object.
pub const DATAPATH_OBJECT: &str = "tc-datapath";

/// Default interval between conntrack sweep passes.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Bound on tasks draining during shutdown.
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
