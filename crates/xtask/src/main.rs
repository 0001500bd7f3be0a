mod build_ebpf;

use anyhow::Result;
use clap::Parser;

#[derive(Parser)]
#[command(name = "xtask")]
enum Command {
    /// Build the eBPF datapath object for bpfel-unknown-none.
    BuildEbpf,
}

fn main() -> Result<()> {
    match Command::parse() {
        Command::BuildEbpf => build_ebpf::build(),
    }
}
