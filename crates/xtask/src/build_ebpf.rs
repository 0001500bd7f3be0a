use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};

const PROGRAM: &str = "tc-datapath";
const BPF_TARGET: &str = "bpfel-unknown-none";

/// Build the datapath object and drop it where the agent's dev fallback
/// looks for it (`target/bpfel-unknown-none/release`).
pub fn build() -> Result<()> {
    let xtask_dir = std::env::var("CARGO_MANIFEST_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::current_dir().expect("failed to get cwd"));
    let crates_dir = xtask_dir.parent().unwrap_or(&xtask_dir);
    let program_dir = crates_dir.join("ebpf-programs").join(PROGRAM);

    let output_dir = crates_dir
        .parent()
        .unwrap_or(crates_dir)
        .join("target")
        .join(BPF_TARGET)
        .join("release");
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create output dir {}", output_dir.display()))?;

    println!("Building eBPF program: {PROGRAM}");
    let status = bpf_build_command(&program_dir)
        .status()
        .with_context(|| format!("failed to run cargo for {PROGRAM}"))?;
    if !status.success() {
        anyhow::bail!("eBPF build failed for {PROGRAM}");
    }

    let built = program_dir
        .join("target")
        .join(BPF_TARGET)
        .join("release")
        .join(PROGRAM);
    let installed = output_dir.join(PROGRAM);
    std::fs::copy(&built, &installed).with_context(|| {
        format!(
            "failed to copy {} -> {}",
            built.display(),
            installed.display()
        )
    })?;
    println!("  -> {}", installed.display());

    Ok(())
}

/// The cargo invocation for the BPF target. Nightly plus `build-std` is
/// required because there is no prebuilt `core` for bpfel, and the
/// object must carry full debug info for BTF.
fn bpf_build_command(program_dir: &Path) -> Command {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(program_dir)
        .args(["+nightly", "build", "--release"])
        .args(["-Z", "build-std=core"])
        .args(["--target", BPF_TARGET])
        .env(
            "CARGO_ENCODED_RUSTFLAGS",
            encoded_rustflags(&["-C", "debuginfo=2", "-C", "link-arg=--btf"]),
        );
    cmd
}

/// Join rustc flags with the 0x1f separator `CARGO_ENCODED_RUSTFLAGS`
/// expects, which keeps flags containing spaces intact.
fn encoded_rustflags(flags: &[&str]) -> String {
    flags.join("\x1f")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rustflags_are_unit_separated() {
        assert_eq!(encoded_rustflags(&["-C", "debuginfo=2"]), "-C\x1fdebuginfo=2");
    }

    #[test]
    fn build_command_targets_bpf() {
        let cmd = bpf_build_command(Path::new("/tmp"));
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy()).collect();
        assert!(args.iter().any(|a| a == BPF_TARGET));
        assert!(args.iter().any(|a| a == "build-std=core"));
        assert!(cmd.get_envs().any(|(k, _)| k == "CARGO_ENCODED_RUSTFLAGS"));
    }
}
