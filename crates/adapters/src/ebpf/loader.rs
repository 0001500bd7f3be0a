use aya::{
    Ebpf,
    maps::{Array, ProgramArray},
    programs::{SchedClassifier, TcAttachType, tc},
};
use ebpf_common::state::{
    DatapathConfig, HOOK_FROM_HEP, HOOK_FROM_HOST, HOOK_FROM_WORKLOAD, HOOK_TO_HEP, HOOK_TO_HOST,
    HOOK_TO_WORKLOAD, JUMP_SLOT_ACCEPTED, JUMP_SLOT_POLICY,
};
use tracing::{info, warn};

/// Loads the TC datapath object, attaches its entry classifier, wires the
/// tail-call chain, and injects the per-attachment configuration.
///
/// One loader instance per attachment: the maps (conntrack aside, which
/// is pinned and node-global in production deployments) and the config
/// block belong to a single interface + direction.
pub struct DatapathLoader {
    ebpf: Ebpf,
}

impl DatapathLoader {
    /// Load the datapath ELF from raw bytes.
    ///
    /// Initializes aya-log forwarding of in-kernel debug messages
    /// (best-effort).
    pub fn load(program_bytes: &[u8]) -> Result<Self, anyhow::Error> {
        let mut ebpf = Ebpf::load(program_bytes)?;

        if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
            warn!("eBPF logger init failed (non-fatal): {e}");
        }

        info!("datapath object loaded");
        Ok(Self { ebpf })
    }

    /// Write the configuration block. Must precede [`attach`]: the entry
    /// program passes everything through until it sees a config.
    pub fn set_config(&mut self, config: &DatapathConfig) -> Result<(), anyhow::Error> {
        let mut map: Array<_, DatapathConfig> = Array::try_from(
            self.ebpf
                .map_mut("DATAPATH_CONFIG")
                .ok_or_else(|| anyhow::anyhow!("map 'DATAPATH_CONFIG' not found"))?,
        )?;
        map.set(0, *config, 0)?;
        info!(
            hook_role = config.hook_role,
            flags = config.flags,
            "datapath config injected"
        );
        Ok(())
    }

    /// Load the tail programs and fill the jump table: slot 0 = policy,
    /// slot 1 = accepted.
    pub fn wire_tail_calls(&mut self) -> Result<(), anyhow::Error> {
        for name in ["tc_datapath_policy", "tc_datapath_accepted"] {
            let program: &mut SchedClassifier = self
                .ebpf
                .program_mut(name)
                .ok_or_else(|| anyhow::anyhow!("program '{name}' not found in eBPF object"))?
                .try_into()?;
            program.load()?;
        }

        let policy_fd = self.classifier_fd("tc_datapath_policy")?;
        let accepted_fd = self.classifier_fd("tc_datapath_accepted")?;

        let mut jump_table = ProgramArray::try_from(
            self.ebpf
                .take_map("JUMP_TABLE")
                .ok_or_else(|| anyhow::anyhow!("map 'JUMP_TABLE' not found"))?,
        )?;
        jump_table.set(JUMP_SLOT_POLICY, &policy_fd, 0)?;
        jump_table.set(JUMP_SLOT_ACCEPTED, &accepted_fd, 0)?;

        info!("tail-call chain wired (policy → accepted)");
        Ok(())
    }

    /// Attach the entry classifier to the interface, in the direction the
    /// hook role implies.
    pub fn attach(&mut self, interface: &str, hook_role: u8) -> Result<(), anyhow::Error> {
        if let Err(e) = tc::qdisc_add_clsact(interface) {
            warn!(interface, error = %e, "qdisc_add_clsact failed (may already exist)");
        }

        let attach_type = attach_type_for(hook_role)?;
        let program: &mut SchedClassifier = self
            .ebpf
            .program_mut("tc_datapath")
            .ok_or_else(|| anyhow::anyhow!("program 'tc_datapath' not found in eBPF object"))?
            .try_into()?;
        program.load()?;
        program.attach(interface, attach_type)?;

        info!(interface, hook_role, ?attach_type, "datapath attached");
        Ok(())
    }

    fn classifier_fd(&self, name: &str) -> Result<aya::programs::ProgramFd, anyhow::Error> {
        let program: &SchedClassifier = self
            .ebpf
            .program(name)
            .ok_or_else(|| anyhow::anyhow!("program '{name}' not found"))?
            .try_into()?;
        Ok(program.fd()?.try_clone()?)
    }

    /// Borrow the inner `Ebpf`; the map managers take their maps from it.
    pub fn ebpf_mut(&mut self) -> &mut Ebpf {
        &mut self.ebpf
    }
}

fn attach_type_for(hook_role: u8) -> Result<TcAttachType, anyhow::Error> {
    match hook_role {
        HOOK_FROM_WORKLOAD | HOOK_FROM_HOST | HOOK_FROM_HEP => Ok(TcAttachType::Ingress),
        HOOK_TO_WORKLOAD | HOOK_TO_HOST | HOOK_TO_HEP => Ok(TcAttachType::Egress),
        other => Err(anyhow::anyhow!("unknown hook role {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_map_to_directions() {
        assert!(matches!(
            attach_type_for(HOOK_FROM_WORKLOAD).unwrap(),
            TcAttachType::Ingress
        ));
        assert!(matches!(
            attach_type_for(HOOK_FROM_HEP).unwrap(),
            TcAttachType::Ingress
        ));
        assert!(matches!(
            attach_type_for(HOOK_TO_WORKLOAD).unwrap(),
            TcAttachType::Egress
        ));
        assert!(matches!(
            attach_type_for(HOOK_TO_HEP).unwrap(),
            TcAttachType::Egress
        ));
        assert!(attach_type_for(42).is_err());
    }
}
