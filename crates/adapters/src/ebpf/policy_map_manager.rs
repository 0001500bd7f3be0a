use aya::Ebpf;
use aya::maps::{Array, MapData};
use domain::common::error::DomainError;
use ebpf_common::policy::{PolicyRuleEntry, POLICY_MAX_RULES};
use ports::secondary::policy_map_port::PolicyMapPort;
use tracing::info;

/// Manages the compiled policy program (`POLICY_RULES` +
/// `POLICY_RULE_COUNT`).
pub struct PolicyMapManager {
    rules: Array<MapData, PolicyRuleEntry>,
    count: Array<MapData, u32>,
}

impl PolicyMapManager {
    pub fn new(ebpf: &mut Ebpf) -> Result<Self, anyhow::Error> {
        let rules = Array::try_from(
            ebpf.take_map("POLICY_RULES")
                .ok_or_else(|| anyhow::anyhow!("map 'POLICY_RULES' not found"))?,
        )?;
        let count = Array::try_from(
            ebpf.take_map("POLICY_RULE_COUNT")
                .ok_or_else(|| anyhow::anyhow!("map 'POLICY_RULE_COUNT' not found"))?,
        )?;
        info!("policy maps acquired (POLICY_RULES, POLICY_RULE_COUNT)");
        Ok(Self { rules, count })
    }
}

impl PolicyMapPort for PolicyMapManager {
    fn load_rules(&mut self, rules: &[PolicyRuleEntry]) -> Result<(), DomainError> {
        if rules.len() > POLICY_MAX_RULES as usize {
            return Err(DomainError::InvalidConfig(format!(
                "{} policy rules exceed the map capacity {POLICY_MAX_RULES}",
                rules.len()
            )));
        }

        for (i, rule) in rules.iter().enumerate() {
            self.rules
                .set(i as u32, *rule, 0)
                .map_err(|e| DomainError::MapError(format!("POLICY_RULES set failed: {e}")))?;
        }
        // The count gates evaluation, so setting it last publishes the
        // new rule program atomically enough for a per-packet reader.
        self.count
            .set(0, rules.len() as u32, 0)
            .map_err(|e| DomainError::MapError(format!("POLICY_RULE_COUNT set failed: {e}")))?;
        Ok(())
    }
}
