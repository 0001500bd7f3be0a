use domain::common::error::DomainError;
use ebpf_common::policy::PolicyRuleEntry;

/// Secondary port for the compiled policy rules (`POLICY_RULES` +
/// `POLICY_RULE_COUNT`).
pub trait PolicyMapPort: Send + Sync {
    /// Load the rule sequence; ordering is the evaluation order.
    fn load_rules(&mut self, rules: &[PolicyRuleEntry]) -> Result<(), DomainError>;
}
