#![no_main]

use libfuzzer_sys::fuzz_target;

use infrastructure::config::AgentConfig;

// Fuzz the YAML config surface: arbitrary documents must parse-or-error,
// never panic, and anything that parses must survive every conversion.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(config) = AgentConfig::from_yaml(text) {
        let _ = config.services();
        let _ = config.routes();
        let _ = config.policy_rules();
        let _ = config.flow_timeouts();
        let _ = config.sweep_interval();
        for iface in &config.agent.interfaces {
            let _ = config.datapath_config(iface.role);
        }
    }
});
