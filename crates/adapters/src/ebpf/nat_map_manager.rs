use aya::Ebpf;
use aya::maps::{HashMap, MapData, lpm_trie::{Key, LpmTrie}};
use domain::common::error::DomainError;
use domain::nat::entity::FrontendMapEntry;
use ebpf_common::nat::{AffinityKey, AffinityValue, BackendKey, BackendValue, FrontendKey, FrontendValue};
use ports::secondary::nat_map_port::NatMapPort;
use tracing::info;

fn map_err(map: &str, e: impl std::fmt::Display) -> DomainError {
    DomainError::MapError(format!("{map}: {e}"))
}

/// Manages the service NAT maps (`NAT_FRONTENDS`, `NAT_BACKENDS`,
/// `NAT_AFFINITY`).
pub struct NatMapManager {
    frontends: LpmTrie<MapData, FrontendKey, FrontendValue>,
    backends: HashMap<MapData, BackendKey, BackendValue>,
    affinity: HashMap<MapData, AffinityKey, AffinityValue>,
}

impl NatMapManager {
    pub fn new(ebpf: &mut Ebpf) -> Result<Self, anyhow::Error> {
        let frontends = LpmTrie::try_from(
            ebpf.take_map("NAT_FRONTENDS")
                .ok_or_else(|| anyhow::anyhow!("map 'NAT_FRONTENDS' not found"))?,
        )?;
        let backends = HashMap::try_from(
            ebpf.take_map("NAT_BACKENDS")
                .ok_or_else(|| anyhow::anyhow!("map 'NAT_BACKENDS' not found"))?,
        )?;
        let affinity = HashMap::try_from(
            ebpf.take_map("NAT_AFFINITY")
                .ok_or_else(|| anyhow::anyhow!("map 'NAT_AFFINITY' not found"))?,
        )?;
        info!("NAT maps acquired (NAT_FRONTENDS, NAT_BACKENDS, NAT_AFFINITY)");
        Ok(Self {
            frontends,
            backends,
            affinity,
        })
    }
}

impl NatMapPort for NatMapManager {
    fn replace_frontends(&mut self, entries: &[FrontendMapEntry]) -> Result<(), DomainError> {
        let stale: Vec<Key<FrontendKey>> =
            self.frontends.keys().filter_map(Result::ok).collect();
        for key in &stale {
            self.frontends
                .remove(key)
                .map_err(|e| map_err("NAT_FRONTENDS", e))?;
        }
        for entry in entries {
            let key = Key::new(entry.prefix_len, entry.key);
            self.frontends
                .insert(&key, entry.value, 0)
                .map_err(|e| map_err("NAT_FRONTENDS", e))?;
        }
        Ok(())
    }

    fn replace_backends(
        &mut self,
        entries: &[(BackendKey, BackendValue)],
    ) -> Result<(), DomainError> {
        let stale: Vec<BackendKey> = self.backends.keys().filter_map(Result::ok).collect();
        for key in &stale {
            self.backends
                .remove(key)
                .map_err(|e| map_err("NAT_BACKENDS", e))?;
        }
        for (key, value) in entries {
            self.backends
                .insert(key, value, 0)
                .map_err(|e| map_err("NAT_BACKENDS", e))?;
        }
        Ok(())
    }

    fn clear_affinity(&mut self) -> Result<u64, DomainError> {
        let keys: Vec<AffinityKey> = self.affinity.keys().filter_map(Result::ok).collect();
        let mut removed = 0u64;
        for key in &keys {
            if self.affinity.remove(key).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
