use aya::Ebpf;
use aya::maps::{MapData, lpm_trie::{Key, LpmTrie}};
use domain::common::error::DomainError;
use domain::routes::entity::RouteEntry;
use ebpf_common::routes::RouteValue;
use ports::secondary::route_map_port::RouteMapPort;
use tracing::info;

/// Manages the route trie (`ROUTES`).
pub struct RouteMapManager {
    routes: LpmTrie<MapData, u32, RouteValue>,
}

impl RouteMapManager {
    pub fn new(ebpf: &mut Ebpf) -> Result<Self, anyhow::Error> {
        let routes = LpmTrie::try_from(
            ebpf.take_map("ROUTES")
                .ok_or_else(|| anyhow::anyhow!("map 'ROUTES' not found"))?,
        )?;
        info!("route map acquired (ROUTES)");
        Ok(Self { routes })
    }
}

impl RouteMapPort for RouteMapManager {
    fn replace_routes(&mut self, entries: &[RouteEntry]) -> Result<(), DomainError> {
        let stale: Vec<Key<u32>> = self.routes.keys().filter_map(Result::ok).collect();
        for key in &stale {
            self.routes
                .remove(key)
                .map_err(|e| DomainError::MapError(format!("ROUTES remove failed: {e}")))?;
        }
        for entry in entries {
            let (prefix_len, addr) = entry.key();
            let key = Key::new(prefix_len, addr);
            self.routes
                .insert(&key, entry.value(), 0)
                .map_err(|e| DomainError::MapError(format!("ROUTES insert failed: {e}")))?;
        }
        Ok(())
    }
}
