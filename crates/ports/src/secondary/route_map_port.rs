use domain::common::error::DomainError;
use domain::routes::entity::RouteEntry;

/// Secondary port for the route trie (`ROUTES`).
pub trait RouteMapPort: Send + Sync {
    /// Replace the route table with the given entries.
    fn replace_routes(&mut self, routes: &[RouteEntry]) -> Result<(), DomainError>;
}
