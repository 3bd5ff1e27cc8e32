// src/catalog/mod.rs
// =============================================================================
// Storage contract consumed by the IdentityResolver.
//
// The resolver never does file or database I/O itself; it reads and writes
// canonical records through this trait. A backend persists whatever it is
// handed and must not change duplicate/canonical flags on its own.
// =============================================================================

mod memory;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::StoreError;
use crate::record::CanonicalProperty;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get(&self, id: Uuid) -> StoreResult<Option<CanonicalProperty>>;

    /// Id of the row that owns the URL key `key` (its own or a merged one).
    async fn get_by_normalized_url(&self, key: &str) -> StoreResult<Option<Uuid>>;

    /// Rows sharing an exact address key.
    async fn find_by_address_key(&self, key: &str) -> StoreResult<Vec<CanonicalProperty>>;

    /// Rows whose address key falls in `locality` ("city|state").
    async fn list_in_locality(&self, locality: &str) -> StoreResult<Vec<CanonicalProperty>>;

    /// Insert or replace by id.
    async fn upsert_canonical(&self, record: &CanonicalProperty) -> StoreResult<()>;

    /// Retires every active row of `source` none of whose URL keys (primary
    /// or merged) is in `seen_urls`. Returns the number of rows deactivated.
    async fn mark_inactive(
        &self,
        source: &str,
        seen_urls: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<usize>;

    async fn all(&self) -> StoreResult<Vec<CanonicalProperty>>;
}

/// Locality part ("city|state") of an address key ("address|city|state").
pub fn locality_of(address_key: &str) -> Option<&str> {
    address_key.split_once('|').map(|(_, locality)| locality)
}
