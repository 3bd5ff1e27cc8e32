//! In-memory catalog backend for the CLI and tests. Data is lost on exit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use super::{locality_of, CatalogStore, StoreResult};
use crate::error::StoreError;
use crate::record::CanonicalProperty;

#[derive(Default)]
struct Tables {
    records: HashMap<Uuid, CanonicalProperty>,
    by_url: HashMap<String, Uuid>,
}

impl Tables {
    fn put(&mut self, record: CanonicalProperty) {
        if let Some(previous) = self.records.get(&record.id) {
            for old in previous.url_keys() {
                if !record.url_keys().any(|k| k == old) && self.by_url.get(old) == Some(&record.id) {
                    self.by_url.remove(old);
                }
            }
        }
        for key in record.url_keys() {
            // Canonical rows own their URLs; duplicates only claim free ones
            if record.is_duplicate {
                self.by_url.entry(key.to_string()).or_insert(record.id);
            } else {
                self.by_url.insert(key.to_string(), record.id);
            }
        }
        self.records.insert(record.id, record);
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-loaded with a catalog snapshot.
    pub fn from_records(records: impl IntoIterator<Item = CanonicalProperty>) -> Self {
        let mut tables = Tables::default();
        // Duplicates first so canonical rows end up owning shared URLs
        let mut records: Vec<_> = records.into_iter().collect();
        records.sort_by_key(|r| !r.is_duplicate);
        for record in records {
            tables.put(record);
        }
        Self {
            tables: RwLock::new(tables),
        }
    }

    pub fn len(&self) -> usize {
        self.read().map_or(0, |t| t.records.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| StoreError::Backend("catalog lock poisoned".into()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| StoreError::Backend("catalog lock poisoned".into()))
    }
}

#[async_trait]
impl CatalogStore for InMemoryStore {
    async fn get(&self, id: Uuid) -> StoreResult<Option<CanonicalProperty>> {
        Ok(self.read()?.records.get(&id).cloned())
    }

    async fn get_by_normalized_url(&self, key: &str) -> StoreResult<Option<Uuid>> {
        Ok(self.read()?.by_url.get(key).copied())
    }

    async fn find_by_address_key(&self, key: &str) -> StoreResult<Vec<CanonicalProperty>> {
        Ok(self
            .read()?
            .records
            .values()
            .filter(|r| r.address_key.as_deref() == Some(key))
            .cloned()
            .collect())
    }

    async fn list_in_locality(&self, locality: &str) -> StoreResult<Vec<CanonicalProperty>> {
        Ok(self
            .read()?
            .records
            .values()
            .filter(|r| r.address_key.as_deref().and_then(locality_of) == Some(locality))
            .cloned()
            .collect())
    }

    async fn upsert_canonical(&self, record: &CanonicalProperty) -> StoreResult<()> {
        self.write()?.put(record.clone());
        Ok(())
    }

    async fn mark_inactive(
        &self,
        source: &str,
        seen_urls: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let mut tables = self.write()?;
        let mut retired = 0;
        for record in tables.records.values_mut() {
            // Any URL the row answers to counts; rows without one are never retired
            let unseen = {
                let mut keys = record.url_keys().peekable();
                keys.peek().is_some() && !keys.any(|url| seen_urls.contains(url))
            };
            if record.is_active && record.source == source && unseen {
                record.deactivate(now);
                retired += 1;
            }
        }
        Ok(retired)
    }

    async fn all(&self) -> StoreResult<Vec<CanonicalProperty>> {
        let mut records: Vec<_> = self.read()?.records.values().cloned().collect();
        records.sort_by_key(|r| (r.created_at, r.id));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RawPropertyRecord;

    fn property(source: &str, url: &str, address_key: &str) -> CanonicalProperty {
        let raw = RawPropertyRecord {
            source: Some(source.into()),
            source_url: Some(url.into()),
            ..Default::default()
        };
        CanonicalProperty::from_raw(&raw, Some(url.into()), Some(address_key.into()), Utc::now())
    }

    #[tokio::test]
    async fn test_upsert_indexes_url() {
        let store = InMemoryStore::new();
        let record = property("caixa", "https://caixa.gov.br/1", "r a 1|sao paulo|sp");
        store.upsert_canonical(&record).await.unwrap();

        assert_eq!(store.get_by_normalized_url("https://caixa.gov.br/1").await.unwrap(), Some(record.id));
        assert_eq!(store.get_by_normalized_url("https://caixa.gov.br/2").await.unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_from_records_restores_url_owners() {
        let canonical = property("a", "https://a/1", "r a 1|c|s");
        let mut duplicate = property("b", "https://a/1", "r a 1|c|s");
        duplicate.is_duplicate = true;
        duplicate.original_id = Some(canonical.id);

        let store = InMemoryStore::from_records(vec![canonical.clone(), duplicate]);

        assert_eq!(store.len(), 2);
        assert_eq!(store.get_by_normalized_url("https://a/1").await.unwrap(), Some(canonical.id));
    }

    #[tokio::test]
    async fn test_locality_and_address_lookups() {
        let store = InMemoryStore::new();
        store.upsert_canonical(&property("a", "https://a/1", "r a 1|sao paulo|sp")).await.unwrap();
        store.upsert_canonical(&property("a", "https://a/2", "r b 2|sao paulo|sp")).await.unwrap();
        store.upsert_canonical(&property("a", "https://a/3", "r a 1|santos|sp")).await.unwrap();

        assert_eq!(store.list_in_locality("sao paulo|sp").await.unwrap().len(), 2);
        assert_eq!(store.find_by_address_key("r a 1|santos|sp").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_inactive_only_touches_unseen_rows_of_source() {
        let store = InMemoryStore::new();
        let kept = property("zuk", "https://zuk/1", "x|c|s");
        let gone = property("zuk", "https://zuk/2", "y|c|s");
        let other = property("mega", "https://mega/9", "z|c|s");
        for r in [&kept, &gone, &other] {
            store.upsert_canonical(r).await.unwrap();
        }

        let seen: HashSet<String> = ["https://zuk/1".to_string()].into_iter().collect();
        let retired = store.mark_inactive("zuk", &seen, Utc::now()).await.unwrap();

        assert_eq!(retired, 1);
        assert!(store.get(kept.id).await.unwrap().unwrap().is_active);
        let gone = store.get(gone.id).await.unwrap().unwrap();
        assert!(!gone.is_active);
        assert!(gone.deactivated_at.is_some());
        assert!(store.get(other.id).await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_mark_inactive_accepts_a_seen_alias_url() {
        let store = InMemoryStore::new();
        let mut listing = property("zuk", "https://zuk/1", "x|c|s");
        listing.absorb_url("https://zuk/lote-1");
        store.upsert_canonical(&listing).await.unwrap();

        let seen: HashSet<String> = ["https://zuk/lote-1".to_string()].into_iter().collect();
        let retired = store.mark_inactive("zuk", &seen, Utc::now()).await.unwrap();

        assert_eq!(retired, 0);
        assert!(store.get(listing.id).await.unwrap().unwrap().is_active);
    }
}
