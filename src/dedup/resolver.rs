// src/dedup/resolver.rs
// =============================================================================
// IdentityResolver: one canonical record per real-world listing.
//
// For each incoming record, first hit wins:
//   1. URL key already known           -> merge into that canonical record
//   2. same address key (city/state)   -> merge
//   3. similar address, same locality  -> merge (fuzzy)
//   4. nothing                         -> new canonical record
//
// A merge mutates the canonical row in place and remembers the record's URL
// as one of its keys, so the listing is found by URL the next time round.
// Duplicate rows only appear through `consolidate`, which folds rows that
// already exist in the store.
//
// Locking:
// - Every resolution holds a per-key async lock on its URL key and on its
//   locality, taken in sorted order, so two sessions cannot both promote the
//   same listing
// - The matched canonical row is locked last; no other lock is taken while
//   it is held
// - `consolidate` excludes all resolutions while it rewrites the catalog
// =============================================================================

use chrono::Utc;
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock as AsyncRwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::normalize::{address_key, address_part};
use super::similarity::sequence_ratio;
use crate::catalog::{locality_of, CatalogStore};
use crate::config::DedupConfig;
use crate::error::{Result, StoreError};
use crate::record::{CanonicalProperty, MergePolicy, ObservationChanges, RawPropertyRecord};
use crate::urlnorm::url_identity_key;

// Idle key locks are dropped once the table grows past this
const LOCK_TABLE_PRUNE_AT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Url,
    Address,
    Fuzzy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Promoted to a new canonical record
    Created,
    /// No URL and no address: promoted, but can never be matched
    Unresolvable,
    Merged { by: MatchKind },
}

#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub canonical_id: Uuid,
    pub outcome: Outcome,
    pub value_changed: bool,
    pub reactivated: bool,
}

impl Resolution {
    fn new(canonical_id: Uuid, outcome: Outcome, changes: ObservationChanges) -> Self {
        Self {
            canonical_id,
            outcome,
            value_changed: changes.value_changed,
            reactivated: changes.reactivated,
        }
    }

    pub fn is_merge(&self) -> bool {
        matches!(self.outcome, Outcome::Merged { .. })
    }
}

/// Running totals since the resolver was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolutionStats {
    pub created: usize,
    pub merged_url: usize,
    pub merged_address: usize,
    pub merged_fuzzy: usize,
    pub unresolvable: usize,
    pub reactivated: usize,
    pub value_changes: usize,
}

impl ResolutionStats {
    fn record(&mut self, resolution: &Resolution) {
        match resolution.outcome {
            Outcome::Created => self.created += 1,
            Outcome::Unresolvable => self.unresolvable += 1,
            Outcome::Merged { by: MatchKind::Url } => self.merged_url += 1,
            Outcome::Merged { by: MatchKind::Address } => self.merged_address += 1,
            Outcome::Merged { by: MatchKind::Fuzzy } => self.merged_fuzzy += 1,
        }
        if resolution.reactivated {
            self.reactivated += 1;
        }
        if resolution.value_changed {
            self.value_changes += 1;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationReport {
    /// Groups of rows found to describe the same listing
    pub groups: usize,
    /// Rows newly flagged (or re-pointed) as duplicates
    pub duplicates_flagged: usize,
}

pub struct IdentityResolver {
    store: Arc<dyn CatalogStore>,
    config: DedupConfig,
    // URL key -> canonical id
    url_index: RwLock<HashMap<String, Uuid>>,
    locks: KeyLocks,
    batch: AsyncRwLock<()>,
    stats: Mutex<ResolutionStats>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn CatalogStore>, config: DedupConfig) -> Self {
        Self {
            store,
            config,
            url_index: RwLock::new(HashMap::new()),
            locks: KeyLocks::default(),
            batch: AsyncRwLock::new(()),
            stats: Mutex::new(ResolutionStats::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    pub fn stats(&self) -> ResolutionStats {
        lock(&self.stats).clone()
    }

    /// Merges `raw` into the catalog, or promotes it to a new record.
    ///
    /// Never fails because of missing fields; only the store can fail.
    pub async fn resolve(&self, raw: &RawPropertyRecord) -> Result<Resolution> {
        let _batch = self.batch.read().await;
        let resolution = self.resolve_locked(raw).await?;
        lock(&self.stats).record(&resolution);
        Ok(resolution)
    }

    async fn resolve_locked(&self, raw: &RawPropertyRecord) -> Result<Resolution> {
        let url_key = raw.url_key();
        let address_key = address_key(raw.address.as_deref(), raw.city.as_deref(), raw.state.as_deref());
        let now = Utc::now();

        if url_key.is_none() && address_key.is_none() {
            let record = CanonicalProperty::from_raw(raw, None, None, now);
            self.store.upsert_canonical(&record).await?;
            warn!(
                id = %record.id,
                source = raw.source.as_deref().unwrap_or("unknown"),
                title = raw.title.as_deref().unwrap_or(""),
                "record has no URL and no address, promoted as unresolvable"
            );
            return Ok(Resolution::new(record.id, Outcome::Unresolvable, ObservationChanges::default()));
        }

        let mut keys = Vec::new();
        if let Some(key) = &url_key {
            keys.push(format!("url:{}", key));
        }
        if let Some(locality) = address_key.as_deref().and_then(locality_of) {
            keys.push(format!("loc:{}", locality));
        }
        let _guards = self.locks.lock_all(keys).await;

        let Some((canonical_id, kind)) = self.find_match(url_key.as_deref(), address_key.as_deref()).await? else {
            let record = CanonicalProperty::from_raw(raw, url_key.clone(), address_key, now);
            self.store.upsert_canonical(&record).await?;
            if let Some(key) = url_key {
                self.index(key, record.id);
            }
            debug!(id = %record.id, url = raw.source_url.as_deref().unwrap_or(""), "new canonical record");
            return Ok(Resolution::new(record.id, Outcome::Created, ObservationChanges::default()));
        };

        let _row = self.locks.lock_all(vec![format!("row:{}", canonical_id)]).await;
        let mut canonical = self
            .store
            .get(canonical_id)
            .await?
            .ok_or(StoreError::NotFound(canonical_id))?;

        let policy = self.merge_policy(&canonical.source, raw.source.as_deref());
        let changes = canonical.apply_observation(raw, now, policy);
        if let Some(key) = &url_key {
            canonical.absorb_url(key);
        }
        if canonical.address_key.is_none() {
            canonical.address_key = address_key;
        }
        self.store.upsert_canonical(&canonical).await?;
        if let Some(key) = url_key {
            self.index(key, canonical.id);
        }

        if changes.reactivated {
            info!(id = %canonical.id, source = %canonical.source, "inactive listing seen again, reactivated");
        }
        if changes.value_changed {
            info!(
                id = %canonical.id,
                first = ?canonical.first_auction_value,
                previous_first = ?canonical.previous_first_auction_value,
                second = ?canonical.second_auction_value,
                previous_second = ?canonical.previous_second_auction_value,
                "auction value changed"
            );
        }
        debug!(id = %canonical.id, by = ?kind, policy = ?policy, "merged into canonical record");

        Ok(Resolution::new(canonical.id, Outcome::Merged { by: kind }, changes))
    }

    async fn find_match(
        &self,
        url_key: Option<&str>,
        address_key: Option<&str>,
    ) -> Result<Option<(Uuid, MatchKind)>> {
        if let Some(key) = url_key {
            if let Some(id) = self.lookup_url(key).await? {
                return Ok(Some((id, MatchKind::Url)));
            }
        }

        let Some(address_key) = address_key else {
            return Ok(None);
        };

        let exact = self.store.find_by_address_key(address_key).await?;
        if let Some(id) = self.pick_canonical(&exact).await? {
            return Ok(Some((id, MatchKind::Address)));
        }

        let Some(locality) = locality_of(address_key) else {
            return Ok(None);
        };
        let address = address_part(address_key);
        let scored: Vec<(f64, CanonicalProperty)> = self
            .store
            .list_in_locality(locality)
            .await?
            .into_iter()
            .filter_map(|row| {
                let score = sequence_ratio(address, address_part(row.address_key.as_deref()?));
                (score >= self.config.fuzzy_threshold).then_some((score, row))
            })
            .collect();

        let Some(best) = scored.iter().map(|(score, _)| *score).reduce(f64::max) else {
            return Ok(None);
        };
        let tied: Vec<CanonicalProperty> = scored
            .into_iter()
            .filter(|(score, _)| *score >= best)
            .map(|(_, row)| row)
            .collect();
        debug!(address = %address, locality = %locality, score = best, "fuzzy address match");

        Ok(self.pick_canonical(&tied).await?.map(|id| (id, MatchKind::Fuzzy)))
    }

    async fn lookup_url(&self, key: &str) -> Result<Option<Uuid>> {
        let cached = read(&self.url_index).get(key).copied();
        if cached.is_some() {
            return Ok(cached);
        }

        // Not indexed yet: the store may still know the URL
        let Some(row_id) = self.store.get_by_normalized_url(key).await? else {
            return Ok(None);
        };
        let Some(row) = self.store.get(row_id).await? else {
            return Ok(None);
        };
        let canonical_id = row.canonical_id();
        self.index(key.to_string(), canonical_id);
        Ok(Some(canonical_id))
    }

    // Canonical id to merge into when several rows match
    async fn pick_canonical(&self, rows: &[CanonicalProperty]) -> Result<Option<Uuid>> {
        let mut heads: Vec<CanonicalProperty> = Vec::new();
        for row in rows {
            let id = row.canonical_id();
            if heads.iter().any(|h| h.id == id) {
                continue;
            }
            if id == row.id {
                heads.push(row.clone());
            } else if let Some(head) = self.store.get(id).await? {
                heads.push(head);
            }
        }
        Ok(choose_canonical(&heads).map(|c| c.id))
    }

    fn merge_policy(&self, stored_source: &str, observed_source: Option<&str>) -> MergePolicy {
        let rank = |source: &str| {
            self.config
                .source_priority
                .iter()
                .position(|s| s.eq_ignore_ascii_case(source))
                .unwrap_or(usize::MAX)
        };
        if rank(stored_source) < rank(observed_source.unwrap_or("unknown")) {
            MergePolicy::FillOnly
        } else {
            MergePolicy::Overwrite
        }
    }

    fn index(&self, key: String, canonical_id: Uuid) {
        write(&self.url_index).insert(key, canonical_id);
    }

    /// Reloads the URL index from the store. Returns the number of keys.
    pub async fn rebuild_index(&self) -> Result<usize> {
        let mut rows = self.store.all().await?;
        // Canonical rows go last so their URLs win over duplicates'
        rows.sort_by_key(|r| !r.is_duplicate);

        let mut index = HashMap::new();
        for row in &rows {
            for key in row.url_keys() {
                index.insert(key.to_string(), row.canonical_id());
            }
        }
        let size = index.len();
        *write(&self.url_index) = index;

        info!(keys = size, records = rows.len(), "URL index rebuilt");
        Ok(size)
    }

    /// Retires listings of `source` that a complete run did not observe.
    ///
    /// `seen_urls` are raw source URLs; they are normalized here.
    pub async fn mark_inactive<I, U>(&self, source: &str, seen_urls: I) -> Result<usize>
    where
        I: IntoIterator<Item = U>,
        U: AsRef<str>,
    {
        let seen: HashSet<String> = seen_urls
            .into_iter()
            .filter_map(|u| url_identity_key(u.as_ref()))
            .collect();
        let retired = self.store.mark_inactive(source, &seen, Utc::now()).await?;
        info!(source = %source, seen = seen.len(), retired, "inactive listings marked");
        Ok(retired)
    }

    /// Folds rows already in the store that describe the same listing.
    ///
    /// Rows sharing a URL key or an address key, rows whose addresses are
    /// similar within the same locality, and existing duplicates with their
    /// originals form one group. The most complete row of each group (oldest
    /// on ties) becomes canonical; every other row points straight at it.
    pub async fn consolidate(&self) -> Result<ConsolidationReport> {
        let _batch = self.batch.write().await;
        let rows = self.store.all().await?;
        let mut sets = DisjointSets::new(rows.len());

        let position: HashMap<Uuid, usize> = rows.iter().enumerate().map(|(i, r)| (r.id, i)).collect();
        let mut by_url: HashMap<&str, usize> = HashMap::new();
        let mut by_address: HashMap<&str, usize> = HashMap::new();
        let mut by_locality: HashMap<&str, Vec<usize>> = HashMap::new();

        for (i, row) in rows.iter().enumerate() {
            for key in row.url_keys() {
                match by_url.entry(key) {
                    Entry::Occupied(e) => sets.union(*e.get(), i),
                    Entry::Vacant(e) => {
                        e.insert(i);
                    }
                }
            }
            if let Some(key) = row.address_key.as_deref() {
                match by_address.entry(key) {
                    Entry::Occupied(e) => sets.union(*e.get(), i),
                    Entry::Vacant(e) => {
                        e.insert(i);
                    }
                }
                if let Some(locality) = locality_of(key) {
                    by_locality.entry(locality).or_default().push(i);
                }
            }
            if let Some(&j) = row.original_id.filter(|_| row.is_duplicate).and_then(|id| position.get(&id)) {
                sets.union(i, j);
            }
        }

        for members in by_locality.values() {
            for (n, &a) in members.iter().enumerate() {
                for &b in &members[n + 1..] {
                    if sets.find(a) == sets.find(b) {
                        continue;
                    }
                    let (ka, kb) = match (rows[a].address_key.as_deref(), rows[b].address_key.as_deref()) {
                        (Some(ka), Some(kb)) => (address_part(ka), address_part(kb)),
                        _ => continue,
                    };
                    if sequence_ratio(ka, kb) >= self.config.fuzzy_threshold {
                        sets.union(a, b);
                    }
                }
            }
        }

        let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
        for i in 0..rows.len() {
            groups.entry(sets.find(i)).or_default().push(i);
        }

        let now = Utc::now();
        let mut report = ConsolidationReport::default();

        for members in groups.values().filter(|m| m.len() > 1) {
            let group: Vec<CanonicalProperty> = members.iter().map(|&i| rows[i].clone()).collect();
            let Some(winner) = choose_canonical(&group) else {
                continue;
            };
            report.groups += 1;

            let mut canonical = winner.clone();
            let mut changed = canonical.is_duplicate;
            canonical.is_duplicate = false;
            canonical.original_id = None;
            for row in group.iter().filter(|r| r.id != winner.id) {
                for key in row.url_keys() {
                    if !canonical.url_keys().any(|k| k == key) {
                        canonical.absorb_url(key);
                        changed = true;
                    }
                }
            }
            if changed {
                canonical.updated_at = now;
                self.store.upsert_canonical(&canonical).await?;
            }

            for row in group.iter().filter(|r| r.id != winner.id) {
                if row.is_duplicate && row.original_id == Some(winner.id) {
                    continue;
                }
                let mut duplicate = row.clone();
                duplicate.is_duplicate = true;
                duplicate.original_id = Some(winner.id);
                duplicate.updated_at = now;
                self.store.upsert_canonical(&duplicate).await?;
                report.duplicates_flagged += 1;
            }
        }

        self.rebuild_index().await?;
        info!(
            groups = report.groups,
            duplicates = report.duplicates_flagged,
            "catalog consolidated"
        );
        Ok(report)
    }
}

/// Highest completeness score, then oldest `created_at`.
pub fn choose_canonical(rows: &[CanonicalProperty]) -> Option<&CanonicalProperty> {
    rows.iter().min_by(|a, b| {
        b.completeness_score()
            .cmp(&a.completeness_score())
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    })
}

#[derive(Default)]
struct KeyLocks {
    table: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    fn handle(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut table = lock(&self.table);
        if table.len() > LOCK_TABLE_PRUNE_AT {
            table.retain(|_, l| Arc::strong_count(l) > 1);
        }
        table.entry(key.to_string()).or_default().clone()
    }

    async fn lock_all(&self, mut keys: Vec<String>) -> Vec<OwnedMutexGuard<()>> {
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.handle(&key).lock_owned().await);
        }
        guards
    }
}

struct DisjointSets {
    parent: Vec<usize>,
}

impl DisjointSets {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryStore;

    fn resolver() -> (IdentityResolver, Arc<InMemoryStore>) {
        resolver_with(DedupConfig::default())
    }

    fn resolver_with(config: DedupConfig) -> (IdentityResolver, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (IdentityResolver::new(store.clone(), config), store)
    }

    fn listing(url: Option<&str>, address: Option<&str>, city: &str, state: &str) -> RawPropertyRecord {
        RawPropertyRecord {
            source_url: url.map(str::to_string),
            address: address.map(str::to_string),
            city: Some(city.to_string()),
            state: Some(state.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_url_case_slash_and_utm_invariance() {
        let (resolver, store) = resolver();

        let first = resolver
            .resolve(&listing(Some("https://x.com/a?utm_source=fb"), None, "SP", "SP"))
            .await
            .unwrap();
        let second = resolver
            .resolve(&listing(Some("https://X.com/a/"), None, "SP", "SP"))
            .await
            .unwrap();

        assert_eq!(first.outcome, Outcome::Created);
        assert_eq!(second.outcome, Outcome::Merged { by: MatchKind::Url });
        assert_eq!(first.canonical_id, second.canonical_id);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_abbreviated_address_merges_only_within_locality() {
        let (resolver, store) = resolver();

        let a = resolver
            .resolve(&listing(Some("https://a.com/1"), Some("Rua das Flores, 123"), "Campinas", "SP"))
            .await
            .unwrap();
        let b = resolver
            .resolve(&listing(Some("https://b.com/77"), Some("R das Flores 123"), "Campinas", "SP"))
            .await
            .unwrap();
        let elsewhere = resolver
            .resolve(&listing(Some("https://c.com/5"), Some("Rua das Flores, 123"), "Santos", "SP"))
            .await
            .unwrap();

        assert!(b.is_merge());
        assert_eq!(a.canonical_id, b.canonical_id);
        assert_eq!(elsewhere.outcome, Outcome::Created);
        assert_ne!(elsewhere.canonical_id, a.canonical_id);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_fuzzy_address_match() {
        let (resolver, _store) = resolver();

        let a = resolver
            .resolve(&listing(Some("https://a.com/1"), Some("Rua Doutor Arnaldo, 455"), "São Paulo", "SP"))
            .await
            .unwrap();
        let b = resolver
            .resolve(&listing(Some("https://b.com/1"), Some("R. Dr. Arnaldo 455"), "Sao Paulo", "sp"))
            .await
            .unwrap();
        let other = resolver
            .resolve(&listing(Some("https://b.com/2"), Some("Rua Oscar Freire, 10"), "São Paulo", "SP"))
            .await
            .unwrap();

        assert_eq!(b.outcome, Outcome::Merged { by: MatchKind::Fuzzy });
        assert_eq!(a.canonical_id, b.canonical_id);
        assert_eq!(other.outcome, Outcome::Created);
    }

    #[tokio::test]
    async fn test_price_change_through_merged_url() {
        let (resolver, store) = resolver();
        let mut a = listing(Some("https://a.com/1"), Some("Rua A, 1"), "Santos", "SP");
        a.first_auction_value = Some(100000.0);
        let mut b = listing(Some("https://b.com/9"), Some("Rua A, 1"), "Santos", "SP");
        b.first_auction_value = Some(100000.0);

        let created = resolver.resolve(&a).await.unwrap();
        let merged = resolver.resolve(&b).await.unwrap();
        assert!(!merged.value_changed);

        b.first_auction_value = Some(90000.0);
        let again = resolver.resolve(&b).await.unwrap();

        assert_eq!(again.outcome, Outcome::Merged { by: MatchKind::Url });
        assert!(again.value_changed);
        assert_eq!(again.canonical_id, created.canonical_id);

        let stored = store.get(created.canonical_id).await.unwrap().unwrap();
        assert_eq!(stored.id, created.canonical_id);
        assert_eq!(stored.first_auction_value, Some(90000.0));
        assert_eq!(stored.previous_first_auction_value, Some(100000.0));
        assert!(stored.value_changed_at.is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_three_records_resolve_to_one_canonical_in_any_order() {
        let records = [
            listing(Some("http://s.com/1"), Some("Rua A, 1"), "SP", "SP"),
            listing(Some("http://s.com/1/"), Some("Rua A, 1"), "SP", "SP"),
            listing(Some("http://s.com/2"), Some("Rua A, 1 "), "sp", "sp"),
        ];
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

        for order in orders {
            let (resolver, store) = resolver();
            let mut resolutions = Vec::new();
            for i in order {
                resolutions.push(resolver.resolve(&records[i]).await.unwrap());
            }

            let canonical = resolutions[0].canonical_id;
            assert!(resolutions.iter().all(|r| r.canonical_id == canonical), "order {:?}", order);
            assert_eq!(resolutions.iter().filter(|r| r.is_merge()).count(), 2, "order {:?}", order);

            let rows = store.all().await.unwrap();
            assert_eq!(rows.iter().filter(|r| !r.is_duplicate).count(), 1, "order {:?}", order);
            assert_eq!(rows.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_record_without_identity_is_promoted() {
        let (resolver, store) = resolver();
        let raw = RawPropertyRecord {
            title: Some("Terreno 300m²".into()),
            ..Default::default()
        };

        let first = resolver.resolve(&raw).await.unwrap();
        let second = resolver.resolve(&raw).await.unwrap();

        assert_eq!(first.outcome, Outcome::Unresolvable);
        assert_ne!(first.canonical_id, second.canonical_id);
        assert_eq!(store.len(), 2);
        assert_eq!(resolver.stats().unresolvable, 2);
    }

    #[tokio::test]
    async fn test_inactive_listing_is_reactivated() {
        let (resolver, store) = resolver();
        let mut raw = listing(Some("https://zuk.com.br/lote/1"), None, "Santos", "SP");
        raw.source = Some("zuk".into());
        let keep = RawPropertyRecord {
            source: Some("zuk".into()),
            source_url: Some("https://zuk.com.br/lote/2".into()),
            ..Default::default()
        };

        let created = resolver.resolve(&raw).await.unwrap();
        resolver.resolve(&keep).await.unwrap();

        let retired = resolver
            .mark_inactive("zuk", ["https://ZUK.com.br/lote/2/?utm_medium=email"])
            .await
            .unwrap();
        assert_eq!(retired, 1);
        assert!(!store.get(created.canonical_id).await.unwrap().unwrap().is_active);

        let again = resolver.resolve(&raw).await.unwrap();
        assert!(again.reactivated);
        let row = store.get(created.canonical_id).await.unwrap().unwrap();
        assert!(row.is_active);
        assert_eq!(row.deactivated_at, None);
        assert_eq!(resolver.stats().reactivated, 1);
    }

    #[tokio::test]
    async fn test_lower_priority_source_does_not_overwrite() {
        let config = DedupConfig {
            source_priority: vec!["caixa".into()],
            ..Default::default()
        };
        let (resolver, store) = resolver_with(config);

        let mut official = listing(Some("https://caixa.gov.br/imovel/1"), Some("Rua B, 20"), "Recife", "PE");
        official.source = Some("caixa".into());
        official.first_auction_value = Some(200000.0);
        let mut aggregator = listing(Some("https://agregador.com/x"), Some("Rua B, 20"), "Recife", "PE");
        aggregator.source = Some("agregador".into());
        aggregator.first_auction_value = Some(150000.0);
        aggregator.image_url = Some("https://agregador.com/x.jpg".into());

        let created = resolver.resolve(&official).await.unwrap();
        resolver.resolve(&aggregator).await.unwrap();

        let row = store.get(created.canonical_id).await.unwrap().unwrap();
        assert_eq!(row.first_auction_value, Some(200000.0));
        assert_eq!(row.image_url.as_deref(), Some("https://agregador.com/x.jpg"));

        official.first_auction_value = Some(180000.0);
        let update = resolver.resolve(&official).await.unwrap();
        assert!(update.value_changed);
    }

    #[tokio::test]
    async fn test_rebuild_index_from_existing_store() {
        let store = Arc::new(InMemoryStore::new());
        let first = IdentityResolver::new(store.clone(), DedupConfig::default());
        let created = first
            .resolve(&listing(Some("https://a.com/1"), Some("Rua C, 3"), "Natal", "RN"))
            .await
            .unwrap();
        first
            .resolve(&listing(Some("https://b.com/1"), Some("Rua C, 3"), "Natal", "RN"))
            .await
            .unwrap();

        let restarted = IdentityResolver::new(store.clone(), DedupConfig::default());
        assert_eq!(restarted.rebuild_index().await.unwrap(), 2);

        let again = restarted
            .resolve(&listing(Some("https://b.com/1"), None, "Natal", "RN"))
            .await
            .unwrap();
        assert_eq!(again.outcome, Outcome::Merged { by: MatchKind::Url });
        assert_eq!(again.canonical_id, created.canonical_id);
    }

    #[tokio::test]
    async fn test_consolidate_picks_most_complete_and_avoids_chains() {
        let store = Arc::new(InMemoryStore::new());
        let t0 = Utc::now();

        let bare = RawPropertyRecord {
            source_url: Some("https://a.com/1".into()),
            ..Default::default()
        };
        let rich = RawPropertyRecord {
            source_url: Some("https://b.com/1".into()),
            area_total: Some(70.0),
            image_url: Some("https://b.com/1.jpg".into()),
            ..Default::default()
        };
        let key = Some("r d 4|olinda|pe".to_string());

        let oldest = CanonicalProperty::from_raw(&bare, Some("https://a.com/1".into()), key.clone(), t0);
        let best = CanonicalProperty::from_raw(&rich, Some("https://b.com/1".into()), key.clone(), t0 + chrono::Duration::hours(1));
        // Already a duplicate of `oldest`, which is about to lose
        let mut chained = CanonicalProperty::from_raw(&bare, Some("https://c.com/1".into()), None, t0);
        chained.is_duplicate = true;
        chained.original_id = Some(oldest.id);
        let unrelated = CanonicalProperty::from_raw(&bare, Some("https://d.com/1".into()), Some("r z 9|olinda|pe".into()), t0);

        for row in [&oldest, &best, &chained, &unrelated] {
            store.upsert_canonical(row).await.unwrap();
        }

        let resolver = IdentityResolver::new(store.clone(), DedupConfig::default());
        let report = resolver.consolidate().await.unwrap();

        assert_eq!(report.groups, 1);
        assert_eq!(report.duplicates_flagged, 2);

        let rows = store.all().await.unwrap();
        let canonicals: Vec<_> = rows.iter().filter(|r| !r.is_duplicate).collect();
        assert_eq!(canonicals.len(), 2);
        for row in rows.iter().filter(|r| r.is_duplicate) {
            assert_eq!(row.original_id, Some(best.id));
            let target = store.get(best.id).await.unwrap().unwrap();
            assert!(!target.is_duplicate);
        }

        let seen_again = resolver
            .resolve(&RawPropertyRecord {
                source_url: Some("https://c.com/1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(seen_again.canonical_id, best.id);
    }

    #[test]
    fn test_choose_canonical_breaks_ties_by_age() {
        let t0 = Utc::now();
        let raw = RawPropertyRecord::default();
        let newer = CanonicalProperty::from_raw(&raw, None, None, t0 + chrono::Duration::minutes(1));
        let older = CanonicalProperty::from_raw(&raw, None, None, t0);

        let rows = vec![newer, older.clone()];
        assert_eq!(choose_canonical(&rows).map(|r| r.id), Some(older.id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sessions_do_not_double_promote() {
        let (resolver, store) = resolver();
        let resolver = Arc::new(resolver);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let resolver = resolver.clone();
                tokio::spawn(async move {
                    let url = if i % 2 == 0 { "https://s.com/lote/1" } else { "https://S.com/lote/1/" };
                    resolver
                        .resolve(&listing(Some(url), Some("Av. Brasil, 500"), "Rio de Janeiro", "RJ"))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().canonical_id);
        }

        assert_eq!(ids.len(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(resolver.stats().created, 1);
    }
}
