//! Incremental build cache.
//!
//! One [`BuildCacheEntry`] per (item, platform) records the hashes of every
//! input that produced the last successful artifact. A lookup recomputes the
//! current hashes and trusts the entry only when all of them still match.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    fmt,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::{CookError, Result},
    types::{ContentHash, InputHasher, ItemId, Platform},
};

use super::leaf::ContentProvider;

/// Last successful build of one item for one platform.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildCacheEntry {
    pub item: ItemId,
    pub platform: Platform,
    pub version: Uuid,
    pub own_hash: ContentHash,
    /// Transitive build dependencies and the hash each had at build time.
    pub build_deps: Vec<(ItemId, ContentHash)>,
    /// Hash over every field above.
    pub combined: ContentHash,
    /// Runtime references reported by the save, replayed on a cache hit.
    #[serde(default)]
    pub imports: Vec<ItemId>,
    #[serde(default)]
    pub soft_refs: Vec<ItemId>,
    #[serde(default)]
    pub generated: Vec<ItemId>,
}

impl BuildCacheEntry {
    fn combine(
        version: &Uuid,
        item: &ItemId,
        platform: &Platform,
        own_hash: &ContentHash,
        build_deps: &[(ItemId, ContentHash)],
    ) -> ContentHash {
        let mut hasher = InputHasher::new();
        hasher
            .field(version.as_bytes())
            .field(item.as_str().as_bytes())
            .field(platform.as_str().as_bytes())
            .field(own_hash.as_bytes());
        for (dep, hash) in build_deps {
            hasher.field(dep.as_str().as_bytes()).field(hash.as_bytes());
        }
        hasher.finish()
    }

    fn recompute(&self) -> ContentHash {
        Self::combine(
            &self.version,
            &self.item,
            &self.platform,
            &self.own_hash,
            &self.build_deps,
        )
    }
}

/// Storage backend for cache entries. Mutated only by the scheduler thread.
pub trait BuildCacheStore: Send {
    fn get(&self, item: &ItemId, platform: &Platform) -> Result<Option<BuildCacheEntry>>;
    fn put(&mut self, entry: &BuildCacheEntry) -> Result<()>;
    fn remove(&mut self, item: &ItemId, platform: &Platform) -> Result<()>;
}

/// Session-local store, used by workers and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryCacheStore {
    entries: HashMap<(ItemId, Platform), BuildCacheEntry>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl BuildCacheStore for MemoryCacheStore {
    fn get(&self, item: &ItemId, platform: &Platform) -> Result<Option<BuildCacheEntry>> {
        Ok(self.entries.get(&(item.clone(), platform.clone())).cloned())
    }

    fn put(&mut self, entry: &BuildCacheEntry) -> Result<()> {
        self.entries
            .insert((entry.item.clone(), entry.platform.clone()), entry.clone());
        Ok(())
    }

    fn remove(&mut self, item: &ItemId, platform: &Platform) -> Result<()> {
        self.entries.remove(&(item.clone(), platform.clone()));
        Ok(())
    }
}

/// Why a lookup did not produce a hit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MissReason {
    Disabled,
    NoEntry,
    VersionChanged,
    OwnHashChanged,
    BuildDependencyChanged(ItemId),
    HashUnavailable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(BuildCacheEntry),
    Miss(MissReason),
}

/// What a successful save contributes to the cache.
#[derive(Clone, Debug, Default)]
pub struct CacheRecord<'a> {
    pub own_hash: Option<ContentHash>,
    pub build_deps: &'a [ItemId],
    pub imports: &'a [ItemId],
    pub soft_refs: &'a [ItemId],
    pub generated: &'a [ItemId],
}

/// Lookup and record policy over a [`BuildCacheStore`].
pub struct BuildCache {
    store: Box<dyn BuildCacheStore>,
    version: Uuid,
    enabled: bool,
    /// Entries written this session, keyed by each build dependency they list.
    dependents: HashMap<(ItemId, Platform), BTreeSet<ItemId>>,
}

impl fmt::Debug for BuildCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildCache")
            .field("version", &self.version)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl BuildCache {
    pub fn new(store: Box<dyn BuildCacheStore>, version: Uuid, enabled: bool) -> Self {
        Self {
            store,
            version,
            enabled,
            dependents: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Checks whether (id, platform) can skip load and save.
    ///
    /// Any mismatch discards the entry. An entry whose recorded fields do not
    /// reproduce its own combined hash is corrupt and fails the session.
    pub fn lookup(
        &mut self,
        id: &ItemId,
        platform: &Platform,
        provider: &dyn ContentProvider,
    ) -> Result<CacheLookup> {
        if !self.enabled {
            return Ok(CacheLookup::Miss(MissReason::Disabled));
        }
        let Some(entry) = self.store.get(id, platform)? else {
            return Ok(CacheLookup::Miss(MissReason::NoEntry));
        };
        if entry.item != *id || entry.platform != *platform || entry.recompute() != entry.combined {
            return Err(CookError::Cache(format!(
                "entry for {id} on {platform} does not match its recorded hash"
            )));
        }

        let miss = self.verify(&entry, provider);
        match miss {
            None => {
                debug!(target: "cook::cache", item = %id, %platform, "cache hit");
                Ok(CacheLookup::Hit(entry))
            }
            Some(reason) => {
                debug!(target: "cook::cache", item = %id, %platform, ?reason, "cache entry discarded");
                self.store.remove(id, platform)?;
                Ok(CacheLookup::Miss(reason))
            }
        }
    }

    fn verify(&self, entry: &BuildCacheEntry, provider: &dyn ContentProvider) -> Option<MissReason> {
        if entry.version != self.version {
            return Some(MissReason::VersionChanged);
        }
        match provider.hash(&entry.item) {
            Ok(current) if current == entry.own_hash => {}
            Ok(_) => return Some(MissReason::OwnHashChanged),
            Err(_) => return Some(MissReason::HashUnavailable),
        }
        for (dep, recorded) in &entry.build_deps {
            match provider.hash(dep) {
                Ok(current) if current == *recorded => {}
                _ => return Some(MissReason::BuildDependencyChanged(dep.clone())),
            }
        }
        None
    }

    /// Writes a fresh entry after a successful save.
    ///
    /// Build dependencies are expanded transitively through their own cache
    /// entries for the same platform. A dependency saved later in the session
    /// widens the closure of every entry that already lists it. Nothing is
    /// written if any input cannot be hashed.
    pub fn record(
        &mut self,
        id: &ItemId,
        platform: &Platform,
        record: CacheRecord<'_>,
        provider: &dyn ContentProvider,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let own_hash = match record.own_hash {
            Some(hash) => hash,
            None => match provider.hash(id) {
                Ok(hash) => hash,
                Err(err) => {
                    warn!(target: "cook::cache", item = %id, %platform, error = %err, "not caching: item hash unavailable");
                    return Ok(());
                }
            },
        };

        let direct = record.build_deps.iter().map(|dep| (dep.clone(), None));
        let Some(build_deps) = self.closure(id, platform, direct, provider)? else {
            return Ok(());
        };
        let entry = BuildCacheEntry {
            combined: BuildCacheEntry::combine(&self.version, id, platform, &own_hash, &build_deps),
            item: id.clone(),
            platform: platform.clone(),
            version: self.version,
            own_hash,
            build_deps,
            imports: record.imports.to_vec(),
            soft_refs: record.soft_refs.to_vec(),
            generated: record.generated.to_vec(),
        };
        self.store.put(&entry)?;
        self.note_dependents(id, platform, &entry.build_deps);
        debug!(target: "cook::cache", item = %id, %platform, deps = entry.build_deps.len(), "cache entry written");
        self.widen_dependents(id, platform, provider)
    }

    /// Expands `direct` through the recorded entries of each dependency.
    /// Nested dependencies keep the hash their parent was built against.
    fn closure(
        &self,
        id: &ItemId,
        platform: &Platform,
        direct: impl IntoIterator<Item = (ItemId, Option<ContentHash>)>,
        provider: &dyn ContentProvider,
    ) -> Result<Option<Vec<(ItemId, ContentHash)>>> {
        let mut seen: BTreeSet<ItemId> = BTreeSet::new();
        let mut pending: VecDeque<(ItemId, Option<ContentHash>)> = direct.into_iter().collect();
        let mut build_deps = Vec::new();
        while let Some((dep, known)) = pending.pop_front() {
            if dep == *id || !seen.insert(dep.clone()) {
                continue;
            }
            let hash = match known {
                Some(hash) => hash,
                None => match provider.hash(&dep) {
                    Ok(hash) => hash,
                    Err(err) => {
                        warn!(target: "cook::cache", item = %id, dependency = %dep, error = %err, "not caching: build dependency hash unavailable");
                        return Ok(None);
                    }
                },
            };
            build_deps.push((dep.clone(), hash));
            if let Some(nested) = self.store.get(&dep, platform)? {
                pending.extend(
                    nested
                        .build_deps
                        .into_iter()
                        .map(|(nested_dep, hash)| (nested_dep, Some(hash))),
                );
            }
        }
        build_deps.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Some(build_deps))
    }

    fn note_dependents(&mut self, id: &ItemId, platform: &Platform, build_deps: &[(ItemId, ContentHash)]) {
        for (dep, _) in build_deps {
            self.dependents
                .entry((dep.clone(), platform.clone()))
                .or_default()
                .insert(id.clone());
        }
    }

    fn dependents_of(&self, id: &ItemId, platform: &Platform) -> Vec<ItemId> {
        self.dependents
            .get(&(id.clone(), platform.clone()))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rewrites the entries that list `id` as a build dependency so they
    /// also cover whatever `id` was just built against.
    fn widen_dependents(&mut self, id: &ItemId, platform: &Platform, provider: &dyn ContentProvider) -> Result<()> {
        let mut pending: VecDeque<ItemId> = self.dependents_of(id, platform).into();
        let mut visited: BTreeSet<ItemId> = BTreeSet::new();
        while let Some(dependent) = pending.pop_front() {
            if !visited.insert(dependent.clone()) {
                continue;
            }
            let Some(mut entry) = self.store.get(&dependent, platform)? else {
                continue;
            };
            let known: Vec<_> = entry
                .build_deps
                .iter()
                .map(|(dep, hash)| (dep.clone(), Some(*hash)))
                .collect();
            let Some(build_deps) = self.closure(&dependent, platform, known, provider)? else {
                self.store.remove(&dependent, platform)?;
                continue;
            };
            if build_deps == entry.build_deps {
                continue;
            }
            entry.build_deps = build_deps;
            entry.combined = entry.recompute();
            self.store.put(&entry)?;
            self.note_dependents(&dependent, platform, &entry.build_deps);
            debug!(target: "cook::cache", item = %dependent, %platform, via = %id, deps = entry.build_deps.len(), "cache entry widened");
            pending.extend(self.dependents_of(&dependent, platform));
        }
        Ok(())
    }

    pub fn invalidate(&mut self, id: &ItemId, platform: &Platform) -> Result<()> {
        self.store.remove(id, platform)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use super::*;
    use crate::cook::leaf::{ContentHandle, LeafError, SaveOutput};

    #[derive(Default)]
    struct Hashes(Mutex<HashMap<String, &'static str>>);

    impl Hashes {
        fn set(&self, id: &str, content: &'static str) {
            self.0.lock().unwrap().insert(id.to_string(), content);
        }
    }

    impl ContentProvider for Hashes {
        fn load(&self, _id: &ItemId) -> std::result::Result<ContentHandle, LeafError> {
            unreachable!()
        }

        fn save(
            &self,
            _id: &ItemId,
            _platform: &Platform,
            _content: &ContentHandle,
        ) -> std::result::Result<SaveOutput, LeafError> {
            unreachable!()
        }

        fn dependencies(&self, _id: &ItemId) -> Vec<ItemId> {
            Vec::new()
        }

        fn hash(&self, id: &ItemId) -> std::result::Result<ContentHash, LeafError> {
            self.0
                .lock()
                .unwrap()
                .get(id.as_str())
                .map(|c| ContentHash::of(c.as_bytes()))
                .ok_or_else(|| LeafError::Content(format!("missing {id}")))
        }
    }

    fn cache() -> BuildCache {
        BuildCache::new(Box::new(MemoryCacheStore::new()), Uuid::from_u128(1), true)
    }

    fn record(cache: &mut BuildCache, provider: &Hashes, id: &str, build: &[ItemId]) {
        cache
            .record(
                &ItemId::new(id),
                &Platform::new("linux"),
                CacheRecord {
                    build_deps: build,
                    ..CacheRecord::default()
                },
                provider,
            )
            .unwrap();
    }

    #[test]
    fn unchanged_inputs_hit() {
        let provider = Hashes::default();
        provider.set("a", "one");
        provider.set("dep", "two");
        let mut cache = cache();
        record(&mut cache, &provider, "a", &[ItemId::new("dep")]);
        let lookup = cache
            .lookup(&ItemId::new("a"), &Platform::new("linux"), &provider)
            .unwrap();
        assert!(matches!(lookup, CacheLookup::Hit(_)));
    }

    #[test]
    fn changed_build_dependency_discards_entry() {
        let provider = Hashes::default();
        provider.set("a", "one");
        provider.set("dep", "two");
        let mut cache = cache();
        record(&mut cache, &provider, "a", &[ItemId::new("dep")]);
        provider.set("dep", "changed");
        let linux = Platform::new("linux");
        let lookup = cache.lookup(&ItemId::new("a"), &linux, &provider).unwrap();
        assert_eq!(
            lookup,
            CacheLookup::Miss(MissReason::BuildDependencyChanged(ItemId::new("dep")))
        );
        provider.set("dep", "two");
        let lookup = cache.lookup(&ItemId::new("a"), &linux, &provider).unwrap();
        assert_eq!(lookup, CacheLookup::Miss(MissReason::NoEntry));
    }

    #[test]
    fn build_dependencies_are_transitive() {
        let provider = Hashes::default();
        provider.set("a", "one");
        provider.set("b", "two");
        provider.set("c", "three");
        let mut cache = cache();
        record(&mut cache, &provider, "b", &[ItemId::new("c")]);
        record(&mut cache, &provider, "a", &[ItemId::new("b")]);
        provider.set("c", "changed");
        let lookup = cache
            .lookup(&ItemId::new("a"), &Platform::new("linux"), &provider)
            .unwrap();
        assert_eq!(
            lookup,
            CacheLookup::Miss(MissReason::BuildDependencyChanged(ItemId::new("c")))
        );
    }

    #[test]
    fn dependency_saved_after_its_dependent_widens_the_entry() {
        let provider = Hashes::default();
        provider.set("a", "one");
        provider.set("b", "two");
        provider.set("c", "three");
        provider.set("d", "four");
        let mut cache = cache();
        let linux = Platform::new("linux");
        record(&mut cache, &provider, "a", &[ItemId::new("b")]);
        record(&mut cache, &provider, "b", &[ItemId::new("c")]);
        record(&mut cache, &provider, "c", &[ItemId::new("d")]);

        let entry = cache.store.get(&ItemId::new("a"), &linux).unwrap().unwrap();
        let deps: Vec<&str> = entry.build_deps.iter().map(|(dep, _)| dep.as_str()).collect();
        assert_eq!(deps, ["b", "c", "d"]);

        provider.set("d", "changed");
        let lookup = cache.lookup(&ItemId::new("a"), &linux, &provider).unwrap();
        assert_eq!(
            lookup,
            CacheLookup::Miss(MissReason::BuildDependencyChanged(ItemId::new("d")))
        );
    }

    #[test]
    fn version_bump_invalidates_everything() {
        let provider = Hashes::default();
        provider.set("a", "one");
        let mut store = MemoryCacheStore::new();
        {
            let mut cache = BuildCache::new(Box::new(store.clone()), Uuid::from_u128(1), true);
            record(&mut cache, &provider, "a", &[]);
            let entry = cache
                .store
                .get(&ItemId::new("a"), &Platform::new("linux"))
                .unwrap()
                .unwrap();
            store.put(&entry).unwrap();
        }
        let mut bumped = BuildCache::new(Box::new(store), Uuid::from_u128(2), true);
        let lookup = bumped
            .lookup(&ItemId::new("a"), &Platform::new("linux"), &provider)
            .unwrap();
        assert_eq!(lookup, CacheLookup::Miss(MissReason::VersionChanged));
    }

    #[test]
    fn tampered_entry_is_fatal() {
        let provider = Hashes::default();
        provider.set("a", "one");
        let mut store = MemoryCacheStore::new();
        let mut entry = {
            let mut cache = BuildCache::new(Box::new(MemoryCacheStore::new()), Uuid::from_u128(1), true);
            record(&mut cache, &provider, "a", &[]);
            cache
                .store
                .get(&ItemId::new("a"), &Platform::new("linux"))
                .unwrap()
                .unwrap()
        };
        entry.own_hash = ContentHash::of(b"forged");
        store.put(&entry).unwrap();
        let mut cache = BuildCache::new(Box::new(store), Uuid::from_u128(1), true);
        let err = cache
            .lookup(&ItemId::new("a"), &Platform::new("linux"), &provider)
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
