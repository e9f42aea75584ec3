use std::{
    fmt,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    cook::cache::{BuildCacheEntry, BuildCacheStore},
    error::{CookError, Result},
    types::{ItemId, Platform},
};

/// Key layout version. Bumped when the entry encoding changes.
const KEY_PREFIX: &str = "cook/v1";

/// Root directory of the persistent build cache.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BuildCacheRoot(PathBuf);

impl BuildCacheRoot {
    pub fn new(path: PathBuf) -> Self {
        Self(path)
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Debug for BuildCacheRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BuildCacheRoot").field(&self.0).finish()
    }
}

/// Build cache entries stored as JSON blobs in a `cacache` directory, keyed
/// by platform and item.
///
/// Reads verify the blob's integrity; a corrupt entry is reported as a
/// [`CookError::Cache`], which ends the session.
#[derive(Clone, Debug)]
pub struct DiskCacheStore {
    root: BuildCacheRoot,
}

impl DiskCacheStore {
    pub fn new(root: BuildCacheRoot) -> Self {
        Self { root }
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::new(BuildCacheRoot::new(path.into()))
    }

    pub fn root(&self) -> &BuildCacheRoot {
        &self.root
    }

    fn key(item: &ItemId, platform: &Platform) -> String {
        format!("{KEY_PREFIX}/{platform}/{item}")
    }
}

fn map_cacache_error(key: &str, op: &str, err: cacache::Error) -> CookError {
    match err {
        cacache::Error::EntryNotFound(_, _) => {
            CookError::Internal(format!("cache entry not found: {key}"))
        }
        cacache::Error::IntegrityError(err) => CookError::Cache(format!(
            "cache entry failed integrity check: {key} ({err})"
        )),
        cacache::Error::SizeMismatch(wanted, actual) => CookError::Cache(format!(
            "cache entry size mismatch: key={key}, wanted={wanted}, actual={actual}"
        )),
        cacache::Error::IoError(_, msg) => {
            CookError::Internal(format!("cacache {op} I/O error: {msg}"))
        }
        cacache::Error::SerdeError(_, msg) => {
            CookError::Cache(format!("cacache {op} index corrupt: {msg}"))
        }
    }
}

impl BuildCacheStore for DiskCacheStore {
    fn get(&self, item: &ItemId, platform: &Platform) -> Result<Option<BuildCacheEntry>> {
        let key = Self::key(item, platform);
        let bytes = match cacache::read_sync(self.root.as_path(), &key) {
            Ok(bytes) => bytes,
            Err(cacache::Error::EntryNotFound(_, _)) => return Ok(None),
            Err(err) => return Err(map_cacache_error(&key, "read", err)),
        };
        let entry: BuildCacheEntry = serde_json::from_slice(&bytes)
            .map_err(|err| CookError::Cache(format!("cache entry {key} unreadable: {err}")))?;
        if entry.item != *item || entry.platform != *platform {
            return Err(CookError::Cache(format!(
                "cache entry {key} describes {} for {}",
                entry.item, entry.platform
            )));
        }
        Ok(Some(entry))
    }

    fn put(&mut self, entry: &BuildCacheEntry) -> Result<()> {
        let key = Self::key(&entry.item, &entry.platform);
        let bytes = serde_json::to_vec(entry)?;
        let integrity = cacache::write_sync(self.root.as_path(), &key, &bytes)
            .map_err(|err| map_cacache_error(&key, "write", err))?;
        debug!(target: "cook::cache", %key, %integrity, bytes = bytes.len(), "entry stored");
        Ok(())
    }

    fn remove(&mut self, item: &ItemId, platform: &Platform) -> Result<()> {
        let key = Self::key(item, platform);
        match cacache::remove_sync(self.root.as_path(), &key) {
            Ok(()) | Err(cacache::Error::EntryNotFound(_, _)) => Ok(()),
            Err(err) => Err(map_cacache_error(&key, "remove", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::types::ContentHash;

    fn entry(item: &str) -> BuildCacheEntry {
        BuildCacheEntry {
            item: ItemId::new(item),
            platform: Platform::new("linux"),
            version: Uuid::nil(),
            own_hash: ContentHash::of(b"own"),
            build_deps: vec![(ItemId::new("/Game/Shader"), ContentHash::of(b"shader"))],
            combined: ContentHash::of(b"combined"),
            imports: vec![ItemId::new("/Game/Tex")],
            soft_refs: Vec::new(),
            generated: Vec::new(),
        }
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DiskCacheStore::open(dir.path());
        store.put(&entry("/Game/Mat")).unwrap();

        let reopened = DiskCacheStore::open(dir.path());
        let got = reopened
            .get(&ItemId::new("/Game/Mat"), &Platform::new("linux"))
            .unwrap();
        assert_eq!(got, Some(entry("/Game/Mat")));
    }

    #[test]
    fn missing_and_removed_entries_read_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DiskCacheStore::open(dir.path());
        let (id, platform) = (ItemId::new("/Game/Mat"), Platform::new("linux"));
        assert_eq!(store.get(&id, &platform).unwrap(), None);

        store.put(&entry("/Game/Mat")).unwrap();
        store.remove(&id, &platform).unwrap();
        assert_eq!(store.get(&id, &platform).unwrap(), None);
        store.remove(&id, &platform).unwrap();
    }

    #[test]
    fn platforms_are_separate_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DiskCacheStore::open(dir.path());
        store.put(&entry("/Game/Mat")).unwrap();
        assert_eq!(
            store
                .get(&ItemId::new("/Game/Mat"), &Platform::new("windows"))
                .unwrap(),
            None
        );
    }
}
