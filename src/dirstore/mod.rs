//! A manager over many file stores: partition routing, a cache of live
//! stores, and cross-partition listings with stable continuation tokens.

mod list;
mod partition;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::{EncoderDecoder, JsonEncoderDecoder};
use crate::constants::DEFAULT_DIR_PAGE_SIZE;
use crate::error::{MapDbError, Result};
use crate::filestore::{FileListener, FileStoreOptions, MapFileStore};

pub use partition::{
    list_dirs, MonthPartitionProvider, NoPartitionProvider, PartitionProvider, TimeExtractor,
};

/// Listing and partition ordering. Partition and file names are compared
/// byte-lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    #[serde(rename = "asc")]
    Ascending,
    #[serde(rename = "desc")]
    Descending,
}

/// Logical identifier of a file within the directory store. `xattr`
/// carries opaque side data for partition providers and filename helpers.
#[derive(Debug, Clone, Default)]
pub struct FileKey {
    pub file_name: String,
    pub xattr: Option<Value>,
}

impl FileKey {
    #[must_use]
    pub fn new(file_name: impl Into<String>) -> Self {
        FileKey {
            file_name: file_name.into(),
            xattr: None,
        }
    }
}

/// Options for one `list_files` traversal.
#[derive(Debug, Clone, Default)]
pub struct ListingConfig {
    pub sort_order: SortOrder,
    /// Entries per page; `0` selects the store default.
    pub page_size: usize,
    /// When non-empty, only these partitions are visited, in the given
    /// order; missing or unreadable ones are skipped silently.
    pub filter_partitions: Vec<String>,
    /// When set, only file names starting with this prefix are yielded.
    pub filename_prefix: Option<String>,
}

/// One file yielded by a listing.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path relative to the base directory (partition + name).
    pub base_relative_path: PathBuf,
    pub partition_name: String,
    pub file_name: String,
    pub metadata: fs::Metadata,
}

/// Construction options for [`MapDirectoryStore`].
pub struct DirStoreOptions {
    page_size: usize,
    create_if_missing: bool,
    partition_provider: Arc<dyn PartitionProvider>,
    file_codec: Arc<dyn EncoderDecoder>,
    listeners: Vec<FileListener>,
}

impl Default for DirStoreOptions {
    fn default() -> Self {
        DirStoreOptions {
            page_size: DEFAULT_DIR_PAGE_SIZE,
            create_if_missing: false,
            partition_provider: Arc::new(NoPartitionProvider),
            file_codec: Arc::new(JsonEncoderDecoder),
            listeners: Vec::new(),
        }
    }
}

impl DirStoreOptions {
    /// Start a fluent builder for `DirStoreOptions`.
    #[must_use]
    pub fn builder() -> DirStoreOptionsBuilder {
        DirStoreOptionsBuilder::default()
    }
}

#[derive(Default)]
pub struct DirStoreOptionsBuilder {
    inner: DirStoreOptions,
}

impl DirStoreOptionsBuilder {
    /// Default page size for listings that do not specify one.
    #[must_use]
    pub fn page_size(mut self, size: usize) -> Self {
        if size > 0 {
            self.inner.page_size = size;
        }
        self
    }

    #[must_use]
    pub fn create_if_missing(mut self, enabled: bool) -> Self {
        self.inner.create_if_missing = enabled;
        self
    }

    #[must_use]
    pub fn partition_provider(mut self, provider: Arc<dyn PartitionProvider>) -> Self {
        self.inner.partition_provider = provider;
        self
    }

    /// File codec handed to every opened file store; pretty JSON when not
    /// set.
    #[must_use]
    pub fn file_codec(mut self, codec: Arc<dyn EncoderDecoder>) -> Self {
        self.inner.file_codec = codec;
        self
    }

    /// Listener registered on every file store this directory store opens.
    #[must_use]
    pub fn listener(mut self, listener: FileListener) -> Self {
        self.inner.listeners.push(listener);
        self
    }

    #[must_use]
    pub fn build(self) -> DirStoreOptions {
        self.inner
    }
}

/// Manages many [`MapFileStore`]s under one base directory.
///
/// Stores are cached by absolute path and shared; opening the same file
/// twice returns the same instance. The cache is guarded by a mutex; the
/// returned stores synchronize internally and need no further
/// coordination.
pub struct MapDirectoryStore {
    base_dir: PathBuf,
    page_size: usize,
    partition_provider: Arc<dyn PartitionProvider>,
    file_codec: Arc<dyn EncoderDecoder>,
    listeners: Vec<FileListener>,
    open_stores: Mutex<HashMap<PathBuf, Arc<MapFileStore>>>,
}

impl MapDirectoryStore {
    /// Open a directory store rooted at `base_dir`, creating the base when
    /// requested.
    pub fn open(base_dir: impl AsRef<Path>, options: DirStoreOptions) -> Result<Self> {
        let base_dir = std::path::absolute(base_dir.as_ref()).map_err(|err| {
            MapDbError::storage(
                format!(
                    "failed to resolve base directory {}",
                    base_dir.as_ref().display()
                ),
                err,
            )
        })?;

        if !base_dir.exists() {
            if options.create_if_missing {
                fs::create_dir_all(&base_dir).map_err(|err| {
                    MapDbError::storage(
                        format!("failed to create directory {}", base_dir.display()),
                        err,
                    )
                })?;
            } else {
                return Err(MapDbError::FileNotFound { path: base_dir });
            }
        }

        Ok(MapDirectoryStore {
            base_dir,
            page_size: options.page_size,
            partition_provider: options.partition_provider,
            file_codec: options.file_codec,
            listeners: options.listeners,
            open_stores: Mutex::new(HashMap::new()),
        })
    }

    /// Absolute base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Return the cached store for `key`, or open (and cache) a new one.
    ///
    /// With `create_if_missing`, the partition directory and the file are
    /// created as needed, the latter seeded from `defaults`.
    pub fn open_file(
        &self,
        key: &FileKey,
        create_if_missing: bool,
        defaults: Map<String, Value>,
    ) -> Result<Arc<MapFileStore>> {
        let file_path = self.file_path(key)?;

        let mut cache = self.lock_cache();
        if let Some(store) = cache.get(&file_path) {
            return Ok(Arc::clone(store));
        }

        if create_if_missing {
            if let Some(parent) = file_path.parent() {
                fs::create_dir_all(parent).map_err(|err| {
                    MapDbError::storage(
                        format!("failed to create partition directory {}", parent.display()),
                        err,
                    )
                })?;
            }
        }

        let store = Arc::new(MapFileStore::open(
            &file_path,
            FileStoreOptions::builder()
                .defaults(defaults)
                .codec(Arc::clone(&self.file_codec))
                .create_if_missing(create_if_missing)
                .listeners(self.listeners.clone())
                .build(),
        )?);
        cache.insert(file_path, Arc::clone(&store));
        Ok(store)
    }

    /// Replace the document of `key`, creating the file when absent.
    pub fn set_file_data(&self, key: &FileKey, data: &Map<String, Value>) -> Result<()> {
        let store = self.open_file(key, true, data.clone())?;
        store.set_all(data)
    }

    /// Read the document of `key`; the file must exist.
    pub fn get_file_data(&self, key: &FileKey, force_fetch: bool) -> Result<Map<String, Value>> {
        let store = self.open_file(key, false, Map::new())?;
        store.get_all(force_fetch)
    }

    /// Remove the backing file of `key` and evict it from the cache.
    pub fn delete_file(&self, key: &FileKey) -> Result<()> {
        let store = self.open_file(key, false, Map::new())?;
        store.delete_file()?;
        self.close_file(key)
    }

    /// Close the cached store for `key`, if any.
    pub fn close_file(&self, key: &FileKey) -> Result<()> {
        let file_path = self.file_path(key)?;
        let store = self.lock_cache().remove(&file_path);
        match store {
            Some(store) => store.close(),
            None => Ok(()),
        }
    }

    /// Close every cached store and clear the cache. The first error is
    /// reported after all stores were attempted.
    pub fn close_all(&self) -> Result<()> {
        let stores: Vec<Arc<MapFileStore>> = {
            let mut cache = self.lock_cache();
            cache.drain().map(|(_, store)| store).collect()
        };
        let mut first_err = None;
        for store in stores {
            if let Err(err) = store.close() {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Enumerate partitions via the configured provider.
    pub fn list_partitions(
        &self,
        sort_order: SortOrder,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<(Vec<String>, Option<String>)> {
        self.partition_provider
            .list_partitions(&self.base_dir, sort_order, page_token, page_size)
    }

    /// Resolve `key` to its absolute file path via the partition provider.
    fn file_path(&self, key: &FileKey) -> Result<PathBuf> {
        if key.file_name.is_empty() {
            return Err(MapDbError::Config {
                reason: "file key has an empty file name".to_string(),
            });
        }
        if key.file_name.contains(['/', '\\']) {
            return Err(MapDbError::Config {
                reason: format!(
                    "file name must not contain directory components: {}",
                    key.file_name
                ),
            });
        }
        let partition = self.partition_provider.partition_dir(key)?;
        let mut path = self.base_dir.clone();
        if !partition.is_empty() {
            path.push(&partition);
        }
        path.push(&key.file_name);
        Ok(path)
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<MapFileStore>>> {
        self.open_stores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MapDirectoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapDirectoryStore")
            .field("base_dir", &self.base_dir)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    fn obj(value: Value) -> Map<String, Value> {
        let Value::Object(map) = value else {
            panic!("literal must be an object");
        };
        map
    }

    #[test]
    fn open_file_caches_and_shares_one_instance() {
        let dir = tempdir().expect("tmp");
        let store = MapDirectoryStore::open(
            dir.path(),
            DirStoreOptions::builder().create_if_missing(true).build(),
        )
        .expect("open");

        let key = FileKey::new("conf.json");
        let a = store
            .open_file(&key, true, obj(json!({"v": 1})))
            .expect("first open");
        let b = store
            .open_file(&key, false, Map::new())
            .expect("second open");
        assert!(Arc::ptr_eq(&a, &b), "same path must share one store");

        store.close_file(&key).expect("close");
        let c = store.open_file(&key, false, Map::new()).expect("reopen");
        assert!(!Arc::ptr_eq(&a, &c), "closed entries are evicted");
    }

    #[test]
    fn rejects_file_names_with_separators() {
        let dir = tempdir().expect("tmp");
        let store = MapDirectoryStore::open(
            dir.path(),
            DirStoreOptions::builder().create_if_missing(true).build(),
        )
        .expect("open");

        for bad in ["a/b.json", "..\\evil.json", ""] {
            let err = store
                .open_file(&FileKey::new(bad), true, Map::new())
                .expect_err("must reject");
            assert!(matches!(err, MapDbError::Config { .. }), "{bad}");
        }
    }

    #[test]
    fn set_get_delete_round_trip() {
        let dir = tempdir().expect("tmp");
        let store = MapDirectoryStore::open(
            dir.path(),
            DirStoreOptions::builder().create_if_missing(true).build(),
        )
        .expect("open");

        let key = FileKey::new("doc.json");
        store
            .set_file_data(&key, &obj(json!({"x": 1})))
            .expect("set");
        assert_eq!(
            store.get_file_data(&key, false).expect("get"),
            obj(json!({"x": 1}))
        );

        store.delete_file(&key).expect("delete");
        assert!(!dir.path().join("doc.json").exists());
        let err = store.get_file_data(&key, false).expect_err("gone");
        assert!(matches!(err, MapDbError::FileNotFound { .. }));
    }

    #[test]
    fn missing_base_without_create_fails() {
        let dir = tempdir().expect("tmp");
        let err = MapDirectoryStore::open(
            dir.path().join("nope"),
            DirStoreOptions::default(),
        )
        .expect_err("missing base");
        assert!(matches!(err, MapDbError::FileNotFound { .. }));
    }
}
