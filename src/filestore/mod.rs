//! One document, one file: a thread-safe map store with optimistic
//! concurrency control, codec pipelines and change events.

mod snapshot;

use std::fs;
use std::io::{self, BufReader};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::codec::{
    pipeline, EncoderDecoder, JsonEncoderDecoder, KeyCodecProvider, ValueCodecProvider,
};
use crate::constants::MAX_SET_ALL_RETRIES;
use crate::docpath;
use crate::error::{MapDbError, Result};

use snapshot::FileSnapshot;

/// The kind of mutation that happened on a file or a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    SetFile,
    ResetFile,
    DeleteFile,
    SetKey,
    DeleteKey,
}

/// Delivered to listeners after a mutation has completed.
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub op: Operation,
    /// Absolute path of the backing file.
    pub file: PathBuf,
    /// `None` for file-level operations.
    pub keys: Option<Vec<String>>,
    /// `None` for `SetFile` / `ResetFile` and for sets of new keys.
    pub old_value: Option<Value>,
    /// `None` for deletes.
    pub new_value: Option<Value>,
    /// Deep copy of the whole document after the change; `None` for
    /// `DeleteFile`.
    pub data: Option<Map<String, Value>>,
    pub timestamp: OffsetDateTime,
}

/// Callback observing mutations, invoked synchronously in registration
/// order. A panicking listener is isolated and logged; it neither stops
/// later listeners nor rolls back the mutation.
pub type FileListener = Arc<dyn Fn(&FileEvent) + Send + Sync>;

/// Construction options for [`MapFileStore`].
pub struct FileStoreOptions {
    defaults: Map<String, Value>,
    codec: Arc<dyn EncoderDecoder>,
    create_if_missing: bool,
    auto_flush: bool,
    key_codecs: Option<Arc<dyn KeyCodecProvider>>,
    value_codecs: Option<Arc<dyn ValueCodecProvider>>,
    listeners: Vec<FileListener>,
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        FileStoreOptions {
            defaults: Map::new(),
            codec: Arc::new(JsonEncoderDecoder),
            create_if_missing: false,
            auto_flush: true,
            key_codecs: None,
            value_codecs: None,
            listeners: Vec::new(),
        }
    }
}

impl FileStoreOptions {
    /// Start a fluent builder for `FileStoreOptions`.
    #[must_use]
    pub fn builder() -> FileStoreOptionsBuilder {
        FileStoreOptionsBuilder::default()
    }
}

#[derive(Default)]
pub struct FileStoreOptionsBuilder {
    inner: FileStoreOptions,
}

impl FileStoreOptionsBuilder {
    /// Document used when creating a missing file and on `reset`.
    #[must_use]
    pub fn defaults(mut self, defaults: Map<String, Value>) -> Self {
        self.inner.defaults = defaults;
        self
    }

    /// File codec; pretty JSON when not set.
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn EncoderDecoder>) -> Self {
        self.inner.codec = codec;
        self
    }

    #[must_use]
    pub fn create_if_missing(mut self, enabled: bool) -> Self {
        self.inner.create_if_missing = enabled;
        self
    }

    /// Flush after every mutation (default). When disabled, mutations stay
    /// in memory until an explicit `flush`.
    #[must_use]
    pub fn auto_flush(mut self, enabled: bool) -> Self {
        self.inner.auto_flush = enabled;
        self
    }

    #[must_use]
    pub fn key_codec_provider(mut self, provider: Arc<dyn KeyCodecProvider>) -> Self {
        self.inner.key_codecs = Some(provider);
        self
    }

    #[must_use]
    pub fn value_codec_provider(mut self, provider: Arc<dyn ValueCodecProvider>) -> Self {
        self.inner.value_codecs = Some(provider);
        self
    }

    #[must_use]
    pub fn listener(mut self, listener: FileListener) -> Self {
        self.inner.listeners.push(listener);
        self
    }

    #[must_use]
    pub fn listeners(mut self, listeners: Vec<FileListener>) -> Self {
        self.inner.listeners.extend(listeners);
        self
    }

    #[must_use]
    pub fn build(self) -> FileStoreOptions {
        self.inner
    }
}

struct StoreInner {
    data: Map<String, Value>,
    last_snapshot: Option<FileSnapshot>,
}

/// A file-backed, thread-safe hierarchical map store.
///
/// The in-memory document and the last-observed file snapshot live under
/// one read-write lock; readers share it, mutations and flush take it
/// exclusively. Cross-process writers are detected optimistically: flush
/// compares the current file identity against the remembered snapshot and
/// fails with `FileConflict` on divergence.
pub struct MapFileStore {
    path: PathBuf,
    defaults: Map<String, Value>,
    codec: Arc<dyn EncoderDecoder>,
    key_codecs: Option<Arc<dyn KeyCodecProvider>>,
    value_codecs: Option<Arc<dyn ValueCodecProvider>>,
    auto_flush: bool,
    create_if_missing: bool,
    listeners: Vec<FileListener>,
    inner: RwLock<StoreInner>,
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_path_for(path: &Path) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".tmp-{}-{n}", std::process::id()));
    PathBuf::from(name)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

impl MapFileStore {
    /// Open the store at `path`, loading the existing document through the
    /// decode pipeline, or creating the file from the defaults when absent
    /// and `create_if_missing` is set.
    pub fn open(path: impl AsRef<Path>, options: FileStoreOptions) -> Result<Self> {
        let path = std::path::absolute(path.as_ref()).map_err(|err| {
            MapDbError::storage(
                format!("failed to resolve path {}", path.as_ref().display()),
                err,
            )
        })?;
        let store = MapFileStore {
            path,
            defaults: options.defaults,
            codec: options.codec,
            key_codecs: options.key_codecs,
            value_codecs: options.value_codecs,
            auto_flush: options.auto_flush,
            create_if_missing: options.create_if_missing,
            listeners: options.listeners,
            inner: RwLock::new(StoreInner {
                data: Map::new(),
                last_snapshot: None,
            }),
        };
        store.create_file_if_missing()?;
        store.load()?;
        Ok(store)
    }

    /// Absolute path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a deep copy of the document. With `force_fetch`, the on-disk
    /// identity is compared first and the document reloaded when it
    /// diverged from the remembered snapshot.
    pub fn get_all(&self, force_fetch: bool) -> Result<Map<String, Value>> {
        if force_fetch {
            let meta = fs::metadata(&self.path).map_err(|err| {
                MapDbError::storage(format!("failed to stat file {}", self.path.display()), err)
            })?;
            let current = FileSnapshot::of(&meta);
            let needs_reload = {
                let inner = self.read_inner();
                match &inner.last_snapshot {
                    Some(last) => !last.matches(&current),
                    None => true,
                }
            };
            if needs_reload {
                self.load()?;
            }
        }
        Ok(self.read_inner().data.clone())
    }

    /// Replace the whole document. Retries automatically when another
    /// writer wins the flush race, reloading between attempts; after
    /// exhaustion the conflict is surfaced.
    pub fn set_all(&self, data: &Map<String, Value>) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.set_all_once(data) {
                Ok(copy_after) => {
                    self.fire_event(FileEvent {
                        op: Operation::SetFile,
                        file: self.path.clone(),
                        keys: None,
                        old_value: None,
                        new_value: None,
                        data: Some(copy_after),
                        timestamp: OffsetDateTime::now_utc(),
                    });
                    return Ok(());
                }
                Err(err) if err.is_conflict() && attempt + 1 < MAX_SET_ALL_RETRIES => {
                    attempt += 1;
                    tracing::debug!(
                        file = %self.path.display(),
                        attempt,
                        "flush conflict, reloading before retry"
                    );
                    self.load()?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Returns a deep copy of the value at the key path.
    pub fn get_key(&self, keys: &[String]) -> Result<Value> {
        let inner = self.read_inner();
        docpath::get_value_at_path(&inner.data, keys).cloned()
    }

    /// Write a value at the key path, creating missing intermediate
    /// mappings, and flush when auto-flush is on.
    pub fn set_key(&self, keys: &[String], value: Value) -> Result<()> {
        let (old_value, copy_after) = {
            let mut inner = self.write_inner();
            let old_value = docpath::get_value_at_path(&inner.data, keys).ok().cloned();
            docpath::set_value_at_path(&mut inner.data, keys, value.clone())?;
            let copy_after = inner.data.clone();
            if self.auto_flush {
                self.flush_locked(&mut inner)?;
            }
            (old_value, copy_after)
        };
        self.fire_event(FileEvent {
            op: Operation::SetKey,
            file: self.path.clone(),
            keys: Some(keys.to_vec()),
            old_value,
            new_value: Some(value),
            data: Some(copy_after),
            timestamp: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    /// Delete the value at the key path; a missing path is a successful
    /// no-op.
    pub fn delete_key(&self, keys: &[String]) -> Result<()> {
        let (old_value, copy_after) = {
            let mut inner = self.write_inner();
            let old_value = docpath::delete_value_at_path(&mut inner.data, keys)?;
            let copy_after = inner.data.clone();
            if self.auto_flush {
                self.flush_locked(&mut inner)?;
            }
            (old_value, copy_after)
        };
        self.fire_event(FileEvent {
            op: Operation::DeleteKey,
            file: self.path.clone(),
            keys: Some(keys.to_vec()),
            old_value,
            new_value: None,
            data: Some(copy_after),
            timestamp: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    /// Replace the document with the defaults and flush unconditionally.
    pub fn reset(&self) -> Result<()> {
        let copy_after = {
            let mut inner = self.write_inner();
            inner.data = self.defaults.clone();
            let copy_after = inner.data.clone();
            self.flush_locked(&mut inner)?;
            copy_after
        };
        self.fire_event(FileEvent {
            op: Operation::ResetFile,
            file: self.path.clone(),
            keys: None,
            old_value: None,
            new_value: None,
            data: Some(copy_after),
            timestamp: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    /// Remove the backing file. Fails with `FileConflict` when the file
    /// changed since the last observation. Afterwards the in-memory
    /// document is empty, the snapshot is cleared, and a later flush
    /// recreates the file.
    pub fn delete_file(&self) -> Result<()> {
        {
            let mut inner = self.write_inner();
            if let Some(last) = &inner.last_snapshot {
                match fs::metadata(&self.path) {
                    Ok(meta) => {
                        if !last.matches(&FileSnapshot::of(&meta)) {
                            return Err(MapDbError::FileConflict {
                                path: self.path.clone(),
                            });
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => {
                        return Err(MapDbError::storage(
                            format!("failed to stat file {}", self.path.display()),
                            err,
                        ));
                    }
                }
            }
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(MapDbError::storage(
                        format!("failed to remove file {}", self.path.display()),
                        err,
                    ));
                }
            }
            inner.last_snapshot = None;
            inner.data = Map::new();
        }
        self.fire_event(FileEvent {
            op: Operation::DeleteFile,
            file: self.path.clone(),
            keys: None,
            old_value: None,
            new_value: None,
            data: None,
            timestamp: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    /// Encode and write the current document to disk. Emits no event.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.write_inner();
        self.flush_locked(&mut inner)
    }

    /// Release the store. Never flushes; unflushed mutations are dropped.
    pub fn close(&self) -> Result<()> {
        Ok(())
    }

    fn set_all_once(&self, data: &Map<String, Value>) -> Result<Map<String, Value>> {
        let mut inner = self.write_inner();
        inner.data = data.clone();
        let copy_after = inner.data.clone();
        if self.auto_flush {
            self.flush_locked(&mut inner)?;
        }
        Ok(copy_after)
    }

    fn create_file_if_missing(&self) -> Result<()> {
        match fs::metadata(&self.path) {
            Ok(_) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(MapDbError::storage(
                    format!("failed to stat file {}", self.path.display()),
                    err,
                ));
            }
        }
        if !self.create_if_missing {
            return Err(MapDbError::FileNotFound {
                path: self.path.clone(),
            });
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    MapDbError::storage(
                        format!("failed to create directory {}", parent.display()),
                        err,
                    )
                })?;
            }
        }

        // O_EXCL semantics: a racing creator losing here is fine, the
        // winner's content is loaded afterwards.
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(()),
            Err(err) => {
                return Err(MapDbError::storage(
                    format!("failed to create file {}", self.path.display()),
                    err,
                ));
            }
        }

        let mut inner = self.write_inner();
        inner.data = self.defaults.clone();
        self.flush_locked(&mut inner)
    }

    fn load(&self) -> Result<()> {
        let mut inner = self.write_inner();
        self.load_locked(&mut inner)
    }

    fn load_locked(&self, inner: &mut StoreInner) -> Result<()> {
        let file = fs::File::open(&self.path).map_err(|err| {
            MapDbError::storage(format!("failed to open file {}", self.path.display()), err)
        })?;
        let value = self.codec.decode(&mut BufReader::new(file))?;
        let Value::Object(map) = value else {
            return Err(MapDbError::CodecFailure {
                path: String::new(),
                reason: "document root must be a mapping".to_string(),
            });
        };
        inner.data = pipeline::decode_from_disk(
            map,
            self.key_codecs.as_deref(),
            self.value_codecs.as_deref(),
        )?;
        let meta = fs::metadata(&self.path).map_err(|err| {
            MapDbError::storage(format!("failed to stat file {}", self.path.display()), err)
        })?;
        inner.last_snapshot = Some(FileSnapshot::of(&meta));
        Ok(())
    }

    /// Atomic write protocol: encode a copy through the pipeline, OCC-check
    /// against the remembered snapshot, write a sibling temp file, carry
    /// over permissions, rename over the target, re-stat.
    fn flush_locked(&self, inner: &mut StoreInner) -> Result<()> {
        let encoded = pipeline::encode_for_disk(
            &inner.data,
            self.key_codecs.as_deref(),
            self.value_codecs.as_deref(),
        )?;

        if let Some(last) = &inner.last_snapshot {
            match fs::metadata(&self.path) {
                Ok(meta) => {
                    if !last.matches(&FileSnapshot::of(&meta)) {
                        return Err(MapDbError::FileConflict {
                            path: self.path.clone(),
                        });
                    }
                    // Surface permission problems before touching the temp
                    // file.
                    fs::OpenOptions::new()
                        .write(true)
                        .open(&self.path)
                        .map_err(|err| {
                            MapDbError::storage(
                                format!("cannot open file {} for write", self.path.display()),
                                err,
                            )
                        })?;
                }
                // The file vanished under us; treat as a conflict.
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Err(MapDbError::FileConflict {
                        path: self.path.clone(),
                    });
                }
                Err(err) => {
                    return Err(MapDbError::storage(
                        format!("failed to stat file {}", self.path.display()),
                        err,
                    ));
                }
            }
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    MapDbError::storage(
                        format!("failed to ensure directory for {}", self.path.display()),
                        err,
                    )
                })?;
            }
        }

        let mut buf = Vec::new();
        self.codec.encode(&mut buf, &Value::Object(encoded))?;

        let tmp_path = temp_path_for(&self.path);
        if let Err(err) = fs::write(&tmp_path, &buf) {
            let _ = fs::remove_file(&tmp_path);
            return Err(MapDbError::storage(
                format!("failed to write temp file {}", tmp_path.display()),
                err,
            ));
        }
        if let Some(last) = &inner.last_snapshot {
            let _ = fs::set_permissions(&tmp_path, last.permissions());
        }
        if let Err(err) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(MapDbError::storage(
                format!("failed to replace file {}", self.path.display()),
                err,
            ));
        }

        let meta = fs::metadata(&self.path).map_err(|err| {
            MapDbError::storage(format!("failed to stat file {}", self.path.display()), err)
        })?;
        inner.last_snapshot = Some(FileSnapshot::of(&meta));
        tracing::debug!(file = %self.path.display(), bytes = buf.len(), "flushed document");
        Ok(())
    }

    fn fire_event(&self, event: FileEvent) {
        for listener in &self.listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                tracing::error!(
                    file = %event.file.display(),
                    op = ?event.op,
                    panic = %panic_message(payload.as_ref()),
                    "file listener panicked"
                );
            }
        }
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MapFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapFileStore")
            .field("path", &self.path)
            .field("auto_flush", &self.auto_flush)
            .finish_non_exhaustive()
    }
}
