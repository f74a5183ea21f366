//! Partition providers: map file keys to subdirectories and enumerate
//! partitions with pagination.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use time::OffsetDateTime;

use crate::error::{MapDbError, Result};
use crate::pagetoken;

use super::{FileKey, SortOrder};

/// Decides which subdirectory a file key lives in and enumerates
/// partitions. Deterministic per key; partition names are compared
/// byte-lexicographically.
pub trait PartitionProvider: Send + Sync {
    fn partition_dir(&self, key: &FileKey) -> Result<String>;

    fn list_partitions(
        &self,
        base_dir: &Path,
        sort_order: SortOrder,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<(Vec<String>, Option<String>)>;
}

/// Treats the base directory as a single partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPartitionProvider;

impl PartitionProvider for NoPartitionProvider {
    fn partition_dir(&self, _key: &FileKey) -> Result<String> {
        Ok(String::new())
    }

    fn list_partitions(
        &self,
        _base_dir: &Path,
        _sort_order: SortOrder,
        _page_token: Option<&str>,
        _page_size: usize,
    ) -> Result<(Vec<String>, Option<String>)> {
        Ok((vec![String::new()], None))
    }
}

/// Returns the creation instant of a file key.
pub type TimeExtractor = Arc<dyn Fn(&FileKey) -> Result<OffsetDateTime> + Send + Sync>;

/// Derives `yyyyMM` partition directories from a caller-supplied time
/// extractor.
pub struct MonthPartitionProvider {
    time_fn: TimeExtractor,
}

impl MonthPartitionProvider {
    #[must_use]
    pub fn new(time_fn: TimeExtractor) -> Self {
        MonthPartitionProvider { time_fn }
    }
}

impl PartitionProvider for MonthPartitionProvider {
    fn partition_dir(&self, key: &FileKey) -> Result<String> {
        let t = (self.time_fn)(key)?;
        Ok(format!("{:04}{:02}", t.year(), u8::from(t.month())))
    }

    fn list_partitions(
        &self,
        base_dir: &Path,
        sort_order: SortOrder,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<(Vec<String>, Option<String>)> {
        list_dirs(base_dir, sort_order, page_token, page_size)
    }
}

impl std::fmt::Debug for MonthPartitionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonthPartitionProvider").finish_non_exhaustive()
    }
}

/// Paginated, sorted listing of the subdirectories of `base_dir`.
///
/// The continuation token is the next integer offset into the sorted list,
/// base64-wrapped.
pub fn list_dirs(
    base_dir: &Path,
    sort_order: SortOrder,
    page_token: Option<&str>,
    page_size: usize,
) -> Result<(Vec<String>, Option<String>)> {
    let read = fs::read_dir(base_dir).map_err(|err| {
        MapDbError::storage(
            format!("failed to read base directory {}", base_dir.display()),
            err,
        )
    })?;

    let mut dirs = Vec::new();
    for entry in read {
        let entry = entry.map_err(|err| {
            MapDbError::storage(
                format!("failed to read entry in {}", base_dir.display()),
                err,
            )
        })?;
        let file_type = entry.file_type().map_err(|err| {
            MapDbError::storage(
                format!("failed to stat entry in {}", base_dir.display()),
                err,
            )
        })?;
        if file_type.is_dir() {
            dirs.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    dirs.sort();
    if sort_order == SortOrder::Descending {
        dirs.reverse();
    }

    let start = match page_token {
        Some(token) => pagetoken::decode_token::<usize>(token)?,
        None => 0,
    };
    let start = start.min(dirs.len());
    let end = (start + page_size).min(dirs.len());

    let next_token = if end < dirs.len() {
        Some(pagetoken::encode_token(&end)?)
    } else {
        None
    };

    Ok((dirs[start..end].to_vec(), next_token))
}
