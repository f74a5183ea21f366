//! Cross-partition file listing with resumable continuation tokens.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MapDbError, Result};
use crate::pagetoken;

use super::{FileEntry, ListingConfig, MapDirectoryStore, SortOrder};

/// Progress through an explicit partition filter list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartitionFilterPageToken {
    partition_index: usize,
    filter_partitions: Vec<String>,
}

/// Full paging state carried between `list_files` calls. Exactly one of
/// `partition_listing_page_token` (provider-driven iteration) and
/// `partition_filter_page_token` (explicit filter list) is populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPageToken {
    file_index: usize,
    sort_order: SortOrder,
    page_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filename_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    partition_listing_page_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    partition_filter_page_token: Option<PartitionFilterPageToken>,
}

struct PartitionFile {
    name: String,
    metadata: fs::Metadata,
}

impl MapDirectoryStore {
    /// List files across partitions, at most one page per call.
    ///
    /// Threading the returned token through repeated calls yields every
    /// matching entry exactly once in the configured order; the final call
    /// returns no token. Listing parameters are frozen into the token, so
    /// `config` is only consulted when `page_token` is `None`.
    pub fn list_files(
        &self,
        config: &ListingConfig,
        page_token: Option<&str>,
    ) -> Result<(Vec<FileEntry>, Option<String>)> {
        let mut token = match page_token {
            Some(raw) => pagetoken::decode_token::<ListPageToken>(raw)?,
            None => ListPageToken {
                file_index: 0,
                sort_order: config.sort_order,
                page_size: if config.page_size == 0 {
                    self.page_size
                } else {
                    config.page_size
                },
                filename_prefix: config.filename_prefix.clone().filter(|p| !p.is_empty()),
                partition_listing_page_token: None,
                partition_filter_page_token: if config.filter_partitions.is_empty() {
                    None
                } else {
                    Some(PartitionFilterPageToken {
                        partition_index: 0,
                        filter_partitions: config.filter_partitions.clone(),
                    })
                },
            },
        };

        let mut entries: Vec<FileEntry> = Vec::new();

        loop {
            // Resolve the current partition from the filter list or the
            // provider (pages of one, so the cursor stays re-fetchable).
            let mut next_listing_token: Option<String> = None;
            let partition_name = if let Some(filter) = &token.partition_filter_page_token {
                if filter.partition_index >= filter.filter_partitions.len() {
                    break;
                }
                filter.filter_partitions[filter.partition_index].clone()
            } else {
                let (partitions, next) = self.partition_provider.list_partitions(
                    &self.base_dir,
                    token.sort_order,
                    token.partition_listing_page_token.as_deref(),
                    1,
                )?;
                next_listing_token = next;
                match partitions.into_iter().next() {
                    Some(partition) => partition,
                    None => break,
                }
            };

            let partition_path = self.base_dir.join(&partition_name);
            let files = match fs::read_dir(&partition_path) {
                Ok(read) => collect_partition_files(
                    read,
                    &partition_path,
                    token.sort_order,
                    token.filename_prefix.as_deref(),
                )?,
                Err(err) => {
                    tracing::debug!(
                        partition = %partition_path.display(),
                        error = %err,
                        "skipping unreadable partition"
                    );
                    Vec::new()
                }
            };

            for (index, file) in files.iter().enumerate().skip(token.file_index) {
                if entries.len() == token.page_size {
                    let next = ListPageToken {
                        file_index: index,
                        sort_order: token.sort_order,
                        page_size: token.page_size,
                        filename_prefix: token.filename_prefix.clone(),
                        partition_listing_page_token: token.partition_listing_page_token.clone(),
                        partition_filter_page_token: token.partition_filter_page_token.clone(),
                    };
                    return Ok((entries, Some(pagetoken::encode_token(&next)?)));
                }
                entries.push(FileEntry {
                    base_relative_path: relative_path(&partition_name, &file.name),
                    partition_name: partition_name.clone(),
                    file_name: file.name.clone(),
                    metadata: file.metadata.clone(),
                });
            }
            token.file_index = 0;

            if let Some(filter) = &mut token.partition_filter_page_token {
                filter.partition_index += 1;
            } else {
                match next_listing_token {
                    Some(next) => token.partition_listing_page_token = Some(next),
                    None => break,
                }
            }
        }

        Ok((entries, None))
    }
}

fn relative_path(partition: &str, file_name: &str) -> PathBuf {
    if partition.is_empty() {
        PathBuf::from(file_name)
    } else {
        Path::new(partition).join(file_name)
    }
}

/// Collect, filter and sort the plain files of one partition directory.
fn collect_partition_files(
    read: fs::ReadDir,
    partition_path: &Path,
    sort_order: SortOrder,
    filename_prefix: Option<&str>,
) -> Result<Vec<PartitionFile>> {
    let mut files = Vec::new();
    for entry in read {
        let entry = entry.map_err(|err| {
            MapDbError::storage(
                format!("failed to read entry in {}", partition_path.display()),
                err,
            )
        })?;
        let file_type = entry.file_type().map_err(|err| {
            MapDbError::storage(
                format!("failed to stat entry in {}", partition_path.display()),
                err,
            )
        })?;
        if file_type.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(prefix) = filename_prefix {
            if !name.starts_with(prefix) {
                continue;
            }
        }
        let metadata = entry.metadata().map_err(|err| {
            MapDbError::storage(format!("cannot stat file {name}"), err)
        })?;
        files.push(PartitionFile { name, metadata });
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    if sort_order == SortOrder::Descending {
        files.reverse();
    }
    Ok(files)
}
