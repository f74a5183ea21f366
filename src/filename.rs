//! UUIDv7-based file names: `<uuid>_<sanitized-title>.json`.
//!
//! The embedded timestamp makes these names a natural fit for the month
//! partition provider: the creation instant is recoverable from the name
//! alone, no extra metadata needed.

use std::path::Path;
use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::dirstore::{FileKey, TimeExtractor};
use crate::error::{MapDbError, Result};

const DEFAULT_TITLE: &str = "New Conversation";
const MAX_TITLE_CHARS: usize = 64;

/// Parsed pieces of a provider-built file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNameInfo {
    /// UUIDv7 string.
    pub id: String,
    /// Human-readable title. Build is lossy: non-alphanumerics collapse to
    /// underscores, so parse cannot reproduce the original exactly.
    pub title: String,
    pub created_at: OffsetDateTime,
}

/// Builds and parses `<uuidv7>_<sanitized-title>.json` file names.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidV7FilenameProvider;

impl UuidV7FilenameProvider {
    /// Compose a file name from an id and title.
    pub fn build(&self, info: &FileNameInfo) -> Result<String> {
        if info.id.is_empty() {
            return Err(MapDbError::Config {
                reason: "file name info is missing an id".to_string(),
            });
        }
        let title = if info.title.is_empty() {
            DEFAULT_TITLE
        } else {
            &info.title
        };
        let title: String = title
            .chars()
            .take(MAX_TITLE_CHARS)
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        Ok(format!("{}_{title}.json", info.id))
    }

    /// Recover id, title and creation instant from a file name built by
    /// [`build`](Self::build).
    pub fn parse(&self, filename: &str) -> Result<FileNameInfo> {
        let stem = Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| MapDbError::Config {
                reason: format!("invalid file name: {filename}"),
            })?;

        let (id, raw_title) = match stem.split_once('_') {
            Some((id, title)) => (id, title),
            None => (stem, ""),
        };

        let created_at = extract_time_from_uuidv7(id)?;
        Ok(FileNameInfo {
            id: id.to_string(),
            title: raw_title.replace('_', " "),
            created_at,
        })
    }

    /// Creation instant embedded in the file name's UUIDv7.
    pub fn created_at(&self, filename: &str) -> Result<OffsetDateTime> {
        Ok(self.parse(filename)?.created_at)
    }

    /// A [`TimeExtractor`] for pairing with the month partition provider:
    /// the partition of a file key follows from its name.
    #[must_use]
    pub fn time_extractor() -> TimeExtractor {
        Arc::new(|key: &FileKey| UuidV7FilenameProvider.created_at(&key.file_name))
    }
}

/// Pull the millisecond timestamp out of a UUIDv7 string.
pub fn extract_time_from_uuidv7(id: &str) -> Result<OffsetDateTime> {
    let uuid = Uuid::parse_str(id).map_err(|err| MapDbError::Config {
        reason: format!("invalid uuid {id:?}: {err}"),
    })?;
    if uuid.get_version_num() != 7 {
        return Err(MapDbError::Config {
            reason: format!("not a uuidv7: {id}"),
        });
    }
    let ts = uuid.get_timestamp().ok_or_else(|| MapDbError::Config {
        reason: format!("uuid {id} carries no timestamp"),
    })?;
    let (secs, nanos) = ts.to_unix();
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(secs) * 1_000_000_000 + i128::from(nanos))
        .map_err(|err| MapDbError::Config {
            reason: format!("uuid {id} timestamp out of range: {err}"),
        })
}

#[cfg(test)]
mod tests {
    use uuid::{NoContext, Timestamp};

    use super::*;

    fn v7_at(secs: u64) -> Uuid {
        Uuid::new_v7(Timestamp::from_unix(NoContext, secs, 0))
    }

    #[test]
    fn build_then_parse_round_trips() {
        let id = v7_at(1_700_000_000).to_string();
        let provider = UuidV7FilenameProvider;
        let name = provider
            .build(&FileNameInfo {
                id: id.clone(),
                title: "Weekly sync: plans & notes".to_string(),
                created_at: OffsetDateTime::UNIX_EPOCH,
            })
            .expect("build");
        assert!(name.ends_with(".json"));
        assert!(!name.contains(':'));

        let info = provider.parse(&name).expect("parse");
        assert_eq!(info.id, id);
        assert_eq!(info.title, "Weekly sync  plans   notes");
        assert_eq!(info.created_at.unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn build_defaults_and_truncates_title() {
        let id = v7_at(1_700_000_000).to_string();
        let provider = UuidV7FilenameProvider;

        let name = provider
            .build(&FileNameInfo {
                id: id.clone(),
                title: String::new(),
                created_at: OffsetDateTime::UNIX_EPOCH,
            })
            .expect("build");
        assert!(name.contains("New_Conversation"));

        let long = "x".repeat(200);
        let name = provider
            .build(&FileNameInfo {
                id,
                title: long,
                created_at: OffsetDateTime::UNIX_EPOCH,
            })
            .expect("build");
        let stem = name.trim_end_matches(".json");
        let title_part = stem.split_once('_').expect("separator").1;
        assert_eq!(title_part.len(), 64);
    }

    #[test]
    fn build_requires_id() {
        let err = UuidV7FilenameProvider
            .build(&FileNameInfo {
                id: String::new(),
                title: "t".to_string(),
                created_at: OffsetDateTime::UNIX_EPOCH,
            })
            .expect_err("missing id");
        assert!(matches!(err, MapDbError::Config { .. }));
    }

    #[test]
    fn parse_rejects_non_v7() {
        let v4 = "550e8400-e29b-41d4-a716-446655440000_Title.json";
        let err = UuidV7FilenameProvider.parse(v4).expect_err("not v7");
        assert!(matches!(err, MapDbError::Config { .. }));
    }

    #[test]
    fn time_extractor_feeds_month_partitions() {
        use crate::dirstore::{MonthPartitionProvider, PartitionProvider};

        // 2023-02-01 00:00:00 UTC.
        let id = v7_at(1_675_209_600).to_string();
        let name = UuidV7FilenameProvider
            .build(&FileNameInfo {
                id,
                title: "t".to_string(),
                created_at: OffsetDateTime::UNIX_EPOCH,
            })
            .expect("build");

        let provider = MonthPartitionProvider::new(UuidV7FilenameProvider::time_extractor());
        let partition = provider.partition_dir(&FileKey::new(name)).expect("dir");
        assert_eq!(partition, "202302");
    }
}
