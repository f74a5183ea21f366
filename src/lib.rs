#![deny(clippy::all, clippy::pedantic)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![cfg_attr(test, allow(clippy::uninlined_format_args, clippy::float_cmp))]
#![allow(clippy::module_name_repetitions)]
//
// Strategic lint exceptions - these are allowed project-wide for pragmatic reasons:
//
// Documentation lints: Many internal/self-documenting functions don't need extensive docs.
// Public APIs should still have proper documentation.
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
//
// Cast safety: casts in this codebase are bounded by real-world constraints
// (page sizes, row counts) and reviewed at the call site.
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
//
// Pattern matching: these pedantic lints often suggest changes that reduce clarity.
#![allow(clippy::manual_let_else)]
#![allow(clippy::match_same_arms)]
//
// Style/complexity: pagination and upsert paths naturally run long; breaking
// them up would hurt readability.
#![allow(clippy::too_many_lines)]
#![allow(clippy::similar_names)]
//
// Performance/ergonomics trade-offs that are acceptable for this codebase:
#![allow(clippy::needless_pass_by_value)] // Builders take owned values intentionally
#![allow(clippy::return_self_not_must_use)] // Builder patterns don't need must_use on every method
#![allow(clippy::float_cmp)] // Zero is a sentinel for BM25 weights, not a computed value
#![allow(clippy::struct_excessive_bools)] // Option structs naturally have many flags
//
// Return value wrapping: some operations use Result for API consistency even
// when they currently cannot fail.
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::unused_self)]

//! An embedded, filesystem-backed hierarchical map database.
//!
//! Documents are JSON trees persisted one-per-file with optimistic
//! concurrency control and atomic replace-by-rename. A directory store
//! routes many documents across partition subdirectories and paginates
//! listings with stable continuation tokens. An optional SQLite-FTS5
//! engine maintains a BM25-ranked full-text index with an incremental
//! producer-driven sync protocol.

/// The mapdb crate version (matches `Cargo.toml`).
pub const MAPDB_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod codec;
pub mod constants;
pub mod dirstore;
pub mod docpath;
pub mod error;
pub mod filename;
pub mod filestore;
pub mod fts;
mod pagetoken;

pub use codec::{
    Base64StringCodec, EncoderDecoder, JsonEncoderDecoder, KeyCodecProvider, StringCodec,
    ValueCodecProvider,
};
pub use dirstore::{
    list_dirs, DirStoreOptions, DirStoreOptionsBuilder, FileEntry, FileKey, ListingConfig,
    MapDirectoryStore, MonthPartitionProvider, NoPartitionProvider, PartitionProvider, SortOrder,
    TimeExtractor,
};
pub use error::{MapDbError, Result};
pub use filename::{extract_time_from_uuidv7, FileNameInfo, UuidV7FilenameProvider};
pub use filestore::{
    FileEvent, FileListener, FileStoreOptions, FileStoreOptionsBuilder, MapFileStore, Operation,
};
pub use fts::sync::{sync_dir_to_fts, sync_iter_to_fts, GetPrevCmp, SyncDecision, SyncSource};
pub use fts::{FtsColumn, FtsConfig, FtsEngine, ListRow, SearchHit};
