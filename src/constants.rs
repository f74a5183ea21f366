//! Shared constants for stores, pagination and the full-text engine.

/// FTS5 tokenizer configuration. Part of the schema checksum input, so
/// changing it triggers a one-time index rebuild.
pub const TOKENIZER_OPTIONS: &str = "porter unicode61 remove_diacritics 1";

/// Sentinel base directory selecting an in-memory full-text database.
pub const MEMORY_DB_BASE_DIR: &str = ":memory:";

/// Name of the implicit external-id column in every FTS table.
pub const COL_EXTERNAL_ID: &str = "externalid";

/// SQLite's implicit integer row-id column.
pub const COL_ROWID: &str = "rowid";

/// Conservative cap on bound parameters per SQL statement.
pub const MAX_SQL_VARS: usize = 999;

/// Busy timeout applied to every file-backed SQLite connection.
pub const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// How many times `set_all` retries after an OCC conflict before giving up.
pub const MAX_SET_ALL_RETRIES: usize = 3;

/// Default page size for directory-store file listings.
pub const DEFAULT_DIR_PAGE_SIZE: usize = 10;

/// Default and maximum page sizes for `FtsEngine::batch_list`.
pub const DEFAULT_LIST_PAGE_SIZE: usize = 1_000;
pub const MAX_FTS_PAGE_SIZE: usize = 10_000;

/// Default page size for `FtsEngine::search`.
pub const DEFAULT_SEARCH_PAGE_SIZE: usize = 10;

/// Page size used internally when the sync protocol prefetches index state.
pub const SYNC_LIST_PAGE_SIZE: usize = 10_000;

/// Default batch size for sync upsert transactions.
pub const DEFAULT_SYNC_BATCH_SIZE: usize = 1_000;
