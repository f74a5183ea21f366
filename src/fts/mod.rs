//! Schema-checksum-managed full-text index on SQLite FTS5.
//!
//! One virtual table per engine: an unindexed external-id column followed
//! by the configured columns. A sibling `meta` table stores the schema
//! checksum; a mismatch on open drops and recreates the table before first
//! use. Writes are serialized by a mutex over the writer connection;
//! reads go through an independent reader connection, bounding open
//! handles at two.

pub mod sync;

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::{
    COL_EXTERNAL_ID, COL_ROWID, DEFAULT_LIST_PAGE_SIZE, DEFAULT_SEARCH_PAGE_SIZE,
    MAX_FTS_PAGE_SIZE, MAX_SQL_VARS, MEMORY_DB_BASE_DIR, SQLITE_BUSY_TIMEOUT_MS,
    TOKENIZER_OPTIONS,
};
use crate::error::{MapDbError, Result};
use crate::pagetoken;

/// One FTS5 column declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FtsColumn {
    /// SQL identifier.
    pub name: String,
    /// Stored but not tokenized.
    pub unindexed: bool,
    /// BM25 weight; `0` is treated as `1`.
    pub weight: f64,
}

impl FtsColumn {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        FtsColumn {
            name: name.into(),
            unindexed: false,
            weight: 0.0,
        }
    }

    #[must_use]
    pub fn unindexed(mut self, unindexed: bool) -> Self {
        self.unindexed = unindexed;
        self
    }

    #[must_use]
    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// Engine configuration.
///
/// `base_dir` of `":memory:"` with an empty `db_file_name` selects an
/// ephemeral in-memory database; otherwise the database lives at
/// `<base_dir>/<db_file_name>`.
#[derive(Debug, Clone)]
pub struct FtsConfig {
    pub base_dir: PathBuf,
    pub db_file_name: String,
    pub table: String,
    pub columns: Vec<FtsColumn>,
}

/// One row returned by [`FtsEngine::batch_list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRow {
    pub id: String,
    pub values: BTreeMap<String, String>,
}

/// One hit returned by [`FtsEngine::search`], ordered by BM25 ascending
/// (lower is a better match).
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ListToken {
    #[serde(rename = "c", default)]
    cmp: String,
    #[serde(rename = "r", default)]
    rowid: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SearchToken {
    #[serde(rename = "q", default)]
    query: String,
    #[serde(rename = "o", default)]
    offset: usize,
}

/// Distinguishes concurrently opened in-memory databases.
static MEMORY_DB_SEQ: AtomicU64 = AtomicU64::new(0);

/// A full-text index over externally identified string documents.
pub struct FtsEngine {
    cfg: FtsConfig,
    checksum: String,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl FtsEngine {
    /// Open (or create) the index described by `cfg`, rebuilding the
    /// virtual table when the stored schema checksum differs.
    pub fn open(cfg: FtsConfig) -> Result<Self> {
        validate_config(&cfg)?;
        let checksum = schema_checksum(&cfg)?;

        let in_memory = cfg.base_dir == Path::new(MEMORY_DB_BASE_DIR);
        let (writer, reader, db_label) = if in_memory {
            // A private shared-cache database: both connections must
            // observe the same store, which plain `:memory:` opens do not.
            let name = format!(
                "file:mapdb-fts-{}?mode=memory&cache=shared",
                MEMORY_DB_SEQ.fetch_add(1, Ordering::Relaxed)
            );
            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            let writer = Connection::open_with_flags(&name, flags)?;
            let reader = Connection::open_with_flags(&name, flags)?;
            (writer, reader, name)
        } else {
            fs::create_dir_all(&cfg.base_dir).map_err(|err| {
                MapDbError::storage(
                    format!("failed to create directory {}", cfg.base_dir.display()),
                    err,
                )
            })?;
            let path = cfg.base_dir.join(&cfg.db_file_name);
            let writer = Connection::open(&path)?;
            let reader = Connection::open(&path)?;
            for conn in [&writer, &reader] {
                conn.busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS))?;
                let _mode: String =
                    conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
            }
            (writer, reader, path.display().to_string())
        };

        tracing::info!(db = %db_label, table = %cfg.table, "fts engine bootstrap");

        let engine = FtsEngine {
            cfg,
            checksum,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        };
        engine.bootstrap()?;
        Ok(engine)
    }

    /// Insert a document, or replace the existing one with the same id
    /// while preserving its row-id.
    pub fn upsert(&self, id: &str, values: &BTreeMap<String, String>) -> Result<()> {
        let conn = self.lock_writer();
        internal_upsert(&conn, &self.cfg, id, values, None)
    }

    /// Upsert all documents inside one transaction; either the whole batch
    /// commits or none of it does. Existing row-ids are looked up in one
    /// probe and preserved.
    pub fn batch_upsert(&self, docs: &BTreeMap<String, BTreeMap<String, String>>) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock_writer();
        let tx = conn.transaction()?;
        let ids: Vec<&str> = docs.keys().map(String::as_str).collect();
        let existing = lookup_row_ids(&tx, &self.cfg, &ids)?;
        for (id, values) in docs {
            internal_upsert(&tx, &self.cfg, id, values, existing.get(id.as_str()).copied())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Remove the document with the given id; absent ids are a no-op.
    pub fn delete(&self, id: &str) -> Result<()> {
        let conn = self.lock_writer();
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE {COL_EXTERNAL_ID}=?1",
                quote_ident(&self.cfg.table)
            ),
            params![id],
        )?;
        Ok(())
    }

    /// Remove many documents, chunked below SQLite's bound-parameter cap.
    /// Each chunk is atomic; the whole call is not.
    pub fn batch_delete(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.lock_writer();
        for chunk in ids.chunks(MAX_SQL_VARS) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            conn.execute(
                &format!(
                    "DELETE FROM {} WHERE {COL_EXTERNAL_ID} IN ({placeholders})",
                    quote_ident(&self.cfg.table)
                ),
                params_from_iter(chunk.iter()),
            )?;
        }
        Ok(())
    }

    /// True iff the index holds no rows.
    pub fn is_empty(&self) -> Result<bool> {
        let conn = self.lock_reader();
        let n: i64 = conn.query_row(
            &format!("SELECT count(*) FROM {}", quote_ident(&self.cfg.table)),
            [],
            |row| row.get(0),
        )?;
        Ok(n == 0)
    }

    /// Page over the whole table ordered by `(compare_column, rowid)`.
    ///
    /// An empty `compare_column` (or `"rowid"`) orders by row-id alone.
    /// Empty `wanted_cols` selects all configured columns. The token
    /// resumes with a strict-greater predicate on the last seen pair, so
    /// rows inserted behind the cursor are never revisited. Page size is
    /// clamped to `[1, 10000]`, default 1000.
    pub fn batch_list(
        &self,
        compare_column: &str,
        wanted_cols: &[String],
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<(Vec<ListRow>, Option<String>)> {
        let page_size = if page_size == 0 {
            DEFAULT_LIST_PAGE_SIZE
        } else {
            page_size.min(MAX_FTS_PAGE_SIZE)
        };

        let col_exists = |name: &str| self.cfg.columns.iter().any(|c| c.name == name);
        let wanted: Vec<String> = if wanted_cols.is_empty() {
            self.cfg.columns.iter().map(|c| c.name.clone()).collect()
        } else {
            for name in wanted_cols {
                if !col_exists(name) {
                    return Err(MapDbError::Config {
                        reason: format!("unknown column {name:?}"),
                    });
                }
            }
            wanted_cols.to_vec()
        };

        let compare_column = if compare_column.is_empty() {
            COL_ROWID
        } else {
            compare_column
        };
        if compare_column != COL_ROWID && !col_exists(compare_column) {
            return Err(MapDbError::Config {
                reason: format!("unknown compare column {compare_column:?}"),
            });
        }
        let by_rowid = compare_column == COL_ROWID;

        let (mut last_cmp, mut last_rid) = match page_token {
            Some(raw) => {
                let token: ListToken = pagetoken::decode_token(raw)?;
                (token.cmp, token.rowid)
            }
            None => (String::new(), 0),
        };

        let mut select_cols: Vec<String> = vec![COL_ROWID.to_string(), COL_EXTERNAL_ID.to_string()];
        if !by_rowid {
            select_cols.push(quote_ident(compare_column));
        }
        for name in &wanted {
            if name != compare_column {
                select_cols.push(quote_ident(name));
            }
        }

        let mut binds: Vec<rusqlite::types::Value> = Vec::new();
        let where_clause = if by_rowid {
            binds.push(rusqlite::types::Value::Integer(last_rid));
            format!("{COL_ROWID}>?")
        } else {
            let cmp = quote_ident(compare_column);
            binds.push(rusqlite::types::Value::Text(last_cmp.clone()));
            binds.push(rusqlite::types::Value::Text(last_cmp.clone()));
            binds.push(rusqlite::types::Value::Integer(last_rid));
            format!("({cmp}>? OR ({cmp}=? AND {COL_ROWID}>?))")
        };
        // One extra row tells us whether more data exists.
        binds.push(rusqlite::types::Value::Integer(page_size as i64 + 1));

        let order_col = if by_rowid {
            COL_ROWID.to_string()
        } else {
            quote_ident(compare_column)
        };
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {},{} LIMIT ?",
            select_cols.join(","),
            quote_ident(&self.cfg.table),
            where_clause,
            order_col,
            COL_ROWID,
        );

        let mut conn = self.lock_reader();
        let tx = conn.transaction()?;
        let mut out: Vec<ListRow> = Vec::new();
        let mut have_more = false;
        {
            let mut stmt = tx.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(binds))?;
            while let Some(row) = rows.next()? {
                if out.len() == page_size {
                    have_more = true;
                    break;
                }
                let rid: i64 = row.get(0)?;
                let id: String = row.get(1)?;
                let mut idx = 2;
                let cmp_val: Option<String> = if by_rowid {
                    None
                } else {
                    let v: Option<String> = row.get(idx)?;
                    idx += 1;
                    v
                };
                let mut values = BTreeMap::new();
                for name in &wanted {
                    if name == compare_column {
                        if let Some(v) = &cmp_val {
                            values.insert(name.clone(), v.clone());
                        }
                    } else {
                        let v: Option<String> = row.get(idx)?;
                        idx += 1;
                        if let Some(v) = v {
                            values.insert(name.clone(), v);
                        }
                    }
                }
                last_rid = rid;
                if let Some(v) = cmp_val {
                    last_cmp = v;
                }
                out.push(ListRow { id, values });
            }
        }
        tx.commit()?;

        let next = if have_more {
            Some(pagetoken::encode_token(&ListToken {
                cmp: last_cmp,
                rowid: last_rid,
            })?)
        } else {
            None
        };
        Ok((out, next))
    }

    /// BM25-ranked search over a free-form literal (not a raw FTS5
    /// expression).
    ///
    /// The literal is sanitized into quoted OR-combined tokens; a query
    /// that sanitizes to nothing yields an empty page. The continuation
    /// token carries `(query, offset)` and resets to the first page when
    /// the query changes; a malformed token restarts from the top rather
    /// than erroring, since queries are user-provided. Page size is
    /// clamped to `[1, 10000]`, default 10.
    pub fn search(
        &self,
        query: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<(Vec<SearchHit>, Option<String>)> {
        if query.is_empty() {
            return Err(MapDbError::Config {
                reason: "empty search query".to_string(),
            });
        }
        let page_size = if page_size == 0 {
            DEFAULT_SEARCH_PAGE_SIZE
        } else {
            page_size.min(MAX_FTS_PAGE_SIZE)
        };

        let mut offset: usize = 0;
        if let Some(raw) = page_token {
            if let Ok(token) = pagetoken::decode_token::<SearchToken>(raw) {
                if token.query == query {
                    offset = token.offset;
                }
            }
        }

        let cleaned = clean_query_with_or(query);
        if cleaned.is_empty() {
            return Ok((Vec::new(), None));
        }

        let table = quote_ident(&self.cfg.table);
        let weight_params = ",?".repeat(self.cfg.columns.len());
        let sql = format!(
            "SELECT {COL_EXTERNAL_ID}, bm25({table}{weight_params}) AS s \
             FROM {table} WHERE {table} MATCH ? \
             ORDER BY s ASC, {COL_ROWID} LIMIT ? OFFSET ?"
        );

        let mut binds: Vec<rusqlite::types::Value> = self
            .cfg
            .columns
            .iter()
            .map(|c| {
                rusqlite::types::Value::Real(if c.weight == 0.0 { 1.0 } else { c.weight })
            })
            .collect();
        binds.push(rusqlite::types::Value::Text(cleaned));
        binds.push(rusqlite::types::Value::Integer(page_size as i64));
        binds.push(rusqlite::types::Value::Integer(offset as i64));

        let conn = self.lock_reader();
        let mut stmt = conn.prepare(&sql)?;
        let hits = stmt
            .query_map(params_from_iter(binds), |row| {
                Ok(SearchHit {
                    id: row.get(0)?,
                    score: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let next = if hits.len() == page_size {
            Some(pagetoken::encode_token(&SearchToken {
                query: query.to_string(),
                offset: offset + page_size,
            })?)
        } else {
            None
        };
        Ok((hits, next))
    }

    /// Release the database handles.
    pub fn close(self) -> Result<()> {
        let FtsEngine { writer, reader, .. } = self;
        for conn in [writer, reader] {
            conn.into_inner()
                .unwrap_or_else(PoisonError::into_inner)
                .close()
                .map_err(|(_, err)| MapDbError::Sqlite(err))?;
        }
        Ok(())
    }

    /// Verify the stored schema checksum; on mismatch drop all previous
    /// rows and recreate the virtual table for the current column set.
    fn bootstrap(&self) -> Result<()> {
        let conn = self.lock_writer();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS meta(k TEXT PRIMARY KEY, v TEXT)",
            [],
        )?;
        let stored: Option<String> = conn
            .query_row("SELECT v FROM meta WHERE k='h'", [], |row| row.get(0))
            .optional()?;
        if stored.as_deref() == Some(self.checksum.as_str()) {
            return Ok(());
        }

        if let Some(previous) = &stored {
            tracing::info!(
                previous = %previous,
                current = %self.checksum,
                table = %self.cfg.table,
                "fts schema checksum changed, rebuilding index"
            );
            // Best effort; the table may not exist anymore.
            let _ = conn.execute(
                &format!("DELETE FROM {}", quote_ident(&self.cfg.table)),
                [],
            );
        }
        conn.execute(
            &format!("DROP TABLE IF EXISTS {}", quote_ident(&self.cfg.table)),
            [],
        )?;

        let mut cols = vec![format!("{COL_EXTERNAL_ID} UNINDEXED")];
        for column in &self.cfg.columns {
            let mut decl = quote_ident(&column.name);
            if column.unindexed {
                decl.push_str(" UNINDEXED");
            }
            cols.push(decl);
        }
        let ddl = format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING fts5 ({}, tokenize='{TOKENIZER_OPTIONS}')",
            quote_ident(&self.cfg.table),
            cols.join(","),
        );
        conn.execute(&ddl, [])?;
        conn.execute(
            "INSERT OR REPLACE INTO meta(k,v) VALUES('h', ?1)",
            params![self.checksum],
        )?;
        Ok(())
    }

    fn lock_writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_reader(&self) -> MutexGuard<'_, Connection> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for FtsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtsEngine")
            .field("table", &self.cfg.table)
            .field("checksum", &self.checksum)
            .finish_non_exhaustive()
    }
}

/// Shared by `upsert` and `batch_upsert`; `known_rowid` lets the batch
/// path skip the per-document probe.
fn internal_upsert(
    conn: &Connection,
    cfg: &FtsConfig,
    id: &str,
    values: &BTreeMap<String, String>,
    known_rowid: Option<i64>,
) -> Result<()> {
    if id.is_empty() {
        return Err(MapDbError::Config {
            reason: "empty document id".to_string(),
        });
    }

    let table = quote_ident(&cfg.table);
    let rowid: Option<i64> = match known_rowid {
        Some(rid) => Some(rid),
        None => conn
            .query_row(
                &format!("SELECT {COL_ROWID} FROM {table} WHERE {COL_EXTERNAL_ID}=?1"),
                params![id],
                |row| row.get(0),
            )
            .optional()?,
    };

    let mut col_names = vec![COL_EXTERNAL_ID.to_string()];
    let mut binds: Vec<rusqlite::types::Value> =
        vec![rusqlite::types::Value::Text(id.to_string())];
    for column in &cfg.columns {
        col_names.push(quote_ident(&column.name));
        // Unknown keys in `values` are ignored; missing columns default to
        // the empty string.
        binds.push(rusqlite::types::Value::Text(
            values.get(&column.name).cloned().unwrap_or_default(),
        ));
    }

    let sql = match rowid {
        Some(rid) => {
            col_names.insert(0, COL_ROWID.to_string());
            binds.insert(0, rusqlite::types::Value::Integer(rid));
            format!(
                "INSERT OR REPLACE INTO {table} ({}) VALUES ({})",
                col_names.join(","),
                vec!["?"; col_names.len()].join(","),
            )
        }
        None => format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            col_names.join(","),
            vec!["?"; col_names.len()].join(","),
        ),
    };

    conn.execute(&sql, params_from_iter(binds))?;
    Ok(())
}

/// Resolve external ids to row-ids, chunked below the bound-parameter cap.
fn lookup_row_ids(
    conn: &Connection,
    cfg: &FtsConfig,
    ids: &[&str],
) -> Result<HashMap<String, i64>> {
    let table = quote_ident(&cfg.table);
    let mut out = HashMap::with_capacity(ids.len());
    for chunk in ids.chunks(MAX_SQL_VARS) {
        let placeholders = vec!["?"; chunk.len()].join(",");
        let sql = format!(
            "SELECT {COL_EXTERNAL_ID},{COL_ROWID} FROM {table} \
             WHERE {COL_EXTERNAL_ID} IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(chunk.iter()))?;
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let rid: i64 = row.get(1)?;
            out.insert(id, rid);
        }
    }
    Ok(out)
}

fn validate_config(cfg: &FtsConfig) -> Result<()> {
    let config = |reason: String| MapDbError::Config { reason };
    if cfg.columns.is_empty() {
        return Err(config("need at least one fts column".to_string()));
    }
    if cfg.base_dir.as_os_str().is_empty() {
        return Err(config("fts base dir must not be empty".to_string()));
    }
    let in_memory = cfg.base_dir == Path::new(MEMORY_DB_BASE_DIR);
    if in_memory && !cfg.db_file_name.is_empty() {
        return Err(config(
            "db file name must be empty for an in-memory database".to_string(),
        ));
    }
    if !in_memory && cfg.db_file_name.is_empty() {
        return Err(config("db file name must not be empty".to_string()));
    }
    if cfg.table.trim().is_empty() {
        return Err(config("empty table name".to_string()));
    }
    let mut seen = std::collections::HashSet::new();
    for column in &cfg.columns {
        if column.name.trim().is_empty() {
            return Err(config("column with empty name".to_string()));
        }
        if !seen.insert(column.name.as_str()) {
            return Err(config(format!("duplicate column {:?}", column.name)));
        }
    }
    Ok(())
}

/// Hex SHA-256 over the tokenizer options and the JSON encoding of the
/// table and column set. Changing any of them rebuilds the index.
fn schema_checksum(cfg: &FtsConfig) -> Result<String> {
    #[derive(Serialize)]
    struct SchemaInput<'a> {
        table: &'a str,
        columns: &'a [FtsColumn],
    }
    let mut hasher = Sha256::new();
    hasher.update(TOKENIZER_OPTIONS.as_bytes());
    hasher.update(serde_json::to_vec(&SchemaInput {
        table: &cfg.table,
        columns: &cfg.columns,
    })?);
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}

/// Double-quote an SQL identifier, escaping embedded quotes.
fn quote_ident(id: &str) -> String {
    format!("\"{}\"", id.replace('"', "\"\""))
}

/// Convert a raw literal into `"a" OR "b" OR "c"`.
///
/// Tokens are maximal alphanumeric runs; single-character tokens are
/// dropped unless they are digits, and duplicates collapse. Quoting keeps
/// FTS5 operator characters inert. Returns the empty string when nothing
/// searchable remains.
fn clean_query_with_or(query: &str) -> String {
    let mut tokens: Vec<String> = Vec::new();
    let mut buf = String::new();
    for ch in query.chars() {
        if ch.is_alphanumeric() {
            buf.push(ch);
        } else if !buf.is_empty() {
            tokens.push(std::mem::take(&mut buf));
        }
    }
    if !buf.is_empty() {
        tokens.push(buf);
    }

    let mut seen = std::collections::HashSet::new();
    let mut out: Vec<String> = Vec::new();
    for token in tokens {
        if token.len() == 1 && !token.as_bytes()[0].is_ascii_digit() {
            continue;
        }
        if seen.insert(token.clone()) {
            out.push(format!("\"{token}\""));
        }
    }
    out.join(" OR ")
}
