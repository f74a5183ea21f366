//! Incremental reconciliation of an external dataset against the index.
//!
//! The producer iterates its current dataset and emits one decision per
//! document; the sync layer batches upserts, and deletes index rows the
//! producer no longer claims once the whole pass has proven their absence.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Instant;

use crate::constants::{DEFAULT_SYNC_BATCH_SIZE, SYNC_LIST_PAGE_SIZE};
use crate::error::{MapDbError, Result};
use crate::fts::FtsEngine;

/// Per-document verdict from a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncDecision {
    /// The document should not be indexed; an existing row is deleted at
    /// the end of the pass.
    Skip,
    /// Already indexed at the current comparison value; nothing to write.
    Unchanged { id: String },
    /// Fresh column values and the new comparison value.
    Upsert {
        id: String,
        cmp: String,
        values: BTreeMap<String, String>,
    },
}

/// Read-only lookup into the comparison values currently stored in the
/// index; `None` means "not indexed yet".
pub type GetPrevCmp = dyn Fn(&str) -> Option<String>;

/// A producer over some dataset.
///
/// `scan` must call `emit` exactly once per document the producer
/// currently claims; emitting the same id twice leaves which version wins
/// unspecified. Implemented for closures.
pub trait SyncSource {
    fn scan(
        &mut self,
        get_prev: &GetPrevCmp,
        emit: &mut dyn FnMut(SyncDecision) -> Result<()>,
    ) -> Result<()>;
}

impl<F> SyncSource for F
where
    F: FnMut(&GetPrevCmp, &mut dyn FnMut(SyncDecision) -> Result<()>) -> Result<()>,
{
    fn scan(
        &mut self,
        get_prev: &GetPrevCmp,
        emit: &mut dyn FnMut(SyncDecision) -> Result<()>,
    ) -> Result<()> {
        self(get_prev, emit)
    }
}

/// Reconcile `source` against the index.
///
/// `compare_column` holds each document's version marker (mtime, hash,
/// ...). `belongs` must return true for every index id owned by this
/// producer so that vanished documents can be deleted without trampling
/// ids owned by other producers sharing the same index. A `batch_size` of
/// zero selects the default.
pub fn sync_iter_to_fts(
    engine: &FtsEngine,
    compare_column: &str,
    batch_size: usize,
    mut source: impl SyncSource,
    belongs: impl Fn(&str) -> bool,
) -> Result<()> {
    let batch_size = if batch_size == 0 {
        DEFAULT_SYNC_BATCH_SIZE
    } else {
        batch_size
    };
    let started = Instant::now();
    tracing::info!(compare_column, "fts sync start");

    // Current index state: id -> comparison value.
    let mut existing: HashMap<String, String> = HashMap::new();
    let wanted = vec![compare_column.to_string()];
    let mut token: Option<String> = None;
    loop {
        let (rows, next) = engine.batch_list(
            compare_column,
            &wanted,
            token.as_deref(),
            SYNC_LIST_PAGE_SIZE,
        )?;
        for row in rows {
            let cmp = row.values.get(compare_column).cloned().unwrap_or_default();
            existing.insert(row.id, cmp);
        }
        match next {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    let existing_for_lookup = existing.clone();
    let get_prev = move |id: &str| existing_for_lookup.get(id).cloned();

    let mut seen: HashSet<String> = HashSet::new();
    let mut pending: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut processed = 0usize;
    let mut skipped = 0usize;
    let mut unchanged = 0usize;
    let mut upserted = 0usize;

    {
        let mut emit = |decision: SyncDecision| -> Result<()> {
            let (id, update) = match decision {
                SyncDecision::Skip => {
                    skipped += 1;
                    return Ok(());
                }
                SyncDecision::Unchanged { id } => (id, None),
                SyncDecision::Upsert { id, cmp, values } => (id, Some((cmp, values))),
            };
            if id.is_empty() {
                skipped += 1;
                return Ok(());
            }
            seen.insert(id.clone());
            processed += 1;

            let Some((cmp, mut values)) = update else {
                unchanged += 1;
                return Ok(());
            };
            values.insert(compare_column.to_string(), cmp);
            pending.insert(id, values);

            if pending.len() >= batch_size {
                let batch = std::mem::take(&mut pending);
                upserted += batch.len();
                engine.batch_upsert(&batch)?;
            }
            Ok(())
        };
        source.scan(&get_prev, &mut emit)?;
    }

    if !pending.is_empty() {
        upserted += pending.len();
        engine.batch_upsert(&pending)?;
    }

    // Deletion is deferred until after the whole pass so that a document's
    // absence is proven before its row is removed.
    let to_delete: Vec<String> = existing
        .keys()
        .filter(|id| belongs(id) && !seen.contains(*id))
        .cloned()
        .collect();
    if !to_delete.is_empty() {
        engine.batch_delete(&to_delete)?;
    }

    tracing::info!(
        took_ms = started.elapsed().as_millis() as u64,
        processed,
        upserted,
        unchanged,
        skipped,
        deleted = to_delete.len(),
        "fts sync done"
    );
    Ok(())
}

/// Walk every file under `base_dir` (recursively, in lexical order) and
/// reconcile the index against the decisions of `process_file`.
///
/// A row belongs to this dataset when its id starts with the base
/// directory's string form; producers using this wrapper should emit ids
/// derived from the full file path.
pub fn sync_dir_to_fts<F>(
    engine: &FtsEngine,
    base_dir: &Path,
    compare_column: &str,
    batch_size: usize,
    mut process_file: F,
) -> Result<()>
where
    F: FnMut(&Path, &Path, &GetPrevCmp) -> Result<SyncDecision>,
{
    let base = base_dir.to_path_buf();
    let prefix = base.to_string_lossy().into_owned();

    let source = |get_prev: &GetPrevCmp,
                  emit: &mut dyn FnMut(SyncDecision) -> Result<()>|
     -> Result<()> {
        walk_files(&base, &mut |path| {
            let decision = process_file(&base, path, get_prev)?;
            emit(decision)
        })
    };

    sync_iter_to_fts(engine, compare_column, batch_size, source, |id| {
        id.starts_with(&prefix)
    })
}

fn walk_files(dir: &Path, visit: &mut dyn FnMut(&Path) -> Result<()>) -> Result<()> {
    let read = fs::read_dir(dir).map_err(|err| {
        MapDbError::storage(format!("failed to read directory {}", dir.display()), err)
    })?;
    let mut paths: Vec<_> = Vec::new();
    for entry in read {
        let entry = entry.map_err(|err| {
            MapDbError::storage(format!("failed to read entry in {}", dir.display()), err)
        })?;
        paths.push(entry.path());
    }
    paths.sort();
    for path in paths {
        if path.is_dir() {
            walk_files(&path, visit)?;
        } else {
            visit(&path)?;
        }
    }
    Ok(())
}
