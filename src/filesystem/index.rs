//! Durable search index backed by SQLite.
//!
//! One row per (storage, path). A storage's rows are only ever replaced
//! wholesale inside a transaction, so readers see either the previous
//! snapshot or the new one.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};

use crate::protocol::{FileEntry, SearchPage, StorageError, StorageResult};

/// Group name whose count is derived from the other groups
pub const OTHERS_GROUP: &str = "others";

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

const SELECT_COLUMNS: &str = "name, path, is_dir, size, modified, extension, item_count";

pub struct IndexStore {
    conn: Mutex<Connection>,
    hidden_prefixes: Vec<char>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub storage: String,
    pub extensions: Vec<String>,
    pub limit: i64,
    pub offset: i64,
    /// Only files modified within this many days; 0 or less disables it
    pub days: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildStats {
    pub inserted: u64,
    pub skipped: u64,
}

impl IndexStore {
    /// Open (or create) the index file. `hidden_prefixes` are the leading
    /// characters that keep a name out of search results.
    pub fn open(path: &Path, hidden_prefixes: Vec<char>) -> StorageResult<Self> {
        let conn = Connection::open(path).map_err(|e| StorageError::IndexUnavailable {
            message: format!("failed to open {}: {}", path.display(), e),
        })?;
        Self::with_connection(conn, hidden_prefixes)
    }

    pub fn open_in_memory(hidden_prefixes: Vec<char>) -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, hidden_prefixes)
    }

    fn with_connection(conn: Connection, hidden_prefixes: Vec<char>) -> StorageResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            hidden_prefixes,
        })
    }

    fn connection(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::IndexUnavailable {
            message: "index connection poisoned".to_string(),
        })
    }

    /// Replace every row of `storage` with `entries` in one transaction.
    ///
    /// A row that cannot be stored is logged and skipped; any other failure,
    /// including one that makes SQLite abort the transaction mid-insert,
    /// rolls the whole rebuild back and leaves the previous rows in place.
    pub fn rebuild(&self, storage: &str, entries: &[FileEntry]) -> StorageResult<RebuildStats> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let mut stats = RebuildStats::default();

        tx.execute("DELETE FROM files WHERE storage = ?1", params![storage])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO files (storage, name, path, is_dir, size, modified, extension, item_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for entry in entries {
                let (Ok(size), Ok(item_count)) =
                    (i64::try_from(entry.size), i64::try_from(entry.item_count))
                else {
                    tracing::warn!("Skipping {} in {} index: size out of range", entry.path, storage);
                    stats.skipped += 1;
                    continue;
                };
                let extension = entry.extension.trim_start_matches('.').to_lowercase();
                match stmt.execute(params![
                    storage,
                    entry.name,
                    entry.path,
                    entry.is_directory,
                    size,
                    entry.modified,
                    extension,
                    item_count,
                ]) {
                    Ok(_) => stats.inserted += 1,
                    Err(e) if tx.is_autocommit() => {
                        // SQLite already rolled the transaction back
                        tracing::warn!("Rebuild of {} index aborted at {}: {}", storage, entry.path, e);
                        return Err(e.into());
                    }
                    Err(e) => {
                        tracing::warn!("Skipping {} in {} index: {}", entry.path, storage, e);
                        stats.skipped += 1;
                    }
                }
            }
        }
        tx.commit()?;

        Ok(stats)
    }

    pub fn search(&self, query: &SearchQuery) -> StorageResult<SearchPage> {
        self.search_at(query, Utc::now())
    }

    /// [`IndexStore::search`] with an explicit "now" for the day window
    pub fn search_at(&self, query: &SearchQuery, now: DateTime<Utc>) -> StorageResult<SearchPage> {
        let (predicate, args) = self.file_predicate(
            &query.storage,
            &normalize_extensions(&query.extensions),
            query.days,
            now,
        );
        let conn = self.connection()?;

        let total = count_matching(&conn, &predicate, &args)?;

        // limit and offset both unset: the caller only wants the count
        if query.limit <= 0 && query.offset <= 0 {
            return Ok(SearchPage {
                files: Vec::new(),
                total,
            });
        }

        let files = select_page(&conn, &predicate, args, query.limit, query.offset)?;
        Ok(SearchPage { files, total })
    }

    /// Most recently modified files, newest first
    pub fn recent(&self, storage: &str, limit: i64, offset: i64) -> StorageResult<Vec<FileEntry>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let (predicate, args) = self.file_predicate(storage, &[], 0, Utc::now());
        let conn = self.connection()?;
        select_page(&conn, &predicate, args, limit, offset)
    }

    /// File counts per extension group.
    ///
    /// A group named `others` (if present) receives the files not counted by
    /// any other group, never less than zero. Groups with no extensions
    /// count nothing.
    pub fn stats(
        &self,
        storage: &str,
        groups: &BTreeMap<String, Vec<String>>,
    ) -> StorageResult<BTreeMap<String, u64>> {
        let now = Utc::now();
        let conn = self.connection()?;
        let mut counts = BTreeMap::new();
        let mut known: u64 = 0;

        for (group, extensions) in groups {
            if group == OTHERS_GROUP {
                continue;
            }
            let extensions = normalize_extensions(extensions);
            let count = if extensions.is_empty() {
                0
            } else {
                let (predicate, args) = self.file_predicate(storage, &extensions, 0, now);
                count_matching(&conn, &predicate, &args)?
            };
            known += count;
            counts.insert(group.clone(), count);
        }

        if groups.contains_key(OTHERS_GROUP) {
            let (predicate, args) = self.file_predicate(storage, &[], 0, now);
            let total = count_matching(&conn, &predicate, &args)?;
            counts.insert(OTHERS_GROUP.to_string(), total.saturating_sub(known));
        }

        Ok(counts)
    }

    /// All rows of a storage, directories included
    pub fn row_count(&self, storage: &str) -> StorageResult<u64> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM files WHERE storage = ?1",
            params![storage],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// The WHERE clause shared by count and page queries: visible
    /// non-directory files of one storage, optionally narrowed by
    /// extension and modification window.
    fn file_predicate(
        &self,
        storage: &str,
        extensions: &[String],
        days: i64,
        now: DateTime<Utc>,
    ) -> (String, Vec<Value>) {
        let mut clauses = vec!["storage = ?".to_string(), "is_dir = 0".to_string()];
        let mut args = vec![Value::Text(storage.to_string())];

        if !self.hidden_prefixes.is_empty() {
            let placeholders = vec!["?"; self.hidden_prefixes.len()].join(", ");
            clauses.push(format!("substr(name, 1, 1) NOT IN ({})", placeholders));
            args.extend(self.hidden_prefixes.iter().map(|c| Value::Text(c.to_string())));
        }

        if !extensions.is_empty() {
            let placeholders = vec!["?"; extensions.len()].join(", ");
            clauses.push(format!("extension IN ({})", placeholders));
            args.extend(extensions.iter().cloned().map(Value::Text));
        }

        if days > 0 {
            let cutoff = now.timestamp_millis() - days.saturating_mul(MS_PER_DAY);
            clauses.push("modified > ?".to_string());
            args.push(Value::Integer(cutoff));
        }

        (clauses.join(" AND "), args)
    }
}

fn init_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 5000;

        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            storage TEXT NOT NULL,
            name TEXT NOT NULL,
            path TEXT NOT NULL,
            is_dir INTEGER NOT NULL,
            size INTEGER NOT NULL,
            modified INTEGER NOT NULL,
            extension TEXT NOT NULL DEFAULT '',
            item_count INTEGER NOT NULL DEFAULT 0
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_path_storage ON files(storage, path);
        CREATE INDEX IF NOT EXISTS idx_storage ON files(storage);
        CREATE INDEX IF NOT EXISTS idx_extension ON files(extension);
        CREATE INDEX IF NOT EXISTS idx_modified ON files(modified);
        CREATE INDEX IF NOT EXISTS idx_is_dir ON files(is_dir);
        CREATE INDEX IF NOT EXISTS idx_storage_ext_mod ON files(storage, extension, modified);
        CREATE INDEX IF NOT EXISTS idx_storage_isdir ON files(storage, is_dir);
        ",
    )?;
    Ok(())
}

fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = extensions
        .iter()
        .map(|e| e.trim().trim_start_matches('.').to_lowercase())
        .filter(|e| !e.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized
}

fn count_matching(conn: &Connection, predicate: &str, args: &[Value]) -> StorageResult<u64> {
    let sql = format!("SELECT COUNT(*) FROM files WHERE {}", predicate);
    let count: i64 = conn.query_row(&sql, params_from_iter(args.iter()), |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

fn select_page(
    conn: &Connection,
    predicate: &str,
    mut args: Vec<Value>,
    limit: i64,
    offset: i64,
) -> StorageResult<Vec<FileEntry>> {
    let sql = format!(
        "SELECT {} FROM files WHERE {} ORDER BY modified DESC, path ASC LIMIT ? OFFSET ?",
        SELECT_COLUMNS, predicate
    );
    // SQLite reads a negative LIMIT as "no limit"
    args.push(Value::Integer(if limit > 0 { limit } else { -1 }));
    args.push(Value::Integer(offset.max(0)));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
        let size: i64 = row.get(3)?;
        let item_count: i64 = row.get(6)?;
        Ok(FileEntry {
            name: row.get(0)?,
            path: row.get(1)?,
            is_directory: row.get(2)?,
            size: size.max(0) as u64,
            modified: row.get(4)?,
            extension: row.get(5)?,
            item_count: item_count.max(0) as u64,
            mode: None,
        })
    })?;

    let mut files = Vec::new();
    for row in rows {
        match row {
            Ok(entry) => files.push(entry),
            Err(e) => tracing::debug!("Skipping unreadable index row: {}", e),
        }
    }
    Ok(files)
}
