//! SQLite-backed cache store.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params, params_from_iter};
use tracing::{debug, info, warn};

use dustpan_core::{DirMtime, EngineConfig, PathKey};

use crate::entry::{SizeEntry, size_from_sql, size_to_sql, time_from_sql};
use crate::error::{CacheError, Result, SqlContext};

/// Version recorded in `PRAGMA user_version`; a mismatch recreates the tables.
pub const SCHEMA_VERSION: i32 = 2;

/// Read connections kept open by [`CacheStore::open`].
pub const DEFAULT_READERS: usize = 4;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const UPSERT: &str = "INSERT INTO directory_sizes
        (path, size_bytes, mtime, computed_at, file_count, dir_count)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
     ON CONFLICT(path) DO UPDATE SET
        size_bytes = excluded.size_bytes,
        mtime = excluded.mtime,
        computed_at = excluded.computed_at,
        file_count = excluded.file_count,
        dir_count = excluded.dir_count";

/// Persistent map from directory key to its last computed size.
///
/// Every write goes through one writer connection behind a lock, so writes
/// are serialized and each upsert is atomic with respect to readers. Reads
/// borrow a connection from a small pool and run concurrently under WAL.
pub struct CacheStore {
    path: PathBuf,
    writer: Mutex<Option<Connection>>,
    readers: Mutex<Vec<Connection>>,
    reader_slots: usize,
    closed: AtomicBool,
}

impl CacheStore {
    /// Open (or create) the database at `path`.
    ///
    /// A corrupt or unreadable file is deleted and recreated empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_readers(path, DEFAULT_READERS)
    }

    /// Open the database at the per-user default location.
    pub fn open_default() -> Result<Self> {
        let path = EngineConfig::default_cache_path().ok_or(CacheError::NoDataDir)?;
        Self::open(path)
    }

    /// Open the store configured by `config`.
    pub fn open_configured(config: &EngineConfig) -> Result<Self> {
        let path = match &config.cache_path {
            Some(path) => path.clone(),
            None => EngineConfig::default_cache_path().ok_or(CacheError::NoDataDir)?,
        };
        Self::open_with_readers(path, config.read_connections)
    }

    /// Open with a specific number of pooled read connections.
    pub fn open_with_readers(path: impl AsRef<Path>, readers: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| CacheError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let writer = match open_writer(&path) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cache database unusable, recreating");
                remove_database_files(&path)?;
                open_writer(&path).map_err(|e| CacheError::Unrecoverable {
                    path: path.clone(),
                    details: e.to_string(),
                })?
            }
        };

        info!(path = %path.display(), "opened cache store");

        Ok(Self {
            path,
            writer: Mutex::new(Some(writer)),
            readers: Mutex::new(Vec::with_capacity(readers)),
            reader_slots: readers.max(1),
            closed: AtomicBool::new(false),
        })
    }

    /// Path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Look up the entry for `key`. Failures read as a miss.
    pub fn get(&self, key: &PathKey) -> Option<SizeEntry> {
        match self.try_get(key) {
            Ok(entry) => entry,
            Err(CacheError::Closed) => {
                debug!(key = key.as_str(), "cache store closed, treating lookup as a miss");
                None
            }
            Err(e) => {
                warn!(key = key.as_str(), error = %e, "cache lookup failed");
                None
            }
        }
    }

    /// Look up the entry for `key`, surfacing failures.
    pub fn try_get(&self, key: &PathKey) -> Result<Option<SizeEntry>> {
        self.with_reader(|conn| {
            let row = conn
                .prepare_cached(
                    "SELECT size_bytes, mtime, computed_at, file_count, dir_count
                     FROM directory_sizes WHERE path = ?1",
                )
                .context("preparing lookup")?
                .query_row(params![key.as_str()], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })
                .optional()
                .context("looking up entry")?;

            Ok(row.map(|(size, mtime, computed_at, files, dirs)| SizeEntry {
                key: key.clone(),
                size_bytes: size_from_sql(size),
                mtime: DirMtime(mtime),
                computed_at: time_from_sql(computed_at),
                file_count: size_from_sql(files),
                dir_count: size_from_sql(dirs),
            }))
        })
    }

    /// Look up `key` and return the entry only if it is still fresh.
    pub fn get_fresh(&self, key: &PathKey, current: DirMtime) -> Option<SizeEntry> {
        let entry = self.get(key)?;
        if entry.is_fresh(current) {
            debug!(key = key.as_str(), size = entry.size_bytes, "cache hit");
            Some(entry)
        } else {
            debug!(
                key = key.as_str(),
                cached = entry.mtime.as_nanos(),
                current = current.as_nanos(),
                "cache entry stale"
            );
            None
        }
    }

    /// Upsert one entry. Failures are logged and dropped.
    pub fn put(&self, entry: &SizeEntry) {
        if let Err(e) = self.try_put(entry) {
            log_write_failure(&e, "cache write failed");
        }
    }

    /// Upsert one entry, surfacing failures.
    pub fn try_put(&self, entry: &SizeEntry) -> Result<()> {
        self.with_writer(|conn| {
            conn.prepare_cached(UPSERT)
                .context("preparing upsert")?
                .execute(params_from_iter(entry_params(entry)))
                .context("writing entry")?;
            Ok(())
        })
    }

    /// Upsert many entries in one transaction.
    ///
    /// Either every entry is written or none is.
    pub fn put_batch(&self, entries: &[SizeEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        self.with_writer(|conn| {
            let tx = conn.transaction().context("starting batch")?;
            {
                let mut stmt = tx.prepare_cached(UPSERT).context("preparing upsert")?;
                for entry in entries {
                    stmt.execute(params_from_iter(entry_params(entry)))
                    .context("writing batch entry")?;
                }
            }
            tx.commit().context("committing batch")?;
            debug!(count = entries.len(), "cache batch written");
            Ok(entries.len())
        })
    }

    /// Remove the entry for `prefix` and every entry nested below it.
    ///
    /// Returns the number of entries removed. Failures are logged and read
    /// as nothing removed.
    pub fn invalidate(&self, prefix: &PathKey) -> usize {
        match self.try_invalidate(prefix) {
            Ok(removed) => removed,
            Err(e) => {
                log_write_failure(&e, "cache invalidation failed");
                0
            }
        }
    }

    /// Remove `prefix` and its nested entries, surfacing failures.
    pub fn try_invalidate(&self, prefix: &PathKey) -> Result<usize> {
        let nested = prefix.nested_prefix();
        // Keys nested under `nested` sort in [nested, upper): '0' follows '/'.
        let mut upper = nested.to_string();
        upper.pop();
        upper.push('0');

        let removed = self.with_writer(|conn| {
            conn.prepare_cached(
                "DELETE FROM directory_sizes
                 WHERE path = ?1 OR (path >= ?2 AND path < ?3)",
            )
            .context("preparing invalidation")?
            .execute(params![prefix.as_str(), nested.as_str(), upper])
            .context("invalidating prefix")
        })?;

        debug!(prefix = prefix.as_str(), removed, "cache prefix invalidated");
        Ok(removed)
    }

    /// Remove the entry for exactly `key`, leaving nested entries alone.
    ///
    /// Returns whether an entry was removed. Failures are logged.
    pub fn remove(&self, key: &PathKey) -> bool {
        match self.try_remove(key) {
            Ok(removed) => removed,
            Err(e) => {
                log_write_failure(&e, "cache removal failed");
                false
            }
        }
    }

    /// Remove the entry for exactly `key`, surfacing failures.
    pub fn try_remove(&self, key: &PathKey) -> Result<bool> {
        let removed = self.with_writer(|conn| {
            conn.prepare_cached("DELETE FROM directory_sizes WHERE path = ?1")
                .context("preparing removal")?
                .execute(params![key.as_str()])
                .context("removing entry")
        })?;
        Ok(removed > 0)
    }

    /// Remove every entry.
    pub fn clear(&self) -> Result<usize> {
        let removed = self.with_writer(|conn| {
            conn.execute("DELETE FROM directory_sizes", [])
                .context("clearing cache")
        })?;
        info!(removed, "cache cleared");
        Ok(removed)
    }

    /// Number of cached entries.
    pub fn len(&self) -> Result<usize> {
        self.with_reader(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM directory_sizes", [], |row| row.get(0))
                .context("counting entries")?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Flush the WAL into the main file and release every connection.
    ///
    /// Later calls are no-ops, and later reads and writes behave as misses.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!(path = %self.path.display(), "cache store already closed");
            return;
        }

        self.readers.lock().clear();

        if let Some(conn) = self.writer.lock().take() {
            if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
                warn!(error = %e, "WAL checkpoint failed on close");
            }
            if let Err((_, e)) = conn.close() {
                warn!(error = %e, "closing cache writer failed");
            }
        }

        info!(path = %self.path.display(), "closed cache store");
    }

    fn with_writer<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.writer.lock();
        let conn = guard.as_mut().ok_or(CacheError::Closed)?;
        f(conn)
    }

    fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if self.is_closed() {
            return Err(CacheError::Closed);
        }

        let pooled = self.readers.lock().pop();
        let conn = match pooled {
            Some(conn) => conn,
            None => open_reader(&self.path)?,
        };

        let result = f(&conn);

        let mut pool = self.readers.lock();
        if pool.len() < self.reader_slots && !self.is_closed() {
            pool.push(conn);
        }
        result
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn entry_params(entry: &SizeEntry) -> [Value; 6] {
    [
        entry.key.as_str().to_owned().into(),
        size_to_sql(entry.size_bytes).into(),
        entry.mtime.as_nanos().into(),
        entry.computed_at.timestamp_millis().into(),
        size_to_sql(entry.file_count).into(),
        size_to_sql(entry.dir_count).into(),
    ]
}

fn log_write_failure(error: &CacheError, message: &str) {
    match error {
        CacheError::Closed => debug!("cache store closed, dropping write"),
        e => warn!(error = %e, "{message}"),
    }
}

fn open_writer(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .context("opening database")?;

    conn.busy_timeout(BUSY_TIMEOUT).context("setting busy timeout")?;
    apply_pragmas(&conn)?;
    check_integrity(&conn, path)?;
    apply_schema(&conn)?;
    Ok(conn)
}

fn open_reader(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .context("opening read connection")?;
    conn.busy_timeout(BUSY_TIMEOUT).context("setting busy timeout")?;
    // Readers need write access to the WAL index, never to the tables.
    conn.execute_batch("PRAGMA query_only = ON;")
        .context("marking connection read-only")?;
    Ok(conn)
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;",
    )
    .context("applying pragmas")?;

    let mode: String = conn
        .query_row("PRAGMA journal_mode", [], |row| row.get(0))
        .context("reading journal mode")?;
    if !mode.eq_ignore_ascii_case("wal") {
        warn!(mode = %mode, "requested WAL journal mode but got another");
    }
    Ok(())
}

fn check_integrity(conn: &Connection, path: &Path) -> Result<()> {
    let status: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .context("checking integrity")?;
    if status.eq_ignore_ascii_case("ok") {
        Ok(())
    } else {
        Err(CacheError::Corrupt {
            path: path.to_path_buf(),
            details: status,
        })
    }
}

fn apply_schema(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .context("reading schema version")?;

    if version != SCHEMA_VERSION {
        if version != 0 {
            warn!(found = version, expected = SCHEMA_VERSION, "cache schema mismatch, recreating tables");
        }
        conn.execute_batch(
            "DROP TABLE IF EXISTS directory_sizes;
             DROP TABLE IF EXISTS target_directories;",
        )
        .context("dropping old tables")?;
    }

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS directory_sizes (
            path TEXT PRIMARY KEY,
            size_bytes INTEGER NOT NULL,
            mtime INTEGER NOT NULL,
            computed_at INTEGER NOT NULL,
            file_count INTEGER NOT NULL DEFAULT 0,
            dir_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS target_directories (
            path TEXT NOT NULL,
            preset_tag TEXT NOT NULL,
            PRIMARY KEY (path, preset_tag)
        );",
    )
    .context("creating tables")?;

    conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))
        .context("recording schema version")?;
    Ok(())
}

/// Delete the database file together with its WAL and shared-memory siblings.
fn remove_database_files(path: &Path) -> Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut name = OsString::from(path.as_os_str());
        name.push(suffix);
        let file = PathBuf::from(name);
        match std::fs::remove_file(&file) {
            Ok(()) => debug!(path = %file.display(), "removed cache file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CacheError::Unrecoverable {
                    path: file,
                    details: e.to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, CacheStore) {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path().join("cache.db")).unwrap();
        (temp, store)
    }

    fn key(path: &str) -> PathKey {
        PathKey::normalize(path).unwrap()
    }

    #[test]
    fn test_put_then_get() {
        let (_temp, store) = store();
        let entry = SizeEntry::new(key("/data"), 150, DirMtime(42));
        store.put(&entry);

        let found = store.get(&key("/data")).unwrap();
        assert_eq!(found.size_bytes, 150);
        assert_eq!(found.mtime, DirMtime(42));
        assert_eq!(
            found.computed_at.timestamp_millis(),
            entry.computed_at.timestamp_millis()
        );
        assert!(store.get(&key("/other")).is_none());
    }

    #[test]
    fn test_counts_are_persisted() {
        let (_temp, store) = store();
        store.put(&SizeEntry::new(key("/data"), 150, DirMtime(42)).with_counts(12, 3));
        store
            .put_batch(&[SizeEntry::new(key("/logs"), 9, DirMtime(1)).with_counts(1, 0)])
            .unwrap();

        let found = store.get(&key("/data")).unwrap();
        assert_eq!((found.file_count, found.dir_count), (12, 3));
        let found = store.get(&key("/logs")).unwrap();
        assert_eq!((found.file_count, found.dir_count), (1, 0));
    }

    #[cfg(unix)]
    #[test]
    fn test_remove_touches_only_the_exact_key() {
        let (_temp, store) = store();
        store.put(&SizeEntry::new(key("/srv"), 1, DirMtime(1)));
        store.put(&SizeEntry::new(key("/srv/www"), 1, DirMtime(1)));

        assert!(store.remove(&key("/srv")));
        assert!(!store.remove(&key("/srv")));
        assert!(store.get(&key("/srv")).is_none());
        assert!(store.get(&key("/srv/www")).is_some());
    }

    #[test]
    fn test_get_fresh_applies_staleness_rule() {
        let (_temp, store) = store();
        store.put(&SizeEntry::new(key("/data"), 150, DirMtime(42)));

        assert!(store.get_fresh(&key("/data"), DirMtime(42)).is_some());
        assert!(store.get_fresh(&key("/data"), DirMtime(43)).is_none());
    }

    #[test]
    fn test_last_writer_wins() {
        let (_temp, store) = store();
        store.put(&SizeEntry::new(key("/data"), 1, DirMtime(1)));
        store.put(&SizeEntry::new(key("/data"), 2, DirMtime(2)));

        let found = store.get(&key("/data")).unwrap();
        assert_eq!(found.size_bytes, 2);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_invalidate_respects_component_boundaries() {
        let (_temp, store) = store();
        let entries: Vec<_> = ["/foo", "/foo/bar", "/foo/bar/baz", "/foobar", "/fo", "/foo0"]
            .into_iter()
            .map(|p| SizeEntry::new(key(p), 1, DirMtime(1)))
            .collect();
        store.put_batch(&entries).unwrap();

        assert_eq!(store.invalidate(&key("/foo")), 3);
        assert!(store.get(&key("/foobar")).is_some());
        assert!(store.get(&key("/fo")).is_some());
        assert!(store.get(&key("/foo0")).is_some());
        assert!(store.get(&key("/foo/bar")).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_invalidate_root_clears_everything() {
        let (_temp, store) = store();
        store.put(&SizeEntry::new(key("/a"), 1, DirMtime(1)));
        store.put(&SizeEntry::new(key("/b/c"), 1, DirMtime(1)));

        assert_eq!(store.invalidate(&key("/")), 2);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_closed_store_reads_as_miss() {
        let (_temp, store) = store();
        store.put(&SizeEntry::new(key("/data"), 1, DirMtime(1)));
        store.close();
        store.close();

        assert!(store.is_closed());
        assert!(store.get(&key("/data")).is_none());
        assert!(matches!(
            store.try_put(&SizeEntry::new(key("/data"), 1, DirMtime(1))),
            Err(CacheError::Closed)
        ));
        assert_eq!(store.invalidate(&key("/data")), 0);
    }

    #[test]
    fn test_schema_mismatch_recreates_tables() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.db");
        {
            let store = CacheStore::open(&path).unwrap();
            store.put(&SizeEntry::new(key("/data"), 1, DirMtime(1)));
            store.close();
        }
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("PRAGMA user_version = 99;").unwrap();
        }

        let store = CacheStore::open(&path).unwrap();
        assert!(store.is_empty().unwrap());
    }
}
