//! SQLite working copy of the catalog.
//!
//! One writer connection behind a mutex takes every mutation; lookups go
//! through a small r2d2 pool of read connections. The file runs in WAL mode
//! so readers never block on the writer.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::CatalogError;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Current catalog layout version, stored under `metadata.schema_version`.
pub const SCHEMA_VERSION: i64 = 1;

const READ_POOL_SIZE: u32 = 4;
const BUSY_TIMEOUT: &str = "PRAGMA busy_timeout = 5000;";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS metadata (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS file_records (
  file_path TEXT PRIMARY KEY,
  checksum TEXT NOT NULL,
  size_bytes INTEGER NOT NULL,
  archived INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_file_records_archived ON file_records(archived);
"#;

pub const META_SCHEMA_VERSION: &str = "schema_version";
pub const META_LAST_BACKUP: &str = "last_backup";
pub const META_APP_VERSION: &str = "app_version";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub file_path: String,
    pub checksum: String,
    pub size_bytes: u64,
    pub archived: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CatalogCounts {
    pub total: u64,
    pub archived: u64,
}

pub struct CatalogDb {
    writer: Mutex<Connection>,
    readers: DbPool,
    dirty: AtomicU64,
}

impl CatalogDb {
    /// Create a fresh, empty catalog at `path`.
    pub fn create(path: &Path) -> Result<Self, CatalogError> {
        let conn = Connection::open(path)?;
        configure(&conn)?;
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![META_SCHEMA_VERSION, SCHEMA_VERSION.to_string()],
        )?;
        Self::with_writer(path, conn)
    }

    /// Open a downloaded snapshot. Anything that is not a readable catalog
    /// is reported as `CatalogError::Corrupt`.
    pub fn open_existing(path: &Path) -> Result<Self, CatalogError> {
        let conn = Connection::open(path).map_err(|e| corrupt(path, e))?;
        validate(&conn).map_err(|e| match e {
            CatalogError::Sqlite(inner) => corrupt(path, inner),
            other => other,
        })?;
        configure(&conn)?;
        migrate(&conn)?;
        Self::with_writer(path, conn)
    }

    fn with_writer(path: &Path, writer: Connection) -> Result<Self, CatalogError> {
        let manager = SqliteConnectionManager::file(path)
            .with_init(|c| c.execute_batch(BUSY_TIMEOUT));
        let readers = Pool::builder()
            .max_size(READ_POOL_SIZE)
            .min_idle(Some(0))
            .connection_timeout(Duration::from_secs(10))
            .build(manager)?;
        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            dirty: AtomicU64::new(0),
        })
    }

    fn write<T>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>) -> Result<T, CatalogError> {
        let mut conn = self.writer.lock().map_err(|_| CatalogError::Poisoned)?;
        Ok(f(&mut *conn)?)
    }

    pub fn get(&self, file_path: &str) -> Result<Option<FileRecord>, CatalogError> {
        let conn = self.readers.get()?;
        let record = conn
            .query_row(
                "SELECT file_path, checksum, size_bytes, archived FROM file_records WHERE file_path = ?1",
                params![file_path],
                |row| {
                    Ok(FileRecord {
                        file_path: row.get(0)?,
                        checksum: row.get(1)?,
                        size_bytes: row.get::<_, i64>(2)? as u64,
                        archived: row.get::<_, i64>(3)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn upsert(&self, file_path: &str, checksum: &str, size_bytes: u64) -> Result<(), CatalogError> {
        self.write(|conn| {
            conn.execute(
                "INSERT INTO file_records (file_path, checksum, size_bytes, archived)
                 VALUES (?1, ?2, ?3, 0)
                 ON CONFLICT(file_path) DO UPDATE SET
                   checksum = excluded.checksum,
                   size_bytes = excluded.size_bytes,
                   archived = 0",
                params![file_path, checksum, size_bytes as i64],
            )
        })?;
        self.dirty.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Returns whether a live record was flipped to archived.
    pub fn mark_archived(&self, file_path: &str) -> Result<bool, CatalogError> {
        let changed = self.write(|conn| {
            conn.execute(
                "UPDATE file_records SET archived = 1 WHERE file_path = ?1 AND archived = 0",
                params![file_path],
            )
        })?;
        if changed > 0 {
            self.dirty.fetch_add(1, Ordering::Relaxed);
        }
        Ok(changed > 0)
    }

    /// Archive a batch of paths in one transaction; returns how many flipped.
    pub fn mark_archived_batch(&self, paths: &[String]) -> Result<usize, CatalogError> {
        let changed = self.write(|conn| {
            let tx = conn.transaction()?;
            let mut changed = 0;
            {
                let mut stmt = tx.prepare(
                    "UPDATE file_records SET archived = 1 WHERE file_path = ?1 AND archived = 0",
                )?;
                for path in paths {
                    changed += stmt.execute(params![path])?;
                }
            }
            tx.commit()?;
            Ok(changed)
        })?;
        self.dirty.fetch_add(changed as u64, Ordering::Relaxed);
        Ok(changed)
    }

    /// Up to `limit` non-archived paths sorted after `after`.
    pub fn live_paths_after(&self, after: &str, limit: usize) -> Result<Vec<String>, CatalogError> {
        let conn = self.readers.get()?;
        let mut stmt = conn.prepare(
            "SELECT file_path FROM file_records
             WHERE archived = 0 AND file_path > ?1
             ORDER BY file_path LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after, limit as i64], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn counts(&self) -> Result<CatalogCounts, CatalogError> {
        let conn = self.readers.get()?;
        let (total, archived) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(archived), 0) FROM file_records",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok(CatalogCounts {
            total: total as u64,
            archived: archived as u64,
        })
    }

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>, CatalogError> {
        let conn = self.readers.get()?;
        let value = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<(), CatalogError> {
        self.write(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
        })?;
        self.dirty.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Mutations since the last `take_dirty`.
    pub fn dirty(&self) -> u64 {
        self.dirty.load(Ordering::Relaxed)
    }

    pub fn take_dirty(&self) -> u64 {
        self.dirty.swap(0, Ordering::Relaxed)
    }

    /// Put back a count taken by `take_dirty` when the flush it was taken for failed.
    pub fn restore_dirty(&self, count: u64) {
        self.dirty.fetch_add(count, Ordering::Relaxed);
    }

    /// Write a consistent, compacted copy of the catalog to `target`.
    pub fn snapshot_to(&self, target: &Path) -> Result<(), CatalogError> {
        if target.exists() {
            std::fs::remove_file(target)?;
        }
        let target = target.to_string_lossy().into_owned();
        self.write(|conn| conn.execute("VACUUM INTO ?1", params![target]))?;
        Ok(())
    }
}

fn corrupt(path: &Path, err: impl std::fmt::Display) -> CatalogError {
    CatalogError::Corrupt(format!("{}: {}", path.display(), err))
}

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(BUSY_TIMEOUT)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;",
    )
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
}

fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns.iter().any(|c| c == column))
}

fn validate(conn: &Connection) -> Result<(), CatalogError> {
    let check: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    if check != "ok" {
        return Err(CatalogError::Corrupt(format!("integrity check failed: {check}")));
    }

    let current = table_exists(conn, "file_records")?;
    let legacy = table_exists(conn, "files")?;
    if !current && !legacy {
        return Err(CatalogError::Corrupt("no file record table".into()));
    }

    if table_exists(conn, "metadata")? {
        let version: Option<String> = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![META_SCHEMA_VERSION],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(version) = version {
            let found: i64 = version.parse().map_err(|_| {
                CatalogError::Corrupt(format!("unreadable schema version `{version}`"))
            })?;
            if found > SCHEMA_VERSION {
                return Err(CatalogError::UnsupportedSchema {
                    found,
                    supported: SCHEMA_VERSION,
                });
            }
        }
    }
    Ok(())
}

/// Bring an older catalog up to the current layout. Idempotent.
fn migrate(conn: &Connection) -> Result<(), CatalogError> {
    // Early catalogs predate archival; the index in SCHEMA needs the column.
    if table_exists(conn, "file_records")? && !has_column(conn, "file_records", "archived")? {
        tracing::info!("[Catalog] Adding `archived` column to file_records");
        conn.execute_batch(
            "ALTER TABLE file_records ADD COLUMN archived INTEGER NOT NULL DEFAULT 0;",
        )?;
    }
    conn.execute_batch(SCHEMA)?;

    // Catalogs written by the original backup script keep records in `files`
    // with a leading slash on every path and metadata in `manifest_metadata`.
    if table_exists(conn, "files")? {
        tracing::info!("[Catalog] Importing records from legacy `files` table");
        let archived = if has_column(conn, "files", "archived")? {
            "COALESCE(archived, 0)"
        } else {
            "0"
        };
        conn.execute_batch(&format!(
            "BEGIN;
             INSERT OR IGNORE INTO file_records (file_path, checksum, size_bytes, archived)
               SELECT ltrim(file_path, '/'), checksum, size, {archived} FROM files;
             DROP TABLE files;
             COMMIT;"
        ))?;
    }
    if table_exists(conn, "manifest_metadata")? {
        conn.execute_batch(
            "BEGIN;
             INSERT OR IGNORE INTO metadata (key, value)
               SELECT CASE key
                        WHEN 'immich_version' THEN 'app_version'
                        ELSE key
                      END, value
               FROM manifest_metadata
               WHERE key IN ('last_backup', 'immich_version');
             DROP TABLE manifest_metadata;
             COMMIT;",
        )?;
    }

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        params![META_SCHEMA_VERSION, SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_upsert_updates_in_place() {
        let dir = TempDir::new().unwrap();
        let db = CatalogDb::create(&dir.path().join("c.db")).unwrap();

        db.upsert("2024/a.jpg", "sha256:aa", 10).unwrap();
        db.upsert("2024/a.jpg", "sha256:bb", 12).unwrap();

        let record = db.get("2024/a.jpg").unwrap().unwrap();
        assert_eq!(record.checksum, "sha256:bb");
        assert_eq!(record.size_bytes, 12);
        assert!(!record.archived);
        assert_eq!(db.counts().unwrap().total, 1);
        assert_eq!(db.dirty(), 2);
    }

    #[test]
    fn test_mark_archived_keeps_checksum_and_size() {
        let dir = TempDir::new().unwrap();
        let db = CatalogDb::create(&dir.path().join("c.db")).unwrap();
        db.upsert("a.jpg", "sha256:aa", 10).unwrap();

        assert!(db.mark_archived("a.jpg").unwrap());
        assert!(!db.mark_archived("a.jpg").unwrap());
        assert!(!db.mark_archived("missing.jpg").unwrap());

        let record = db.get("a.jpg").unwrap().unwrap();
        assert!(record.archived);
        assert_eq!(record.checksum, "sha256:aa");
        assert_eq!(record.size_bytes, 10);

        db.upsert("a.jpg", "sha256:cc", 11).unwrap();
        assert!(!db.get("a.jpg").unwrap().unwrap().archived);
    }

    #[test]
    fn test_live_paths_are_paged_in_order() {
        let dir = TempDir::new().unwrap();
        let db = CatalogDb::create(&dir.path().join("c.db")).unwrap();
        for name in ["c", "a", "e", "b", "d"] {
            db.upsert(name, "sha256:00", 1).unwrap();
        }
        db.mark_archived("d").unwrap();

        assert_eq!(db.live_paths_after("", 2).unwrap(), vec!["a", "b"]);
        assert_eq!(db.live_paths_after("b", 2).unwrap(), vec!["c", "e"]);
        assert!(db.live_paths_after("e", 2).unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_reopens_with_same_records() {
        let dir = TempDir::new().unwrap();
        let db = CatalogDb::create(&dir.path().join("c.db")).unwrap();
        db.upsert("a.jpg", "sha256:aa", 10).unwrap();
        db.set_metadata(META_APP_VERSION, "v1.2.3").unwrap();

        let snapshot = dir.path().join("snap.db");
        db.snapshot_to(&snapshot).unwrap();

        let reopened = CatalogDb::open_existing(&snapshot).unwrap();
        assert_eq!(reopened.get("a.jpg").unwrap().unwrap().size_bytes, 10);
        assert_eq!(
            reopened.get_metadata(META_APP_VERSION).unwrap().as_deref(),
            Some("v1.2.3")
        );
    }

    #[test]
    fn test_garbage_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.db");
        std::fs::write(&path, b"this is definitely not sqlite, just some bytes padding it out").unwrap();

        assert!(matches!(
            CatalogDb::open_existing(&path),
            Err(CatalogError::Corrupt(_))
        ));
    }

    #[test]
    fn test_sqlite_without_catalog_tables_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("other.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE unrelated (id INTEGER);").unwrap();
        drop(conn);

        assert!(matches!(
            CatalogDb::open_existing(&path),
            Err(CatalogError::Corrupt(_))
        ));
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("future.db");
        let db = CatalogDb::create(&path).unwrap();
        db.set_metadata(META_SCHEMA_VERSION, "99").unwrap();
        let snapshot = dir.path().join("future-snap.db");
        db.snapshot_to(&snapshot).unwrap();

        assert!(matches!(
            CatalogDb::open_existing(&snapshot),
            Err(CatalogError::UnsupportedSchema { found: 99, .. })
        ));
    }

    #[test]
    fn test_catalog_without_archived_column_is_upgraded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("early.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL);
             CREATE TABLE file_records (
               file_path TEXT PRIMARY KEY,
               checksum TEXT NOT NULL,
               size_bytes INTEGER NOT NULL
             );
             INSERT INTO file_records VALUES ('a.jpg', 'sha256:aa', 3);",
        )
        .unwrap();
        drop(conn);

        let db = CatalogDb::open_existing(&path).unwrap();
        assert!(!db.get("a.jpg").unwrap().unwrap().archived);
        assert!(db.mark_archived("a.jpg").unwrap());
        drop(db);

        // Opening again is a no-op.
        let db = CatalogDb::open_existing(&path).unwrap();
        assert!(db.get("a.jpg").unwrap().unwrap().archived);
    }

    #[test]
    fn test_legacy_manifest_is_imported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("legacy.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE manifest_metadata (key TEXT PRIMARY KEY, value TEXT);
             CREATE TABLE files (
               file_path TEXT PRIMARY KEY,
               checksum TEXT NOT NULL,
               size INTEGER NOT NULL,
               archived INTEGER DEFAULT 0
             );
             INSERT INTO files VALUES ('/upload/a.jpg', 'sha256:aa', 5, 0);
             INSERT INTO files VALUES ('/upload/gone.jpg', 'sha256:bb', 7, 1);
             INSERT INTO manifest_metadata VALUES ('immich_version', 'v1.99');",
        )
        .unwrap();
        drop(conn);

        let db = CatalogDb::open_existing(&path).unwrap();
        assert_eq!(db.get("upload/a.jpg").unwrap().unwrap().size_bytes, 5);
        assert!(db.get("upload/gone.jpg").unwrap().unwrap().archived);
        assert_eq!(db.get_metadata(META_APP_VERSION).unwrap().as_deref(), Some("v1.99"));
        assert_eq!(
            db.get_metadata(META_SCHEMA_VERSION).unwrap().as_deref(),
            Some("1")
        );
    }
}
