use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use super::KeyValueStore;

const DATABASE_FILE: &str = "viewhost.sqlite3";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unable to determine data directory")]
    DataDir,
}

/// Key/value store persisted in sqlite, one logical namespace per domain.
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    domain: String,
}

#[derive(Debug)]
struct SqliteCustomizer;

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for SqliteCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(Duration::from_secs(1))
    }
}

impl SqliteStore {
    /// Open the store in the platform data directory (or `VIEWHOST_DATA_DIR`).
    pub fn open_default(domain: &str) -> Result<Self, StorageError> {
        let path = database_path()?;
        Self::open_file(&path, domain)
    }

    /// Open (creating if needed) the store inside `dir`.
    pub fn open(dir: &Path, domain: &str) -> Result<Self, StorageError> {
        Self::open_file(&dir.join(DATABASE_FILE), domain)
    }

    fn open_file(path: &Path, domain: &str) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|_| StorageError::DataDir)?;
        }

        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(4)
            .connection_customizer(Box::new(SqliteCustomizer))
            .build(manager)?;

        let conn = pool.get()?;
        initialise_schema(&conn)?;
        tracing::debug!(target: "storage", path = %path.display(), %domain, "opened cache store");

        Ok(Self {
            pool,
            domain: domain.to_string(),
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT value FROM kv WHERE domain = ?1 AND key = ?2",
            params![self.domain, key],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv (domain, key, value) VALUES (?1, ?2, ?3)",
            params![self.domain, key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM kv WHERE domain = ?1 AND key = ?2",
            params![self.domain, key],
        )?;
        Ok(())
    }
}

fn database_path() -> Result<PathBuf, StorageError> {
    if let Ok(dir) = std::env::var("VIEWHOST_DATA_DIR") {
        let mut path = PathBuf::from(dir);
        path.push(DATABASE_FILE);
        return Ok(path);
    }

    if let Some(dirs) = ProjectDirs::from("org", "ViewHost", "ViewHost") {
        let mut data_dir = dirs.data_dir().to_path_buf();
        data_dir.push("prerender");
        data_dir.push(DATABASE_FILE);
        Ok(data_dir)
    } else {
        Err(StorageError::DataDir)
    }
}

fn initialise_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        CREATE TABLE IF NOT EXISTS kv (
            domain TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (domain, key)
        );
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn set_get_remove() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path(), "test").unwrap();
        assert_eq!(store.get("missing").unwrap(), None);

        store.set("key", "value").unwrap();
        assert_eq!(store.get("key").unwrap().as_deref(), Some("value"));

        store.set("key", "other").unwrap();
        assert_eq!(store.get("key").unwrap().as_deref(), Some("other"));

        store.remove("key").unwrap();
        assert_eq!(store.get("key").unwrap(), None);
    }

    #[test]
    fn domains_do_not_share_keys() {
        let dir = TempDir::new().unwrap();
        let first = SqliteStore::open(dir.path(), "first").unwrap();
        let second = SqliteStore::open(dir.path(), "second").unwrap();

        first.set("shared", "1").unwrap();
        assert_eq!(second.get("shared").unwrap(), None);
        assert_eq!(first.domain(), "first");
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = SqliteStore::open(dir.path(), "test").unwrap();
            store.set("persisted", "yes").unwrap();
        }
        let reopened = SqliteStore::open(dir.path(), "test").unwrap();
        assert_eq!(reopened.get("persisted").unwrap().as_deref(), Some("yes"));
    }
}
