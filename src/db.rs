use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Durable string key/value storage, the desktop counterpart of a browser's
/// local storage. Backed by a single SQLite table.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
}

impl LocalStore {
    /// Opens the store in the application data directory, creating it if needed
    pub fn new() -> Result<Self> {
        let app_data_dir = Self::get_app_data_dir()?;
        if !app_data_dir.exists() {
            std::fs::create_dir_all(&app_data_dir)?;
        }

        Self::open(app_data_dir.join("local_storage.db"))
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// A throwaway store, used when the data directory is unavailable
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS local_storage (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn get_app_data_dir() -> Result<PathBuf> {
        let home_dir =
            dirs_next::home_dir().ok_or_else(|| anyhow!("Could not find home directory"))?;
        Ok(home_dir.join(".infomap"))
    }

    pub fn get_item(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().map_err(|_| anyhow!("Failed to lock local storage"))?;
        let value = conn
            .query_row(
                "SELECT value FROM local_storage WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        Ok(value)
    }

    pub fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| anyhow!("Failed to lock local storage"))?;
        conn.execute(
            "INSERT OR REPLACE INTO local_storage (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, chrono::Utc::now().to_rfc3339()],
        )?;

        Ok(())
    }

    pub fn remove_item(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| anyhow!("Failed to lock local storage"))?;
        conn.execute("DELETE FROM local_storage WHERE key = ?1", params![key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let store = LocalStore::in_memory().unwrap();
        assert_eq!(store.get_item("infomap_history").unwrap(), None);

        store.set_item("infomap_history", "[]").unwrap();
        assert_eq!(store.get_item("infomap_history").unwrap().as_deref(), Some("[]"));

        store.set_item("infomap_history", "[1]").unwrap();
        assert_eq!(store.get_item("infomap_history").unwrap().as_deref(), Some("[1]"));

        store.remove_item("infomap_history").unwrap();
        assert_eq!(store.get_item("infomap_history").unwrap(), None);
    }

    #[test]
    fn test_values_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("local_storage.db");

        {
            let store = LocalStore::open(&path).unwrap();
            store.set_item("infomap_session", "abc123").unwrap();
        }

        let store = LocalStore::open(&path).unwrap();
        assert_eq!(store.get_item("infomap_session").unwrap().as_deref(), Some("abc123"));
    }
}
