use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

pub const SESSION_KEY: &str = "jobtrack_session";
pub const USERS_KEY: &str = "jobtrack_users";
pub const REMOTE_CONFIG_KEY: &str = "jobtrack_mongo_config";

pub fn jobs_key(principal_id: &str) -> String {
    format!("jobtrack_data_{}", principal_id)
}

pub fn stages_key(principal_id: &str) -> String {
    format!("jobtrack_stages_{}", principal_id)
}

/// String-keyed local storage. Reads are synchronous; values are JSON text.
pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Database {
    pub fn open() -> Result<Self> {
        let path = Self::default_path()?;
        Self::open_at(&path)
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create data directory {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        let db = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
            path: None,
        };
        db.init()?;
        Ok(db)
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    pub fn default_path() -> Result<PathBuf> {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "jobtrack") {
            Ok(proj_dirs.data_dir().join("jobtrack.db"))
        } else {
            Ok(PathBuf::from("jobtrack.db"))
        }
    }

    fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            "#,
        )?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
            .optional()
            .with_context(|| format!("Failed to read key '{}'", key))
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        Self::upsert(&self.conn, key, value)
            .with_context(|| format!("Failed to write key '{}'", key))?;
        tracing::debug!(key, bytes = value.len(), "persisted");
        Ok(())
    }

    /// Writes every entry or none of them.
    pub fn set_many(&self, entries: &[(String, String)]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for (key, value) in entries {
            Self::upsert(&tx, key, value)
                .with_context(|| format!("Failed to write key '{}'", key))?;
        }
        tx.commit().context("Failed to commit batch write")?;
        tracing::debug!(keys = entries.len(), "persisted batch");
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", [key])
            .with_context(|| format!("Failed to remove key '{}'", key))?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn upsert(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
            params![key, value],
        )
    }
}
