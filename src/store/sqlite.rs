use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, info};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

use crate::error::{ConfigError, Result};
use crate::store::DocumentStore;

/// All documents in one SQLite file, keyed by (location, name)
///
/// Useful when a single shareable file is preferred over a directory tree. Locations are
/// stored as plain strings; `path_of` still reports `<location>/<name>.json` so messages read
/// the same as with the filesystem store.
pub struct SqliteStore {
    conn: Connection,
}

static SCHEMA: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/db/schema.sql"));

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() { info!("Creating new document database {}", path.display()) }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore { conn })
    }
}

fn location_key(location: &Path) -> String {
    location.to_string_lossy().into_owned()
}

impl DocumentStore for SqliteStore {
    fn read(&self, location: &Path, name: &str) -> Result<Option<Value>> {
        let body: Option<String> = self.conn
            .query_row(
                "SELECT body FROM document WHERE location = ?1 AND name = ?2",
                (location_key(location), name),
                |row| row.get(0),
            )
            .optional()?;

        match body {
            None => Ok(None),
            Some(json_string) => {
                debug!("Loading document {name} from {}", location.display());
                serde_json::from_str::<Value>(&json_string)
                    .map(Some)
                    .map_err(|err| ConfigError::json(self.path_of(location, name), err))
            }
        }
    }

    fn write(&self, location: &Path, name: &str, document: &Value) -> Result<PathBuf> {
        let path = self.path_of(location, name);
        let body = serde_json::to_string(document).map_err(|err| ConfigError::json(&path, err))?;
        let updated_at = Utc::now().to_rfc3339();

        self.conn.execute(
            "INSERT INTO document (location, name, body, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (location, name) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
            (location_key(location), name, body, updated_at),
        )?;
        info!("Stored {} in database", path.display());
        Ok(path)
    }

    fn remove(&self, location: &Path, name: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "DELETE FROM document WHERE location = ?1 AND name = ?2",
            (location_key(location), name),
        )?;
        Ok(changed > 0)
    }

    fn list(&self, location: &Path) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT name FROM document WHERE location = ?1 ORDER BY name")?;
        let rows = stmt.query_map([location_key(location)], |row| row.get(0))?;

        let mut names: Vec<String> = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }
}
