//! Document storage and source resolution
//!
//! A document is any JSON tree addressed by a location (a directory) and a name. The store
//! doesn't know about machines or codes; it only reads, writes, lists and removes documents.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::Result;

/// One JSON file per document below a directory
pub mod fs;
/// Every document in a single SQLite database file
pub mod sqlite;
/// Decide which source wins for a name, including the `default` indirection
pub mod resolve;

/// Reserved document name (and key) naming the implicit entity
pub const DEFAULT_KEY: &str = "default";

/// File extension of on-disk documents
pub const EXTENSION: &str = "json";

/// Key-value access to structured documents
///
/// Implementations must treat a missing document as `Ok(None)` / `Ok(false)`, never as an
/// error, so callers can tell "absent" apart from "broken".
pub trait DocumentStore {
    fn read(&self, location: &Path, name: &str) -> Result<Option<Value>>;

    /// Write (create or replace) a document, returning where it was written
    fn write(&self, location: &Path, name: &str, document: &Value) -> Result<PathBuf>;

    /// Returns `false` if there was nothing to remove
    fn remove(&self, location: &Path, name: &str) -> Result<bool>;

    /// Sorted document names at a location; an absent location is empty
    fn list(&self, location: &Path) -> Result<Vec<String>>;

    fn path_of(&self, location: &Path, name: &str) -> PathBuf {
        location.join(format!("{name}.{EXTENSION}"))
    }

    fn exists(&self, location: &Path, name: &str) -> Result<bool> {
        Ok(self.read(location, name)?.is_some())
    }
}

/// Address of a single document, e.g. an aggregate file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub location: PathBuf,
    pub name: String,
}

impl DocumentRef {
    pub fn new(location: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        DocumentRef { location: location.into(), name: name.into() }
    }

    /// Split a file path like `~/.xespresso/machines.json` into its directory and stem
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_stem()?.to_str()?;
        let location = path.parent().unwrap_or_else(|| Path::new("."));
        Some(DocumentRef::new(location, name))
    }

    pub fn read(&self, store: &dyn DocumentStore) -> Result<Option<Value>> {
        store.read(&self.location, &self.name)
    }

    pub fn path(&self, store: &dyn DocumentStore) -> PathBuf {
        store.path_of(&self.location, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_ref_from_path() {
        let doc = DocumentRef::from_path(Path::new("/home/u/.xespresso/machines.json")).unwrap();
        assert_eq!(doc.location, PathBuf::from("/home/u/.xespresso"));
        assert_eq!(doc.name, "machines");
    }

    #[test]
    fn test_document_ref_from_bare_file() {
        let doc = DocumentRef::from_path(Path::new("codes.json")).unwrap();
        assert_eq!(doc.name, "codes");
    }
}
