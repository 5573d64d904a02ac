use std::{fs, io};
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde_json::Value;

use crate::error::{ConfigError, Result};
use crate::store::{DocumentStore, EXTENSION};

/// Documents as pretty-printed JSON files: `<location>/<name>.json`
///
/// Writes go to a hidden sibling file first and are renamed into place, so a reader never
/// sees a half-written document. Nothing stops two processes writing the same file.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsStore;

impl FsStore {
    pub fn new() -> Self {
        FsStore
    }
}

impl DocumentStore for FsStore {
    fn read(&self, location: &Path, name: &str) -> Result<Option<Value>> {
        let path = self.path_of(location, name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(ConfigError::io(path, err)),
        };
        debug!("Reading document {}", path.display());
        serde_json::from_str::<Value>(&text)
            .map(Some)
            .map_err(|err| ConfigError::json(path, err))
    }

    fn write(&self, location: &Path, name: &str, document: &Value) -> Result<PathBuf> {
        fs::create_dir_all(location).map_err(|err| ConfigError::io(location, err))?;
        let path = self.path_of(location, name);
        let mut text = serde_json::to_string_pretty(document).map_err(|err| ConfigError::json(&path, err))?;
        text.push('\n');

        let staging = location.join(format!(".{name}.{EXTENSION}.tmp"));
        fs::write(&staging, text).map_err(|err| ConfigError::io(&staging, err))?;
        fs::rename(&staging, &path).map_err(|err| ConfigError::io(&path, err))?;
        info!("Wrote {}", path.display());
        Ok(path)
    }

    fn remove(&self, location: &Path, name: &str) -> Result<bool> {
        let path = self.path_of(location, name);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Removed {}", path.display());
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(ConfigError::io(path, err)),
        }
    }

    fn list(&self, location: &Path) -> Result<Vec<String>> {
        let paths = match get_document_paths(location) {
            Ok(paths) => paths,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(ConfigError::io(location, err)),
        };

        let mut names: Vec<String> = paths
            .iter()
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == EXTENSION))
            .filter_map(|p| p.file_stem()?.to_str().map(String::from))
            .filter(|name| !name.starts_with('.'))
            .collect();
        names.sort();
        Ok(names)
    }
}

fn get_document_paths(dir: &Path) -> io::Result<Vec<PathBuf>> {
    fs::read_dir(dir)?
        .map(|res| res.map(|e| e.path()))
        .collect::<io::Result<Vec<PathBuf>>>()
}
