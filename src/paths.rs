//! Where configuration lives on disk
//!
//! Everything hangs off a single root directory, `~/.xespresso` unless `XESPRESSO_HOME` or an
//! explicit root says otherwise:
//!
//! ```text
//! <root>/machines.json          aggregate: {"default": "...", "machines": {...}}
//! <root>/machines/<name>.json   one document per machine
//! <root>/machines/default.json  {"default": "<name>"}
//! <root>/codes.json, <root>/codes/...
//! ```

use std::env;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};
use crate::kind::EntityKind;
use crate::store::DocumentRef;

/// Environment variable overriding the configuration root
pub const ROOT_ENV: &str = "XESPRESSO_HOME";

/// Root directory name below `$HOME`
pub const DEFAULT_ROOT_DIR: &str = ".xespresso";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    root: PathBuf,
}

impl ConfigPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ConfigPaths { root: root.into() }
    }

    /// `$XESPRESSO_HOME`, falling back to `~/.xespresso`
    pub fn from_env() -> Result<Self> {
        if let Some(root) = env::var_os(ROOT_ENV).filter(|v| !v.is_empty()) {
            return Ok(ConfigPaths::new(PathBuf::from(root)));
        }
        match dirs::home_dir() {
            Some(home) => Ok(ConfigPaths::new(home.join(DEFAULT_ROOT_DIR))),
            None => Err(ConfigError::io(
                "~",
                io::Error::new(io::ErrorKind::NotFound, "XESPRESSO_HOME is not set and there is no home directory"),
            )),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one document per entity
    pub fn entity_dir(&self, kind: EntityKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    /// The aggregate document for a kind, stored beside its entity directory
    pub fn aggregate(&self, kind: EntityKind) -> DocumentRef {
        DocumentRef::new(&self.root, kind.dir_name())
    }
}

/// Expand a leading `~/` against the home directory; other paths are returned unchanged
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ if path == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(path)),
        _ => PathBuf::from(path),
    }
}
