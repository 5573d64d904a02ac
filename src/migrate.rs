//! Split an aggregate document into one document per entity, and undo it
//!
//! Each entity is handled on its own: one that fails validation or can't be written is
//! recorded in the report and the batch carries on. The aggregate itself is only read.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde_json::Value;

use crate::entity::schema::SchemaSet;
use crate::entity::Entity;
use crate::error::{ConfigError, Result};
use crate::persist::{Persister, SaveOptions};
use crate::store::resolve::aggregate_entries;
use crate::store::{DocumentRef, DocumentStore, DEFAULT_KEY};

/// What happened to a single entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Migrated(PathBuf),
    /// A document was already there and overwriting wasn't requested
    Skipped(PathBuf),
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
    /// Error text per failed name; `"default"` when the default marker couldn't be written
    pub errors: BTreeMap<String, String>,
    /// Default declared by the aggregate
    pub default: Option<String>,
    pub outcomes: BTreeMap<String, Outcome>,
}

impl MigrationReport {
    fn record(&mut self, name: &str, outcome: Outcome) {
        match &outcome {
            Outcome::Migrated(_) => self.migrated.push(name.to_string()),
            Outcome::Skipped(_) => self.skipped.push(name.to_string()),
            Outcome::Failed(reason) => {
                self.failed.push(name.to_string());
                self.errors.insert(name.to_string(), reason.clone());
            }
        }
        self.outcomes.insert(name.to_string(), outcome);
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.errors.is_empty()
    }

    /// A report with failures becomes `MigrationPartialFailure`
    pub fn into_result(self) -> Result<Self> {
        if self.is_clean() {
            return Ok(self);
        }
        let mut failed = self.failed;
        if self.errors.contains_key(DEFAULT_KEY) {
            failed.push(DEFAULT_KEY.to_string());
        }
        Err(ConfigError::MigrationPartialFailure { failed })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub removed: Vec<String>,
    /// Requested names that had no document
    pub missing: Vec<String>,
    pub failed: Vec<String>,
    pub errors: BTreeMap<String, String>,
}

pub struct Migrator<'a> {
    store: &'a dyn DocumentStore,
    persister: Persister<'a>,
    schemas: SchemaSet,
}

impl<'a> Migrator<'a> {
    pub fn new(store: &'a dyn DocumentStore) -> Result<Self> {
        Ok(Migrator { store, persister: Persister::new(store), schemas: SchemaSet::load()? })
    }

    /// Write every selected entry of `aggregate` to `<output_dir>/<name>.json`
    ///
    /// Without `names` every entry is migrated. A declared default also produces
    /// `default.json`. Only a missing or unreadable aggregate fails the whole call.
    pub fn migrate<E: Entity>(
        &self,
        aggregate: &DocumentRef,
        output_dir: &Path,
        names: Option<&[String]>,
        overwrite: bool,
    ) -> Result<MigrationReport> {
        let source = aggregate.path(self.store);
        let document = aggregate.read(self.store)?.ok_or_else(|| ConfigError::NotFound {
            kind: E::KIND,
            name: aggregate.name.clone(),
            searched: vec![source.clone()],
        })?;
        let entries = aggregate_entries(&document, E::KIND, &source)?.cloned().unwrap_or_default();

        let selected: Vec<String> = match names {
            Some(names) => names.to_vec(),
            None => entries.keys().filter(|name| *name != DEFAULT_KEY).cloned().collect(),
        };
        info!("Migrating {} {} entries from {} to {}", selected.len(), E::KIND, source.display(), output_dir.display());

        let mut report = MigrationReport::default();
        for name in &selected {
            let outcome = match entries.get(name) {
                None => Outcome::Failed(format!("not present in {}", source.display())),
                Some(raw) => self.migrate_one::<E>(name, raw, output_dir, overwrite),
            };
            match &outcome {
                Outcome::Migrated(path) => info!("Migrated {} '{name}' to {}", E::KIND, path.display()),
                Outcome::Skipped(path) => info!("Skipped {} '{name}', {} already exists", E::KIND, path.display()),
                Outcome::Failed(reason) => warn!("Failed to migrate {} '{name}': {reason}", E::KIND),
            }
            report.record(name, outcome);
        }

        if let Some(default) = document.get(DEFAULT_KEY).and_then(Value::as_str).filter(|d| !d.trim().is_empty()) {
            report.default = Some(default.to_string());
            if let Err(err) = self.persister.write_default_marker(output_dir, default) {
                warn!("Failed to write default {} marker: {err}", E::KIND);
                report.errors.insert(DEFAULT_KEY.to_string(), err.to_string());
            }
        }

        info!(
            "Migration of {} finished: {} migrated, {} skipped, {} failed",
            E::KIND,
            report.migrated.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok(report)
    }

    fn migrate_one<E: Entity>(&self, name: &str, raw: &Value, output_dir: &Path, overwrite: bool) -> Outcome {
        let saved = self
            .schemas
            .check(E::KIND, name, raw)
            .and_then(|()| E::from_document(name, raw))
            .and_then(|entity| {
                let options = SaveOptions { overwrite, merge: false, interactive: false };
                self.persister.save(&entity, output_dir, options)
            });
        match saved {
            Ok(path) => Outcome::Migrated(path),
            Err(ConfigError::AlreadyExists { path }) => Outcome::Skipped(path),
            Err(err) => Outcome::Failed(err.to_string()),
        }
    }

    /// Remove migrated documents: the named ones, or every document in `output_dir`
    pub fn rollback(&self, output_dir: &Path, names: Option<&[String]>) -> Result<RollbackReport> {
        let targets = match names {
            Some(names) => names.to_vec(),
            None => self.store.list(output_dir)?,
        };
        info!("Rolling back {} documents in {}", targets.len(), output_dir.display());

        let mut report = RollbackReport::default();
        for name in targets {
            match self.store.remove(output_dir, &name) {
                Ok(true) => report.removed.push(name),
                Ok(false) => report.missing.push(name),
                Err(err) => {
                    warn!("Failed to remove '{name}' from {}: {err}", output_dir.display());
                    report.errors.insert(name.clone(), err.to_string());
                    report.failed.push(name);
                }
            }
        }
        Ok(report)
    }
}
