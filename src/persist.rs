//! Write entities back to a store without clobbering what is already there
//!
//! An existing document is only replaced when the caller asked for it: `overwrite` replaces,
//! `merge` folds the entity into the stored one, and `interactive` defers the choice to a
//! [`ConflictPrompt`]. Without any of these the save fails with `AlreadyExists` and the stored
//! document is left byte-identical.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde_json::json;

use crate::entity::Entity;
use crate::error::{ConfigError, Result};
use crate::kind::EntityKind;
use crate::store::{DocumentStore, DEFAULT_KEY};

pub mod merge;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOptions {
    pub overwrite: bool,
    pub merge: bool,
    pub interactive: bool,
}

impl SaveOptions {
    pub fn overwrite() -> Self {
        SaveOptions { overwrite: true, ..Default::default() }
    }

    pub fn merge() -> Self {
        SaveOptions { merge: true, ..Default::default() }
    }

    pub fn interactive() -> Self {
        SaveOptions { interactive: true, ..Default::default() }
    }
}

/// Answer to an existing-document conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveChoice {
    Overwrite,
    Merge,
    Cancel,
}

/// Asks someone what to do about a document that already exists
pub trait ConflictPrompt {
    fn choose(&self, kind: EntityKind, name: &str, existing: &Path) -> SaveChoice;
}

impl<F> ConflictPrompt for F
where
    F: Fn(EntityKind, &str, &Path) -> SaveChoice,
{
    fn choose(&self, kind: EntityKind, name: &str, existing: &Path) -> SaveChoice {
        self(kind, name, existing)
    }
}

pub struct Persister<'a> {
    store: &'a dyn DocumentStore,
    prompt: Option<&'a dyn ConflictPrompt>,
}

impl<'a> Persister<'a> {
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Persister { store, prompt: None }
    }

    pub fn with_prompt(store: &'a dyn DocumentStore, prompt: &'a dyn ConflictPrompt) -> Self {
        Persister { store, prompt: Some(prompt) }
    }

    /// Save `entity` as `<target_dir>/<name>.json`, returning the document's path
    pub fn save<E: Entity>(&self, entity: &E, target_dir: &Path, options: SaveOptions) -> Result<PathBuf> {
        entity.validate()?;
        let name = entity.name();
        let path = self.store.path_of(target_dir, name);

        let Some(stored) = self.store.read(target_dir, name)? else {
            info!("Writing new {} '{name}' to {}", E::KIND, path.display());
            return self.store.write(target_dir, name, &entity.to_document());
        };

        match self.decide(E::KIND, name, &path, options)? {
            SaveChoice::Overwrite => {
                info!("Overwriting {} '{name}' at {}", E::KIND, path.display());
                self.store.write(target_dir, name, &entity.to_document())
            }
            SaveChoice::Merge => {
                let mut merged = E::from_document(name, &stored)?;
                merged.merge_from(entity.clone());
                merged.validate()?;

                let document = merged.to_document();
                if document == stored {
                    debug!("{} '{name}' unchanged by merge, not rewriting {}", E::KIND, path.display());
                    return Ok(path);
                }
                info!("Merging {} '{name}' into {}", E::KIND, path.display());
                self.store.write(target_dir, name, &document)
            }
            SaveChoice::Cancel => {
                warn!("Saving {} '{name}' cancelled", E::KIND);
                Err(ConfigError::Aborted { entity: name.to_string() })
            }
        }
    }

    /// Write `{"default": name}` as the directory's default marker
    pub fn write_default_marker(&self, target_dir: &Path, name: &str) -> Result<PathBuf> {
        info!("Marking '{name}' as default in {}", target_dir.display());
        self.store.write(target_dir, DEFAULT_KEY, &json!({ DEFAULT_KEY: name }))
    }

    fn decide(&self, kind: EntityKind, name: &str, path: &Path, options: SaveOptions) -> Result<SaveChoice> {
        if options.overwrite {
            return Ok(SaveChoice::Overwrite);
        }
        if options.merge {
            return Ok(SaveChoice::Merge);
        }
        match self.prompt {
            Some(prompt) if options.interactive => Ok(prompt.choose(kind, name, path)),
            _ => {
                warn!("{kind} '{name}' already exists at {}", path.display());
                Err(ConfigError::AlreadyExists { path: path.to_path_buf() })
            }
        }
    }
}
