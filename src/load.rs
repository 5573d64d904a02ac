//! Turn a name into a validated entity
//!
//! Loading is resolve, then schema check, then typed conversion. What happens when a name
//! can't be resolved is up to the caller through [`NotFoundFallback`]; the loader itself never
//! asks anyone anything.

use std::collections::HashMap;

use log::{info, warn};
use serde_json::{json, Value};

use crate::entity::codes::CodesConfig;
pub use crate::entity::machine::LOCAL_DESKTOP;

use crate::entity::machine::{Machine, DEFAULT_LAUNCHER, DEFAULT_NPROCS, DEFAULT_WORKDIR};
use crate::entity::schema::SchemaSet;
use crate::entity::Entity;
use crate::error::{ConfigError, Result};
use crate::kind::EntityKind;
use crate::store::resolve::{Resolution, Resolved, Resolver};

/// Picks a replacement for a missing name, given every name that does exist
pub type ReplacementPrompt<'a> = Box<dyn Fn(&str, &[String]) -> Option<String> + 'a>;

/// What to do when a requested name isn't in any source
pub enum NotFoundFallback<'a> {
    Fail,
    /// Use this document instead; its own `name` is kept if it has one
    Builtin(Value),
    /// Ask for another name once; `None` means give up
    Prompt(ReplacementPrompt<'a>),
}

impl<'a> NotFoundFallback<'a> {
    /// A local machine running `mpirun` in the current directory
    pub fn local_desktop() -> Self {
        NotFoundFallback::Builtin(json!({
            "name": LOCAL_DESKTOP,
            "execution": "local",
            "scheduler": "direct",
            "workdir": DEFAULT_WORKDIR,
            "nprocs": DEFAULT_NPROCS,
            "launcher": DEFAULT_LAUNCHER,
        }))
    }

    pub fn prompt(callback: impl Fn(&str, &[String]) -> Option<String> + 'a) -> Self {
        NotFoundFallback::Prompt(Box::new(callback))
    }
}

pub struct Loader<'a> {
    resolver: Resolver<'a>,
    schemas: SchemaSet,
    fallbacks: HashMap<EntityKind, NotFoundFallback<'a>>,
}

impl<'a> Loader<'a> {
    pub fn new(resolver: Resolver<'a>) -> Result<Self> {
        Ok(Loader { resolver, schemas: SchemaSet::load()?, fallbacks: HashMap::new() })
    }

    /// Replace the not-found behaviour for one kind; every kind starts with `Fail`
    pub fn with_fallback(mut self, kind: EntityKind, fallback: NotFoundFallback<'a>) -> Self {
        self.fallbacks.insert(kind, fallback);
        self
    }

    pub fn resolver(&self) -> &Resolver<'a> {
        &self.resolver
    }

    /// Load `name`, or the default when `name` is `None`
    ///
    /// A declared default must exist. Without a declaration the kind's implicit name (a machine
    /// called `local_desktop`) is loaded like any other name, fallback included.
    pub fn load<E: Entity>(&self, name: Option<&str>) -> Result<E> {
        let resolved = match name {
            Some(name) => self.resolve_or_fall_back(E::KIND, name)?,
            None => match self.resolver.declared_default(E::KIND)? {
                Some(declared) => self.resolver.follow_default(E::KIND, &declared)?,
                None => {
                    let implicit = self.resolver.default_name(E::KIND)?;
                    self.resolve_or_fall_back(E::KIND, &implicit)?
                }
            },
        };

        info!("Loading {} '{}' from {}", E::KIND, resolved.name, resolved.source.display());
        self.schemas.check(E::KIND, &resolved.name, &resolved.document)?;
        E::from_document(&resolved.name, &resolved.document)
    }

    pub fn load_machine(&self, name: Option<&str>) -> Result<Machine> {
        self.load(name)
    }

    /// Codes configs are keyed by the machine they describe
    pub fn load_codes(&self, machine_name: Option<&str>) -> Result<CodesConfig> {
        self.load(machine_name)
    }

    fn resolve_or_fall_back(&self, kind: EntityKind, name: &str) -> Result<Resolved> {
        match self.resolver.resolve(kind, name)? {
            Resolution::Found(resolved) => Ok(resolved),
            Resolution::NotFound => self.fall_back(kind, name),
        }
    }

    fn fall_back(&self, kind: EntityKind, name: &str) -> Result<Resolved> {
        match self.fallbacks.get(&kind) {
            None | Some(NotFoundFallback::Fail) => Err(self.not_found(kind, name)),
            Some(NotFoundFallback::Builtin(document)) => {
                let builtin = document.get("name").and_then(Value::as_str).unwrap_or(name);
                warn!("{kind} '{name}' not found, using built-in '{builtin}'");
                Ok(Resolved {
                    name: builtin.to_string(),
                    document: document.clone(),
                    source: "<built-in>".into(),
                })
            }
            Some(NotFoundFallback::Prompt(prompt)) => {
                let available = self.resolver.list(kind)?;
                match prompt(name, &available) {
                    Some(replacement) => {
                        info!("{kind} '{name}' not found, trying '{replacement}' instead");
                        match self.resolver.resolve(kind, &replacement)? {
                            Resolution::Found(resolved) => Ok(resolved),
                            Resolution::NotFound => Err(self.not_found(kind, &replacement)),
                        }
                    }
                    None => Err(self.not_found(kind, name)),
                }
            }
        }
    }

    fn not_found(&self, kind: EntityKind, name: &str) -> ConfigError {
        ConfigError::NotFound {
            kind,
            name: name.to_string(),
            searched: self.resolver.searched(kind, name),
        }
    }
}
