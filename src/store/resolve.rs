use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde_json::Value;

use crate::error::{ConfigError, Result};
use crate::kind::EntityKind;
use crate::paths::ConfigPaths;
use crate::store::{DocumentStore, DEFAULT_KEY};

/// A raw document together with the name it was found under and where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub name: String,
    pub document: Value,
    pub source: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found(Resolved),
    NotFound,
}

/// One place a named entity may live
///
/// The resolver walks its strategies in order and stops at the first hit; documents from
/// different sources are never combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStrategy {
    /// `<root>/<kind>/<name>.json`
    PerEntity,
    /// entry `<name>` under the plural key of `<root>/<kind>.json`
    Aggregate,
}

impl ResolveStrategy {
    fn searched(&self, store: &dyn DocumentStore, paths: &ConfigPaths, kind: EntityKind, name: &str) -> PathBuf {
        match self {
            ResolveStrategy::PerEntity => store.path_of(&paths.entity_dir(kind), name),
            ResolveStrategy::Aggregate => paths.aggregate(kind).path(store),
        }
    }

    fn resolve(&self, store: &dyn DocumentStore, paths: &ConfigPaths, kind: EntityKind, name: &str) -> Result<Resolution> {
        let source = self.searched(store, paths, kind, name);
        let document = match self {
            ResolveStrategy::PerEntity => {
                if name == DEFAULT_KEY {
                    return Ok(Resolution::NotFound);
                }
                store.read(&paths.entity_dir(kind), name)?
            }
            ResolveStrategy::Aggregate => {
                let aggregate = paths.aggregate(kind);
                match aggregate.read(store)? {
                    None => None,
                    Some(doc) => aggregate_entries(&doc, kind, &source)?.and_then(|entries| entries.get(name).cloned()),
                }
            }
        };

        Ok(match document {
            Some(document) => {
                info!("Resolved {kind} '{name}' from {}", source.display());
                Resolution::Found(Resolved { name: name.to_string(), document, source })
            }
            None => Resolution::NotFound,
        })
    }

    /// The raw `"default"` value declared by this source, if any
    fn declared_default(&self, store: &dyn DocumentStore, paths: &ConfigPaths, kind: EntityKind) -> Result<Option<(Value, PathBuf)>> {
        let (document, source) = match self {
            ResolveStrategy::PerEntity => {
                let dir = paths.entity_dir(kind);
                (store.read(&dir, DEFAULT_KEY)?, store.path_of(&dir, DEFAULT_KEY))
            }
            ResolveStrategy::Aggregate => {
                let aggregate = paths.aggregate(kind);
                (aggregate.read(store)?, aggregate.path(store))
            }
        };
        Ok(document
            .and_then(|doc| doc.get(DEFAULT_KEY).cloned())
            .filter(|value| !value.is_null())
            .map(|value| (value, source)))
    }

    fn names(&self, store: &dyn DocumentStore, paths: &ConfigPaths, kind: EntityKind) -> Result<Vec<String>> {
        match self {
            ResolveStrategy::PerEntity => store.list(&paths.entity_dir(kind)),
            ResolveStrategy::Aggregate => {
                let aggregate = paths.aggregate(kind);
                let source = aggregate.path(store);
                Ok(match aggregate.read(store)? {
                    None => Vec::new(),
                    Some(doc) => aggregate_entries(&doc, kind, &source)?
                        .map(|entries| entries.keys().cloned().collect())
                        .unwrap_or_default(),
                })
            }
        }
    }
}

/// The `{name: document}` map nested in an aggregate; `None` when the key is absent
pub(crate) fn aggregate_entries<'a>(doc: &'a Value, kind: EntityKind, source: &Path) -> Result<Option<&'a serde_json::Map<String, Value>>> {
    match doc.get(kind.plural_key()) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(entries)) => Ok(Some(entries)),
        Some(_) => Err(ConfigError::validation(
            source.display().to_string(),
            format!("{}: expected an object of named entries", kind.plural_key()),
        )),
    }
}

/// Read-only lookup of raw documents across the configured sources
pub struct Resolver<'a> {
    store: &'a dyn DocumentStore,
    paths: ConfigPaths,
    strategies: Vec<ResolveStrategy>,
}

impl<'a> Resolver<'a> {
    /// Per-entity documents first, then the aggregate
    pub fn new(store: &'a dyn DocumentStore, paths: ConfigPaths) -> Self {
        Self::with_strategies(store, paths, vec![ResolveStrategy::PerEntity, ResolveStrategy::Aggregate])
    }

    pub fn with_strategies(store: &'a dyn DocumentStore, paths: ConfigPaths, strategies: Vec<ResolveStrategy>) -> Self {
        Resolver { store, paths, strategies }
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    pub fn store(&self) -> &'a dyn DocumentStore {
        self.store
    }

    pub fn resolve(&self, kind: EntityKind, name: &str) -> Result<Resolution> {
        for strategy in &self.strategies {
            if let Resolution::Found(resolved) = strategy.resolve(self.store, &self.paths, kind, name)? {
                return Ok(Resolution::Found(resolved));
            }
            debug!("{kind} '{name}' not in {:?} source", strategy);
        }
        Ok(Resolution::NotFound)
    }

    /// Every location `resolve` looks at for this name, in order
    pub fn searched(&self, kind: EntityKind, name: &str) -> Vec<PathBuf> {
        self.strategies
            .iter()
            .map(|strategy| strategy.searched(self.store, &self.paths, kind, name))
            .collect()
    }

    /// The name a `"default"` key points at, if any source declares one
    ///
    /// The aggregate's declaration wins over `<kind>/default.json`. A declaration that isn't a
    /// usable name is an error rather than no declaration.
    pub fn declared_default(&self, kind: EntityKind) -> Result<Option<String>> {
        let mut declared = None;
        for strategy in self.strategies.iter().rev() {
            if let Some(found) = strategy.declared_default(self.store, &self.paths, kind)? {
                declared = Some(found);
                break;
            }
        }
        let Some((value, source)) = declared else {
            debug!("No default {kind} declared");
            return Ok(None);
        };

        match value.as_str().map(str::trim) {
            Some(name) if name == DEFAULT_KEY => Err(ConfigError::InvalidDefault {
                kind,
                reason: format!("default in {} points at itself", source.display()),
            }),
            Some(name) if !name.is_empty() => {
                info!("Found default {kind} in {}: {name}", source.display());
                Ok(Some(name.to_string()))
            }
            _ => Err(ConfigError::InvalidDefault {
                kind,
                reason: format!("default in {} is not a name: {value}", source.display()),
            }),
        }
    }

    /// The name loaded when none is given: the declared default, else the kind's implicit one
    pub fn default_name(&self, kind: EntityKind) -> Result<String> {
        if let Some(name) = self.declared_default(kind)? {
            return Ok(name);
        }
        match kind.implicit_default() {
            Some(name) => {
                info!("No default {kind} declared, using '{name}'");
                Ok(name.to_string())
            }
            None => Err(self.no_default(kind)),
        }
    }

    /// Follow a declared default exactly once
    pub fn resolve_default(&self, kind: EntityKind) -> Result<Resolved> {
        match self.declared_default(kind)? {
            Some(name) => self.follow_default(kind, &name),
            None => Err(self.no_default(kind)),
        }
    }

    /// Resolve the target of a default declaration
    ///
    /// The target must exist and must not itself be another `{"default": ...}` pointer.
    pub fn follow_default(&self, kind: EntityKind, name: &str) -> Result<Resolved> {
        match self.resolve(kind, name)? {
            Resolution::NotFound => Err(ConfigError::InvalidDefault {
                kind,
                reason: format!("default points at '{name}', which does not exist"),
            }),
            Resolution::Found(resolved) if resolved.document.get(DEFAULT_KEY).is_some() => {
                Err(ConfigError::InvalidDefault {
                    kind,
                    reason: format!("default '{name}' in {} is itself a default pointer", resolved.source.display()),
                })
            }
            Resolution::Found(resolved) => Ok(resolved),
        }
    }

    /// Sorted union of names across all sources, without the reserved default document
    pub fn list(&self, kind: EntityKind) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        for strategy in &self.strategies {
            names.extend(strategy.names(self.store, &self.paths, kind)?);
        }
        names.remove(DEFAULT_KEY);
        Ok(names.into_iter().collect())
    }

    fn no_default(&self, kind: EntityKind) -> ConfigError {
        let mut searched = self.searched(kind, DEFAULT_KEY);
        searched.reverse();
        ConfigError::NotFound { kind, name: DEFAULT_KEY.to_string(), searched }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fs::FsStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ConfigPaths) {
        let dir = TempDir::new().unwrap();
        let paths = ConfigPaths::new(dir.path());
        (dir, paths)
    }

    #[test]
    fn test_aggregate_only() {
        let (_dir, paths) = setup();
        let store = FsStore;
        let aggregate = paths.aggregate(EntityKind::Machines);
        store.write(&aggregate.location, &aggregate.name, &json!({"machines": {"a": {"nprocs": 2}}})).unwrap();

        let resolver = Resolver::new(&store, paths.clone());
        match resolver.resolve(EntityKind::Machines, "a").unwrap() {
            Resolution::Found(r) => {
                assert_eq!(r.document, json!({"nprocs": 2}));
                assert_eq!(r.source, paths.root().join("machines.json"));
            }
            Resolution::NotFound => panic!("expected a hit"),
        }
        assert_eq!(resolver.resolve(EntityKind::Machines, "b").unwrap(), Resolution::NotFound);
        assert_eq!(resolver.resolve(EntityKind::Codes, "a").unwrap(), Resolution::NotFound);
    }

    #[test]
    fn test_aggregate_with_wrong_shape_is_rejected() {
        let (_dir, paths) = setup();
        let store = FsStore;
        store.write(paths.root(), "machines", &json!({"machines": ["a"]})).unwrap();

        let resolver = Resolver::new(&store, paths);
        assert!(matches!(
            resolver.resolve(EntityKind::Machines, "a"),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn test_default_document_is_not_an_entity() {
        let (_dir, paths) = setup();
        let store = FsStore;
        store.write(&paths.entity_dir(EntityKind::Machines), "default", &json!({"default": "a"})).unwrap();
        store.write(&paths.entity_dir(EntityKind::Machines), "a", &json!({})).unwrap();

        let resolver = Resolver::new(&store, paths);
        assert_eq!(resolver.resolve(EntityKind::Machines, "default").unwrap(), Resolution::NotFound);
        assert_eq!(resolver.list(EntityKind::Machines).unwrap(), vec!["a"]);
    }

    #[test]
    fn test_default_rejects_non_string_and_self_reference() {
        let (_dir, paths) = setup();
        let store = FsStore;
        let dir = paths.entity_dir(EntityKind::Machines);

        store.write(&dir, "default", &json!({"default": 3})).unwrap();
        let resolver = Resolver::new(&store, paths.clone());
        assert!(matches!(resolver.default_name(EntityKind::Machines), Err(ConfigError::InvalidDefault { .. })));

        store.write(&dir, "default", &json!({"default": "default"})).unwrap();
        assert!(matches!(resolver.resolve_default(EntityKind::Machines), Err(ConfigError::InvalidDefault { .. })));
    }

    #[test]
    fn test_no_default_declared() {
        let (_dir, paths) = setup();
        let store = FsStore;
        let resolver = Resolver::new(&store, paths.clone());
        assert_eq!(resolver.declared_default(EntityKind::Machines).unwrap(), None);
        assert_eq!(resolver.default_name(EntityKind::Machines).unwrap(), "local_desktop");

        match resolver.default_name(EntityKind::Codes) {
            Err(ConfigError::NotFound { kind, name, searched }) => {
                assert_eq!(kind, EntityKind::Codes);
                assert_eq!(name, "default");
                assert_eq!(searched, vec![paths.root().join("codes.json"), paths.root().join("codes/default.json")]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(resolver.resolve_default(EntityKind::Machines), Err(ConfigError::NotFound { .. })));
    }

    #[test]
    fn test_aggregate_default_checked_before_marker() {
        let (_dir, paths) = setup();
        let store = FsStore;
        store.write(&paths.entity_dir(EntityKind::Machines), "default", &json!({"default": "b"})).unwrap();
        let resolver = Resolver::new(&store, paths.clone());
        assert_eq!(resolver.declared_default(EntityKind::Machines).unwrap().as_deref(), Some("b"));

        store.write(paths.root(), "machines", &json!({"default": "a", "machines": {}})).unwrap();
        assert_eq!(resolver.declared_default(EntityKind::Machines).unwrap().as_deref(), Some("a"));

        // an aggregate without a default key leaves the marker in charge
        store.write(paths.root(), "machines", &json!({"machines": {}})).unwrap();
        assert_eq!(resolver.declared_default(EntityKind::Machines).unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_aggregate_only_strategy() {
        let (_dir, paths) = setup();
        let store = FsStore;
        store.write(&paths.entity_dir(EntityKind::Machines), "a", &json!({"nprocs": 1})).unwrap();
        store.write(paths.root(), "machines", &json!({"machines": {"a": {"nprocs": 9}}})).unwrap();

        let resolver = Resolver::with_strategies(&store, paths, vec![ResolveStrategy::Aggregate]);
        match resolver.resolve(EntityKind::Machines, "a").unwrap() {
            Resolution::Found(r) => assert_eq!(r.document, json!({"nprocs": 9})),
            Resolution::NotFound => panic!("expected a hit"),
        }
    }
}
