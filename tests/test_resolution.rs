//! Tests for source resolution, default indirection and loading

use rstest::rstest;
use serde_json::{json, Value};
use tempfile::TempDir;

use qe_machines::store::resolve::Resolution;
use qe_machines::{
    CodesConfig, ConfigError, ConfigPaths, DocumentStore, EntityKind, FsStore, Loader, Machine, NotFoundFallback,
    Resolver, SqliteStore,
};

const MACHINES: EntityKind = EntityKind::Machines;

fn write_entity(store: &dyn DocumentStore, paths: &ConfigPaths, name: &str, doc: Value) {
    store.write(&paths.entity_dir(MACHINES), name, &doc).unwrap();
}

fn write_aggregate(store: &dyn DocumentStore, paths: &ConfigPaths, doc: Value) {
    let aggregate = paths.aggregate(MACHINES);
    store.write(&aggregate.location, &aggregate.name, &doc).unwrap();
}

// ============== Source Order Tests ==============

#[rstest]
fn test_per_entity_document_wins_over_aggregate() {
    let dir = TempDir::new().unwrap();
    let paths = ConfigPaths::new(dir.path());
    write_entity(&FsStore, &paths, "cluster", json!({"execution": "local", "workdir": "/from/file"}));
    write_aggregate(&FsStore, &paths, json!({"machines": {"cluster": {"execution": "local", "workdir": "/from/aggregate"}}}));

    let loader = Loader::new(Resolver::new(&FsStore, paths)).unwrap();
    let machine = loader.load_machine(Some("cluster")).unwrap();
    assert_eq!(machine.workdir, "/from/file");
}

#[rstest]
fn test_aggregate_used_when_no_per_entity_document() {
    let dir = TempDir::new().unwrap();
    let paths = ConfigPaths::new(dir.path());
    write_aggregate(&FsStore, &paths, json!({"machines": {"cluster": {"workdir": "/from/aggregate"}}}));

    let resolver = Resolver::new(&FsStore, paths.clone());
    match resolver.resolve(MACHINES, "cluster").unwrap() {
        Resolution::Found(resolved) => {
            assert_eq!(resolved.source, dir.path().join("machines.json"));
            assert_eq!(resolved.document, json!({"workdir": "/from/aggregate"}));
        }
        Resolution::NotFound => panic!("expected the aggregate entry"),
    }
    assert_eq!(resolver.resolve(MACHINES, "other").unwrap(), Resolution::NotFound);
}

#[rstest]
fn test_list_is_sorted_union_without_default() {
    let dir = TempDir::new().unwrap();
    let paths = ConfigPaths::new(dir.path());
    write_entity(&FsStore, &paths, "zeta", json!({}));
    write_entity(&FsStore, &paths, "default", json!({"default": "zeta"}));
    write_aggregate(&FsStore, &paths, json!({"default": "alpha", "machines": {"alpha": {}, "zeta": {}}}));

    let resolver = Resolver::new(&FsStore, paths);
    assert_eq!(resolver.list(MACHINES).unwrap(), vec!["alpha", "zeta"]);
}

// ============== Default Indirection Tests ==============

#[rstest]
fn test_default_followed_once() {
    let dir = TempDir::new().unwrap();
    let paths = ConfigPaths::new(dir.path());
    write_entity(&FsStore, &paths, "cluster", json!({"execution": "remote", "host": "hpc.example.org", "username": "qe"}));
    write_aggregate(&FsStore, &paths, json!({"default": "cluster", "machines": {}}));

    let loader = Loader::new(Resolver::new(&FsStore, paths)).unwrap();
    let machine = loader.load_machine(None).unwrap();
    assert_eq!(machine.name, "cluster");
    assert!(machine.is_remote());
}

#[rstest]
fn test_aggregate_default_wins_over_marker() {
    let dir = TempDir::new().unwrap();
    let paths = ConfigPaths::new(dir.path());
    write_entity(&FsStore, &paths, "a", json!({}));
    write_entity(&FsStore, &paths, "b", json!({}));
    write_entity(&FsStore, &paths, "default", json!({"default": "b"}));
    write_aggregate(&FsStore, &paths, json!({"default": "a"}));

    let resolver = Resolver::new(&FsStore, paths);
    assert_eq!(resolver.default_name(MACHINES).unwrap(), "a");
}

#[rstest]
fn test_no_default_loads_local_desktop_by_name() {
    let dir = TempDir::new().unwrap();
    let paths = ConfigPaths::new(dir.path());
    write_entity(&FsStore, &paths, "local_desktop", json!({"execution": "local", "nprocs": 8}));
    write_aggregate(&FsStore, &paths, json!({"machines": {"a": {}}}));

    let loader = Loader::new(Resolver::new(&FsStore, paths)).unwrap();
    let machine = loader.load_machine(None).unwrap();
    assert_eq!(machine.name, "local_desktop");
    assert_eq!(machine.nprocs, 8);
}

#[rstest]
fn test_no_default_uses_the_fallback() {
    let dir = TempDir::new().unwrap();
    let paths = ConfigPaths::new(dir.path());
    write_aggregate(&FsStore, &paths, json!({"machines": {"a": {}}}));

    let strict = Loader::new(Resolver::new(&FsStore, paths.clone())).unwrap();
    match strict.load_machine(None) {
        Err(ConfigError::NotFound { name, .. }) => assert_eq!(name, "local_desktop"),
        other => panic!("unexpected {other:?}"),
    }

    let lenient = Loader::new(Resolver::new(&FsStore, paths))
        .unwrap()
        .with_fallback(MACHINES, NotFoundFallback::local_desktop());
    let machine = lenient.load_machine(None).unwrap();
    assert_eq!(machine.name, "local_desktop");
    assert!(machine.is_local());
}

#[rstest]
#[case::not_a_string(json!({"default": 3, "machines": {"a": {}}}))]
#[case::empty(json!({"default": "", "machines": {"a": {}}}))]
#[case::points_at_itself(json!({"default": "default", "machines": {"a": {}}}))]
#[case::dangling(json!({"default": "ghost", "machines": {"a": {}}}))]
#[case::chained(json!({"default": "a", "machines": {"a": {"default": "b"}, "b": {}}}))]
fn test_invalid_defaults(#[case] aggregate: Value) {
    let dir = TempDir::new().unwrap();
    let paths = ConfigPaths::new(dir.path());
    write_aggregate(&FsStore, &paths, aggregate);

    let loader = Loader::new(Resolver::new(&FsStore, paths)).unwrap();
    let result = loader.load_machine(None);
    assert!(
        matches!(result, Err(ConfigError::InvalidDefault { kind: EntityKind::Machines, .. })),
        "{result:?}"
    );
}

// ============== Validation Tests ==============

#[rstest]
fn test_remote_without_host_fails() {
    let dir = TempDir::new().unwrap();
    let paths = ConfigPaths::new(dir.path());
    write_entity(&FsStore, &paths, "cluster", json!({"execution": "remote", "username": "qe"}));

    let loader = Loader::new(Resolver::new(&FsStore, paths)).unwrap();
    match loader.load_machine(Some("cluster")) {
        Err(ConfigError::Validation { entity, fields }) => {
            assert_eq!(entity, "machine 'cluster'");
            assert!(fields.iter().any(|field| field.starts_with("host")), "{fields:?}");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[rstest]
fn test_local_ignores_host() {
    let dir = TempDir::new().unwrap();
    let paths = ConfigPaths::new(dir.path());
    write_entity(&FsStore, &paths, "desk", json!({"execution": "local", "host": "ignored.example.org", "username": "nobody"}));

    let loader = Loader::new(Resolver::new(&FsStore, paths)).unwrap();
    let machine: Machine = loader.load(Some("desk")).unwrap();
    assert!(machine.is_local());
    assert!(machine.remote_target().is_none());
}

#[rstest]
fn test_codes_loaded_by_machine_name() {
    let dir = TempDir::new().unwrap();
    let paths = ConfigPaths::new(dir.path());
    FsStore
        .write(
            &paths.entity_dir(EntityKind::Codes),
            "cluster",
            &json!({"qe_version": "7.2", "versions": {"7.2": {"codes": {"pw": {"path": "/opt/qe-7.2/bin/pw.x"}}}}}),
        )
        .unwrap();

    let loader = Loader::new(Resolver::new(&FsStore, paths)).unwrap();
    let codes: CodesConfig = loader.load_codes(Some("cluster")).unwrap();
    assert_eq!(codes.machine_name, "cluster");
    assert!(codes.has_code("pw", Some("7.2")));
    assert!(!codes.has_code("pw", None));
}

// ============== Store Tests ==============

#[rstest]
fn test_sqlite_store_resolves_the_same_way() {
    let store = SqliteStore::open_in_memory().unwrap();
    let paths = ConfigPaths::new("/virtual/root");
    write_entity(&store, &paths, "cluster", json!({"workdir": "/from/entity"}));
    write_aggregate(&store, &paths, json!({"default": "cluster", "machines": {"cluster": {"workdir": "/from/aggregate"}, "other": {}}}));

    let loader = Loader::new(Resolver::new(&store, paths)).unwrap();
    assert_eq!(loader.load_machine(None).unwrap().workdir, "/from/entity");
    assert_eq!(loader.resolver().list(MACHINES).unwrap(), vec!["cluster", "other"]);
}
