use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde_json::Value;

use qe_machines::detect::{DetectOptions, Detector};
use qe_machines::session::transport_for;
use qe_machines::{
    CodesConfig, ConfigPaths, DocumentStore, Entity, EntityKind, FsStore, Loader, Machine, MigrationReport,
    Migrator, Persister, Resolver, SaveOptions, SessionCache, SqliteStore,
};

#[derive(Parser)]
#[command(author, version, about = "Resolve, migrate and inspect Quantum ESPRESSO machine configuration")]
struct Args {
    /// Configuration root, defaults to $XESPRESSO_HOME or ~/.xespresso
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Keep documents in this SQLite file instead of JSON files below the root
    #[arg(long, global = true)]
    sqlite: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every configured name of a kind
    List {
        #[arg(value_enum)]
        kind: EntityKind,
    },
    /// Print the resolved document, or the default one when no name is given
    Show {
        #[arg(value_enum)]
        kind: EntityKind,
        name: Option<String>,
    },
    /// Print the name the default points at
    Default {
        #[arg(value_enum)]
        kind: EntityKind,
    },
    /// Split <root>/<kind>.json into one document per entity
    Migrate {
        #[arg(value_enum)]
        kind: EntityKind,
        /// Only migrate these names
        #[arg(long, value_delimiter = ',')]
        names: Option<Vec<String>>,
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
    /// Remove per-entity documents written by migrate
    Rollback {
        #[arg(value_enum)]
        kind: EntityKind,
        #[arg(long, value_delimiter = ',')]
        names: Option<Vec<String>>,
    },
    /// Probe a machine for Quantum ESPRESSO executables
    Detect {
        /// Machine name, the default machine when omitted
        machine: Option<String>,
        /// Store the codes under this version label
        #[arg(long)]
        qe_version: Option<String>,
        #[arg(long)]
        qe_prefix: Option<String>,
        /// Module to load before probing, may be repeated
        #[arg(long = "module")]
        modules: Vec<String>,
        /// Per-command timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
        /// Merge the result into the stored codes config
        #[arg(long, default_value_t = false)]
        save: bool,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let paths = match &args.root {
        Some(root) => ConfigPaths::new(root),
        None => ConfigPaths::from_env().context("Can't work out the configuration root")?,
    };
    info!("Using configuration root {}", paths.root().display());

    let store: Box<dyn DocumentStore> = match &args.sqlite {
        Some(db) => Box::new(SqliteStore::open(db).with_context(|| format!("Can't open {}", db.display()))?),
        None => Box::new(FsStore),
    };

    match args.command {
        Commands::List { kind } => {
            let resolver = Resolver::new(store.as_ref(), paths);
            for name in resolver.list(kind).with_context(|| format!("Can't list {kind} entries"))? {
                println!("{name}");
            }
        }
        Commands::Show { kind, name } => {
            let loader = Loader::new(Resolver::new(store.as_ref(), paths))?;
            let document = match kind {
                EntityKind::Machines => show::<Machine>(&loader, name.as_deref())?,
                EntityKind::Codes => show::<CodesConfig>(&loader, name.as_deref())?,
            };
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
        Commands::Default { kind } => {
            let resolver = Resolver::new(store.as_ref(), paths);
            println!("{}", resolver.default_name(kind)?);
        }
        Commands::Migrate { kind, names, overwrite } => {
            let migrator = Migrator::new(store.as_ref())?;
            let aggregate = paths.aggregate(kind);
            let output_dir = paths.entity_dir(kind);
            let report = match kind {
                EntityKind::Machines => migrator.migrate::<Machine>(&aggregate, &output_dir, names.as_deref(), overwrite),
                EntityKind::Codes => migrator.migrate::<CodesConfig>(&aggregate, &output_dir, names.as_deref(), overwrite),
            }
            .with_context(|| format!("Can't migrate {}", aggregate.path(store.as_ref()).display()))?;
            print_report(&report);
            report.into_result()?;
        }
        Commands::Rollback { kind, names } => {
            let migrator = Migrator::new(store.as_ref())?;
            let report = migrator.rollback(&paths.entity_dir(kind), names.as_deref())?;
            println!("removed: {}", report.removed.join(", "));
            if !report.missing.is_empty() {
                println!("missing: {}", report.missing.join(", "));
            }
            if !report.failed.is_empty() {
                bail!("failed to remove: {}", report.failed.join(", "));
            }
        }
        Commands::Detect { machine, qe_version, qe_prefix, modules, timeout, save } => {
            let loader = Loader::new(Resolver::new(store.as_ref(), paths.clone()))?;
            let machine = loader.load_machine(machine.as_deref()).context("Can't load machine")?;

            let cache = SessionCache::new();
            let transport = transport_for(&machine);
            let timeout = Duration::from_secs(timeout);
            let detected = cache
                .acquire_for(&machine, transport.as_ref(), Some(timeout))
                .map_err(anyhow::Error::from)
                .and_then(|session| {
                    let options = DetectOptions { qe_prefix, modules, version: qe_version, timeout: Some(timeout), ..Default::default() };
                    Ok(Detector::new(session.as_ref(), &machine).detect(&options)?)
                });
            cache.release_all();
            let detected = detected.with_context(|| format!("Detection on '{}' failed", machine.name))?;

            println!("{}", serde_json::to_string_pretty(&detected.to_document())?);
            if save {
                let path = Persister::new(store.as_ref())
                    .save(&detected, &paths.entity_dir(EntityKind::Codes), SaveOptions::merge())?;
                info!("Saved codes for '{}' to {}", machine.name, path.display());
            }
        }
    }
    Ok(())
}

fn show<E: Entity>(loader: &Loader, name: Option<&str>) -> anyhow::Result<Value> {
    let entity: E = loader
        .load(name)
        .with_context(|| format!("Can't load {} {}", E::KIND, name.unwrap_or("default")))?;
    Ok(entity.to_document())
}

fn print_report(report: &MigrationReport) {
    println!("migrated: {}", report.migrated.join(", "));
    if !report.skipped.is_empty() {
        println!("skipped (already present): {}", report.skipped.join(", "));
    }
    for (name, error) in &report.errors {
        warn!("{name}: {error}");
        println!("failed {name}: {error}");
    }
    if let Some(default) = &report.default {
        println!("default: {default}");
    }
}
