//! Machine and code configuration for dispatching Quantum ESPRESSO calculations
//!
//! A logical machine name is resolved to a validated [`Machine`] profile, a live session to
//! that machine is obtained from a [`SessionCache`], and per-machine metadata such as the
//! installed executables ([`CodesConfig`]) is written back without clobbering what is stored.
//!
//! ```text
//! name -> Resolver -> raw document -> Loader -> Machine -> SessionCache -> Session
//!                                                               |
//!                          Persister <- CodesConfig <- Detector +
//! ```

pub mod detect;
pub mod entity;
pub mod error;
pub mod kind;
pub mod load;
pub mod migrate;
pub mod paths;
pub mod persist;
pub mod queue;
pub mod session;
pub mod store;

pub use entity::codes::{Code, CodesConfig, VersionConfig};
pub use entity::machine::{Execution, ExecutionMode, Machine, RemoteTarget, SchedulerKind};
pub use entity::Entity;
pub use error::{ConfigError, Result, TransportError};
pub use kind::EntityKind;
pub use load::{Loader, NotFoundFallback};
pub use migrate::{MigrationReport, Migrator, RollbackReport};
pub use paths::ConfigPaths;
pub use persist::{ConflictPrompt, Persister, SaveChoice, SaveOptions};
pub use session::cache::{SessionCache, SessionKey};
pub use session::transport::{CommandOutput, ConnectTarget, Session, SessionHandle, Transport};
pub use store::fs::FsStore;
pub use store::resolve::Resolver;
pub use store::sqlite::SqliteStore;
pub use store::DocumentStore;
