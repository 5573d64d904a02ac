use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::entity::{name_problem, Entity};
use crate::error::{ConfigError, Result};
use crate::kind::EntityKind;
use crate::paths::expand_home;
use crate::session::cache::SessionKey;

/// Machine loaded when nothing names one and no default is declared
pub const LOCAL_DESKTOP: &str = "local_desktop";
pub const DEFAULT_WORKDIR: &str = "./";
pub const DEFAULT_NPROCS: u32 = 1;
pub const DEFAULT_LAUNCHER: &str = "mpirun -np {nprocs}";
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_SSH_KEY: &str = "~/.ssh/id_rsa";
/// Shell setup run before every remote command when a machine doesn't set its own
pub const DEFAULT_ENV_SETUP: &str = "source /etc/profile";
/// The only supported authentication method
pub const KEY_AUTH: &str = "key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Local,
    Remote,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecutionMode::Local => write!(f, "local"),
            ExecutionMode::Remote => write!(f, "remote"),
        }
    }
}

/// Batch scheduler in front of a machine; unknown labels are kept as-is
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SchedulerKind {
    #[default]
    Direct,
    Slurm,
    Other(String),
}

impl From<String> for SchedulerKind {
    fn from(label: String) -> Self {
        match label.as_str() {
            "direct" => SchedulerKind::Direct,
            "slurm" => SchedulerKind::Slurm,
            _ => SchedulerKind::Other(label),
        }
    }
}

impl From<SchedulerKind> for String {
    fn from(kind: SchedulerKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SchedulerKind::Direct => write!(f, "direct"),
            SchedulerKind::Slurm => write!(f, "slurm"),
            SchedulerKind::Other(label) => write!(f, "{label}"),
        }
    }
}

/// Key-based SSH credentials; the key itself is handled by the ssh client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
    /// Overrides the machine's port when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

fn default_auth_method() -> String {
    KEY_AUTH.to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig { method: default_auth_method(), ssh_key: None, port: None }
    }
}

impl AuthConfig {
    pub fn ssh_key_path(&self) -> PathBuf {
        expand_home(self.ssh_key.as_deref().unwrap_or(DEFAULT_SSH_KEY))
    }

    fn to_document(&self) -> Value {
        let mut doc = Map::new();
        doc.insert("method".into(), json!(self.method));
        if let Some(key) = &self.ssh_key {
            doc.insert("ssh_key".into(), json!(key));
        }
        if let Some(port) = self.port {
            doc.insert("port".into(), json!(port));
        }
        Value::Object(doc)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub username: String,
    pub port: u16,
    pub auth: AuthConfig,
}

impl RemoteTarget {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        RemoteTarget {
            host: host.into(),
            username: username.into(),
            port: DEFAULT_SSH_PORT,
            auth: AuthConfig::default(),
        }
    }

    pub fn effective_port(&self) -> u16 {
        self.auth.port.unwrap_or(self.port)
    }
}

/// Where commands run. Remote fields only exist on the remote variant, so a local machine
/// can't carry a stray host and a remote one can't lack one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    Local,
    Remote(RemoteTarget),
}

/// `prepend`/`postpend` may be written as one string or a list of lines
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScriptBlock {
    Text(String),
    Lines(Vec<String>),
}

impl From<ScriptBlock> for Vec<String> {
    fn from(block: ScriptBlock) -> Self {
        match block {
            ScriptBlock::Text(text) => text.lines().map(String::from).collect(),
            ScriptBlock::Lines(lines) => lines,
        }
    }
}

/// Stored shape of a machine; everything optional so defaulting happens in one place
#[derive(Debug, Deserialize)]
struct MachineDocument {
    name: Option<String>,
    execution: Option<ExecutionMode>,
    scheduler: Option<SchedulerKind>,
    workdir: Option<String>,
    nprocs: Option<u32>,
    launcher: Option<String>,
    host: Option<String>,
    username: Option<String>,
    port: Option<u16>,
    auth: Option<AuthConfig>,
    use_modules: Option<bool>,
    modules: Option<Vec<String>>,
    env_setup: Option<String>,
    resources: Option<Map<String, Value>>,
    prepend: Option<ScriptBlock>,
    postpend: Option<ScriptBlock>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// A named execution target
#[derive(Debug, Clone, PartialEq)]
pub struct Machine {
    pub name: String,
    pub execution: Execution,
    pub scheduler: SchedulerKind,
    pub workdir: String,
    pub nprocs: u32,
    /// Launch template, `{nprocs}` is substituted when rendering a queue
    pub launcher: String,
    pub use_modules: bool,
    pub modules: Vec<String>,
    /// Never defaulted at rest, see [`DEFAULT_ENV_SETUP`]
    pub env_setup: Option<String>,
    /// Scheduler-specific, not interpreted here
    pub resources: Map<String, Value>,
    pub prepend: Vec<String>,
    pub postpend: Vec<String>,
    /// Keys this crate doesn't know about, written back untouched
    pub extra: Map<String, Value>,
}

impl Machine {
    pub fn local(name: impl Into<String>) -> Self {
        Machine {
            name: name.into(),
            execution: Execution::Local,
            scheduler: SchedulerKind::Direct,
            workdir: DEFAULT_WORKDIR.to_string(),
            nprocs: DEFAULT_NPROCS,
            launcher: DEFAULT_LAUNCHER.to_string(),
            use_modules: false,
            modules: Vec::new(),
            env_setup: None,
            resources: Map::new(),
            prepend: Vec::new(),
            postpend: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn remote(name: impl Into<String>, target: RemoteTarget) -> Self {
        Machine { execution: Execution::Remote(target), ..Machine::local(name) }
    }

    /// Load a standalone machine file; the name comes from the document or the file stem
    pub fn from_file(path: &Path) -> Result<Self> {
        let path = expand_home(&path.to_string_lossy());
        let text = fs::read_to_string(&path).map_err(|err| ConfigError::io(&path, err))?;
        let document: Value = serde_json::from_str(&text).map_err(|err| ConfigError::json(&path, err))?;

        let name = match document.get("name").and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        info!("Loading machine '{name}' from {}", path.display());
        Machine::from_document(&name, &document)
    }

    pub fn mode(&self) -> ExecutionMode {
        match self.execution {
            Execution::Local => ExecutionMode::Local,
            Execution::Remote(_) => ExecutionMode::Remote,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.mode() == ExecutionMode::Remote
    }

    pub fn is_local(&self) -> bool {
        self.mode() == ExecutionMode::Local
    }

    pub fn remote_target(&self) -> Option<&RemoteTarget> {
        match &self.execution {
            Execution::Remote(target) => Some(target),
            Execution::Local => None,
        }
    }

    /// Sessions are shared per (host, username)
    pub fn session_key(&self) -> SessionKey {
        match &self.execution {
            Execution::Remote(target) => SessionKey::new(&target.host, &target.username),
            Execution::Local => SessionKey::local(),
        }
    }

    /// Shell steps that must precede any command: environment setup, then module loads
    ///
    /// A remote machine without `env_setup` gets [`DEFAULT_ENV_SETUP`] so the `module`
    /// command exists in non-login shells.
    pub fn command_prelude(&self) -> Vec<String> {
        let mut prelude = Vec::new();
        match self.env_setup.as_deref().map(str::trim) {
            Some(setup) if !setup.is_empty() => prelude.push(setup.to_string()),
            _ if self.is_remote() => prelude.push(DEFAULT_ENV_SETUP.to_string()),
            _ => {}
        }
        if self.use_modules {
            prelude.extend(self.modules.iter().map(|module| format!("module load {module}")));
        }
        prelude
    }

    pub fn wrap_command(&self, command: &str) -> String {
        let mut steps = self.command_prelude();
        steps.push(command.to_string());
        steps.join(" && ")
    }

    fn problems(&self) -> Vec<String> {
        let mut fields: Vec<String> = name_problem("name", &self.name).into_iter().collect();
        if self.nprocs == 0 {
            fields.push("nprocs: must be at least 1".to_string());
        }
        if let Execution::Remote(target) = &self.execution {
            if target.host.trim().is_empty() {
                fields.push("host: required for remote execution".to_string());
            }
            if target.username.trim().is_empty() {
                fields.push("username: required for remote execution".to_string());
            }
            if target.port == 0 {
                fields.push("port: must be between 1 and 65535".to_string());
            }
            if target.auth.method != KEY_AUTH {
                fields.push(format!(
                    "auth.method: only key-based authentication is supported, got '{}'",
                    target.auth.method
                ));
            }
        }
        fields
    }
}

impl Entity for Machine {
    const KIND: EntityKind = EntityKind::Machines;

    fn name(&self) -> &str {
        &self.name
    }

    fn from_document(name: &str, document: &Value) -> Result<Self> {
        let entity = format!("machine '{name}'");
        let doc = MachineDocument::deserialize(document)
            .map_err(|err| ConfigError::validation(&entity, err.to_string()))?;

        let mut fields = Vec::new();
        if let Some(stored) = doc.name.as_deref().filter(|stored| *stored != name) {
            fields.push(format!("name: document is named '{stored}'"));
        }

        let execution = match doc.execution.unwrap_or(ExecutionMode::Local) {
            ExecutionMode::Local => Execution::Local,
            ExecutionMode::Remote => Execution::Remote(RemoteTarget {
                host: doc.host.unwrap_or_default(),
                username: doc.username.unwrap_or_default(),
                port: doc.port.unwrap_or(DEFAULT_SSH_PORT),
                auth: doc.auth.unwrap_or_default(),
            }),
        };

        let machine = Machine {
            name: name.to_string(),
            execution,
            scheduler: doc.scheduler.unwrap_or_default(),
            workdir: doc.workdir.unwrap_or_else(|| DEFAULT_WORKDIR.to_string()),
            nprocs: doc.nprocs.unwrap_or(DEFAULT_NPROCS),
            launcher: doc.launcher.unwrap_or_else(|| DEFAULT_LAUNCHER.to_string()),
            use_modules: doc.use_modules.unwrap_or(false),
            modules: doc.modules.unwrap_or_default(),
            env_setup: doc.env_setup,
            resources: doc.resources.unwrap_or_default(),
            prepend: doc.prepend.map(Vec::from).unwrap_or_default(),
            postpend: doc.postpend.map(Vec::from).unwrap_or_default(),
            extra: doc.extra,
        };

        fields.extend(machine.problems());
        if fields.is_empty() {
            Ok(machine)
        } else {
            Err(ConfigError::Validation { entity, fields })
        }
    }

    fn to_document(&self) -> Value {
        let mut doc = self.extra.clone();
        doc.insert("name".into(), json!(self.name));
        doc.insert("execution".into(), json!(self.mode()));
        doc.insert("scheduler".into(), json!(self.scheduler));
        doc.insert("workdir".into(), json!(self.workdir));
        doc.insert("use_modules".into(), json!(self.use_modules));
        doc.insert("modules".into(), json!(self.modules));
        doc.insert("resources".into(), Value::Object(self.resources.clone()));
        doc.insert("prepend".into(), json!(self.prepend));
        doc.insert("postpend".into(), json!(self.postpend));
        doc.insert("launcher".into(), json!(self.launcher));
        doc.insert("nprocs".into(), json!(self.nprocs));

        if let Execution::Remote(target) = &self.execution {
            doc.insert("host".into(), json!(target.host));
            doc.insert("username".into(), json!(target.username));
            doc.insert("port".into(), json!(target.port));
            doc.insert("auth".into(), target.auth.to_document());
        }
        if let Some(setup) = &self.env_setup {
            doc.insert("env_setup".into(), json!(setup));
        }
        Value::Object(doc)
    }

    fn validate(&self) -> Result<()> {
        let fields = self.problems();
        if fields.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation { entity: format!("machine '{}'", self.name), fields })
        }
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({}/{})", self.name, self.mode(), self.scheduler)
    }
}
