//! The flat view of a machine handed to a scheduler

use serde::Serialize;
use serde_json::{Map, Value};
use tinytemplate::{format_unescaped, TinyTemplate};

use crate::entity::machine::{Execution, ExecutionMode, Machine, DEFAULT_SSH_KEY};
use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueAuth {
    pub method: String,
    pub ssh_key: String,
    pub port: u16,
}

/// Everything a scheduler needs to build and place a job script
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Queue {
    pub execution: ExecutionMode,
    pub scheduler: String,
    pub use_modules: bool,
    pub modules: Vec<String>,
    pub resources: Map<String, Value>,
    /// Lines joined with newlines
    pub prepend: String,
    pub postpend: String,
    /// Launcher template with `{nprocs}` filled in
    pub launcher: String,
    pub nprocs: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_auth: Option<QueueAuth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_dir: Option<String>,
}

/// The only value a launcher template may refer to
const NPROCS_PLACEHOLDER: &str = "{nprocs}";

#[derive(Serialize)]
struct LauncherContext {
    nprocs: u32,
}

/// Escape every `{` that doesn't open `{nprocs}`, so shell syntax like `${VAR}` stays literal
fn escape_shell_braces(launcher: &str) -> String {
    let mut escaped = String::with_capacity(launcher.len());
    let mut rest = launcher;
    while let Some(at) = rest.find('{') {
        escaped.push_str(&rest[..at]);
        rest = &rest[at..];
        if rest.starts_with(NPROCS_PLACEHOLDER) {
            escaped.push_str(NPROCS_PLACEHOLDER);
            rest = &rest[NPROCS_PLACEHOLDER.len()..];
        } else {
            escaped.push_str("\\{");
            rest = &rest[1..];
        }
    }
    escaped.push_str(rest);
    escaped
}

/// Render the launcher template using TinyTemplate
fn render_launcher(machine: &Machine) -> Result<String> {
    let invalid = |err: tinytemplate::error::Error| {
        ConfigError::validation(format!("machine '{}'", machine.name), format!("launcher: {err}"))
    };
    let template = escape_shell_braces(&machine.launcher);
    let mut tt = TinyTemplate::new();
    // launchers are shell, not HTML
    tt.set_default_formatter(&format_unescaped);
    tt.add_template("launcher", &template).map_err(invalid)?;
    tt.render("launcher", &LauncherContext { nprocs: machine.nprocs }).map_err(invalid)
}

impl Machine {
    pub fn to_queue(&self) -> Result<Queue> {
        let mut queue = Queue {
            execution: self.mode(),
            scheduler: self.scheduler.to_string(),
            use_modules: self.use_modules,
            modules: self.modules.clone(),
            resources: self.resources.clone(),
            prepend: self.prepend.join("\n"),
            postpend: self.postpend.join("\n"),
            launcher: render_launcher(self)?,
            nprocs: self.nprocs,
            local_dir: None,
            remote_host: None,
            remote_user: None,
            remote_auth: None,
            remote_dir: None,
        };

        match &self.execution {
            Execution::Local => queue.local_dir = Some(self.workdir.clone()),
            Execution::Remote(target) => {
                queue.remote_host = Some(target.host.clone());
                queue.remote_user = Some(target.username.clone());
                queue.remote_auth = Some(QueueAuth {
                    method: target.auth.method.clone(),
                    ssh_key: target.auth.ssh_key.clone().unwrap_or_else(|| DEFAULT_SSH_KEY.to_string()),
                    port: target.effective_port(),
                });
                queue.remote_dir = Some(self.workdir.clone());
            }
        }
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::machine::RemoteTarget;
    use crate::entity::Entity;
    use serde_json::json;

    #[test]
    fn test_local_queue() {
        let mut machine = Machine::local("desk");
        machine.nprocs = 4;
        machine.prepend = vec!["export OMP_NUM_THREADS=1".into(), "ulimit -s unlimited".into()];

        let queue = machine.to_queue().unwrap();
        assert_eq!(queue.launcher, "mpirun -np 4");
        assert_eq!(queue.prepend, "export OMP_NUM_THREADS=1\nulimit -s unlimited");
        assert_eq!(queue.local_dir.as_deref(), Some("./"));
        assert!(queue.remote_host.is_none());
    }

    #[test]
    fn test_remote_queue_serialises_connection_fields() {
        let mut machine = Machine::remote("cluster", RemoteTarget::new("hpc.example.org", "qe"));
        machine.workdir = "/scratch/qe".into();
        machine.launcher = "srun --ntasks={nprocs} --mpi=pmix".into();

        let queue = serde_json::to_value(machine.to_queue().unwrap()).unwrap();
        assert_eq!(queue["launcher"], json!("srun --ntasks=1 --mpi=pmix"));
        assert_eq!(queue["remote_dir"], json!("/scratch/qe"));
        assert_eq!(queue["remote_auth"], json!({"method": "key", "ssh_key": "~/.ssh/id_rsa", "port": 22}));
        assert!(queue.get("local_dir").is_none());
    }

    #[test]
    fn test_shell_braces_pass_through() {
        let mut machine = Machine::local("desk");
        machine.nprocs = 16;
        machine.launcher = "mpirun -np {nprocs} -x OMP=${OMP_NUM_THREADS} -x PATH=${PATH:-/usr/bin}".into();
        let queue = machine.to_queue().unwrap();
        assert_eq!(queue.launcher, "mpirun -np 16 -x OMP=${OMP_NUM_THREADS} -x PATH=${PATH:-/usr/bin}");
    }

    #[test]
    fn test_unfinished_placeholder_is_literal() {
        let mut machine = Machine::local("desk");
        machine.launcher = "mpirun -np {nprocs".into();
        assert_eq!(machine.to_queue().unwrap().launcher, "mpirun -np {nprocs");
    }

    #[test]
    fn test_launcher_loaded_from_document() {
        let doc = json!({"execution": "local", "nprocs": 2, "launcher": "srun -n {nprocs} bash -c 'echo ${SLURM_JOB_ID}'"});
        let machine = Machine::from_document("desk", &doc).unwrap();
        assert_eq!(machine.to_queue().unwrap().launcher, "srun -n 2 bash -c 'echo ${SLURM_JOB_ID}'");
    }

    #[test]
    fn test_escape_shell_braces() {
        assert_eq!(escape_shell_braces("a {nprocs} ${B} {"), "a {nprocs} $\\{B} \\{");
        assert_eq!(escape_shell_braces("no braces"), "no braces");
    }
}
