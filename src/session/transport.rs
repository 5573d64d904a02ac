use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::entity::machine::{Execution, Machine};
use crate::error::TransportError;
use crate::session::cache::SessionKey;
use crate::session::process::run_command;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A live connection that can run shell commands
pub trait Session: Send + Sync {
    /// Human readable description of the other end, used in errors
    fn target(&self) -> &str;

    fn run(&self, command: &str, timeout: Option<Duration>) -> Result<CommandOutput, TransportError>;

    /// Tear the connection down; further `run` calls fail with `Closed`
    fn close(&self) -> Result<(), TransportError>;
}

pub type SessionHandle = Arc<dyn Session>;

/// Everything a transport needs to open a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    Local,
    Remote {
        host: String,
        username: String,
        port: u16,
        ssh_key: PathBuf,
    },
}

impl ConnectTarget {
    pub fn from_machine(machine: &Machine) -> Self {
        match &machine.execution {
            Execution::Local => ConnectTarget::Local,
            Execution::Remote(target) => ConnectTarget::Remote {
                host: target.host.clone(),
                username: target.username.clone(),
                port: target.effective_port(),
                ssh_key: target.auth.ssh_key_path(),
            },
        }
    }

    pub fn key(&self) -> SessionKey {
        match self {
            ConnectTarget::Local => SessionKey::local(),
            ConnectTarget::Remote { host, username, .. } => SessionKey::new(host, username),
        }
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectTarget::Local => write!(f, "localhost"),
            ConnectTarget::Remote { host, username, port, .. } => write!(f, "{username}@{host}:{port}"),
        }
    }
}

/// Opens sessions; implementations decide what a connection is
pub trait Transport: Send + Sync {
    fn connect(&self, target: &ConnectTarget, timeout: Option<Duration>) -> Result<SessionHandle, TransportError>;
}

/// Runs commands with `sh -c` on this host
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn connect(&self, target: &ConnectTarget, _timeout: Option<Duration>) -> Result<SessionHandle, TransportError> {
        if *target != ConnectTarget::Local {
            return Err(TransportError::Connect {
                target: target.to_string(),
                reason: "the local transport only runs commands on this host".to_string(),
            });
        }
        info!("Opening local session");
        Ok(Arc::new(LocalSession::default()))
    }
}

#[derive(Debug, Default)]
pub struct LocalSession {
    closed: AtomicBool,
}

impl Session for LocalSession {
    fn target(&self) -> &str {
        "localhost"
    }

    fn run(&self, command: &str, timeout: Option<Duration>) -> Result<CommandOutput, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed { target: self.target().to_string() });
        }
        debug!("Running locally: {command}");
        let mut sh = Command::new("sh");
        sh.arg("-c").arg(command);
        run_command(sh, command, timeout)
    }

    fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::machine::RemoteTarget;

    #[test]
    fn test_local_session_runs_and_closes() {
        let session = LocalTransport.connect(&ConnectTarget::Local, None).unwrap();
        let output = session.run("echo hello; echo oops >&2; exit 3", None).unwrap();
        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.stderr, "oops\n");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());

        session.close().unwrap();
        assert!(matches!(session.run("true", None), Err(TransportError::Closed { .. })));
    }

    #[test]
    fn test_local_transport_refuses_remote_targets() {
        let machine = Machine::remote("cluster", RemoteTarget::new("hpc.example.org", "qe"));
        let target = ConnectTarget::from_machine(&machine);
        assert_eq!(target.to_string(), "qe@hpc.example.org:22");
        assert!(matches!(LocalTransport.connect(&target, None), Err(TransportError::Connect { .. })));
    }

    #[test]
    fn test_target_uses_auth_port_override() {
        let mut remote = RemoteTarget::new("hpc.example.org", "qe");
        remote.auth.port = Some(2222);
        let target = ConnectTarget::from_machine(&Machine::remote("cluster", remote));
        match &target {
            ConnectTarget::Remote { port, .. } => assert_eq!(*port, 2222),
            ConnectTarget::Local => panic!("expected a remote target"),
        }
        assert_eq!(target.key(), SessionKey::new("hpc.example.org", "qe"));
    }
}
