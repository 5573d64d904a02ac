//! Sessions over the system `ssh` client
//!
//! Connecting starts a control master (`ControlMaster=auto`, `ControlPersist=yes`) and every
//! command afterwards is multiplexed over its socket, so a cached session really is one TCP
//! connection. Keys, agents and `~/.ssh/config` are left to the client.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::TransportError;
use crate::session::process::run_command;
use crate::session::transport::{CommandOutput, ConnectTarget, Session, SessionHandle, Transport};

const SSH_PROGRAM: &str = "ssh";
const CONTROL_DIR: &str = "qe-machines-ssh";

/// Used for `ConnectTimeout` when the caller gives none
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SshTransport {
    program: String,
    control_dir: PathBuf,
}

impl Default for SshTransport {
    fn default() -> Self {
        SshTransport::new()
    }
}

impl SshTransport {
    /// Control sockets go to `$TMPDIR/qe-machines-ssh`
    pub fn new() -> Self {
        SshTransport { program: SSH_PROGRAM.to_string(), control_dir: env::temp_dir().join(CONTROL_DIR) }
    }

    pub fn with_control_dir(control_dir: impl Into<PathBuf>) -> Self {
        SshTransport { control_dir: control_dir.into(), ..SshTransport::new() }
    }

    /// Options shared by the master and every multiplexed command
    fn base_args(&self, username: &str, port: u16, ssh_key: &Path) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}/%C", self.control_dir.display()),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-p".to_string(),
            port.to_string(),
            "-l".to_string(),
            username.to_string(),
        ];
        // a missing key file is fine, the agent or ssh config may provide one
        if ssh_key.is_file() {
            args.push("-i".to_string());
            args.push(ssh_key.display().to_string());
        }
        args
    }
}

impl Transport for SshTransport {
    fn connect(&self, target: &ConnectTarget, timeout: Option<Duration>) -> Result<SessionHandle, TransportError> {
        let ConnectTarget::Remote { host, username, port, ssh_key } = target else {
            return Err(TransportError::Connect {
                target: target.to_string(),
                reason: "ssh needs a remote host".to_string(),
            });
        };
        fs::create_dir_all(&self.control_dir).map_err(|err| TransportError::Connect {
            target: target.to_string(),
            reason: format!("can't create control socket directory {}: {err}", self.control_dir.display()),
        })?;

        let session = SshSession {
            program: self.program.clone(),
            args: self.base_args(username, *port, ssh_key),
            host: host.clone(),
            target: target.to_string(),
            closed: AtomicBool::new(false),
        };

        let connect_timeout = timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        info!("Connecting to {target} (timeout {connect_timeout:?})");
        let mut cmd = session.command();
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)))
            .arg(&session.host)
            .arg("true");
        // the client enforces ConnectTimeout itself; the outer deadline only catches a hung client
        let output = run_command(cmd, &format!("ssh {target}"), Some(connect_timeout * 2))?;
        if !output.success() {
            return Err(TransportError::Connect {
                target: target.to_string(),
                reason: output.stderr.trim().to_string(),
            });
        }
        info!("Connected to {target}");
        Ok(Arc::new(session))
    }
}

#[derive(Debug)]
pub struct SshSession {
    program: String,
    args: Vec<String>,
    host: String,
    target: String,
    closed: AtomicBool,
}

impl SshSession {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl Session for SshSession {
    fn target(&self) -> &str {
        &self.target
    }

    fn run(&self, command: &str, timeout: Option<Duration>) -> Result<CommandOutput, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed { target: self.target.clone() });
        }
        debug!("Running on {}: {command}", self.target);
        let mut cmd = self.command();
        cmd.arg(&self.host).arg(command);
        run_command(cmd, command, timeout)
    }

    fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Closing connection to {}", self.target);
        let mut cmd = self.command();
        cmd.arg("-O").arg("exit").arg(&self.host);
        let output = run_command(cmd, &format!("ssh -O exit {}", self.target), Some(Duration::from_secs(10)))?;
        if !output.success() {
            // the master may already be gone
            warn!("ssh -O exit for {} said: {}", self.target, output.stderr.trim());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_args_use_control_master() {
        let transport = SshTransport::with_control_dir("/tmp/sockets");
        let args = transport.base_args("qe", 2222, Path::new("/nonexistent/id_rsa"));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ControlPath=/tmp/sockets/%C".to_string()));
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(args.windows(2).any(|w| w == ["-l", "qe"]));
        assert!(!args.contains(&"-i".to_string()));
    }

    #[test]
    fn test_connect_needs_a_remote_target() {
        let result = SshTransport::new().connect(&ConnectTarget::Local, None);
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}
