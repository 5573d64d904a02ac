//! Live connections to execution targets
//!
//! A [`transport::Transport`] opens [`transport::Session`]s and the [`cache::SessionCache`]
//! keeps one per (host, username) so repeated work on a machine reuses its connection.

use std::env;

use crate::entity::machine::Machine;

pub mod cache;
pub mod process;
pub mod ssh;
pub mod transport;

use ssh::SshTransport;
use transport::{LocalTransport, Transport};

/// The transport matching a machine's execution mode
pub fn transport_for(machine: &Machine) -> Box<dyn Transport> {
    if machine.is_remote() {
        Box::new(SshTransport::new())
    } else {
        Box::new(LocalTransport)
    }
}

/// Name of the user running this process
///
/// Taken from `USER`, `USERNAME` or `LOGNAME`, then from the last component of the home
/// directory (which `dirs` looks up in the password database when `HOME` is unset). Only
/// `"unknown"` when all of that fails; a cache lives inside one process, so its local
/// sessions all belong to the same user either way.
pub fn local_username() -> String {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .find_map(|var| env::var(var).ok().filter(|name| !name.is_empty()))
        .or_else(|| {
            dirs::home_dir()
                .and_then(|home| home.file_name().map(|name| name.to_string_lossy().into_owned()))
                .filter(|name| !name.is_empty())
        })
        .unwrap_or_else(|| "unknown".to_string())
}
