//! Find Quantum ESPRESSO executables on a machine
//!
//! Every probe runs through a [`Session`], after the machine's environment setup and module
//! loads, so detection sees the same `PATH` a job would.

use std::collections::BTreeMap;
use std::time::Duration;

use log::{debug, info, warn};
use regex::Regex;

use crate::entity::codes::{Code, CodesConfig};
use crate::entity::machine::Machine;
use crate::error::{Result, TransportError};
use crate::session::transport::{CommandOutput, Session};

/// Executables probed by [`Detector::detect_codes`], without the `.x` suffix
pub const COMMON_QE_CODES: &[&str] = &[
    "pw",
    "ph",
    "pp",
    "projwfc",
    "dos",
    "bands",
    "neb",
    "hp",
    "dynmat",
    "matdyn",
    "q2r",
    "pwcond",
    "turbo_lanczos",
    "turbo_davidson",
];

const VERSION_PATTERN: &str = r"(\d+\.\d+)";
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct DetectOptions {
    /// Searched before `search_paths`
    pub qe_prefix: Option<String>,
    /// Directories tried when `which` finds nothing
    pub search_paths: Vec<String>,
    /// Loaded on top of the machine's own modules
    pub modules: Vec<String>,
    /// Put the detected codes into this version's bucket
    pub version: Option<String>,
    /// Per probe, defaults to 30 seconds
    pub timeout: Option<Duration>,
}

/// First `major.minor` in `pw.x --version` style output
pub fn parse_qe_version(output: &str) -> Option<String> {
    let re = Regex::new(VERSION_PATTERN).ok()?;
    re.captures(output).map(|caps| caps[1].to_string())
}

pub struct Detector<'a> {
    session: &'a dyn Session,
    machine: &'a Machine,
}

impl<'a> Detector<'a> {
    pub fn new(session: &'a dyn Session, machine: &'a Machine) -> Self {
        Detector { session, machine }
    }

    fn run(&self, command: &str, options: &DetectOptions) -> std::result::Result<Option<CommandOutput>, TransportError> {
        let mut steps = self.machine.command_prelude();
        steps.extend(options.modules.iter().map(|module| format!("module load {module}")));
        steps.push(command.to_string());
        let timeout = options.timeout.unwrap_or(PROBE_TIMEOUT);

        match self.session.run(&steps.join(" && "), Some(timeout)) {
            Ok(output) => Ok(Some(output)),
            Err(TransportError::Timeout { command, timeout }) => {
                warn!("Probe '{command}' on {} timed out after {timeout:?}", self.session.target());
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Absolute path of `<code>.x`: `which` first, then the prefix and search paths
    pub fn find_code(&self, code: &str, options: &DetectOptions) -> std::result::Result<Option<String>, TransportError> {
        let executable = format!("{code}.x");
        if let Some(path) = self.run(&format!("which {executable}"), options)?.and_then(first_line) {
            return Ok(Some(path));
        }

        let dirs = options.qe_prefix.iter().chain(options.search_paths.iter());
        for dir in dirs {
            let candidate = format!("{}/{executable}", dir.trim_end_matches('/'));
            let probe = format!("test -x {candidate} && echo {candidate}");
            if let Some(path) = self.run(&probe, options)?.and_then(first_line) {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// Every [`COMMON_QE_CODES`] entry that can be found, by name
    pub fn detect_codes(&self, options: &DetectOptions) -> std::result::Result<BTreeMap<String, String>, TransportError> {
        let mut found = BTreeMap::new();
        for code in COMMON_QE_CODES {
            match self.find_code(code, options)? {
                Some(path) => {
                    debug!("Found {code}.x at {path}");
                    found.insert(code.to_string(), path);
                }
                None => debug!("{code}.x not found on {}", self.session.target()),
            }
        }
        Ok(found)
    }

    pub fn detect_version(&self, pw_path: &str, options: &DetectOptions) -> std::result::Result<Option<String>, TransportError> {
        let output = self.run(&format!("{pw_path} --version 2>&1 | head -5"), options)?;
        Ok(output.and_then(|output| parse_qe_version(&output.stdout)))
    }

    /// Probe the machine and describe what was found as a codes config
    pub fn detect(&self, options: &DetectOptions) -> Result<CodesConfig> {
        info!("Detecting Quantum ESPRESSO codes on '{}'", self.machine.name);
        let found = self.detect_codes(options)?;
        let version = match (&options.version, found.get("pw")) {
            (Some(label), _) => Some(label.clone()),
            (None, Some(pw)) => self.detect_version(pw, options)?,
            (None, None) => None,
        };
        info!("Found {} codes on '{}' (version {:?})", found.len(), self.machine.name, version);

        let mut config = CodesConfig::new(&self.machine.name);
        config.qe_version = version.clone();
        for (name, path) in found {
            let mut code = Code::new(name, path);
            code.version = version.clone();
            config.add_code(code, options.version.as_deref());
        }

        match &options.version {
            Some(label) => {
                let bucket = config.versions.entry(label.clone()).or_default();
                bucket.qe_prefix = options.qe_prefix.clone();
                bucket.modules = options.modules.clone();
            }
            None => {
                config.qe_prefix = options.qe_prefix.clone();
                if !options.modules.is_empty() {
                    config.modules = Some(options.modules.clone());
                }
            }
        }
        Ok(config)
    }
}

fn first_line(output: CommandOutput) -> Option<String> {
    if !output.success() {
        return None;
    }
    output.stdout.lines().map(str::trim).find(|line| !line.is_empty()).map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Answers `which` for a fixed set of executables and records every command
    struct FakeSession {
        installed: Vec<&'static str>,
        commands: Mutex<Vec<String>>,
    }

    impl FakeSession {
        fn new(installed: Vec<&'static str>) -> Self {
            FakeSession { installed, commands: Mutex::new(Vec::new()) }
        }
    }

    impl Session for FakeSession {
        fn target(&self) -> &str {
            "fake"
        }

        fn run(&self, command: &str, _timeout: Option<Duration>) -> std::result::Result<CommandOutput, TransportError> {
            self.commands.lock().unwrap().push(command.to_string());
            let last = command.rsplit(" && ").next().unwrap_or_default();
            if last.contains("--version") {
                return Ok(CommandOutput {
                    stdout: "\n     Program PWSCF v.7.2 starts on 17Oct2023\n".into(),
                    stderr: String::new(),
                    exit_code: Some(0),
                });
            }
            let hit = last
                .strip_prefix("which ")
                .and_then(|exe| self.installed.iter().find(|name| **name == exe));
            Ok(match hit {
                Some(exe) => CommandOutput { stdout: format!("/opt/qe/bin/{exe}\n"), stderr: String::new(), exit_code: Some(0) },
                None => CommandOutput { stdout: String::new(), stderr: String::new(), exit_code: Some(1) },
            })
        }

        fn close(&self) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    #[test]
    fn test_parse_qe_version() {
        assert_eq!(parse_qe_version("Program PWSCF v.6.8 starts").as_deref(), Some("6.8"));
        assert_eq!(parse_qe_version("no version here"), None);
    }

    #[test]
    fn test_detect_unversioned() {
        let session = FakeSession::new(vec!["pw.x", "ph.x"]);
        let machine = Machine::local("desk");
        let config = Detector::new(&session, &machine).detect(&DetectOptions::default()).unwrap();

        assert_eq!(config.machine_name, "desk");
        assert_eq!(config.list_codes(None), vec!["ph", "pw"]);
        assert_eq!(config.qe_version.as_deref(), Some("7.2"));
        assert_eq!(config.get_code("pw", None).unwrap().path, "/opt/qe/bin/pw.x");
        assert!(config.versions.is_empty());
    }

    #[test]
    fn test_detect_into_version_bucket_with_modules() {
        let session = FakeSession::new(vec!["pw.x"]);
        let mut machine = Machine::local("desk");
        machine.use_modules = true;
        machine.modules = vec!["gcc".into()];
        let options = DetectOptions {
            version: Some("7.3".into()),
            modules: vec!["qe/7.3".into()],
            ..Default::default()
        };

        let config = Detector::new(&session, &machine).detect(&options).unwrap();
        assert!(config.codes.is_empty());
        assert_eq!(config.list_codes(Some("7.3")), vec!["pw"]);
        assert_eq!(config.version_config("7.3").unwrap().modules, vec!["qe/7.3"]);

        let commands = session.commands.lock().unwrap();
        assert_eq!(commands[0], "module load gcc && module load qe/7.3 && which pw.x");
    }

    #[test]
    fn test_search_paths_are_checked_after_which() {
        let session = FakeSession::new(vec![]);
        let machine = Machine::local("desk");
        let options = DetectOptions { qe_prefix: Some("/opt/qe-7.2/bin/".into()), ..Default::default() };

        let found = Detector::new(&session, &machine).find_code("pw", &options).unwrap();
        assert_eq!(found, None);
        let commands = session.commands.lock().unwrap();
        assert_eq!(commands[1], "test -x /opt/qe-7.2/bin/pw.x && echo /opt/qe-7.2/bin/pw.x");
    }
}
