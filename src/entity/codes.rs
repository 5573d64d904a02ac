use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{name_problem, Entity};
use crate::error::{ConfigError, Result};
use crate::kind::EntityKind;

/// One executable, e.g. `pw` at `/opt/qe-7.2/bin/pw.x`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Code {
    /// Filled in from the map key when a stored document omits it
    #[serde(default)]
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// MPI launch prefix such as `mpirun -np {nprocs}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_command: Option<String>,
    /// Default parallelisation flags such as `-nk 4`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_parallel: Option<String>,
}

impl Code {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Code {
            name: name.into(),
            path: path.into(),
            version: None,
            parallel_command: None,
            default_parallel: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Executables of one installed QE version
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionConfig {
    #[serde(default, alias = "prefix", skip_serializing_if = "Option::is_none")]
    pub qe_prefix: Option<String>,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub codes: BTreeMap<String, Code>,
}

/// Everything known about the QE executables on one machine
///
/// `codes` is the unversioned bucket used when no version is asked for; `versions` holds one
/// bucket per installed version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodesConfig {
    #[serde(default)]
    pub machine_name: String,
    #[serde(default)]
    pub codes: BTreeMap<String, Code>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qe_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qe_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modules: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_setup: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub versions: BTreeMap<String, VersionConfig>,
}

impl CodesConfig {
    pub fn new(machine_name: impl Into<String>) -> Self {
        CodesConfig { machine_name: machine_name.into(), ..Default::default() }
    }

    /// Add or replace a code, in the unversioned bucket or in `version`'s bucket
    pub fn add_code(&mut self, code: Code, version: Option<&str>) {
        let bucket = match version {
            None => &mut self.codes,
            Some(label) => &mut self.versions.entry(label.to_string()).or_default().codes,
        };
        bucket.insert(code.name.clone(), code);
    }

    /// Look a code up in exactly one bucket
    ///
    /// Without a version only the unversioned bucket is searched. With a version, that
    /// version's bucket is searched; if the config has no such bucket at all, unversioned codes
    /// tagged with the same version still match (single-version documents look like that).
    pub fn get_code(&self, name: &str, version: Option<&str>) -> Option<&Code> {
        match version {
            None => self.codes.get(name),
            Some(label) => match self.versions.get(label) {
                Some(bucket) => bucket.codes.get(name),
                None => self
                    .codes
                    .get(name)
                    .filter(|code| code.version.as_deref() == Some(label)),
            },
        }
    }

    pub fn has_code(&self, name: &str, version: Option<&str>) -> bool {
        self.get_code(name, version).is_some()
    }

    /// Code names of one bucket, sorted
    pub fn list_codes(&self, version: Option<&str>) -> Vec<String> {
        match version {
            None => self.codes.keys().cloned().collect(),
            Some(label) => self
                .versions
                .get(label)
                .map(|bucket| bucket.codes.keys().cloned().collect())
                .unwrap_or_default(),
        }
    }

    pub fn list_versions(&self) -> Vec<String> {
        self.versions.keys().cloned().collect()
    }

    pub fn version_config(&self, label: &str) -> Option<&VersionConfig> {
        self.versions.get(label)
    }

    fn problems(&self) -> Vec<String> {
        let mut fields: Vec<String> = name_problem("machine_name", &self.machine_name).into_iter().collect();
        check_bucket("codes", &self.codes, &mut fields);
        for (label, bucket) in &self.versions {
            check_bucket(&format!("versions.{label}.codes"), &bucket.codes, &mut fields);
        }
        fields
    }
}

fn check_bucket(prefix: &str, codes: &BTreeMap<String, Code>, fields: &mut Vec<String>) {
    for (key, code) in codes {
        if code.name != *key {
            fields.push(format!("{prefix}.{key}.name: stored as '{}'", code.name));
        }
        if code.path.trim().is_empty() {
            fields.push(format!("{prefix}.{key}.path: must not be empty"));
        }
    }
}

/// Codes stored without a `name` take it from their key
fn fill_names(codes: &mut BTreeMap<String, Code>) {
    for (key, code) in codes.iter_mut() {
        if code.name.is_empty() {
            code.name = key.clone();
        }
    }
}

impl Entity for CodesConfig {
    const KIND: EntityKind = EntityKind::Codes;

    fn name(&self) -> &str {
        &self.machine_name
    }

    fn from_document(name: &str, document: &Value) -> Result<Self> {
        let entity = format!("codes config '{name}'");
        let mut config = CodesConfig::deserialize(document)
            .map_err(|err| ConfigError::validation(&entity, err.to_string()))?;

        let mut fields = Vec::new();
        if config.machine_name.is_empty() {
            config.machine_name = name.to_string();
        } else if config.machine_name != name {
            fields.push(format!("machine_name: document is for '{}'", config.machine_name));
        }

        fill_names(&mut config.codes);
        for bucket in config.versions.values_mut() {
            fill_names(&mut bucket.codes);
        }

        fields.extend(config.problems());
        if fields.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError::Validation { entity, fields })
        }
    }

    fn to_document(&self) -> Value {
        // plain data with string keys, serialising can't fail
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    fn validate(&self) -> Result<()> {
        let fields = self.problems();
        if fields.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation { entity: format!("codes config '{}'", self.machine_name), fields })
        }
    }
}
