use jsonschema::error::ValidationErrorKind;
use jsonschema::{Draft, JSONSchema};
use log::{info, warn};
use serde_json::Value;

use crate::error::{ConfigError, Result};
use crate::kind::EntityKind;

const MACHINE_SCHEMA: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/schema/machine.json"));
const CODES_SCHEMA: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/schema/codes.json"));

/// Compiled schemas for every entity kind
pub struct SchemaSet {
    machine: JSONSchema,
    codes: JSONSchema,
}

impl SchemaSet {
    pub fn load() -> Result<Self> {
        Ok(SchemaSet {
            machine: compile_schema("machine.json", MACHINE_SCHEMA)?,
            codes: compile_schema("codes.json", CODES_SCHEMA)?,
        })
    }

    fn for_kind(&self, kind: EntityKind) -> &JSONSchema {
        match kind {
            EntityKind::Machines => &self.machine,
            EntityKind::Codes => &self.codes,
        }
    }

    /// Validate a raw document, collecting every failing field rather than the first
    pub fn check(&self, kind: EntityKind, name: &str, document: &Value) -> Result<()> {
        info!("Validating {kind} '{name}' against JSON schema");
        let result = self.for_kind(kind).validate(document);
        match result {
            Ok(()) => Ok(()),
            Err(errors) => {
                let fields: Vec<String> = errors
                    .map(|err| {
                        let mut field = field_name(&err.instance_path.to_string());
                        if let ValidationErrorKind::Required { property } = &err.kind {
                            let property = property.as_str().map(str::to_string).unwrap_or_else(|| property.to_string());
                            field = if field.is_empty() { property } else { format!("{field}.{property}") };
                        }
                        if field.is_empty() {
                            field.push_str("(document)");
                        }
                        format!("{field}: {err}")
                    })
                    .collect();
                warn!("{kind} '{name}' fails validation: {}", fields.join("; "));
                Err(ConfigError::Validation { entity: format!("{kind} '{name}'"), fields })
            }
        }
    }
}

fn compile_schema(label: &str, text: &str) -> Result<JSONSchema> {
    let schema: Value =
        serde_json::from_str(text).map_err(|err| ConfigError::Schema(format!("{label} is not JSON: {err}")))?;
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema)
        .map_err(|err| ConfigError::Schema(format!("{label} does not compile: {err}")))
}

/// `/auth/method` becomes `auth.method`
fn field_name(pointer: &str) -> String {
    pointer.trim_start_matches('/').replace('/', ".")
}
