//! Canonical, validated configuration entities
//!
//! Raw JSON documents are turned into entities with every optional field defaulted, and
//! entities are turned back into documents for persistence. Both directions are lossless for
//! anything the entity doesn't interpret itself.

use serde_json::Value;

use crate::error::Result;
use crate::kind::EntityKind;
use crate::persist::merge::Merge;
use crate::store::DEFAULT_KEY;

/// Execution targets: local host or a remote host behind a scheduler
pub mod machine;
/// Per-machine inventory of Quantum ESPRESSO executables
pub mod codes;
/// JSON schema checks applied to raw documents before conversion
pub mod schema;

pub trait Entity: Merge + Clone + Sized {
    const KIND: EntityKind;

    /// Unique key of the entity within its kind
    fn name(&self) -> &str;

    /// Convert a raw document found under `name`, applying defaults and invariant checks
    fn from_document(name: &str, document: &Value) -> Result<Self>;

    fn to_document(&self) -> Value;

    /// Re-check invariants on an entity that was built or edited in code
    fn validate(&self) -> Result<()>;
}

/// Why `name` can't be used as a document name, if it can't
///
/// Names become file stems next to the reserved `default` marker, so that name and anything
/// that would leave the directory are refused.
pub(crate) fn name_problem(field: &str, name: &str) -> Option<String> {
    if name.trim().is_empty() {
        Some(format!("{field}: must not be empty"))
    } else if name == DEFAULT_KEY {
        Some(format!("{field}: '{DEFAULT_KEY}' is reserved for the default marker"))
    } else if name.contains(['/', '\\']) || name.starts_with('.') {
        Some(format!("{field}: '{name}' is not usable as a file name"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_problem() {
        assert_eq!(name_problem("name", "cluster"), None);
        assert_eq!(name_problem("name", "hpc-01.gpu"), None);
        assert!(name_problem("name", " ").unwrap().contains("must not be empty"));
        assert!(name_problem("name", "default").unwrap().contains("reserved"));
        assert!(name_problem("name", "../etc").is_some());
        assert!(name_problem("name", "a/b").is_some());
        assert!(name_problem("name", ".hidden").is_some());
    }
}
