use std::fmt;
use clap::ValueEnum;

use crate::entity::machine::LOCAL_DESKTOP;

/// The two kinds of configuration entity kept on disk
///
/// Each kind owns a directory of per-entity documents (`<root>/machines/`) and one aggregate
/// document next to it (`<root>/machines.json`) whose entries live under the same plural key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
pub enum EntityKind {
    Machines,
    Codes
}

impl EntityKind {
    /// Directory name for per-entity documents, also the aggregate's file stem
    pub fn dir_name(&self) -> &'static str {
        match self {
            EntityKind::Machines => "machines",
            EntityKind::Codes => "codes"
        }
    }

    /// Key under which the aggregate document nests its entries
    pub fn plural_key(&self) -> &'static str {
        self.dir_name()
    }

    /// Name to load when no default is declared anywhere
    ///
    /// Codes configs only make sense for a named machine, so they have none.
    pub fn implicit_default(&self) -> Option<&'static str> {
        match self {
            EntityKind::Machines => Some(LOCAL_DESKTOP),
            EntityKind::Codes => None
        }
    }
}

impl fmt::Display for EntityKind {
      fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EntityKind::Machines => write!(f, "machine"),
            EntityKind::Codes => write!(f, "codes config")
        }
    }
}
