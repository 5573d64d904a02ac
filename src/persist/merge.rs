//! Typed merge of an incoming entity into the stored one
//!
//! Maps are unioned with the incoming side winning per key, optional scalars and lists only
//! replace the stored value when the incoming value is non-empty. Every merge is idempotent:
//! applying the same incoming entity twice leaves the result unchanged the second time.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::entity::codes::{Code, CodesConfig, VersionConfig};
use crate::entity::machine::Machine;

pub trait Merge {
    /// Fold `incoming` into `self`, which holds the stored state
    fn merge_from(&mut self, incoming: Self);
}

/// Values that count as "not provided" when merging
trait Blank {
    fn is_blank(&self) -> bool;
}

impl Blank for String {
    fn is_blank(&self) -> bool {
        self.trim().is_empty()
    }
}

impl<T> Blank for Vec<T> {
    fn is_blank(&self) -> bool {
        self.is_empty()
    }
}

impl<K, V> Blank for BTreeMap<K, V> {
    fn is_blank(&self) -> bool {
        self.is_empty()
    }
}

impl<T: Blank> Blank for Option<T> {
    fn is_blank(&self) -> bool {
        self.as_ref().map_or(true, Blank::is_blank)
    }
}

fn non_blank_wins<T: Blank>(current: &mut T, incoming: T) {
    if !incoming.is_blank() {
        *current = incoming;
    }
}

fn union_codes(current: &mut BTreeMap<String, Code>, incoming: BTreeMap<String, Code>) {
    current.extend(incoming);
}

fn union_json(current: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (key, value) in incoming {
        current.insert(key, value);
    }
}

impl Merge for VersionConfig {
    fn merge_from(&mut self, incoming: Self) {
        non_blank_wins(&mut self.qe_prefix, incoming.qe_prefix);
        non_blank_wins(&mut self.modules, incoming.modules);
        union_codes(&mut self.codes, incoming.codes);
    }
}

impl Merge for CodesConfig {
    fn merge_from(&mut self, incoming: Self) {
        non_blank_wins(&mut self.machine_name, incoming.machine_name);
        union_codes(&mut self.codes, incoming.codes);

        for (label, bucket) in incoming.versions {
            match self.versions.get_mut(&label) {
                Some(stored) => stored.merge_from(bucket),
                None => {
                    self.versions.insert(label, bucket);
                }
            }
        }

        non_blank_wins(&mut self.qe_prefix, incoming.qe_prefix);
        non_blank_wins(&mut self.qe_version, incoming.qe_version);
        non_blank_wins(&mut self.modules, incoming.modules);
        non_blank_wins(&mut self.environment, incoming.environment);
        non_blank_wins(&mut self.env_setup, incoming.env_setup);
    }
}

impl Merge for Machine {
    fn merge_from(&mut self, incoming: Self) {
        self.name = incoming.name;
        self.execution = incoming.execution;
        self.scheduler = incoming.scheduler;
        self.workdir = incoming.workdir;
        self.nprocs = incoming.nprocs;
        self.launcher = incoming.launcher;
        self.use_modules = incoming.use_modules;

        non_blank_wins(&mut self.modules, incoming.modules);
        non_blank_wins(&mut self.prepend, incoming.prepend);
        non_blank_wins(&mut self.postpend, incoming.postpend);

        union_json(&mut self.resources, incoming.resources);
        union_json(&mut self.extra, incoming.extra);

        if incoming.env_setup.is_some() {
            self.env_setup = incoming.env_setup;
        }
    }
}
