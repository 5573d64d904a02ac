//! Keyed cache of live sessions
//!
//! The map of keys is guarded by one mutex and every key has its own slot mutex, held while
//! that key connects. Acquirers of the same unseen key therefore wait for a single connect and
//! share its result, while other keys connect in parallel.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::entity::machine::Machine;
use crate::error::TransportError;
use crate::session::local_username;
use crate::session::transport::{ConnectTarget, SessionHandle, Transport};

/// Host name used for the local session key
pub const LOCALHOST: &str = "localhost";

/// Sessions are shared between machines pointing at the same account
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub host: String,
    pub username: String,
}

impl SessionKey {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        SessionKey { host: host.into(), username: username.into() }
    }

    pub fn local() -> Self {
        SessionKey::new(LOCALHOST, local_username())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.host)
    }
}

struct Live {
    handle: SessionHandle,
    connected_at: DateTime<Utc>,
    workdir: Option<String>,
}

type Slot = Arc<Mutex<Option<Live>>>;

/// A cached session as seen from outside
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub key: SessionKey,
    pub connected_at: DateTime<Utc>,
    pub workdir: Option<String>,
}

#[derive(Default)]
pub struct SessionCache {
    slots: Mutex<HashMap<SessionKey, Slot>>,
}

/// A panic in another acquirer doesn't make the cached data wrong, so poisoning is ignored
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionCache {
    pub fn new() -> Self {
        SessionCache::default()
    }

    /// The cached session for `key`, calling `connect_fn` only if there is none
    ///
    /// A failed connect leaves nothing behind and its error is returned unchanged; the next
    /// acquire tries again.
    pub fn acquire<F>(&self, key: &SessionKey, connect_fn: F) -> Result<SessionHandle, TransportError>
    where
        F: FnOnce() -> Result<SessionHandle, TransportError>,
    {
        loop {
            let slot = self.slot(key);
            let mut guard = lock(&slot);
            if let Some(live) = guard.as_ref() {
                debug!("Reusing session for {key}");
                return Ok(live.handle.clone());
            }
            // a failed connect may have dropped this slot while we waited on it
            if !self.is_current(key, &slot) {
                continue;
            }

            info!("Connecting session for {key}");
            return match connect_fn() {
                Ok(handle) => {
                    *guard = Some(Live { handle: handle.clone(), connected_at: Utc::now(), workdir: None });
                    Ok(handle)
                }
                Err(err) => {
                    warn!("Connecting {key} failed: {err}");
                    drop(guard);
                    self.discard_empty(key, &slot);
                    Err(err)
                }
            };
        }
    }

    /// Connect through `transport` using the key and target derived from `machine`
    pub fn acquire_for(
        &self,
        machine: &Machine,
        transport: &dyn Transport,
        timeout: Option<Duration>,
    ) -> Result<SessionHandle, TransportError> {
        let target = ConnectTarget::from_machine(machine);
        self.acquire(&machine.session_key(), || transport.connect(&target, timeout))
    }

    /// Run `prepare_fn` unless `path` is already the prepared directory of this session
    ///
    /// Returns whether `prepare_fn` ran. The path is only remembered once it succeeded.
    pub fn prepare_workdir<F>(&self, key: &SessionKey, path: &str, prepare_fn: F) -> Result<bool, TransportError>
    where
        F: FnOnce(&SessionHandle, &str) -> Result<(), TransportError>,
    {
        let closed = || TransportError::Closed { target: key.to_string() };
        let slot = lock(&self.slots).get(key).cloned().ok_or_else(closed)?;
        let mut guard = lock(&slot);
        let live = guard.as_mut().ok_or_else(closed)?;

        if live.workdir.as_deref() == Some(path) {
            debug!("{path} already prepared on {key}");
            return Ok(false);
        }
        info!("Preparing {path} on {key}");
        prepare_fn(&live.handle, path)?;
        live.workdir = Some(path.to_string());
        Ok(true)
    }

    /// Close and forget every session, returning how many were live
    ///
    /// A session that fails to close is still dropped from the cache.
    pub fn release_all(&self) -> usize {
        let drained: Vec<(SessionKey, Slot)> = lock(&self.slots).drain().collect();
        let mut released = 0;
        for (key, slot) in drained {
            if let Some(live) = lock(&slot).take() {
                info!("Closing session for {key}");
                if let Err(err) = live.handle.close() {
                    warn!("Closing session for {key} failed: {err}");
                }
                released += 1;
            }
        }
        released
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        let Some(slot) = lock(&self.slots).get(key).cloned() else {
            return false;
        };
        let live = lock(&slot).is_some();
        live
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live sessions sorted by key
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let slots: Vec<(SessionKey, Slot)> =
            lock(&self.slots).iter().map(|(key, slot)| (key.clone(), slot.clone())).collect();
        let mut infos: Vec<SessionInfo> = slots
            .into_iter()
            .filter_map(|(key, slot)| {
                let guard = lock(&slot);
                let info = guard.as_ref().map(|live| SessionInfo {
                    key,
                    connected_at: live.connected_at,
                    workdir: live.workdir.clone(),
                });
                info
            })
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    fn slot(&self, key: &SessionKey) -> Slot {
        lock(&self.slots).entry(key.clone()).or_default().clone()
    }

    fn is_current(&self, key: &SessionKey, slot: &Slot) -> bool {
        lock(&self.slots).get(key).is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Drop an empty slot after a failed connect, unless someone already took it over
    fn discard_empty(&self, key: &SessionKey, slot: &Slot) {
        let mut slots = lock(&self.slots);
        let Some(current) = slots.get(key) else { return };
        let empty = Arc::ptr_eq(current, slot) && matches!(current.try_lock(), Ok(ref guard) if guard.is_none());
        if empty {
            slots.remove(key);
        }
    }
}
