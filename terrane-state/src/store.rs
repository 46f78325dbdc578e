use anyhow::{Context as _, Result};
use std::{
    path::Path,
    sync::{Arc, RwLock},
};
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::{file::StateHandle, snapshot::StateSnapshot};

/// Owns the authoritative snapshot between operations.
///
/// Readers get an `Arc` of the current snapshot and are never affected by a
/// later replace. Replacing requires the [`StateWriter`], of which there is at
/// most one at a time.
pub struct StateStore {
    current: RwLock<Arc<StateSnapshot>>,
    writer: Mutex<Option<StateHandle>>,
}

impl StateStore {
    pub fn in_memory(snapshot: StateSnapshot) -> StateStore {
        StateStore {
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(None),
        }
    }

    /// A store backed by a state file, created empty if it does not exist.
    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<StateStore> {
        let (handle, snapshot) = StateHandle::open_or_create(path)?;
        Ok(StateStore {
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(Some(handle)),
        })
    }

    pub fn load(&self) -> Arc<StateSnapshot> {
        self.current
            .read()
            .expect("state snapshot lock poisoned")
            .clone()
    }

    /// Wait until no one else is writing.
    pub async fn writer(&self) -> StateWriter<'_> {
        StateWriter {
            store: self,
            backend: self.writer.lock().await,
        }
    }
}

pub struct StateWriter<'a> {
    store: &'a StateStore,
    backend: MutexGuard<'a, Option<StateHandle>>,
}

impl StateWriter<'_> {
    pub fn current(&self) -> Arc<StateSnapshot> {
        self.store.load()
    }

    /// Install `next` as the current snapshot, with the serial bumped.
    ///
    /// The snapshot is validated and persisted first; if either fails, the
    /// current snapshot stays as it was.
    pub fn replace(&mut self, mut next: StateSnapshot) -> Result<Arc<StateSnapshot>> {
        let previous = self.current();
        next.serial = previous.serial + 1;
        next.validate().context("refusing to install invalid state")?;
        if let Some(handle) = self.backend.as_mut() {
            handle
                .append_snapshot(&previous, &next)
                .context("persisting state")?;
        }
        let next = Arc::new(next);
        *self
            .store
            .current
            .write()
            .expect("state snapshot lock poisoned") = next.clone();
        info!(serial = next.serial, resources = next.resources.len(), "installed state");
        Ok(next)
    }
}
