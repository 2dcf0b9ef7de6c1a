//! Registry of live children keyed by request identifier.
//!
//! Owned by the dispatcher loop; nothing else touches it, so there is no
//! lock. Entries leave once their relay has forwarded the exit report.

use super::child::{Child, ChildState};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use undine_core::{UndineError, UndineResult};

struct Entry {
    serial: u64,
    child: Child,
}

pub struct Registry {
    children: HashMap<String, Entry>,
    next_serial: u64,
    max_children: usize,
}

impl Registry {
    pub fn new(max_children: usize) -> Self {
        Self {
            children: HashMap::new(),
            next_serial: 1,
            max_children,
        }
    }

    /// Check whether a new child under `id` may be registered.
    pub fn admit(&self, id: &str) -> UndineResult<()> {
        if self.children.contains_key(id) {
            return Err(UndineError::DuplicateId(id.to_string()));
        }
        if self.children.len() >= self.max_children {
            return Err(UndineError::Limit(format!(
                "max children ({}) reached",
                self.max_children
            )));
        }
        Ok(())
    }

    /// Register a spawned child and return the serial that identifies this
    /// particular entry.
    pub fn insert(&mut self, child: Child) -> UndineResult<u64> {
        self.admit(child.id())?;
        let serial = self.next_serial;
        self.next_serial += 1;
        let id = child.id().to_string();
        info!(uuid = %id, serial, live = self.children.len() + 1, "child registered");
        self.children.insert(id, Entry { serial, child });
        Ok(serial)
    }

    /// Look up the live child registered under `id`.
    pub fn get(&self, id: &str) -> UndineResult<&Child> {
        self.children
            .get(id)
            .map(|e| &e.child)
            .ok_or_else(|| UndineError::UnknownId(id.to_string()))
    }

    /// Remove `id` only if it still holds the entry created with `serial`.
    pub fn remove(&mut self, id: &str, serial: u64) -> Option<Child> {
        match self.children.get(id) {
            Some(entry) if entry.serial == serial => {
                let entry = self.children.remove(id)?;
                debug!(uuid = %id, serial, live = self.children.len(), "child removed");
                Some(entry.child)
            }
            Some(entry) => {
                warn!(uuid = %id, serial, current = entry.serial, "stale removal ignored");
                None
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Kill every running child and drop all entries.
    pub fn shutdown(&mut self) {
        for (id, entry) in self.children.drain() {
            if entry.child.state() == ChildState::Running {
                if let Err(e) = entry.child.kill() {
                    warn!(uuid = %id, error = %e, "failed to kill child on shutdown");
                }
            }
        }
    }
}
