//! Descriptor resolution
//!
//! The registry asks a [`ConfigResolver`] for a descriptor when a caller names a
//! target without supplying one.

use parking_lot::RwLock;

use super::descriptor::{name_key, TargetDescriptor};

/// Looks up a target by logical name. Must answer from memory.
pub trait ConfigResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<TargetDescriptor>;
}

/// In-memory resolver backed by a list of descriptors
#[derive(Default)]
pub struct StaticResolver {
    targets: RwLock<Vec<TargetDescriptor>>,
}

impl StaticResolver {
    pub fn new(targets: Vec<TargetDescriptor>) -> Self {
        Self {
            targets: RwLock::new(targets),
        }
    }

    /// Insert or replace a descriptor (by name)
    pub fn upsert(&self, descriptor: TargetDescriptor) {
        let mut targets = self.targets.write();
        let key = descriptor.key();
        match targets.iter_mut().find(|t| t.key() == key) {
            Some(existing) => *existing = descriptor,
            None => targets.push(descriptor),
        }
    }

    pub fn remove(&self, name: &str) -> Option<TargetDescriptor> {
        let mut targets = self.targets.write();
        let key = name_key(name);
        let idx = targets.iter().position(|t| t.key() == key)?;
        Some(targets.remove(idx))
    }

    pub fn names(&self) -> Vec<String> {
        self.targets.read().iter().map(|t| t.name.clone()).collect()
    }
}

impl ConfigResolver for StaticResolver {
    fn resolve(&self, name: &str) -> Option<TargetDescriptor> {
        let key = name_key(name);
        self.targets.read().iter().find(|t| t.key() == key).cloned()
    }
}
