//! Ordered collection of accepted module descriptors.

use crate::error::ModuleError;
use crate::source::ModuleDescriptor;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Accepted modules keyed by identity, in insertion order.
///
/// Insertion order is the default compile and load order; the registry itself
/// never sorts. See [`crate::ordering::dependency_order`].
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: Vec<Arc<ModuleDescriptor>>,
    index: HashMap<String, usize>,
    generation: u64,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a descriptor; a second descriptor with the same identity is rejected.
    pub fn add(&mut self, descriptor: impl Into<Arc<ModuleDescriptor>>) -> Result<(), ModuleError> {
        let descriptor = descriptor.into();
        let identity = descriptor.identity().to_string();
        if self.index.contains_key(&identity) {
            return Err(ModuleError::DuplicateIdentity(identity));
        }

        debug!(
            "Registered module {} from {}",
            identity,
            descriptor.file_path().display()
        );
        self.index.insert(identity, self.modules.len());
        self.modules.push(descriptor);
        Ok(())
    }

    pub fn remove(&mut self, identity: &str) -> Result<Arc<ModuleDescriptor>, ModuleError> {
        let position = self
            .index
            .remove(identity)
            .ok_or_else(|| ModuleError::NotFound(identity.to_string()))?;
        let removed = self.modules.remove(position);
        for slot in self.index.values_mut() {
            if *slot > position {
                *slot -= 1;
            }
        }
        Ok(removed)
    }

    /// Replaces the descriptor registered under the same identity, keeping its position.
    pub fn replace(&mut self, descriptor: impl Into<Arc<ModuleDescriptor>>) -> Result<(), ModuleError> {
        let descriptor = descriptor.into();
        let position = *self
            .index
            .get(descriptor.identity())
            .ok_or_else(|| ModuleError::NotFound(descriptor.identity().to_string()))?;
        self.modules[position] = descriptor;
        Ok(())
    }

    pub fn get(&self, identity: &str) -> Option<&Arc<ModuleDescriptor>> {
        self.index.get(identity).map(|&position| &self.modules[position])
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.index.contains_key(identity)
    }

    /// All descriptors in insertion order.
    pub fn all(&self) -> &[Arc<ModuleDescriptor>] {
        &self.modules
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(|descriptor| descriptor.identity())
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Incremented by every [`reset`](Self::reset).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Clears the registry and starts a new generation.
    pub fn reset(&mut self) {
        self.modules.clear();
        self.index.clear();
        self.generation += 1;
        debug!("Module registry reset to generation {}", self.generation);
    }
}
