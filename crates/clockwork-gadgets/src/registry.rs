//! Name -> gadget lookup. Case-insensitive; duplicate names are rejected at
//! registration.

use crate::gadget::Gadget;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("gadget already registered: {0}")]
    Duplicate(String),
}

#[derive(Default)]
pub struct GadgetRegistry {
    gadgets: HashMap<String, Arc<dyn Gadget>>,
}

impl GadgetRegistry {
    pub fn new() -> Self {
        Self {
            gadgets: HashMap::new(),
        }
    }

    /// Register a gadget. Names collide case-insensitively.
    pub fn register(&mut self, gadget: impl Gadget + 'static) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(gadget))
    }

    pub fn register_arc(&mut self, gadget: Arc<dyn Gadget>) -> Result<(), RegistryError> {
        let key = gadget.name().to_ascii_lowercase();
        if self.gadgets.contains_key(&key) {
            return Err(RegistryError::Duplicate(gadget.name().to_string()));
        }
        self.gadgets.insert(key, gadget);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Gadget>> {
        self.gadgets.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.gadgets.contains_key(&name.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.gadgets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.gadgets.len()
    }

    /// Registered names in their original casing, sorted. Used for the
    /// unknown-gadget error text.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.gadgets.values().map(|g| g.name()).collect();
        names.sort_unstable();
        names
    }
}
