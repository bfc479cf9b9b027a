//! Names this daemon has offered to workers and not yet finished

use crate::util::lock;
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct InFlight {
    names: Mutex<HashSet<String>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `name` in flight; false if it already was
    pub fn insert(&self, name: &str) -> bool {
        lock(&self.names).insert(name.to_string())
    }

    pub fn remove(&self, name: &str) {
        lock(&self.names).remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        lock(&self.names).contains(name)
    }

    pub fn len(&self) -> usize {
        lock(&self.names).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
