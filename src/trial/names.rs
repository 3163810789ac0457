//! Display-name allocation for trials.
//!
//! Names are unique within one allocator. A requested name that is already
//! taken gets the smallest free integer suffix: `recording`, `recording(1)`,
//! `recording(2)`, ...

use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct DisplayNameAllocator {
    taken: HashSet<String>,
}

impl DisplayNameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `requested`, or the first free suffixed variant of it.
    pub fn allocate(&mut self, requested: &str) -> String {
        let name = if self.taken.contains(requested) {
            (1u32..)
                .map(|i| format!("{}({})", requested, i))
                .find(|candidate| !self.taken.contains(candidate))
                .unwrap_or_else(|| requested.to_string())
        } else {
            requested.to_string()
        };
        self.taken.insert(name.clone());
        name
    }

    /// Return a name to the pool. Returns false if it was not taken.
    pub fn release(&mut self, name: &str) -> bool {
        self.taken.remove(name)
    }

    pub fn is_taken(&self, name: &str) -> bool {
        self.taken.contains(name)
    }

    pub fn len(&self) -> usize {
        self.taken.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taken.is_empty()
    }
}
