//! # Registry
//!
//! Name-indexed collection of shared engine objects (channels, groups).
//!
//! Entries are kept in registration order so that groups start and stop in
//! the order the configuration store listed them. Insertion is
//! first-writer-wins: offering an object under a name that is already taken
//! returns the resident object and discards the new one.
//!
//! Mutation only happens while the engine is idle; running code takes a
//! [`snapshot`](Registry::snapshot) and iterates outside the lock.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Anything stored in a [`Registry`].
pub trait Named {
    fn name(&self) -> &str;
}

pub struct Registry<T> {
    entries: RwLock<Entries<T>>,
}

struct Entries<T> {
    order: Vec<Arc<T>>,
    index: HashMap<String, usize>,
}

impl<T: Named> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Named> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Entries {
                order: Vec::new(),
                index: HashMap::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries<T>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries<T>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts `item` unless its name is taken. Returns the registered object.
    pub fn insert_if_absent(&self, item: Arc<T>) -> Arc<T> {
        let mut entries = self.write();
        if let Some(&pos) = entries.index.get(item.name()) {
            return Arc::clone(&entries.order[pos]);
        }
        let pos = entries.order.len();
        entries.index.insert(item.name().to_string(), pos);
        entries.order.push(Arc::clone(&item));
        item
    }

    /// Returns the object registered under `name`, creating it with `make` if absent.
    pub fn get_or_insert_with(&self, name: &str, make: impl FnOnce() -> T) -> Arc<T> {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        self.insert_if_absent(Arc::new(make()))
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        let entries = self.read();
        entries.index.get(name).map(|&pos| Arc::clone(&entries.order[pos]))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().index.contains_key(name)
    }

    /// All objects in registration order.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.read().order.clone()
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().order.is_empty()
    }

    pub fn clear(&self) {
        let mut entries = self.write();
        entries.order.clear();
        entries.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item {
        name: String,
        tag: u32,
    }

    impl Named for Item {
        fn name(&self) -> &str {
            &self.name
        }
    }

    fn item(name: &str, tag: u32) -> Arc<Item> {
        Arc::new(Item {
            name: name.into(),
            tag,
        })
    }

    #[test]
    fn test_first_writer_wins() {
        let registry = Registry::new();
        let first = registry.insert_if_absent(item("PV:1", 1));
        let second = registry.insert_if_absent(item("PV:1", 2));
        assert_eq!(first.tag, 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_keeps_registration_order() {
        let registry = Registry::new();
        for (i, name) in ["c", "a", "b"].iter().enumerate() {
            registry.insert_if_absent(item(name, i as u32));
        }
        let names: Vec<_> = registry.snapshot().iter().map(|i| i.name.clone()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_get_or_insert_with_only_builds_once() {
        let registry = Registry::new();
        let mut built = 0;
        registry.get_or_insert_with("g", || {
            built += 1;
            Item {
                name: "g".into(),
                tag: 0,
            }
        });
        registry.get_or_insert_with("g", || {
            built += 1;
            Item {
                name: "g".into(),
                tag: 1,
            }
        });
        assert_eq!(built, 1);
        assert_eq!(registry.get("g").unwrap().tag, 0);
    }

    #[test]
    fn test_clear() {
        let registry = Registry::new();
        registry.insert_if_absent(item("x", 0));
        registry.clear();
        assert!(registry.is_empty());
        assert!(!registry.contains("x"));
        assert!(registry.get("x").is_none());
    }
}
