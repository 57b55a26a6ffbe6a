//! The set of request keys the controlling script wants to intercept.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

/// Thread-safe set of hook keys.
///
/// Lookups take a shared lock and vastly outnumber updates, which only happen
/// in response to `addHook` / `removeHook`.
///
/// ```
/// use autohook::hooks::HookRegistry;
///
/// let hooks = HookRegistry::new();
/// assert!(hooks.add("/api/users"));
/// assert!(!hooks.add("/api/users"));
/// assert_eq!(hooks.first_match(["http://x/api/users", "/api/users"]), Some("/api/users".to_string()));
/// assert!(hooks.remove("/api/users"));
/// assert!(!hooks.remove("/api/users"));
/// ```
#[derive(Debug, Default)]
pub struct HookRegistry {
    keys: RwLock<HashSet<String>>,
}

impl HookRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `key`. Returns `false` if it was already present.
    pub fn add(&self, key: &str) -> bool {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string())
    }

    /// Removes `key`. Returns `false` if it was not present.
    pub fn remove(&self, key: &str) -> bool {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Whether `key` is registered.
    pub fn contains(&self, key: &str) -> bool {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    /// The first of `candidates` that is registered, checked in order under one lock.
    pub fn first_match<'a, I>(&self, candidates: I) -> Option<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        candidates
            .into_iter()
            .find(|c| keys.contains(*c))
            .map(str::to_string)
    }

    /// Removes every key.
    pub fn clear(&self) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}
