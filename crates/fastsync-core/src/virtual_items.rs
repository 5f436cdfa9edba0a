//! Host key-value items synced as configuration under [`VIRTUAL_PREFIX`].
//!
//! [`VIRTUAL_PREFIX`]: crate::entity::VIRTUAL_PREFIX

use crate::entity::VIRTUAL_PREFIX;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Host-provided store of items that live outside the document store.
pub trait VirtualItemStore: Send + Sync {
    /// Keys eligible for sync, without the virtual prefix.
    fn keys(&self) -> Vec<String>;

    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str);

    fn remove(&self, key: &str);
}

/// `_localStorage/<key>` for a store key.
pub fn virtual_path(key: &str) -> String {
    format!("{}{}", VIRTUAL_PREFIX, key)
}

/// Store key for a `_localStorage/<key>` path.
pub fn virtual_key(path: &str) -> Option<&str> {
    path.strip_prefix(VIRTUAL_PREFIX)
}

/// In-memory [`VirtualItemStore`] for tests and hosts without one.
#[derive(Default)]
pub struct InMemoryVirtualItems {
    items: Mutex<BTreeMap<String, String>>,
}

impl InMemoryVirtualItems {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VirtualItemStore for InMemoryVirtualItems {
    fn keys(&self) -> Vec<String> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn get(&self, key: &str) -> Option<String> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_path_mapping() {
        assert_eq!(virtual_path("theme"), "_localStorage/theme");
        assert_eq!(virtual_key("_localStorage/theme"), Some("theme"));
        assert_eq!(virtual_key("app.json"), None);
    }

    #[test]
    fn test_in_memory_items() {
        let items = InMemoryVirtualItems::new();
        items.set("b", "2");
        items.set("a", "1");
        assert_eq!(items.keys(), vec!["a", "b"]);
        assert_eq!(items.get("a").as_deref(), Some("1"));
        items.remove("a");
        assert_eq!(items.get("a"), None);
    }
}
