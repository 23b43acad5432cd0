// # Entry Table
//
// Concurrent map from service name to entry.
//
// ## Locking discipline
//
// - The table lock guards map structure only (insert / remove / iterate).
// - Each entry's fields are guarded by the entry's own mutex.
// - No task holds both: the table lock is always released before an entry
//   lock is awaited, and never taken while an entry guard is alive.
//
// Removal is two-phase. The housekeeper marks the entry `removed` under the
// entry lock, releases it, then drops the map slot. Anyone who locks a
// removed entry in between treats it as gone and resolves the name again.

use crate::engine::entry::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Handle to one entry
pub type SharedEntry = Arc<Mutex<Entry>>;

/// Locked entry, independent of the table borrow
pub type EntryGuard = OwnedMutexGuard<Entry>;

/// Map from service name to entry
#[derive(Debug, Default)]
pub struct EntryTable {
    entries: RwLock<HashMap<String, SharedEntry>>,
}

impl EntryTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table pre-populated with entries (e.g. from a snapshot)
    pub fn from_entries(entries: impl IntoIterator<Item = Entry>) -> Self {
        let map = entries
            .into_iter()
            .map(|entry| (entry.name.clone(), Arc::new(Mutex::new(entry))))
            .collect();
        Self {
            entries: RwLock::new(map),
        }
    }

    /// Handle for `name`, if present
    pub async fn get(&self, name: &str) -> Option<SharedEntry> {
        self.entries.read().await.get(name).cloned()
    }

    /// Handle for `name`, inserting `make()` if absent
    ///
    /// Returns the handle and whether it was created by this call.
    pub async fn get_or_insert(&self, name: &str, make: impl FnOnce() -> Entry) -> (SharedEntry, bool) {
        if let Some(existing) = self.get(name).await {
            return (existing, false);
        }

        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(name) {
            return (Arc::clone(existing), false);
        }
        let created = Arc::new(Mutex::new(make()));
        entries.insert(name.to_string(), Arc::clone(&created));
        (created, true)
    }

    /// Remove `name` if it still maps to `entry`
    pub async fn remove_if_same(&self, name: &str, entry: &SharedEntry) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(name) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                entries.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Lock the live entry for `name`
    pub async fn lock(&self, name: &str) -> Option<EntryGuard> {
        loop {
            let handle = self.get(name).await?;
            let guard = Arc::clone(&handle).lock_owned().await;
            if !guard.removed {
                return Some(guard);
            }
            drop(guard);
            self.remove_if_same(name, &handle).await;
        }
    }

    /// Lock the live entry for `name`, creating it with `make()` if absent
    pub async fn lock_or_insert(&self, name: &str, make: impl Fn() -> Entry) -> (EntryGuard, bool) {
        loop {
            let (handle, created) = self.get_or_insert(name, &make).await;
            let guard = Arc::clone(&handle).lock_owned().await;
            if !guard.removed {
                return (guard, created);
            }
            drop(guard);
            self.remove_if_same(name, &handle).await;
        }
    }

    /// Handles of every entry, taken under one read lock
    pub async fn handles(&self) -> Vec<(String, SharedEntry)> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
            .collect()
    }

    /// Copies of every live entry
    pub async fn snapshot(&self) -> Vec<Entry> {
        let mut out = Vec::new();
        for (_, handle) in self.handles().await {
            let entry = handle.lock().await;
            if !entry.removed {
                out.push(entry.clone());
            }
        }
        out
    }

    /// Copy of the live entry for `name`
    pub async fn entry(&self, name: &str) -> Option<Entry> {
        self.lock(name).await.map(|guard| guard.clone())
    }

    /// Number of map slots
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// True when the map is empty
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Service;
    use chrono::Utc;

    fn entry(name: &str) -> Entry {
        Entry::new(Service::new(name), Utc::now())
    }

    #[tokio::test]
    async fn get_or_insert_creates_once() {
        let table = EntryTable::new();

        let (first, created) = table.get_or_insert("svc1", || entry("svc1")).await;
        assert!(created);
        let (second, created) = table.get_or_insert("svc1", || entry("other")).await;
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().await.name, "svc1");
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn removed_entry_is_invisible_to_lock() {
        let table = EntryTable::from_entries([entry("svc1")]);
        {
            let mut guard = table.lock("svc1").await.unwrap();
            guard.removed = true;
        }

        assert!(table.lock("svc1").await.is_none());
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn lock_or_insert_replaces_removed_entry() {
        let table = EntryTable::from_entries([entry("svc1")]);
        let old = table.get("svc1").await.unwrap();
        old.lock().await.removed = true;

        let (guard, created) = table.lock_or_insert("svc1", || entry("svc1")).await;
        assert!(created);
        assert!(!guard.removed);
        drop(guard);
        assert!(!Arc::ptr_eq(&old, &table.get("svc1").await.unwrap()));
    }

    #[tokio::test]
    async fn remove_if_same_ignores_replaced_slot() {
        let table = EntryTable::new();
        let (old, _) = table.get_or_insert("svc1", || entry("svc1")).await;
        table.remove_if_same("svc1", &old).await;
        let (_new, created) = table.get_or_insert("svc1", || entry("svc1")).await;
        assert!(created);

        assert!(!table.remove_if_same("svc1", &old).await);
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn snapshot_skips_removed_entries() {
        let table = EntryTable::from_entries([entry("a"), entry("b")]);
        let a = table.get("a").await.unwrap();
        a.lock().await.removed = true;

        let names: Vec<String> = table.snapshot().await.into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["b".to_string()]);
    }
}
