use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Holder and display metadata for one locked cell
#[derive(Debug, Clone, PartialEq)]
pub struct CellLockInfo {
    pub user_id: String,
    pub asset_id: String,
    pub key: String,
    pub firstname: String,
    pub lastname: String,
    pub color: String,
}

#[derive(Default)]
struct LockTables {
    /// "assetId:key" to holder info
    locks: HashMap<String, CellLockInfo>,
    /// Holder to the set of lock keys it owns, for bulk release
    user_locks: HashMap<String, HashSet<String>>,
}

/// Exclusive per-cell edit locks.
///
/// Invariants: one holder per lock key, and a key appears in the forward map
/// exactly when it appears in its holder's reverse-index set. Both tables
/// change together under one mutex.
#[derive(Default)]
pub struct CellLockManager {
    tables: Mutex<LockTables>,
}

impl CellLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to acquire the lock. Succeeds when the cell is free or already
    /// held by the same user (re-lock is idempotent). Returns false when a
    /// different user holds it.
    pub fn lock(&self, lock_key: &str, info: CellLockInfo) -> bool {
        let mut tables = self.tables.lock().expect("lock tables poisoned");

        if let Some(existing) = tables.locks.get(lock_key) {
            if existing.user_id != info.user_id {
                return false;
            }
        }

        tables
            .user_locks
            .entry(info.user_id.clone())
            .or_default()
            .insert(lock_key.to_string());
        tables.locks.insert(lock_key.to_string(), info);
        true
    }

    /// Release the lock. Succeeds only when `user_id` is the current holder.
    pub fn unlock(&self, lock_key: &str, user_id: &str) -> bool {
        let mut tables = self.tables.lock().expect("lock tables poisoned");

        match tables.locks.get(lock_key) {
            Some(existing) if existing.user_id == user_id => {}
            _ => return false,
        }

        tables.locks.remove(lock_key);
        if let Some(keys) = tables.user_locks.get_mut(user_id) {
            keys.remove(lock_key);
            if keys.is_empty() {
                tables.user_locks.remove(user_id);
            }
        }
        true
    }

    /// Atomically release every lock held by a user, returning the released
    /// lock keys so the hub can announce each one.
    pub fn release_all_for_user(&self, user_id: &str) -> Vec<String> {
        let mut tables = self.tables.lock().expect("lock tables poisoned");

        let Some(keys) = tables.user_locks.remove(user_id) else {
            return Vec::new();
        };
        let mut released = Vec::with_capacity(keys.len());
        for lock_key in keys {
            tables.locks.remove(&lock_key);
            released.push(lock_key);
        }
        released
    }

    /// Deep copy of all current locks.
    pub fn snapshot(&self) -> HashMap<String, CellLockInfo> {
        self.tables
            .lock()
            .expect("lock tables poisoned")
            .locks
            .clone()
    }

    pub fn len(&self) -> usize {
        self.tables.lock().expect("lock tables poisoned").locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forward map and reverse index describe the same set of locks.
    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let tables = self.tables.lock().expect("lock tables poisoned");

        let indexed: usize = tables.user_locks.values().map(|keys| keys.len()).sum();
        if indexed != tables.locks.len() {
            return false;
        }
        tables.locks.iter().all(|(lock_key, info)| {
            tables
                .user_locks
                .get(&info.user_id)
                .is_some_and(|keys| keys.contains(lock_key))
        })
    }
}
