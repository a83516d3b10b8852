use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

/// Grid cell a user last selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GridPosition {
    pub row: i64,
    pub col: i64,
}

/// Last-known grid position per user.
///
/// Keyed by user, not by connection, so a user with several open tabs has at
/// most one entry. The registry knows nothing about identity fields, the hub
/// resolves those from its own connection map when building snapshots.
#[derive(Default)]
pub struct PresenceRegistry {
    positions: RwLock<HashMap<String, GridPosition>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or overwrite the position for a user.
    pub fn set(&self, user_key: &str, row: i64, col: i64) {
        self.positions
            .write()
            .expect("presence map poisoned")
            .insert(user_key.to_string(), GridPosition { row, col });
    }

    /// Remove a user's position. Returns true when an entry existed.
    pub fn remove(&self, user_key: &str) -> bool {
        self.positions
            .write()
            .expect("presence map poisoned")
            .remove(user_key)
            .is_some()
    }

    pub fn get(&self, user_key: &str) -> Option<GridPosition> {
        self.positions
            .read()
            .expect("presence map poisoned")
            .get(user_key)
            .copied()
    }

    /// Snapshot of every position except the given user's own.
    /// The copy is independent, callers iterate without holding the lock.
    pub fn get_all_except(&self, exclude_user_key: &str) -> HashMap<String, GridPosition> {
        self.positions
            .read()
            .expect("presence map poisoned")
            .iter()
            .filter(|(key, _)| key.as_str() != exclude_user_key)
            .map(|(key, pos)| (key.clone(), *pos))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.positions.read().expect("presence map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
