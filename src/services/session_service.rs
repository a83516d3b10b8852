use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::models::UserIdentity;

/// Error returned by session validation
#[derive(Debug)]
pub enum SessionError {
    /// The token does not match a live session
    InvalidSession,
    /// The session store itself failed
    Database(sqlx::Error),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::InvalidSession => write!(f, "invalid or expired session"),
            SessionError::Database(e) => write!(f, "database error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

/// Session validation contract for long-lived connections.
///
/// Production uses the SQL-backed store, tests substitute the in-memory one.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Resolve a session token to the identity of its user. The returned
    /// identity carries an empty color, the caller assigns the presentation
    /// color supplied on connect.
    async fn validate(&self, token: &str) -> Result<UserIdentity, SessionError>;
}

/// In-memory session store used by tests and local development.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, UserIdentity>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, user: UserIdentity) {
        self.sessions
            .write()
            .expect("session map poisoned")
            .insert(token.into(), user);
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn validate(&self, token: &str) -> Result<UserIdentity, SessionError> {
        self.sessions
            .read()
            .expect("session map poisoned")
            .get(token)
            .cloned()
            .ok_or(SessionError::InvalidSession)
    }
}
