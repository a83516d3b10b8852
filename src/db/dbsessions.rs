use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

use crate::models::UserIdentity;
use crate::services::session_service::{SessionError, SessionStore};

/// Row returned by the session lookup
#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    user_id: i64,
    username: String,
    firstname: String,
    lastname: String,
}

/// SQL-backed session store
///
/// Sessions are issued by the login service and stored in the `sessions`
/// table with an expiry. This store only ever reads them.
pub struct SqlSessionStore {
    pool: PgPool,
}

impl SqlSessionStore {
    /// Connect to the database holding the session and user tables.
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        info!("Session store connected");
        Ok(Self { pool })
    }

    /// Build a store from an existing pool (shared with the CRUD layer).
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for SqlSessionStore {
    async fn validate(&self, token: &str) -> Result<UserIdentity, SessionError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT
                s.user_id,
                u.username,
                u.firstname,
                u.lastname
            FROM sessions s
            JOIN users u ON s.user_id = u.id
            WHERE s.session_id = $1
            AND s.expires_at > NOW()
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(SessionError::Database)?;

        match row {
            Some(row) => Ok(UserIdentity {
                user_id: row.user_id,
                username: row.username,
                firstname: row.firstname,
                lastname: row.lastname,
                color: String::new(),
            }),
            None => Err(SessionError::InvalidSession),
        }
    }
}
