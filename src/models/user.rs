use serde::{Deserialize, Serialize};

/// Identity of an authenticated user, resolved from the session store when a
/// websocket connection is established. The color is supplied by the client
/// on connect and is not persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserIdentity {
    pub user_id: i64,
    pub username: String,
    pub firstname: String,
    pub lastname: String,
    pub color: String,
}

impl UserIdentity {
    /// Stable string form of the user id, shared by every session of the user.
    pub fn user_key(&self) -> String {
        self.user_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_key_is_decimal_id() {
        let user = UserIdentity {
            user_id: 101,
            username: "jdoe".to_string(),
            firstname: "Jane".to_string(),
            lastname: "Doe".to_string(),
            color: "#6b7280".to_string(),
        };
        assert_eq!(user.user_key(), "101");
    }
}
