use serde::{Deserialize, Serialize};
use serde_json::Value;

// Inbound frame types
pub const USER_POSITION_UPDATE: &str = "USER_POSITION_UPDATE";
pub const USER_DESELECTED: &str = "USER_DESELECTED";
pub const CELL_EDIT_START: &str = "CELL_EDIT_START";
pub const CELL_EDIT_END: &str = "CELL_EDIT_END";
pub const PING: &str = "PING";

// Outbound frame types
pub const WELCOME: &str = "WELCOME";
pub const EXISTING_USERS: &str = "EXISTING_USERS";
pub const USER_LEFT: &str = "USER_LEFT";
pub const CELL_LOCKED: &str = "CELL_LOCKED";
pub const CELL_UNLOCKED: &str = "CELL_UNLOCKED";

/// Wire envelope for every websocket frame, in both directions.
///
/// The payload stays an untyped JSON value at this level. Inbound payloads
/// are parsed per frame type so that a malformed payload only drops that one
/// frame, and outbound payloads are built by the hub with whatever identity
/// enrichment the frame type calls for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Frame {
    pub fn new(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            payload,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Payload of an inbound `USER_POSITION_UPDATE`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PositionUpdate {
    pub row: i64,
    pub col: i64,
}

impl PositionUpdate {
    /// Coordinates must be present and non-negative.
    pub fn is_valid(&self) -> bool {
        self.row >= 0 && self.col >= 0
    }
}

/// Payload of an inbound `CELL_EDIT_START` / `CELL_EDIT_END`.
///
/// The asset id is kept as a raw JSON value because the frontend sends it as
/// a number while lookup keys are strings. Broadcasts echo the raw value
/// back, lock keys use the normalized string form.
#[derive(Debug, Clone, Deserialize)]
pub struct CellEdit {
    #[serde(rename = "assetId")]
    pub asset_id: Value,
    #[serde(default)]
    pub key: String,
}

impl CellEdit {
    /// Normalized string form of the asset id. None when the id is missing,
    /// empty, or not a scalar.
    pub fn asset_id_string(&self) -> Option<String> {
        match &self.asset_id {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Composite lock key `assetId:key`, or None when either part is invalid.
    pub fn lock_key(&self) -> Option<String> {
        if self.key.is_empty() {
            return None;
        }
        let asset_id = self.asset_id_string()?;
        Some(format!("{}:{}", asset_id, self.key))
    }
}
