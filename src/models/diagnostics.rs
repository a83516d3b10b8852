use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Response for diagnostics information
#[derive(Serialize, Deserialize, ToSchema)]
pub struct DiagnosticsResponse {
    /// Currently open websocket connections
    pub n_conn: u32,
    /// Distinct users with at least one open session
    pub n_users: u32,
    /// Users with a published grid position
    pub n_presence: u32,
    /// Cells currently locked for editing
    pub n_locks: u32,
    /// Connections accepted since startup
    pub total_connections: u64,
    /// Envelopes fanned out since startup
    pub messages_broadcast: u64,
    /// Messages dropped on saturated send buffers since startup
    pub messages_dropped: u64,
    pub cpu_usage: f32,
    pub memory_alloc: u64,
    pub memory_total: u64,
    pub memory_free: u64,
}
