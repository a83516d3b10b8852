use axum::extract::State;
use axum::Json;
use std::sync::{Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

use crate::models::DiagnosticsResponse;
use crate::state::AppState;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Report hub and system health
pub async fn diagnostics(State(state): State<AppState>) -> Json<DiagnosticsResponse> {
    let stats = state.hub.stats();

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| Mutex::new(System::new_all()));
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0),
        }
    };

    info!(
        "Diagnostics: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Conn: {}, Users: {}",
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        stats.active_connections,
        stats.active_users
    );

    Json(DiagnosticsResponse {
        n_conn: stats.active_connections as u32,
        n_users: stats.active_users as u32,
        n_presence: stats.presence_entries as u32,
        n_locks: stats.locked_cells as u32,
        total_connections: stats.total_connections,
        messages_broadcast: stats.messages_broadcast,
        messages_dropped: stats.messages_dropped,
        cpu_usage,
        memory_alloc,
        memory_total,
        memory_free,
    })
}
