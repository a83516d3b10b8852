use std::sync::Arc;

use crate::services::session_service::SessionStore;
use crate::ws::hub::Hub;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub sessions: Arc<dyn SessionStore>,
    /// Origins allowed to open a websocket connection, empty allows all
    pub allowed_origins: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(hub: Arc<Hub>, sessions: Arc<dyn SessionStore>, allowed_origins: Vec<String>) -> Self {
        Self {
            hub,
            sessions,
            allowed_origins: Arc::new(allowed_origins),
        }
    }
}
