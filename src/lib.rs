pub mod clock;
pub mod config;
pub mod lease;
pub mod metrics;
pub mod server;
pub mod storage;

use std::collections::HashMap;
use std::sync::Arc;

use prometheus::Registry;

use crate::lease::{Orchestrator, ProviderState};
use crate::storage::Storage;

/// Shared application state handed to every HTTP handler.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Storage handle kept around for the readiness probe; the providers hold
    /// their own reference for persistence.
    pub storage: Arc<dyn Storage<ProviderState>>,
    pub registry: Arc<Registry>,
    /// Basic-auth credentials for the lease routes. `None` disables auth.
    pub basic_auth_users: Option<HashMap<String, String>>,
}
