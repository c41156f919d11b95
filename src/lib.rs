pub mod config;
pub mod rest;
pub mod search;
pub mod service;
pub mod storage;

use std::sync::Arc;

use config::TaskdConfig;
use service::TaskService;

/// Shared application state passed to every HTTP handler.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<TaskdConfig>,
    /// Task operations (validation + primary store + search mirror).
    pub tasks: TaskService,
    pub started_at: std::time::Instant,
}
