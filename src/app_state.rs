use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use crate::services::{queue::DispatchSink, store::JobStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn DispatchSink>,
    /// Upper bound for server-side job watches.
    pub max_watch: Duration,
}

impl AppState {
    pub fn new(
        db: PgPool,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn DispatchSink>,
        max_watch: Duration,
    ) -> Self {
        Self {
            db,
            store,
            queue,
            max_watch,
        }
    }
}
