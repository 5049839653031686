use std::sync::Arc;

use tokio::sync::broadcast;

use crate::auth::TokenKeys;
use crate::config::DispatchSettings;
use crate::engine::registry::{InMemorySessionRegistry, SessionRegistry};
use crate::models::event::DispatchEvent;
use crate::observability::metrics::Metrics;
use crate::store::Repositories;

pub struct AppState {
    pub repos: Repositories,
    pub sessions: Arc<dyn SessionRegistry>,
    pub settings: DispatchSettings,
    pub tokens: TokenKeys,
    pub dispatch_events_tx: broadcast::Sender<DispatchEvent>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(
        repos: Repositories,
        sessions: Arc<dyn SessionRegistry>,
        settings: DispatchSettings,
        jwt_secret: &str,
        event_buffer_size: usize,
    ) -> Self {
        let (dispatch_events_tx, _unused_rx) = broadcast::channel(event_buffer_size);

        Self {
            repos,
            sessions,
            settings,
            tokens: TokenKeys::new(jwt_secret),
            dispatch_events_tx,
            metrics: Metrics::new(),
        }
    }

    /// State backed entirely by process memory.
    pub fn in_memory(settings: DispatchSettings, jwt_secret: &str) -> Self {
        Self::new(
            Repositories::in_memory(),
            Arc::new(InMemorySessionRegistry::new()),
            settings,
            jwt_secret,
            1024,
        )
    }

    pub fn publish(&self, event: DispatchEvent) {
        let _ = self.dispatch_events_tx.send(event);
    }
}
