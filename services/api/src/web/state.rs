//! services/api/src/web/state.rs
//!
//! Defines the application's shared state and how it is assembled from adapters.

use crate::config::Config;
use session_reliability_core::clock::Clock;
use session_reliability_core::ports::{
    CourseCatalog, LocalStorage, Notifier, ProviderApi, ProviderConfigSource, SessionStore,
    UsageStore,
};
use session_reliability_core::{
    ConnectivityMonitor, ConversationClient, OfflineQueue, PracticeSessions, QueueConfig,
    QuotaEnforcer, SessionManager, SessionResult,
};
use std::sync::Arc;

//=========================================================================================
// AppState (Shared Across All Requests)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub practice: Arc<PracticeSessions>,
    pub config: Arc<Config>,
}

/// The concrete adapters behind every port the core needs.
pub struct Backends {
    pub sessions: Arc<dyn SessionStore>,
    pub usage: Arc<dyn UsageStore>,
    pub provider_config: Arc<dyn ProviderConfigSource>,
    pub catalog: Arc<dyn CourseCatalog>,
    pub provider: Arc<dyn ProviderApi>,
    pub storage: Arc<dyn LocalStorage>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    pub connectivity: Arc<ConnectivityMonitor>,
}

impl AppState {
    /// Restores the offline queue and wires the core components together.
    pub async fn assemble(config: Arc<Config>, backends: Backends) -> SessionResult<Self> {
        let queue_config = QueueConfig {
            process_interval: config.queue_process_interval,
            ..QueueConfig::default()
        };
        let queue = Arc::new(
            OfflineQueue::load(
                backends.storage,
                backends.connectivity.clone(),
                backends.clock.clone(),
                backends.notifier.clone(),
                queue_config,
            )
            .await?,
        );

        let quota = QuotaEnforcer::new(backends.usage, backends.clock.clone(), backends.notifier.clone());
        let sessions = SessionManager::new(backends.sessions, backends.clock.clone());
        let provider = ConversationClient::new(
            backends.provider,
            backends.provider_config,
            backends.catalog,
            backends.connectivity.clone(),
            backends.clock,
            config.callback_origin.clone(),
        );

        let practice = Arc::new(PracticeSessions::new(
            quota,
            sessions,
            provider,
            queue,
            backends.connectivity,
            backends.notifier,
        ));
        Ok(Self { practice, config })
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        self.practice.queue()
    }
}
