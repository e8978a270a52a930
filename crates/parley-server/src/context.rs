//! The application context: every per-process singleton, built once.

use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;
use parley_calls::{CallService, CallStore, Clock, SqliteDirectory, SystemClock};
use parley_core::{ConversationDirectory, DeviceRecorder, PushSender, TokenVerifier};

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::fanout::FanoutAdapter;
use crate::router::MessageRouter;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::manager::ConnectionManager;

/// External services the core consumes.
pub struct Collaborators {
    /// Verifies upgrade and API tokens.
    pub verifier: Arc<dyn TokenVerifier>,
    /// Resolves conversation membership.
    pub directory: Arc<dyn ConversationDirectory>,
    /// Records device online/offline.
    pub devices: Arc<dyn DeviceRecorder>,
    /// Offline push fallback.
    pub push: Arc<dyn PushSender>,
    /// Time source for call timestamps.
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Membership and device bookkeeping from the call store's own database.
    pub fn sqlite(store: &CallStore, verifier: Arc<dyn TokenVerifier>, push: Arc<dyn PushSender>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let directory = Arc::new(SqliteDirectory::new(store.clone(), clock.clone()));
        Self {
            verifier,
            directory: directory.clone(),
            devices: directory,
            push,
            clock,
        }
    }
}

/// Shared state handed to every request handler and session.
pub struct AppContext {
    /// Runtime knobs.
    pub config: ServerConfig,
    /// Local device registry.
    pub connections: Arc<ConnectionManager>,
    /// Upgrade and API authentication.
    pub authenticator: Authenticator,
    /// Cross-process bridge.
    pub fanout: Arc<FanoutAdapter>,
    /// Entry point for pushing events.
    pub router: Arc<MessageRouter>,
    /// Call lifecycle.
    pub calls: CallService,
    /// Device online/offline recorder.
    pub devices: Arc<dyn DeviceRecorder>,
    /// Cancels background work and tracks its tasks.
    pub shutdown: ShutdownCoordinator,
    /// Set when the binary installed a Prometheus recorder.
    pub metrics: Option<PrometheusHandle>,
    /// Process start, for uptime.
    pub start_time: Instant,
}

impl AppContext {
    /// Wire the registry, router and call service together.
    pub fn new(config: ServerConfig, store: CallStore, fanout: FanoutAdapter, collaborators: Collaborators) -> Self {
        let Collaborators {
            verifier,
            directory,
            devices,
            push,
            clock,
        } = collaborators;
        let connections = Arc::new(ConnectionManager::new(config.limits));
        let fanout = Arc::new(fanout);
        let router = MessageRouter::new(connections.clone(), fanout.clone(), directory);
        let calls = CallService::new(store, router.clone(), push, clock);
        Self {
            config,
            connections,
            authenticator: Authenticator::new(verifier),
            fanout,
            router,
            calls,
            devices,
            shutdown: ShutdownCoordinator::new(),
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Attach the handle `/metrics` renders from.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("config", &self.config)
            .field("connections", &self.connections.connection_count())
            .field("fanout", &self.fanout)
            .finish_non_exhaustive()
    }
}
