// Library interface for the web remote relay
// Exposes the relay wiring and HTTP router so the binary and tests share them

pub mod broker;
pub mod catalog;
pub mod config;
pub mod handlers;
pub mod hub;
pub mod link;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod router;


use std::sync::Arc;

use axum::{Router, routing::get};
use rumqttc::EventLoop;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::{MakeSpan, TraceLayer};
use uuid::Uuid;

use crate::broker::BrokerLink;
use crate::config::{RelayConfig, ServerConfig};
use crate::hub::FrontendHub;
use crate::link::LinkManager;
use crate::metrics::RelayMetrics;
use crate::registry::InstanceRegistry;
use crate::router::{CommandRouter, CommandSink};

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<FrontendHub>,
    pub router: Arc<CommandRouter>,
    pub links: Arc<LinkManager>,
    pub broker: Option<Arc<BrokerLink>>,
    /// Relay metrics for observability
    pub metrics: Arc<RelayMetrics>,
    pub server_config: Arc<ServerConfig>,
}

/// The wired relay before any background task runs.
pub struct Relay {
    pub state: AppState,
    broker_events: Option<EventLoop>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let metrics = Arc::new(RelayMetrics::new());
        let registry = Arc::new(InstanceRegistry::new());
        let hub = Arc::new(FrontendHub::new(
            registry.clone(),
            config.server.session_queue,
            metrics.clone(),
        ));
        let links = Arc::new(LinkManager::new(config.link, hub.clone(), metrics.clone()));

        let (broker, broker_events) = match config.broker {
            Some(broker_config) => {
                let (broker, events) = BrokerLink::new(broker_config);
                (Some(broker), Some(events))
            }
            None => (None, None),
        };

        let router = Arc::new(CommandRouter::new(
            registry,
            links.slots().to_vec(),
            broker.clone().map(|b| b as Arc<dyn CommandSink>),
            metrics.clone(),
        ));

        Self {
            state: AppState {
                hub,
                router,
                links,
                broker,
                metrics,
                server_config: Arc::new(config.server),
            },
            broker_events,
        }
    }

    /// Spawn the link supervisors and the broker event loop. Everything
    /// stops when `cancel` fires.
    pub fn start(self, cancel: CancellationToken) -> (AppState, Vec<JoinHandle<()>>) {
        let mut tasks = self.state.links.start(cancel.clone());

        if let (Some(broker), Some(events)) = (self.state.broker.clone(), self.broker_events) {
            let hub = self.state.hub.clone();
            tasks.push(tokio::spawn(broker.run(events, hub, cancel)));
        }

        (self.state, tasks)
    }
}

/// Build the HTTP router: control-panel WebSocket, JSON API, static files.
pub fn app(state: AppState) -> Router {
    let public = ServeDir::new(&state.server_config.public_dir);

    Router::new()
        .route("/", get(handlers::root_handler))
        .route("/ws", get(handlers::frontend_ws_handler))
        .route("/api/remotes", get(handlers::list_remotes))
        .route("/api/instances", get(handlers::list_instances))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .fallback_service(public)
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
