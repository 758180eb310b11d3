//! The binder context and its HTTP/WebSocket surface.
//!
//! [`Binder`] owns the subsystems — job engine, api set, session store,
//! event hub — wired from one [`Config`]. There is no process-global
//! state: embedders build a binder, register bindings, and serve.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use junction_api::{ApiError, ApiSet, Binding, BoundApi, EventHub};
use junction_jobs::{JobConfig, JobEngine};
use junction_session::{SessionError, SessionStore, StoreConfig};

use crate::config::Config;
use crate::ws;

/// Binder startup failure.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The session store refused its configuration.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A binding could not be registered.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The listener could not be bound or served.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything one binder process hosts.
pub struct Binder {
    /// Resolved configuration.
    pub config: Config,
    /// The worker pool all requests run on.
    pub engine: JobEngine,
    /// The hosted apis.
    pub apiset: Arc<ApiSet>,
    /// The authentication contexts.
    pub sessions: Arc<SessionStore>,
    /// The event registry.
    pub hub: EventHub,
}

/// Shared state behind the HTTP routes.
pub struct AppState {
    /// The hosted apis.
    pub apiset: Arc<ApiSet>,
    /// The authentication contexts.
    pub sessions: Arc<SessionStore>,
    /// The event registry.
    pub hub: EventHub,
    /// Renders `/metrics`.
    pub metrics: PrometheusHandle,
}

impl Binder {
    /// Wire the subsystems from `config`.
    ///
    /// Must be called within a tokio runtime; the job engine spawns its
    /// workers onto it.
    pub fn new(config: Config) -> Result<Binder, ServerError> {
        let engine = JobEngine::new(JobConfig {
            allowed: config.workers,
            pending: config.pending_jobs,
        });
        let apiset = ApiSet::new(
            engine.clone(),
            std::time::Duration::from_secs(config.call_timeout),
        );
        let sessions = Arc::new(SessionStore::new(StoreConfig {
            max_count: config.session_max,
            ttl: chrono::Duration::seconds(config.session_timeout as i64),
            initial_token: config.initial_token.clone(),
        })?);
        let hub = EventHub::new();

        Ok(Binder {
            config,
            engine,
            apiset,
            sessions,
            hub,
        })
    }

    /// Compile and register a binding.
    pub fn add_binding(&self, binding: Binding) -> Result<(), ServerError> {
        let api = BoundApi::new(binding)?;
        let name = api.name().to_owned();
        self.apiset.add(&name, api)?;
        Ok(())
    }

    /// Build the HTTP router over this binder's state.
    pub fn router(&self, metrics: PrometheusHandle) -> Router {
        let state = Arc::new(AppState {
            apiset: Arc::clone(&self.apiset),
            sessions: Arc::clone(&self.sessions),
            hub: self.hub.clone(),
            metrics,
        });
        Router::new()
            .route("/v1/ws", get(ws::handler))
            .route("/healthz", get(healthz))
            .route("/metrics", get(render_metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start every service, then serve on the configured address until
    /// the listener fails or the process stops.
    pub async fn serve(&self, metrics: PrometheusHandle) -> Result<(), ServerError> {
        self.apiset.start_all()?;
        self.apiset.set_verbosity(None, self.config.verbosity);

        let listener =
            tokio::net::TcpListener::bind((self.config.bind.as_str(), self.config.port)).await?;
        info!(addr = %listener.local_addr()?, "binder listening");
        self.serve_on(listener, metrics).await
    }

    /// Serve on an already-bound listener (tests bind port 0).
    pub async fn serve_on(
        &self,
        listener: tokio::net::TcpListener,
        metrics: PrometheusHandle,
    ) -> Result<(), ServerError> {
        // Expired sessions are reaped lazily on access; the sweep catches
        // the ones nobody touches again.
        let sessions = Arc::clone(&self.sessions);
        let sweeper = tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                let _ = tick.tick().await;
                sessions.purge();
            }
        });

        let served = axum::serve(listener, self.router(metrics)).await;
        sweeper.abort();
        served?;
        Ok(())
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics.render()
}
