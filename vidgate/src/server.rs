//! Server wiring: shared state construction, router, graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use vidgate_core::context::BackgroundTasks;
use vidgate_core::derivative::DerivativeResolver;
use vidgate_core::routing::PatternRuleset;
use vidgate_core::signer::{NoopSigner, OriginSigner};
use vidgate_core::transform::TransformLimits;
use vidgate_core::upstream::TransformClient;
use vidgate_core::{CacheOrchestrator, Config, KvNamespaces};

use crate::http::{health, video};

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ruleset: Arc<PatternRuleset>,
    pub resolver: Arc<DerivativeResolver>,
    pub limits: Arc<TransformLimits>,
    pub orchestrator: Arc<CacheOrchestrator>,
    pub signer: Arc<dyn OriginSigner>,
    pub background: Arc<BackgroundTasks>,
}

impl AppState {
    pub async fn build(config: Config) -> Result<Self> {
        let kv = match config.kv.url {
            Some(_) => KvNamespaces::connect(&config.kv).await?,
            None => KvNamespaces::in_memory(config.kv.max_value_bytes),
        };

        let limits = Arc::new(TransformLimits::new());
        let client = Arc::new(TransformClient::new(&config.media, limits.clone())?);
        let orchestrator = Arc::new(CacheOrchestrator::new(kv, client, &config.cache));
        let ruleset = Arc::new(PatternRuleset::from_config(&config.routing));
        let resolver = Arc::new(DerivativeResolver::new(config.derivatives.clone()));

        Ok(Self {
            config: Arc::new(config),
            ruleset,
            resolver,
            limits,
            orchestrator,
            signer: Arc::new(NoopSigner),
            background: Arc::new(BackgroundTasks::default()),
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .fallback(video::handle)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(config: Config) -> Result<()> {
    let drain_window = Duration::from_secs(config.server.shutdown_drain_seconds);
    let address = config.server.listen_address();

    let state = AppState::build(config).await?;
    let background = state.background.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("listening on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Give detached stores and refreshes a bounded window to land.
    info!(
        pending = background.pending(),
        "draining background tasks"
    );
    background.drain(drain_window).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install ctrl-c handler");
        return;
    }
    info!("shutdown signal received");
}
