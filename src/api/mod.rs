//! HTTP API for the metered gateway.
//!
//! Endpoints:
//! - GET /health - Health check
//! - POST /llm/chat/completions - Metered chat completions
//! - POST /llm/embeddings - Metered embeddings
//! - GET /llm/usage - Caller's own usage aggregate and ledger state
//! - GET /llm/models - Models visible to the caller

mod handlers;
mod types;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::admission::{AdmissionController, SlidingWindowStore};
use crate::config::Config;
use crate::dispatch::{InternalProvider, ProviderDispatcher};
use crate::http::create_client_with_timeout;
use crate::ledger::BillingLedgerUpdater;
use crate::pipeline::Gateway;
use crate::resolver::ModelResolver;
use crate::secrets::CredentialDecryptor;
use crate::store::{GatewayDb, LedgerStore, ModelCatalog, UsageStore};

pub use handlers::{
    api_key, client_meta, request_id, RATE_LIMIT_LIMIT_HEADER, RATE_LIMIT_REMAINING_HEADER,
    RATE_LIMIT_RESET_HEADER, REQUEST_ID_HEADER,
};
pub use types::*;

/// Application state shared across handlers.
pub struct AppState {
    pub gateway: Gateway,
    pub catalog: Arc<dyn ModelCatalog>,
    pub ledger: Arc<dyn LedgerStore>,
    pub usage: Arc<dyn UsageStore>,
}

impl AppState {
    /// Wire the full pipeline against one database.
    pub fn new(
        config: &Config,
        db: Arc<GatewayDb>,
        window_store: Arc<dyn SlidingWindowStore>,
        decryptor: Arc<dyn CredentialDecryptor>,
    ) -> Result<Self, reqwest::Error> {
        let client = create_client_with_timeout(config.upstream.timeout())?;
        let admission = AdmissionController::new(
            window_store,
            db.clone(),
            db.clone(),
            config.admission.window(),
        );
        let resolver = ModelResolver::new(
            db.clone(),
            Duration::from_secs(config.catalog.cache_ttl_secs),
        );
        let dispatcher =
            ProviderDispatcher::new(client, InternalProvider::from(&config.upstream), decryptor);
        let gateway = Gateway::new(
            db.clone(),
            admission,
            resolver,
            dispatcher,
            db.clone(),
            BillingLedgerUpdater::new(db.clone()),
        )
        .with_verbosity(config.logging.verbosity);

        Ok(Self {
            gateway,
            catalog: db.clone(),
            ledger: db.clone(),
            usage: db,
        })
    }
}

/// Create the API router with custom state.
pub fn create_router_with_state(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/llm/chat/completions", post(handlers::chat_completions))
        .route("/llm/embeddings", post(handlers::embeddings))
        .route("/llm/usage", get(handlers::usage))
        .route("/llm/models", get(handlers::list_models))
        .with_state(Arc::new(state))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}
