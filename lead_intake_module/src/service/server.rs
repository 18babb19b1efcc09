use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use send_sms_module::TwilioClient;
use tokio::task;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::notifier::{DisabledNotifier, Notifier, SmsNotifier};
use crate::pipeline::PipelineDeps;
use crate::store::{PostgresStore, SqliteStore};

use super::config::{ConfigError, ServiceConfig, StoreBackend};
use super::handlers::{health, ingest_inbound_email};
use super::state::AppState;
use super::BoxError;

pub fn build_router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/inbound-email", post(ingest_inbound_email))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
}

/// Opens the configured store and notifier. Blocking; call off the async runtime.
pub fn build_pipeline_deps(config: &ServiceConfig) -> Result<PipelineDeps, BoxError> {
    let notifier = build_notifier(config);
    let deps = match config.store_backend {
        StoreBackend::Sqlite => {
            info!("lead store backend=sqlite path={}", config.store_path.display());
            PipelineDeps::from_store(Arc::new(SqliteStore::new(&config.store_path)?), notifier)
        }
        StoreBackend::Postgres => {
            let db_url = config
                .database_url
                .as_deref()
                .ok_or(ConfigError::MissingDatabaseUrl)?;
            info!("lead store backend=postgres db_url=***");
            PipelineDeps::from_store(Arc::new(PostgresStore::new_from_url(db_url)?), notifier)
        }
    };
    Ok(deps)
}

fn build_notifier(config: &ServiceConfig) -> Arc<dyn Notifier> {
    let Some(from) = config.twilio_from_number.clone() else {
        warn!("TWILIO_FROM_NUMBER not set; lead SMS alerts disabled");
        return Arc::new(DisabledNotifier);
    };
    match TwilioClient::from_env() {
        Ok(client) => Arc::new(SmsNotifier::new(client, from)),
        Err(err) => {
            warn!("twilio client unavailable; lead SMS alerts disabled: {}", err);
            Arc::new(DisabledNotifier)
        }
    }
}

pub async fn run_server(
    config: ServiceConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    let deps_config = config.clone();
    let deps = task::spawn_blocking(move || build_pipeline_deps(&deps_config))
        .await
        .map_err(|err| -> BoxError { err.into() })??;
    let state = AppState::new(deps, &config);

    let host: IpAddr = config
        .host
        .parse()
        .map_err(|_| format!("invalid host: {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    info!(
        "inbound lead service listening on {} (signature required={}, gmail automation={})",
        addr,
        config.require_signature || config.mailgun_signing_key.is_some(),
        config.gmail_verification_automation
    );

    let app = build_router(state.clone(), config.inbound_body_max_bytes);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    // The blocking SMS client must not be dropped on an async worker.
    let _ = task::spawn_blocking(move || drop(state)).await;
    serve_result?;
    Ok(())
}
