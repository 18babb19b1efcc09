mod config;
mod handlers;
mod server;
mod state;
mod verify;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use config::{ConfigError, ServiceConfig, StoreBackend, DEFAULT_INBOUND_BODY_MAX_BYTES};
pub use server::{build_pipeline_deps, build_router, run_server};
pub use state::AppState;
