use crate::pipeline::{PipelineDeps, PipelineSettings};

use super::config::ServiceConfig;

/// Shared request state for the webhook router.
#[derive(Clone)]
pub struct AppState {
    pub(super) deps: PipelineDeps,
    pub(super) settings: PipelineSettings,
    pub(super) signing_key: Option<String>,
    pub(super) require_signature: bool,
}

impl AppState {
    pub fn new(deps: PipelineDeps, config: &ServiceConfig) -> Self {
        Self {
            deps,
            settings: config.pipeline_settings(),
            signing_key: config.mailgun_signing_key.clone(),
            require_signature: config.require_signature,
        }
    }

    pub fn deps(&self) -> &PipelineDeps {
        &self.deps
    }
}
