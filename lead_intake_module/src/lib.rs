pub mod canonical;
pub mod classifier;
pub mod dedupe;
pub mod handshake;
pub mod lead;
pub mod notifier;
pub mod pipeline;
pub mod service;
pub mod store;
pub mod tenant;

mod html;

pub use canonical::{canonicalize, InboundMessage, InboundPayload};
pub use pipeline::{
    process_inbound_email, PipelineDeps, PipelineError, PipelineOutcome, PipelineSettings,
};
