//! Error types for the tracking server.

use event_pipeline::PipelineError;
use thiserror::Error;
use tracking_hub::HubError;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hub error: {0}")]
    Hub(#[from] HubError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Mail relay rejected message: {0}")]
    MailRejected(String),
}

pub type ServerResult<T> = Result<T, ServerError>;
