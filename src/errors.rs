use thiserror::Error;

use crate::model::ModelError;

/// Process-level failures. Task- and batch-scoped problems stay inside the
/// executor as drops; only structural errors surface here.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
    #[error("config: {0}")]
    Config(String),
    #[error(transparent)]
    Model(#[from] ModelError),
}
