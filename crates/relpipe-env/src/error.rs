//! Error types for relpipe-env

use relpipe_core::PipelineError;
use thiserror::Error;

/// Errors that can occur while provisioning environments or fetching
/// dependencies
#[derive(Error, Debug)]
pub enum EnvError {
    /// No base image configured
    #[error("No base image configured; refusing to provision '{0}'")]
    MissingImage(String),

    /// Revision is not an exact commit id
    #[error("Dependency '{name}' is not pinned to an exact commit: '{revision}'")]
    UnpinnedRevision { name: String, revision: String },

    /// Environment command failed
    #[error("Provisioning '{environment}' failed: {detail}")]
    ProvisionFailed { environment: String, detail: String },

    /// Dependency retrieval, checkout or build failed
    #[error("Fetching '{dependency}' failed: {detail}")]
    FetchFailed { dependency: String, detail: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<EnvError> for PipelineError {
    fn from(err: EnvError) -> Self {
        match err {
            EnvError::MissingImage(_) | EnvError::UnpinnedRevision { .. } => {
                PipelineError::Configuration(err.to_string())
            }
            EnvError::ProvisionFailed {
                environment,
                detail,
            } => PipelineError::Provision {
                environment,
                detail,
            },
            EnvError::FetchFailed { dependency, detail } => {
                PipelineError::Fetch { dependency, detail }
            }
            EnvError::Io(e) => PipelineError::Io(e),
        }
    }
}
