//! Error taxonomy for pipeline stages.
//!
//! Every stage failure is fatal for its pipeline instance. The variants
//! differ in what they tell the operator: a `Validation` failure points at
//! the package's dependency declarations, everything else at the build
//! environment or infrastructure.

use thiserror::Error;

/// Errors produced by pipeline stages.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Invalid or missing configuration, detected before any external call
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Environment creation or package installation failed
    #[error("Provisioning of environment '{environment}' failed: {detail}")]
    Provision { environment: String, detail: String },

    /// Pinned dependency could not be retrieved, checked out or built
    #[error("Fetching dependency '{dependency}' failed: {detail}")]
    Fetch { dependency: String, detail: String },

    /// Build tool failure
    #[error("Build failed: {0}")]
    Build(String),

    /// Packaging target failure or inconsistent package metadata
    #[error("Packaging failed: {0}")]
    Packaging(String),

    /// Package did not install or run in a clean environment
    #[error("Package validation failed: {reason}")]
    Validation { reason: String, install_log: String },

    /// Naming collision, double publication or upload failure
    #[error("Publish failed: {0}")]
    Publish(String),

    /// A platform failed, so the release for `tag` was not created.
    /// `install_log` holds the logs of failed validations, one section per
    /// platform.
    #[error("Publish failed: release {tag} aborted: {reason}")]
    ReleaseAborted {
        tag: String,
        reason: String,
        install_log: Option<String>,
    },

    /// Process could not be spawned or timed out
    #[error(transparent)]
    Command(#[from] CommandError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Short machine-readable category, used in reports and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Configuration(_) => "configuration",
            PipelineError::Provision { .. } => "provision",
            PipelineError::Fetch { .. } => "fetch",
            PipelineError::Build(_) => "build",
            PipelineError::Packaging(_) => "packaging",
            PipelineError::Validation { .. } => "validation",
            PipelineError::Publish(_) | PipelineError::ReleaseAborted { .. } => "publish",
            PipelineError::Command(_) => "command",
            PipelineError::Io(_) => "io",
        }
    }

    /// Install log captured by a failed validation, if any.
    pub fn install_log(&self) -> Option<&str> {
        match self {
            PipelineError::Validation { install_log, .. } => Some(install_log),
            PipelineError::ReleaseAborted { install_log, .. } => install_log.as_deref(),
            _ => None,
        }
    }
}

/// Errors raised while running an external process.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Command has no program")]
    EmptyCommand,

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' timed out after {secs} seconds")]
    Timeout { program: String, secs: u64 },
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
