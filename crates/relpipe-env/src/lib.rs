//! relpipe-env: environments and pinned dependencies
//!
//! The two leaf components of the pipeline:
//! - [`Provisioner`] creates containers from a base image with a declared
//!   package set, and refuses to do anything when no image is configured.
//! - [`DependencyFetcher`] checks out a library at an exact revision, reports
//!   a content digest of the checkout and builds it.

pub mod error;
pub mod fetch;
pub mod provision;

pub use error::EnvError;
pub use fetch::{
    digest_tree, hash_tree, DependencyFetcher, DependencyHome, DependencyPin, DependencySpec,
};
pub use provision::{
    apt_get, apt_install, parse_installed, EnvironmentRole, Mount, ProvisionRequest, Provisioner,
};

/// Result type for environment operations
pub type Result<T> = std::result::Result<T, EnvError>;
