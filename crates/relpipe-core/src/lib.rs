//! relpipe core library
//!
//! Shared building blocks for the release pipeline:
//! - Build configuration and the `relpipe.toml` file format
//! - Process execution behind the [`CommandRunner`] trait
//! - Domain types: artifacts, environments, release manifests
//! - The [`PipelineError`] taxonomy used by every stage

pub mod command;
pub mod config;
pub mod domain;
pub mod error;
pub mod fakes;
pub mod telemetry;

pub use command::{run_checked, CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use config::{
    parse_parallelism, ArchLinkPolicy, BuildConfiguration, BuildMode, DependencyConfig,
    EnvironmentConfig, GitHubConfig, PipelineConfig, PlatformConfig, ProjectConfig,
    ReleaseConfig,
};
pub use domain::{
    Artifact, Cleanliness, ContentDigest, DistroIdentity, Environment, ExecTarget,
    ReleaseManifest, StageKind, TriggerEvent,
};
pub use error::{CommandError, PipelineError, Result};
pub use telemetry::init_tracing;

/// relpipe version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
