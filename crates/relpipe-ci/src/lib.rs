//! relpipe CI - build, package, validate and release
//!
//! Provides the per-platform release pipeline and its coordinator:
//! - Builds and packages a project through a [`BuildTool`]
//! - Installs and smoke-tests the package in a clean environment
//! - Renames validated packages per distribution
//! - Publishes one release once every platform passed

pub mod coordinator;
pub mod gate;
pub mod package;
pub mod pipeline;
pub mod release;
pub mod rename;
pub mod spec;
pub mod stage;
pub mod tool;
pub mod validate;

// Re-export key types
pub use coordinator::{CiCoordinator, CoordinatorOutcome};
pub use gate::{GateVerdict, InstanceStatus, ReleaseGate};
pub use package::{
    derive_version, normalize_version, PackageMetadata, PackagedArtifact, PackagingStage,
};
pub use pipeline::{Pipeline, PipelineReport, PipelineSettings, PlatformPipeline, PlatformTarget};
pub use release::{
    DirectoryPublisher, GitHubPublisher, PublishedAsset, PublishedRelease, ReleasePublisher,
    ReleaseRequest,
};
pub use rename::{normalized_file_name, query_distro, DebFileName, RenameStage};
pub use spec::RunIdentity;
pub use stage::StageRecord;
pub use tool::{BuildTool, Scons};
pub use validate::{
    validation_env_name, ValidatedPackage, ValidationReport, ValidationStage, ValidationState,
};
