//! Domain types shared by every pipeline stage.

pub mod artifact;
pub mod environment;
pub mod release;

pub use artifact::{Artifact, ContentDigest, StageKind};
pub use environment::{Cleanliness, Environment, ExecTarget};
pub use release::{DistroIdentity, ReleaseManifest, TriggerEvent};
