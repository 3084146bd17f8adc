//! Release inputs and the aggregated per-platform manifest.

use super::artifact::Artifact;
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Distribution name and version, as found in `/etc/os-release`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DistroIdentity {
    /// `ID`, e.g. `ubuntu`.
    pub id: String,
    /// `VERSION_ID`, e.g. `20.04`.
    pub version: String,
}

impl DistroIdentity {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }

    /// Parse the contents of an os-release file.
    ///
    /// Rolling distributions without `VERSION_ID` fall back to
    /// `VERSION_CODENAME`.
    pub fn from_os_release(content: &str) -> Option<Self> {
        let mut fields = BTreeMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let value = value.trim().trim_matches('"').trim_matches('\'');
                fields.insert(key.trim(), value.to_string());
            }
        }

        let id = fields.get("ID").filter(|v| !v.is_empty())?.to_ascii_lowercase();
        let version = fields
            .get("VERSION_ID")
            .or_else(|| fields.get("VERSION_CODENAME"))
            .filter(|v| !v.is_empty())?
            .clone();
        Some(Self { id, version })
    }

    /// `<id>-<version>`, e.g. `ubuntu-20.04`.
    pub fn slug(&self) -> String {
        format!("{}-{}", self.id, self.version)
    }
}

impl fmt::Display for DistroIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.slug())
    }
}

/// The event that starts a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Full git ref, e.g. `refs/tags/v1.2.0`.
    pub git_ref: String,

    /// Message associated with the ref (annotated tag text).
    pub message: String,
}

impl TriggerEvent {
    pub fn new(git_ref: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            git_ref: git_ref.into(),
            message: message.into(),
        }
    }

    /// Tag name if this event is a tag push.
    pub fn tag(&self) -> Option<&str> {
        self.git_ref
            .strip_prefix("refs/tags/")
            .filter(|tag| !tag.is_empty())
    }
}

/// Platform id -> validated, renamed artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseManifest {
    entries: BTreeMap<String, Artifact>,
}

impl ReleaseManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a platform's artifact.
    ///
    /// Fails when the platform is already present or another entry has the
    /// same final file name.
    pub fn insert(&mut self, platform: impl Into<String>, artifact: Artifact) -> Result<()> {
        let platform = platform.into();
        if self.entries.contains_key(&platform) {
            return Err(PipelineError::Publish(format!(
                "platform '{}' already has an artifact",
                platform
            )));
        }
        let name = artifact.file_name().ok_or_else(|| {
            PipelineError::Publish(format!(
                "artifact {} has no file name",
                artifact.path().display()
            ))
        })?;
        if let Some((other, _)) = self
            .entries
            .iter()
            .find(|(_, existing)| existing.file_name() == Some(name))
        {
            return Err(PipelineError::Publish(format!(
                "file name '{}' of platform '{}' collides with platform '{}'",
                name, platform, other
            )));
        }
        self.entries.insert(platform, artifact);
        Ok(())
    }

    pub fn get(&self, platform: &str) -> Option<&Artifact> {
        self.entries.get(platform)
    }

    pub fn platforms(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Final file names, sorted.
    pub fn file_names(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .filter_map(|a| a.file_name().map(str::to_string))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
