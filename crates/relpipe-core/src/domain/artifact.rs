//! Stage artifacts and their content digests.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Provision,
    Fetch,
    Build,
    Package,
    Validate,
    Rename,
    Publish,
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Provision => "provision",
            StageKind::Fetch => "fetch",
            StageKind::Build => "build",
            StageKind::Package => "package",
            StageKind::Validate => "validate",
            StageKind::Rename => "rename",
            StageKind::Publish => "publish",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Content digest (SHA-256 hex string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Stream a file through SHA-256.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(ContentDigest(hex::encode(hasher.finalize())))
    }

    /// Wrap an already computed hex digest.
    pub fn from_hex(hex: String) -> Self {
        ContentDigest(hex.to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A file produced by exactly one stage.
///
/// The digest is taken when the artifact is captured. Later stages only read
/// the file; [`Artifact::verify`] detects anything that changed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    path: PathBuf,
    produced_by: StageKind,
    digest: ContentDigest,
}

impl Artifact {
    /// Record an existing file as the output of `stage`.
    pub fn capture(path: impl Into<PathBuf>, stage: StageKind) -> io::Result<Self> {
        let path = path.into();
        let digest = ContentDigest::from_file(&path)?;
        Ok(Self {
            path,
            produced_by: stage,
            digest,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn produced_by(&self) -> StageKind {
        self.produced_by
    }

    pub fn digest(&self) -> &ContentDigest {
        &self.digest
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }

    /// Whether the file on disk still matches the captured digest.
    pub fn verify(&self) -> io::Result<bool> {
        Ok(ContentDigest::from_file(&self.path)? == self.digest)
    }
}
