//! Run identity for a pipeline instance.

use relpipe_core::BuildConfiguration;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Deterministic identity of a pipeline instance's inputs.
///
/// Two instances with equal identities were given the same image, build
/// options and dependency pin, so their packages are expected to match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    pub platform: String,

    pub image: String,

    /// Pinned dependency revision, if any.
    pub dependency_revision: Option<String>,

    /// SHA-256 over the ordered tool options.
    pub options_digest: String,

    /// SHA-256 over all of the above.
    pub digest: String,
}

impl RunIdentity {
    pub fn new(
        platform: &str,
        image: &str,
        config: &BuildConfiguration,
        dependency_revision: Option<&str>,
    ) -> Self {
        let mut options: Vec<String> = config
            .options()
            .into_iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        if let Some(jobs) = config.jobs {
            options.push(format!("jobs={}", jobs));
        }
        let options_digest = digest_parts(options.iter().map(String::as_str));
        let digest = digest_parts([
            platform,
            image,
            dependency_revision.unwrap_or(""),
            options_digest.as_str(),
        ]);
        Self {
            platform: platform.to_string(),
            image: image.to_string(),
            dependency_revision: dependency_revision.map(str::to_string),
            options_digest,
            digest,
        }
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.digest[..12]
    }
}

/// Digest of NUL-separated parts.
fn digest_parts<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relpipe_core::BuildMode;

    #[test]
    fn test_identity_is_deterministic() {
        let config = BuildConfiguration::default();
        let a = RunIdentity::new("ubuntu-20.04", "ubuntu:20.04", &config, Some("abc"));
        let b = RunIdentity::new("ubuntu-20.04", "ubuntu:20.04", &config, Some("abc"));
        assert_eq!(a, b);
        assert_eq!(a.digest.len(), 64);
        assert_eq!(a.short().len(), 12);
    }

    #[test]
    fn test_identity_tracks_options_and_pin() {
        let base = BuildConfiguration::default();
        let debug = BuildConfiguration {
            mode: BuildMode::Debug,
            ..BuildConfiguration::default()
        };
        let a = RunIdentity::new("debian-12", "debian:12", &base, Some("abc"));
        let b = RunIdentity::new("debian-12", "debian:12", &debug, Some("abc"));
        let c = RunIdentity::new("debian-12", "debian:12", &base, Some("def"));

        assert_ne!(a.options_digest, b.options_digest);
        assert_ne!(a.digest, b.digest);
        assert_eq!(a.options_digest, c.options_digest);
        assert_ne!(a.digest, c.digest);
    }
}
