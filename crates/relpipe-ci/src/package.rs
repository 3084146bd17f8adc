//! Packaging stage: version derivation, staging install and package checks.

use crate::tool::BuildTool;
use relpipe_core::{
    run_checked, Artifact, BuildConfiguration, CommandRunner, CommandSpec, Environment,
    PipelineError, Result,
};
use relpipe_env::DependencyHome;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Strip surrounding whitespace and a leading `v` before a digit.
pub fn normalize_version(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.strip_prefix('v') {
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => rest.to_string(),
        _ => trimmed.to_string(),
    }
}

/// Version of the checkout at `source_dir`, from `git describe --tags --always`.
pub async fn derive_version(
    runner: &dyn CommandRunner,
    env: &Environment,
    source_dir: &Path,
) -> Result<String> {
    let describe = env.command(
        CommandSpec::new("git")
            .arg("-C")
            .arg(source_dir.to_string_lossy())
            .args(["describe", "--tags", "--always"]),
    );
    let output = run_checked(runner, &describe, |detail| {
        PipelineError::Packaging(format!("cannot derive version: {}", detail))
    })
    .await?;
    let version = normalize_version(&output.stdout);
    if version.is_empty() {
        return Err(PipelineError::Packaging(
            "git describe returned an empty version".to_string(),
        ));
    }
    Ok(version)
}

/// Control fields of a Debian package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub package: String,
    pub version: String,
    pub architecture: Option<String>,

    /// Raw `Depends` field (empty when the package has none).
    pub depends: String,
}

impl PackageMetadata {
    /// Fields requested from `dpkg-deb --field`.
    pub const FIELDS: [&'static str; 4] = ["Package", "Version", "Architecture", "Depends"];

    /// Command printing the control fields of the package at `path`.
    pub fn query(path: &Path) -> CommandSpec {
        CommandSpec::new("dpkg-deb")
            .arg("--field")
            .arg(path.to_string_lossy())
            .args(Self::FIELDS)
    }

    /// Parse `Field: value` control text. Continuation lines are folded
    /// into the preceding field.
    pub fn parse(control: &str) -> Option<Self> {
        let mut fields: BTreeMap<String, String> = BTreeMap::new();
        let mut current: Option<String> = None;
        for line in control.lines() {
            if line.starts_with([' ', '\t']) {
                if let Some(value) = current.as_ref().and_then(|key| fields.get_mut(key)) {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim().to_ascii_lowercase();
                fields.insert(key.clone(), value.trim().to_string());
                current = Some(key);
            }
        }

        Some(Self {
            package: fields.remove("package").filter(|v| !v.is_empty())?,
            version: fields.remove("version").filter(|v| !v.is_empty())?,
            architecture: fields.remove("architecture").filter(|v| !v.is_empty()),
            depends: fields.remove("depends").unwrap_or_default(),
        })
    }

    /// Direct dependencies, one group per comma-separated entry. Each group
    /// lists its alternatives with version constraints and architecture
    /// qualifiers removed.
    pub fn dependency_groups(&self) -> Vec<Vec<String>> {
        self.depends
            .split(',')
            .map(|group| {
                group
                    .split('|')
                    .filter_map(|alternative| {
                        let name = alternative.split('(').next()?.trim();
                        let name = name.split(':').next()?.trim();
                        (!name.is_empty()).then(|| name.to_string())
                    })
                    .collect::<Vec<_>>()
            })
            .filter(|group| !group.is_empty())
            .collect()
    }

    /// First alternative of each dependency group.
    pub fn dependency_names(&self) -> Vec<String> {
        self.dependency_groups()
            .into_iter()
            .filter_map(|group| group.into_iter().next())
            .collect()
    }
}

/// A package produced by the packaging stage, with its verified metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagedArtifact {
    pub artifact: Artifact,
    pub metadata: PackageMetadata,
}

/// Installs into a staging prefix, packages, and checks the package version.
pub struct PackagingStage {
    runner: Arc<dyn CommandRunner>,
    tool: Arc<dyn BuildTool>,
    staging_dir: PathBuf,
}

impl PackagingStage {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        tool: Arc<dyn BuildTool>,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            tool,
            staging_dir: staging_dir.into(),
        }
    }

    pub async fn run(
        &self,
        env: &Environment,
        config: &BuildConfiguration,
        deps: &[DependencyHome],
        binary: &Artifact,
        version: &str,
    ) -> Result<PackagedArtifact> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        self.tool
            .install(env, config, deps, &self.staging_dir)
            .await?;

        let artifact = self
            .tool
            .package(env, config, deps, binary, version)
            .await?;

        let query = env.command(PackageMetadata::query(artifact.path()));
        let output = run_checked(self.runner.as_ref(), &query, |detail| {
            PipelineError::Packaging(format!(
                "cannot read control fields of {}: {}",
                artifact.path().display(),
                detail
            ))
        })
        .await?;
        let metadata = PackageMetadata::parse(&output.stdout).ok_or_else(|| {
            PipelineError::Packaging(format!(
                "{} has no Package/Version control fields",
                artifact.path().display()
            ))
        })?;

        if metadata.version != version {
            return Err(PipelineError::Packaging(format!(
                "package version '{}' does not match build version '{}'",
                metadata.version, version
            )));
        }

        info!(
            package = %metadata.package,
            version = %metadata.version,
            digest = %artifact.digest().short(),
            "Package produced"
        );
        Ok(PackagedArtifact { artifact, metadata })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::Scons;
    use relpipe_core::fakes::RecordingRunner;
    use relpipe_core::StageKind;
    use tempfile::tempdir;

    const CONTROL: &str = "Package: camotics\nVersion: 1.2.0\nArchitecture: amd64\n\
Depends: libc6 (>= 2.29), libqt5core5a (>= 5.12.2),\n libqt5opengl5 | \
libqt5opengl5-gles, libv8-dev:any\n";

    #[test]
    fn test_normalize_version() {
        assert_eq!(normalize_version("v1.2.0\n"), "1.2.0");
        assert_eq!(normalize_version("1.2.0-4-gdeadbee"), "1.2.0-4-gdeadbee");
        assert_eq!(normalize_version("vendor-build"), "vendor-build");
    }

    #[test]
    fn test_parse_control_fields() {
        let meta = PackageMetadata::parse(CONTROL).unwrap();
        assert_eq!(meta.package, "camotics");
        assert_eq!(meta.version, "1.2.0");
        assert_eq!(meta.architecture.as_deref(), Some("amd64"));
        assert_eq!(
            meta.dependency_names(),
            vec!["libc6", "libqt5core5a", "libqt5opengl5", "libv8-dev"]
        );
        assert_eq!(
            meta.dependency_groups()[2],
            vec!["libqt5opengl5".to_string(), "libqt5opengl5-gles".to_string()]
        );
    }

    #[test]
    fn test_parse_without_depends() {
        let meta = PackageMetadata::parse("Package: tool\nVersion: 0.1\n").unwrap();
        assert!(meta.dependency_names().is_empty());
        assert!(PackageMetadata::parse("Version: 0.1\n").is_none());
    }

    #[tokio::test]
    async fn test_derive_version_strips_prefix() {
        let runner = RecordingRunner::new();
        runner.on("describe --tags --always", 0, "v1.2.0\n");
        let version = derive_version(&runner, &Environment::host(), Path::new("/src"))
            .await
            .unwrap();
        assert_eq!(version, "1.2.0");
        assert!(runner.ran("git -C /src describe --tags --always"));
    }

    fn seeded(
        dir: &Path,
        runner: &Arc<RecordingRunner>,
        control: &str,
    ) -> (PackagingStage, Artifact) {
        std::fs::write(dir.join("camotics"), b"ELF").unwrap();
        let deb = dir.join("camotics_1.2.0_amd64.deb");
        runner.on_effect("scons package", move |_| std::fs::write(&deb, b"deb").unwrap());
        runner.on("dpkg-deb --field", 0, control);

        let tool = Arc::new(Scons::new(runner.clone(), dir, "camotics", "camotics"));
        let stage = PackagingStage::new(runner.clone(), tool, dir.join("stage"));
        let binary = Artifact::capture(dir.join("camotics"), StageKind::Build).unwrap();
        (stage, binary)
    }

    #[tokio::test]
    async fn test_package_version_matches_build_version() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let (stage, binary) = seeded(dir.path(), &runner, CONTROL);

        let packaged = stage
            .run(&Environment::host(), &BuildConfiguration::default(), &[], &binary, "1.2.0")
            .await
            .unwrap();

        assert_eq!(packaged.metadata.version, "1.2.0");
        assert!(dir.path().join("stage").is_dir());
        let install = runner.position("scons install").unwrap();
        let package = runner.position("scons package").unwrap();
        assert!(install < package);
        assert!(runner.ran(&format!("prefix={}", dir.path().join("stage").display())));
    }

    #[tokio::test]
    async fn test_version_mismatch_is_packaging_error() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let control = CONTROL.replace("Version: 1.2.0", "Version: 1.1.9");
        let (stage, binary) = seeded(dir.path(), &runner, &control);

        let err = stage
            .run(&Environment::host(), &BuildConfiguration::default(), &[], &binary, "1.2.0")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Packaging(_)));
        assert!(err.to_string().contains("1.1.9"));
    }
}
