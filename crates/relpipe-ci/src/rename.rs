//! Distribution-qualified package names.
//!
//! Debian package files are named `<name>_<version>_<arch>.deb`. Packages
//! built on several distributions would collide under that scheme, so the
//! published name inserts the distribution slug:
//! `<name>_<version>_<distro>-<version_id>_<arch>.deb`.

use crate::validate::ValidatedPackage;
use relpipe_core::{
    run_checked, Artifact, CommandRunner, CommandSpec, ContentDigest, DistroIdentity,
    Environment, PipelineError, Result, StageKind,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Parsed Debian package file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebFileName {
    pub name: String,
    pub version: String,
    /// Distribution slug, present once normalized.
    pub distro: Option<String>,
    pub arch: String,
}

impl DebFileName {
    /// Parse `name_version_arch.deb` or `name_version_distro_arch.deb`.
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(".deb")?;
        let parts: Vec<&str> = stem.split('_').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        match parts.as_slice() {
            [name, version, arch] => Some(Self {
                name: name.to_string(),
                version: version.to_string(),
                distro: None,
                arch: arch.to_string(),
            }),
            [name, version, distro, arch] => Some(Self {
                name: name.to_string(),
                version: version.to_string(),
                distro: Some(distro.to_string()),
                arch: arch.to_string(),
            }),
            _ => None,
        }
    }

    pub fn render(&self) -> String {
        match &self.distro {
            Some(distro) => format!("{}_{}_{}_{}.deb", self.name, self.version, distro, self.arch),
            None => format!("{}_{}_{}.deb", self.name, self.version, self.arch),
        }
    }
}

/// Normalized file name of `file_name` for `distro`.
///
/// A name that already carries this distribution's slug is returned as is;
/// one carrying another distribution's slug is an error.
pub fn normalized_file_name(file_name: &str, distro: &DistroIdentity) -> Result<String> {
    let mut parsed = DebFileName::parse(file_name).ok_or_else(|| {
        PipelineError::Publish(format!(
            "'{}' is not a <name>_<version>_<arch>.deb file name",
            file_name
        ))
    })?;
    let slug = distro.slug();
    match &parsed.distro {
        Some(existing) if *existing == slug => {}
        Some(existing) => {
            return Err(PipelineError::Publish(format!(
                "'{}' is already named for {}, not {}",
                file_name, existing, slug
            )))
        }
        None => parsed.distro = Some(slug),
    }
    Ok(parsed.render())
}

/// Read the distribution identity of `env`.
pub async fn query_distro(runner: &dyn CommandRunner, env: &Environment) -> Result<DistroIdentity> {
    let cat = env.command(CommandSpec::new("cat").arg("/etc/os-release"));
    let output = run_checked(runner, &cat, |detail| PipelineError::Provision {
        environment: env.name.clone(),
        detail: format!("cannot read os-release: {}", detail),
    })
    .await?;
    DistroIdentity::from_os_release(&output.stdout).ok_or_else(|| PipelineError::Provision {
        environment: env.name.clone(),
        detail: "os-release has no ID/VERSION_ID".to_string(),
    })
}

/// Copies validated packages into the output directory under their
/// normalized names.
pub struct RenameStage {
    output_dir: PathBuf,
}

impl RenameStage {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Place `package` in the output directory. The content is never
    /// altered; running this twice yields the same path and bytes.
    pub async fn rename(
        &self,
        package: &ValidatedPackage,
        distro: &DistroIdentity,
    ) -> Result<Artifact> {
        let source = package.artifact();
        let file_name = source.file_name().ok_or_else(|| {
            PipelineError::Publish(format!("{} has no file name", source.path().display()))
        })?;
        let target = self
            .output_dir
            .join(normalized_file_name(file_name, distro)?);

        if !source.verify()? {
            return Err(PipelineError::Publish(format!(
                "{} changed after validation",
                source.path().display()
            )));
        }

        tokio::fs::create_dir_all(&self.output_dir).await?;
        if same_file(source.path(), &target).await {
            debug!(path = %target.display(), "Package already in place");
            return Ok(Artifact::capture(&target, StageKind::Rename)?);
        }

        if tokio::fs::try_exists(&target).await? {
            let existing = ContentDigest::from_file(&target)?;
            if &existing == source.digest() {
                debug!(path = %target.display(), "Identical package already published");
                return Ok(Artifact::capture(&target, StageKind::Rename)?);
            }
            return Err(PipelineError::Publish(format!(
                "{} already exists with different content ({} != {})",
                target.display(),
                existing.short(),
                source.digest().short()
            )));
        }

        let partial = target.with_extension("deb.partial");
        tokio::fs::copy(source.path(), &partial).await?;
        tokio::fs::rename(&partial, &target).await?;

        let renamed = Artifact::capture(&target, StageKind::Rename)?;
        if renamed.digest() != source.digest() {
            let _ = tokio::fs::remove_file(&target).await;
            return Err(PipelineError::Publish(format!(
                "copy of {} does not match its source",
                target.display()
            )));
        }

        info!(
            from = %source.path().display(),
            to = %target.display(),
            distro = %distro,
            "Package renamed"
        );
        Ok(renamed)
    }
}

async fn same_file(a: &Path, b: &Path) -> bool {
    match (tokio::fs::canonicalize(a).await, tokio::fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
