//! Per-platform release pipeline.
//!
//! One instance runs Provision -> Fetch -> Build -> Package -> Validate ->
//! Rename for a single platform, stopping at the first failed stage. Each
//! instance works in its own directory under the work root and in its own
//! containers, so instances for different platforms can run side by side.

use crate::package::{derive_version, normalize_version, PackageMetadata, PackagingStage};
use crate::rename::{query_distro, RenameStage};
use crate::spec::RunIdentity;
use crate::stage::StageRecord;
use crate::tool::{BuildTool, Scons};
use crate::validate::{validation_env_name, ValidationStage};
use async_trait::async_trait;
use relpipe_core::{
    run_checked, Artifact, ArchLinkPolicy, BuildConfiguration, CommandRunner, CommandSpec,
    DependencyConfig, DistroIdentity, Environment, PipelineConfig, PipelineError, PlatformConfig,
    ProjectConfig, Result, StageKind,
};
use relpipe_env::{
    DependencyFetcher, DependencyHome, DependencyPin, DependencySpec, EnvironmentRole, Mount,
    ProvisionRequest, Provisioner,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Builds the tool for a source checkout.
pub type ToolFactory = Arc<dyn Fn(&Path) -> Arc<dyn BuildTool> + Send + Sync>;

/// One entry of the release matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformTarget {
    pub id: String,

    /// Base image; the settings' default image when unset.
    pub image: Option<String>,

    /// Target architecture, for the link policy.
    pub arch: String,
}

impl PlatformTarget {
    pub fn new(id: &str, image: Option<&str>, arch: &str) -> Self {
        Self {
            id: id.to_string(),
            image: image.map(str::to_string),
            arch: arch.to_string(),
        }
    }

    pub fn from_config(config: &PlatformConfig, default_arch: &str) -> Self {
        Self {
            id: config.id.clone(),
            image: Some(config.image.clone()),
            arch: config.arch.clone().unwrap_or_else(|| default_arch.to_string()),
        }
    }
}

/// Inputs shared by every pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub project: ProjectConfig,

    /// Unassembled build configuration.
    pub build: BuildConfiguration,

    pub arch_policy: ArchLinkPolicy,

    /// Build-options hint (e.g. `-j8`).
    pub build_options: Option<String>,

    pub dependency: Option<DependencyConfig>,

    /// Image for targets that do not name one.
    pub default_image: Option<String>,

    pub engine: String,

    pub build_packages: Vec<String>,

    pub validation_packages: Vec<String>,

    /// Per-instance workspaces are created below this directory.
    pub work_root: PathBuf,

    /// Renamed packages are written here.
    pub output_dir: PathBuf,

    pub timeout_secs: u64,
}

impl PipelineSettings {
    pub fn from_config(config: &PipelineConfig, work_root: impl Into<PathBuf>) -> Self {
        Self {
            project: config.project.clone(),
            build: config.build.configuration.clone(),
            arch_policy: config.build.arch_policy(),
            build_options: None,
            dependency: config.dependency.clone(),
            default_image: config.environment.image.clone(),
            engine: config.environment.engine.clone(),
            build_packages: config.environment.build_packages.clone(),
            validation_packages: config.environment.validation_packages.clone(),
            work_root: work_root.into(),
            output_dir: config.release.output_dir.clone(),
            timeout_secs: config.build.timeout_secs,
        }
    }

    pub fn with_build_options(mut self, hint: Option<String>) -> Self {
        self.build_options = hint;
        self
    }

    /// Smoke command: the installed binary's name plus the smoke arguments.
    pub fn smoke_command(&self) -> Vec<String> {
        let binary = Path::new(&self.project.binary)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.project.binary.clone());
        std::iter::once(binary)
            .chain(self.project.smoke_args.iter().cloned())
            .collect()
    }
}

/// Result of a successful pipeline instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub platform: String,

    pub identity: RunIdentity,

    pub version: String,

    pub distro: DistroIdentity,

    pub dependency: Option<DependencyHome>,

    pub package: PackageMetadata,

    /// Renamed package in the output directory.
    pub artifact: Artifact,

    pub stages: Vec<StageRecord>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,
}

impl PipelineReport {
    pub fn file_name(&self) -> Option<&str> {
        self.artifact.file_name()
    }

    /// Number of stages that passed.
    pub fn passed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.passed).count()
    }
}

/// Something that can produce a validated, renamed package for a platform.
#[async_trait]
pub trait PlatformPipeline: Send + Sync {
    async fn run(&self, target: &PlatformTarget) -> Result<PipelineReport>;
}

/// Run `work` as `stage`, logging and recording its outcome.
async fn record<T, F>(
    stages: &mut Vec<StageRecord>,
    platform: &str,
    stage: StageKind,
    work: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    info!(platform = %platform, stage = %stage, "Stage started");
    let start = Instant::now();
    let result = work.await;
    let record = StageRecord::from_result(stage, start.elapsed(), &result);
    match &result {
        Ok(_) => info!(
            platform = %platform,
            stage = %stage,
            duration_ms = record.duration_ms,
            "Stage passed"
        ),
        Err(e) => error!(
            platform = %platform,
            stage = %stage,
            kind = e.kind(),
            error = %e,
            "Stage failed"
        ),
    }
    stages.push(record);
    result
}

/// Everything produced inside the build environment.
struct Produced {
    version: String,
    distro: DistroIdentity,
    dependency: Option<DependencyHome>,
    package: PackageMetadata,
    artifact: Artifact,
}

/// Container-backed pipeline.
pub struct Pipeline {
    runner: Arc<dyn CommandRunner>,
    provisioner: Arc<Provisioner>,
    settings: Arc<PipelineSettings>,
    tool_factory: ToolFactory,
}

impl Pipeline {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: PipelineSettings) -> Self {
        let provisioner = Provisioner::new(runner.clone()).with_engine(&settings.engine);
        let tool_runner = runner.clone();
        let project = settings.project.clone();
        let timeout_secs = settings.timeout_secs;
        let tool_factory: ToolFactory = Arc::new(move |source_dir: &Path| {
            Arc::new(
                Scons::new(
                    tool_runner.clone(),
                    source_dir,
                    &project.binary,
                    project.package_name(),
                )
                .with_timeout(timeout_secs),
            ) as Arc<dyn BuildTool>
        });
        Self {
            runner,
            provisioner: Arc::new(provisioner),
            settings: Arc::new(settings),
            tool_factory,
        }
    }

    /// Use a different build tool.
    pub fn with_tool_factory(mut self, factory: ToolFactory) -> Self {
        self.tool_factory = factory;
        self
    }

    /// Workspace directory of `target`'s instance.
    pub fn workspace(&self, target: &PlatformTarget) -> PathBuf {
        self.settings.work_root.join(&target.id)
    }

    /// Checks that need no external process.
    fn preflight(&self, target: &PlatformTarget) -> Result<String> {
        let image = target
            .image
            .clone()
            .or_else(|| self.settings.default_image.clone())
            .filter(|image| !image.trim().is_empty())
            .ok_or_else(|| {
                PipelineError::Configuration(format!(
                    "platform '{}' has no base image; set IMAGE or environment.image",
                    target.id
                ))
            })?;
        if let Some(dep) = &self.settings.dependency {
            DependencyPin::new(&dep.name, &dep.url, &dep.revision).validate()?;
        }
        if self.settings.project.binary.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "project.binary must not be empty".to_string(),
            ));
        }
        Ok(image)
    }

    /// Fresh workspace with a clone of the project sources at `src`.
    async fn prepare_workspace(&self, workspace: &Path, src: &Path) -> Result<()> {
        if tokio::fs::try_exists(workspace).await? {
            tokio::fs::remove_dir_all(workspace).await?;
        }
        tokio::fs::create_dir_all(workspace).await?;

        let clone = CommandSpec::new("git")
            .args(["clone", "--quiet"])
            .arg(self.settings.project.source_dir.to_string_lossy())
            .arg(src.to_string_lossy())
            .timeout(self.settings.timeout_secs);
        run_checked(self.runner.as_ref(), &clone, |detail| PipelineError::Provision {
            environment: workspace.display().to_string(),
            detail: format!("cannot clone sources: {}", detail),
        })
        .await?;
        Ok(())
    }

    async fn run_in_environment(
        &self,
        env: &Environment,
        target: &PlatformTarget,
        image: &str,
        config: &BuildConfiguration,
        workspace: &Path,
        stages: &mut Vec<StageRecord>,
    ) -> Result<Produced> {
        let settings = &self.settings;
        let platform = target.id.as_str();
        let src = workspace.join("src");

        let dependency = match &settings.dependency {
            Some(dep) => {
                let spec = DependencySpec::from_config(
                    dep,
                    workspace.join("deps").join(&dep.name),
                    settings.timeout_secs,
                );
                let fetcher = DependencyFetcher::new(self.runner.clone());
                let home = record(stages, platform, StageKind::Fetch, async {
                    Ok::<_, PipelineError>(fetcher.fetch(env, &spec).await?)
                })
                .await?;
                Some(home)
            }
            None => None,
        };
        let deps: Vec<DependencyHome> = dependency.iter().cloned().collect();

        let tool = (self.tool_factory)(&src);
        let binary = record(
            stages,
            platform,
            StageKind::Build,
            tool.build(env, config, &deps),
        )
        .await?;

        let packaging =
            PackagingStage::new(self.runner.clone(), tool.clone(), workspace.join("stage"));
        let packaged = record(stages, platform, StageKind::Package, async {
            let version = match &settings.project.version {
                Some(version) => normalize_version(version),
                None => derive_version(self.runner.as_ref(), &Environment::host(), &src).await?,
            };
            packaging.run(env, config, &deps, &binary, &version).await
        })
        .await?;

        let validation = ValidationStage::new(
            self.provisioner.clone(),
            Some(image.to_string()),
            settings.smoke_command(),
        )
        .with_base_packages(settings.validation_packages.clone())
        .with_build_only_packages(settings.build_packages.iter().cloned())
        .with_timeout(settings.timeout_secs);
        let validated = record(
            stages,
            platform,
            StageKind::Validate,
            validation.validate(&validation_env_name(platform), packaged.artifact.clone()),
        )
        .await?;

        let rename = RenameStage::new(&settings.output_dir);
        let (artifact, distro) = record(stages, platform, StageKind::Rename, async {
            let distro = query_distro(self.runner.as_ref(), env).await?;
            let artifact = rename.rename(&validated, &distro).await?;
            Ok::<_, PipelineError>((artifact, distro))
        })
        .await?;

        Ok(Produced {
            version: packaged.metadata.version.clone(),
            distro,
            dependency,
            package: packaged.metadata,
            artifact,
        })
    }
}

#[async_trait]
impl PlatformPipeline for Pipeline {
    async fn run(&self, target: &PlatformTarget) -> Result<PipelineReport> {
        let start = Instant::now();
        let image = self.preflight(target)?;
        let settings = &self.settings;
        let config = settings.build.clone().assemble(
            settings.build_options.as_deref(),
            &target.arch,
            &settings.arch_policy,
        );
        let identity = RunIdentity::new(
            &target.id,
            &image,
            &config,
            settings.dependency.as_ref().map(|dep| dep.revision.as_str()),
        );
        info!(
            platform = %target.id,
            image = %image,
            arch = %target.arch,
            identity = %identity.short(),
            "Pipeline instance started"
        );

        let mut stages = Vec::new();
        let workspace = self.workspace(target);
        let env_name = format!(
            "relpipe-{}-build-{}",
            target.id,
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let env = record(&mut stages, &target.id, StageKind::Provision, async {
            self.prepare_workspace(&workspace, &workspace.join("src")).await?;
            let request = ProvisionRequest {
                name: env_name.clone(),
                image: Some(image.clone()),
                packages: settings.build_packages.clone(),
                role: EnvironmentRole::Build,
                mounts: vec![Mount::same_path(&workspace)],
            };
            Ok::<_, PipelineError>(self.provisioner.provision(&request).await?)
        })
        .await?;

        let produced = self
            .run_in_environment(&env, target, &image, &config, &workspace, &mut stages)
            .await;
        if let Err(e) = self.provisioner.teardown(&env).await {
            warn!(
                platform = %target.id,
                environment = %env.name,
                error = %e,
                "Failed to remove build environment"
            );
        }
        let produced = produced?;

        let report = PipelineReport {
            platform: target.id.clone(),
            identity,
            version: produced.version,
            distro: produced.distro,
            dependency: produced.dependency,
            package: produced.package,
            artifact: produced.artifact,
            stages,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            platform = %report.platform,
            file = report.file_name().unwrap_or_default(),
            duration_ms = report.duration_ms,
            "Pipeline instance passed"
        );
        Ok(report)
    }
}
