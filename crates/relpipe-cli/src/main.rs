//! relpipe - release packaging pipeline CLI
//!
//! The `relpipe` command builds, packages, validates and releases a native
//! project described by `relpipe.toml`.
//!
//! ## Commands
//!
//! - `build`, `install`, `package`, `clean`: drive the build tool on the host
//! - `fetch`: check out and build the pinned dependency
//! - `validate`, `rename`: check a package in a clean container and name it
//!   for its distribution
//! - `pipeline`: run every stage for one platform
//! - `release`: run all platforms and publish one release for a tag

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use relpipe_ci::{
    derive_version, normalize_version, query_distro, validation_env_name, BuildTool, CiCoordinator,
    CoordinatorOutcome, DirectoryPublisher, GitHubPublisher, PackagingStage, Pipeline,
    PipelineSettings, PlatformPipeline, PlatformTarget, ReleasePublisher, RenameStage, Scons,
    ValidationStage,
};
use relpipe_core::{
    Artifact, BuildConfiguration, BuildMode, CommandRunner, DistroIdentity, Environment,
    PipelineConfig, PipelineError, ProcessRunner, StageKind, TriggerEvent,
};
use relpipe_env::{
    digest_tree, DependencyFetcher, DependencyHome, DependencySpec, Provisioner,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "relpipe")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build, validate and release native packages", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and JSON results
    #[arg(long, global = true)]
    json: bool,

    /// Pipeline configuration file
    #[arg(short, long, global = true, default_value = "relpipe.toml")]
    config: PathBuf,

    /// Build-options hint, e.g. `-j8`
    #[arg(long, global = true, env = "BUILD_OPTIONS")]
    build_options: Option<String>,

    /// Target architecture (defaults to the architecture relpipe was built for)
    #[arg(long, global = true, env = "HOST_ARCH")]
    arch: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every build tool invocation.
#[derive(Args, Debug, Clone, Default)]
struct BuildArgs {
    /// Parallel jobs
    #[arg(short, long)]
    jobs: Option<u32>,

    /// Build mode (debug or release)
    #[arg(long)]
    mode: Option<BuildMode>,

    /// Link against shared libraries
    #[arg(long)]
    shared: bool,

    /// Treat warnings as errors
    #[arg(long)]
    strict: bool,

    /// Compiler family
    #[arg(long)]
    compiler: Option<String>,
}

impl BuildArgs {
    /// Apply command-line overrides to the file configuration.
    fn apply(&self, mut config: BuildConfiguration) -> BuildConfiguration {
        if self.jobs.is_some() {
            config.jobs = self.jobs;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        config.shared |= self.shared;
        config.strict |= self.strict;
        if self.compiler.is_some() {
            config.compiler = self.compiler.clone();
        }
        config
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project binary
    Build {
        #[command(flatten)]
        build: BuildArgs,
    },

    /// Remove build outputs and the build tool's cached state
    Clean {
        #[command(flatten)]
        build: BuildArgs,
    },

    /// Install the build into a staging prefix
    Install {
        /// Staging prefix (system prefixes are refused)
        prefix: PathBuf,

        #[command(flatten)]
        build: BuildArgs,
    },

    /// Package the built binary
    Package {
        #[command(flatten)]
        build: BuildArgs,
    },

    /// Check out and build the pinned dependency
    Fetch,

    /// Install and smoke-test a package in a clean container
    Validate {
        /// Package file
        package: PathBuf,

        /// Base image of the validation container
        #[arg(long, env = "IMAGE")]
        image: Option<String>,
    },

    /// Validate a package, then copy it under its distribution-specific name
    Rename {
        /// Package file
        package: PathBuf,

        /// Output directory (default: release.output_dir)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Base image of the validation container
        #[arg(long, env = "IMAGE")]
        image: Option<String>,

        /// Distribution as `id:version` (default: read from /etc/os-release)
        #[arg(long, value_parser = parse_distro)]
        distro: Option<DistroIdentity>,
    },

    /// Run the whole pipeline for one platform
    Pipeline {
        /// Platform id; a configured release platform or an ad-hoc one
        #[arg(short, long)]
        platform: String,

        /// Base image (overrides the platform's and environment.image)
        #[arg(long, env = "IMAGE")]
        image: Option<String>,

        /// Directory for per-platform workspaces
        #[arg(long, default_value = ".relpipe/work")]
        work_dir: PathBuf,

        #[command(flatten)]
        build: BuildArgs,
    },

    /// Run every release platform and publish one release
    Release {
        /// Triggering ref, e.g. `refs/tags/v1.2.0`
        #[arg(long = "ref")]
        git_ref: String,

        /// Tag message, used as the release notes
        #[arg(short, long, default_value = "")]
        message: String,

        /// Directory for per-platform workspaces
        #[arg(long, default_value = ".relpipe/work")]
        work_dir: PathBuf,

        /// Publish into this directory instead of GitHub
        #[arg(long)]
        release_dir: Option<PathBuf>,

        /// GitHub token for release.github
        #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
        github_token: Option<String>,

        #[command(flatten)]
        build: BuildArgs,
    },
}

fn parse_distro(value: &str) -> std::result::Result<DistroIdentity, String> {
    match value.split_once(':') {
        Some((id, version)) if !id.is_empty() && !version.is_empty() => {
            Ok(DistroIdentity::new(id, version))
        }
        _ => Err(format!("expected `id:version`, got '{}'", value)),
    }
}

/// Absolute form of `path`, relative paths resolved against the working directory.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()
        .context("Failed to read the working directory")?
        .join(path))
}

/// State shared by all commands.
struct Workspace {
    config: PipelineConfig,
    runner: Arc<dyn CommandRunner>,
    build_options: Option<String>,
    arch: String,
    json: bool,
}

impl Workspace {
    fn load(cli: &Cli) -> Result<Self> {
        let mut config = PipelineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?;

        // Paths in the file are relative to the file itself.
        let base = cli.config.parent().unwrap_or_else(|| Path::new(""));
        let source_dir = base.join(&config.project.source_dir);
        config.project.source_dir = std::fs::canonicalize(&source_dir).with_context(|| {
            format!("Source directory {} does not exist", source_dir.display())
        })?;
        if let Some(dep) = config.dependency.as_mut() {
            if let Some(dir) = dep.checkout_dir.take() {
                dep.checkout_dir = Some(absolute(&base.join(dir))?);
            }
        }
        config.release.output_dir = absolute(&base.join(&config.release.output_dir))?;

        Ok(Self {
            config,
            runner: Arc::new(ProcessRunner::new()),
            build_options: cli.build_options.clone(),
            arch: cli
                .arch
                .clone()
                .unwrap_or_else(|| std::env::consts::ARCH.to_string()),
            json: cli.json,
        })
    }

    fn source_dir(&self) -> &Path {
        &self.config.project.source_dir
    }

    fn tool(&self) -> Arc<dyn BuildTool> {
        let project = &self.config.project;
        Arc::new(
            Scons::new(
                self.runner.clone(),
                self.source_dir(),
                &project.binary,
                project.package_name(),
            )
            .with_timeout(self.config.build.timeout_secs),
        )
    }

    fn build_configuration(&self, args: &BuildArgs) -> BuildConfiguration {
        args.apply(self.config.build.configuration.clone()).assemble(
            self.build_options.as_deref(),
            &self.arch,
            &self.config.build.arch_policy(),
        )
    }

    /// The dependency for host builds: the home variable when set, the
    /// configured checkout otherwise.
    async fn dependency_homes(&self) -> Result<Vec<DependencyHome>> {
        let Some(dep) = &self.config.dependency else {
            return Ok(Vec::new());
        };
        let path = match std::env::var_os(&dep.home_var) {
            Some(path) => PathBuf::from(path),
            None => self
                .config
                .dependency_dir()
                .context("Dependency checkout directory is not configured")?,
        };
        if !path.is_dir() {
            bail!(
                "{} not found at {}; run `relpipe fetch` or set {}",
                dep.name,
                path.display(),
                dep.home_var
            );
        }
        let content_digest = digest_tree(path.clone())
            .await
            .with_context(|| format!("Failed to hash {}", path.display()))?;
        Ok(vec![DependencyHome {
            name: dep.name.clone(),
            var: dep.home_var.clone(),
            path,
            revision: dep.revision.clone(),
            content_digest,
        }])
    }

    fn settings(
        &self,
        work_dir: &Path,
        image: Option<String>,
        args: &BuildArgs,
    ) -> Result<PipelineSettings> {
        let mut settings = PipelineSettings::from_config(&self.config, absolute(work_dir)?)
            .with_build_options(self.build_options.clone());
        settings.build = args.apply(settings.build);
        if image.is_some() {
            settings.default_image = image;
        }
        Ok(settings)
    }

    fn validation_stage(&self, image: Option<String>) -> ValidationStage {
        let timeout = self.config.build.timeout_secs;
        let provisioner = Provisioner::new(self.runner.clone())
            .with_engine(&self.config.environment.engine)
            .with_timeout(timeout);
        let smoke = PipelineSettings::from_config(&self.config, self.source_dir()).smoke_command();
        ValidationStage::new(
            Arc::new(provisioner),
            image.or_else(|| self.config.environment.image.clone()),
            smoke,
        )
        .with_base_packages(self.config.environment.validation_packages.clone())
        .with_build_only_packages(self.config.environment.build_packages.iter().cloned())
        .with_timeout(timeout)
    }

    /// Print `value` as JSON when requested, otherwise run `human`.
    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce(&T)) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human(value);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    relpipe_core::init_tracing(cli.json, level);

    let ctx = Workspace::load(&cli)?;
    let result = match &cli.command {
        Commands::Build { build } => cmd_build(&ctx, build).await,
        Commands::Clean { build } => cmd_clean(&ctx, build).await,
        Commands::Install { prefix, build } => cmd_install(&ctx, prefix, build).await,
        Commands::Package { build } => cmd_package(&ctx, build).await,
        Commands::Fetch => cmd_fetch(&ctx).await,
        Commands::Validate { package, image } => cmd_validate(&ctx, package, image.clone()).await,
        Commands::Rename {
            package,
            output,
            image,
            distro,
        } => {
            cmd_rename(
                &ctx,
                package,
                output.as_deref(),
                image.clone(),
                distro.clone(),
            )
            .await
        }
        Commands::Pipeline {
            platform,
            image,
            work_dir,
            build,
        } => cmd_pipeline(&ctx, platform, image.clone(), work_dir, build).await,
        Commands::Release {
            git_ref,
            message,
            work_dir,
            release_dir,
            github_token,
            build,
        } => {
            cmd_release(
                &ctx,
                git_ref,
                message,
                work_dir,
                release_dir.as_deref(),
                github_token.as_deref(),
                build,
            )
            .await
        }
    };

    if let Err(e) = &result {
        if let Some(log) = e
            .downcast_ref::<PipelineError>()
            .and_then(PipelineError::install_log)
        {
            eprintln!("--- install log ---\n{}", log);
        }
    }
    result
}

async fn cmd_build(ctx: &Workspace, args: &BuildArgs) -> Result<()> {
    let config = ctx.build_configuration(args);
    let deps = ctx.dependency_homes().await?;
    let binary = ctx
        .tool()
        .build(&Environment::host(), &config, &deps)
        .await
        .context("Build failed")?;
    ctx.emit(&binary, |binary| {
        println!("✓ Built {}", binary.path().display());
        println!("  sha256: {}", binary.digest());
    })
}

async fn cmd_clean(ctx: &Workspace, args: &BuildArgs) -> Result<()> {
    let config = ctx.build_configuration(args);
    ctx.tool()
        .clean(&Environment::host(), &config)
        .await
        .context("Clean failed")?;
    println!("✓ Cleaned {}", ctx.source_dir().display());
    Ok(())
}

async fn cmd_install(ctx: &Workspace, prefix: &Path, args: &BuildArgs) -> Result<()> {
    let prefix = absolute(prefix)?;
    let config = ctx.build_configuration(args);
    let deps = ctx.dependency_homes().await?;
    ctx.tool()
        .install(&Environment::host(), &config, &deps, &prefix)
        .await
        .context("Install failed")?;
    println!("✓ Installed into {}", prefix.display());
    Ok(())
}

async fn cmd_package(ctx: &Workspace, args: &BuildArgs) -> Result<()> {
    let host = Environment::host();
    let config = ctx.build_configuration(args);
    let deps = ctx.dependency_homes().await?;
    let binary_path = ctx.source_dir().join(&ctx.config.project.binary);
    let binary = Artifact::capture(&binary_path, StageKind::Build).with_context(|| {
        format!(
            "No binary at {}; run `relpipe build` first",
            binary_path.display()
        )
    })?;

    let version = match &ctx.config.project.version {
        Some(version) => normalize_version(version),
        None => derive_version(ctx.runner.as_ref(), &host, ctx.source_dir())
            .await
            .context("Failed to derive the version")?,
    };
    info!(version = %version, "Packaging");

    let staging = ctx.source_dir().join("build").join("stage");
    let packaged = PackagingStage::new(ctx.runner.clone(), ctx.tool(), staging)
        .run(&host, &config, &deps, &binary, &version)
        .await
        .context("Packaging failed")?;
    ctx.emit(&packaged, |packaged| {
        println!("✓ Packaged {}", packaged.artifact.path().display());
        println!("  package: {}", packaged.metadata.package);
        println!("  version: {}", packaged.metadata.version);
        println!("  depends: {}", packaged.metadata.depends);
    })
}

async fn cmd_fetch(ctx: &Workspace) -> Result<()> {
    let Some(dep) = &ctx.config.dependency else {
        bail!("No [dependency] is configured");
    };
    let dir = ctx
        .config
        .dependency_dir()
        .context("Dependency checkout directory is not configured")?;
    let spec = DependencySpec::from_config(dep, dir, ctx.config.build.timeout_secs);
    let home = DependencyFetcher::new(ctx.runner.clone())
        .fetch(&Environment::host(), &spec)
        .await
        .with_context(|| format!("Failed to fetch {}", dep.name))?;
    ctx.emit(&home, |home| {
        println!("✓ Fetched {} at {}", home.name, home.revision);
        println!("  {}={}", home.var, home.path.display());
        println!("  digest: {}", home.content_digest);
    })
}

fn capture_package(path: &Path) -> Result<Artifact> {
    let path = absolute(path)?;
    Artifact::capture(&path, StageKind::Package)
        .with_context(|| format!("Cannot read package {}", path.display()))
}

async fn cmd_validate(ctx: &Workspace, package: &Path, image: Option<String>) -> Result<()> {
    let artifact = capture_package(package)?;
    let validated = ctx
        .validation_stage(image)
        .validate(&validation_env_name("local"), artifact)
        .await
        .context("Validation failed")?;
    ctx.emit(validated.report(), |report| {
        println!(
            "✓ {} {} validated on {}",
            report.metadata.package, report.metadata.version, report.image
        );
        let added: Vec<String> = report.added_packages().into_iter().collect();
        println!("  added packages: {}", added.join(", "));
        println!("  smoke output: {}", report.smoke_output.trim());
    })
}

async fn cmd_rename(
    ctx: &Workspace,
    package: &Path,
    output: Option<&Path>,
    image: Option<String>,
    distro: Option<DistroIdentity>,
) -> Result<()> {
    let artifact = capture_package(package)?;
    let validated = ctx
        .validation_stage(image)
        .validate(&validation_env_name("local"), artifact)
        .await
        .context("Validation failed")?;

    let distro = match distro {
        Some(distro) => distro,
        None => query_distro(ctx.runner.as_ref(), &Environment::host())
            .await
            .context("Failed to identify the distribution; pass --distro")?,
    };
    let output = match output {
        Some(dir) => absolute(dir)?,
        None => ctx.config.release.output_dir.clone(),
    };
    let renamed = RenameStage::new(output)
        .rename(&validated, &distro)
        .await
        .context("Rename failed")?;
    ctx.emit(&renamed, |renamed| {
        println!("✓ {}", renamed.path().display());
    })
}

fn print_report(report: &relpipe_ci::PipelineReport) {
    println!("Platform: {}", report.platform);
    println!("Identity: {}", report.identity.short());
    println!("Version: {}", report.version);
    println!("Distribution: {}", report.distro);
    if let Some(dep) = &report.dependency {
        println!("Dependency: {} {} ({})", dep.name, dep.revision, dep.content_digest.short());
    }
    for stage in &report.stages {
        let status = if stage.passed { "✓" } else { "✗" };
        println!("  {} {} ({}ms)", status, stage.stage, stage.duration_ms);
    }
    println!("Package: {}", report.artifact.path().display());
    println!(
        "Summary: {}/{} stages passed in {}ms",
        report.passed_count(),
        report.stages.len(),
        report.duration_ms
    );
}

async fn cmd_pipeline(
    ctx: &Workspace,
    platform: &str,
    image: Option<String>,
    work_dir: &Path,
    args: &BuildArgs,
) -> Result<()> {
    let target = match ctx
        .config
        .release
        .platforms
        .iter()
        .find(|p| p.id == platform)
    {
        Some(config) => {
            let mut target = PlatformTarget::from_config(config, &ctx.arch);
            if image.is_some() {
                target.image = image.clone();
            }
            target
        }
        None => PlatformTarget::new(platform, image.as_deref(), &ctx.arch),
    };
    let settings = ctx.settings(work_dir, image, args)?;
    let report = Pipeline::new(ctx.runner.clone(), settings)
        .run(&target)
        .await
        .with_context(|| format!("Pipeline for {} failed", platform))?;
    ctx.emit(&report, print_report)
}

async fn cmd_release(
    ctx: &Workspace,
    git_ref: &str,
    message: &str,
    work_dir: &Path,
    release_dir: Option<&Path>,
    github_token: Option<&str>,
    args: &BuildArgs,
) -> Result<()> {
    let release = &ctx.config.release;
    let targets: Vec<PlatformTarget> = release
        .platforms
        .iter()
        .map(|p| PlatformTarget::from_config(p, &ctx.arch))
        .collect();

    let publisher: Arc<dyn ReleasePublisher> = match (release_dir, &release.github, github_token) {
        (Some(dir), _, _) => Arc::new(DirectoryPublisher::new(absolute(dir)?)),
        (None, Some(github), Some(token)) => Arc::new(
            GitHubPublisher::new(github.clone(), token).context("Failed to set up GitHub")?,
        ),
        (None, Some(_), None) => bail!("release.github is configured but GITHUB_TOKEN is not set"),
        (None, None, _) => Arc::new(DirectoryPublisher::new(release.output_dir.join("releases"))),
    };

    let pipeline: Arc<dyn PlatformPipeline> = Arc::new(Pipeline::new(
        ctx.runner.clone(),
        ctx.settings(work_dir, None, args)?,
    ));
    let coordinator = CiCoordinator::new(pipeline, publisher, targets, &release.tag_pattern)?;

    let outcome = coordinator
        .handle(&TriggerEvent::new(git_ref, message))
        .await
        .context("Release failed")?;
    match outcome {
        CoordinatorOutcome::Skipped { reason } => {
            println!("Skipped: {}", reason);
            Ok(())
        }
        CoordinatorOutcome::Released {
            release,
            reports,
            publish,
        } => ctx.emit(&release, |release| {
            for report in &reports {
                print_report(report);
                println!();
            }
            println!(
                "✓ Released {} at {} ({}ms)",
                release.tag, release.location, publish.duration_ms
            );
            for asset in &release.assets {
                println!("  {} {} ({})", asset.platform, asset.file_name, asset.sha256);
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relpipe_core::fakes::RecordingRunner;

    /// A project without a dependency, driven by `runner`.
    fn scripted_workspace(dir: &Path, runner: Arc<RecordingRunner>) -> Workspace {
        std::fs::create_dir_all(dir.join("camotics")).unwrap();
        let config = dir.join("relpipe.toml");
        std::fs::write(
            &config,
            r#"
[project]
name = "camotics"
binary = "camotics"
source_dir = "camotics"
version = "1.2.0"
"#,
        )
        .unwrap();
        let cli = Cli::try_parse_from(["relpipe", "--config", config.to_str().unwrap(), "build"])
            .unwrap();
        let mut ctx = Workspace::load(&cli).unwrap();
        ctx.runner = runner;
        ctx
    }

    #[test]
    fn test_build_args_override_file_values() {
        let file = BuildConfiguration {
            jobs: Some(2),
            compiler: Some("gnu".to_string()),
            ..BuildConfiguration::default()
        };
        let args = BuildArgs {
            jobs: Some(8),
            mode: Some(BuildMode::Debug),
            strict: true,
            ..BuildArgs::default()
        };

        let config = args.apply(file);
        assert_eq!(config.jobs, Some(8));
        assert_eq!(config.mode, BuildMode::Debug);
        assert!(config.strict);
        assert!(!config.shared);
        assert_eq!(config.compiler.as_deref(), Some("gnu"));
    }

    #[test]
    fn test_parse_distro() {
        let distro = parse_distro("ubuntu:20.04").unwrap();
        assert_eq!(distro.slug(), "ubuntu-20.04");
        assert!(parse_distro("ubuntu").is_err());
        assert!(parse_distro(":20.04").is_err());
    }

    #[test]
    fn test_cli_parses_build_flags() {
        let cli = Cli::try_parse_from([
            "relpipe", "build", "--jobs", "4", "--mode", "debug", "--shared",
        ])
        .unwrap();
        let Commands::Build { build } = cli.command else {
            panic!("expected build");
        };
        assert_eq!(build.jobs, Some(4));
        assert_eq!(build.mode, Some(BuildMode::Debug));
        assert!(build.shared);
    }

    #[test]
    fn test_cli_rejects_unknown_mode() {
        assert!(Cli::try_parse_from(["relpipe", "build", "--mode", "fast"]).is_err());
    }

    #[test]
    fn test_cli_parses_release() {
        let cli = Cli::try_parse_from([
            "relpipe",
            "release",
            "--ref",
            "refs/tags/v1.2.0",
            "--message",
            "CAMotics 1.2.0",
            "--release-dir",
            "/tmp/releases",
        ])
        .unwrap();
        let Commands::Release {
            git_ref,
            message,
            release_dir,
            ..
        } = cli.command
        else {
            panic!("expected release");
        };
        assert_eq!(git_ref, "refs/tags/v1.2.0");
        assert_eq!(message, "CAMotics 1.2.0");
        assert_eq!(release_dir, Some(PathBuf::from("/tmp/releases")));
    }

    #[test]
    fn test_workspace_resolves_paths_against_config_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("camotics")).unwrap();
        let config = dir.path().join("relpipe.toml");
        std::fs::write(
            &config,
            r#"
[project]
name = "camotics"
binary = "camotics"
source_dir = "camotics"

[dependency]
name = "cbang"
url = "https://github.com/CauldronDevelopmentLLC/cbang"
revision = "3c5b1c0ad3b9a4f0e4c9a8f7f2b3c4d5e6f70812"
"#,
        )
        .unwrap();
        let cli = Cli::try_parse_from([
            "relpipe",
            "--config",
            config.to_str().unwrap(),
            "--arch",
            "armv7l",
            "fetch",
        ])
        .unwrap();

        let ctx = Workspace::load(&cli).unwrap();
        let source = std::fs::canonicalize(dir.path().join("camotics")).unwrap();
        assert_eq!(ctx.source_dir(), source);
        assert_eq!(ctx.config.dependency_dir(), Some(source.join("deps/cbang")));
        assert_eq!(ctx.config.release.output_dir, dir.path().join("dist"));
        assert!(ctx
            .build_configuration(&BuildArgs::default())
            .link_flags
            .contains(&"-latomic".to_string()));
    }

    #[tokio::test]
    async fn test_build_runs_scons_in_source_dir_and_captures_binary() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let ctx = scripted_workspace(dir.path(), runner.clone());
        let binary = ctx.source_dir().join("camotics");
        let produced = binary.clone();
        runner.on_effect("scons -j3", move |_| {
            std::fs::write(&produced, b"ELF").unwrap();
        });

        let args = BuildArgs {
            jobs: Some(3),
            mode: Some(BuildMode::Debug),
            ..BuildArgs::default()
        };
        cmd_build(&ctx, &args).await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].to_string().contains("mode=debug"));
        assert_eq!(calls[0].cwd.as_deref(), Some(ctx.source_dir()));
        assert!(binary.is_file());
    }

    #[tokio::test]
    async fn test_build_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let ctx = scripted_workspace(dir.path(), runner.clone());
        runner.fail_on("scons", "scons: *** [camotics] Error 1");

        let err = cmd_build(&ctx, &BuildArgs::default()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Build failed"));
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Build(_))
        ));
    }

    #[tokio::test]
    async fn test_clean_removes_scons_state() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let ctx = scripted_workspace(dir.path(), runner.clone());
        let src = ctx.source_dir().to_path_buf();
        std::fs::write(src.join(".sconsign.dblite"), b"state").unwrap();
        std::fs::create_dir(src.join(".sconf_temp")).unwrap();
        std::fs::write(src.join("camotics_1.2.0_amd64.deb"), b"deb").unwrap();
        std::fs::write(src.join("SConstruct"), b"# build").unwrap();

        cmd_clean(&ctx, &BuildArgs::default()).await.unwrap();

        assert!(runner.ran("scons -c"));
        assert!(!src.join(".sconsign.dblite").exists());
        assert!(!src.join(".sconf_temp").exists());
        assert!(!src.join("camotics_1.2.0_amd64.deb").exists());
        assert!(src.join("SConstruct").exists());
    }

    #[tokio::test]
    async fn test_package_requires_a_built_binary() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let ctx = scripted_workspace(dir.path(), runner.clone());

        let err = cmd_package(&ctx, &BuildArgs::default()).await.unwrap_err();
        assert!(err.to_string().contains("run `relpipe build` first"));
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_install_refuses_system_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let ctx = scripted_workspace(dir.path(), runner.clone());

        let err = cmd_install(&ctx, Path::new("/usr"), &BuildArgs::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Configuration(_))
        ));
        assert_eq!(runner.call_count(), 0);
    }
}
