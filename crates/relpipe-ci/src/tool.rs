//! Build tool abstraction and the SCons implementation.
//!
//! A [`BuildTool`] is told everything it needs through its arguments: the
//! environment to run in, the assembled configuration, and the homes of any
//! pinned dependencies. Nothing is read from or written to the process-global
//! environment.

use async_trait::async_trait;
use relpipe_core::{
    run_checked, Artifact, BuildConfiguration, CommandRunner, CommandSpec, Environment,
    PipelineError, Result, StageKind,
};
use relpipe_env::DependencyHome;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Default timeout for build tool invocations.
const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// Install prefixes that would touch the real system.
const SYSTEM_PREFIXES: &[&str] = &["/", "/usr", "/usr/local"];

/// A build system that can compile, install, package and clean a project.
#[async_trait]
pub trait BuildTool: Send + Sync {
    /// Tool name, for logs.
    fn name(&self) -> &str;

    /// Compile the project and return the produced binary.
    async fn build(
        &self,
        env: &Environment,
        config: &BuildConfiguration,
        deps: &[DependencyHome],
    ) -> Result<Artifact>;

    /// Install the build outputs below `prefix`.
    async fn install(
        &self,
        env: &Environment,
        config: &BuildConfiguration,
        deps: &[DependencyHome],
        prefix: &Path,
    ) -> Result<()>;

    /// Produce a distributable package for `binary` at `version`.
    async fn package(
        &self,
        env: &Environment,
        config: &BuildConfiguration,
        deps: &[DependencyHome],
        binary: &Artifact,
        version: &str,
    ) -> Result<Artifact>;

    /// Remove build outputs and the tool's cached state.
    async fn clean(&self, env: &Environment, config: &BuildConfiguration) -> Result<()>;
}

/// Whether `prefix` is safe to install into.
///
/// Relative paths and the system prefixes are rejected.
pub fn is_isolated_prefix(prefix: &Path) -> bool {
    if !prefix.is_absolute() {
        return false;
    }
    let normalized = prefix.to_string_lossy();
    let normalized = match normalized.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    !SYSTEM_PREFIXES.contains(&normalized)
}

/// SCons driven through `scons key=value ...` from the source directory.
pub struct Scons {
    runner: Arc<dyn CommandRunner>,
    source_dir: PathBuf,
    binary: String,
    package_name: String,
    timeout_secs: u64,
}

impl Scons {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        source_dir: impl Into<PathBuf>,
        binary: &str,
        package_name: &str,
    ) -> Self {
        Self {
            runner,
            source_dir: source_dir.into(),
            binary: binary.to_string(),
            package_name: package_name.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    /// Files and directories SCons leaves behind between runs.
    pub fn state_paths(&self) -> Vec<PathBuf> {
        [".sconsign.dblite", ".sconf_temp", "config.log", "build"]
            .iter()
            .map(|name| self.source_dir.join(name))
            .collect()
    }

    /// Assemble an invocation: targets first, then `-j`, then the options.
    pub fn command(
        &self,
        targets: &[&str],
        config: &BuildConfiguration,
        deps: &[DependencyHome],
        extra: &[(&str, String)],
    ) -> CommandSpec {
        let mut cmd = CommandSpec::new("scons").args(targets.iter().copied());
        if let Some(jobs) = config.jobs {
            cmd = cmd.arg(format!("-j{}", jobs));
        }
        for (name, value) in config.options() {
            cmd = cmd.arg(format!("{}={}", name, value));
        }
        for (name, value) in extra {
            cmd = cmd.arg(format!("{}={}", name, value));
        }
        for dep in deps {
            let (var, path) = dep.env_pair();
            cmd = cmd.env(var, path);
        }
        cmd.current_dir(&self.source_dir).timeout(self.timeout_secs)
    }

    async fn exec<F>(&self, env: &Environment, cmd: CommandSpec, on_failure: F) -> Result<()>
    where
        F: FnOnce(String) -> PipelineError,
    {
        let cmd = env.command(cmd);
        debug!(tool = "scons", command = %cmd, "Invoking build tool");
        run_checked(self.runner.as_ref(), &cmd, on_failure).await?;
        Ok(())
    }

    /// Packages for this project left in the source directory.
    fn produced_packages(&self, version: Option<&str>) -> io::Result<Vec<PathBuf>> {
        let prefix = match version {
            Some(version) => format!("{}_{}_", self.package_name, version),
            None => format!("{}_", self.package_name),
        };
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.source_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(&prefix) && name.ends_with(".deb") && path.is_file() {
                found.push(path);
            }
        }
        found.sort();
        Ok(found)
    }
}

#[async_trait]
impl BuildTool for Scons {
    fn name(&self) -> &str {
        "scons"
    }

    async fn build(
        &self,
        env: &Environment,
        config: &BuildConfiguration,
        deps: &[DependencyHome],
    ) -> Result<Artifact> {
        info!(environment = %env.name, jobs = ?config.jobs, mode = %config.mode, "Building");
        self.exec(env, self.command(&[], config, deps, &[]), PipelineError::Build)
            .await?;

        let binary = self.source_dir.join(&self.binary);
        Artifact::capture(&binary, StageKind::Build).map_err(|e| {
            PipelineError::Build(format!(
                "build succeeded but {} was not produced: {}",
                binary.display(),
                e
            ))
        })
    }

    async fn install(
        &self,
        env: &Environment,
        config: &BuildConfiguration,
        deps: &[DependencyHome],
        prefix: &Path,
    ) -> Result<()> {
        if !is_isolated_prefix(prefix) {
            return Err(PipelineError::Configuration(format!(
                "refusing to install into '{}'; use a staging directory",
                prefix.display()
            )));
        }
        info!(
            environment = %env.name,
            prefix = %prefix.display(),
            "Installing into staging prefix"
        );
        let prefix_opt = [("prefix", prefix.to_string_lossy().to_string())];
        self.exec(
            env,
            self.command(&["install"], config, deps, &prefix_opt),
            PipelineError::Packaging,
        )
        .await
    }

    async fn package(
        &self,
        env: &Environment,
        config: &BuildConfiguration,
        deps: &[DependencyHome],
        binary: &Artifact,
        version: &str,
    ) -> Result<Artifact> {
        if !binary.verify()? {
            return Err(PipelineError::Packaging(format!(
                "{} changed after the build stage",
                binary.path().display()
            )));
        }

        info!(environment = %env.name, version = %version, "Packaging");
        let version_opt = [("version", version.to_string())];
        self.exec(
            env,
            self.command(&["package"], config, deps, &version_opt),
            PipelineError::Packaging,
        )
        .await?;

        let mut found = self.produced_packages(Some(version))?;
        match found.len() {
            0 => Err(PipelineError::Packaging(format!(
                "no {}_{}_*.deb found in {}",
                self.package_name,
                version,
                self.source_dir.display()
            ))),
            1 => Ok(Artifact::capture(found.remove(0), StageKind::Package)?),
            _ => Err(PipelineError::Packaging(format!(
                "ambiguous package output: {}",
                found
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    async fn clean(&self, env: &Environment, config: &BuildConfiguration) -> Result<()> {
        info!(environment = %env.name, dir = %self.source_dir.display(), "Cleaning");
        self.exec(env, self.command(&["-c"], config, &[], &[]), PipelineError::Build)
            .await?;

        let mut stale = self.state_paths();
        stale.extend(self.produced_packages(None)?);
        for path in stale {
            let removed = match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&path).await,
                Ok(_) => tokio::fs::remove_file(&path).await,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => Err(e),
            };
            removed?;
            debug!(path = %path.display(), "Removed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relpipe_core::fakes::RecordingRunner;
    use relpipe_core::{ArchLinkPolicy, ContentDigest};
    use tempfile::tempdir;

    fn scons(runner: Arc<RecordingRunner>, dir: &Path) -> Scons {
        Scons::new(runner, dir, "camotics", "camotics")
    }

    fn cbang(dir: &Path) -> DependencyHome {
        DependencyHome {
            name: "cbang".to_string(),
            var: "CBANG_HOME".to_string(),
            path: dir.join("deps/cbang"),
            revision: "a".repeat(40),
            content_digest: ContentDigest::from_bytes(b"cbang"),
        }
    }

    #[test]
    fn test_isolated_prefix() {
        assert!(is_isolated_prefix(Path::new("/work/stage")));
        assert!(!is_isolated_prefix(Path::new("/")));
        assert!(!is_isolated_prefix(Path::new("/usr")));
        assert!(!is_isolated_prefix(Path::new("/usr/")));
        assert!(!is_isolated_prefix(Path::new("/usr/local")));
        assert!(!is_isolated_prefix(Path::new("stage")));
    }

    #[test]
    fn test_command_carries_options_and_dependency_home() {
        let dir = tempdir().unwrap();
        let tool = scons(Arc::new(RecordingRunner::new()), dir.path());
        let config = BuildConfiguration {
            jobs: Some(8),
            ..BuildConfiguration::default()
        }
        .assemble(None, "armv7l", &ArchLinkPolicy::default());

        let cmd = tool.command(&[], &config, &[cbang(dir.path())], &[]);
        assert_eq!(
            cmd.to_string(),
            "scons -j8 linkflags=-latomic mode=release shared=0 strict=0"
        );
        assert_eq!(
            cmd.env.get("CBANG_HOME").map(String::as_str),
            Some(dir.path().join("deps/cbang").to_str().unwrap())
        );
        assert_eq!(cmd.cwd.as_deref(), Some(dir.path()));
    }

    #[test]
    fn test_command_without_jobs_leaves_tool_default() {
        let dir = tempdir().unwrap();
        let tool = scons(Arc::new(RecordingRunner::new()), dir.path());
        let cmd = tool.command(&["package"], &BuildConfiguration::default(), &[], &[]);
        assert!(!cmd.args.iter().any(|a| a.starts_with("-j")));
        assert_eq!(cmd.args[0], "package");
    }

    #[tokio::test]
    async fn test_build_captures_binary() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let binary = dir.path().join("camotics");
        let produced = binary.clone();
        runner.on_effect("scons", move |_| std::fs::write(&produced, b"ELF").unwrap());

        let artifact = scons(runner.clone(), dir.path())
            .build(&Environment::host(), &BuildConfiguration::default(), &[])
            .await
            .unwrap();
        assert_eq!(artifact.path(), binary);
        assert_eq!(artifact.produced_by(), StageKind::Build);
    }

    #[tokio::test]
    async fn test_build_without_binary_fails() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let err = scons(runner, dir.path())
            .build(&Environment::host(), &BuildConfiguration::default(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Build(_)));
        assert!(err.to_string().contains("was not produced"));
    }

    #[tokio::test]
    async fn test_build_failure_keeps_diagnostics() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_on("scons", "src/main.cpp:12: error: 'QWidget' was not declared");
        let err = scons(runner, dir.path())
            .build(&Environment::host(), &BuildConfiguration::default(), &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'QWidget' was not declared"));
    }

    #[tokio::test]
    async fn test_install_rejects_system_prefix() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let err = scons(runner.clone(), dir.path())
            .install(
                &Environment::host(),
                &BuildConfiguration::default(),
                &[],
                Path::new("/usr"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_package_locates_versioned_deb() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("camotics"), b"ELF").unwrap();
        std::fs::write(dir.path().join("camotics_1.1.0_amd64.deb"), b"old").unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let deb = dir.path().join("camotics_1.2.0_amd64.deb");
        let produced = deb.clone();
        runner.on_effect("scons package", move |_| {
            std::fs::write(&produced, b"!<arch>").unwrap()
        });

        let tool = scons(runner.clone(), dir.path());
        let binary = Artifact::capture(dir.path().join("camotics"), StageKind::Build).unwrap();
        let package = tool
            .package(
                &Environment::host(),
                &BuildConfiguration::default(),
                &[],
                &binary,
                "1.2.0",
            )
            .await
            .unwrap();

        assert_eq!(package.path(), deb);
        assert_eq!(package.produced_by(), StageKind::Package);
        assert!(runner.ran("version=1.2.0"));
    }

    #[tokio::test]
    async fn test_package_refuses_modified_binary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("camotics");
        std::fs::write(&path, b"ELF").unwrap();
        let binary = Artifact::capture(&path, StageKind::Build).unwrap();
        std::fs::write(&path, b"tampered").unwrap();

        let runner = Arc::new(RecordingRunner::new());
        let err = scons(runner.clone(), dir.path())
            .package(
                &Environment::host(),
                &BuildConfiguration::default(),
                &[],
                &binary,
                "1.2.0",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Packaging(_)));
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_clean_removes_tool_state_and_packages() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join(".sconsign.dblite"), b"db").unwrap();
        std::fs::create_dir_all(root.join(".sconf_temp/conftest")).unwrap();
        std::fs::create_dir_all(root.join("build/release")).unwrap();
        std::fs::write(root.join("camotics_1.2.0_amd64.deb"), b"deb").unwrap();
        std::fs::write(root.join("SConstruct"), b"# keep").unwrap();

        let runner = Arc::new(RecordingRunner::new());
        scons(runner.clone(), root)
            .clean(&Environment::host(), &BuildConfiguration::default())
            .await
            .unwrap();

        assert!(runner.ran("scons -c"));
        assert!(!root.join(".sconsign.dblite").exists());
        assert!(!root.join(".sconf_temp").exists());
        assert!(!root.join("build").exists());
        assert!(!root.join("camotics_1.2.0_amd64.deb").exists());
        assert!(root.join("SConstruct").exists());
    }
}
