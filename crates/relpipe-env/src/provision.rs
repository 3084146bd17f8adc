//! Environment provisioning from a base image
//!
//! Every environment is a fresh container started from the configured image.
//! Nothing is ever derived from another environment's container, so a
//! validation environment cannot inherit the build environment's install
//! history.

use crate::error::EnvError;
use crate::Result;
use relpipe_core::{
    run_checked, Cleanliness, CommandOutput, CommandRunner, CommandSpec, Environment, ExecTarget,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default timeout for environment commands (package installs can be slow).
const DEFAULT_TIMEOUT_SECS: u64 = 1800;

/// What an environment is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentRole {
    /// Holds build tooling.
    Build,
    /// Clean base used to install and smoke-test a package.
    Validation,
}

impl EnvironmentRole {
    pub fn cleanliness(&self) -> Cleanliness {
        match self {
            EnvironmentRole::Build => Cleanliness::Dirty,
            EnvironmentRole::Validation => Cleanliness::Clean,
        }
    }
}

/// Bind mount from the host into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub host: PathBuf,
    pub container: PathBuf,
}

impl Mount {
    /// Mount a host directory at the same path inside the container, so
    /// artifact paths are valid on both sides.
    pub fn same_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            host: path.clone(),
            container: path,
        }
    }
}

/// Parameters for a new environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    /// Unique environment (container) name.
    pub name: String,

    /// Base image. Required; there is no default.
    pub image: Option<String>,

    /// Packages installed after the container starts.
    pub packages: Vec<String>,

    pub role: EnvironmentRole,

    pub mounts: Vec<Mount>,
}

/// Creates, inspects and removes container environments.
pub struct Provisioner {
    runner: Arc<dyn CommandRunner>,
    engine: String,
    timeout_secs: u64,
}

impl Provisioner {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            engine: "docker".to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Use a different container engine executable (e.g. `podman`).
    pub fn with_engine(mut self, engine: &str) -> Self {
        self.engine = engine.to_string();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    /// Start a container from the requested image and install its packages.
    ///
    /// Fails with [`EnvError::MissingImage`] before any command is issued
    /// when the image is unset or blank.
    pub async fn provision(&self, request: &ProvisionRequest) -> Result<Environment> {
        let image = request
            .image
            .as_deref()
            .map(str::trim)
            .filter(|image| !image.is_empty())
            .ok_or_else(|| EnvError::MissingImage(request.name.clone()))?;

        info!(
            environment = %request.name,
            image = %image,
            role = ?request.role,
            packages = request.packages.len(),
            "Provisioning environment"
        );

        let mut start = CommandSpec::new(self.engine.clone())
            .args(["run", "-d", "--name"])
            .arg(request.name.clone());
        for mount in &request.mounts {
            start = start.arg("-v").arg(format!(
                "{}:{}",
                mount.host.display(),
                mount.container.display()
            ));
        }
        let start = start
            .arg(image)
            .args(["sleep", "infinity"])
            .timeout(self.timeout_secs);

        let output = self.exec(&request.name, &start).await?;
        let id = match output.stdout.trim() {
            "" => request.name.clone(),
            id => id.to_string(),
        };
        debug!(environment = %request.name, container = %id, "Container started");

        let environment = Environment {
            name: request.name.clone(),
            image: image.to_string(),
            target: ExecTarget::Container {
                engine: self.engine.clone(),
                id,
            },
            packages: request.packages.iter().cloned().collect(),
            cleanliness: request.role.cleanliness(),
        };

        if let Err(e) = self.install_packages(&environment, &request.packages).await {
            if let Err(cleanup) = self.teardown(&environment).await {
                warn!(
                    environment = %environment.name,
                    error = %cleanup,
                    "Teardown after failed install also failed"
                );
            }
            return Err(e);
        }

        Ok(environment)
    }

    /// Install packages non-interactively. No-op for an empty list.
    pub async fn install_packages(&self, env: &Environment, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        info!(environment = %env.name, packages = ?packages, "Installing packages");
        let update = env.command(apt_get(&["update"]).timeout(self.timeout_secs));
        self.exec(&env.name, &update).await?;
        let install = env.command(apt_install(packages).timeout(self.timeout_secs));
        self.exec(&env.name, &install).await?;
        Ok(())
    }

    /// Names of all packages currently installed in the environment.
    pub async fn installed_packages(&self, env: &Environment) -> Result<BTreeSet<String>> {
        let query = env.command(
            CommandSpec::new("dpkg-query")
                .args(["-W", "-f", "${db:Status-Abbrev} ${Package}\\n"])
                .timeout(self.timeout_secs),
        );
        let output = self.exec(&env.name, &query).await?;
        Ok(parse_installed(&output.stdout))
    }

    /// Remove the environment's container. The host environment is left alone.
    pub async fn teardown(&self, env: &Environment) -> Result<()> {
        let Some(id) = env.container_id() else {
            return Ok(());
        };
        debug!(environment = %env.name, "Removing container");
        let remove = CommandSpec::new(self.engine.clone())
            .args(["rm", "-f"])
            .arg(id)
            .timeout(self.timeout_secs);
        self.exec(&env.name, &remove).await?;
        Ok(())
    }

    async fn exec(&self, environment: &str, cmd: &CommandSpec) -> Result<CommandOutput> {
        run_checked(self.runner.as_ref(), cmd, |detail| EnvError::ProvisionFailed {
            environment: environment.to_string(),
            detail,
        })
        .await
    }
}

/// `apt-get` with the non-interactive frontend.
pub fn apt_get(args: &[&str]) -> CommandSpec {
    CommandSpec::new("apt-get")
        .args(args.iter().copied())
        .env("DEBIAN_FRONTEND", "noninteractive")
}

/// Install packages (or local `.deb` paths) without recommends.
pub fn apt_install<S: AsRef<str>>(packages: &[S]) -> CommandSpec {
    apt_get(&["install", "-y", "--no-install-recommends"])
        .args(packages.iter().map(|p| p.as_ref().to_string()))
}

/// Parse `dpkg-query -W -f '${db:Status-Abbrev} ${Package}\n'` output,
/// keeping fully installed (`ii`) packages only.
pub fn parse_installed(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("ii"), Some(name)) => Some(name.to_string()),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relpipe_core::fakes::RecordingRunner;

    fn request(image: Option<&str>, packages: &[&str]) -> ProvisionRequest {
        ProvisionRequest {
            name: "relpipe-build-test".to_string(),
            image: image.map(str::to_string),
            packages: packages.iter().map(|p| p.to_string()).collect(),
            role: EnvironmentRole::Build,
            mounts: vec![Mount::same_path("/work")],
        }
    }

    #[tokio::test]
    async fn test_missing_image_spawns_nothing() {
        let runner = Arc::new(RecordingRunner::new());
        let provisioner = Provisioner::new(runner.clone());

        let err = provisioner
            .provision(&request(None, &["scons"]))
            .await
            .unwrap_err();

        assert!(matches!(err, EnvError::MissingImage(_)));
        assert_eq!(runner.call_count(), 0, "no process may be spawned");
    }

    #[tokio::test]
    async fn test_blank_image_spawns_nothing() {
        let runner = Arc::new(RecordingRunner::new());
        let provisioner = Provisioner::new(runner.clone());

        let err = provisioner
            .provision(&request(Some("   "), &[]))
            .await
            .unwrap_err();

        assert!(matches!(err, EnvError::MissingImage(_)));
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_provision_starts_container_and_installs() {
        let runner = Arc::new(RecordingRunner::new());
        runner.on("docker run", 0, "4f2a9c\n");
        let provisioner = Provisioner::new(runner.clone());

        let env = provisioner
            .provision(&request(Some("ubuntu:20.04"), &["scons", "build-essential"]))
            .await
            .expect("provision");

        assert_eq!(env.container_id(), Some("4f2a9c"));
        assert_eq!(env.image, "ubuntu:20.04");
        assert!(!env.is_clean());
        assert!(env.packages.contains("scons"));

        let lines = runner.command_lines();
        assert_eq!(
            lines[0],
            "docker run -d --name relpipe-build-test -v /work:/work ubuntu:20.04 sleep infinity"
        );
        assert!(lines[1].contains("apt-get update"));
        assert!(lines[2].contains(
            "apt-get install -y --no-install-recommends scons build-essential"
        ));
        assert!(lines[2].contains("DEBIAN_FRONTEND=noninteractive"));
    }

    #[tokio::test]
    async fn test_validation_role_is_clean_and_skips_empty_install() {
        let runner = Arc::new(RecordingRunner::new());
        let provisioner = Provisioner::new(runner.clone()).with_engine("podman");

        let mut req = request(Some("debian:12"), &[]);
        req.role = EnvironmentRole::Validation;
        req.mounts.clear();
        let env = provisioner.provision(&req).await.unwrap();

        assert!(env.is_clean());
        assert_eq!(runner.call_count(), 1);
        assert!(runner.command_lines()[0].starts_with("podman run"));
        // Without stdout the container is addressed by name.
        assert_eq!(env.container_id(), Some("relpipe-build-test"));
    }

    #[tokio::test]
    async fn test_failed_install_tears_down() {
        let runner = Arc::new(RecordingRunner::new());
        runner.on("docker run", 0, "abc");
        runner.fail_on("apt-get install", "E: Unable to locate package nope");
        let provisioner = Provisioner::new(runner.clone());

        let err = provisioner
            .provision(&request(Some("ubuntu:22.04"), &["nope"]))
            .await
            .unwrap_err();

        assert!(matches!(err, EnvError::ProvisionFailed { .. }));
        assert!(err.to_string().contains("Unable to locate package"));
        assert!(runner.ran("docker rm -f abc"));
    }

    #[tokio::test]
    async fn test_installed_packages() {
        let runner = Arc::new(RecordingRunner::new());
        runner.on(
            "dpkg-query",
            0,
            "ii  libc6\nrc  oldpkg\nii  camotics\niU  halfway\n",
        );
        let provisioner = Provisioner::new(runner.clone());
        let env = Environment::host();

        let installed = provisioner.installed_packages(&env).await.unwrap();
        assert_eq!(
            installed.into_iter().collect::<Vec<_>>(),
            vec!["camotics".to_string(), "libc6".to_string()]
        );
    }

    #[tokio::test]
    async fn test_teardown_host_is_noop() {
        let runner = Arc::new(RecordingRunner::new());
        Provisioner::new(runner.clone())
            .teardown(&Environment::host())
            .await
            .unwrap();
        assert_eq!(runner.call_count(), 0);
    }
}
