//! Validation stage: install the package into a clean environment.
//!
//! A fresh environment is provisioned from the base image for every package.
//! It never shares a container with the build, so a dependency that only the
//! build environment had cannot hide a missing declaration.
//!
//! ```text
//! NotStarted -> EnvironmentCreated -> PackageCopiedIn -> InstallAttempted -> Passed
//!                                                                         \-> Failed
//! ```
//!
//! Any check that does not hold moves the run to `Failed`, and the failure is
//! reported as [`PipelineError::Validation`] with the install log attached.

use crate::package::PackageMetadata;
use relpipe_core::{Artifact, CommandOutput, CommandSpec, Environment, PipelineError, Result};
use relpipe_env::{apt_get, apt_install, EnvironmentRole, ProvisionRequest, Provisioner};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where packages are copied inside the validation environment.
const PACKAGE_DROP_DIR: &str = "/tmp";

/// Validation progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    NotStarted,
    EnvironmentCreated,
    PackageCopiedIn,
    InstallAttempted,
    Passed,
    Failed,
}

impl ValidationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ValidationState::Passed | ValidationState::Failed)
    }
}

/// Evidence gathered by a passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Validation environment name.
    pub environment: String,

    pub image: String,

    /// States visited, in order.
    pub transitions: Vec<ValidationState>,

    pub metadata: PackageMetadata,

    /// Packages installed before the package was added.
    pub baseline: BTreeSet<String>,

    /// Packages installed after the package was added.
    pub installed: BTreeSet<String>,

    /// Output of the package installation.
    pub install_log: String,

    /// Output of the smoke invocation.
    pub smoke_output: String,
}

impl ValidationReport {
    /// Packages pulled in by installing the package (including itself).
    pub fn added_packages(&self) -> BTreeSet<String> {
        self.installed.difference(&self.baseline).cloned().collect()
    }
}

/// A package that installed and ran in a clean environment.
///
/// Only [`ValidationStage::validate`] creates these, so anything holding one
/// has passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedPackage {
    artifact: Artifact,
    report: ValidationReport,
}

impl ValidatedPackage {
    pub fn artifact(&self) -> &Artifact {
        &self.artifact
    }

    pub fn metadata(&self) -> &PackageMetadata {
        &self.report.metadata
    }

    pub fn report(&self) -> &ValidationReport {
        &self.report
    }
}

#[cfg(test)]
impl ValidatedPackage {
    /// Skip validation; for tests of later stages.
    pub(crate) fn assume_valid(artifact: Artifact, metadata: PackageMetadata) -> Self {
        Self {
            artifact,
            report: ValidationReport {
                environment: "test".to_string(),
                image: "test".to_string(),
                transitions: vec![ValidationState::NotStarted, ValidationState::Passed],
                metadata,
                baseline: BTreeSet::new(),
                installed: BTreeSet::new(),
                install_log: String::new(),
                smoke_output: String::new(),
            },
        }
    }
}

/// State tracker for one validation attempt.
struct ValidationRun {
    environment: String,
    state: ValidationState,
    transitions: Vec<ValidationState>,
    log: String,
}

impl ValidationRun {
    fn new(environment: &str) -> Self {
        Self {
            environment: environment.to_string(),
            state: ValidationState::NotStarted,
            transitions: vec![ValidationState::NotStarted],
            log: String::new(),
        }
    }

    fn advance(&mut self, next: ValidationState) {
        debug_assert!(!self.state.is_terminal(), "validation already finished");
        debug!(
            environment = %self.environment,
            from = ?self.state,
            to = ?next,
            "Validation transition"
        );
        self.state = next;
        self.transitions.push(next);
    }

    fn append_log(&mut self, label: &str, output: &CommandOutput) {
        self.log.push_str(&format!("$ {} (exit {})\n", label, output.exit_code));
        self.log.push_str(&output.combined());
        if !self.log.ends_with('\n') {
            self.log.push('\n');
        }
    }

    /// Move to `Failed` and build the error carrying the log so far.
    fn fail(&mut self, reason: String) -> PipelineError {
        self.advance(ValidationState::Failed);
        warn!(environment = %self.environment, reason = %reason, "Validation failed");
        PipelineError::Validation {
            reason,
            install_log: self.log.clone(),
        }
    }
}

/// Installs packages into freshly provisioned clean environments.
pub struct ValidationStage {
    provisioner: Arc<Provisioner>,
    image: Option<String>,
    base_packages: Vec<String>,
    build_only: BTreeSet<String>,
    smoke_command: Vec<String>,
    timeout_secs: u64,
}

impl ValidationStage {
    /// `smoke_command` is the program followed by its arguments, e.g.
    /// `["camotics", "--version"]`.
    pub fn new(
        provisioner: Arc<Provisioner>,
        image: Option<String>,
        smoke_command: Vec<String>,
    ) -> Self {
        Self {
            provisioner,
            image,
            base_packages: Vec::new(),
            build_only: BTreeSet::new(),
            smoke_command,
            timeout_secs: 1800,
        }
    }

    /// Packages the validation environment starts with.
    pub fn with_base_packages(mut self, packages: Vec<String>) -> Self {
        self.base_packages = packages;
        self
    }

    /// Packages that must never appear in the validation environment.
    pub fn with_build_only_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.build_only = packages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Validate `package` in a new environment called `env_name`.
    ///
    /// The environment is removed afterwards whatever the outcome.
    pub async fn validate(&self, env_name: &str, package: Artifact) -> Result<ValidatedPackage> {
        if self.smoke_command.is_empty() {
            return Err(PipelineError::Configuration(
                "validation needs a smoke command".to_string(),
            ));
        }
        let base: BTreeSet<&String> = self.base_packages.iter().collect();
        if let Some(conflict) = self.build_only.iter().find(|p| base.contains(p)) {
            return Err(PipelineError::Configuration(format!(
                "build-only package '{}' is also a validation base package",
                conflict
            )));
        }

        let mut run = ValidationRun::new(env_name);
        let request = ProvisionRequest {
            name: env_name.to_string(),
            image: self.image.clone(),
            packages: self.base_packages.clone(),
            role: EnvironmentRole::Validation,
            mounts: Vec::new(),
        };
        let env = self.provisioner.provision(&request).await?;

        let result = if env.is_clean() {
            run.advance(ValidationState::EnvironmentCreated);
            self.check(&env, &package, &mut run).await
        } else {
            Err(run.fail(format!("environment '{}' is not clean", env.name)))
        };

        if let Err(e) = self.provisioner.teardown(&env).await {
            warn!(environment = %env.name, error = %e, "Failed to remove validation environment");
        }

        let (metadata, baseline, installed, smoke_output) = result?;
        run.advance(ValidationState::Passed);
        info!(
            environment = %env_name,
            package = %metadata.package,
            version = %metadata.version,
            "Package validated"
        );

        Ok(ValidatedPackage {
            artifact: package,
            report: ValidationReport {
                environment: env.name.clone(),
                image: env.image.clone(),
                transitions: run.transitions,
                metadata,
                baseline,
                installed,
                install_log: run.log,
                smoke_output,
            },
        })
    }

    async fn check(
        &self,
        env: &Environment,
        package: &Artifact,
        run: &mut ValidationRun,
    ) -> Result<(PackageMetadata, BTreeSet<String>, BTreeSet<String>, String)> {
        let baseline = self.provisioner.installed_packages(env).await?;
        let present: Vec<&String> = self.build_only.intersection(&baseline).collect();
        if !present.is_empty() {
            return Err(run.fail(format!(
                "base image already contains build-only packages: {:?}",
                present
            )));
        }

        let file_name = package.file_name().ok_or_else(|| {
            PipelineError::Configuration(format!("{} has no file name", package.path().display()))
        })?;
        let dest = Path::new(PACKAGE_DROP_DIR).join(file_name);
        let copy = env.copy_in(package.path(), &dest).ok_or_else(|| {
            PipelineError::Configuration("validation requires a container environment".to_string())
        })?;
        let output = self.exec(&copy).await?;
        if !output.success() {
            return Err(run.fail(format!("cannot copy package in: {}", output.diagnostics())));
        }
        run.advance(ValidationState::PackageCopiedIn);

        let output = self.exec(&env.command(PackageMetadata::query(&dest))).await?;
        let metadata = match PackageMetadata::parse(&output.stdout) {
            Some(metadata) if output.success() => metadata,
            _ => {
                return Err(run.fail(format!(
                    "cannot read control fields: {}",
                    output.diagnostics()
                )))
            }
        };

        let update = self
            .exec_logged(run, "apt-get update", &env.command(apt_get(&["update"])))
            .await?;
        if !update.success() {
            return Err(run.fail("apt-get update failed".to_string()));
        }

        let install = env.command(apt_install(&[dest.to_string_lossy()]));
        run.advance(ValidationState::InstallAttempted);
        let output = self
            .exec_logged(run, &format!("apt-get install {}", dest.display()), &install)
            .await?;
        if !output.success() {
            return Err(run.fail(format!(
                "installing {} failed (exit {})",
                file_name, output.exit_code
            )));
        }

        let status = CommandSpec::new("dpkg").arg("-s").arg(metadata.package.clone());
        let output = self.exec(&env.command(status)).await?;
        if !output.success() {
            return Err(run.fail(format!(
                "{} is not installed after installation; the package manager removed it",
                metadata.package
            )));
        }

        let installed = self.provisioner.installed_packages(env).await?;
        if !installed.contains(&metadata.package) {
            return Err(run.fail(format!(
                "{} is missing from the installed package list",
                metadata.package
            )));
        }

        let missing: Vec<String> = metadata
            .dependency_groups()
            .into_iter()
            .filter(|group| !group.iter().any(|name| installed.contains(name)))
            .map(|group| group.join(" | "))
            .collect();
        if !missing.is_empty() {
            return Err(run.fail(format!(
                "declared dependencies not installed: {}",
                missing.join(", ")
            )));
        }

        let leaked: Vec<&String> = self.build_only.intersection(&installed).collect();
        if !leaked.is_empty() {
            return Err(run.fail(format!(
                "build-only packages were pulled in: {:?}",
                leaked
            )));
        }

        let (program, args) = self
            .smoke_command
            .split_first()
            .ok_or_else(|| PipelineError::Configuration("empty smoke command".to_string()))?;
        let smoke = CommandSpec::new(program.clone()).args(args.iter().cloned());
        let label = smoke.to_string();
        let output = self.exec_logged(run, &label, &env.command(smoke)).await?;
        if !output.success() {
            return Err(run.fail(format!(
                "smoke invocation `{}` failed (exit {})",
                label, output.exit_code
            )));
        }

        Ok((metadata, baseline, installed, output.combined()))
    }

    async fn exec(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let cmd = cmd.clone().timeout(self.timeout_secs);
        Ok(self.provisioner.runner().run(&cmd).await?)
    }

    /// Run a step whose output belongs in the install log. A step that
    /// times out or cannot start fails the validation.
    async fn exec_logged(
        &self,
        run: &mut ValidationRun,
        label: &str,
        cmd: &CommandSpec,
    ) -> Result<CommandOutput> {
        match self.exec(cmd).await {
            Ok(output) => {
                run.append_log(label, &output);
                Ok(output)
            }
            Err(PipelineError::Command(e)) => {
                run.log.push_str(&format!("$ {} ({})\n", label, e));
                Err(run.fail(format!("`{}` did not complete: {}", label, e)))
            }
            Err(e) => Err(e),
        }
    }
}

/// Default name for a validation environment of `platform`.
pub fn validation_env_name(platform: &str) -> String {
    format!(
        "relpipe-{}-validate-{}",
        platform,
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}
