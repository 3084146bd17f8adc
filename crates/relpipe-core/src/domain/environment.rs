//! Execution environments.

use crate::command::CommandSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Whether an environment may contain build-time dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cleanliness {
    /// Only the declared base packages; no build tooling.
    Clean,
    /// Build tooling installed.
    Dirty,
}

/// Where commands for an environment actually execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecTarget {
    /// The machine relpipe runs on.
    Host,
    /// A running container.
    Container { engine: String, id: String },
}

/// A named set of installed packages plus the place commands run in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,

    /// Base image identifier.
    pub image: String,

    pub target: ExecTarget,

    /// Packages declared at provision time.
    pub packages: BTreeSet<String>,

    pub cleanliness: Cleanliness,
}

impl Environment {
    /// The local machine, for the standalone build entry points.
    pub fn host() -> Self {
        Self {
            name: "host".to_string(),
            image: "host".to_string(),
            target: ExecTarget::Host,
            packages: BTreeSet::new(),
            cleanliness: Cleanliness::Dirty,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.cleanliness == Cleanliness::Clean
    }

    pub fn container_id(&self) -> Option<&str> {
        match &self.target {
            ExecTarget::Host => None,
            ExecTarget::Container { id, .. } => Some(id),
        }
    }

    /// Rewrite `spec` so it executes inside this environment.
    ///
    /// Container commands become `<engine> exec`, carrying the working
    /// directory and extra variables along. Timeouts are kept.
    pub fn command(&self, spec: CommandSpec) -> CommandSpec {
        match &self.target {
            ExecTarget::Host => spec,
            ExecTarget::Container { engine, id } => {
                let mut wrapped = CommandSpec::new(engine.clone())
                    .arg("exec")
                    .timeout(spec.timeout_secs);
                if let Some(dir) = &spec.cwd {
                    wrapped = wrapped.arg("-w").arg(dir.to_string_lossy());
                }
                for (key, value) in &spec.env {
                    wrapped = wrapped.arg("-e").arg(format!("{}={}", key, value));
                }
                wrapped.arg(id.clone()).arg(spec.program).args(spec.args)
            }
        }
    }

    /// Command copying a host file into the environment, or `None` on the host.
    pub fn copy_in(&self, src: &Path, dest: &Path) -> Option<CommandSpec> {
        match &self.target {
            ExecTarget::Host => None,
            ExecTarget::Container { engine, id } => Some(
                CommandSpec::new(engine.clone())
                    .arg("cp")
                    .arg(src.to_string_lossy())
                    .arg(format!("{}:{}", id, dest.display())),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container() -> Environment {
        Environment {
            name: "build-ubuntu".to_string(),
            image: "ubuntu:20.04".to_string(),
            target: ExecTarget::Container {
                engine: "docker".to_string(),
                id: "c0ffee".to_string(),
            },
            packages: BTreeSet::new(),
            cleanliness: Cleanliness::Clean,
        }
    }

    #[test]
    fn test_host_command_is_unchanged() {
        let spec = CommandSpec::new("scons").arg("-j4");
        assert_eq!(Environment::host().command(spec.clone()), spec);
        assert!(!Environment::host().is_clean());
    }

    #[test]
    fn test_container_command_wraps_exec() {
        let spec = CommandSpec::new("scons")
            .arg("package")
            .env("CBANG_HOME", "/work/cbang")
            .current_dir("/work/src")
            .timeout(30);
        let wrapped = container().command(spec);
        assert_eq!(
            wrapped.to_string(),
            "docker exec -w /work/src -e CBANG_HOME=/work/cbang c0ffee scons package"
        );
        assert_eq!(wrapped.timeout_secs, 30);
        assert!(wrapped.cwd.is_none());
        assert!(wrapped.env.is_empty());
    }

    #[test]
    fn test_copy_in() {
        let cmd = container()
            .copy_in(Path::new("/out/app.deb"), Path::new("/tmp/app.deb"))
            .unwrap();
        assert_eq!(cmd.to_string(), "docker cp /out/app.deb c0ffee:/tmp/app.deb");
        assert!(Environment::host()
            .copy_in(Path::new("a"), Path::new("b"))
            .is_none());
    }
}
