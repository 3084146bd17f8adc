//! Pinned dependency retrieval
//!
//! A dependency is fetched shallowly at one exact commit, never at a branch
//! tip. The checked out tree is hashed so repeated runs can prove they saw
//! identical content. Failures are not retried: with an exact pin, a failure
//! means the network or the environment is broken.

use crate::error::EnvError;
use crate::Result;
use relpipe_core::{
    run_checked, CommandOutput, CommandRunner, CommandSpec, ContentDigest, DependencyConfig,
    Environment,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Exact source reference of a dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyPin {
    pub name: String,
    pub url: String,
    /// Full commit id (SHA-1 or SHA-256).
    pub revision: String,
}

impl DependencyPin {
    pub fn new(name: &str, url: &str, revision: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            revision: revision.to_string(),
        }
    }

    /// Reject anything that is not a full commit id. Branches, tags and
    /// abbreviated ids can move or become ambiguous.
    pub fn validate(&self) -> Result<()> {
        let full_length = matches!(self.revision.len(), 40 | 64);
        if !full_length || !self.revision.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(EnvError::UnpinnedRevision {
                name: self.name.clone(),
                revision: self.revision.clone(),
            });
        }
        Ok(())
    }
}

/// Everything needed to fetch and build one dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySpec {
    pub pin: DependencyPin,

    /// Fixed checkout location.
    pub checkout_dir: PathBuf,

    /// Variable through which the main build finds the dependency.
    pub home_var: String,

    /// Build command run inside the checkout; empty means no build step.
    pub build_command: Vec<String>,

    pub timeout_secs: u64,
}

impl DependencySpec {
    pub fn from_config(
        config: &DependencyConfig,
        checkout_dir: PathBuf,
        timeout_secs: u64,
    ) -> Self {
        Self {
            pin: DependencyPin::new(&config.name, &config.url, &config.revision),
            checkout_dir,
            home_var: config.home_var.clone(),
            build_command: config.build_command.clone(),
            timeout_secs,
        }
    }
}

/// Output of a fetch, handed to the build stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyHome {
    pub name: String,

    /// Variable name, e.g. `CBANG_HOME`.
    pub var: String,

    /// Built checkout.
    pub path: PathBuf,

    pub revision: String,

    /// Digest of the checked out sources, excluding `.git`.
    pub content_digest: ContentDigest,
}

impl DependencyHome {
    /// `(variable, path)` for the build invocation's environment.
    pub fn env_pair(&self) -> (String, String) {
        (self.var.clone(), self.path.to_string_lossy().to_string())
    }
}

/// Fetches and builds pinned dependencies.
pub struct DependencyFetcher {
    runner: Arc<dyn CommandRunner>,
}

impl DependencyFetcher {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Check out `spec.pin` into `spec.checkout_dir`, hash it and build it.
    ///
    /// An existing checkout is reused, but is forced to the pinned revision
    /// and stripped of untracked files before hashing.
    pub async fn fetch(&self, env: &Environment, spec: &DependencySpec) -> Result<DependencyHome> {
        spec.pin.validate()?;
        let pin = &spec.pin;
        let dir = &spec.checkout_dir;
        info!(
            dependency = %pin.name,
            revision = %pin.revision,
            dir = %dir.display(),
            "Fetching pinned dependency"
        );

        if !dir.join(".git").exists() {
            if tokio::fs::try_exists(dir).await? {
                debug!(
                    dependency = %pin.name,
                    dir = %dir.display(),
                    "Removing stale non-git directory"
                );
                tokio::fs::remove_dir_all(dir).await?;
            }
            if let Some(parent) = dir.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let clone = CommandSpec::new("git")
                .args(["clone", "--depth", "1", "--no-checkout"])
                .arg(pin.url.clone())
                .arg(dir.to_string_lossy());
            self.exec(env, spec, clone).await?;
        } else {
            debug!(dependency = %pin.name, "Reusing existing checkout");
        }

        self.exec(
            env,
            spec,
            git_in(dir)
                .args(["fetch", "--depth", "1", "origin"])
                .arg(pin.revision.clone()),
        )
        .await?;
        self.exec(
            env,
            spec,
            git_in(dir)
                .args(["checkout", "--force", "--detach"])
                .arg(pin.revision.clone()),
        )
        .await?;
        self.exec(env, spec, git_in(dir).args(["clean", "-ffdx"]))
            .await?;

        let head = self
            .exec(env, spec, git_in(dir).args(["rev-parse", "HEAD"]))
            .await?;
        let head = head.stdout.trim();
        if !head.eq_ignore_ascii_case(&pin.revision) {
            return Err(EnvError::FetchFailed {
                dependency: pin.name.clone(),
                detail: format!("checked out '{}' but pinned '{}'", head, pin.revision),
            });
        }

        let content_digest = digest_tree(dir.clone())
            .await
            .map_err(|e| EnvError::FetchFailed {
                dependency: pin.name.clone(),
                detail: format!("cannot hash {}: {}", dir.display(), e),
            })?;
        info!(dependency = %pin.name, digest = %content_digest.short(), "Checkout verified");

        if let Some((program, args)) = spec.build_command.split_first() {
            let build = CommandSpec::new(program.clone())
                .args(args.iter().cloned())
                .current_dir(dir);
            self.exec(env, spec, build).await?;
        }

        Ok(DependencyHome {
            name: pin.name.clone(),
            var: spec.home_var.clone(),
            path: dir.clone(),
            revision: pin.revision.clone(),
            content_digest,
        })
    }

    async fn exec(
        &self,
        env: &Environment,
        spec: &DependencySpec,
        cmd: CommandSpec,
    ) -> Result<CommandOutput> {
        let cmd = env.command(cmd.timeout(spec.timeout_secs));
        run_checked(self.runner.as_ref(), &cmd, |detail| EnvError::FetchFailed {
            dependency: spec.pin.name.clone(),
            detail,
        })
        .await
    }
}

fn git_in(dir: &Path) -> CommandSpec {
    CommandSpec::new("git").arg("-C").arg(dir.to_string_lossy())
}

/// SHA-256 over a directory tree, ignoring `.git`.
///
/// Entries are visited in sorted order and hashed with their relative path,
/// so the digest depends only on names and contents.
pub fn hash_tree(root: &Path) -> std::io::Result<ContentDigest> {
    if !root.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} is not a directory", root.display()),
        ));
    }
    let mut hasher = Sha256::new();
    hash_tree_recursive(root, Path::new(""), &mut hasher)?;
    Ok(ContentDigest::from_hex(hex::encode(hasher.finalize())))
}

/// [`hash_tree`] on the blocking thread pool.
pub async fn digest_tree(root: PathBuf) -> std::io::Result<ContentDigest> {
    tokio::task::spawn_blocking(move || hash_tree(&root))
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

fn hash_tree_recursive(dir: &Path, relative: &Path, hasher: &mut Sha256) -> std::io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        let path = entry.path();
        let rel = relative.join(&name);
        let file_type = entry.file_type()?;

        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update(b"\0");

        if file_type.is_symlink() {
            hasher.update(b"L");
            hasher.update(std::fs::read_link(&path)?.to_string_lossy().as_bytes());
            hasher.update(b"\0");
        } else if file_type.is_dir() {
            hasher.update(b"D");
            hash_tree_recursive(&path, &rel, hasher)?;
        } else {
            hasher.update(b"F");
            hasher.update(std::fs::read(&path)?);
            hasher.update(b"\0");
        }
    }
    Ok(())
}
