//! Build configuration and the `relpipe.toml` file format.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Compilation mode passed to the build tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    Debug,
    #[default]
    Release,
}

impl BuildMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildMode::Debug => "debug",
            BuildMode::Release => "release",
        }
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(BuildMode::Debug),
            "release" => Ok(BuildMode::Release),
            other => Err(PipelineError::Configuration(format!(
                "unknown build mode '{}' (expected debug or release)",
                other
            ))),
        }
    }
}

/// Option set supplied uniformly to build, install and package invocations.
///
/// Assemble it once with [`BuildConfiguration::assemble`] and share it by
/// reference afterwards; stages never modify it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfiguration {
    /// Parallel jobs; `None` leaves the choice to the build tool.
    pub jobs: Option<u32>,

    pub mode: BuildMode,

    /// Link against shared libraries.
    pub shared: bool,

    /// Treat compiler warnings as errors.
    pub strict: bool,

    /// Compiler family (`gnu`, `clang`, ...); tool default when unset.
    pub compiler: Option<String>,

    /// Extra linker flags, including those added by the architecture policy.
    pub link_flags: Vec<String>,
}

impl Default for BuildConfiguration {
    fn default() -> Self {
        Self {
            jobs: None,
            mode: BuildMode::Release,
            shared: false,
            strict: false,
            compiler: None,
            link_flags: Vec::new(),
        }
    }
}

impl BuildConfiguration {
    /// Fold in the build-options hint and the architecture link policy.
    ///
    /// An explicit `jobs` value wins over the hint.
    pub fn assemble(mut self, hint: Option<&str>, arch: &str, policy: &ArchLinkPolicy) -> Self {
        if self.jobs.is_none() {
            self.jobs = hint.and_then(parse_parallelism);
        }
        for flag in policy.flags_for(arch) {
            if !self.link_flags.contains(flag) {
                self.link_flags.push(flag.clone());
            }
        }
        self
    }

    /// Tool options as `name -> value`, in a stable order.
    pub fn options(&self) -> BTreeMap<&'static str, String> {
        let mut options = BTreeMap::new();
        options.insert("mode", self.mode.to_string());
        options.insert("shared", flag(self.shared));
        options.insert("strict", flag(self.strict));
        if let Some(compiler) = &self.compiler {
            options.insert("compiler", compiler.clone());
        }
        if !self.link_flags.is_empty() {
            options.insert("linkflags", self.link_flags.join(" "));
        }
        options
    }
}

fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

/// Extract a parallelism degree from a build-options hint.
///
/// Accepts `-jN`, `-j N`, `--jobs=N` and `--jobs N`. Zero and unparsable
/// values are ignored.
pub fn parse_parallelism(hint: &str) -> Option<u32> {
    let mut tokens = hint.split_whitespace();
    while let Some(token) = tokens.next() {
        let value = if token == "-j" || token == "--jobs" {
            tokens.next()
        } else if let Some(rest) = token.strip_prefix("--jobs=") {
            Some(rest)
        } else if let Some(rest) = token.strip_prefix("-j") {
            Some(rest)
        } else {
            None
        };

        if let Some(jobs) = value.and_then(|v| v.parse::<u32>().ok()) {
            if jobs > 0 {
                return Some(jobs);
            }
        }
    }
    None
}

/// Architecture -> extra link flags.
///
/// The toolchain does not link libatomic on its own for these targets, so
/// the flag is added during configuration assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchLinkPolicy {
    rules: BTreeMap<String, Vec<String>>,
}

impl Default for ArchLinkPolicy {
    fn default() -> Self {
        let atomic = vec!["-latomic".to_string()];
        let rules = [
            "arm", "armv5tel", "armv6l", "armv7l", "mips", "mipsel", "powerpc", "riscv32",
            "riscv64",
        ]
        .into_iter()
        .map(|arch| (arch.to_string(), atomic.clone()))
        .collect();
        Self { rules }
    }
}

impl ArchLinkPolicy {
    /// A policy with no rules.
    pub fn empty() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    pub fn with_rule(mut self, arch: &str, flags: Vec<String>) -> Self {
        self.rules.insert(arch.to_string(), flags);
        self
    }

    pub fn flags_for(&self, arch: &str) -> &[String] {
        self.rules.get(arch).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ---------------------------------------------------------------------------
// relpipe.toml
// ---------------------------------------------------------------------------

/// Top-level `relpipe.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub project: ProjectConfig,

    #[serde(default)]
    pub build: BuildSection,

    pub dependency: Option<DependencyConfig>,

    #[serde(default)]
    pub environment: EnvironmentConfig,

    #[serde(default)]
    pub release: ReleaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name, also the default package name.
    pub name: String,

    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,

    /// Binary produced by the build, relative to `source_dir`.
    pub binary: String,

    /// Arguments for the smoke invocation of the installed binary.
    #[serde(default = "default_smoke_args")]
    pub smoke_args: Vec<String>,

    /// Package name when it differs from the project name.
    pub package_name: Option<String>,

    /// Fixed version; derived from `git describe` when unset.
    pub version: Option<String>,
}

impl ProjectConfig {
    pub fn package_name(&self) -> &str {
        self.package_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSection {
    #[serde(flatten)]
    pub configuration: BuildConfiguration,

    /// Per-command timeout in seconds (0 = none).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Overrides for the architecture link policy.
    #[serde(default)]
    pub arch_link_flags: BTreeMap<String, Vec<String>>,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            configuration: BuildConfiguration::default(),
            timeout_secs: default_timeout_secs(),
            arch_link_flags: BTreeMap::new(),
        }
    }
}

impl BuildSection {
    /// Default policy with file overrides applied.
    pub fn arch_policy(&self) -> ArchLinkPolicy {
        self.arch_link_flags
            .iter()
            .fold(ArchLinkPolicy::default(), |policy, (arch, flags)| {
                policy.with_rule(arch, flags.clone())
            })
    }
}

/// Pinned external library built before the project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyConfig {
    pub name: String,
    pub url: String,

    /// Full commit id.
    pub revision: String,

    /// Checkout location; `deps/<name>` under the source dir when unset.
    pub checkout_dir: Option<PathBuf>,

    /// Variable through which the build locates the dependency.
    #[serde(default = "default_home_var")]
    pub home_var: String,

    /// Command that builds the dependency, run inside its checkout.
    #[serde(default = "default_dependency_build")]
    pub build_command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Base image. Deliberately has no default.
    pub image: Option<String>,

    /// Container engine executable.
    #[serde(default = "default_engine")]
    pub engine: String,

    /// Packages needed to build; never present during validation.
    #[serde(default)]
    pub build_packages: Vec<String>,

    /// Packages preinstalled in the clean validation environment.
    #[serde(default)]
    pub validation_packages: Vec<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            image: None,
            engine: default_engine(),
            build_packages: Vec::new(),
            validation_packages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseConfig {
    #[serde(default = "default_tag_pattern")]
    pub tag_pattern: String,

    /// Where renamed packages are written.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default)]
    pub platforms: Vec<PlatformConfig>,

    pub github: Option<GitHubConfig>,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            tag_pattern: default_tag_pattern(),
            output_dir: default_output_dir(),
            platforms: Vec::new(),
            github: None,
        }
    }
}

/// One target of the release matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub id: String,
    pub image: String,
    pub arch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    pub owner: String,
    pub repo: String,

    #[serde(default = "default_github_api")]
    pub api_url: String,

    #[serde(default = "default_github_uploads")]
    pub upload_url: String,
}

fn default_source_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_smoke_args() -> Vec<String> {
    vec!["--version".to_string()]
}

fn default_timeout_secs() -> u64 {
    3600
}

fn default_home_var() -> String {
    "CBANG_HOME".to_string()
}

fn default_dependency_build() -> Vec<String> {
    vec!["scons".to_string()]
}

fn default_engine() -> String {
    "docker".to_string()
}

fn default_tag_pattern() -> String {
    r"^v\d+\.\d+\.\d+".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("dist")
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

fn default_github_uploads() -> String {
    "https://uploads.github.com".to_string()
}

impl PipelineConfig {
    /// Load and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)
            .map_err(|e| PipelineError::Configuration(format!("invalid relpipe.toml: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.project.binary.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "project.binary must not be empty".to_string(),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for platform in &self.release.platforms {
            if !seen.insert(platform.id.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "release platform '{}' is listed twice",
                    platform.id
                )));
            }
        }
        Ok(())
    }

    /// Checkout location of the pinned dependency.
    pub fn dependency_dir(&self) -> Option<PathBuf> {
        self.dependency.as_ref().map(|dep| {
            dep.checkout_dir
                .clone()
                .unwrap_or_else(|| self.project.source_dir.join("deps").join(&dep.name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_parallelism_forms() {
        assert_eq!(parse_parallelism("-j8"), Some(8));
        assert_eq!(parse_parallelism("-j 4"), Some(4));
        assert_eq!(parse_parallelism("--jobs=12"), Some(12));
        assert_eq!(parse_parallelism("--jobs 3"), Some(3));
        assert_eq!(parse_parallelism("--silent -j6 --debug=time"), Some(6));
    }

    #[test]
    fn test_parse_parallelism_rejects_garbage() {
        assert_eq!(parse_parallelism(""), None);
        assert_eq!(parse_parallelism("-j"), None);
        assert_eq!(parse_parallelism("-j0"), None);
        assert_eq!(parse_parallelism("-jmany"), None);
        assert_eq!(parse_parallelism("--silent"), None);
    }

    #[test]
    fn test_assemble_uses_hint_when_jobs_unset() {
        let config = BuildConfiguration::default().assemble(
            Some("-j5"),
            "x86_64",
            &ArchLinkPolicy::default(),
        );
        assert_eq!(config.jobs, Some(5));
        assert!(config.link_flags.is_empty());
    }

    #[test]
    fn test_assemble_explicit_jobs_win() {
        let config = BuildConfiguration {
            jobs: Some(2),
            ..Default::default()
        }
        .assemble(Some("-j16"), "x86_64", &ArchLinkPolicy::default());
        assert_eq!(config.jobs, Some(2));
    }

    #[test]
    fn test_assemble_without_hint_leaves_tool_default() {
        let config =
            BuildConfiguration::default().assemble(None, "aarch64", &ArchLinkPolicy::default());
        assert_eq!(config.jobs, None);
    }

    #[test]
    fn test_atomic_flag_for_listed_arch() {
        let policy = ArchLinkPolicy::default();
        let config = BuildConfiguration::default().assemble(None, "armv7l", &policy);
        assert_eq!(config.link_flags, vec!["-latomic".to_string()]);
        assert_eq!(config.options()["linkflags"], "-latomic");

        // Assembling twice does not duplicate the flag.
        let again = config.assemble(None, "armv7l", &policy);
        assert_eq!(again.link_flags.len(), 1);
    }

    #[test]
    fn test_no_atomic_flag_for_x86_64() {
        assert!(ArchLinkPolicy::default().flags_for("x86_64").is_empty());
        assert!(ArchLinkPolicy::default().flags_for("aarch64").is_empty());
    }

    #[test]
    fn test_options_are_stable() {
        let config = BuildConfiguration {
            jobs: Some(4),
            mode: BuildMode::Debug,
            shared: true,
            strict: true,
            compiler: Some("clang".to_string()),
            link_flags: vec![],
        };
        let options: Vec<_> = config.options().into_iter().collect();
        assert_eq!(
            options,
            vec![
                ("compiler", "clang".to_string()),
                ("mode", "debug".to_string()),
                ("shared", "1".to_string()),
                ("strict", "1".to_string()),
            ]
        );
    }

    #[test]
    fn test_build_mode_from_str() {
        assert_eq!("Release".parse::<BuildMode>().unwrap(), BuildMode::Release);
        assert_eq!("debug".parse::<BuildMode>().unwrap(), BuildMode::Debug);
        assert!("fast".parse::<BuildMode>().is_err());
    }

    const SAMPLE: &str = r#"
[project]
name = "camotics"
binary = "camotics"

[build]
mode = "release"
strict = true
jobs = 8

[build.arch_link_flags]
aarch64 = ["-latomic"]

[dependency]
name = "cbang"
url = "https://github.com/CauldronDevelopmentLLC/cbang"
revision = "0123456789abcdef0123456789abcdef01234567"

[environment]
image = "ubuntu:20.04"
build_packages = ["scons", "build-essential"]

[[release.platforms]]
id = "ubuntu-20.04"
image = "ubuntu:20.04"

[[release.platforms]]
id = "debian-12"
image = "debian:12"
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = PipelineConfig::from_toml_str(SAMPLE).expect("parse");
        assert_eq!(config.project.package_name(), "camotics");
        assert_eq!(config.project.smoke_args, vec!["--version".to_string()]);
        assert_eq!(config.build.configuration.jobs, Some(8));
        assert!(config.build.configuration.strict);
        assert_eq!(config.build.timeout_secs, 3600);
        assert_eq!(config.build.arch_policy().flags_for("aarch64"), ["-latomic"]);
        assert_eq!(config.build.arch_policy().flags_for("armv7l"), ["-latomic"]);

        let dep = config.dependency.as_ref().unwrap();
        assert_eq!(dep.home_var, "CBANG_HOME");
        assert_eq!(config.dependency_dir(), Some(PathBuf::from("./deps/cbang")));

        assert_eq!(config.environment.image.as_deref(), Some("ubuntu:20.04"));
        assert_eq!(config.environment.engine, "docker");
        assert_eq!(config.release.platforms.len(), 2);
        assert_eq!(config.release.output_dir, PathBuf::from("dist"));
    }

    #[test]
    fn test_image_has_no_default() {
        let config = PipelineConfig::from_toml_str(
            "[project]\nname = \"app\"\nbinary = \"app\"\n",
        )
        .unwrap();
        assert!(config.environment.image.is_none());
    }

    #[test]
    fn test_duplicate_platform_rejected() {
        let content = r#"
[project]
name = "app"
binary = "app"

[[release.platforms]]
id = "ubuntu-22.04"
image = "ubuntu:22.04"

[[release.platforms]]
id = "ubuntu-22.04"
image = "ubuntu:jammy"
"#;
        let err = PipelineConfig::from_toml_str(content).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_unknown_section_rejected() {
        let err = PipelineConfig::from_toml_str(
            "[project]\nname = \"a\"\nbinary = \"a\"\n[bogus]\nx = 1\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid relpipe.toml"));
    }
}
