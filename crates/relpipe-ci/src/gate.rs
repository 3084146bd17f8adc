//! Release gate evaluation over per-platform outcomes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Terminal status of one pipeline instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub platform: String,

    pub passed: bool,

    /// Final file name of the instance's renamed package.
    pub file_name: Option<String>,

    /// Failure description for a failed instance.
    pub error: Option<String>,

    /// Install log of a failed validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_log: Option<String>,
}

impl InstanceStatus {
    pub fn passed(platform: &str, file_name: &str) -> Self {
        Self {
            platform: platform.to_string(),
            passed: true,
            file_name: Some(file_name.to_string()),
            error: None,
            install_log: None,
        }
    }

    pub fn failed(platform: &str, error: impl Into<String>) -> Self {
        Self {
            platform: platform.to_string(),
            passed: false,
            file_name: None,
            error: Some(error.into()),
            install_log: None,
        }
    }

    pub fn with_install_log(mut self, log: Option<&str>) -> Self {
        self.install_log = log.map(str::to_string);
        self
    }
}

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// Release gate rules.
pub struct ReleaseGate;

impl ReleaseGate {
    /// Evaluate whether a release may be published.
    ///
    /// Gate rule:
    /// - At least one platform is expected
    /// - Every expected platform reported exactly once, and nothing else did
    /// - Every report passed and named its package
    /// - No two packages share a file name
    pub fn evaluate(expected: &[String], statuses: &[InstanceStatus]) -> GateVerdict {
        let mut violations = Vec::new();

        if expected.is_empty() {
            violations.push("No platforms are configured".to_string());
        }

        let expected_set: BTreeSet<&str> = expected.iter().map(String::as_str).collect();
        let mut reported: BTreeMap<&str, usize> = BTreeMap::new();
        let mut file_names: BTreeMap<&str, &str> = BTreeMap::new();

        for status in statuses {
            let platform = status.platform.as_str();
            *reported.entry(platform).or_default() += 1;

            if !expected_set.contains(platform) {
                violations.push(format!("Platform '{}' was not expected", platform));
            }

            if !status.passed {
                violations.push(format!(
                    "Platform '{}' failed: {}",
                    platform,
                    status.error.as_deref().unwrap_or("Unknown error")
                ));
                continue;
            }

            match status.file_name.as_deref() {
                None => violations.push(format!(
                    "Platform '{}' passed without producing a package",
                    platform
                )),
                Some(name) => {
                    if let Some(other) = file_names.insert(name, platform) {
                        violations.push(format!(
                            "Platforms '{}' and '{}' both produced '{}'",
                            other, platform, name
                        ));
                    }
                }
            }
        }

        for platform in &expected_set {
            match reported.get(platform) {
                None => violations.push(format!("Platform '{}' never reported", platform)),
                Some(count) if *count > 1 => {
                    violations.push(format!("Platform '{}' reported {} times", platform, count))
                }
                Some(_) => {}
            }
        }

        let passed = violations.is_empty();
        let message = if passed {
            format!("All {} platforms passed", expected.len())
        } else {
            format!("{} violation(s) found", violations.len())
        };

        GateVerdict {
            passed,
            violations,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platforms(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_gate_passes_when_all_platforms_pass() {
        let statuses = vec![
            InstanceStatus::passed("ubuntu-20.04", "camotics_1.2.0_ubuntu-20.04_amd64.deb"),
            InstanceStatus::passed("debian-12", "camotics_1.2.0_debian-12_amd64.deb"),
        ];
        let verdict = ReleaseGate::evaluate(&platforms(&["ubuntu-20.04", "debian-12"]), &statuses);
        assert!(verdict.passed);
        assert!(verdict.violations.is_empty());
        assert_eq!(verdict.message, "All 2 platforms passed");
    }

    #[test]
    fn test_gate_fails_on_any_failure() {
        let statuses = vec![
            InstanceStatus::passed("ubuntu-20.04", "camotics_1.2.0_ubuntu-20.04_amd64.deb"),
            InstanceStatus::failed("debian-12", "[validation] smoke invocation failed"),
        ];
        let verdict = ReleaseGate::evaluate(&platforms(&["ubuntu-20.04", "debian-12"]), &statuses);
        assert!(!verdict.passed);
        assert_eq!(verdict.violations.len(), 1);
        assert!(verdict.violations[0].contains("debian-12"));
        assert!(verdict.violations[0].contains("smoke invocation"));
    }

    #[test]
    fn test_gate_fails_on_missing_report() {
        let statuses = vec![InstanceStatus::passed(
            "ubuntu-20.04",
            "camotics_1.2.0_ubuntu-20.04_amd64.deb",
        )];
        let verdict = ReleaseGate::evaluate(&platforms(&["ubuntu-20.04", "debian-12"]), &statuses);
        assert!(!verdict.passed);
        assert!(verdict.violations[0].contains("never reported"));
    }

    #[test]
    fn test_gate_fails_on_file_name_collision() {
        let statuses = vec![
            InstanceStatus::passed("a", "camotics_1.2.0_amd64.deb"),
            InstanceStatus::passed("b", "camotics_1.2.0_amd64.deb"),
        ];
        let verdict = ReleaseGate::evaluate(&platforms(&["a", "b"]), &statuses);
        assert!(!verdict.passed);
        assert!(verdict.violations[0].contains("both produced"));
    }

    #[test]
    fn test_gate_fails_without_platforms() {
        let verdict = ReleaseGate::evaluate(&[], &[]);
        assert!(!verdict.passed);
    }

    #[test]
    fn test_gate_rejects_unexpected_and_duplicate_reports() {
        let statuses = vec![
            InstanceStatus::passed("a", "a.deb"),
            InstanceStatus::passed("a", "a2.deb"),
            InstanceStatus::passed("z", "z.deb"),
        ];
        let verdict = ReleaseGate::evaluate(&platforms(&["a"]), &statuses);
        assert!(!verdict.passed);
        assert!(verdict.violations.iter().any(|v| v.contains("not expected")));
        assert!(verdict.violations.iter().any(|v| v.contains("reported 2 times")));
    }
}
