//! CI coordinator: one pipeline per platform, one release per tag.

use crate::gate::{GateVerdict, InstanceStatus, ReleaseGate};
use crate::pipeline::{PipelineReport, PlatformPipeline, PlatformTarget};
use crate::release::{PublishedRelease, ReleasePublisher, ReleaseRequest};
use crate::stage::StageRecord;
use futures::future::join_all;
use regex::Regex;
use relpipe_core::{PipelineError, ReleaseManifest, Result, StageKind, TriggerEvent};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// What the coordinator did with an event.
#[derive(Debug, Clone)]
pub enum CoordinatorOutcome {
    /// The event was not a release tag; nothing ran.
    Skipped { reason: String },

    /// Every platform passed and the release was published.
    Released {
        release: PublishedRelease,
        reports: Vec<PipelineReport>,
        publish: StageRecord,
    },
}

/// Fans a release out to every platform and publishes the combined result.
pub struct CiCoordinator {
    pipeline: Arc<dyn PlatformPipeline>,
    publisher: Arc<dyn ReleasePublisher>,
    targets: Vec<PlatformTarget>,
    tag_pattern: Regex,
}

impl CiCoordinator {
    pub fn new(
        pipeline: Arc<dyn PlatformPipeline>,
        publisher: Arc<dyn ReleasePublisher>,
        targets: Vec<PlatformTarget>,
        tag_pattern: &str,
    ) -> Result<Self> {
        let tag_pattern = Regex::new(tag_pattern).map_err(|e| {
            PipelineError::Configuration(format!("invalid tag pattern '{}': {}", tag_pattern, e))
        })?;
        Ok(Self {
            pipeline,
            publisher,
            targets,
            tag_pattern,
        })
    }

    /// The release tag carried by `event`, if it is one.
    pub fn release_tag<'a>(&self, event: &'a TriggerEvent) -> Option<&'a str> {
        event.tag().filter(|tag| self.tag_pattern.is_match(tag))
    }

    /// Handle a trigger event.
    ///
    /// All instances run to completion before anything is published. If any
    /// of them failed, nothing is published at all.
    pub async fn handle(&self, event: &TriggerEvent) -> Result<CoordinatorOutcome> {
        let Some(tag) = self.release_tag(event) else {
            info!(git_ref = %event.git_ref, "Not a release tag, skipping");
            return Ok(CoordinatorOutcome::Skipped {
                reason: format!("'{}' is not a release tag", event.git_ref),
            });
        };
        if self.targets.is_empty() {
            return Err(PipelineError::Configuration(
                "no release platforms are configured".to_string(),
            ));
        }

        info!(tag = %tag, platforms = self.targets.len(), "Starting release");
        let (statuses, reports) = self.run_all().await;

        let expected: Vec<String> = self.targets.iter().map(|t| t.id.clone()).collect();
        let verdict = ReleaseGate::evaluate(&expected, &statuses);
        if !verdict.passed {
            return Err(abort(tag, &verdict, &statuses));
        }

        let mut manifest = ReleaseManifest::new();
        for report in &reports {
            manifest.insert(report.platform.clone(), report.artifact.clone())?;
        }

        let request = ReleaseRequest {
            tag: tag.to_string(),
            name: tag.to_string(),
            body: event.message.clone(),
            manifest,
        };
        let start = Instant::now();
        let result = self.publish_once(&request).await;
        let publish = StageRecord::from_result(StageKind::Publish, start.elapsed(), &result);
        let release = result?;
        info!(
            tag = %tag,
            location = %release.location,
            duration_ms = publish.duration_ms,
            "Release complete"
        );
        Ok(CoordinatorOutcome::Released {
            release,
            reports,
            publish,
        })
    }

    async fn publish_once(&self, request: &ReleaseRequest) -> Result<PublishedRelease> {
        if self.publisher.release_exists(&request.tag).await? {
            return Err(PipelineError::Publish(format!(
                "release {} has already been published",
                request.tag
            )));
        }
        self.publisher.publish(request).await
    }

    /// Run every target concurrently and wait for all of them.
    async fn run_all(&self) -> (Vec<InstanceStatus>, Vec<PipelineReport>) {
        let handles: Vec<_> = self
            .targets
            .iter()
            .cloned()
            .map(|target| {
                let pipeline = self.pipeline.clone();
                tokio::spawn(async move { pipeline.run(&target).await })
            })
            .collect();

        let mut statuses = Vec::new();
        let mut reports = Vec::new();
        for (target, joined) in self.targets.iter().zip(join_all(handles).await) {
            match joined {
                Ok(Ok(report)) => {
                    let status = match report.file_name() {
                        Some(name) => InstanceStatus::passed(&target.id, name),
                        None => InstanceStatus {
                            platform: target.id.clone(),
                            passed: true,
                            file_name: None,
                            error: None,
                            install_log: None,
                        },
                    };
                    statuses.push(status);
                    reports.push(report);
                }
                Ok(Err(e)) => {
                    warn!(platform = %target.id, kind = e.kind(), error = %e, "Platform failed");
                    statuses.push(
                        InstanceStatus::failed(&target.id, format!("[{}] {}", e.kind(), e))
                            .with_install_log(e.install_log()),
                    );
                }
                Err(e) => {
                    error!(platform = %target.id, error = %e, "Platform task did not complete");
                    statuses.push(InstanceStatus::failed(
                        &target.id,
                        format!("task failed: {}", e),
                    ));
                }
            }
        }
        (statuses, reports)
    }
}

fn abort(tag: &str, verdict: &GateVerdict, statuses: &[InstanceStatus]) -> PipelineError {
    for violation in &verdict.violations {
        error!(tag = %tag, violation = %violation, "Release gate violation");
    }

    let mut install_log = String::new();
    for status in statuses {
        if let Some(log) = &status.install_log {
            error!(
                tag = %tag,
                platform = %status.platform,
                install_log = %log,
                "Validation install log"
            );
            install_log.push_str(&format!("--- {} ---\n{}", status.platform, log));
            if !install_log.ends_with('\n') {
                install_log.push('\n');
            }
        }
    }

    PipelineError::ReleaseAborted {
        tag: tag.to_string(),
        reason: format!("{}: {}", verdict.message, verdict.violations.join("; ")),
        install_log: (!install_log.is_empty()).then_some(install_log),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NeverRuns;

    #[async_trait]
    impl PlatformPipeline for NeverRuns {
        async fn run(&self, _target: &PlatformTarget) -> Result<PipelineReport> {
            panic!("pipeline must not run");
        }
    }

    struct NoPublisher;

    #[async_trait]
    impl ReleasePublisher for NoPublisher {
        async fn release_exists(&self, _tag: &str) -> Result<bool> {
            panic!("publisher must not be called");
        }

        async fn publish(&self, _request: &ReleaseRequest) -> Result<PublishedRelease> {
            panic!("publisher must not be called");
        }
    }

    fn coordinator(targets: Vec<PlatformTarget>) -> CiCoordinator {
        CiCoordinator::new(
            Arc::new(NeverRuns),
            Arc::new(NoPublisher),
            targets,
            r"^v\d+\.\d+\.\d+",
        )
        .unwrap()
    }

    #[test]
    fn test_release_tag_matching() {
        let c = coordinator(vec![]);
        assert_eq!(
            c.release_tag(&TriggerEvent::new("refs/tags/v1.2.0", "")),
            Some("v1.2.0")
        );
        assert_eq!(c.release_tag(&TriggerEvent::new("refs/tags/nightly", "")), None);
        assert_eq!(c.release_tag(&TriggerEvent::new("refs/heads/v1.2.0", "")), None);
    }

    #[tokio::test]
    async fn test_non_release_event_is_skipped() {
        let c = coordinator(vec![PlatformTarget::new(
            "ubuntu-20.04",
            Some("ubuntu:20.04"),
            "x86_64",
        )]);
        let outcome = c
            .handle(&TriggerEvent::new("refs/heads/master", "wip"))
            .await
            .unwrap();
        assert!(matches!(outcome, CoordinatorOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn test_no_platforms_is_configuration_error() {
        let err = coordinator(vec![])
            .handle(&TriggerEvent::new("refs/tags/v1.0.0", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_invalid_pattern() {
        let result = CiCoordinator::new(
            Arc::new(NeverRuns),
            Arc::new(NoPublisher),
            vec![],
            "v(",
        );
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }
}
