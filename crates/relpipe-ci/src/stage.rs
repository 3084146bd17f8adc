//! Per-stage execution records.

use relpipe_core::{PipelineError, StageKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of one stage of a pipeline instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageKind,

    /// Whether the stage completed successfully.
    pub passed: bool,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Error category and message for a failed stage.
    pub error: Option<String>,
}

impl StageRecord {
    pub fn passed(stage: StageKind, elapsed: Duration) -> Self {
        Self {
            stage,
            passed: true,
            duration_ms: elapsed.as_millis() as u64,
            error: None,
        }
    }

    pub fn failed(stage: StageKind, elapsed: Duration, error: &PipelineError) -> Self {
        Self {
            stage,
            passed: false,
            duration_ms: elapsed.as_millis() as u64,
            error: Some(format!("[{}] {}", error.kind(), error)),
        }
    }

    /// Record the outcome of a stage result.
    pub fn from_result<T>(
        stage: StageKind,
        elapsed: Duration,
        result: &Result<T, PipelineError>,
    ) -> Self {
        match result {
            Ok(_) => Self::passed(stage, elapsed),
            Err(e) => Self::failed(stage, elapsed, e),
        }
    }
}
