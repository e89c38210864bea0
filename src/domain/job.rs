//! Job identity, lifecycle states, and the result handed back to callers.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Identifier embedded in both the scratch filename and the expected
/// artifact filename. Time-based so listings sort roughly by arrival.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    /// Build the candidate id for a job arriving at `unix_millis`.
    pub fn from_millis(unix_millis: i128) -> Self {
        Self(format!("scene_{unix_millis}"))
    }

    /// Variant used when the plain millisecond id is already in flight.
    pub fn with_suffix(&self, attempt: usize) -> Self {
        Self(format!("{}_{attempt}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle states a job moves through. Exactly one of the two terminal
/// states is ever reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Repairing,
    Validating,
    Rendering,
    Searching,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Repairing => "repairing",
            JobState::Validating => "validating",
            JobState::Rendering => "rendering",
            JobState::Searching => "searching",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Mutable working record for one in-flight job. Created when a request
/// arrives and dropped once the terminal event has been emitted.
#[derive(Debug)]
pub struct ExecutionJob {
    id: JobId,
    state: JobState,
    logs: Vec<String>,
}

impl ExecutionJob {
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            state: JobState::Created,
            logs: Vec::new(),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn transition(&mut self, next: JobState) {
        debug!(
            target = "domain::job",
            job = %self.id,
            from = self.state.as_str(),
            to = next.as_str(),
            "job state transition"
        );
        self.state = next;
    }

    pub fn absorb_logs(&mut self, lines: Vec<String>) {
        self.logs.extend(lines);
    }

    pub fn logs(&self) -> &[String] {
        &self.logs
    }

    pub fn take_logs(&mut self) -> Vec<String> {
        std::mem::take(&mut self.logs)
    }
}

/// Terminal payload for a successful job, echoed to the caller on the wire
/// in the field names its consumers already expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_path: Option<String>,
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_mock: Option<bool>,
    pub code: String,
}

impl RenderResult {
    /// Result for a real artifact produced by the toolchain.
    pub fn rendered(url: String, path: PathBuf, logs: Vec<String>, code: String) -> Self {
        Self {
            success: true,
            video_url: Some(url),
            video_path: Some(path.display().to_string()),
            logs,
            is_mock: None,
            code,
        }
    }

    /// Result for the placeholder emitted when the toolchain is unavailable.
    pub fn mock(url: String, path: PathBuf, logs: Vec<String>, code: String) -> Self {
        Self {
            success: true,
            video_url: Some(url),
            video_path: Some(path.display().to_string()),
            logs,
            is_mock: Some(true),
            code,
        }
    }
}
