use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle status of a dispatched worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl WorkerStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, WorkerStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Running => "running",
            WorkerStatus::Completed => "completed",
            WorkerStatus::Failed => "failed",
            WorkerStatus::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(WorkerStatus::Running),
            "completed" | "success" => Ok(WorkerStatus::Completed),
            "failed" | "failure" => Ok(WorkerStatus::Failed),
            "timed_out" | "timed-out" | "timeout" => Ok(WorkerStatus::TimedOut),
            _ => anyhow::bail!(
                "Invalid worker status '{}'. Valid values: running, completed, failed, timed_out",
                s
            ),
        }
    }
}

/// A dispatched worker. Mutated once when it finishes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerHandle {
    pub agent_id: String,
    pub unit_id: String,
    pub kind: String,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Path of the cached result document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<PathBuf>,
}

impl WorkerHandle {
    pub fn new(agent_id: &str, unit_id: &str, kind: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            unit_id: unit_id.to_string(),
            kind: kind.to_string(),
            status: WorkerStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            result_ref: None,
        }
    }

    /// Wall-clock time from start to finish; `None` while running.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }
}

/// The cached outcome of a worker, stored as `results/{agent_id}.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedResult {
    pub agent_id: String,
    pub unit_id: String,
    pub status: WorkerStatus,
    pub result: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}
