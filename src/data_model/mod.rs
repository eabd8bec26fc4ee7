#[cfg(test)]
pub mod test_objects;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::Display;

/// Name prefix that marks an artifact as world-readable.
pub const PUBLIC_NAME_PREFIX: &str = "public/";

/// Metadata record for a named output of a task run.
///
/// The bytes live in an object store (`s3`, `azure`), at an arbitrary URL
/// (`reference`), or nowhere (`error`). Uniquely identified by
/// `(task_id, run_id, name)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
pub struct Artifact {
    pub task_id: String,
    pub run_id: u32,
    pub name: String,
    #[builder(default = "String::from(\"application/json\")")]
    pub content_type: String,
    /// Epoch milliseconds after which the record is eligible for deletion.
    pub expires: u64,
    pub details: ArtifactDetails,
}

impl Artifact {
    pub fn key(&self) -> String {
        Artifact::key_from(&self.task_id, self.run_id, &self.name)
    }

    pub fn key_from(task_id: &str, run_id: u32, name: &str) -> String {
        format!("{task_id}|{run_id}|{name}")
    }

    pub fn key_prefix_from_run(task_id: &str, run_id: u32) -> String {
        format!("{task_id}|{run_id}|")
    }

    /// Object-store key shared by the s3 and azure variants.
    pub fn object_path(task_id: &str, run_id: u32, name: &str) -> String {
        format!("{task_id}/{run_id}/{name}")
    }

    pub fn is_public(&self) -> bool {
        self.name.starts_with(PUBLIC_NAME_PREFIX)
    }

    pub fn storage_type(&self) -> &'static str {
        self.details.storage_type()
    }
}

/// Per-variant storage details, discriminated by storage type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "storage_type", rename_all = "lowercase")]
pub enum ArtifactDetails {
    S3 { bucket: String, prefix: String },
    Azure { container: String, path: String },
    Reference { url: String },
    Error { message: String, reason: String },
}

impl ArtifactDetails {
    pub fn storage_type(&self) -> &'static str {
        match self {
            ArtifactDetails::S3 { .. } => "s3",
            ArtifactDetails::Azure { .. } => "azure",
            ArtifactDetails::Reference { .. } => "reference",
            ArtifactDetails::Error { .. } => "error",
        }
    }

    pub fn same_variant(&self, other: &ArtifactDetails) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Read-only projection of a task, written by the task machinery outside
/// this service.
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct Task {
    pub task_id: String,
    /// Epoch milliseconds; artifact expirations may not exceed this.
    pub expires: u64,
    #[builder(default)]
    pub routes: Vec<String>,
    #[builder(default)]
    pub runs: Vec<TaskRun>,
}

impl Task {
    pub fn key(&self) -> &str {
        &self.task_id
    }

    pub fn latest_run_id(&self) -> Option<u32> {
        self.runs.len().checked_sub(1).map(|id| id as u32)
    }

    pub fn status(&self) -> TaskStatus {
        let state = self
            .runs
            .last()
            .map(|run| run.state.to_string())
            .unwrap_or_else(|| "unscheduled".to_string());
        TaskStatus {
            task_id: self.task_id.clone(),
            state,
            runs: self
                .runs
                .iter()
                .enumerate()
                .map(|(run_id, run)| RunStatus {
                    run_id: run_id as u32,
                    state: run.state,
                    worker_group: run.worker_group.clone(),
                    worker_id: run.worker_id.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct TaskRun {
    pub state: RunState,
    #[builder(default)]
    pub worker_group: Option<String>,
    #[builder(default)]
    pub worker_id: Option<String>,
    /// Epoch milliseconds at which the run reached a resolved state.
    #[builder(default)]
    pub resolved: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    Exception,
}

/// Task status snapshot embedded in `artifactCreated` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub task_id: String,
    pub state: String,
    pub runs: Vec<RunStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub run_id: u32,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}
