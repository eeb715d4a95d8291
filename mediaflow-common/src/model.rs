// Copyright 2024-2025 Mediaflow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::node::NodeName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Empty {}

/// Client-chosen identifier of one task. Doubles as the workflow identifier,
/// the per-task prefix in the object bucket and the per-task directory name
/// on shared storage, so it must stay URL- and path-safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(value: impl Into<String>) -> Result<Self, String> {
        let value = value.into();
        if value.is_empty() {
            return Err("task_id must not be empty".to_string());
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(format!(
                "task_id '{value}' contains characters outside [A-Za-z0-9._-]"
            ));
        }
        Ok(TaskId(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskId::new(s)
    }
}

/// Per-stage status, uppercase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Success | StageStatus::Failed | StageStatus::Skipped
        )
    }
}

impl Display for StageStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageStatus::Pending => "PENDING",
            StageStatus::Running => "RUNNING",
            StageStatus::Success => "SUCCESS",
            StageStatus::Failed => "FAILED",
            StageStatus::Skipped => "SKIPPED",
        };
        write!(f, "{s}")
    }
}

/// Aggregate task status, lowercase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Display for WorkflowStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackStatus {
    Pending,
    Sent,
    Failed,
}

/// The original request payload, kept verbatim on the workflow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputParams {
    pub task_name: NodeName,
    pub input_data: Map<String, Value>,
    pub callback_url: String,
}

/// Execution record of one node inside a workflow.
///
/// `duration` is the only duration carried at stage scope; node outputs must
/// not expose alternative duration aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecution {
    pub status: StageStatus,
    #[serde(default)]
    pub input_params: Map<String, Value>,
    #[serde(default)]
    pub output: Map<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration: f64,
}

impl StageExecution {
    pub fn pending() -> Self {
        StageExecution {
            status: StageStatus::Pending,
            input_params: Map::new(),
            output: Map::new(),
            error: None,
            duration: 0.0,
        }
    }

    pub fn running(input_params: Map<String, Value>) -> Self {
        StageExecution {
            status: StageStatus::Running,
            input_params,
            output: Map::new(),
            error: None,
            duration: 0.0,
        }
    }

    pub fn success(input_params: Map<String, Value>, output: Map<String, Value>, duration: f64) -> Self {
        StageExecution {
            status: StageStatus::Success,
            input_params,
            output,
            error: None,
            duration,
        }
    }

    pub fn failed(input_params: Map<String, Value>, error: impl Into<String>, duration: f64) -> Self {
        StageExecution {
            status: StageStatus::Failed,
            input_params,
            output: Map::new(),
            error: Some(error.into()),
            duration,
        }
    }

    pub fn skipped(input_params: Map<String, Value>) -> Self {
        StageExecution {
            status: StageStatus::Skipped,
            input_params,
            output: Map::new(),
            error: None,
            duration: 0.0,
        }
    }
}

/// The single source of truth for one task's execution, stored as one JSON
/// document at `workflow:<task_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub workflow_id: TaskId,
    pub create_at: DateTime<Utc>,
    pub input_params: InputParams,
    pub shared_storage_path: String,
    #[serde(default)]
    pub stages: BTreeMap<String, StageExecution>,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_callback_status")]
    pub callback_status: CallbackStatus,
}

fn default_callback_status() -> CallbackStatus {
    CallbackStatus::Pending
}

impl WorkflowContext {
    pub fn new(
        workflow_id: TaskId,
        input_params: InputParams,
        shared_storage_path: String,
        now: DateTime<Utc>,
    ) -> Self {
        WorkflowContext {
            workflow_id,
            create_at: now,
            input_params,
            shared_storage_path,
            stages: BTreeMap::new(),
            status: WorkflowStatus::Pending,
            error: None,
            updated_at: now,
            callback_status: CallbackStatus::Pending,
        }
    }

    pub fn stage(&self, name: &NodeName) -> Option<&StageExecution> {
        self.stages.get(name.as_str())
    }

    pub fn set_stage(&mut self, name: &NodeName, stage: StageExecution, now: DateTime<Utc>) {
        self.stages.insert(name.as_str().to_string(), stage);
        self.recompute_status();
        self.updated_at = now;
    }

    /// Aggregate status derived from the stages; a top-level error marks the
    /// whole task failed regardless of stage state.
    pub fn recompute_status(&mut self) {
        if self.error.is_some() {
            self.status = WorkflowStatus::Failed;
            return;
        }
        let mut any_running = false;
        let mut any_failed = false;
        let mut any_pending = false;
        let mut any_terminal_success = false;
        for stage in self.stages.values() {
            match stage.status {
                StageStatus::Running => any_running = true,
                StageStatus::Failed => any_failed = true,
                StageStatus::Pending => any_pending = true,
                StageStatus::Success | StageStatus::Skipped => any_terminal_success = true,
            }
        }
        self.status = if any_running {
            WorkflowStatus::Running
        } else if any_failed {
            WorkflowStatus::Failed
        } else if any_pending || !any_terminal_success {
            WorkflowStatus::Pending
        } else {
            WorkflowStatus::Completed
        };
    }
}

/// Reuse decision block attached to task-creation responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReuseInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reuse_hit: Option<bool>,
    pub task_name: NodeName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl ReuseInfo {
    pub fn hit(task_name: NodeName, cached_at: DateTime<Utc>) -> Self {
        ReuseInfo {
            reuse_hit: Some(true),
            task_name,
            source: Some("redis".to_string()),
            cached_at: Some(cached_at),
            state: None,
        }
    }

    pub fn pending(task_name: NodeName) -> Self {
        ReuseInfo {
            reuse_hit: None,
            task_name,
            source: None,
            cached_at: None,
            state: Some("pending".to_string()),
        }
    }
}

/// Remote file descriptor derived from `*_minio_url` / `*_minio_urls` output
/// fields across all stages of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub name: String,
    pub url: String,
    #[serde(rename = "type")]
    pub file_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Terminal-state webhook body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub task_id: TaskId,
    pub status: WorkflowStatus,
    pub result: WorkflowContext,
    pub minio_files: Vec<RemoteFile>,
    pub timestamp: DateTime<Utc>,
}

/// Liveness record written by workers at `task_heartbeat:<task_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub status: String,
    pub progress: f64,
    pub message: String,
    pub last_update: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
}

/// Snapshot of the `monitor:stats` counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MonitorStats {
    pub attempts: u64,
    pub successes: u64,
    pub timeouts: u64,
    pub recoveries: u64,
}

fn remote_file_from_url(url: &str) -> RemoteFile {
    let name = url
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .split('?')
        .next()
        .unwrap_or(url)
        .to_string();
    let file_type = name
        .rsplit('.')
        .next()
        .filter(|ext| *ext != name)
        .unwrap_or("unknown")
        .to_string();
    RemoteFile {
        name,
        url: url.to_string(),
        file_type,
        size: None,
    }
}

/// Collect every uploaded object referenced by the workflow's stages, in
/// stage order.
pub fn collect_remote_files(context: &WorkflowContext) -> Vec<RemoteFile> {
    let mut files = Vec::new();
    for stage in context.stages.values() {
        for (field, value) in &stage.output {
            if field.ends_with("_minio_url") {
                if let Value::String(url) = value {
                    files.push(remote_file_from_url(url));
                }
            } else if field.ends_with("_minio_urls") {
                if let Value::Array(urls) = value {
                    for url in urls {
                        if let Value::String(url) = url {
                            files.push(remote_file_from_url(url));
                        }
                    }
                }
            }
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::node::NodeName;
    use serde_json::json;

    fn sample_context() -> WorkflowContext {
        let mut context = WorkflowContext::new(
            TaskId::new("t1").unwrap(),
            InputParams {
                task_name: NodeName::FfmpegExtractAudio,
                input_data: json!({"video_path": "/share/in/a.mp4"})
                    .as_object()
                    .unwrap()
                    .clone(),
                callback_url: "http://cb/e1".to_string(),
            },
            "/share/workflows/t1".to_string(),
            Utc::now(),
        );
        context.set_stage(
            &NodeName::FfmpegExtractAudio,
            StageExecution::success(
                Map::new(),
                json!({
                    "audio_path": "/share/workflows/t1/audio/a.wav",
                    "audio_path_minio_url": "http://minio/tasks/t1/a.wav"
                })
                .as_object()
                .unwrap()
                .clone(),
                1.5,
            ),
            Utc::now(),
        );
        context
    }

    #[test]
    fn task_id_rejects_path_escapes() {
        assert!(TaskId::new("ok-task_1.v2").is_ok());
        assert!(TaskId::new("").is_err());
        assert!(TaskId::new("a/b").is_err());
        assert!(TaskId::new("a:b").is_err());
        assert!(TaskId::new("a b").is_err());
    }

    #[test]
    fn stage_status_uses_uppercase_wire_form() {
        assert_eq!(
            serde_json::to_string(&StageStatus::Success).unwrap(),
            "\"SUCCESS\""
        );
        assert_eq!(
            serde_json::from_str::<StageStatus>("\"SKIPPED\"").unwrap(),
            StageStatus::Skipped
        );
    }

    #[test]
    fn workflow_context_round_trips_through_json() {
        let context = sample_context();
        let serialized = serde_json::to_string(&context).unwrap();
        let deserialized: WorkflowContext = serde_json::from_str(&serialized).unwrap();
        assert_eq!(context, deserialized);
    }

    #[test]
    fn aggregate_status_follows_stages() {
        let mut context = sample_context();
        assert_eq!(context.status, WorkflowStatus::Completed);

        context.set_stage(
            &NodeName::FasterWhisperTranscribeAudio,
            StageExecution::running(Map::new()),
            Utc::now(),
        );
        assert_eq!(context.status, WorkflowStatus::Running);

        context.set_stage(
            &NodeName::FasterWhisperTranscribeAudio,
            StageExecution::failed(Map::new(), "boom", 0.1),
            Utc::now(),
        );
        assert_eq!(context.status, WorkflowStatus::Failed);
    }

    #[test]
    fn remote_files_are_collected_from_all_url_fields() {
        let mut context = sample_context();
        context.set_stage(
            &NodeName::AudioSeparatorSeparateVocals,
            StageExecution::success(
                Map::new(),
                json!({
                    "all_audio_files": ["/a/vocals.wav", "/a/other.wav"],
                    "all_audio_files_minio_urls": [
                        "http://minio/tasks/t1/vocals.wav",
                        "http://minio/tasks/t1/other.wav"
                    ]
                })
                .as_object()
                .unwrap()
                .clone(),
                2.0,
            ),
            Utc::now(),
        );

        let files = collect_remote_files(&context);
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].name, "a.wav");
        assert_eq!(files[0].file_type, "wav");
        assert_eq!(files[1].url, "http://minio/tasks/t1/vocals.wav");
    }
}
