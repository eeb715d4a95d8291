use mediaflow_common::model::{
    HeartbeatRecord, MonitorStats, RemoteFile, ReuseInfo, WorkflowContext,
};
use poem_openapi::types::Any;
use poem_openapi::Object;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
pub struct ErrorsBody {
    pub errors: Vec<String>,
}

/// Body of `POST /v1/tasks`.
#[derive(Debug, Clone, Object)]
pub struct CreateTaskRequest {
    /// One of the known node names, e.g. `ffmpeg.extract_audio`.
    pub task_name: String,
    /// Client-chosen unique task identifier.
    pub task_id: String,
    /// Absolute HTTP(S) URL receiving the terminal-state callback.
    pub callback: String,
    /// Per-node inputs; see the node catalog.
    pub input_data: Any<serde_json::Value>,
}

#[derive(Debug, Clone, Object)]
pub struct CreateTaskResponse {
    pub task_id: String,
    /// `pending` or `completed`.
    pub status: String,
    pub message: String,
    #[oai(skip_serializing_if_is_none)]
    pub reuse_info: Option<Any<ReuseInfo>>,
    /// Full workflow context, present only on a cache hit.
    #[oai(skip_serializing_if_is_none)]
    pub result: Option<Any<WorkflowContext>>,
}

/// Workflow context augmented with the derived remote-file list, served by
/// the status/result endpoints and embedded in callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusDoc {
    #[serde(flatten)]
    pub context: WorkflowContext,
    pub minio_files: Vec<RemoteFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
pub struct LockHolderView {
    pub token: String,
    pub stage: String,
    pub task_id: String,
    pub acquire_ts_millis: i64,
    pub age_seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Object)]
pub struct MonitorStatsView {
    pub attempts: u64,
    pub successes: u64,
    pub timeouts: u64,
    pub recoveries: u64,
}

impl From<MonitorStats> for MonitorStatsView {
    fn from(stats: MonitorStats) -> Self {
        MonitorStatsView {
            attempts: stats.attempts,
            successes: stats.successes,
            timeouts: stats.timeouts,
            recoveries: stats.recoveries,
        }
    }
}

#[derive(Debug, Clone, Object)]
pub struct GpuLockStatusResponse {
    #[oai(skip_serializing_if_is_none)]
    pub holder: Option<LockHolderView>,
    pub stats: MonitorStatsView,
}

#[derive(Debug, Clone, Object)]
pub struct ReleaseLockRequest {
    pub lock_key: String,
}

#[derive(Debug, Clone, Object)]
pub struct ReleaseLockResponse {
    pub released: bool,
    pub message: String,
}

#[derive(Debug, Clone, Object)]
pub struct HeartbeatsResponse {
    pub heartbeats: Any<BTreeMap<String, HeartbeatRecord>>,
}

#[derive(Debug, Clone, Object)]
pub struct StatisticsResponse {
    pub stats: MonitorStatsView,
    pub queue_depths: Any<BTreeMap<String, u64>>,
}

#[derive(Debug, Clone, Object)]
pub struct FileUploadResponse {
    pub file_path: String,
    pub url: String,
    pub size: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Object)]
pub struct DeleteResponse {
    pub deleted: bool,
    pub message: String,
}
