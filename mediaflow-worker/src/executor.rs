pub mod params;
pub mod tool;

use crate::config::ToolsConfig;
use crate::nodes::NodeRegistry;
use chrono::Utc;
use mediaflow_common::clients::callback::CallbackService;
use mediaflow_common::model::{
    collect_remote_files, CallbackPayload, HeartbeatRecord, StageExecution, StageStatus, TaskId,
    WorkflowStatus,
};
use mediaflow_common::node::{NodeName, FORBIDDEN_DURATION_ALIASES};
use mediaflow_service_base::lock::{GpuLockService, HeartbeatService};
use mediaflow_service_base::queue::TaskDispatch;
use mediaflow_service_base::shared_storage::SharedStorage;
use mediaflow_service_base::workflow::state::UploadingStateManager;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Classified node failure. The classification shows up in the error text
/// and log keys; on the wire every variant becomes a FAILED stage.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Input error: {0}")]
    InvalidInput(String),
    #[error("Resource error: {0}")]
    Resource(String),
    #[error("Compute error: {0}")]
    Compute(String),
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl NodeError {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeError::InvalidInput(_) => "input",
            NodeError::Resource(_) => "resource",
            NodeError::Compute(_) => "compute",
            NodeError::Cancelled(_) => "cancelled",
        }
    }
}

/// Everything a node's core logic may touch: resolved inputs, the task's
/// shared-storage directory, tool configuration and the cooperative
/// cancellation token.
pub struct NodeContext {
    pub task_id: TaskId,
    pub task_dir: PathBuf,
    pub inputs: Map<String, Value>,
    pub tools: Arc<ToolsConfig>,
    pub cancel: CancellationToken,
}

impl NodeContext {
    pub fn require_str(&self, field: &str) -> Result<&str, NodeError> {
        match self.inputs.get(field) {
            Some(Value::String(value)) if !value.is_empty() => Ok(value),
            Some(Value::String(_)) => Err(NodeError::InvalidInput(format!(
                "required parameter '{field}' is empty"
            ))),
            Some(other) => Err(NodeError::InvalidInput(format!(
                "required parameter '{field}' must be a string, got {other}"
            ))),
            None => Err(NodeError::InvalidInput(format!(
                "required parameter '{field}' is missing"
            ))),
        }
    }

    pub fn optional_str(&self, field: &str) -> Option<&str> {
        self.inputs
            .get(field)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn optional_bool(&self, field: &str) -> Option<bool> {
        self.inputs.get(field).and_then(Value::as_bool)
    }

    pub fn optional_u64(&self, field: &str) -> Option<u64> {
        self.inputs.get(field).and_then(Value::as_u64)
    }

    pub fn optional_f64(&self, field: &str) -> Option<f64> {
        self.inputs.get(field).and_then(Value::as_f64)
    }

    pub fn optional_object(&self, field: &str) -> Option<&Map<String, Value>> {
        self.inputs.get(field).and_then(Value::as_object)
    }

    pub fn optional_array(&self, field: &str) -> Option<&Vec<Value>> {
        self.inputs.get(field).and_then(Value::as_array)
    }

    /// A required input naming a local file that must already exist (URL
    /// inputs are localized before core logic runs).
    pub fn require_existing_file(&self, field: &str) -> Result<PathBuf, NodeError> {
        let path = PathBuf::from(self.require_str(field)?);
        if !path.is_file() {
            return Err(NodeError::InvalidInput(format!(
                "parameter '{field}' does not point at an existing file: {}",
                path.display()
            )));
        }
        Ok(path)
    }

    pub fn require_existing_dir(&self, field: &str) -> Result<PathBuf, NodeError> {
        let path = PathBuf::from(self.require_str(field)?);
        if !path.is_dir() {
            return Err(NodeError::InvalidInput(format!(
                "parameter '{field}' does not point at an existing directory: {}",
                path.display()
            )));
        }
        Ok(path)
    }

    /// Output location under the task's shared-storage directory.
    pub fn out_dir(&self, name: &str) -> PathBuf {
        self.task_dir.join(name)
    }
}

pub enum NodeOutcome {
    Completed(Map<String, Value>),
    /// The node declared its work not applicable for the given config.
    Skipped { reason: String },
}

/// The contract every catalog node implements. Reuse metadata (cache key
/// fields, required outputs, custom path fields) lives on the shared
/// descriptor; only behavior lives here.
#[async_trait::async_trait]
pub trait NodeExecutor: Send + Sync {
    fn name(&self) -> NodeName;

    fn validate_input(&self, ctx: &NodeContext) -> Result<(), NodeError>;

    /// Produce the raw output map with local paths and data. Remote URLs are
    /// attached later by the state manager's side-effect layer.
    async fn execute_core_logic(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError>;

    /// Whether this execution needs the GPU lock; conditional nodes decide
    /// from config or inputs at execute time.
    fn needs_gpu(&self, _ctx: &NodeContext) -> bool {
        matches!(
            self.name().descriptor().gpu,
            mediaflow_common::node::GpuRequirement::Always
        )
    }

    /// Best-effort GPU memory cleanup before the lock is released.
    async fn cleanup_gpu(&self, _ctx: &NodeContext) {}
}

fn redact_inputs(inputs: &Map<String, Value>) -> Map<String, Value> {
    const SECRET_MARKERS: &[&str] = &["token", "secret", "password", "api_key"];
    inputs
        .iter()
        .map(|(key, value)| {
            let lowered = key.to_lowercase();
            if SECRET_MARKERS.iter().any(|marker| lowered.contains(marker)) {
                (key.clone(), Value::String("****".to_string()))
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}

fn strip_duration_aliases(node: &NodeName, output: &mut Map<String, Value>) {
    for alias in FORBIDDEN_DURATION_ALIASES {
        if output.remove(*alias).is_some() {
            warn!("Node {node} emitted forbidden duration alias '{alias}', dropped");
        }
    }
}

/// Drives the uniform node lifecycle: record start, resolve and validate
/// inputs, localize URL inputs, take the GPU lock when needed, run the core
/// logic under cooperative cancellation, shape and persist the output, then
/// deliver the terminal callback.
pub struct NodeRunner {
    state: UploadingStateManager,
    lock: Arc<GpuLockService>,
    heartbeats: Arc<HeartbeatService>,
    callbacks: Arc<dyn CallbackService>,
    shared_storage: Arc<SharedStorage>,
    registry: Arc<NodeRegistry>,
    tools: Arc<ToolsConfig>,
    node_defaults: HashMap<String, Value>,
}

impl NodeRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: UploadingStateManager,
        lock: Arc<GpuLockService>,
        heartbeats: Arc<HeartbeatService>,
        callbacks: Arc<dyn CallbackService>,
        shared_storage: Arc<SharedStorage>,
        registry: Arc<NodeRegistry>,
        tools: Arc<ToolsConfig>,
        node_defaults: HashMap<String, Value>,
    ) -> Self {
        NodeRunner {
            state,
            lock,
            heartbeats,
            callbacks,
            shared_storage,
            registry,
            tools,
            node_defaults,
        }
    }

    pub async fn run(&self, dispatch: &TaskDispatch) {
        let node = dispatch.task_name;
        let task_id = dispatch.task_id.clone();

        let Some(executor) = self.registry.get(&node) else {
            error!("No executor registered for {node}");
            return;
        };

        let context = match self.state.get(&task_id).await {
            Ok(Some(context)) => context,
            Ok(None) => {
                error!("Dispatch for {task_id} has no workflow document");
                return;
            }
            Err(err) => {
                error!("Failed to load workflow for {task_id}: {err}");
                return;
            }
        };

        let task_dir = match self.shared_storage.ensure_task_dir(&task_id).await {
            Ok(dir) => dir,
            Err(err) => {
                let failure = NodeError::Resource(format!("shared storage unavailable: {err}"));
                self.finish(&task_id, &node, Map::new(), Err(failure), 0.0)
                    .await;
                return;
            }
        };

        let resolved =
            match params::resolve_parameters(&node.descriptor(), &context, &self.node_defaults) {
                Ok(resolved) => resolved,
                Err(err) => {
                    self.finish(&task_id, &node, Map::new(), Err(err), 0.0).await;
                    return;
                }
            };
        let redacted = redact_inputs(&resolved);
        tracing::debug!(
            cache_key = %mediaflow_common::node::cache_key(&node.descriptor(), &resolved),
            "Resolved inputs for {node} of task {task_id}"
        );

        if let Err(err) = self
            .state
            .record_stage_start(&task_id, &node, redacted.clone())
            .await
        {
            error!("Failed to record stage start for {task_id}: {err}");
            return;
        }

        let cancel = CancellationToken::new();
        let heartbeat_handle = self.spawn_heartbeat_loop(&task_id, &node, cancel.clone());

        let mut node_ctx = NodeContext {
            task_id: task_id.clone(),
            task_dir,
            inputs: resolved,
            tools: self.tools.clone(),
            cancel: cancel.clone(),
        };

        let started = Instant::now();
        let outcome = self.execute_guarded(executor.as_ref(), &mut node_ctx).await;
        let duration = started.elapsed().as_secs_f64();

        heartbeat_handle.abort();
        let _ = self.heartbeats.clear(&task_id).await;

        self.finish(&task_id, &node, redacted, outcome, duration)
            .await;
    }

    /// validate → localize → (lock) → core logic → release; the lock is
    /// released on every path out of this function, with the key TTL as the
    /// final backstop should the whole process die.
    async fn execute_guarded(
        &self,
        executor: &dyn NodeExecutor,
        ctx: &mut NodeContext,
    ) -> Result<NodeOutcome, NodeError> {
        executor.validate_input(ctx)?;
        self.localize_url_inputs(ctx).await?;

        let lock_token = if executor.needs_gpu(ctx) {
            match self.lock.acquire(&executor.name(), &ctx.task_id).await {
                Ok(token) => Some(token),
                Err(err) => return Err(NodeError::Resource(err.to_string())),
            }
        } else {
            None
        };

        let result = tokio::select! {
            result = executor.execute_core_logic(ctx) => result,
            _ = ctx.cancel.cancelled() => Err(NodeError::Cancelled(
                "execution cancelled by the timeout monitor".to_string(),
            )),
        };

        if let Some(token) = lock_token {
            executor.cleanup_gpu(ctx).await;
            match self.lock.release(&token).await {
                Ok(_) => {}
                Err(first_error) => {
                    warn!("GPU lock release failed ({first_error}), retrying once");
                    if let Err(second_error) = self.lock.release(&token).await {
                        error!(
                            "Emergency GPU lock release failed too ({second_error}); \
                             TTL will reclaim the lock"
                        );
                    }
                }
            }
        }

        result
    }

    /// Download-on-read: every string input holding an HTTP(S) URL is pulled
    /// into the task directory before core logic runs; downloads are cached
    /// per task by URL.
    async fn localize_url_inputs(&self, ctx: &mut NodeContext) -> Result<(), NodeError> {
        let url_fields: Vec<(String, String)> = ctx
            .inputs
            .iter()
            .filter_map(|(key, value)| match value {
                Value::String(text) if SharedStorage::is_url(text) => {
                    Some((key.clone(), text.clone()))
                }
                _ => None,
            })
            .collect();

        for (field, url) in url_fields {
            let local = self
                .shared_storage
                .download_to_task_dir(&ctx.task_id, &url)
                .await
                .map_err(|err| NodeError::Resource(err.to_string()))?;
            ctx.inputs.insert(
                field,
                Value::String(local.to_string_lossy().to_string()),
            );
        }
        Ok(())
    }

    fn spawn_heartbeat_loop(
        &self,
        task_id: &TaskId,
        node: &NodeName,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let heartbeats = self.heartbeats.clone();
        let task_id = task_id.clone();
        let node = *node;
        let interval = heartbeats.config().interval;
        tokio::spawn(async move {
            let start_time = Utc::now();
            loop {
                let record = HeartbeatRecord {
                    status: "running".to_string(),
                    progress: 0.0,
                    message: format!("executing {node}"),
                    last_update: Utc::now(),
                    start_time,
                };
                if let Err(err) = heartbeats.write(&task_id, &record).await {
                    warn!("Heartbeat write for {task_id} failed: {err}");
                }
                match heartbeats.is_cancel_requested(&task_id).await {
                    Ok(true) => {
                        warn!("Cancellation requested for {task_id}");
                        cancel.cancel();
                        break;
                    }
                    Ok(false) => {}
                    Err(err) => warn!("Cancel flag check for {task_id} failed: {err}"),
                }
                tokio::time::sleep(interval).await;
            }
        })
    }

    /// Terminal bookkeeping shared by every exit path: persist the stage
    /// (with upload side effects on SUCCESS), then deliver the webhook.
    async fn finish(
        &self,
        task_id: &TaskId,
        node: &NodeName,
        resolved_inputs: Map<String, Value>,
        outcome: Result<NodeOutcome, NodeError>,
        duration: f64,
    ) {
        let stage = match outcome {
            Ok(NodeOutcome::Completed(mut output)) => {
                strip_duration_aliases(node, &mut output);
                crate::metrics::observe_execution(node, "success", duration);
                info!("Stage {node} of task {task_id} succeeded in {duration:.2}s");
                StageExecution::success(resolved_inputs, output, duration)
            }
            Ok(NodeOutcome::Skipped { reason }) => {
                crate::metrics::observe_execution(node, "skipped", duration);
                info!("Stage {node} of task {task_id} skipped: {reason}");
                StageExecution::skipped(resolved_inputs)
            }
            Err(err) => {
                crate::metrics::observe_execution(node, err.kind(), duration);
                error!(
                    error_kind = err.kind(),
                    "Stage {node} of task {task_id} failed: {err}"
                );
                StageExecution::failed(resolved_inputs, err.to_string(), duration)
            }
        };
        let stage_status = stage.status;

        let context = match self
            .state
            .record_stage_terminal(task_id, node, stage)
            .await
        {
            Ok(context) => context,
            Err(err) => {
                error!("Failed to persist terminal stage for {task_id}: {err}");
                return;
            }
        };

        let callback_url = context.input_params.callback_url.clone();
        let payload = CallbackPayload {
            task_id: task_id.clone(),
            status: if stage_status == StageStatus::Failed {
                WorkflowStatus::Failed
            } else {
                WorkflowStatus::Completed
            },
            minio_files: collect_remote_files(&context),
            result: context,
            timestamp: Utc::now(),
        };
        let status = self.callbacks.deliver(&callback_url, &payload).await;
        if let Err(err) = self.state.set_callback_status(task_id, status).await {
            error!("Failed to record callback status for {task_id}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use mediaflow_common::clients::callback::RecordingCallbackService;
    use mediaflow_common::config::{GpuLockConfig, HeartbeatConfig, SharedStorageConfig};
    use mediaflow_common::model::{CallbackStatus, InputParams};
    use mediaflow_service_base::queue::TaskDispatch;
    use mediaflow_service_base::storage::blob::memory::InMemoryBlobStorage;
    use mediaflow_service_base::storage::keyvalue::memory::InMemoryKeyValueStorage;
    use mediaflow_service_base::workflow::state::SilentStateManager;
    use mediaflow_service_base::workflow::upload::OutputUploader;
    use mediaflow_service_base::workflow::WorkflowStore;
    use serde_json::json;

    struct Fixture {
        runner: NodeRunner,
        state: SilentStateManager,
        callbacks: Arc<RecordingCallbackService>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(InMemoryKeyValueStorage::new());
        let store = Arc::new(WorkflowStore::new(kv.clone()));
        let silent = SilentStateManager::new(store);
        let uploading = silent.with_side_effects(Arc::new(OutputUploader::new(
            Arc::new(InMemoryBlobStorage::new()),
            true,
        )));
        let callbacks = Arc::new(RecordingCallbackService::succeeding());
        let shared_storage = Arc::new(SharedStorage::new(&SharedStorageConfig {
            root: dir.path().to_path_buf(),
        }));
        let runner = NodeRunner::new(
            uploading,
            Arc::new(GpuLockService::new(kv.clone(), GpuLockConfig::default())),
            Arc::new(HeartbeatService::new(
                kv,
                HeartbeatConfig {
                    interval: std::time::Duration::from_millis(5),
                    timeout: std::time::Duration::from_millis(100),
                },
            )),
            callbacks.clone(),
            shared_storage,
            Arc::new(NodeRegistry::new()),
            Arc::new(ToolsConfig::default()),
            HashMap::new(),
        );
        Fixture {
            runner,
            state: silent,
            callbacks,
            _dir: dir,
        }
    }

    async fn seed_task(
        fixture: &Fixture,
        node: NodeName,
        input_data: serde_json::Value,
    ) -> TaskDispatch {
        let task_id = TaskId::new("t1").unwrap();
        fixture
            .state
            .create_or_touch(
                &task_id,
                InputParams {
                    task_name: node,
                    input_data: input_data.as_object().unwrap().clone(),
                    callback_url: "http://cb/worker".to_string(),
                },
                "/share/workflows/t1".to_string(),
            )
            .await
            .unwrap();
        fixture
            .state
            .mark_stage_pending(&task_id, &node)
            .await
            .unwrap();
        TaskDispatch {
            task_id,
            task_name: node,
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    async fn missing_required_input_fails_the_stage_with_an_input_error() {
        let fixture = fixture();
        let node = NodeName::FfmpegExtractAudio;
        let dispatch = seed_task(&fixture, node, json!({})).await;

        fixture.runner.run(&dispatch).await;

        let context = fixture
            .state
            .get(&dispatch.task_id)
            .await
            .unwrap()
            .unwrap();
        let stage = context.stage(&node).unwrap();
        assert_eq!(stage.status, StageStatus::Failed);
        assert!(stage.error.as_deref().unwrap().contains("Input error"));
        assert!(stage
            .error
            .as_deref()
            .unwrap()
            .contains("video_path"));

        // terminal callback fired and recorded
        assert_eq!(
            fixture.callbacks.delivered_urls().await,
            vec!["http://cb/worker".to_string()]
        );
        let context = fixture
            .state
            .get(&dispatch.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(context.callback_status, CallbackStatus::Sent);
    }

    #[test]
    async fn disabled_optimizer_reports_a_skipped_stage() {
        let fixture = fixture();
        let node = NodeName::WserviceAiOptimizeSubtitles;
        let dispatch = seed_task(
            &fixture,
            node,
            json!({
                "segments_file": "/nonexistent/segments.json",
                "subtitle_optimization": {"enabled": false}
            }),
        )
        .await;

        fixture.runner.run(&dispatch).await;

        let context = fixture
            .state
            .get(&dispatch.task_id)
            .await
            .unwrap()
            .unwrap();
        let stage = context.stage(&node).unwrap();
        assert_eq!(stage.status, StageStatus::Skipped);
        assert!(stage.output.is_empty());
        assert!(stage.error.is_none());
    }

    #[test]
    async fn secrets_are_redacted_in_recorded_inputs() {
        let inputs = json!({
            "audio_path": "/a.wav",
            "hf_api_key": "hf_abcdef",
            "use_paid_api": true
        })
        .as_object()
        .unwrap()
        .clone();
        let redacted = redact_inputs(&inputs);
        assert_eq!(redacted.get("hf_api_key").unwrap(), "****");
        assert_eq!(redacted.get("audio_path").unwrap(), "/a.wav");
    }

    #[test]
    async fn duration_aliases_are_stripped_from_outputs() {
        let mut output = json!({
            "segments_file": "/s.json",
            "transcribe_duration": 12.5,
            "processing_time": 3.0
        })
        .as_object()
        .unwrap()
        .clone();
        strip_duration_aliases(&NodeName::FasterWhisperTranscribeAudio, &mut output);
        assert!(output.contains_key("segments_file"));
        assert!(!output.contains_key("transcribe_duration"));
        assert!(!output.contains_key("processing_time"));
    }
}
