use crate::model::TaskStatusDoc;
use chrono::Utc;
use mediaflow_common::clients::callback::CallbackService;
use mediaflow_common::model::{
    collect_remote_files, CallbackPayload, InputParams, ReuseInfo, StageStatus, TaskId,
    WorkflowContext, WorkflowStatus,
};
use mediaflow_common::node::NodeName;
use mediaflow_common::SafeDisplay;
use mediaflow_service_base::queue::{QueueError, TaskDispatch, TaskQueue};
use mediaflow_service_base::shared_storage::SharedStorage;
use mediaflow_service_base::workflow::state::SilentStateManager;
use mediaflow_service_base::workflow::{reusable_stage, WorkflowError};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum TaskServiceError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Unknown task_name: {0}")]
    UnknownTaskName(String),
    #[error("Task not found: {0}")]
    NotFound(TaskId),
    #[error("State store unavailable: {0}")]
    Store(String),
    #[error("Dispatch queue unavailable: {0}")]
    Queue(String),
}

impl SafeDisplay for TaskServiceError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

impl From<WorkflowError> for TaskServiceError {
    fn from(error: WorkflowError) -> Self {
        match error {
            WorkflowError::NotFound(task_id) => TaskServiceError::NotFound(task_id),
            other => TaskServiceError::Store(other.to_string()),
        }
    }
}

impl From<QueueError> for TaskServiceError {
    fn from(error: QueueError) -> Self {
        TaskServiceError::Queue(error.to_string())
    }
}

/// Outcome of the synchronous part of task creation; everything after the
/// reuse/dispatch decision happens asynchronously.
#[derive(Debug, Clone)]
pub struct CreateTaskOutcome {
    pub task_id: TaskId,
    pub status: WorkflowStatus,
    pub message: String,
    pub reuse_info: Option<ReuseInfo>,
    pub result: Option<WorkflowContext>,
}

pub struct TaskService {
    state: SilentStateManager,
    queue: Arc<dyn TaskQueue>,
    callbacks: Arc<dyn CallbackService>,
    shared_storage: Arc<SharedStorage>,
}

impl TaskService {
    pub fn new(
        state: SilentStateManager,
        queue: Arc<dyn TaskQueue>,
        callbacks: Arc<dyn CallbackService>,
        shared_storage: Arc<SharedStorage>,
    ) -> Self {
        TaskService {
            state,
            queue,
            callbacks,
            shared_storage,
        }
    }

    /// The single-task entrypoint: normalize, decide reuse vs. dispatch,
    /// return immediately.
    pub async fn create_task(
        &self,
        task_name: &str,
        task_id: &str,
        callback: &str,
        input_data: Value,
    ) -> Result<CreateTaskOutcome, TaskServiceError> {
        let node = NodeName::from_str(task_name)
            .map_err(|_| TaskServiceError::UnknownTaskName(task_name.to_string()))?;
        let task_id = TaskId::new(task_id).map_err(TaskServiceError::InvalidRequest)?;
        validate_callback_url(callback)?;
        let input_data = match input_data {
            Value::Object(map) => map,
            other => {
                return Err(TaskServiceError::InvalidRequest(format!(
                    "input_data must be an object, got {}",
                    value_kind(&other)
                )))
            }
        };

        let input_params = InputParams {
            task_name: node,
            input_data,
            callback_url: callback.to_string(),
        };
        let shared_storage_path = self
            .shared_storage
            .task_dir(&task_id)
            .to_string_lossy()
            .to_string();

        let context = self
            .state
            .create_or_touch(&task_id, input_params, shared_storage_path)
            .await?;

        // Reuse probe, in order: valid SUCCESS output wins, an in-flight
        // stage is left alone, anything else is (re-)dispatched.
        if reusable_stage(&context, &node).is_some() {
            info!("Task {task_id} hit the cache for {node}");
            crate::metrics::CACHE_HITS.inc();
            self.fire_callback(context.clone());
            return Ok(CreateTaskOutcome {
                task_id,
                status: WorkflowStatus::Completed,
                message: "任务已命中缓存并完成回调".to_string(),
                reuse_info: Some(ReuseInfo::hit(node, context.updated_at)),
                result: Some(context),
            });
        }

        if let Some(stage) = context.stage(&node) {
            if matches!(stage.status, StageStatus::Pending | StageStatus::Running) {
                return Ok(CreateTaskOutcome {
                    task_id,
                    status: WorkflowStatus::Pending,
                    message: "任务正在处理中，请勿重复提交".to_string(),
                    reuse_info: Some(ReuseInfo::pending(node)),
                    result: None,
                });
            }
        }

        self.dispatch(&task_id, &node).await?;
        Ok(CreateTaskOutcome {
            task_id,
            status: WorkflowStatus::Pending,
            message: "任务已提交，等待处理".to_string(),
            reuse_info: None,
            result: None,
        })
    }

    /// Stage goes to PENDING and is persisted before the enqueue, so a
    /// worker can never observe its dispatch ahead of the state document.
    async fn dispatch(&self, task_id: &TaskId, node: &NodeName) -> Result<(), TaskServiceError> {
        self.state.mark_stage_pending(task_id, node).await?;
        let dispatch = TaskDispatch {
            task_id: task_id.clone(),
            task_name: *node,
            enqueued_at: Utc::now(),
        };
        if let Err(err) = self.queue.enqueue(&dispatch).await {
            let message = format!("Failed to enqueue {node} for task {task_id}: {err}");
            error!("{message}");
            let _ = self.state.set_top_level_error(task_id, message).await;
            return Err(err.into());
        }
        crate::metrics::TASKS_DISPATCHED.inc();
        info!("Dispatched {node} for task {task_id}");
        Ok(())
    }

    /// Deliver the cache-hit callback to the URL from the current request
    /// without holding up the HTTP response.
    fn fire_callback(&self, context: WorkflowContext) {
        let callbacks = self.callbacks.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let task_id = context.workflow_id.clone();
            let callback_url = context.input_params.callback_url.clone();
            let payload = CallbackPayload {
                task_id: task_id.clone(),
                status: WorkflowStatus::Completed,
                minio_files: collect_remote_files(&context),
                result: context,
                timestamp: Utc::now(),
            };
            let status = callbacks.deliver(&callback_url, &payload).await;
            if let Err(err) = state.set_callback_status(&task_id, status).await {
                error!("Failed to record callback status for {task_id}: {err}");
            }
        });
    }

    pub async fn get_status(&self, task_id: &str) -> Result<TaskStatusDoc, TaskServiceError> {
        let task_id = TaskId::new(task_id).map_err(TaskServiceError::InvalidRequest)?;
        let context = self
            .state
            .get(&task_id)
            .await?
            .ok_or(TaskServiceError::NotFound(task_id))?;
        let minio_files = collect_remote_files(&context);
        Ok(TaskStatusDoc {
            context,
            minio_files,
        })
    }
}

fn validate_callback_url(callback: &str) -> Result<(), TaskServiceError> {
    let url = url::Url::parse(callback).map_err(|err| {
        TaskServiceError::InvalidRequest(format!("callback must be an absolute URL: {err}"))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(TaskServiceError::InvalidRequest(format!(
            "callback must be http(s), got {}",
            url.scheme()
        )));
    }
    Ok(())
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use mediaflow_common::clients::callback::RecordingCallbackService;
    use mediaflow_common::config::SharedStorageConfig;
    use mediaflow_common::model::{CallbackStatus, StageExecution};
    use mediaflow_service_base::queue::InMemoryTaskQueue;
    use mediaflow_service_base::storage::keyvalue::memory::InMemoryKeyValueStorage;
    use mediaflow_service_base::workflow::WorkflowStore;
    use serde_json::json;
    use serde_json::Map;
    use std::time::Duration;

    struct Fixture {
        service: TaskService,
        state: SilentStateManager,
        queue: Arc<InMemoryTaskQueue>,
        callbacks: Arc<RecordingCallbackService>,
    }

    fn fixture() -> Fixture {
        let kv = Arc::new(InMemoryKeyValueStorage::new());
        let state = SilentStateManager::new(Arc::new(WorkflowStore::new(kv)));
        let queue = Arc::new(InMemoryTaskQueue::new());
        let callbacks = Arc::new(RecordingCallbackService::succeeding());
        let shared_storage = Arc::new(SharedStorage::new(&SharedStorageConfig {
            root: std::env::temp_dir(),
        }));
        Fixture {
            service: TaskService::new(
                state.clone(),
                queue.clone(),
                callbacks.clone(),
                shared_storage,
            ),
            state,
            queue,
            callbacks,
        }
    }

    fn extract_audio_input() -> Value {
        json!({"video_path": "/share/in/a.mp4"})
    }

    #[test]
    async fn first_submission_dispatches_one_unit_of_work() {
        let fixture = fixture();
        let outcome = fixture
            .service
            .create_task(
                "ffmpeg.extract_audio",
                "t1",
                "http://cb/e1",
                extract_audio_input(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, WorkflowStatus::Pending);
        assert!(outcome.reuse_info.is_none());
        assert_eq!(
            fixture.queue.pending_count(&NodeName::FfmpegExtractAudio),
            1
        );

        let context = fixture
            .state
            .get(&TaskId::new("t1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            context
                .stage(&NodeName::FfmpegExtractAudio)
                .unwrap()
                .status,
            StageStatus::Pending
        );
    }

    #[test]
    async fn cache_hit_returns_result_and_fires_callback_without_enqueue() {
        let fixture = fixture();
        let task_id = TaskId::new("t1").unwrap();
        let node = NodeName::FfmpegExtractAudio;

        // terminal SUCCESS stage from an earlier run
        fixture
            .state
            .create_or_touch(
                &task_id,
                InputParams {
                    task_name: node,
                    input_data: Map::new(),
                    callback_url: "http://cb/e1".to_string(),
                },
                "/share/workflows/t1".to_string(),
            )
            .await
            .unwrap();
        fixture
            .state
            .record_stage_terminal(
                &task_id,
                &node,
                StageExecution::success(
                    Map::new(),
                    json!({"audio_path": "/share/workflows/t1/a.wav"})
                        .as_object()
                        .unwrap()
                        .clone(),
                    1.2,
                ),
            )
            .await
            .unwrap();

        let outcome = fixture
            .service
            .create_task(
                "ffmpeg.extract_audio",
                "t1",
                "http://cb/e2",
                extract_audio_input(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, WorkflowStatus::Completed);
        assert_eq!(outcome.message, "任务已命中缓存并完成回调");
        let reuse_info = outcome.reuse_info.unwrap();
        assert_eq!(reuse_info.reuse_hit, Some(true));
        assert_eq!(reuse_info.source.as_deref(), Some("redis"));
        assert!(outcome.result.is_some());
        assert_eq!(
            fixture.queue.pending_count(&NodeName::FfmpegExtractAudio),
            0
        );

        // callback goes to the URL of the *current* request
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            fixture.callbacks.delivered_urls().await,
            vec!["http://cb/e2".to_string()]
        );
        let context = fixture.state.get(&task_id).await.unwrap().unwrap();
        assert_eq!(context.callback_status, CallbackStatus::Sent);
    }

    #[test]
    async fn pending_duplicate_is_not_re_enqueued() {
        let fixture = fixture();
        fixture
            .service
            .create_task(
                "ffmpeg.extract_audio",
                "t1",
                "http://cb/e1",
                extract_audio_input(),
            )
            .await
            .unwrap();

        let outcome = fixture
            .service
            .create_task(
                "ffmpeg.extract_audio",
                "t1",
                "http://cb/e3",
                extract_audio_input(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, WorkflowStatus::Pending);
        let reuse_info = outcome.reuse_info.unwrap();
        assert_eq!(reuse_info.state.as_deref(), Some("pending"));
        assert_eq!(
            fixture.queue.pending_count(&NodeName::FfmpegExtractAudio),
            1
        );
    }

    #[test]
    async fn failed_stage_is_redispatched() {
        let fixture = fixture();
        let task_id = TaskId::new("t1").unwrap();
        let node = NodeName::FfmpegExtractAudio;

        fixture
            .state
            .create_or_touch(
                &task_id,
                InputParams {
                    task_name: node,
                    input_data: Map::new(),
                    callback_url: "http://cb/e1".to_string(),
                },
                "/share/workflows/t1".to_string(),
            )
            .await
            .unwrap();
        fixture
            .state
            .record_stage_terminal(
                &task_id,
                &node,
                StageExecution::failed(Map::new(), "ffmpeg exited with 1", 0.3),
            )
            .await
            .unwrap();

        let outcome = fixture
            .service
            .create_task(
                "ffmpeg.extract_audio",
                "t1",
                "http://cb/e1",
                extract_audio_input(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, WorkflowStatus::Pending);
        assert!(outcome.reuse_info.is_none());
        assert_eq!(
            fixture.queue.pending_count(&NodeName::FfmpegExtractAudio),
            1
        );
    }

    #[test]
    async fn unknown_task_name_is_rejected() {
        let fixture = fixture();
        let result = fixture
            .service
            .create_task("ffmpeg.not_a_node", "t1", "http://cb/e1", json!({}))
            .await;
        assert!(matches!(
            result,
            Err(TaskServiceError::UnknownTaskName(name)) if name == "ffmpeg.not_a_node"
        ));
    }

    #[test]
    async fn non_http_callback_is_rejected() {
        let fixture = fixture();
        let result = fixture
            .service
            .create_task(
                "ffmpeg.extract_audio",
                "t1",
                "ftp://cb/e1",
                extract_audio_input(),
            )
            .await;
        assert!(matches!(result, Err(TaskServiceError::InvalidRequest(_))));
    }
}
