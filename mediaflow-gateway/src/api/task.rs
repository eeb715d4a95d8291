use crate::api::ApiTags;
use crate::model::{CreateTaskRequest, CreateTaskResponse, ErrorBody, ErrorsBody, TaskStatusDoc};
use crate::service::task::{TaskService, TaskServiceError};
use mediaflow_common::metrics::api::TraceErrorKind;
use mediaflow_common::recorded_http_api_request;
use poem_openapi::param::Path;
use poem_openapi::payload::Json;
use poem_openapi::types::Any;
use poem_openapi::*;
use std::sync::Arc;
use tracing::Instrument;

#[derive(ApiResponse, Debug, Clone)]
pub enum TaskApiError {
    /// Invalid request, returning with a list of issues detected in the request
    #[oai(status = 400)]
    BadRequest(Json<ErrorsBody>),
    /// Task not found
    #[oai(status = 404)]
    NotFound(Json<ErrorBody>),
    /// Internal server error
    #[oai(status = 500)]
    InternalError(Json<ErrorBody>),
    /// State store or dispatch queue unavailable
    #[oai(status = 503)]
    Unavailable(Json<ErrorBody>),
}

impl TraceErrorKind for TaskApiError {
    fn trace_error_kind(&self) -> &'static str {
        match self {
            TaskApiError::BadRequest(_) => "BadRequest",
            TaskApiError::NotFound(_) => "NotFound",
            TaskApiError::InternalError(_) => "InternalError",
            TaskApiError::Unavailable(_) => "Unavailable",
        }
    }
}

impl From<TaskServiceError> for TaskApiError {
    fn from(value: TaskServiceError) -> Self {
        match &value {
            TaskServiceError::InvalidRequest(_) | TaskServiceError::UnknownTaskName(_) => {
                TaskApiError::BadRequest(Json(ErrorsBody {
                    errors: vec![value.to_string()],
                }))
            }
            TaskServiceError::NotFound(_) => TaskApiError::NotFound(Json(ErrorBody {
                error: value.to_string(),
            })),
            TaskServiceError::Store(_) | TaskServiceError::Queue(_) => {
                TaskApiError::Unavailable(Json(ErrorBody {
                    error: value.to_string(),
                }))
            }
        }
    }
}

type Result<T> = std::result::Result<T, TaskApiError>;

pub struct TaskApi {
    task_service: Arc<TaskService>,
}

#[OpenApi(prefix_path = "/v1/tasks", tag = ApiTags::Task)]
impl TaskApi {
    pub fn new(task_service: Arc<TaskService>) -> Self {
        Self { task_service }
    }

    /// Submit a single-node task
    ///
    /// Accepts the task, decides between reusing a prior successful run and
    /// dispatching a new one, and returns immediately. The terminal state is
    /// delivered to the `callback` URL; a cache hit returns the full cached
    /// workflow context right away.
    #[oai(path = "/", method = "post", operation_id = "create_task")]
    async fn create_task(&self, payload: Json<CreateTaskRequest>) -> Result<Json<CreateTaskResponse>> {
        let record = recorded_http_api_request!(
            "create_task",
            task_id = payload.0.task_id,
            task_name = payload.0.task_name,
        );
        let response = self
            .task_service
            .create_task(
                &payload.0.task_name,
                &payload.0.task_id,
                &payload.0.callback,
                payload.0.input_data.0,
            )
            .instrument(record.span.clone())
            .await
            .map_err(TaskApiError::from)
            .map(|outcome| {
                Json(CreateTaskResponse {
                    task_id: outcome.task_id.to_string(),
                    status: outcome.status.to_string(),
                    message: outcome.message,
                    reuse_info: outcome.reuse_info.map(Any),
                    result: outcome.result.map(Any),
                })
            });
        record.result(response)
    }

    /// Get the full state of a task
    #[oai(
        path = "/:task_id/status",
        method = "get",
        operation_id = "get_task_status"
    )]
    async fn get_task_status(&self, task_id: Path<String>) -> Result<Json<Any<TaskStatusDoc>>> {
        let record = recorded_http_api_request!("get_task_status", task_id = task_id.0);
        let response = self
            .task_service
            .get_status(&task_id.0)
            .instrument(record.span.clone())
            .await
            .map_err(TaskApiError::from)
            .map(|doc| Json(Any(doc)));
        record.result(response)
    }

    /// Get the result of a task
    ///
    /// Alias of the status endpoint.
    #[oai(
        path = "/:task_id/result",
        method = "get",
        operation_id = "get_task_result"
    )]
    async fn get_task_result(&self, task_id: Path<String>) -> Result<Json<Any<TaskStatusDoc>>> {
        let record = recorded_http_api_request!("get_task_result", task_id = task_id.0);
        let response = self
            .task_service
            .get_status(&task_id.0)
            .instrument(record.span.clone())
            .await
            .map_err(TaskApiError::from)
            .map(|doc| Json(Any(doc)));
        record.result(response)
    }
}
