use crate::api::ApiTags;
use crate::model::{
    ErrorBody, GpuLockStatusResponse, HeartbeatsResponse, LockHolderView, MonitorStatsView,
    ReleaseLockRequest, ReleaseLockResponse, StatisticsResponse,
};
use mediaflow_common::metrics::api::TraceErrorKind;
use mediaflow_common::node::ALL_NODE_NAMES;
use mediaflow_common::recorded_http_api_request;
use mediaflow_service_base::lock::{GpuLockService, HeartbeatService, GPU_LOCK_KEY};
use mediaflow_service_base::queue::TaskQueue;
use poem_openapi::payload::Json;
use poem_openapi::types::Any;
use poem_openapi::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::Instrument;

#[derive(ApiResponse, Debug, Clone)]
pub enum MonitoringApiError {
    /// Unknown lock key
    #[oai(status = 400)]
    BadRequest(Json<ErrorBody>),
    /// Backing store unavailable
    #[oai(status = 503)]
    Unavailable(Json<ErrorBody>),
}

impl TraceErrorKind for MonitoringApiError {
    fn trace_error_kind(&self) -> &'static str {
        match self {
            MonitoringApiError::BadRequest(_) => "BadRequest",
            MonitoringApiError::Unavailable(_) => "Unavailable",
        }
    }
}

fn unavailable(error: impl std::fmt::Display) -> MonitoringApiError {
    MonitoringApiError::Unavailable(Json(ErrorBody {
        error: error.to_string(),
    }))
}

type Result<T> = std::result::Result<T, MonitoringApiError>;

/// Read-only views of the GPU lock, heartbeats and recovery counters, plus
/// the single mutating operator action: forced lock release.
pub struct MonitoringApi {
    lock_service: Arc<GpuLockService>,
    heartbeat_service: Arc<HeartbeatService>,
    queue: Arc<dyn TaskQueue>,
}

#[OpenApi(prefix_path = "/api/v1/monitoring", tag = ApiTags::Monitoring)]
impl MonitoringApi {
    pub fn new(
        lock_service: Arc<GpuLockService>,
        heartbeat_service: Arc<HeartbeatService>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            lock_service,
            heartbeat_service,
            queue,
        }
    }

    /// Current GPU lock holder and acquisition counters
    #[oai(
        path = "/gpu-lock/status",
        method = "get",
        operation_id = "gpu_lock_status"
    )]
    async fn gpu_lock_status(&self) -> Result<Json<GpuLockStatusResponse>> {
        let holder = self
            .lock_service
            .current_holder()
            .await
            .map_err(unavailable)?;
        let stats = self.lock_service.stats().await.map_err(unavailable)?;
        Ok(Json(GpuLockStatusResponse {
            holder: holder.map(|holder| LockHolderView {
                age_seconds: holder.age().as_secs_f64(),
                token: holder.token,
                stage: holder.stage,
                task_id: holder.task_id,
                acquire_ts_millis: holder.acquire_ts_millis,
            }),
            stats: stats.into(),
        }))
    }

    /// Manually force-release a lock
    ///
    /// Uses the same atomic check-and-delete as the monitor: if the holder
    /// changed since it was observed, the release is a no-op.
    #[oai(path = "/release-lock", method = "post", operation_id = "release_lock")]
    async fn release_lock(
        &self,
        payload: Json<ReleaseLockRequest>,
    ) -> Result<Json<ReleaseLockResponse>> {
        let record = recorded_http_api_request!("release_lock", lock_key = payload.0.lock_key);
        let response = async {
            if payload.0.lock_key != GPU_LOCK_KEY {
                return Err(MonitoringApiError::BadRequest(Json(ErrorBody {
                    error: format!("unknown lock key: {}", payload.0.lock_key),
                })));
            }
            let holder = self
                .lock_service
                .current_holder()
                .await
                .map_err(unavailable)?;
            match holder {
                None => Ok(Json(ReleaseLockResponse {
                    released: false,
                    message: "lock is not held".to_string(),
                })),
                Some(holder) => {
                    let released = self
                        .lock_service
                        .force_release(&payload.0.lock_key, &holder.token)
                        .await
                        .map_err(unavailable)?;
                    Ok(Json(ReleaseLockResponse {
                        released,
                        message: if released {
                            format!("released lock held by {}", holder.token)
                        } else {
                            "holder changed, nothing released".to_string()
                        },
                    }))
                }
            }
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Snapshot of all task heartbeats
    #[oai(
        path = "/heartbeat/all",
        method = "get",
        operation_id = "all_heartbeats"
    )]
    async fn all_heartbeats(&self) -> Result<Json<HeartbeatsResponse>> {
        let records = self
            .heartbeat_service
            .read_all()
            .await
            .map_err(unavailable)?;
        let heartbeats: BTreeMap<_, _> = records.into_iter().collect();
        Ok(Json(HeartbeatsResponse {
            heartbeats: Any(heartbeats),
        }))
    }

    /// Operational counters and queue depths
    #[oai(path = "/statistics", method = "get", operation_id = "statistics")]
    async fn statistics(&self) -> Result<Json<StatisticsResponse>> {
        let stats: MonitorStatsView = self
            .lock_service
            .stats()
            .await
            .map_err(unavailable)?
            .into();
        let mut queue_depths = BTreeMap::new();
        for node in ALL_NODE_NAMES {
            let depth = self.queue.depth(node).await.map_err(unavailable)?;
            queue_depths.insert(node.as_str().to_string(), depth);
        }
        Ok(Json(StatisticsResponse {
            stats,
            queue_depths: Any(queue_depths),
        }))
    }
}
