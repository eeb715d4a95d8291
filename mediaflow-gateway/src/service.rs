pub mod file;
pub mod monitor;
pub mod task;

use crate::config::GatewayConfig;
use file::FileService;
use mediaflow_common::clients::callback::{CallbackService, CallbackServiceDefault};
use mediaflow_common::redis::RedisPool;
use mediaflow_service_base::config::BlobStorageConfig;
use mediaflow_service_base::lock::{GpuLockService, HeartbeatService};
use mediaflow_service_base::queue::{RedisTaskQueue, TaskQueue};
use mediaflow_service_base::shared_storage::SharedStorage;
use mediaflow_service_base::storage::blob::fs::FileSystemBlobStorage;
use mediaflow_service_base::storage::blob::memory::InMemoryBlobStorage;
use mediaflow_service_base::storage::blob::s3::S3BlobStorage;
use mediaflow_service_base::storage::blob::BlobStorage;
use mediaflow_service_base::storage::keyvalue::redis::RedisKeyValueStorage;
use mediaflow_service_base::storage::keyvalue::KeyValueStorage;
use mediaflow_service_base::workflow::state::SilentStateManager;
use mediaflow_service_base::workflow::WorkflowStore;
use monitor::GpuLockMonitor;
use std::sync::Arc;
use task::TaskService;

#[derive(Clone)]
pub struct Services {
    pub task_service: Arc<TaskService>,
    pub file_service: Arc<FileService>,
    pub monitor: Arc<GpuLockMonitor>,
    pub lock_service: Arc<GpuLockService>,
    pub heartbeat_service: Arc<HeartbeatService>,
    pub queue: Arc<dyn TaskQueue>,
}

impl Services {
    pub async fn new(config: &GatewayConfig) -> Result<Services, String> {
        let redis_pool = RedisPool::configured(&config.redis)
            .await
            .map_err(|err| format!("Failed to connect to Redis: {err}"))?;

        let kv: Arc<dyn KeyValueStorage> =
            Arc::new(RedisKeyValueStorage::new(redis_pool.clone()));

        let blob_storage: Arc<dyn BlobStorage> = match &config.blob_storage {
            BlobStorageConfig::S3(s3) => Arc::new(S3BlobStorage::new(s3.clone()).await),
            BlobStorageConfig::LocalFileSystem(fs) => Arc::new(
                FileSystemBlobStorage::new(&fs.root)
                    .await
                    .map_err(|err| format!("Failed to open blob storage root: {err}"))?,
            ),
            BlobStorageConfig::InMemory(_) => Arc::new(InMemoryBlobStorage::new()),
        };

        let shared_storage = Arc::new(SharedStorage::new(&config.shared_storage));
        let store = Arc::new(WorkflowStore::new(kv.clone()));

        // The gateway only ever holds the silent state-manager handle; object
        // uploads stay on the worker side.
        let state = SilentStateManager::new(store);

        let queue: Arc<dyn TaskQueue> = Arc::new(RedisTaskQueue::new(redis_pool));
        let callbacks: Arc<dyn CallbackService> =
            Arc::new(CallbackServiceDefault::new(config.callback.clone()));

        let lock_service = Arc::new(GpuLockService::new(kv.clone(), config.gpu_lock.clone()));
        let heartbeat_service = Arc::new(HeartbeatService::new(
            kv.clone(),
            config.gpu_lock_monitor.heartbeat.clone(),
        ));

        let task_service = Arc::new(TaskService::new(
            state.clone(),
            queue.clone(),
            callbacks.clone(),
            shared_storage.clone(),
        ));

        let file_service = Arc::new(FileService::new(blob_storage, shared_storage));

        let monitor = Arc::new(GpuLockMonitor::new(
            lock_service.clone(),
            heartbeat_service.clone(),
            state,
            callbacks,
            config.gpu_lock_monitor.clone(),
        ));

        Ok(Services {
            task_service,
            file_service,
            monitor,
            lock_service,
            heartbeat_service,
            queue,
        })
    }
}
