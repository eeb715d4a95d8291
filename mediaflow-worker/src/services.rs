use crate::config::WorkerConfig;
use crate::executor::NodeRunner;
use crate::nodes::NodeRegistry;
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
use mediaflow_service_base::workflow::upload::OutputUploader;
use mediaflow_service_base::workflow::WorkflowStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct Services {
    pub runner: Arc<NodeRunner>,
    pub queue: Arc<dyn TaskQueue>,
}

impl Services {
    pub async fn new(config: &WorkerConfig) -> Result<Services, String> {
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

        // Workers own the produced files, so they get the side-effecting
        // state-manager handle.
        let uploader = Arc::new(OutputUploader::new(
            blob_storage,
            config.core.auto_upload_to_minio,
        ));
        let state = SilentStateManager::new(store).with_side_effects(uploader);

        let queue: Arc<dyn TaskQueue> = Arc::new(RedisTaskQueue::new(redis_pool));
        let callbacks: Arc<dyn CallbackService> =
            Arc::new(CallbackServiceDefault::new(config.callback.clone()));

        let lock = Arc::new(GpuLockService::new(kv.clone(), config.gpu_lock.clone()));
        let heartbeats = Arc::new(HeartbeatService::new(kv, config.heartbeat.clone()));

        let runner = Arc::new(NodeRunner::new(
            state,
            lock,
            heartbeats,
            callbacks,
            shared_storage,
            Arc::new(NodeRegistry::new()),
            Arc::new(config.tools.clone()),
            config.node_defaults.clone(),
        ));

        Ok(Services { runner, queue })
    }
}
