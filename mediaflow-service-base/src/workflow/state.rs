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

use super::upload::OutputUploader;
use super::{WorkflowError, WorkflowStore};
use chrono::Utc;
use mediaflow_common::model::{
    CallbackStatus, InputParams, StageExecution, StageStatus, TaskId, WorkflowContext,
};
use mediaflow_common::node::NodeName;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Shared machinery of the two state-manager handles: the sole writer of
/// workflow documents, serializing writes per task id.
pub struct StateManagerCore {
    store: Arc<WorkflowStore>,
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl StateManagerCore {
    fn new(store: Arc<WorkflowStore>) -> Self {
        StateManagerCore {
            store,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    fn task_lock(&self, task_id: &TaskId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.write_locks.lock().unwrap();
        locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<WorkflowContext>, WorkflowError> {
        self.store.get(task_id).await
    }

    /// Creates the document if absent. On an existing document the stages
    /// are left untouched; `input_params` (and with it the callback URL) are
    /// replaced by the current request's values.
    async fn create_or_touch(
        &self,
        task_id: &TaskId,
        input_params: InputParams,
        shared_storage_path: String,
    ) -> Result<WorkflowContext, WorkflowError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let context = match self.store.get(task_id).await? {
            Some(mut existing) => {
                existing.input_params = input_params;
                existing.callback_status = CallbackStatus::Pending;
                existing.updated_at = now;
                existing
            }
            None => {
                info!("Creating workflow document for task {task_id}");
                WorkflowContext::new(task_id.clone(), input_params, shared_storage_path, now)
            }
        };
        self.store.set(&context).await?;
        Ok(context)
    }

    async fn mark_stage_pending(
        &self,
        task_id: &TaskId,
        node: &NodeName,
    ) -> Result<WorkflowContext, WorkflowError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let mut context = self.store.get_existing(task_id).await?;
        context.set_stage(node, StageExecution::pending(), Utc::now());
        self.store.set(&context).await?;
        Ok(context)
    }

    async fn record_stage_start(
        &self,
        task_id: &TaskId,
        node: &NodeName,
        resolved_inputs: Map<String, Value>,
    ) -> Result<(), WorkflowError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let mut context = self.store.get_existing(task_id).await?;
        context.set_stage(node, StageExecution::running(resolved_inputs), Utc::now());
        self.store.set(&context).await?;
        Ok(())
    }

    /// Overwrites the stage with its terminal record; a FAILED stage being
    /// re-run is overwritten the same way.
    async fn record_stage_terminal(
        &self,
        task_id: &TaskId,
        node: &NodeName,
        mut stage: StageExecution,
        uploader: Option<&OutputUploader>,
    ) -> Result<WorkflowContext, WorkflowError> {
        if stage.status == StageStatus::Success {
            if let Some(uploader) = uploader {
                let custom_path_fields = node.descriptor().custom_path_fields;
                uploader
                    .apply(task_id, custom_path_fields, &mut stage.output)
                    .await;
            }
        }

        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let mut context = self.store.get_existing(task_id).await?;
        context.set_stage(node, stage, Utc::now());
        self.store.set(&context).await?;
        Ok(context)
    }

    async fn set_top_level_error(
        &self,
        task_id: &TaskId,
        error: String,
    ) -> Result<(), WorkflowError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let mut context = self.store.get_existing(task_id).await?;
        context.error = Some(error);
        context.recompute_status();
        context.updated_at = Utc::now();
        self.store.set(&context).await?;
        Ok(())
    }

    async fn set_callback_status(
        &self,
        task_id: &TaskId,
        status: CallbackStatus,
    ) -> Result<(), WorkflowError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let mut context = self.store.get_existing(task_id).await?;
        context.callback_status = status;
        context.updated_at = Utc::now();
        self.store.set(&context).await?;
        Ok(())
    }
}

/// State-manager handle without upload side effects. This is the only handle
/// the gateway is constructed with: HTTP threads never compress or upload,
/// they only write state.
#[derive(Clone)]
pub struct SilentStateManager {
    core: Arc<StateManagerCore>,
}

impl SilentStateManager {
    pub fn new(store: Arc<WorkflowStore>) -> Self {
        SilentStateManager {
            core: Arc::new(StateManagerCore::new(store)),
        }
    }

    /// Upgrade to a side-effecting handle sharing the same write locks.
    /// Workers do this once at startup; the gateway never sees the result.
    pub fn with_side_effects(&self, uploader: Arc<OutputUploader>) -> UploadingStateManager {
        UploadingStateManager {
            core: self.core.clone(),
            uploader,
        }
    }

    pub async fn get(&self, task_id: &TaskId) -> Result<Option<WorkflowContext>, WorkflowError> {
        self.core.get(task_id).await
    }

    pub async fn create_or_touch(
        &self,
        task_id: &TaskId,
        input_params: InputParams,
        shared_storage_path: String,
    ) -> Result<WorkflowContext, WorkflowError> {
        self.core
            .create_or_touch(task_id, input_params, shared_storage_path)
            .await
    }

    pub async fn mark_stage_pending(
        &self,
        task_id: &TaskId,
        node: &NodeName,
    ) -> Result<WorkflowContext, WorkflowError> {
        self.core.mark_stage_pending(task_id, node).await
    }

    /// Terminal write without side effects, used by the monitor for timeout
    /// failures. SUCCESS transitions with produced files belong to the
    /// uploading handle.
    pub async fn record_stage_terminal(
        &self,
        task_id: &TaskId,
        node: &NodeName,
        stage: StageExecution,
    ) -> Result<WorkflowContext, WorkflowError> {
        self.core
            .record_stage_terminal(task_id, node, stage, None)
            .await
    }

    pub async fn set_top_level_error(
        &self,
        task_id: &TaskId,
        error: String,
    ) -> Result<(), WorkflowError> {
        self.core.set_top_level_error(task_id, error).await
    }

    pub async fn set_callback_status(
        &self,
        task_id: &TaskId,
        status: CallbackStatus,
    ) -> Result<(), WorkflowError> {
        self.core.set_callback_status(task_id, status).await
    }
}

/// State-manager handle owned by workers: terminal SUCCESS transitions run
/// the object-store side effects before the document is persisted.
#[derive(Clone)]
pub struct UploadingStateManager {
    core: Arc<StateManagerCore>,
    uploader: Arc<OutputUploader>,
}

impl UploadingStateManager {
    pub fn new(store: Arc<WorkflowStore>, uploader: Arc<OutputUploader>) -> Self {
        UploadingStateManager {
            core: Arc::new(StateManagerCore::new(store)),
            uploader,
        }
    }

    pub async fn get(&self, task_id: &TaskId) -> Result<Option<WorkflowContext>, WorkflowError> {
        self.core.get(task_id).await
    }

    pub async fn record_stage_start(
        &self,
        task_id: &TaskId,
        node: &NodeName,
        resolved_inputs: Map<String, Value>,
    ) -> Result<(), WorkflowError> {
        self.core
            .record_stage_start(task_id, node, resolved_inputs)
            .await
    }

    pub async fn record_stage_terminal(
        &self,
        task_id: &TaskId,
        node: &NodeName,
        stage: StageExecution,
    ) -> Result<WorkflowContext, WorkflowError> {
        self.core
            .record_stage_terminal(task_id, node, stage, Some(self.uploader.as_ref()))
            .await
    }

    pub async fn set_callback_status(
        &self,
        task_id: &TaskId,
        status: CallbackStatus,
    ) -> Result<(), WorkflowError> {
        self.core.set_callback_status(task_id, status).await
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::storage::blob::memory::InMemoryBlobStorage;
    use crate::storage::keyvalue::memory::InMemoryKeyValueStorage;
    use crate::workflow::reusable_stage;
    use serde_json::json;

    fn manager() -> SilentStateManager {
        let kv = Arc::new(InMemoryKeyValueStorage::new());
        SilentStateManager::new(Arc::new(WorkflowStore::new(kv)))
    }

    fn input_params(callback_url: &str) -> InputParams {
        InputParams {
            task_name: NodeName::FfmpegExtractAudio,
            input_data: json!({"video_path": "/share/in/a.mp4"})
                .as_object()
                .unwrap()
                .clone(),
            callback_url: callback_url.to_string(),
        }
    }

    #[test]
    async fn touch_replaces_callback_but_keeps_stages() {
        let manager = manager();
        let task_id = TaskId::new("t1").unwrap();
        let node = NodeName::FfmpegExtractAudio;

        manager
            .create_or_touch(&task_id, input_params("http://cb/e1"), "/share/workflows/t1".into())
            .await
            .unwrap();
        manager.mark_stage_pending(&task_id, &node).await.unwrap();
        manager
            .record_stage_terminal(
                &task_id,
                &node,
                StageExecution::success(
                    Map::new(),
                    json!({"audio_path": "/share/workflows/t1/a.wav"})
                        .as_object()
                        .unwrap()
                        .clone(),
                    1.0,
                ),
            )
            .await
            .unwrap();

        let touched = manager
            .create_or_touch(&task_id, input_params("http://cb/e2"), "/share/workflows/t1".into())
            .await
            .unwrap();

        assert_eq!(touched.input_params.callback_url, "http://cb/e2");
        assert_eq!(
            touched.stage(&node).unwrap().status,
            StageStatus::Success
        );
        assert!(reusable_stage(&touched, &node).is_some());
    }

    #[test]
    async fn success_through_uploading_handle_attaches_urls() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("a.wav");
        tokio::fs::write(&audio, b"pcm").await.unwrap();

        let kv = Arc::new(InMemoryKeyValueStorage::new());
        let store = Arc::new(WorkflowStore::new(kv));
        let silent = SilentStateManager::new(store);
        let uploading = silent.with_side_effects(Arc::new(OutputUploader::new(
            Arc::new(InMemoryBlobStorage::new()),
            true,
        )));

        let task_id = TaskId::new("t1").unwrap();
        let node = NodeName::FfmpegExtractAudio;
        silent
            .create_or_touch(&task_id, input_params("http://cb/e1"), "/share/workflows/t1".into())
            .await
            .unwrap();

        let context = uploading
            .record_stage_terminal(
                &task_id,
                &node,
                StageExecution::success(
                    Map::new(),
                    json!({"audio_path": audio.to_string_lossy()})
                        .as_object()
                        .unwrap()
                        .clone(),
                    0.5,
                ),
            )
            .await
            .unwrap();

        let output = &context.stage(&node).unwrap().output;
        assert_eq!(
            output.get("audio_path_minio_url").unwrap().as_str().unwrap(),
            "memory://t1/a.wav"
        );
        assert_eq!(
            output.get("audio_path").unwrap().as_str().unwrap(),
            audio.to_string_lossy()
        );
    }

    #[test]
    async fn failed_stage_is_overwritten_on_redispatch() {
        let manager = manager();
        let task_id = TaskId::new("t1").unwrap();
        let node = NodeName::FfmpegExtractAudio;

        manager
            .create_or_touch(&task_id, input_params("http://cb/e1"), "/share/workflows/t1".into())
            .await
            .unwrap();
        manager
            .record_stage_terminal(
                &task_id,
                &node,
                StageExecution::failed(Map::new(), "ffmpeg exited with 1", 0.2),
            )
            .await
            .unwrap();

        let context = manager.get(&task_id).await.unwrap().unwrap();
        assert!(reusable_stage(&context, &node).is_none());

        let context = manager
            .record_stage_terminal(
                &task_id,
                &node,
                StageExecution::success(
                    Map::new(),
                    json!({"audio_path": "/share/workflows/t1/a.wav"})
                        .as_object()
                        .unwrap()
                        .clone(),
                    0.9,
                ),
            )
            .await
            .unwrap();
        let stage = context.stage(&node).unwrap();
        assert_eq!(stage.status, StageStatus::Success);
        assert!(stage.error.is_none());
    }
}
