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

pub mod state;
pub mod upload;

use crate::storage::keyvalue::{KeyValueStorage, KeyValueStorageError};
use mediaflow_common::model::{StageExecution, StageStatus, TaskId, WorkflowContext};
use mediaflow_common::node::{can_reuse, NodeName};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Storage(#[from] KeyValueStorageError),
    #[error("workflow document for {0} is corrupted: {1}")]
    Codec(TaskId, String),
    #[error("no workflow found for task {0}")]
    NotFound(TaskId),
}

fn workflow_key(task_id: &TaskId) -> String {
    format!("workflow:{task_id}")
}

/// CRUD for the `workflow:<task_id>` documents. All mutation goes through the
/// state manager; this type is read-only for everyone else.
pub struct WorkflowStore {
    kv: Arc<dyn KeyValueStorage>,
}

impl WorkflowStore {
    pub fn new(kv: Arc<dyn KeyValueStorage>) -> Self {
        WorkflowStore { kv }
    }

    pub async fn get(&self, task_id: &TaskId) -> Result<Option<WorkflowContext>, WorkflowError> {
        match self.kv.get(&workflow_key(task_id)).await? {
            Some(serialized) => {
                let context = serde_json::from_str(&serialized)
                    .map_err(|err| WorkflowError::Codec(task_id.clone(), err.to_string()))?;
                Ok(Some(context))
            }
            None => Ok(None),
        }
    }

    pub async fn get_existing(&self, task_id: &TaskId) -> Result<WorkflowContext, WorkflowError> {
        self.get(task_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(task_id.clone()))
    }

    pub(crate) async fn set(&self, context: &WorkflowContext) -> Result<(), WorkflowError> {
        let serialized = serde_json::to_string(context)
            .map_err(|err| WorkflowError::Codec(context.workflow_id.clone(), err.to_string()))?;
        self.kv
            .set(&workflow_key(&context.workflow_id), &serialized)
            .await?;
        Ok(())
    }
}

/// The reuse probe: a stage satisfies the cache-hit policy iff it ended in
/// SUCCESS and every declared required output field is present and non-empty.
pub fn reusable_stage<'a>(
    context: &'a WorkflowContext,
    node: &NodeName,
) -> Option<&'a StageExecution> {
    let stage = context.stage(node)?;
    if stage.status == StageStatus::Success && can_reuse(&node.descriptor(), &stage.output) {
        Some(stage)
    } else {
        None
    }
}
