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

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mediaflow_common::model::TaskId;
use mediaflow_common::node::NodeName;
use mediaflow_common::redis::RedisPool;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
    #[error("queue payload is corrupted: {0}")]
    Codec(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(error: redis::RedisError) -> Self {
        QueueError::Backend(error.to_string())
    }
}

/// One unit of work on a node topic. The workflow document carries the
/// actual inputs; the queue only routes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDispatch {
    pub task_id: TaskId,
    pub task_name: NodeName,
    pub enqueued_at: DateTime<Utc>,
}

/// A dispatch popped from a topic, parked on the consumer's processing list
/// until it is acked. Losing the consumer leaves the raw payload on the
/// processing list for recovery, giving at-least-once delivery.
#[derive(Debug, Clone)]
pub struct DeliveredDispatch {
    pub dispatch: TaskDispatch,
    raw: String,
    processing_key: String,
}

/// Durable per-node work queue with at-least-once delivery.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, dispatch: &TaskDispatch) -> Result<(), QueueError>;

    /// Pop one dispatch for the node, blocking up to `timeout`.
    async fn dequeue(
        &self,
        node: &NodeName,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<DeliveredDispatch>, QueueError>;

    /// Acknowledge a delivered dispatch, removing it from the processing
    /// list.
    async fn ack(&self, delivery: &DeliveredDispatch) -> Result<(), QueueError>;

    async fn depth(&self, node: &NodeName) -> Result<u64, QueueError>;
}

fn processing_key(node: &NodeName, consumer: &str) -> String {
    format!("{}:processing:{consumer}", node.queue_topic())
}

/// Redis-list implementation: `LPUSH` onto `task_queue:<node>`, `BLMOVE`
/// into the consumer's processing list, `LREM` on ack.
pub struct RedisTaskQueue {
    pool: RedisPool,
}

impl RedisTaskQueue {
    pub fn new(pool: RedisPool) -> Self {
        RedisTaskQueue { pool }
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, dispatch: &TaskDispatch) -> Result<(), QueueError> {
        let payload =
            serde_json::to_string(dispatch).map_err(|err| QueueError::Codec(err.to_string()))?;
        let mut connection = self.pool.connection();
        let _: () = redis::cmd("LPUSH")
            .arg(self.pool.prefixed_key(&dispatch.task_name.queue_topic()))
            .arg(payload)
            .query_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn dequeue(
        &self,
        node: &NodeName,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<DeliveredDispatch>, QueueError> {
        let processing = processing_key(node, consumer);
        let mut connection = self.pool.connection();
        let raw: Option<String> = redis::cmd("BLMOVE")
            .arg(self.pool.prefixed_key(&node.queue_topic()))
            .arg(self.pool.prefixed_key(&processing))
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut connection)
            .await?;
        match raw {
            Some(raw) => {
                let dispatch = serde_json::from_str(&raw)
                    .map_err(|err| QueueError::Codec(err.to_string()))?;
                Ok(Some(DeliveredDispatch {
                    dispatch,
                    raw,
                    processing_key: processing,
                }))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery: &DeliveredDispatch) -> Result<(), QueueError> {
        let mut connection = self.pool.connection();
        let _: () = redis::cmd("LREM")
            .arg(self.pool.prefixed_key(&delivery.processing_key))
            .arg(1)
            .arg(&delivery.raw)
            .query_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn depth(&self, node: &NodeName) -> Result<u64, QueueError> {
        let mut connection = self.pool.connection();
        let depth: u64 = redis::cmd("LLEN")
            .arg(self.pool.prefixed_key(&node.queue_topic()))
            .query_async(&mut connection)
            .await?;
        Ok(depth)
    }
}

/// In-process queue used by tests; same ack semantics as the Redis
/// implementation.
#[derive(Default)]
pub struct InMemoryTaskQueue {
    topics: Mutex<HashMap<String, VecDeque<String>>>,
    processing: Mutex<HashMap<String, Vec<String>>>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self, node: &NodeName) -> usize {
        self.topics
            .lock()
            .unwrap()
            .get(&node.queue_topic())
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    pub fn processing_count(&self) -> usize {
        self.processing
            .lock()
            .unwrap()
            .values()
            .map(|list| list.len())
            .sum()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, dispatch: &TaskDispatch) -> Result<(), QueueError> {
        let payload =
            serde_json::to_string(dispatch).map_err(|err| QueueError::Codec(err.to_string()))?;
        self.topics
            .lock()
            .unwrap()
            .entry(dispatch.task_name.queue_topic())
            .or_default()
            .push_front(payload);
        Ok(())
    }

    async fn dequeue(
        &self,
        node: &NodeName,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<DeliveredDispatch>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let raw = {
                let mut topics = self.topics.lock().unwrap();
                topics
                    .get_mut(&node.queue_topic())
                    .and_then(|queue| queue.pop_back())
            };
            if let Some(raw) = raw {
                let processing = processing_key(node, consumer);
                self.processing
                    .lock()
                    .unwrap()
                    .entry(processing.clone())
                    .or_default()
                    .push(raw.clone());
                let dispatch = serde_json::from_str(&raw)
                    .map_err(|err| QueueError::Codec(err.to_string()))?;
                return Ok(Some(DeliveredDispatch {
                    dispatch,
                    raw,
                    processing_key: processing,
                }));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn ack(&self, delivery: &DeliveredDispatch) -> Result<(), QueueError> {
        let mut processing = self.processing.lock().unwrap();
        if let Some(list) = processing.get_mut(&delivery.processing_key) {
            if let Some(position) = list.iter().position(|raw| raw == &delivery.raw) {
                list.remove(position);
            }
        }
        Ok(())
    }

    async fn depth(&self, node: &NodeName) -> Result<u64, QueueError> {
        Ok(self.pending_count(node) as u64)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn dispatch(task: &str) -> TaskDispatch {
        TaskDispatch {
            task_id: TaskId::new(task).unwrap(),
            task_name: NodeName::FfmpegExtractAudio,
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    async fn dispatches_are_delivered_in_fifo_order_and_acked() {
        let queue = InMemoryTaskQueue::new();
        queue.enqueue(&dispatch("t1")).await.unwrap();
        queue.enqueue(&dispatch("t2")).await.unwrap();

        let node = NodeName::FfmpegExtractAudio;
        let first = queue
            .dequeue(&node, "w0", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.dispatch.task_id.as_str(), "t1");
        assert_eq!(queue.processing_count(), 1);

        queue.ack(&first).await.unwrap();
        assert_eq!(queue.processing_count(), 0);

        let second = queue
            .dequeue(&node, "w0", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.dispatch.task_id.as_str(), "t2");

        assert!(queue
            .dequeue(&node, "w0", Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    async fn topics_are_isolated_per_node() {
        let queue = InMemoryTaskQueue::new();
        queue.enqueue(&dispatch("t1")).await.unwrap();

        assert!(queue
            .dequeue(
                &NodeName::FasterWhisperTranscribeAudio,
                "w0",
                Duration::from_millis(10)
            )
            .await
            .unwrap()
            .is_none());
        assert_eq!(queue.pending_count(&NodeName::FfmpegExtractAudio), 1);
    }
}
