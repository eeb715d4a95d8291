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

use crate::storage::keyvalue::{KeyValueStorage, KeyValueStorageError};
use chrono::Utc;
use mediaflow_common::config::{GpuLockConfig, HeartbeatConfig};
use mediaflow_common::model::{HeartbeatRecord, MonitorStats, TaskId};
use mediaflow_common::node::NodeName;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// The single logical GPU. A multi-GPU deployment would shard this key.
pub const GPU_LOCK_KEY: &str = "gpu_lock:0";

pub fn heartbeat_key(task_id: &TaskId) -> String {
    format!("task_heartbeat:{task_id}")
}

pub fn cancel_key(task_id: &TaskId) -> String {
    format!("task_cancel:{task_id}")
}

const STATS_ATTEMPTS: &str = "monitor:stats:attempts";
const STATS_SUCCESSES: &str = "monitor:stats:successes";
const STATS_TIMEOUTS: &str = "monitor:stats:timeouts";
const STATS_RECOVERIES: &str = "monitor:stats:recoveries";

#[derive(Debug, thiserror::Error)]
pub enum GpuLockError {
    #[error(transparent)]
    Storage(#[from] KeyValueStorageError),
    #[error("GPU lock not acquired within {waited:?} (max wait {max_wait:?})")]
    AcquireTimeout { waited: Duration, max_wait: Duration },
}

/// Parsed holder token `<stage_name>:<task_id>:<acquire_ts_millis>`.
/// Stage names and task ids are colon-free by construction, so the split is
/// unambiguous.
#[derive(Debug, Clone, PartialEq)]
pub struct LockHolder {
    pub token: String,
    pub stage: String,
    pub task_id: String,
    pub acquire_ts_millis: i64,
}

impl LockHolder {
    pub fn parse(token: &str) -> Option<LockHolder> {
        let mut parts = token.splitn(3, ':');
        let stage = parts.next()?.to_string();
        let task_id = parts.next()?.to_string();
        let acquire_ts_millis = parts.next()?.parse().ok()?;
        Some(LockHolder {
            token: token.to_string(),
            stage,
            task_id,
            acquire_ts_millis,
        })
    }

    pub fn age(&self) -> Duration {
        let elapsed_millis = (Utc::now().timestamp_millis() - self.acquire_ts_millis).max(0);
        Duration::from_millis(elapsed_millis as u64)
    }
}

fn make_token(stage: &NodeName, task_id: &TaskId) -> String {
    format!(
        "{}:{}:{}",
        stage.as_str(),
        task_id,
        Utc::now().timestamp_millis()
    )
}

/// Cross-host mutual exclusion for GPU-bound node executions, backed by the
/// `gpu_lock:0` key. Acquisition is `SET NX EX`; release and forced release
/// go through the atomic compare-and-delete, so a late release can never
/// remove a successor's lock.
pub struct GpuLockService {
    kv: Arc<dyn KeyValueStorage>,
    config: GpuLockConfig,
}

impl GpuLockService {
    pub fn new(kv: Arc<dyn KeyValueStorage>, config: GpuLockConfig) -> Self {
        GpuLockService { kv, config }
    }

    pub fn config(&self) -> &GpuLockConfig {
        &self.config
    }

    /// Single acquisition attempt; returns the holder token on success.
    pub async fn try_acquire(
        &self,
        stage: &NodeName,
        task_id: &TaskId,
    ) -> Result<Option<String>, GpuLockError> {
        let token = make_token(stage, task_id);
        let acquired = self
            .kv
            .set_if_absent_with_ttl(GPU_LOCK_KEY, &token, self.config.lock_timeout)
            .await?;
        Ok(acquired.then_some(token))
    }

    /// Acquire with exponential backoff bounded by `max_poll_interval`,
    /// failing once the cumulative wait exceeds `max_wait_time`. A zero
    /// `max_wait_time` makes this a single attempt.
    pub async fn acquire(
        &self,
        stage: &NodeName,
        task_id: &TaskId,
    ) -> Result<String, GpuLockError> {
        self.kv.incr_by(STATS_ATTEMPTS, 1).await?;

        let mut waited = Duration::ZERO;
        let mut delay = self.config.poll_interval;
        loop {
            if let Some(token) = self.try_acquire(stage, task_id).await? {
                self.kv.incr_by(STATS_SUCCESSES, 1).await?;
                info!("GPU lock acquired by {stage} for task {task_id}");
                return Ok(token);
            }
            if waited + delay > self.config.max_wait_time {
                self.kv.incr_by(STATS_TIMEOUTS, 1).await?;
                return Err(GpuLockError::AcquireTimeout {
                    waited,
                    max_wait: self.config.max_wait_time,
                });
            }
            tokio::time::sleep(delay).await;
            waited += delay;
            delay = delay
                .mul_f64(self.config.exponential_backoff.max(1.0))
                .min(self.config.max_poll_interval);
        }
    }

    /// Atomic release: deletes the lock only while it still holds `token`.
    pub async fn release(&self, token: &str) -> Result<bool, GpuLockError> {
        let released = self.kv.compare_and_delete(GPU_LOCK_KEY, token).await?;
        if !released {
            warn!("GPU lock release was a no-op, holder token no longer matches");
        }
        Ok(released)
    }

    /// Forced release used by the monitor and the operator endpoint. Same
    /// atomic script; a stale `token` makes this a no-op.
    pub async fn force_release(&self, lock_key: &str, token: &str) -> Result<bool, GpuLockError> {
        let released = self.kv.compare_and_delete(lock_key, token).await?;
        if released {
            self.kv.incr_by(STATS_RECOVERIES, 1).await?;
            info!("Forced release of {lock_key} succeeded");
        }
        Ok(released)
    }

    /// Refresh the lock TTL while still holding it; fails when the lock was
    /// lost (expired or force-released).
    pub async fn extend(&self, token: &str) -> Result<bool, GpuLockError> {
        Ok(self
            .kv
            .compare_and_set_with_ttl(GPU_LOCK_KEY, token, token, self.config.lock_timeout)
            .await?)
    }

    pub async fn current_holder(&self) -> Result<Option<LockHolder>, GpuLockError> {
        let value = self.kv.get(GPU_LOCK_KEY).await?;
        Ok(value.as_deref().and_then(LockHolder::parse))
    }

    pub async fn stats(&self) -> Result<MonitorStats, GpuLockError> {
        async fn read(kv: &dyn KeyValueStorage, key: &str) -> Result<u64, GpuLockError> {
            Ok(kv
                .get(key)
                .await?
                .and_then(|value| value.parse().ok())
                .unwrap_or(0))
        }
        Ok(MonitorStats {
            attempts: read(self.kv.as_ref(), STATS_ATTEMPTS).await?,
            successes: read(self.kv.as_ref(), STATS_SUCCESSES).await?,
            timeouts: read(self.kv.as_ref(), STATS_TIMEOUTS).await?,
            recoveries: read(self.kv.as_ref(), STATS_RECOVERIES).await?,
        })
    }
}

/// Worker-side liveness records plus the cooperative cancellation flag the
/// monitor raises on soft timeout.
pub struct HeartbeatService {
    kv: Arc<dyn KeyValueStorage>,
    config: HeartbeatConfig,
}

impl HeartbeatService {
    pub fn new(kv: Arc<dyn KeyValueStorage>, config: HeartbeatConfig) -> Self {
        HeartbeatService { kv, config }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    pub async fn write(
        &self,
        task_id: &TaskId,
        record: &HeartbeatRecord,
    ) -> Result<(), KeyValueStorageError> {
        let serialized = serde_json::to_string(record)
            .map_err(|err| KeyValueStorageError::Backend(err.to_string()))?;
        self.kv
            .set_with_ttl(&heartbeat_key(task_id), &serialized, self.config.timeout)
            .await
    }

    pub async fn read(
        &self,
        task_id: &TaskId,
    ) -> Result<Option<HeartbeatRecord>, KeyValueStorageError> {
        match self.kv.get(&heartbeat_key(task_id)).await? {
            Some(serialized) => Ok(serde_json::from_str(&serialized).ok()),
            None => Ok(None),
        }
    }

    pub async fn read_all(&self) -> Result<Vec<(String, HeartbeatRecord)>, KeyValueStorageError> {
        let keys = self.kv.keys_matching("task_heartbeat:*").await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(serialized) = self.kv.get(&key).await? {
                if let Ok(record) = serde_json::from_str(&serialized) {
                    let task_id = key
                        .strip_prefix("task_heartbeat:")
                        .unwrap_or(&key)
                        .to_string();
                    records.push((task_id, record));
                }
            }
        }
        Ok(records)
    }

    pub async fn clear(&self, task_id: &TaskId) -> Result<(), KeyValueStorageError> {
        self.kv.del(&heartbeat_key(task_id)).await
    }

    /// Raise the cooperative cancel flag; workers poll it from the heartbeat
    /// loop. The TTL keeps stale flags from cancelling a future re-run.
    pub async fn request_cancel(&self, task_id: &TaskId) -> Result<(), KeyValueStorageError> {
        self.kv
            .set_with_ttl(
                &cancel_key(task_id),
                "cancel",
                self.config.timeout.max(Duration::from_secs(60)),
            )
            .await
    }

    pub async fn is_cancel_requested(
        &self,
        task_id: &TaskId,
    ) -> Result<bool, KeyValueStorageError> {
        Ok(self.kv.get(&cancel_key(task_id)).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::storage::keyvalue::memory::InMemoryKeyValueStorage;

    fn lock_service(config: GpuLockConfig) -> GpuLockService {
        GpuLockService::new(Arc::new(InMemoryKeyValueStorage::new()), config)
    }

    fn fast_config() -> GpuLockConfig {
        GpuLockConfig {
            poll_interval: Duration::from_millis(5),
            max_poll_interval: Duration::from_millis(20),
            max_wait_time: Duration::from_millis(50),
            lock_timeout: Duration::from_secs(60),
            exponential_backoff: 2.0,
        }
    }

    #[test]
    async fn holder_token_round_trips() {
        let service = lock_service(fast_config());
        let token = service
            .acquire(
                &NodeName::FasterWhisperTranscribeAudio,
                &TaskId::new("t1").unwrap(),
            )
            .await
            .unwrap();

        let holder = service.current_holder().await.unwrap().unwrap();
        assert_eq!(holder.token, token);
        assert_eq!(holder.stage, "faster_whisper.transcribe_audio");
        assert_eq!(holder.task_id, "t1");
        assert!(holder.age() < Duration::from_secs(1));
    }

    #[test]
    async fn second_waiter_times_out_and_then_succeeds() {
        let service = lock_service(fast_config());
        let stage = NodeName::AudioSeparatorSeparateVocals;
        let token = service
            .acquire(&stage, &TaskId::new("t1").unwrap())
            .await
            .unwrap();

        let denied = service
            .acquire(&stage, &TaskId::new("t2").unwrap())
            .await;
        assert!(matches!(denied, Err(GpuLockError::AcquireTimeout { .. })));

        assert!(service.release(&token).await.unwrap());
        let token2 = service
            .acquire(&stage, &TaskId::new("t2").unwrap())
            .await
            .unwrap();
        let holder = service.current_holder().await.unwrap().unwrap();
        assert_eq!(holder.token, token2);

        let stats = service.stats().await.unwrap();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.timeouts, 1);
    }

    #[test]
    async fn zero_max_wait_means_single_attempt() {
        let mut config = fast_config();
        config.max_wait_time = Duration::ZERO;
        let service = lock_service(config);
        let stage = NodeName::PaddleocrPerformOcr;

        let token = service
            .acquire(&stage, &TaskId::new("t1").unwrap())
            .await
            .unwrap();
        let denied = service.acquire(&stage, &TaskId::new("t2").unwrap()).await;
        assert!(matches!(
            denied,
            Err(GpuLockError::AcquireTimeout { waited, .. }) if waited == Duration::ZERO
        ));
        assert!(service.release(&token).await.unwrap());
    }

    #[test]
    async fn late_release_cannot_remove_a_successor() {
        let service = lock_service(fast_config());
        let stage = NodeName::IndexttsGenerateSpeech;
        let first = service
            .acquire(&stage, &TaskId::new("t1").unwrap())
            .await
            .unwrap();
        assert!(service.release(&first).await.unwrap());

        let second = service
            .acquire(&stage, &TaskId::new("t2").unwrap())
            .await
            .unwrap();

        // the predecessor retries its release with a stale token
        assert!(!service.release(&first).await.unwrap());
        let holder = service.current_holder().await.unwrap().unwrap();
        assert_eq!(holder.token, second);
    }

    #[test]
    async fn ttl_refresh_works_only_for_the_current_holder() {
        let service = lock_service(fast_config());
        let stage = NodeName::PaddleocrDetectSubtitleArea;
        let token = service
            .acquire(&stage, &TaskId::new("t1").unwrap())
            .await
            .unwrap();

        assert!(service.extend(&token).await.unwrap());
        assert!(service.release(&token).await.unwrap());
        assert!(!service.extend(&token).await.unwrap());
    }

    #[test]
    async fn forced_release_counts_as_recovery() {
        let service = lock_service(fast_config());
        let stage = NodeName::PyannoteDiarizeSpeakers;
        let token = service
            .acquire(&stage, &TaskId::new("t1").unwrap())
            .await
            .unwrap();

        assert!(service.force_release(GPU_LOCK_KEY, &token).await.unwrap());
        assert!(service.current_holder().await.unwrap().is_none());
        assert_eq!(service.stats().await.unwrap().recoveries, 1);

        // stale token: no-op
        assert!(!service.force_release(GPU_LOCK_KEY, &token).await.unwrap());
    }
}
