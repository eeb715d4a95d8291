use chrono::Utc;
use mediaflow_common::clients::callback::CallbackService;
use mediaflow_common::config::GpuLockMonitorConfig;
use mediaflow_common::model::{
    collect_remote_files, CallbackPayload, StageExecution, TaskId, WorkflowStatus,
};
use mediaflow_common::node::NodeName;
use mediaflow_service_base::lock::{GpuLockService, HeartbeatService, LockHolder, GPU_LOCK_KEY};
use mediaflow_service_base::workflow::state::SilentStateManager;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Supervises the GPU lock and worker heartbeats from the gateway process.
///
/// Escalation is leveled: a warning log first, then cooperative cancellation
/// with a grace window (soft timeout), then forced release through the same
/// atomic script workers use (hard timeout). The monitor owns the terminal
/// transition it decides, including the webhook.
pub struct GpuLockMonitor {
    lock: Arc<GpuLockService>,
    heartbeats: Arc<HeartbeatService>,
    state: SilentStateManager,
    callbacks: Arc<dyn CallbackService>,
    config: GpuLockMonitorConfig,
    cancel_signalled_at: Mutex<HashMap<String, Instant>>,
}

impl GpuLockMonitor {
    pub fn new(
        lock: Arc<GpuLockService>,
        heartbeats: Arc<HeartbeatService>,
        state: SilentStateManager,
        callbacks: Arc<dyn CallbackService>,
        config: GpuLockMonitorConfig,
    ) -> Self {
        GpuLockMonitor {
            lock,
            heartbeats,
            state,
            callbacks,
            config,
            cancel_signalled_at: Mutex::new(HashMap::new()),
        }
    }

    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            if !monitor.config.enabled {
                info!("GPU lock monitor is disabled");
                return;
            }
            info!(
                "GPU lock monitor started, interval {:?}",
                monitor.config.monitor_interval
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(monitor.config.monitor_interval) => {
                        if let Err(err) = monitor.tick().await {
                            error!("GPU lock monitor tick failed: {err}");
                        }
                    }
                }
            }
            info!("GPU lock monitor stopped");
        })
    }

    /// One evaluation round; separated from the loop for tests.
    pub async fn tick(&self) -> Result<(), String> {
        let holder = self
            .lock
            .current_holder()
            .await
            .map_err(|err| err.to_string())?;

        let Some(holder) = holder else {
            self.cancel_signalled_at.lock().unwrap().clear();
            return Ok(());
        };

        let age = holder.age();
        let levels = &self.config.timeout_levels;

        if age >= levels.hard_timeout {
            warn!(
                "GPU lock holder {} exceeded the hard timeout ({age:?}), forcing release",
                holder.token
            );
            self.recover(&holder, "hard timeout").await;
            return Ok(());
        }

        if age >= levels.soft_timeout {
            let signalled_at = {
                let signalled = self.cancel_signalled_at.lock().unwrap();
                signalled.get(&holder.token).copied()
            };
            match signalled_at {
                None => {
                    warn!(
                        "GPU lock holder {} exceeded the soft timeout ({age:?}), requesting cancellation",
                        holder.token
                    );
                    if let Ok(task_id) = TaskId::new(holder.task_id.clone()) {
                        if let Err(err) = self.heartbeats.request_cancel(&task_id).await {
                            error!("Failed to raise cancel flag for {task_id}: {err}");
                        }
                    }
                    self.cancel_signalled_at
                        .lock()
                        .unwrap()
                        .insert(holder.token.clone(), Instant::now());
                }
                Some(signalled_at) => {
                    if signalled_at.elapsed() >= self.config.heartbeat.timeout {
                        warn!(
                            "GPU lock holder {} ignored cancellation, forcing release",
                            holder.token
                        );
                        self.recover(&holder, "soft timeout").await;
                    }
                }
            }
            return Ok(());
        }

        if age >= levels.warning {
            warn!(
                "GPU lock held by {} for {age:?} (warning threshold {:?})",
                holder.token, levels.warning
            );
        }

        // Zombie scan: a holder whose heartbeat vanished is stuck even if the
        // lock itself is not old yet.
        if age >= self.config.heartbeat.timeout {
            if let Ok(task_id) = TaskId::new(holder.task_id.clone()) {
                let alive = self
                    .heartbeats
                    .read(&task_id)
                    .await
                    .map_err(|err| err.to_string())?
                    .is_some();
                if !alive {
                    warn!(
                        "GPU lock holder {} has no live heartbeat, treating as zombie",
                        holder.token
                    );
                    self.recover(&holder, "missing heartbeat").await;
                }
            }
        }

        Ok(())
    }

    /// Bounded forced recovery: atomic release, then the FAILED transition
    /// and its callback. A token mismatch means a successor already owns the
    /// lock and there is nothing left to recover.
    async fn recover(&self, holder: &LockHolder, reason: &str) {
        if !self.config.auto_recovery {
            warn!("Auto-recovery disabled; leaving {} in place", holder.token);
            return;
        }

        let mut released = false;
        for attempt in 1..=self.config.cleanup.max_retry.max(1) {
            match self.lock.force_release(GPU_LOCK_KEY, &holder.token).await {
                Ok(outcome) => {
                    released = outcome;
                    break;
                }
                Err(err) => {
                    error!(
                        "Forced release attempt {attempt} for {} failed: {err}",
                        holder.token
                    );
                    tokio::time::sleep(self.config.cleanup.retry_delay).await;
                }
            }
        }
        self.cancel_signalled_at
            .lock()
            .unwrap()
            .remove(&holder.token);

        if !released {
            info!(
                "Holder token {} changed before forced release; no recovery needed",
                holder.token
            );
            return;
        }

        self.fail_stage(holder, reason).await;
    }

    async fn fail_stage(&self, holder: &LockHolder, reason: &str) {
        let Ok(task_id) = TaskId::new(holder.task_id.clone()) else {
            error!("Holder token {} carries an invalid task id", holder.token);
            return;
        };
        let Ok(node) = NodeName::from_str(&holder.stage) else {
            error!("Holder token {} carries an unknown stage", holder.token);
            return;
        };

        let context = match self.state.get(&task_id).await {
            Ok(Some(context)) => context,
            Ok(None) => {
                warn!("No workflow document for recovered task {task_id}");
                return;
            }
            Err(err) => {
                error!("Failed to load workflow for {task_id}: {err}");
                return;
            }
        };

        let Some(stage) = context.stage(&node) else {
            return;
        };
        if stage.status.is_terminal() {
            // the worker finished concurrently with the recovery
            return;
        }

        let error_text = format!(
            "GPU execution timed out ({reason}): stage {node} of task {task_id} was recovered by the monitor"
        );
        let failed = StageExecution::failed(
            stage.input_params.clone(),
            error_text,
            holder.age().as_secs_f64(),
        );

        let context = match self
            .state
            .record_stage_terminal(&task_id, &node, failed)
            .await
        {
            Ok(context) => context,
            Err(err) => {
                error!("Failed to record timeout failure for {task_id}: {err}");
                return;
            }
        };
        let _ = self.heartbeats.clear(&task_id).await;

        // The component that decides the terminal transition delivers the
        // callback.
        let callback_url = context.input_params.callback_url.clone();
        let payload = CallbackPayload {
            task_id: task_id.clone(),
            status: WorkflowStatus::Failed,
            minio_files: collect_remote_files(&context),
            result: context,
            timestamp: Utc::now(),
        };
        let status = self.callbacks.deliver(&callback_url, &payload).await;
        if let Err(err) = self.state.set_callback_status(&task_id, status).await {
            error!("Failed to record callback status for {task_id}: {err}");
        }
    }

}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use mediaflow_common::clients::callback::RecordingCallbackService;
    use mediaflow_common::config::{
        CleanupConfig, GpuLockConfig, HeartbeatConfig, TimeoutLevelsConfig,
    };
    use mediaflow_common::model::{HeartbeatRecord, InputParams, StageStatus};
    use mediaflow_service_base::storage::keyvalue::memory::InMemoryKeyValueStorage;
    use mediaflow_service_base::workflow::WorkflowStore;
    use serde_json::Map;
    use std::time::Duration;

    struct Fixture {
        monitor: GpuLockMonitor,
        lock: Arc<GpuLockService>,
        heartbeats: Arc<HeartbeatService>,
        state: SilentStateManager,
        callbacks: Arc<RecordingCallbackService>,
    }

    fn fixture() -> Fixture {
        let kv = Arc::new(InMemoryKeyValueStorage::new());
        let lock = Arc::new(GpuLockService::new(
            kv.clone(),
            GpuLockConfig {
                poll_interval: Duration::from_millis(2),
                max_poll_interval: Duration::from_millis(10),
                max_wait_time: Duration::ZERO,
                lock_timeout: Duration::from_secs(60),
                exponential_backoff: 2.0,
            },
        ));
        let heartbeat_config = HeartbeatConfig {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(40),
        };
        let heartbeats = Arc::new(HeartbeatService::new(kv.clone(), heartbeat_config.clone()));
        let state = SilentStateManager::new(Arc::new(WorkflowStore::new(kv)));
        let callbacks = Arc::new(RecordingCallbackService::succeeding());
        let monitor = GpuLockMonitor::new(
            lock.clone(),
            heartbeats.clone(),
            state.clone(),
            callbacks.clone(),
            GpuLockMonitorConfig {
                enabled: true,
                auto_recovery: true,
                monitor_interval: Duration::from_millis(5),
                timeout_levels: TimeoutLevelsConfig {
                    warning: Duration::from_millis(10),
                    soft_timeout: Duration::from_millis(25),
                    hard_timeout: Duration::from_millis(500),
                },
                heartbeat: heartbeat_config,
                cleanup: CleanupConfig {
                    max_retry: 3,
                    retry_delay: Duration::from_millis(5),
                },
            },
        );
        Fixture {
            monitor,
            lock,
            heartbeats,
            state,
            callbacks,
        }
    }

    async fn start_running_stage(fixture: &Fixture, task: &str) -> (TaskId, NodeName, String) {
        let task_id = TaskId::new(task).unwrap();
        let node = NodeName::AudioSeparatorSeparateVocals;
        fixture
            .state
            .create_or_touch(
                &task_id,
                InputParams {
                    task_name: node,
                    input_data: Map::new(),
                    callback_url: "http://cb/monitor".to_string(),
                },
                format!("/share/workflows/{task}"),
            )
            .await
            .unwrap();
        fixture
            .state
            .mark_stage_pending(&task_id, &node)
            .await
            .unwrap();
        let token = fixture.lock.acquire(&node, &task_id).await.unwrap();
        let now = Utc::now();
        fixture
            .heartbeats
            .write(
                &task_id,
                &HeartbeatRecord {
                    status: "running".to_string(),
                    progress: 0.1,
                    message: "separating".to_string(),
                    last_update: now,
                    start_time: now,
                },
            )
            .await
            .unwrap();
        (task_id, node, token)
    }

    #[test]
    async fn soft_timeout_cancels_then_recovers_and_frees_the_lock() {
        let fixture = fixture();
        let (task_id, node, _token) = start_running_stage(&fixture, "t1").await;

        // past soft timeout: first tick raises the cancel flag
        tokio::time::sleep(Duration::from_millis(30)).await;
        fixture.monitor.tick().await.unwrap();
        assert!(fixture
            .heartbeats
            .is_cancel_requested(&task_id)
            .await
            .unwrap());
        assert!(fixture.lock.current_holder().await.unwrap().is_some());

        // grace window elapses without release: recovery fires
        tokio::time::sleep(Duration::from_millis(50)).await;
        fixture.monitor.tick().await.unwrap();

        assert!(fixture.lock.current_holder().await.unwrap().is_none());
        let context = fixture.state.get(&task_id).await.unwrap().unwrap();
        let stage = context.stage(&node).unwrap();
        assert_eq!(stage.status, StageStatus::Failed);
        assert!(stage.error.as_deref().unwrap().contains("timed out"));

        // monitor owns the callback on forced failure
        assert_eq!(
            fixture.callbacks.delivered_urls().await,
            vec!["http://cb/monitor".to_string()]
        );

        // a follow-up acquisition succeeds on the first attempt
        let token = fixture
            .lock
            .acquire(&node, &TaskId::new("t2").unwrap())
            .await
            .unwrap();
        assert!(fixture.lock.release(&token).await.unwrap());
    }

    #[test]
    async fn hard_timeout_recovers_without_grace() {
        let fixture = fixture();
        let (task_id, node, _token) = start_running_stage(&fixture, "t1").await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        // pretend the lock is much older than it is by shrinking the level
        let mut monitor_config = fixture.monitor.config.clone();
        monitor_config.timeout_levels.hard_timeout = Duration::from_millis(20);
        let monitor = GpuLockMonitor::new(
            fixture.lock.clone(),
            fixture.heartbeats.clone(),
            fixture.state.clone(),
            fixture.callbacks.clone(),
            monitor_config,
        );

        monitor.tick().await.unwrap();
        assert!(fixture.lock.current_holder().await.unwrap().is_none());
        let context = fixture.state.get(&task_id).await.unwrap().unwrap();
        assert_eq!(
            context.stage(&node).unwrap().status,
            StageStatus::Failed
        );
    }

    #[test]
    async fn terminal_stage_is_not_overwritten_by_recovery() {
        let fixture = fixture();
        let (task_id, node, token) = start_running_stage(&fixture, "t1").await;

        // the worker finishes right before the monitor recovers
        fixture
            .state
            .record_stage_terminal(
                &task_id,
                &node,
                StageExecution::success(
                    Map::new(),
                    serde_json::json!({"vocal_audio": "/share/workflows/t1/vocal.wav"})
                        .as_object()
                        .unwrap()
                        .clone(),
                    0.4,
                ),
            )
            .await
            .unwrap();

        let holder = LockHolder::parse(&token).unwrap();
        fixture.monitor.recover(&holder, "soft timeout").await;

        let context = fixture.state.get(&task_id).await.unwrap().unwrap();
        assert_eq!(
            context.stage(&node).unwrap().status,
            StageStatus::Success
        );
        assert!(fixture.callbacks.delivered_urls().await.is_empty());
    }
}
