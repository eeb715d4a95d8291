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

use crate::config::CallbackConfig;
use crate::model::{CallbackPayload, CallbackStatus};
use async_trait::async_trait;
use tracing::{info, warn};

/// Delivers terminal-state webhooks. Shared by the worker (normal terminal
/// transitions), the gateway (cache hits) and the monitor (forced failures).
#[async_trait]
pub trait CallbackService: Send + Sync {
    /// Deliver the payload to the given URL. Connection errors and 5xx
    /// responses are retried with bounded backoff; a 4xx response fails
    /// immediately. Delivery failure never alters workflow state, only the
    /// reported status.
    async fn deliver(&self, callback_url: &str, payload: &CallbackPayload) -> CallbackStatus;
}

pub struct CallbackServiceDefault {
    client: reqwest::Client,
    config: CallbackConfig,
}

impl CallbackServiceDefault {
    pub fn new(config: CallbackConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        CallbackServiceDefault { client, config }
    }
}

#[async_trait]
impl CallbackService for CallbackServiceDefault {
    async fn deliver(&self, callback_url: &str, payload: &CallbackPayload) -> CallbackStatus {
        let max_attempts = self.config.retries.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self.client.post(callback_url).json(payload).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        info!(
                            task_id = %payload.task_id,
                            attempt,
                            "Callback delivered to {callback_url}"
                        );
                        return CallbackStatus::Sent;
                    }
                    if status.is_client_error() {
                        warn!(
                            task_id = %payload.task_id,
                            status = status.as_u16(),
                            "Callback rejected by {callback_url}, not retrying"
                        );
                        return CallbackStatus::Failed;
                    }
                    warn!(
                        task_id = %payload.task_id,
                        status = status.as_u16(),
                        attempt,
                        "Callback to {callback_url} failed with server error"
                    );
                }
                Err(error) => {
                    warn!(
                        task_id = %payload.task_id,
                        attempt,
                        "Callback to {callback_url} failed: {error}"
                    );
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(self.config.retries.delay_for_attempt(attempt)).await;
            }
        }
        CallbackStatus::Failed
    }
}

/// Test double recording every delivery instead of making HTTP calls.
pub struct RecordingCallbackService {
    pub deliveries: tokio::sync::Mutex<Vec<(String, CallbackPayload)>>,
    pub outcome: CallbackStatus,
}

impl RecordingCallbackService {
    pub fn succeeding() -> Self {
        RecordingCallbackService {
            deliveries: tokio::sync::Mutex::new(Vec::new()),
            outcome: CallbackStatus::Sent,
        }
    }

    pub fn failing() -> Self {
        RecordingCallbackService {
            deliveries: tokio::sync::Mutex::new(Vec::new()),
            outcome: CallbackStatus::Failed,
        }
    }

    pub async fn delivered_urls(&self) -> Vec<String> {
        self.deliveries
            .lock()
            .await
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }
}

#[async_trait]
impl CallbackService for RecordingCallbackService {
    async fn deliver(&self, callback_url: &str, payload: &CallbackPayload) -> CallbackStatus {
        self.deliveries
            .lock()
            .await
            .push((callback_url.to_string(), payload.clone()));
        self.outcome
    }
}
