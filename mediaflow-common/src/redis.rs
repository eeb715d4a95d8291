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

use crate::config::RedisConfig;
use redis::aio::ConnectionManager;
use redis::RedisError;
use tracing::{debug, info, warn};

/// Shared Redis handle: a multiplexed connection manager plus the configured
/// key prefix. All Mediaflow keys go through [`RedisPool::prefixed_key`] so
/// one Redis instance can host several deployments.
#[derive(Clone)]
pub struct RedisPool {
    manager: ConnectionManager,
    key_prefix: String,
}

impl RedisPool {
    /// Connect with the configured bounded backoff; the returned manager
    /// reconnects on its own afterwards.
    pub async fn configured(config: &RedisConfig) -> Result<RedisPool, RedisError> {
        let url = config.url();
        debug!("Connecting to Redis at {}:{}", config.host, config.port);
        let client = redis::Client::open(url)?;

        let max_attempts = config.retries.max_attempts.max(1);
        let mut attempt = 1;
        let manager = loop {
            match ConnectionManager::new(client.clone()).await {
                Ok(manager) => break manager,
                Err(err) if attempt < max_attempts => {
                    let delay = config.retries.delay_for_attempt(attempt);
                    warn!(
                        "Redis connection attempt {attempt}/{max_attempts} failed ({err}), \
                         retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        };

        info!("Connected to Redis at {}:{}", config.host, config.port);
        Ok(RedisPool {
            manager,
            key_prefix: config.key_prefix.clone(),
        })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub fn prefixed_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.key_prefix, key)
        }
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Strip the configured prefix from a key read back from Redis.
    pub fn unprefixed_key(&self, key: &str) -> String {
        key.strip_prefix(self.key_prefix.as_str())
            .unwrap_or(key)
            .to_string()
    }
}
