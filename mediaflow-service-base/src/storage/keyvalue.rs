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

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum KeyValueStorageError {
    #[error("key-value store error: {0}")]
    Backend(String),
}

impl From<::redis::RedisError> for KeyValueStorageError {
    fn from(error: ::redis::RedisError) -> Self {
        KeyValueStorageError::Backend(error.to_string())
    }
}

/// Key-value primitive backing workflow documents, locks, heartbeats,
/// counters and queue bookkeeping. The two compare-and-* operations are
/// atomic on every implementation; on Redis they run as Lua scripts.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KeyValueStorageError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), KeyValueStorageError>;

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), KeyValueStorageError>;

    /// `SET key value NX EX ttl`; returns whether the key was set.
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, KeyValueStorageError>;

    async fn del(&self, key: &str) -> Result<(), KeyValueStorageError>;

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KeyValueStorageError>;

    /// Glob-style key listing (`task_heartbeat:*`). Small result sets only.
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, KeyValueStorageError>;

    /// Delete the key only if it currently holds `expected`. Atomic; this is
    /// what makes lock release race-free.
    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<bool, KeyValueStorageError>;

    /// Replace the value only if the key currently holds `expected`,
    /// refreshing the TTL. Atomic.
    async fn compare_and_set_with_ttl(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, KeyValueStorageError>;
}
