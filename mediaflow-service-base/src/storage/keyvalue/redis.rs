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

use super::{KeyValueStorage, KeyValueStorageError};
use async_trait::async_trait;
use mediaflow_common::redis::RedisPool;
use redis::AsyncCommands;
use std::time::Duration;

const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

const COMPARE_AND_SET_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    redis.call("set", KEYS[1], ARGV[2], "EX", ARGV[3])
    return 1
else
    return 0
end
"#;

pub struct RedisKeyValueStorage {
    pool: RedisPool,
    compare_and_delete: redis::Script,
    compare_and_set: redis::Script,
}

impl RedisKeyValueStorage {
    pub fn new(pool: RedisPool) -> Self {
        RedisKeyValueStorage {
            pool,
            compare_and_delete: redis::Script::new(COMPARE_AND_DELETE_SCRIPT),
            compare_and_set: redis::Script::new(COMPARE_AND_SET_SCRIPT),
        }
    }

    fn ttl_seconds(ttl: Duration) -> u64 {
        ttl.as_secs().max(1)
    }
}

#[async_trait]
impl KeyValueStorage for RedisKeyValueStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, KeyValueStorageError> {
        let mut connection = self.pool.connection();
        let value: Option<String> = connection.get(self.pool.prefixed_key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KeyValueStorageError> {
        let mut connection = self.pool.connection();
        let _: () = connection.set(self.pool.prefixed_key(key), value).await?;
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), KeyValueStorageError> {
        let mut connection = self.pool.connection();
        let _: () = connection
            .set_ex(self.pool.prefixed_key(key), value, Self::ttl_seconds(ttl))
            .await?;
        Ok(())
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, KeyValueStorageError> {
        let mut connection = self.pool.connection();
        let result: Option<String> = redis::cmd("SET")
            .arg(self.pool.prefixed_key(key))
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(Self::ttl_seconds(ttl))
            .query_async(&mut connection)
            .await?;
        Ok(result.is_some())
    }

    async fn del(&self, key: &str) -> Result<(), KeyValueStorageError> {
        let mut connection = self.pool.connection();
        let _: () = connection.del(self.pool.prefixed_key(key)).await?;
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KeyValueStorageError> {
        let mut connection = self.pool.connection();
        let value: i64 = connection
            .incr(self.pool.prefixed_key(key), delta)
            .await?;
        Ok(value)
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, KeyValueStorageError> {
        let mut connection = self.pool.connection();
        let prefixed = self.pool.prefixed_key(pattern);
        let mut keys = Vec::new();
        {
            let mut iter = connection.scan_match::<_, String>(prefixed).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }
        Ok(keys
            .into_iter()
            .map(|key| self.pool.unprefixed_key(&key))
            .collect())
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<bool, KeyValueStorageError> {
        let mut connection = self.pool.connection();
        let deleted: i64 = self
            .compare_and_delete
            .key(self.pool.prefixed_key(key))
            .arg(expected)
            .invoke_async(&mut connection)
            .await?;
        Ok(deleted > 0)
    }

    async fn compare_and_set_with_ttl(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, KeyValueStorageError> {
        let mut connection = self.pool.connection();
        let updated: i64 = self
            .compare_and_set
            .key(self.pool.prefixed_key(key))
            .arg(expected)
            .arg(value)
            .arg(Self::ttl_seconds(ttl))
            .invoke_async(&mut connection)
            .await?;
        Ok(updated > 0)
    }
}
