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
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|at| at > Instant::now()).unwrap_or(true)
    }
}

/// In-process key-value store with real TTL semantics, used by tests and
/// single-node development setups. One mutex over the map makes every
/// operation atomic, matching the Lua-script guarantees of the Redis
/// implementation.
#[derive(Default)]
pub struct InMemoryKeyValueStorage {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKeyValueStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(entries: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
        match entries.get(key) {
            Some(entry) if entry.live() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn glob_matches(pattern: &str, key: &str) -> bool {
        match pattern.split_once('*') {
            Some((prefix, suffix)) => {
                key.len() >= prefix.len() + suffix.len()
                    && key.starts_with(prefix)
                    && key.ends_with(suffix)
            }
            None => pattern == key,
        }
    }
}

#[async_trait]
impl KeyValueStorage for InMemoryKeyValueStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, KeyValueStorageError> {
        let mut entries = self.entries.lock().unwrap();
        Ok(Self::live_value(&mut entries, key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KeyValueStorageError> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), KeyValueStorageError> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, KeyValueStorageError> {
        let mut entries = self.entries.lock().unwrap();
        if Self::live_value(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), KeyValueStorageError> {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(key);
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KeyValueStorageError> {
        let mut entries = self.entries.lock().unwrap();
        let current = Self::live_value(&mut entries, key)
            .map(|value| {
                value.parse::<i64>().map_err(|_| {
                    KeyValueStorageError::Backend(format!(
                        "value at {key} is not an integer"
                    ))
                })
            })
            .transpose()?
            .unwrap_or(0);
        let next = current + delta;
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, KeyValueStorageError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .filter(|(key, entry)| entry.live() && Self::glob_matches(pattern, key))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<bool, KeyValueStorageError> {
        let mut entries = self.entries.lock().unwrap();
        if Self::live_value(&mut entries, key).as_deref() == Some(expected) {
            entries.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn compare_and_set_with_ttl(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, KeyValueStorageError> {
        let mut entries = self.entries.lock().unwrap();
        if Self::live_value(&mut entries, key).as_deref() == Some(expected) {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    async fn set_if_absent_respects_expiry() {
        let storage = InMemoryKeyValueStorage::new();
        assert!(storage
            .set_if_absent_with_ttl("gpu_lock:0", "a", Duration::from_millis(20))
            .await
            .unwrap());
        assert!(!storage
            .set_if_absent_with_ttl("gpu_lock:0", "b", Duration::from_secs(10))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(storage
            .set_if_absent_with_ttl("gpu_lock:0", "b", Duration::from_secs(10))
            .await
            .unwrap());
        assert_eq!(
            storage.get("gpu_lock:0").await.unwrap(),
            Some("b".to_string())
        );
    }

    #[test]
    async fn compare_and_delete_is_a_noop_for_wrong_holder() {
        let storage = InMemoryKeyValueStorage::new();
        storage.set("gpu_lock:0", "holder-b").await.unwrap();

        assert!(!storage
            .compare_and_delete("gpu_lock:0", "holder-a")
            .await
            .unwrap());
        assert_eq!(
            storage.get("gpu_lock:0").await.unwrap(),
            Some("holder-b".to_string())
        );

        assert!(storage
            .compare_and_delete("gpu_lock:0", "holder-b")
            .await
            .unwrap());
        assert_eq!(storage.get("gpu_lock:0").await.unwrap(), None);
    }

    #[test]
    async fn keys_matching_supports_prefix_globs() {
        let storage = InMemoryKeyValueStorage::new();
        storage.set("task_heartbeat:t1", "{}").await.unwrap();
        storage.set("task_heartbeat:t2", "{}").await.unwrap();
        storage.set("workflow:t1", "{}").await.unwrap();

        let mut keys = storage.keys_matching("task_heartbeat:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["task_heartbeat:t1", "task_heartbeat:t2"]);
    }
}
