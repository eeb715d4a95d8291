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

use super::{BlobStorage, BlobStorageError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// In-process object store used by tests.
#[derive(Default)]
pub struct InMemoryBlobStorage {
    objects: Mutex<HashMap<String, Bytes>>,
}

impl InMemoryBlobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStorage for InMemoryBlobStorage {
    async fn put_data(&self, key: &str, data: Bytes) -> Result<String, BlobStorageError> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data);
        Ok(self.public_url(key))
    }

    async fn put_file(&self, key: &str, local_path: &Path) -> Result<String, BlobStorageError> {
        let data = tokio::fs::read(local_path).await?;
        self.put_data(key, Bytes::from(data)).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BlobStorageError> {
        Ok(self.objects.lock().unwrap().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStorageError> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobStorageError> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    fn public_url(&self, key: &str) -> String {
        format!("memory://{key}")
    }
}
