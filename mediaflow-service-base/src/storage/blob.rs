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

pub mod fs;
pub mod memory;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum BlobStorageError {
    #[error("object store error: {0}")]
    Backend(String),
    #[error("local file error: {0}")]
    LocalFile(String),
}

impl From<std::io::Error> for BlobStorageError {
    fn from(error: std::io::Error) -> Self {
        BlobStorageError::LocalFile(error.to_string())
    }
}

/// Object store with path-addressed blobs. Task artifacts live under the
/// `<task_id>/` prefix inside one bucket; keys use forward slashes on every
/// backend.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Store raw bytes at `key` and return the downloadable URL.
    async fn put_data(&self, key: &str, data: Bytes) -> Result<String, BlobStorageError>;

    /// Upload a local file to `key` and return the downloadable URL.
    async fn put_file(&self, key: &str, local_path: &Path) -> Result<String, BlobStorageError>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BlobStorageError>;

    async fn delete(&self, key: &str) -> Result<(), BlobStorageError>;

    async fn exists(&self, key: &str) -> Result<bool, BlobStorageError>;

    /// The URL surfaced in `*_minio_url` output fields for this key.
    fn public_url(&self, key: &str) -> String;
}
