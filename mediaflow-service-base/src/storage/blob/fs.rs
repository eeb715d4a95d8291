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
use std::path::{Path, PathBuf};

/// Filesystem-backed object store for single-host development deployments.
pub struct FileSystemBlobStorage {
    root: PathBuf,
}

impl FileSystemBlobStorage {
    pub async fn new(root: &Path) -> Result<Self, BlobStorageError> {
        tokio::fs::create_dir_all(root).await?;
        Ok(FileSystemBlobStorage {
            root: root.to_path_buf(),
        })
    }

    fn key_path(&self, key: &str) -> Result<PathBuf, BlobStorageError> {
        if key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(BlobStorageError::Backend(format!(
                "invalid object key: {key}"
            )));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStorage for FileSystemBlobStorage {
    async fn put_data(&self, key: &str, data: Bytes) -> Result<String, BlobStorageError> {
        let path = self.key_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &data).await?;
        Ok(self.public_url(key))
    }

    async fn put_file(&self, key: &str, local_path: &Path) -> Result<String, BlobStorageError> {
        let path = self.key_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local_path, &path).await?;
        Ok(self.public_url(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BlobStorageError> {
        let path = self.key_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStorageError> {
        let path = self.key_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobStorageError> {
        let path = self.key_path(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    fn public_url(&self, key: &str) -> String {
        format!("file://{}", self.root.join(key).display())
    }
}
