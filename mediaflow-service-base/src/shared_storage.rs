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

use mediaflow_common::config::SharedStorageConfig;
use mediaflow_common::model::TaskId;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum SharedStorageError {
    #[error("path '{0}' escapes the shared storage root")]
    PathEscapes(String),
    #[error("io error on shared storage: {0}")]
    Io(#[from] std::io::Error),
    #[error("download of '{url}' failed: {reason}")]
    DownloadFailed { url: String, reason: String },
}

/// The filesystem mounted by the gateway and every worker. Per-task files
/// live under `<root>/workflows/<task_id>/`; nothing outside the root is
/// ever touched through this type.
#[derive(Clone)]
pub struct SharedStorage {
    root: PathBuf,
    http: reqwest::Client,
}

impl SharedStorage {
    pub fn new(config: &SharedStorageConfig) -> Self {
        SharedStorage {
            root: config.root.clone(),
            http: reqwest::Client::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self, task_id: &TaskId) -> PathBuf {
        self.root.join("workflows").join(task_id.as_str())
    }

    pub async fn ensure_task_dir(&self, task_id: &TaskId) -> Result<PathBuf, SharedStorageError> {
        let dir = self.task_dir(task_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Resolve an operator-supplied directory path against the root. Both
    /// relative paths and absolute paths already under the root are accepted;
    /// `..` components and paths outside the root are rejected.
    pub fn resolve_under_root(&self, path: &str) -> Result<PathBuf, SharedStorageError> {
        let candidate = Path::new(path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        for component in joined.components() {
            if matches!(component, Component::ParentDir) {
                return Err(SharedStorageError::PathEscapes(path.to_string()));
            }
        }
        if !joined.starts_with(&self.root) {
            return Err(SharedStorageError::PathEscapes(path.to_string()));
        }
        Ok(joined)
    }

    /// Recursively delete a directory under the root. Deleting a missing
    /// directory is not an error; returns whether anything was removed.
    pub async fn delete_directory(&self, path: &str) -> Result<bool, SharedStorageError> {
        let target = self.resolve_under_root(path)?;
        match tokio::fs::remove_dir_all(&target).await {
            Ok(()) => {
                info!("Deleted shared directory {}", target.display());
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub fn is_url(value: &str) -> bool {
        value.starts_with("http://") || value.starts_with("https://")
    }

    /// Download a remote input into the task's directory, keyed by the URL so
    /// repeated requests for the same task reuse the first download.
    pub async fn download_to_task_dir(
        &self,
        task_id: &TaskId,
        url: &str,
    ) -> Result<PathBuf, SharedStorageError> {
        let basename = url
            .rsplit('/')
            .next()
            .unwrap_or("input")
            .split('?')
            .next()
            .unwrap_or("input");
        let digest = md5_hex(url);
        let downloads_dir = self.task_dir(task_id).join("downloads");
        let target = downloads_dir.join(format!("{}_{}", &digest[..8], basename));

        if tokio::fs::try_exists(&target).await? {
            debug!("Reusing cached download for {url}");
            return Ok(target);
        }

        tokio::fs::create_dir_all(&downloads_dir).await?;
        let response =
            self.http
                .get(url)
                .send()
                .await
                .map_err(|err| SharedStorageError::DownloadFailed {
                    url: url.to_string(),
                    reason: err.to_string(),
                })?;
        if !response.status().is_success() {
            return Err(SharedStorageError::DownloadFailed {
                url: url.to_string(),
                reason: format!("status {}", response.status()),
            });
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| SharedStorageError::DownloadFailed {
                url: url.to_string(),
                reason: err.to_string(),
            })?;

        let tmp = target.with_extension("part");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &target).await?;
        info!("Downloaded {url} to {}", target.display());
        Ok(target)
    }
}

fn md5_hex(value: &str) -> String {
    format!("{:x}", md5::compute(value))
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn storage(root: &Path) -> SharedStorage {
        SharedStorage::new(&SharedStorageConfig {
            root: root.to_path_buf(),
        })
    }

    #[test]
    async fn rejects_parent_dir_components() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());

        assert!(matches!(
            storage.resolve_under_root("workflows/../../etc"),
            Err(SharedStorageError::PathEscapes(_))
        ));
        assert!(matches!(
            storage.resolve_under_root("/etc/passwd"),
            Err(SharedStorageError::PathEscapes(_))
        ));
        assert!(storage.resolve_under_root("workflows/t1/audio").is_ok());
    }

    #[test]
    async fn deleting_a_missing_directory_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());

        assert!(!storage.delete_directory("workflows/absent").await.unwrap());

        let task_id = TaskId::new("t1").unwrap();
        let task_dir = storage.ensure_task_dir(&task_id).await.unwrap();
        tokio::fs::write(task_dir.join("audio.wav"), b"pcm")
            .await
            .unwrap();
        assert!(storage.delete_directory("workflows/t1").await.unwrap());
        assert!(!tokio::fs::try_exists(&task_dir).await.unwrap());
    }
}
