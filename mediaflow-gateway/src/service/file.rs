use bytes::Bytes;
use chrono::{DateTime, Utc};
use mediaflow_common::SafeDisplay;
use mediaflow_service_base::shared_storage::{SharedStorage, SharedStorageError};
use mediaflow_service_base::storage::blob::{BlobStorage, BlobStorageError};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum FileServiceError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Object store unavailable: {0}")]
    Store(String),
}

impl SafeDisplay for FileServiceError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

impl From<BlobStorageError> for FileServiceError {
    fn from(error: BlobStorageError) -> Self {
        FileServiceError::Store(error.to_string())
    }
}

pub struct UploadedFile {
    pub file_path: String,
    pub url: String,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
}

/// Object uploads/downloads plus the guarded shared-filesystem delete. All
/// object keys are validated before they reach a backend.
pub struct FileService {
    blob: Arc<dyn BlobStorage>,
    shared_storage: Arc<SharedStorage>,
}

impl FileService {
    pub fn new(blob: Arc<dyn BlobStorage>, shared_storage: Arc<SharedStorage>) -> Self {
        FileService {
            blob,
            shared_storage,
        }
    }

    fn validate_key(file_path: &str) -> Result<(), FileServiceError> {
        if file_path.is_empty()
            || file_path.starts_with('/')
            || file_path
                .split('/')
                .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(FileServiceError::InvalidPath(file_path.to_string()));
        }
        Ok(())
    }

    pub async fn upload(
        &self,
        file_path: &str,
        data: Bytes,
    ) -> Result<UploadedFile, FileServiceError> {
        Self::validate_key(file_path)?;
        let size = data.len() as u64;
        let url = self.blob.put_data(file_path, data).await?;
        info!("Stored object {file_path} ({size} bytes)");
        Ok(UploadedFile {
            file_path: file_path.to_string(),
            url,
            size,
            timestamp: Utc::now(),
        })
    }

    pub async fn download(&self, file_path: &str) -> Result<Bytes, FileServiceError> {
        Self::validate_key(file_path)?;
        self.blob
            .get(file_path)
            .await?
            .ok_or_else(|| FileServiceError::NotFound(file_path.to_string()))
    }

    pub async fn delete(&self, file_path: &str) -> Result<(), FileServiceError> {
        Self::validate_key(file_path)?;
        self.blob.delete(file_path).await?;
        Ok(())
    }

    /// Delete a directory under the shared storage root. Missing directories
    /// are fine (idempotent); escapes are rejected.
    pub async fn delete_shared_directory(
        &self,
        directory_path: &str,
    ) -> Result<bool, FileServiceError> {
        match self.shared_storage.delete_directory(directory_path).await {
            Ok(deleted) => Ok(deleted),
            Err(SharedStorageError::PathEscapes(path)) => {
                Err(FileServiceError::InvalidPath(path))
            }
            Err(err) => Err(FileServiceError::Store(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use mediaflow_common::config::SharedStorageConfig;
    use mediaflow_service_base::storage::blob::memory::InMemoryBlobStorage;

    fn service(root: &std::path::Path) -> FileService {
        FileService::new(
            Arc::new(InMemoryBlobStorage::new()),
            Arc::new(SharedStorage::new(&SharedStorageConfig {
                root: root.to_path_buf(),
            })),
        )
    }

    #[test]
    async fn upload_then_download_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        let uploaded = service
            .upload("t1/audio.wav", Bytes::from_static(b"pcm"))
            .await
            .unwrap();
        assert_eq!(uploaded.size, 3);
        assert_eq!(uploaded.url, "memory://t1/audio.wav");

        let data = service.download("t1/audio.wav").await.unwrap();
        assert_eq!(&data[..], b"pcm");
    }

    #[test]
    async fn object_keys_may_not_escape() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        assert!(matches!(
            service.download("../secrets").await,
            Err(FileServiceError::InvalidPath(_))
        ));
        assert!(matches!(
            service.delete("/absolute").await,
            Err(FileServiceError::InvalidPath(_))
        ));
    }

    #[test]
    async fn directory_delete_is_idempotent_but_guarded() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());

        assert!(!service
            .delete_shared_directory("workflows/absent")
            .await
            .unwrap());
        assert!(matches!(
            service.delete_shared_directory("workflows/../../etc").await,
            Err(FileServiceError::InvalidPath(_))
        ));
    }
}
