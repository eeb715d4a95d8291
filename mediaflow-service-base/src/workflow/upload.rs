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

use crate::compression::{archive_name, compress_directory};
use crate::storage::blob::BlobStorage;
use mediaflow_common::model::TaskId;
use mediaflow_common::node::{
    compression_info_field, is_path_field, minio_url_field, minio_urls_field,
};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Applies the object-store side effects of a successful stage: every path
/// field is uploaded under `<task_id>/` and its remote URL is attached under
/// the mechanical `F_minio_url(s)` naming. Local path values are never
/// overwritten.
pub struct OutputUploader {
    blob: Arc<dyn BlobStorage>,
    auto_upload: bool,
}

impl OutputUploader {
    pub fn new(blob: Arc<dyn BlobStorage>, auto_upload: bool) -> Self {
        OutputUploader { blob, auto_upload }
    }

    pub fn auto_upload(&self) -> bool {
        self.auto_upload
    }

    /// Upload all path fields of one stage output and attach the URL fields.
    /// A failed upload only withholds the URL field; the produced local file
    /// is still valid output.
    pub async fn apply(
        &self,
        task_id: &TaskId,
        custom_path_fields: &[&str],
        output: &mut Map<String, Value>,
    ) {
        if !self.auto_upload {
            return;
        }

        let path_fields: Vec<String> = output
            .keys()
            .filter(|field| is_path_field(field, custom_path_fields))
            .cloned()
            .collect();

        for field in path_fields {
            match output.get(&field).cloned() {
                Some(Value::String(path)) => {
                    if let Some((url, compression_info)) =
                        self.upload_path(task_id, &field, Path::new(&path)).await
                    {
                        output.insert(minio_url_field(&field), Value::String(url));
                        if let Some(info) = compression_info {
                            output.insert(compression_info_field(&field), info);
                        }
                    }
                }
                Some(Value::Array(entries)) => {
                    let mut urls = Vec::with_capacity(entries.len());
                    let mut complete = true;
                    for entry in &entries {
                        let Value::String(path) = entry else {
                            complete = false;
                            break;
                        };
                        match self.upload_file(task_id, Path::new(path)).await {
                            Some(url) => urls.push(Value::String(url)),
                            None => {
                                complete = false;
                                break;
                            }
                        }
                    }
                    // Partial URL lists would break the cardinality contract,
                    // so the field is attached only when every entry uploaded.
                    if complete {
                        output.insert(minio_urls_field(&field), Value::Array(urls));
                    }
                }
                _ => {}
            }
        }
    }

    async fn upload_path(
        &self,
        task_id: &TaskId,
        field: &str,
        path: &Path,
    ) -> Option<(String, Option<Value>)> {
        if path.is_dir() {
            let (url, info) = self.upload_directory(task_id, path).await?;
            Some((url, Some(info)))
        } else if path.is_file() {
            let url = self.upload_file(task_id, path).await?;
            Some((url, None))
        } else {
            debug!(
                "Path field {field} of task {task_id} does not exist locally, skipping upload: {}",
                path.display()
            );
            None
        }
    }

    async fn upload_file(&self, task_id: &TaskId, path: &Path) -> Option<String> {
        let basename = path.file_name()?.to_string_lossy().to_string();
        let key = format!("{task_id}/{basename}");
        match self.blob.put_file(&key, path).await {
            Ok(url) => Some(url),
            Err(err) => {
                warn!("Upload of {} failed: {err}", path.display());
                None
            }
        }
    }

    /// Directories ship as one deterministic archive, never file-by-file.
    async fn upload_directory(&self, task_id: &TaskId, dir: &Path) -> Option<(String, Value)> {
        let dir_name = dir.file_name()?.to_string_lossy().to_string();
        let archive_file = archive_name(&dir_name);
        let archive_path: PathBuf = dir
            .parent()
            .map(|parent| parent.join(&archive_file))
            .unwrap_or_else(|| PathBuf::from(&archive_file));

        let dir = dir.to_path_buf();
        let blocking_archive_path = archive_path.clone();
        let info = match tokio::task::spawn_blocking(move || {
            compress_directory(&dir, &blocking_archive_path)
        })
        .await
        {
            Ok(Ok(info)) => info,
            Ok(Err(err)) => {
                warn!("Compression of directory failed: {err}");
                return None;
            }
            Err(err) => {
                warn!("Compression task panicked: {err}");
                return None;
            }
        };

        let key = format!("{task_id}/{archive_file}");
        let url = match self.blob.put_file(&key, &archive_path).await {
            Ok(url) => url,
            Err(err) => {
                warn!("Upload of archive {} failed: {err}", archive_path.display());
                return None;
            }
        };
        let info_value = serde_json::to_value(&info).expect("compression info serializes");
        Some((url, info_value))
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::storage::blob::memory::InMemoryBlobStorage;
    use serde_json::json;

    fn task_id() -> TaskId {
        TaskId::new("t1").unwrap()
    }

    #[test]
    async fn scalar_path_fields_get_a_url_and_keep_the_local_path() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("audio.wav");
        tokio::fs::write(&audio, b"pcm").await.unwrap();

        let blob = Arc::new(InMemoryBlobStorage::new());
        let uploader = OutputUploader::new(blob.clone(), true);

        let mut output = json!({
            "audio_path": audio.to_string_lossy(),
            "language": "en"
        })
        .as_object()
        .unwrap()
        .clone();

        uploader.apply(&task_id(), &[], &mut output).await;

        assert_eq!(
            output.get("audio_path").unwrap().as_str().unwrap(),
            audio.to_string_lossy()
        );
        assert_eq!(
            output.get("audio_path_minio_url").unwrap().as_str().unwrap(),
            "memory://t1/audio.wav"
        );
        assert!(!output.contains_key("language_minio_url"));
        assert_eq!(blob.keys(), vec!["t1/audio.wav"]);
    }

    #[test]
    async fn directories_upload_as_one_archive_with_compression_info() {
        let dir = tempfile::tempdir().unwrap();
        let keyframes = dir.path().join("keyframes");
        tokio::fs::create_dir_all(&keyframes).await.unwrap();
        for index in 0..3 {
            tokio::fs::write(keyframes.join(format!("{index:04}.jpg")), b"jpeg")
                .await
                .unwrap();
        }

        let blob = Arc::new(InMemoryBlobStorage::new());
        let uploader = OutputUploader::new(blob.clone(), true);

        let mut output = json!({"keyframe_dir": keyframes.to_string_lossy()})
            .as_object()
            .unwrap()
            .clone();
        uploader.apply(&task_id(), &[], &mut output).await;

        assert_eq!(
            output
                .get("keyframe_dir_minio_url")
                .unwrap()
                .as_str()
                .unwrap(),
            "memory://t1/keyframes_compressed.zip"
        );
        let info = output.get("keyframe_dir_compression_info").unwrap();
        assert_eq!(info.get("files_count").unwrap().as_u64().unwrap(), 3);
        assert_eq!(info.get("format").unwrap().as_str().unwrap(), "zip");
        assert_eq!(blob.keys(), vec!["t1/keyframes_compressed.zip"]);
    }

    #[test]
    async fn array_path_fields_keep_cardinality() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("vocals.wav");
        let second = dir.path().join("other.wav");
        tokio::fs::write(&first, b"a").await.unwrap();
        tokio::fs::write(&second, b"b").await.unwrap();

        let blob = Arc::new(InMemoryBlobStorage::new());
        let uploader = OutputUploader::new(blob, true);

        let mut output = json!({
            "all_audio_files": [first.to_string_lossy(), second.to_string_lossy()]
        })
        .as_object()
        .unwrap()
        .clone();
        uploader
            .apply(&task_id(), &["all_audio_files"], &mut output)
            .await;

        let urls = output
            .get("all_audio_files_minio_urls")
            .unwrap()
            .as_array()
            .unwrap();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0].as_str().unwrap(), "memory://t1/vocals.wav");
        assert_eq!(urls[1].as_str().unwrap(), "memory://t1/other.wav");
    }

    #[test]
    async fn uploads_are_disabled_by_config() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("audio.wav");
        tokio::fs::write(&audio, b"pcm").await.unwrap();

        let blob = Arc::new(InMemoryBlobStorage::new());
        let uploader = OutputUploader::new(blob.clone(), false);

        let mut output = json!({"audio_path": audio.to_string_lossy()})
            .as_object()
            .unwrap()
            .clone();
        uploader.apply(&task_id(), &[], &mut output).await;

        assert!(!output.contains_key("audio_path_minio_url"));
        assert_eq!(blob.object_count(), 0);
    }
}
