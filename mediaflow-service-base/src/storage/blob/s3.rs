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
use crate::config::S3BlobStorageConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use std::path::Path;
use tracing::info;

/// S3 / MinIO object store. MinIO is reached through `endpoint_url` plus
/// path-style addressing.
pub struct S3BlobStorage {
    client: aws_sdk_s3::Client,
    config: S3BlobStorageConfig,
}

impl S3BlobStorage {
    pub async fn new(config: S3BlobStorageConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let (Some(access_key_id), Some(secret_access_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key_id.clone(),
                secret_access_key.clone(),
                None,
                None,
                "mediaflow-config",
            ));
        }
        if let Some(endpoint_url) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint_url.clone());
        }

        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();
        let client = aws_sdk_s3::Client::from_conf(s3_config);

        info!(
            "Using S3 object store, bucket {} at {}",
            config.bucket,
            config
                .endpoint_url
                .as_deref()
                .unwrap_or("default AWS endpoint")
        );

        S3BlobStorage { client, config }
    }

    fn backend_error(context: &str, error: impl std::fmt::Debug) -> BlobStorageError {
        BlobStorageError::Backend(format!("{context}: {error:?}"))
    }
}

#[async_trait]
impl BlobStorage for S3BlobStorage {
    async fn put_data(&self, key: &str, data: Bytes) -> Result<String, BlobStorageError> {
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|err| Self::backend_error("PutObject failed", err))?;
        Ok(self.public_url(key))
    }

    async fn put_file(&self, key: &str, local_path: &Path) -> Result<String, BlobStorageError> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|err| BlobStorageError::LocalFile(err.to_string()))?;
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|err| Self::backend_error("PutObject failed", err))?;
        Ok(self.public_url(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BlobStorageError> {
        match self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => {
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(|err| Self::backend_error("GetObject body read failed", err))?;
                Ok(Some(data.into_bytes()))
            }
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|service_error| service_error.is_no_such_key())
                    .unwrap_or(false)
                {
                    Ok(None)
                } else {
                    Err(Self::backend_error("GetObject failed", err))
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStorageError> {
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| Self::backend_error("DeleteObject failed", err))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobStorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|service_error| service_error.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(Self::backend_error("HeadObject failed", err))
                }
            }
        }
    }

    fn public_url(&self, key: &str) -> String {
        let base = self
            .config
            .public_url_base
            .as_deref()
            .or(self.config.endpoint_url.as_deref());
        match base {
            Some(base) => format!(
                "{}/{}/{}",
                base.trim_end_matches('/'),
                self.config.bucket,
                key
            ),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.config.bucket, self.config.region, key
            ),
        }
    }
}
