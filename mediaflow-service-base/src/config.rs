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

use mediaflow_common::model::Empty;
use mediaflow_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;

/// Object-store backend selection; the S3 variant covers MinIO through the
/// endpoint override and path-style addressing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "config")]
pub enum BlobStorageConfig {
    S3(S3BlobStorageConfig),
    LocalFileSystem(LocalFileSystemBlobStorageConfig),
    InMemory(Empty),
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        BlobStorageConfig::S3(S3BlobStorageConfig::default())
    }
}

impl SafeDisplay for BlobStorageConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        match self {
            BlobStorageConfig::S3(inner) => {
                let _ = writeln!(&mut result, "S3:");
                let _ = writeln!(&mut result, "{}", inner.to_safe_string_indented());
            }
            BlobStorageConfig::LocalFileSystem(inner) => {
                let _ = writeln!(&mut result, "local filesystem:");
                let _ = writeln!(&mut result, "{}", inner.to_safe_string_indented());
            }
            BlobStorageConfig::InMemory(_) => {
                let _ = writeln!(&mut result, "in-memory");
            }
        }
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct S3BlobStorageConfig {
    pub region: String,
    pub bucket: String,
    /// Set for MinIO or any other S3-compatible store.
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Base of the URLs surfaced in `*_minio_url` fields; falls back to the
    /// endpoint URL.
    pub public_url_base: Option<String>,
    pub force_path_style: bool,
}

impl Default for S3BlobStorageConfig {
    fn default() -> Self {
        S3BlobStorageConfig {
            region: "us-east-1".to_string(),
            bucket: "mediaflow-tasks".to_string(),
            endpoint_url: Some("http://localhost:9000".to_string()),
            access_key_id: None,
            secret_access_key: None,
            public_url_base: None,
            force_path_style: true,
        }
    }
}

impl SafeDisplay for S3BlobStorageConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "region: {}", self.region);
        let _ = writeln!(&mut result, "bucket: {}", self.bucket);
        let _ = writeln!(&mut result, "endpoint url: {:?}", self.endpoint_url);
        let _ = writeln!(&mut result, "access key id: ****");
        let _ = writeln!(&mut result, "secret access key: ****");
        let _ = writeln!(&mut result, "public url base: {:?}", self.public_url_base);
        let _ = writeln!(&mut result, "force path style: {}", self.force_path_style);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalFileSystemBlobStorageConfig {
    pub root: PathBuf,
}

impl Default for LocalFileSystemBlobStorageConfig {
    fn default() -> Self {
        LocalFileSystemBlobStorageConfig {
            root: PathBuf::from("../data/blobs"),
        }
    }
}

impl SafeDisplay for LocalFileSystemBlobStorageConfig {
    fn to_safe_string(&self) -> String {
        format!("root: {}\n", self.root.display())
    }
}
