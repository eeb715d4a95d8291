use crate::api::ApiTags;
use crate::model::{DeleteResponse, ErrorBody, FileUploadResponse};
use crate::service::file::{FileService, FileServiceError};
use bytes::Bytes;
use mediaflow_common::metrics::api::TraceErrorKind;
use mediaflow_common::recorded_http_api_request;
use poem::Body;
use poem_openapi::param::{Path, Query};
use poem_openapi::payload::{Binary, Json};
use poem_openapi::types::multipart::Upload;
use poem_openapi::*;
use std::sync::Arc;
use tracing::Instrument;

#[derive(ApiResponse, Debug, Clone)]
pub enum FileApiError {
    /// Invalid object key or directory path
    #[oai(status = 400)]
    BadRequest(Json<ErrorBody>),
    /// Object not found
    #[oai(status = 404)]
    NotFound(Json<ErrorBody>),
    /// Object store unavailable
    #[oai(status = 503)]
    Unavailable(Json<ErrorBody>),
}

impl TraceErrorKind for FileApiError {
    fn trace_error_kind(&self) -> &'static str {
        match self {
            FileApiError::BadRequest(_) => "BadRequest",
            FileApiError::NotFound(_) => "NotFound",
            FileApiError::Unavailable(_) => "Unavailable",
        }
    }
}

impl From<FileServiceError> for FileApiError {
    fn from(value: FileServiceError) -> Self {
        match &value {
            FileServiceError::InvalidPath(_) => FileApiError::BadRequest(Json(ErrorBody {
                error: value.to_string(),
            })),
            FileServiceError::NotFound(_) => FileApiError::NotFound(Json(ErrorBody {
                error: value.to_string(),
            })),
            FileServiceError::Store(_) => FileApiError::Unavailable(Json(ErrorBody {
                error: value.to_string(),
            })),
        }
    }
}

impl From<poem::error::ReadBodyError> for FileApiError {
    fn from(value: poem::error::ReadBodyError) -> Self {
        FileApiError::BadRequest(Json(ErrorBody {
            error: value.to_string(),
        }))
    }
}

impl From<std::io::Error> for FileApiError {
    fn from(value: std::io::Error) -> Self {
        FileApiError::BadRequest(Json(ErrorBody {
            error: value.to_string(),
        }))
    }
}

type Result<T> = std::result::Result<T, FileApiError>;

#[derive(Multipart)]
pub struct UploadPayload {
    /// Object key inside the bucket, e.g. `t1/audio.wav`.
    file_path: String,
    file: Upload,
}

pub struct FileApi {
    file_service: Arc<FileService>,
}

#[OpenApi(prefix_path = "/v1/files", tag = ApiTags::File)]
impl FileApi {
    pub fn new(file_service: Arc<FileService>) -> Self {
        Self { file_service }
    }

    /// Upload a file to the object store
    #[oai(path = "/upload", method = "post", operation_id = "upload_file")]
    async fn upload_file(&self, payload: UploadPayload) -> Result<Json<FileUploadResponse>> {
        let record = recorded_http_api_request!("upload_file", file_path = payload.file_path);
        let response = {
            let data = payload.file.into_vec().await?;
            self.file_service
                .upload(&payload.file_path, Bytes::from(data))
                .instrument(record.span.clone())
                .await
                .map_err(FileApiError::from)
                .map(|uploaded| {
                    Json(FileUploadResponse {
                        file_path: uploaded.file_path,
                        url: uploaded.url,
                        size: uploaded.size,
                        timestamp: uploaded.timestamp.to_rfc3339(),
                    })
                })
        };
        record.result(response)
    }

    /// Download a file from the object store
    #[oai(
        path = "/download/:file_path",
        method = "get",
        operation_id = "download_file"
    )]
    async fn download_file(&self, file_path: Path<String>) -> Result<Binary<Body>> {
        let record = recorded_http_api_request!("download_file", file_path = file_path.0);
        let response = self
            .file_service
            .download(&file_path.0)
            .instrument(record.span.clone())
            .await
            .map_err(FileApiError::from)
            .map(|data| Binary(Body::from_bytes(data)));
        record.result(response)
    }

    /// Delete a directory under the shared storage root
    ///
    /// Deleting a directory that does not exist succeeds (idempotent); paths
    /// containing `..` are rejected.
    #[oai(
        path = "/directories",
        method = "delete",
        operation_id = "delete_directory"
    )]
    async fn delete_directory(
        &self,
        /// Path relative to the shared storage root, or absolute under it
        #[oai(name = "directory_path")]
        directory_path: Query<String>,
    ) -> Result<Json<DeleteResponse>> {
        let record =
            recorded_http_api_request!("delete_directory", directory_path = directory_path.0);
        let response = self
            .file_service
            .delete_shared_directory(&directory_path.0)
            .instrument(record.span.clone())
            .await
            .map_err(FileApiError::from)
            .map(|deleted| {
                Json(DeleteResponse {
                    deleted,
                    message: if deleted {
                        "directory deleted".to_string()
                    } else {
                        "directory did not exist".to_string()
                    },
                })
            });
        record.result(response)
    }

    /// Delete a file from the object store
    #[oai(path = "/:file_path", method = "delete", operation_id = "delete_file")]
    async fn delete_file(&self, file_path: Path<String>) -> Result<Json<DeleteResponse>> {
        let record = recorded_http_api_request!("delete_file", file_path = file_path.0);
        let response = self
            .file_service
            .delete(&file_path.0)
            .instrument(record.span.clone())
            .await
            .map_err(FileApiError::from)
            .map(|_| {
                Json(DeleteResponse {
                    deleted: true,
                    message: "object deleted".to_string(),
                })
            });
        record.result(response)
    }
}
