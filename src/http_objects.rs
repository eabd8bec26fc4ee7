use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    artifacts::ArtifactError,
    data_model::{Artifact, ArtifactDetails},
};

#[derive(Debug, ToSchema, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: &str) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn forbidden(message: &str) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string().as_str())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

impl From<ArtifactError> for ApiError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::InputError(msg) => Self::bad_request(&msg),
            ArtifactError::Conflict(msg) => Self::conflict(&msg),
            ArtifactError::NotFound(msg) => Self::not_found(&msg),
            ArtifactError::Unauthorized(msg) => Self::forbidden(&msg),
            ArtifactError::Internal(e) => Self::internal_error(e),
        }
    }
}

/// Request body for createArtifact, discriminated on storage type.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "storageType", rename_all = "lowercase")]
pub enum CreateArtifactRequest {
    #[serde(rename_all = "camelCase")]
    S3 {
        content_type: Option<String>,
        expires: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Azure {
        content_type: Option<String>,
        expires: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Reference {
        content_type: Option<String>,
        expires: DateTime<Utc>,
        url: String,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        expires: DateTime<Utc>,
        message: String,
        reason: String,
    },
}

impl CreateArtifactRequest {
    pub fn expires(&self) -> DateTime<Utc> {
        match self {
            CreateArtifactRequest::S3 { expires, .. } |
            CreateArtifactRequest::Azure { expires, .. } |
            CreateArtifactRequest::Reference { expires, .. } |
            CreateArtifactRequest::Error { expires, .. } => *expires,
        }
    }

    pub fn content_type(&self) -> String {
        match self {
            CreateArtifactRequest::S3 { content_type, .. } |
            CreateArtifactRequest::Azure { content_type, .. } |
            CreateArtifactRequest::Reference { content_type, .. } => content_type.clone(),
            CreateArtifactRequest::Error { .. } => None,
        }
        .unwrap_or_else(|| "application/json".to_string())
    }
}

/// Reply to createArtifact; `s3` and `azure` carry upload credentials.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "storageType", rename_all = "lowercase")]
pub enum CreateArtifactResponse {
    #[serde(rename_all = "camelCase")]
    S3 {
        content_type: String,
        expires: DateTime<Utc>,
        put_url: String,
    },
    #[serde(rename_all = "camelCase")]
    Azure {
        content_type: String,
        expires: DateTime<Utc>,
        put_url: String,
    },
    Reference,
    Error,
}

/// Client-facing projection of a stored artifact.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactView {
    pub storage_type: String,
    pub name: String,
    pub expires: DateTime<Utc>,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl From<&Artifact> for ArtifactView {
    fn from(artifact: &Artifact) -> Self {
        ArtifactView {
            storage_type: artifact.storage_type().to_string(),
            name: artifact.name.clone(),
            expires: ms_to_datetime(artifact.expires),
            content_type: artifact.content_type.clone(),
            url: match &artifact.details {
                ArtifactDetails::Reference { url } => Some(url.clone()),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListArtifactsResponse {
    pub artifacts: Vec<ArtifactView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub continuation_token: Option<String>,
    pub limit: Option<usize>,
}

/// Body of the 403 reply served for `error` artifacts.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorArtifactResponse {
    pub reason: String,
    pub message: String,
}

pub fn ms_to_datetime(ms: u64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms as i64).unwrap_or_default()
}

pub fn datetime_to_ms(dt: DateTime<Utc>) -> u64 {
    dt.timestamp_millis().max(0) as u64
}
