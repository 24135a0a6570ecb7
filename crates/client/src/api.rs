//! REST client for the SingWithMe HTTP endpoints.
//!
//! [`JobsApi`] is the request/response surface the poller and the job
//! monitor depend on; [`HttpJobsApi`] implements it (plus the upload
//! call) over [`reqwest`].

use std::path::Path;

use async_trait::async_trait;
use singwithme_core::{BundleError, JobId, StatusReport, TrackBundle};

/// Point-in-time job queries.
#[async_trait]
pub trait JobsApi: Send + Sync {
    /// `GET /status/{job_id}`.
    async fn fetch_status(&self, job_id: &JobId) -> Result<StatusReport, ApiError>;

    /// `GET /tracks/{job_id}`, decoded and validated.
    async fn fetch_tracks(&self, job_id: &JobId) -> Result<TrackBundle, ApiError>;
}

/// Errors from the REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server returned a non-2xx status code.
    #[error("API error ({status}): {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The tracks payload was not a usable bundle.
    #[error(transparent)]
    Bundle(#[from] BundleError),

    /// The upload response carried no job id.
    #[error("Upload response has no job id: {0}")]
    MissingJobId(String),

    #[error("Failed to read audio file: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    /// Whether the failure happened before a usable response arrived.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Status { .. })
    }
}

/// HTTP client for one backend.
pub struct HttpJobsApi {
    client: reqwest::Client,
    api_url: String,
}

impl HttpJobsApi {
    /// * `api_url` - Base HTTP URL including the `/api` prefix.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Reuse an existing [`reqwest::Client`] (shared connection pool).
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Upload an audio file for separation.
    ///
    /// Sends a multipart `POST /upload` with the file in the `file`
    /// field and returns the job id assigned by the server.
    pub async fn upload_audio(&self, path: &Path) -> Result<JobId, ApiError> {
        let data = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.mp3".to_string());

        let part = reqwest::multipart::Part::bytes(data)
            .file_name(file_name)
            .mime_str("audio/mpeg")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(self.endpoint("upload"))
            .multipart(form)
            .send()
            .await?;

        let body: serde_json::Value = Self::parse_response(response).await?;
        let job_id = job_id_from_upload(&body)?;
        tracing::info!(job_id = %job_id, path = %path.display(), "Audio uploaded");
        Ok(job_id)
    }

    // ---- private helpers ----

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_url, path)
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or an [`ApiError::Status`]
    /// containing the status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl JobsApi for HttpJobsApi {
    async fn fetch_status(&self, job_id: &JobId) -> Result<StatusReport, ApiError> {
        let response = self
            .client
            .get(self.endpoint(&format!("status/{job_id}")))
            .send()
            .await?;

        let body: serde_json::Value = Self::parse_response(response).await?;
        Ok(StatusReport::from_json(&body))
    }

    async fn fetch_tracks(&self, job_id: &JobId) -> Result<TrackBundle, ApiError> {
        let response = self
            .client
            .get(self.endpoint(&format!("tracks/{job_id}")))
            .send()
            .await?;

        let body: serde_json::Value = Self::parse_response(response).await?;
        Ok(TrackBundle::from_json(body)?)
    }
}

/// The upload endpoint names the id `jobId` or `job_id`.
fn job_id_from_upload(body: &serde_json::Value) -> Result<JobId, ApiError> {
    ["jobId", "job_id"]
        .iter()
        .find_map(|key| body.get(*key).and_then(|v| v.as_str()))
        .filter(|id| !id.is_empty())
        .map(JobId::from)
        .ok_or_else(|| ApiError::MissingJobId(body.to_string()))
}
