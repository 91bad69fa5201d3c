use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::ApiError;
use crate::types::{
    AnalysisRequest, ApiEnvelope, FlatConfig, LyricsTimingResponse, PipelineRequest,
    ScoreResponse, TaskCreated, TaskStatusResponse,
};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Starts remote generation work. Each call returns the new task id.
#[async_trait]
pub trait DispatchApi: Send + Sync {
    async fn start_generation(&self, request: &FlatConfig) -> Result<String, ApiError>;
    async fn start_pipeline(&self, request: &PipelineRequest) -> Result<String, ApiError>;
}

#[async_trait]
pub trait StatusApi: Send + Sync {
    /// `ApiError::TaskNotFound` when the service has no record of `task_id`.
    async fn task_status(&self, task_id: &str) -> Result<TaskStatusResponse, ApiError>;
}

/// Per-item analysis of a finished task's samples.
#[async_trait]
pub trait AnalysisApi: Send + Sync {
    async fn score(&self, request: &AnalysisRequest) -> Result<ScoreResponse, ApiError>;
    async fn lyrics_timing(
        &self,
        request: &AnalysisRequest,
    ) -> Result<LyricsTimingResponse, ApiError>;
}

#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: Url,
}

impl Client {
    pub fn new(base_url: Option<&str>) -> Result<Self, ApiError> {
        Self::with_timeout(base_url, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: Option<&str>, timeout: Duration) -> Result<Self, ApiError> {
        let raw = base_url.unwrap_or(DEFAULT_BASE_URL);
        let mut url = Url::parse(raw).map_err(|err| ApiError::Url(format!("{raw}: {err}")))?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        let http = reqwest::Client::builder().use_rustls_tls().timeout(timeout).build()?;
        Ok(Self { http, base_url: url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Push endpoint on the same host, with the scheme switched to ws/wss.
    pub fn ws_url(&self) -> Result<Url, ApiError> {
        let mut url = self.endpoint("api/ws")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ApiError::Url(format!("cannot derive websocket url from {url}")))?;
        Ok(url)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url.join(path).map_err(|err| ApiError::Url(format!("{path}: {err}")))
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        debug!("POST {url}");
        let response = self.http.post(url).json(body).send().await?;
        read_envelope(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.endpoint(path)?;
        let response = self.http.get(url).send().await?;
        read_envelope(response).await
    }
}

async fn read_envelope<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ApiError::Status { status: status.as_u16(), body });
    }
    let envelope: ApiEnvelope<T> = serde_json::from_str(&body)?;
    if !envelope.success {
        return Err(ApiError::Rejected(
            envelope.error.unwrap_or_else(|| "request rejected without a message".into()),
        ));
    }
    envelope
        .data
        .ok_or_else(|| ApiError::Rejected("response envelope carried no data".into()))
}

#[async_trait]
impl DispatchApi for Client {
    async fn start_generation(&self, request: &FlatConfig) -> Result<String, ApiError> {
        let body = request.to_request();
        let created: TaskCreated = self.post_json("api/generation/generate", &body).await?;
        Ok(created.task_id)
    }

    async fn start_pipeline(&self, request: &PipelineRequest) -> Result<String, ApiError> {
        let created: TaskCreated = self.post_json("api/generation/pipeline", request).await?;
        Ok(created.task_id)
    }
}

#[async_trait]
impl StatusApi for Client {
    async fn task_status(&self, task_id: &str) -> Result<TaskStatusResponse, ApiError> {
        match self.get_json(&format!("api/generation/task/{task_id}")).await {
            Err(ApiError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Err(ApiError::TaskNotFound(task_id.to_string()))
            }
            other => other,
        }
    }
}

#[async_trait]
impl AnalysisApi for Client {
    async fn score(&self, request: &AnalysisRequest) -> Result<ScoreResponse, ApiError> {
        self.post_json("api/audio/score", request).await
    }

    async fn lyrics_timing(
        &self,
        request: &AnalysisRequest,
    ) -> Result<LyricsTimingResponse, ApiError> {
        self.post_json("api/audio/lrc", request).await
    }
}
