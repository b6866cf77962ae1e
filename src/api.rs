//! HTTP transport adapters.
//!
//! Three call shapes share the authorization-retry policy: reads, writes with
//! a caller-supplied body, and uploads that stream their body while reporting
//! fractional progress. Non-success HTTP statuses are surfaced through
//! [`ApiResponse`], not as errors; only credential acquisition and
//! request-level transport failures reject.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::credentials::{CredentialBroker, CredentialError};
use crate::retry::retry_on_auth_failure;

/// Content type attached to reads and JSON writes.
pub const JSON_CONTENT_TYPE: &str = "application/json";
const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ApiDefaults;

impl ApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Receives upload progress as a percentage in `[0, 100]`.
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Terminal outcome of an HTTP call.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    /// Whether the status is in the success range.
    pub ok: bool,
    /// HTTP status code.
    pub status: StatusCode,
    /// Response body text.
    pub body: String,
}

impl ApiResponse {
    /// Whether this response means the presented credential was rejected.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self.status,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        )
    }
}

/// Errors produced by the HTTP adapters.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Token acquisition failed.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Request could not be built or executed.
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    /// Request body could not be serialized.
    #[error("serialize request body: {0}")]
    Serialize(serde_json::Error),
}

/// Authenticated HTTP adapter shared by all request shapes.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    attempt_timeout: Duration,
    credentials: CredentialBroker,
}

impl ApiClient {
    pub(crate) fn new(
        base_url: &str,
        credentials: CredentialBroker,
        connect_timeout: Duration,
        attempt_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(ClientError::Transport)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            attempt_timeout,
            credentials,
        })
    }

    /// Issues an authenticated GET request.
    pub async fn get(&self, path: &str) -> Result<ApiResponse, ClientError> {
        let endpoint = self.endpoint(path);

        retry_on_auth_failure(
            &self.credentials,
            move |token| {
                let endpoint = endpoint.clone();
                async move {
                    self.execute(Method::GET, &endpoint, None, JSON_CONTENT_TYPE, token)
                        .await
                }
            },
            ApiResponse::is_auth_failure,
        )
        .await
    }

    /// Issues an authenticated write with an explicit method and body.
    ///
    /// An empty `content_type` omits the header entirely so the transport can
    /// set its own (multipart bodies with generated boundaries).
    pub async fn post(
        &self,
        path: &str,
        method: Method,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<ApiResponse, ClientError> {
        let endpoint = self.endpoint(path);
        let content_type = content_type.to_string();

        retry_on_auth_failure(
            &self.credentials,
            move |token| {
                let endpoint = endpoint.clone();
                let method = method.clone();
                let body = body.clone();
                let content_type = content_type.clone();
                async move {
                    self.execute(method, &endpoint, Some(body.into()), &content_type, token)
                        .await
                }
            },
            ApiResponse::is_auth_failure,
        )
        .await
    }

    /// Issues an authenticated write with a JSON-serialized body.
    pub async fn post_json<T>(
        &self,
        path: &str,
        method: Method,
        request: &T,
    ) -> Result<ApiResponse, ClientError>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(request).map_err(ClientError::Serialize)?;
        self.post(path, method, body, JSON_CONTENT_TYPE).await
    }

    /// Uploads a body in chunks, reporting progress as a percentage.
    ///
    /// A retry after an authorization failure re-streams the whole body with
    /// a fresh progress subscription.
    pub async fn upload(
        &self,
        path: &str,
        method: Method,
        body: Vec<u8>,
        content_type: &str,
        on_progress: Option<ProgressCallback>,
    ) -> Result<ApiResponse, ClientError> {
        let endpoint = self.endpoint(path);
        let content_type = content_type.to_string();

        retry_on_auth_failure(
            &self.credentials,
            move |token| {
                let endpoint = endpoint.clone();
                let method = method.clone();
                let content_type = content_type.clone();
                let body = progress_body(body.clone(), on_progress.clone());
                async move {
                    self.execute(method, &endpoint, Some(body), &content_type, token)
                        .await
                }
            },
            ApiResponse::is_auth_failure,
        )
        .await
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<reqwest::Body>,
        content_type: &str,
        token: SecretString,
    ) -> Result<ApiResponse, ClientError> {
        let mut builder = self
            .http
            .request(method, endpoint)
            .timeout(self.attempt_timeout)
            .bearer_auth(token.expose_secret());

        if !content_type.is_empty() {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(ClientError::Transport)?;
        let status = response.status();
        let ok = status.is_success();
        let body = response.text().await.map_err(ClientError::Transport)?;
        debug!(event = "api_response", status = status.as_u16(), ok);

        Ok(ApiResponse { ok, status, body })
    }
}

/// Wraps a body in a stream that reports cumulative progress per chunk.
fn progress_body(body: Vec<u8>, on_progress: Option<ProgressCallback>) -> reqwest::Body {
    if body.is_empty() {
        // No total to divide by: report completion directly rather than NaN.
        if let Some(callback) = &on_progress {
            callback(100.0);
        }
        return reqwest::Body::from(body);
    }

    reqwest::Body::wrap_stream(futures_util::stream::iter(progress_chunks(
        body,
        on_progress,
    )))
}

fn progress_chunks(
    body: Vec<u8>,
    on_progress: Option<ProgressCallback>,
) -> impl Iterator<Item = Result<Bytes, Infallible>> {
    let total = body.len();
    let chunks: Vec<Bytes> = body
        .chunks(UPLOAD_CHUNK_BYTES)
        .map(Bytes::copy_from_slice)
        .collect();

    let mut sent = 0usize;
    chunks.into_iter().map(move |chunk| {
        sent += chunk.len();
        if let Some(callback) = &on_progress {
            callback(progress_percent(sent, total));
        }
        Ok(chunk)
    })
}

fn progress_percent(sent: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (sent as f64 / total as f64) * 100.0
}
