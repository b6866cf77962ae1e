//! Top-level client facade.
//!
//! A [`Client`] owns one [`CredentialBroker`] shared by every transport it
//! hands out, so a refresh forced by any call is observed by all of them.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::api::{ApiClient, ApiDefaults, ApiResponse, ClientError, ProgressCallback};
use crate::credentials::{CredentialBroker, TokenFn};
use crate::realtime::session::RealtimeSession;
use crate::realtime::transport::{RealtimeTransport, TransportEvent};

/// Configuration for [`Client::new`].
#[derive(Clone)]
pub struct ClientOptions {
    /// Base URL for API calls, eg. `https://api.hublink.example`.
    pub base_url: String,
    /// Application-supplied token acquisition hook.
    pub token_acquire: TokenFn,
    /// TCP connect timeout for the HTTP client.
    pub connect_timeout: Duration,
    /// Timeout applied to each individual request attempt.
    pub attempt_timeout: Duration,
}

impl ClientOptions {
    /// Creates options with default timeouts.
    pub fn new(base_url: impl Into<String>, token_acquire: TokenFn) -> Self {
        Self {
            base_url: base_url.into(),
            token_acquire,
            connect_timeout: ApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: ApiDefaults::ATTEMPT_TIMEOUT,
        }
    }
}

/// Authenticated access to the HubLink API and realtime services.
#[derive(Clone)]
pub struct Client {
    api: ApiClient,
    credentials: CredentialBroker,
}

impl Client {
    /// Builds a client from options.
    pub fn new(options: ClientOptions) -> Result<Self, ClientError> {
        let credentials = CredentialBroker::new(options.token_acquire);
        let api = ApiClient::new(
            &options.base_url,
            credentials.clone(),
            options.connect_timeout,
            options.attempt_timeout,
        )?;
        Ok(Self { api, credentials })
    }

    /// Shared credential broker.
    ///
    /// Realtime transport implementations authenticate through this handle,
    /// forwarding the per-attempt force flag from
    /// [`RealtimeTransport::start`].
    pub fn credentials(&self) -> CredentialBroker {
        self.credentials.clone()
    }

    /// Issues an authenticated GET request.
    pub async fn get(&self, path: &str) -> Result<ApiResponse, ClientError> {
        self.api.get(path).await
    }

    /// Issues an authenticated write with an explicit method and body.
    pub async fn post(
        &self,
        path: &str,
        method: Method,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<ApiResponse, ClientError> {
        self.api.post(path, method, body, content_type).await
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
        self.api.post_json(path, method, request).await
    }

    /// Uploads a body with progress reporting.
    pub async fn upload(
        &self,
        path: &str,
        method: Method,
        body: Vec<u8>,
        content_type: &str,
        on_progress: Option<ProgressCallback>,
    ) -> Result<ApiResponse, ClientError> {
        self.api
            .upload(path, method, body, content_type, on_progress)
            .await
    }

    /// Creates a realtime session over a supplied transport.
    ///
    /// `events` is the channel the transport reports its lifecycle and
    /// message events on.
    pub fn realtime(
        &self,
        transport: Arc<dyn RealtimeTransport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> RealtimeSession {
        RealtimeSession::new(transport, events)
    }
}
