use std::sync::atomic::{AtomicU64, Ordering};

use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::error::ApiError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    error::SessionError,
    single_flight::{FlightAbandoned, SingleFlight},
};

/// Authentication state as last observed by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Unknown,
    Authenticated,
    Unauthenticated,
}

/// A replayable description of one REST call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<serde_json::Value>,
    replayed: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            replayed: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn json<B: Serialize>(mut self, body: &B) -> Result<Self, SessionError> {
        let value = serde_json::to_value(body).map_err(|err| SessionError::Decode {
            path: self.path.clone(),
            message: err.to_string(),
        })?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// True for the single replay issued after a refresh.
    pub fn is_replay(&self) -> bool {
        self.replayed
    }

    fn into_replay(mut self) -> Self {
        self.replayed = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn error_for_status(self, path: &str) -> Result<Self, SessionError> {
        if self.status.is_success() {
            return Ok(self);
        }
        Err(SessionError::Status {
            path: path.to_string(),
            status: self.status,
            detail: ApiError::detail_from_body(&self.body),
        })
    }

    pub fn json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SessionError> {
        serde_json::from_slice(&self.body).map_err(|err| SessionError::Decode {
            path: path.to_string(),
            message: err.to_string(),
        })
    }
}

/// Issues authenticated REST calls and transparently recovers from access
/// token expiry.
///
/// Credentials are cookies held by the client's cookie store. A 401 on any
/// endpoint but the refresh endpoint triggers one shared refresh; every request
/// that hit 401 meanwhile waits for that refresh and is then replayed exactly
/// once.
pub struct SessionGateway {
    http: Client,
    base_url: String,
    refresh_path: String,
    realtime_token_path: String,
    refresh: SingleFlight<Result<(), SessionError>>,
    refresh_count: AtomicU64,
    status: watch::Sender<SessionStatus>,
}

impl SessionGateway {
    pub fn new(settings: &ClientSettings) -> Result<Self, SessionError> {
        let http = Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|err| SessionError::Transport {
                path: settings.api_base_url.clone(),
                message: err.to_string(),
            })?;
        Ok(Self::with_client(http, settings))
    }

    pub fn with_client(http: Client, settings: &ClientSettings) -> Self {
        let (status, _) = watch::channel(SessionStatus::Unknown);
        Self {
            http,
            base_url: settings.api_base_url.trim_end_matches('/').to_string(),
            refresh_path: settings.refresh_path.clone(),
            realtime_token_path: settings.realtime_token_path.clone(),
            refresh: SingleFlight::new(),
            refresh_count: AtomicU64::new(0),
            status,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn realtime_token_path(&self) -> &str {
        &self.realtime_token_path
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub(crate) fn set_status(&self, status: SessionStatus) {
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    pub fn is_refresh_in_flight(&self) -> bool {
        self.refresh.is_in_flight()
    }

    /// Number of refresh calls this gateway has issued.
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::SeqCst)
    }

    /// Sends `request`. Any status is returned as-is except a 401 from a
    /// non-refresh endpoint, which is recovered by refresh-and-replay.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, SessionError> {
        let response = self.execute(&request).await?;
        if !self.should_refresh(&request, response.status)? {
            return Ok(response);
        }

        debug!(path = %request.path, "session: access expired, awaiting refresh");
        self.refresh().await?;

        let replay = request.into_replay();
        let response = self.execute(&replay).await?;
        if self.should_refresh(&replay, response.status)? {
            // Replays never re-enter the refresh branch.
            return Err(SessionError::Unauthorized { path: replay.path });
        }
        Ok(response)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SessionError> {
        self.send(ApiRequest::get(path))
            .await?
            .error_for_status(path)?
            .json(path)
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, SessionError>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        self.send(ApiRequest::post(path).json(body)?)
            .await?
            .error_for_status(path)?
            .json(path)
    }

    /// Refreshes the session, joining the refresh already in flight if any.
    pub async fn refresh(&self) -> Result<(), SessionError> {
        match self.refresh.run(|| self.issue_refresh()).await {
            Ok(outcome) => outcome,
            Err(FlightAbandoned) => Err(SessionError::RefreshAbandoned),
        }
    }

    fn should_refresh(
        &self,
        request: &ApiRequest,
        status: StatusCode,
    ) -> Result<bool, SessionError> {
        if status != StatusCode::UNAUTHORIZED || self.is_refresh_path(&request.path) {
            return Ok(false);
        }
        if request.replayed {
            warn!(path = %request.path, "session: replayed request rejected again");
            return Err(SessionError::Unauthorized {
                path: request.path.clone(),
            });
        }
        Ok(true)
    }

    fn is_refresh_path(&self, path: &str) -> bool {
        path.trim_end_matches('/') == self.refresh_path.trim_end_matches('/')
    }

    async fn issue_refresh(&self) -> Result<(), SessionError> {
        self.refresh_count.fetch_add(1, Ordering::SeqCst);
        info!(path = %self.refresh_path, "session: refreshing access token");

        let request = ApiRequest::post(self.refresh_path.clone());
        let outcome = match self.execute(&request).await {
            Ok(response) if response.is_success() => Ok(()),
            Ok(response) => Err(SessionError::RefreshRejected {
                status: response.status,
            }),
            Err(err) => Err(err),
        };

        match &outcome {
            Ok(()) => {
                info!("session: refresh succeeded");
                self.set_status(SessionStatus::Authenticated);
            }
            Err(err) => {
                warn!("session: refresh failed: {err}");
                self.set_status(SessionStatus::Unauthenticated);
            }
        }
        outcome
    }

    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, SessionError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.http.request(request.method.clone(), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let transport_error = |err: reqwest::Error| SessionError::Transport {
            path: request.path.clone(),
            message: err.to_string(),
        };
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(transport_error)?.to_vec();
        debug!(
            method = %request.method,
            path = %request.path,
            status = status.as_u16(),
            replay = request.replayed,
            "session: response"
        );
        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
