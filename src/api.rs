//! REST companion endpoints of the notification stream.
//!
//! Used by the cache bridge to read the authoritative unread count and to
//! mark notifications as read.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, InvalidHeaderValue, ACCEPT, COOKIE};
use reqwest::{Client, Method, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PortalConfig;
use crate::retry::{retry_async, RetryPolicy};
use crate::stream::proto::{validate_notification, NotificationEvent};

const ERROR_BODY_SNIPPET_LEN: usize = 220;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NotificationsApiDefaults;

impl NotificationsApiDefaults {
    pub const MAX_ATTEMPTS: usize = 3;
    pub const BACKOFF: Duration = Duration::from_millis(200);
    pub const PAGE_SIZE: u32 = 20;
}

/// Query parameters for [`NotificationsApiClient::list_notifications`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListNotificationsQuery {
    pub page: u32,
    pub limit: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub unread_only: bool,
}

impl Default for ListNotificationsQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: NotificationsApiDefaults::PAGE_SIZE,
            unread_only: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPage {
    pub items: Vec<NotificationEvent>,
    pub total: u64,
}

#[derive(Debug, Deserialize)]
struct UnreadCountResponse {
    count: u64,
}

/// Client for the `/notifications` REST endpoints.
#[derive(Clone)]
pub struct NotificationsApiClient {
    http: Client,
    base_url: String,
    headers: HeaderMap,
    request_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl NotificationsApiClient {
    pub fn new(config: &PortalConfig) -> Result<Self, ApiError> {
        Self::with_retry_policy(
            config,
            RetryPolicy::new(
                NotificationsApiDefaults::MAX_ATTEMPTS,
                NotificationsApiDefaults::BACKOFF,
            ),
        )
    }

    pub fn with_retry_policy(
        config: &PortalConfig,
        retry_policy: RetryPolicy,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(ApiError::Transport)?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(cookie) = config.session_cookie.as_ref() {
            let mut value = HeaderValue::from_str(cookie.expose_secret())?;
            value.set_sensitive(true);
            headers.insert(COOKIE, value);
        }

        Ok(Self {
            http,
            base_url: config.api_base_url.clone(),
            headers,
            request_timeout: config.request_timeout,
            retry_policy,
        })
    }

    pub async fn list_notifications(
        &self,
        query: &ListNotificationsQuery,
    ) -> Result<NotificationPage, ApiError> {
        let page: NotificationPage = self
            .request_json(Method::GET, "/notifications", Some(query))
            .await?;
        for item in &page.items {
            validate_notification(item).map_err(|err| ApiError::Decode(err.to_string()))?;
        }
        Ok(page)
    }

    pub async fn unread_count(&self) -> Result<u64, ApiError> {
        let response: UnreadCountResponse = self
            .request_json::<_, ()>(Method::GET, "/notifications/unread-count", None)
            .await?;
        Ok(response.count)
    }

    pub async fn mark_read(&self, notification_id: &str) -> Result<(), ApiError> {
        let path = format!("/notifications/{notification_id}/read");
        self.request_empty(Method::PATCH, &path).await
    }

    pub async fn mark_all_read(&self) -> Result<(), ApiError> {
        self.request_empty(Method::PATCH, "/notifications/read-all")
            .await
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request_json<T, Q>(
        &self,
        method: Method,
        path: &str,
        query: Option<&Q>,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let body = self.send_with_retry(method, path, query).await?;
        serde_json::from_str(&body).map_err(|err| ApiError::Decode(err.to_string()))
    }

    async fn request_empty(&self, method: Method, path: &str) -> Result<(), ApiError> {
        self.send_with_retry::<()>(method, path, None).await?;
        Ok(())
    }

    async fn send_with_retry<Q>(
        &self,
        method: Method,
        path: &str,
        query: Option<&Q>,
    ) -> Result<String, ApiError>
    where
        Q: Serialize + ?Sized,
    {
        let endpoint = format!("{}{}", self.base_url, path);
        retry_async(
            &self.retry_policy,
            |_| {
                let method = method.clone();
                let endpoint = endpoint.as_str();
                async move { self.send_attempt(method, endpoint, query).await }
            },
            ApiError::is_retryable,
        )
        .await
    }

    async fn send_attempt<Q>(
        &self,
        method: Method,
        endpoint: &str,
        query: Option<&Q>,
    ) -> Result<String, ApiError>
    where
        Q: Serialize + ?Sized,
    {
        let mut builder = self
            .http
            .request(method, endpoint)
            .headers(self.headers.clone())
            .timeout(self.request_timeout);
        if let Some(query) = query {
            builder = builder.query(query);
        }

        let response = builder.send().await.map_err(ApiError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(ApiError::Transport)?;

        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        Ok(body)
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("invalid session cookie header: {0}")]
    InvalidCookieHeader(#[from] InvalidHeaderValue),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Decode(_) | Self::InvalidCookieHeader(_) => false,
        }
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
