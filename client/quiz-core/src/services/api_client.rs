use reqwest::{Client, Method, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::utils::retry::{retry_async_if, RetryConfig};

/// JSON-over-HTTP access to the portal backend with bearer authentication.
#[derive(Clone, Debug)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
    retry: RetryConfig,
}

impl ApiClient {
    pub fn new(base_url: Url, token: Option<String>, timeout: Duration) -> GatewayResult<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url,
            token: token.filter(|t| !t.trim().is_empty()),
            retry: RetryConfig::default(),
        })
    }

    pub fn from_config(config: &Config) -> GatewayResult<Self> {
        Self::new(
            config.api_base_url.clone(),
            config.api_token.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into()).filter(|t| !t.trim().is_empty());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Appends percent-encoded path segments to the base URL.
    fn endpoint(&self, segments: &[&str]) -> GatewayResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                GatewayError::InvalidPayload(format!("base url {} cannot be a base", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn bearer(&self) -> GatewayResult<&str> {
        self.token.as_deref().ok_or(GatewayError::Unauthenticated)
    }

    /// Idempotent GET, retried on transient failures.
    pub async fn get_json(&self, segments: &[&str]) -> GatewayResult<Value> {
        let url = &self.endpoint(segments)?;
        let token = self.bearer()?;
        retry_async_if(&self.retry, GatewayError::is_transient, || async move {
            let response = self.http.get(url.clone()).bearer_auth(token).send().await?;
            read_json(response).await
        })
        .await
    }

    /// Single-attempt request with an optional JSON body.
    pub async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&B>,
    ) -> GatewayResult<Value> {
        let url = self.endpoint(segments)?;
        let token = self.bearer()?;
        tracing::debug!("{} {}", method, url);

        let mut request = self.http.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        read_json(request.send().await?).await
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> GatewayResult<Value> {
        self.send_json(Method::POST, segments, Some(body)).await
    }

    pub async fn put_json<B: Serialize + ?Sized>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> GatewayResult<Value> {
        self.send_json(Method::PUT, segments, Some(body)).await
    }

    pub async fn delete(&self, segments: &[&str]) -> GatewayResult<()> {
        self.send_json::<Value>(Method::DELETE, segments, None)
            .await
            .map(|_| ())
    }
}

/// Maps the status to an error and parses the body. Empty bodies read as null.
async fn read_json(response: Response) -> GatewayResult<Value> {
    let status = response.status();
    let path = response.url().path().to_string();

    if status == StatusCode::UNAUTHORIZED {
        return Err(GatewayError::Unauthenticated);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(GatewayError::NotFound(path));
    }

    let body = response.text().await?;
    if !status.is_success() {
        tracing::warn!("{} answered {}: {}", path, status, body);
        return Err(GatewayError::Status {
            status: status.as_u16(),
            body,
        });
    }

    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&body)?)
}
