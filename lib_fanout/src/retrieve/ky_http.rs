//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client wrapper around `reqwest`, with middleware for
//! exponential-backoff retries of transient failures and standardized JSON
//! response handling. The registry client is built on it.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by [`ApiClient`].
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid header: {0}")]
    Header(String),

    #[error("failed to build http client: {0}")]
    Build(#[from] reqwest::Error),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest_middleware::Error),

    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to decode response body: {0}")]
    Decode(String),
}

/// A standardized container for API responses.
///
/// Wraps the deserialized data along with the HTTP status of the exchange.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The deserialized response body of a successful request.
    pub data: Option<T>,
    /// The raw body returned by the server when the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
}

/// A flexible asynchronous HTTP client.
///
/// Built on top of `reqwest_middleware`, it handles the base URL, default
/// headers and automatic retries.
#[derive(Clone)]
pub struct ApiClient {
    /// The underlying middleware-enabled client.
    inner: ClientWithMiddleware,
    /// The base URL to which all relative paths are joined. Always ends in `/`.
    base_url: Url,
}

impl ApiClient {
    /// Creates a new `ApiClient` with a retry policy.
    ///
    /// # Arguments
    /// * `base_url` - The absolute base URL of the API (e.g., "http://127.0.0.1:8500").
    /// * `headers` - Headers added to every request (auth tokens and the like).
    /// * `timeout` - Per-attempt request timeout.
    /// * `max_retries` - Retries of transient failures, with exponential backoff.
    pub fn new(base_url: &str, headers: &[(&str, &str)], timeout: Duration, max_retries: u32) -> Result<Self, HttpError> {
        // Url::join drops the last path segment unless the base ends in '/'.
        let mut url = Url::parse(base_url)?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }

        let mut default_headers = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| HttpError::Header(e.to_string()))?;
            let value = HeaderValue::from_str(value).map_err(|e| HttpError::Header(e.to_string()))?;
            default_headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(timeout)
            .build()?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        let inner = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self { inner, base_url: url })
    }

    /// Performs a request and decodes a JSON body on success.
    ///
    /// # Arguments
    /// * `method` - The HTTP verb (GET, PUT, etc.).
    /// * `path` - Path relative to the base URL, query string included.
    /// * `body` - Optional serializable object sent as the JSON body.
    pub async fn request<T, B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<ApiResponse<T>, HttpError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let response = self.execute(method, path, body).await?;
        let status = response.status();

        if status.is_success() {
            let data = response
                .json::<T>()
                .await
                .map_err(|e| HttpError::Decode(e.to_string()))?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
            })
        } else {
            Ok(failed(status.as_u16(), response).await)
        }
    }

    /// Performs a request whose success body is ignored.
    pub async fn send<B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<ApiResponse<()>, HttpError>
    where
        B: Serialize + ?Sized,
    {
        let response = self.execute(method, path, body).await?;
        let status = response.status();
        if status.is_success() {
            Ok(ApiResponse {
                data: Some(()),
                error_body: None,
                status: status.as_u16(),
                success: true,
            })
        } else {
            Ok(failed(status.as_u16(), response).await)
        }
    }

    async fn execute<B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<reqwest::Response, HttpError>
    where
        B: Serialize + ?Sized,
    {
        let full_url = self.base_url.join(path.trim_start_matches('/'))?;
        let mut req = self.inner.request(method, full_url);
        if let Some(body) = body {
            let json_body = serde_json::to_vec(body)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }
        Ok(req.send().await?)
    }
}

async fn failed<T>(status: u16, response: reqwest::Response) -> ApiResponse<T> {
    ApiResponse {
        data: None,
        error_body: response.text().await.ok(),
        status,
        success: false,
    }
}
