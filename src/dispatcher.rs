use std::fmt;

use async_trait::async_trait;
use log::{trace, warn};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::time::{sleep, Duration};
use url::Url;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Patch,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Patch => "PATCH",
        })
    }
}

/// One call to the service.
#[derive(Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: Url,
    pub body: Option<Value>,
    pub bearer: Option<String>,
}

impl fmt::Debug for ApiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiRequest")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("body", &self.body)
            .field("bearer", &self.bearer.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

/// Transport seam between the client and the network.
///
/// Implementations return the decoded JSON body. Bodies of the form
/// `{"error": ...}` must be returned as values, not errors, so the client
/// can tell application failures from transport failures.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, request: ApiRequest) -> Result<Value>;
}

const MAX_RETRY_COUNT: u8 = 3;

/// [`Dispatcher`] backed by `reqwest`.
///
/// Failed requests are retried only when repeating them cannot duplicate a
/// side effect: `GET` on server errors and timeouts, any method on
/// `429 Too Many Requests` or when the connection could not be established.
#[derive(Clone)]
pub struct HttpDispatcher {
    http_client: Client,
    log_target: String,
}

impl Default for HttpDispatcher {
    fn default() -> Self {
        Self {
            http_client: Client::new(),
            log_target: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

impl HttpDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom HTTP client (for connection pool reuse or proxies).
    pub fn with_http_client(http_client: Client) -> Self {
        Self {
            http_client,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_log_target(mut self, log_target: String) -> Self {
        self.log_target = log_target;
        self
    }

    fn build(&self, request: &ApiRequest) -> reqwest::RequestBuilder {
        let url = request.url.clone();
        let mut builder = match request.method {
            Method::Get => self.http_client.get(url),
            Method::Post => self.http_client.post(url),
            Method::Patch => self.http_client.patch(url),
        };
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
    }
}

fn is_retryable(method: Method, status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || (method == Method::Get && status.is_server_error())
}

fn is_retryable_transport(method: Method, error: &reqwest::Error) -> bool {
    error.is_connect() || (method == Method::Get && error.is_timeout())
}

fn decode(text: &str) -> Result<Value> {
    if text.trim().is_empty() {
        Ok(Value::Null)
    } else {
        Ok(serde_json::from_str(text)?)
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, request: ApiRequest) -> Result<Value> {
        // Number of failed attempts so far, we give up after MAX_RETRY_COUNT
        let mut retries = 0;

        loop {
            trace!(target: self.log_target.as_str(), "{} {}", request.method, request.url);

            let failure = match self.build(&request).send().await {
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await?;

                    if status.is_success() {
                        return decode(&text);
                    }

                    // Application errors travel back as JSON for the caller to coerce
                    if let Ok(body @ Value::Object(_)) = serde_json::from_str::<Value>(&text) {
                        if body.get("error").is_some() {
                            return Ok(body);
                        }
                    }

                    let error = Error::Status {
                        status: status.as_u16(),
                        body: text,
                    };
                    if !is_retryable(request.method, status) {
                        return Err(error);
                    }
                    error
                }
                Err(e) if is_retryable_transport(request.method, &e) => Error::Http(e),
                Err(e) => return Err(Error::Http(e)),
            };

            if retries == MAX_RETRY_COUNT {
                return Err(failure);
            }
            retries += 1;

            let sleep_duration = 500 * u64::from(retries);
            warn!(
                target: self.log_target.as_str(),
                "{} {} failed ({}), retry {} in {}ms",
                request.method, request.url, failure, retries, sleep_duration
            );
            sleep(Duration::from_millis(sleep_duration)).await;
        }
    }
}
