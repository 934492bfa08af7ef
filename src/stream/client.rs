//! HTTP server-sent events transport and client entry point.
//!
//! `SseTransport` opens one `GET` per attempt and feeds decoded events into
//! the session. It never retries on its own; every failure is reported and
//! the session decides when to try again.

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::header::{HeaderValue, InvalidHeaderValue, ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Url};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::stream::proto::EventChannel;
use crate::stream::session::{SessionOptions, StreamSession};
use crate::stream::transport::{Transport, TransportError, TransportEvents, TransportHandle};

/// Local development endpoint of the provider service.
pub const LOCAL_STREAM_ENDPOINT: &str = "http://localhost:8080";
/// Header carrying the optional API key.
pub const API_KEY_HEADER: &str = "x-api-key";

const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// Default client constants used by [`StreamClientOptions::default`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamClientDefaults;

impl StreamClientDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
}

/// HTTP client settings for [`SseTransport`].
#[derive(Clone, Debug)]
pub struct StreamClientOptions {
    /// TCP/TLS connect timeout for each attempt.
    pub connect_timeout: Duration,
}

impl Default for StreamClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: StreamClientDefaults::CONNECT_TIMEOUT,
        }
    }
}

/// Errors produced while building a client or transport.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// HTTP client could not be constructed.
    #[error("http client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// API key could not be converted to a valid HTTP header value.
    #[error("invalid api-key header: {0}")]
    InvalidApiKeyHeader(#[from] InvalidHeaderValue),
}

/// Entry point for creating stream sessions against a provider endpoint.
#[derive(Clone)]
pub struct StreamClient {
    api_key: Option<SecretString>,
    endpoint_override: Option<String>,
    options: StreamClientOptions,
}

impl StreamClient {
    /// Creates a client for the local provider endpoint without credentials.
    pub fn new() -> Self {
        Self {
            api_key: None,
            endpoint_override: None,
            options: StreamClientOptions::default(),
        }
    }

    /// Sends `api_key` with every stream request.
    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    /// Sets an explicit endpoint base URL, e.g. `https://provider.example`.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint_override = Some(endpoint.trim_end().trim_end_matches('/').to_string());
        self
    }

    /// Replaces the HTTP client settings.
    pub fn with_options(mut self, options: StreamClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds the HTTP transport for this client.
    pub fn transport(&self) -> Result<SseTransport, StreamClientError> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(self.options.connect_timeout)
            .build()?;

        let api_key = match &self.api_key {
            Some(key) => {
                let mut value = HeaderValue::from_str(key.expose_secret())?;
                value.set_sensitive(true);
                Some(value)
            }
            None => None,
        };

        Ok(SseTransport {
            http,
            base_url: self.endpoint().to_string(),
            api_key,
        })
    }

    /// Builds a transport and spawns a session on it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn session(&self, options: SessionOptions) -> Result<StreamSession, StreamClientError> {
        Ok(StreamSession::new(self.transport()?, options))
    }

    fn endpoint(&self) -> &str {
        self.endpoint_override
            .as_deref()
            .unwrap_or(LOCAL_STREAM_ENDPOINT)
    }
}

impl Default for StreamClient {
    fn default() -> Self {
        Self::new()
    }
}

/// [`Transport`] over HTTP server-sent events.
#[derive(Clone, Debug)]
pub struct SseTransport {
    http: Client,
    base_url: String,
    api_key: Option<HeaderValue>,
}

impl SseTransport {
    /// Base URL that stream paths are appended to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn stream_url(&self, path: &str) -> Result<Url, TransportError> {
        let url = format!("{}{path}", self.base_url);
        Url::parse(&url).map_err(|err| TransportError::InvalidEndpoint(format!("{url}: {err}")))
    }

    fn request(&self, url: Url) -> RequestBuilder {
        let mut request = self
            .http
            .get(url)
            .header(ACCEPT, EVENT_STREAM_CONTENT_TYPE)
            .header(CACHE_CONTROL, "no-cache");
        if let Some(api_key) = &self.api_key {
            request = request.header(API_KEY_HEADER, api_key.clone());
        }
        request
    }
}

impl Transport for SseTransport {
    fn open(
        &self,
        path: &str,
        events: TransportEvents,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let request = self.request(self.stream_url(path)?);
        let task = tokio::spawn(async move {
            let generation = events.generation();
            if let Err(error) = pump_event_stream(request, &events).await {
                debug!(event = "sse_stream_failed", generation, error = %error);
                events.failed(error);
            }
        });
        Ok(Box::new(SseHandle { task: Some(task) }))
    }
}

/// Reader task for one SSE connection. Aborted on close or drop.
#[derive(Debug)]
pub struct SseHandle {
    task: Option<JoinHandle<()>>,
}

impl TransportHandle for SseHandle {
    fn close(&mut self) -> Result<(), TransportError> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for SseHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn pump_event_stream(
    request: RequestBuilder,
    events: &TransportEvents,
) -> Result<(), TransportError> {
    let response = request.send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::HttpStatus(status));
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if !content_type.starts_with(EVENT_STREAM_CONTENT_TYPE) {
        return Err(TransportError::ContentType(content_type));
    }

    if !events.opened() {
        return Ok(());
    }

    let mut stream = response.bytes_stream().eventsource();
    while let Some(next) = stream.next().await {
        let event = next.map_err(|err| TransportError::Protocol(err.to_string()))?;
        if !events.data(EventChannel::from_event_name(&event.event), event.data) {
            return Ok(());
        }
    }

    Err(TransportError::Closed)
}
